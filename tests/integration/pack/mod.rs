//! Directory packing tests, checked by unpacking the result again.

use crate::integration::common::{generate_files, unprivileged, walk_relative};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tarutil::{open_and_unpack, pack, read_headers, unpack, CancelToken, EntryKind};
use tempfile::TempDir;

/// A temp dir addressed through its canonical path, so absolute symlinks
/// created below it resolve inside the packed tree.
fn canonical_tempdir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let path = fs::canonicalize(dir.path()).unwrap();
    (dir, path)
}

fn pack_to_vec(source: &Path) -> Vec<u8> {
    pack(source, Vec::new(), &CancelToken::new()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let (_src_guard, src) = canonical_tempdir();
        let (_dest_guard, dest) = canonical_tempdir();

        let names = generate_files(&src, 10).unwrap();
        unpack(&pack_to_vec(&src)[..], &dest, &unprivileged()).unwrap();

        let mut expected: Vec<PathBuf> = names.iter().map(PathBuf::from).collect();
        expected.sort();
        assert_eq!(walk_relative(&dest), expected);

        for name in names.iter().filter(|n| !n.contains('.')) {
            let original = fs::read(src.join(name)).unwrap();
            assert_eq!(fs::read(dest.join(name)).unwrap(), original, "{name} differs");

            let link = fs::read_link(dest.join(format!("{name}.symlink"))).unwrap();
            assert_eq!(link, PathBuf::from(name), "symlink not made relative");

            let file_ino = fs::metadata(dest.join(name)).unwrap().ino();
            let link_ino = fs::metadata(dest.join(format!("{name}.lnk"))).unwrap().ino();
            assert_eq!(file_ino, link_ino, "{name}.lnk is not a hard link");
        }
    }

    #[test]
    fn test_pack_emits_hard_link_entries() {
        let (_guard, src) = canonical_tempdir();
        generate_files(&src, 3).unwrap();

        let headers = read_headers(&pack_to_vec(&src)[..]).unwrap();
        let links: Vec<_> = headers
            .iter()
            .filter(|h| h.kind == EntryKind::HardLink)
            .map(|h| (h.name.as_str(), h.link_name.as_deref()))
            .collect();
        assert_eq!(
            links,
            vec![
                ("file00.lnk", Some("file00")),
                ("file01.lnk", Some("file01")),
                ("file02.lnk", Some("file02")),
            ]
        );
        assert!(headers
            .iter()
            .filter(|h| h.kind == EntryKind::HardLink)
            .all(|h| h.size == 0));
    }

    #[test]
    fn test_pack_gzip_then_open_and_unpack() {
        let (_src_guard, src) = canonical_tempdir();
        let (_dest_guard, dest) = canonical_tempdir();
        let (_out_guard, out) = canonical_tempdir();

        fs::create_dir_all(src.join("etc/conf.d")).unwrap();
        fs::write(src.join("etc/conf.d/app.conf"), "level = debug\n").unwrap();

        let layer = out.join("layer.tar.gz");
        let encoder = GzEncoder::new(File::create(&layer).unwrap(), Compression::default());
        pack(&src, encoder, &CancelToken::new())
            .unwrap()
            .finish()
            .unwrap();

        open_and_unpack(&layer, &dest, &unprivileged()).unwrap();
        assert_eq!(
            fs::read_to_string(dest.join("etc/conf.d/app.conf")).unwrap(),
            "level = debug\n"
        );
    }

    #[test]
    fn test_pack_preserves_mode_and_mtime() {
        let (_src_guard, src) = canonical_tempdir();
        let (_dest_guard, dest) = canonical_tempdir();

        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_500_000_000);
        let script = src.join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        File::options()
            .write(true)
            .open(&script)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        fs::create_dir(src.join("private")).unwrap();
        fs::set_permissions(src.join("private"), fs::Permissions::from_mode(0o700)).unwrap();

        unpack(&pack_to_vec(&src)[..], &dest, &unprivileged()).unwrap();

        let unpacked = fs::metadata(dest.join("run.sh")).unwrap();
        assert_eq!(unpacked.mode() & 0o7777, 0o750);
        assert_eq!(unpacked.modified().unwrap(), mtime);

        let private = fs::metadata(dest.join("private")).unwrap();
        assert!(private.is_dir());
        assert_eq!(private.mode() & 0o7777, 0o700);
    }

    #[test]
    fn test_pack_empty_directory() {
        let (_guard, src) = canonical_tempdir();
        let headers = read_headers(&pack_to_vec(&src)[..]).unwrap();
        assert!(headers.is_empty());
    }
}
