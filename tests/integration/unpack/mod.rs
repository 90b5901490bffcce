//! Layer application tests: destination handling, link validation and
//! whiteouts across successive layers.

use crate::integration::common::{
    build_tar, dir, file, generate_tar, hard_link, unprivileged,
};
use flate2::write::GzEncoder;
use flate2::{Compression, CrcReader};
use std::fs;
use std::io::Write;
use tarutil::{open_and_unpack, open_and_unpack_multi, unpack, TarError};
use tempfile::{NamedTempFile, TempDir};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untar_bad_link() {
        let dest = TempDir::new().unwrap();

        let dangling: Vec<_> = (0..20)
            .map(|i| hard_link(&format!("{}.lnk", i), &i.to_string()))
            .collect();
        let err = unpack(&build_tar(dangling)[..], dest.path(), &unprivileged()).unwrap_err();
        assert!(
            matches!(err, TarError::InvalidLink { .. }),
            "processed invalid hard links: {err}"
        );

        let absolute: Vec<_> = (0..20)
            .map(|i| hard_link(&format!("{}.lnk", i), "/etc/passwd"))
            .collect();
        let err = unpack(&build_tar(absolute)[..], dest.path(), &unprivileged()).unwrap_err();
        assert!(
            matches!(err, TarError::InvalidLink { .. }),
            "processed invalid hard links: {err}"
        );
    }

    #[test]
    fn test_untar_escaping_hard_link() {
        let dest = TempDir::new().unwrap();
        let layer = build_tar(vec![hard_link("evil", "../../etc/passwd")]);

        let err = unpack(&layer[..], dest.path(), &unprivileged()).unwrap_err();
        assert!(matches!(err, TarError::InvalidLink { .. }));
    }

    fn symlink_to(name: &str, target: &std::path::Path) -> (tarutil::EntryHeader, Vec<u8>) {
        let mut header = tarutil::EntryHeader::new(name, tarutil::EntryKind::Symlink);
        header.link_name = Some(target.to_string_lossy().into_owned());
        (header, Vec::new())
    }

    #[test]
    fn test_untar_through_symlinked_dir() {
        let base = TempDir::new().unwrap();
        let dest = base.path().join("dest");
        let outside = base.path().join("outside");
        fs::create_dir(&outside).unwrap();

        let layer = build_tar(vec![symlink_to("esc", &outside), file("esc/sub/pwned", b"x")]);
        let err = unpack(&layer[..], &dest, &unprivileged()).unwrap_err();

        assert!(matches!(err, TarError::EscapesDestination(_)), "{err}");
        assert!(!outside.join("sub/pwned").exists());
    }

    #[test]
    fn test_whiteout_through_symlinked_dir() {
        let base = TempDir::new().unwrap();
        let dest = base.path().join("dest");
        let outside = base.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("victim"), b"keep").unwrap();

        unpack(&build_tar(vec![symlink_to("link", &outside)])[..], &dest, &unprivileged())
            .unwrap();

        let whiteout = build_tar(vec![file("link/.wh.victim", b"")]);
        let err = unpack(&whiteout[..], &dest, &unprivileged()).unwrap_err();
        assert!(matches!(err, TarError::EscapesDestination(_)), "{err}");

        let opaque = build_tar(vec![file("link/.wh..wh..opq", b"")]);
        let err = unpack(&opaque[..], &dest, &unprivileged()).unwrap_err();
        assert!(matches!(err, TarError::EscapesDestination(_)), "{err}");

        assert!(outside.join("victim").exists());
    }

    #[test]
    fn test_hard_link_through_symlinked_dir() {
        let base = TempDir::new().unwrap();
        let dest = base.path().join("dest");
        let outside = base.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret"), b"secret").unwrap();

        let layer = build_tar(vec![
            symlink_to("link", &outside),
            hard_link("stolen", "link/secret"),
        ]);
        let err = unpack(&layer[..], &dest, &unprivileged()).unwrap_err();

        assert!(matches!(err, TarError::InvalidLink { .. }), "{err}");
        assert!(!dest.join("stolen").exists());
    }

    #[test]
    fn test_malformed_whiteout_names() {
        let base = TempDir::new().unwrap();
        let dest = base.path().join("dest");
        fs::write(base.path().join("sibling"), b"keep").unwrap();

        unpack(&build_tar(vec![dir("etc"), file("etc/passwd", b"root")])[..], &dest, &unprivileged())
            .unwrap();

        let layer = build_tar(vec![file(".wh...", b""), file("etc/.wh.", b"")]);
        unpack(&layer[..], &dest, &unprivileged()).unwrap();

        assert!(base.path().join("sibling").exists());
        assert!(dest.join("etc/passwd").exists());
    }

    #[test]
    fn test_untar_non_existing_dir() {
        let parent = TempDir::new().unwrap();
        let dest = parent.path().join("does/not/exist");

        unpack(&generate_tar(25)[..], &dest, &unprivileged()).unwrap();
        assert!(dest.join("foo24").exists());
        assert!(dest.join("foo24.lnk").exists());
    }

    #[test]
    fn test_untar_existing_dir() {
        let dest = TempDir::new().unwrap();

        unpack(&generate_tar(25)[..], dest.path(), &unprivileged()).unwrap();
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 50);
    }

    #[test]
    fn test_untar_over_file() {
        let file = NamedTempFile::new().unwrap();

        let err = unpack(&generate_tar(25)[..], file.path(), &unprivileged()).unwrap_err();
        assert!(matches!(err, TarError::NotADirectory(_)));
    }

    #[test]
    fn test_untar_tee_reader() {
        let dest = TempDir::new().unwrap();
        let layer = generate_tar(25);
        let mut tee = CrcReader::new(&layer[..]);

        unpack(&mut tee, dest.path(), &unprivileged()).unwrap();

        assert!(tee.crc().amount() > 0, "no bytes passed through the reader");
        assert_ne!(tee.crc().sum(), 0);
    }

    #[test]
    fn test_whiteouts_across_layers() {
        let dest = TempDir::new().unwrap();

        let base = build_tar(vec![
            dir("a"),
            file("a/x", b"x"),
            file("a/y", b"y"),
            dir("a/sub"),
            file("a/sub/z", b"z"),
            file("keep", b"keep"),
            file("drop", b"drop"),
        ]);
        unpack(&base[..], dest.path(), &unprivileged()).unwrap();

        let deletions = build_tar(vec![file("a/.wh.x", b""), file(".wh.drop", b""), file(".wh.missing", b"")]);
        unpack(&deletions[..], dest.path(), &unprivileged()).unwrap();

        assert!(!dest.path().join("a/x").exists());
        assert!(!dest.path().join("drop").exists());
        assert!(dest.path().join("a/y").exists());
        assert!(dest.path().join("keep").exists());

        let opaque = build_tar(vec![
            dir("a"),
            file("a/new", b"new"),
            file("a/.wh..wh..opq", b""),
        ]);
        unpack(&opaque[..], dest.path(), &unprivileged()).unwrap();

        let mut remaining: Vec<_> = fs::read_dir(dest.path().join("a"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["new"]);
        assert!(dest.path().join("keep").exists());
        assert!(!dest.path().join("a/.wh..wh..opq").exists());
    }

    #[test]
    fn test_whiteout_removes_directory_tree() {
        let dest = TempDir::new().unwrap();
        let base = build_tar(vec![dir("d"), dir("d/e"), file("d/e/f", b"f")]);
        unpack(&base[..], dest.path(), &unprivileged()).unwrap();

        unpack(&build_tar(vec![file(".wh.d", b"")])[..], dest.path(), &unprivileged()).unwrap();
        assert!(!dest.path().join("d").exists());
    }

    #[test]
    fn test_open_and_unpack_multi_gzip_and_plain() {
        let dest = TempDir::new().unwrap();
        let layers = TempDir::new().unwrap();

        let gz_path = layers.path().join("layer1.tar.gz");
        let mut encoder = GzEncoder::new(fs::File::create(&gz_path).unwrap(), Compression::default());
        encoder
            .write_all(&build_tar(vec![file("etc/hostname", b"first"), file("etc/motd", b"hi")]))
            .unwrap();
        encoder.finish().unwrap();

        let plain_path = layers.path().join("layer2.tar");
        fs::write(
            &plain_path,
            build_tar(vec![file("etc/hostname", b"second"), file("etc/.wh.motd", b"")]),
        )
        .unwrap();

        open_and_unpack_multi(&[&gz_path, &plain_path], dest.path(), &unprivileged()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("etc/hostname")).unwrap(), "second");
        assert!(!dest.path().join("etc/motd").exists());
    }

    #[test]
    fn test_open_missing_layer() {
        let dest = TempDir::new().unwrap();
        let err = open_and_unpack(
            &dest.path().join("missing.tar"),
            dest.path(),
            &unprivileged(),
        )
        .unwrap_err();
        assert!(matches!(err, TarError::FailedOpen { .. }));
    }

    #[test]
    fn test_symlink_replaced_by_later_layer() {
        let dest = TempDir::new().unwrap();

        let mut link = tarutil::EntryHeader::new("bin", tarutil::EntryKind::Symlink);
        link.link_name = Some("usr/bin".to_string());
        unpack(&build_tar(vec![(link, Vec::new())])[..], dest.path(), &unprivileged()).unwrap();
        assert!(fs::symlink_metadata(dest.path().join("bin"))
            .unwrap()
            .file_type()
            .is_symlink());

        unpack(&build_tar(vec![file("bin", b"now a file")])[..], dest.path(), &unprivileged())
            .unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("bin")).unwrap(), "now a file");
    }
}
