//! Applies container layer tarballs to a directory.
//!
//! [`unpack`] replays a single layer stream on top of whatever `dest` already
//! holds, interpreting AUFS whiteouts:
//! - `.wh.<name>` removes `<name>` from the same directory,
//! - `.wh..wh..opq` removes everything in its directory that this layer did
//!   not itself provide,
//! - other `.wh..wh.*` metadata entries are ignored.
//!
//! Entry names are sanitized so nothing lands outside `dest`. Symlinks must
//! resolve inside `dest` and hard links must point at an already present,
//! relative, in-tree file. Directory modes and times are applied once the
//! whole stream is consumed.
//!
//! [`open_and_unpack`] and [`open_and_unpack_multi`] do the same from files,
//! transparently handling gzip-compressed layers.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use log::{debug, trace, warn};
use tar_rs as tar;

use crate::cancel::CancelToken;
use crate::error::{Result, TarError};
use crate::header::{EntryHeader, EntryKind};
use crate::paths;
use crate::sys;
use crate::whiteout::{self, Marker};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Controls how layers are applied.
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Skip `lchown`, for unprivileged unpacking.
    pub no_lchown: bool,
    /// Checked before each entry.
    pub cancel: CancelToken,
}

struct DeferredDir {
    path: PathBuf,
    header: EntryHeader,
}

/// Unpacks the tar stream `reader` into `dest`, creating `dest` if needed.
pub fn unpack<R: Read>(reader: R, dest: &Path, options: &UnpackOptions) -> Result<()> {
    prepare_dest(dest)?;

    let mut archive = tar::Archive::new(reader);
    let mut unpacked: HashSet<PathBuf> = HashSet::new();
    let mut dirs: Vec<DeferredDir> = Vec::new();

    for entry in archive.entries().map_err(TarError::Read)? {
        options.cancel.check()?;

        let mut entry = entry.map_err(TarError::Read)?;
        let header = EntryHeader::from_entry(&mut entry).map_err(TarError::Read)?;

        let rel = paths::sanitize_entry_path(Path::new(&header.name));
        if rel.as_os_str().is_empty() {
            trace!("Skipping root entry {:?}", header.name);
            continue;
        }
        let full = dest.join(&rel);

        if whiteout::is_metadata(&rel.to_string_lossy()) {
            debug!("Skipping whiteout metadata entry: {}", header.name);
            continue;
        }

        check_no_symlink_parents(dest, &rel)?;

        let base = rel
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        match whiteout::classify(&base) {
            Marker::None | Marker::Meta => {}
            Marker::Opaque => {
                if let Some(dir) = full.parent() {
                    debug!("Found opaque directory marker, clearing: {}", dir.display());
                    clear_opaque_dir(dir, &unpacked)?;
                }
                continue;
            }
            Marker::Whiteout(original) => {
                if !is_plain_name(original) {
                    warn!("Ignoring malformed whiteout {}", header.name);
                    continue;
                }
                if let Some(dir) = full.parent() {
                    let deleted = dir.join(original);
                    debug!("Found whiteout marker, deleting: {}", deleted.display());
                    remove_path(&deleted)?;
                }
                continue;
            }
        }

        if let Some(parent) = full.parent() {
            ensure_parent(parent)?;
        }

        create_entry(&full, &rel, dest, &header, &mut entry)?;

        if header.kind == EntryKind::Directory {
            dirs.push(DeferredDir {
                path: full.clone(),
                header,
            });
        } else {
            apply_metadata(&full, &header, options)?;
        }
        unpacked.insert(full);
    }

    for dir in &dirs {
        let still_dir = fs::symlink_metadata(&dir.path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !still_dir {
            trace!("Directory replaced later in the layer: {}", dir.path.display());
            continue;
        }
        apply_metadata(&dir.path, &dir.header, options)?;
    }

    Ok(())
}

/// Opens a layer file (plain or gzipped tar) and unpacks it into `dest`.
pub fn open_and_unpack(layer: &Path, dest: &Path, options: &UnpackOptions) -> Result<()> {
    let file = File::open(layer).map_err(|source| TarError::FailedOpen {
        path: layer.to_path_buf(),
        source,
    })?;

    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .map_err(TarError::io_at(layer))?
        .starts_with(&GZIP_MAGIC);

    debug!(
        "Unpacking layer {} (gzip: {}) into {}",
        layer.display(),
        is_gzip,
        dest.display()
    );

    if is_gzip {
        unpack(GzDecoder::new(reader), dest, options)
    } else {
        unpack(reader, dest, options)
    }
}

/// Applies several layers in order, stopping at the first failure.
pub fn open_and_unpack_multi<P: AsRef<Path>>(
    layers: &[P],
    dest: &Path,
    options: &UnpackOptions,
) -> Result<()> {
    for layer in layers {
        open_and_unpack(layer.as_ref(), dest, options)?;
    }
    Ok(())
}

fn prepare_dest(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TarError::NotADirectory(dest.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dest)
            .map_err(|source| TarError::DirectoryCreateFailed {
                path: dest.to_path_buf(),
                source,
            }),
        Err(e) => Err(TarError::io_at(dest)(e)),
    }
}

/// Creates missing parents of an entry. Layers are not required to list
/// every directory before its children.
fn ensure_parent(parent: &Path) -> Result<()> {
    match fs::symlink_metadata(parent) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TarError::NotADirectory(parent.to_path_buf())),
        Err(_) => fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(|source| TarError::DirectoryCreateFailed {
                path: parent.to_path_buf(),
                source,
            }),
    }
}

fn create_entry<R: Read>(
    full: &Path,
    rel: &Path,
    dest: &Path,
    header: &EntryHeader,
    data: &mut R,
) -> Result<()> {
    match header.kind {
        EntryKind::Directory => create_directory(full),
        EntryKind::Regular => {
            replace_existing(full)?;
            create_file(full, header, data)
        }
        EntryKind::Char | EntryKind::Block | EntryKind::Fifo => {
            replace_existing(full)?;
            sys::mknod(
                full,
                header.kind,
                header.mode,
                header.dev_major,
                header.dev_minor,
            )
            .map_err(TarError::io_at(full))
        }
        EntryKind::Symlink => {
            let link = header.link_name.as_deref().unwrap_or_default();
            let dir = rel.parent().unwrap_or_else(|| Path::new(""));
            if link.is_empty() || paths::resolve_within(dir, Path::new(link)).is_none() {
                return Err(TarError::InvalidSymlink {
                    path: full.to_path_buf(),
                    link: link.to_string(),
                });
            }
            replace_existing(full)?;
            std::os::unix::fs::symlink(link, full).map_err(TarError::io_at(full))
        }
        EntryKind::HardLink => {
            let link = header.link_name.as_deref().unwrap_or_default();
            let target = hard_link_target(dest, link).ok_or_else(|| TarError::InvalidLink {
                path: full.to_path_buf(),
                link: link.to_string(),
            })?;
            replace_existing(full)?;
            fs::hard_link(&target, full).map_err(TarError::io_at(full))
        }
        EntryKind::Other(typeflag) => Err(TarError::UnknownHeader {
            path: full.to_path_buf(),
            typeflag,
        }),
    }
}

fn create_directory(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TarError::NotADirectory(path.to_path_buf())),
        Err(_) => fs::DirBuilder::new()
            .mode(0o700)
            .create(path)
            .map_err(|source| TarError::DirectoryCreateFailed {
                path: path.to_path_buf(),
                source,
            }),
    }
}

fn create_file<R: Read>(path: &Path, header: &EntryHeader, data: &mut R) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(header.mode & 0o7777)
        .open(path)
        .map_err(|source| TarError::FailedOpen {
            path: path.to_path_buf(),
            source,
        })?;

    io::copy(data, &mut file).map_err(|source| TarError::FailedWrite {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Resolves a hard-link target inside `dest`. The target must be relative,
/// stay in the tree and already exist as something other than a directory.
fn hard_link_target(dest: &Path, link: &str) -> Option<PathBuf> {
    let link = Path::new(link);
    if link.as_os_str().is_empty() || link.is_absolute() {
        return None;
    }
    let rel = paths::resolve_within(Path::new(""), link)?;
    check_no_symlink_parents(dest, &rel).ok()?;
    let target = dest.join(rel);
    match fs::symlink_metadata(&target) {
        Ok(meta) if !meta.is_dir() => Some(target),
        _ => None,
    }
}

/// Fails if an existing directory between `dest` and the entry at `rel` is a
/// symlink. Anything written through one could land outside `dest`.
fn check_no_symlink_parents(dest: &Path, rel: &Path) -> Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };

    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(TarError::EscapesDestination(dest.join(rel)));
            }
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TarError::io_at(&current)(e)),
        }
    }
    Ok(())
}

/// A whiteout must name a sibling, not the directory itself or its parent.
fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Clears whatever sits at `path` unless it is a directory, which a regular
/// entry replaces wholesale.
fn replace_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(TarError::io_at(path))
        }
        Ok(_) => fs::remove_file(path).map_err(TarError::io_at(path)),
        Err(_) => Ok(()),
    }
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(TarError::io_at(path)),
        Ok(_) => fs::remove_file(path).map_err(TarError::io_at(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TarError::io_at(path)(e)),
    }
}

/// Removes everything below `dir` that this layer did not unpack, descending
/// into directories the layer kept.
fn clear_opaque_dir(dir: &Path, unpacked: &HashSet<PathBuf>) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(TarError::io_at(dir)(e)),
    };

    for entry in entries {
        let path = entry.map_err(TarError::io_at(dir))?.path();
        if !unpacked.contains(&path) {
            remove_path(&path)?;
            continue;
        }
        let is_dir = fs::symlink_metadata(&path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if is_dir {
            clear_opaque_dir(&path, unpacked)?;
        }
    }
    Ok(())
}

fn apply_metadata(path: &Path, header: &EntryHeader, options: &UnpackOptions) -> Result<()> {
    if !options.no_lchown {
        let uid = u32::try_from(header.uid).ok();
        let gid = u32::try_from(header.gid).ok();
        std::os::unix::fs::lchown(path, uid, gid).map_err(TarError::io_at(path))?;
    }

    let is_symlink = fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_symlink())
        .map_err(TarError::io_at(path))?;
    if !is_symlink {
        fs::set_permissions(path, fs::Permissions::from_mode(header.mode & 0o7777))
            .map_err(TarError::io_at(path))?;
    }

    let mtime = clamp_to_epoch(header.mtime);
    let atime = header
        .atime
        .map(clamp_to_epoch)
        .filter(|atime| *atime >= mtime)
        .unwrap_or(mtime);
    sys::lutimes(path, &atime, &mtime).map_err(TarError::io_at(path))
}

/// Times before the Unix epoch are not portable to set; pin them there.
fn clamp_to_epoch(time: DateTime<Utc>) -> DateTime<Utc> {
    if time.timestamp() < 0 {
        DateTime::default()
    } else {
        time
    }
}
