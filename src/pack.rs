//! Packs a directory tree into a tar stream.
//!
//! Entries are emitted in lexical walk order with names relative to the
//! source root. Symlink targets are rewritten to be relative, files sharing
//! an inode after the first become hard-link entries, and
//! `security.capability` is carried as a PAX xattr.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use chrono::{DateTime, Utc};
use log::debug;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::error::{Result, TarError};
use crate::header::{EntryHeader, EntryKind, TarSink};
use crate::paths;
use crate::sys;

const CAPABILITY_XATTR: &str = "security.capability";

/// Packs `source` into `writer`, returning the writer once the archive is
/// terminated.
pub fn pack<W: Write>(source: &Path, writer: W, cancel: &CancelToken) -> Result<W> {
    let source = fs::canonicalize(source).map_err(TarError::io_at(source))?;
    let mut sink = TarSink::new(writer);
    let mut inodes: HashMap<(u64, u64), String> = HashMap::new();

    debug!("Packing {}", source.display());

    for entry in WalkDir::new(&source).min_depth(1).sort_by_file_name() {
        cancel.check()?;

        let entry = entry?;
        let path = entry.path();
        let name = match path.strip_prefix(&source) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => continue,
        };
        let metadata = entry.metadata()?;

        let Some(header) = entry_header(path, name, &metadata, &mut inodes)? else {
            debug!("Skipping socket: {}", path.display());
            continue;
        };

        if header.kind == EntryKind::Regular {
            let file = File::open(path).map_err(|source| TarError::FailedOpen {
                path: path.to_path_buf(),
                source,
            })?;
            sink.append(&header, file)?;
        } else {
            sink.append(&header, io::empty())?;
        }
    }

    sink.finish()
}

/// Builds the header for one walked path. Returns `None` for sockets, which
/// cannot be archived.
fn entry_header(
    path: &Path,
    name: String,
    metadata: &Metadata,
    inodes: &mut HashMap<(u64, u64), String>,
) -> Result<Option<EntryHeader>> {
    let file_type = metadata.file_type();
    if file_type.is_socket() {
        return Ok(None);
    }

    let mut header = EntryHeader::new(name, EntryKind::Regular);
    header.mode = metadata.mode() & 0o7777;
    header.uid = u64::from(metadata.uid());
    header.gid = u64::from(metadata.gid());
    header.mtime = timestamp(metadata.mtime(), metadata.mtime_nsec());
    header.atime = Some(timestamp(metadata.atime(), metadata.atime_nsec()));
    header.ctime = Some(timestamp(metadata.ctime(), metadata.ctime_nsec()));

    if file_type.is_symlink() {
        header.kind = EntryKind::Symlink;
        header.link_name = Some(relative_link(path)?);
    } else if file_type.is_dir() {
        header.kind = EntryKind::Directory;
    } else if file_type.is_char_device() || file_type.is_block_device() {
        header.kind = if file_type.is_char_device() {
            EntryKind::Char
        } else {
            EntryKind::Block
        };
        (header.dev_major, header.dev_minor) = sys::device_numbers(metadata.rdev());
    } else if file_type.is_fifo() {
        header.kind = EntryKind::Fifo;
    } else if metadata.nlink() > 1 {
        match inodes.entry((metadata.dev(), metadata.ino())) {
            Entry::Occupied(first) => {
                header.kind = EntryKind::HardLink;
                header.link_name = Some(first.get().clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(header.name.clone());
                header.size = metadata.len();
            }
        }
    } else {
        header.size = metadata.len();
    }

    match xattr::get(path, CAPABILITY_XATTR) {
        Ok(Some(capability)) => {
            header.xattrs.insert(CAPABILITY_XATTR.to_string(), capability);
        }
        Ok(None) => {}
        Err(e) => debug!("Could not read {CAPABILITY_XATTR} on {}: {e}", path.display()),
    }

    Ok(Some(header))
}

/// Reads a symlink and coerces its target to a path relative to the link's
/// directory.
fn relative_link(path: &Path) -> Result<String> {
    let target = fs::read_link(path).map_err(|e| TarError::InvalidSymlink {
        path: path.to_path_buf(),
        link: e.to_string(),
    })?;

    let rel = if target.is_absolute() {
        let dir = path.parent().unwrap_or_else(|| Path::new("/"));
        paths::relative_to(dir, &target)
    } else {
        paths::clean(&target)
    };

    Ok(rel.to_string_lossy().into_owned())
}

fn timestamp(secs: i64, nsecs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, u32::try_from(nsecs).unwrap_or(0)).unwrap_or_default()
}
