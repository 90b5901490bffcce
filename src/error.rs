//! Error type shared by the pack, unpack and filter operations.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TarError {
    /// An I/O operation on a specific path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The incoming tar stream could not be decoded.
    #[error("encountered error while reading archive: {0}")]
    Read(#[source] io::Error),

    /// The outgoing tar stream could not be written.
    #[error("encountered error while writing archive: {0}")]
    Write(#[source] io::Error),

    #[error("path exists, but it's not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("failed to create directory {path}: {source}")]
    DirectoryCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to open file {path}: {source}")]
    FailedOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write file {path}: {source}")]
    FailedWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A symlink target escapes the destination or cannot be expressed.
    #[error("invalid symlink {path} -> {link}")]
    InvalidSymlink { path: PathBuf, link: String },

    /// A hard link target is absolute, escapes the destination or is missing.
    #[error("invalid hard link {path} -> {link}")]
    InvalidLink { path: PathBuf, link: String },

    /// An entry would be written through a symlink inside the destination.
    #[error("refusing to write {0} through a symlink")]
    EscapesDestination(PathBuf),

    #[error("encountered unknown header type {typeflag:#04x} for {path}")]
    UnknownHeader { path: PathBuf, typeflag: u8 },

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, TarError>;

impl TarError {
    /// Returns a closure wrapping an [`io::Error`] with the path it occurred at.
    pub(crate) fn io_at(path: &Path) -> impl FnOnce(io::Error) -> TarError + '_ {
        move |source| TarError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
