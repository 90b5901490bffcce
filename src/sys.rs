//! Thin wrappers over the Linux calls std does not expose: `utimensat`
//! without following symlinks, and `mknod`.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::AT_FDCWD;
use nix::sys::stat::{self, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;

use crate::header::EntryKind;

/// Sets access and modification times on `path` itself, never on a symlink's
/// target. Kernels without `utimensat` are tolerated.
pub fn lutimes(path: &Path, atime: &DateTime<Utc>, mtime: &DateTime<Utc>) -> io::Result<()> {
    match stat::utimensat(
        AT_FDCWD,
        path,
        &to_timespec(atime),
        &to_timespec(mtime),
        UtimensatFlags::NoFollowSymlink,
    ) {
        Ok(()) => Ok(()),
        Err(Errno::ENOSYS) => {
            log::debug!("utimensat not implemented, leaving times on {}", path.display());
            Ok(())
        }
        Err(errno) => Err(io::Error::from(errno)),
    }
}

fn to_timespec(time: &DateTime<Utc>) -> TimeSpec {
    TimeSpec::new(
        time.timestamp() as libc::time_t,
        time.timestamp_subsec_nanos() as _,
    )
}

/// Creates a device node or FIFO for the given entry kind.
pub fn mknod(path: &Path, kind: EntryKind, mode: u32, major: u32, minor: u32) -> io::Result<()> {
    let flag = match kind {
        EntryKind::Block => SFlag::S_IFBLK,
        EntryKind::Char => SFlag::S_IFCHR,
        EntryKind::Fifo => SFlag::S_IFIFO,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{other:?} is not a device kind"),
            ))
        }
    };
    let perm = Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
    let dev = stat::makedev(u64::from(major), u64::from(minor));
    stat::mknod(path, flag, perm, dev).map_err(io::Error::from)
}

/// Splits a raw `st_rdev` into (major, minor).
pub fn device_numbers(rdev: u64) -> (u32, u32) {
    (stat::major(rdev) as u32, stat::minor(rdev) as u32)
}
