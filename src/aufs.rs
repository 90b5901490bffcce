//! overlayfs → AUFS whiteout conversion.

use crate::error::Result;
use crate::filter::{Action, TarFilter};
use crate::header::{EntryHeader, EntryKind, HeaderWriter};
use crate::whiteout::{
    self, OVERLAY_OPAQUE_XATTR, OVERLAY_OPAQUE_XATTR_VALUE, WHITEOUT_OPAQUE_DIR, WHITEOUT_PREFIX,
};

/// Rewrites overlayfs whiteouts into AUFS markers: a 0:0 char device
/// `dir/name` becomes an empty file `dir/.wh.name`, and a directory carrying
/// `trusted.overlay.opaque=y` is written without the xattr and followed by an
/// empty `dir/.wh..wh..opq`.
#[derive(Debug, Default)]
pub struct AufsWhiteouts;

impl AufsWhiteouts {
    pub fn new() -> Self {
        Self
    }
}

impl TarFilter for AufsWhiteouts {
    fn handle_entry(
        &mut self,
        header: &mut EntryHeader,
        out: &mut dyn HeaderWriter,
    ) -> Result<Action> {
        match header.kind {
            EntryKind::Char if header.dev_major == 0 && header.dev_minor == 0 => {
                let name = whiteout::clean_name(&header.name);
                let (dir, base) = whiteout::split_name(&name);
                header.name = whiteout::join_name(dir, &format!("{WHITEOUT_PREFIX}{base}"));
                header.kind = EntryKind::Regular;
                header.size = 0;
                Ok(Action::HeaderOnly)
            }
            EntryKind::Directory => {
                let opaque = header
                    .xattrs
                    .get(OVERLAY_OPAQUE_XATTR)
                    .is_some_and(|value| value.as_slice() == OVERLAY_OPAQUE_XATTR_VALUE);
                if opaque {
                    header.xattrs.remove(OVERLAY_OPAQUE_XATTR);
                    out.write_header(header)?;

                    let dir = whiteout::clean_name(&header.name);
                    header.name = whiteout::join_name(&dir, WHITEOUT_OPAQUE_DIR);
                    header.kind = EntryKind::Regular;
                    header.size = 0;
                    header.xattrs.clear();
                }
                Ok(Action::HeaderOnly)
            }
            _ => Ok(Action::Copy),
        }
    }
}
