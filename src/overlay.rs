//! AUFS → overlayfs whiteout conversion.

use log::{debug, warn};

use crate::error::Result;
use crate::filter::{Action, TarFilter};
use crate::header::{EntryHeader, EntryKind, HeaderWriter};
use crate::whiteout::{self, Marker, OVERLAY_OPAQUE_XATTR, OVERLAY_OPAQUE_XATTR_VALUE};

/// Rewrites AUFS whiteouts into their overlayfs form:
/// `dir/.wh.name` becomes a 0:0 char device `dir/name`, and
/// `dir/.wh..wh..opq` becomes the `trusted.overlay.opaque=y` xattr on `dir`.
///
/// Directory headers are held back until the next non-directory entry so an
/// opaque marker following them can still amend their xattrs. They are
/// released in arrival order, which keeps parents ahead of children.
#[derive(Debug, Default)]
pub struct OverlayWhiteouts {
    pending: Vec<(String, EntryHeader)>,
}

impl OverlayWhiteouts {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self, out: &mut dyn HeaderWriter) -> Result<()> {
        for (_, dir) in self.pending.drain(..) {
            out.write_header(&dir)?;
        }
        Ok(())
    }
}

impl TarFilter for OverlayWhiteouts {
    fn handle_entry(
        &mut self,
        header: &mut EntryHeader,
        out: &mut dyn HeaderWriter,
    ) -> Result<Action> {
        let name = whiteout::clean_name(&header.name);

        if whiteout::is_metadata(&name) {
            debug!("Dropping AUFS metadata entry {}", header.name);
            return Ok(Action::Skip);
        }

        if header.kind == EntryKind::Directory {
            self.pending.push((name, header.clone()));
            return Ok(Action::Skip);
        }

        let (dir, base) = whiteout::split_name(&name);
        match whiteout::classify(base) {
            Marker::Opaque => {
                match self.pending.iter_mut().find(|(pending, _)| pending == dir) {
                    Some((_, parent)) => {
                        parent.xattrs.insert(
                            OVERLAY_OPAQUE_XATTR.to_string(),
                            OVERLAY_OPAQUE_XATTR_VALUE.to_vec(),
                        );
                    }
                    None => warn!(
                        "Dropping opaque marker {}: its directory was already written",
                        header.name
                    ),
                }
                self.flush(out)?;
                Ok(Action::Skip)
            }
            Marker::Meta => Ok(Action::Skip),
            Marker::Whiteout(original) => {
                self.flush(out)?;
                header.name = whiteout::join_name(dir, original);
                header.kind = EntryKind::Char;
                header.link_name = None;
                header.size = 0;
                header.dev_major = 0;
                header.dev_minor = 0;
                Ok(Action::HeaderOnly)
            }
            Marker::None => {
                self.flush(out)?;
                Ok(Action::Copy)
            }
        }
    }

    fn finish(&mut self, out: &mut dyn HeaderWriter) -> Result<()> {
        self.flush(out)
    }
}
