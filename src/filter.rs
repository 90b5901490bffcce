//! Streaming tar rewriting.
//!
//! [`filter_tar`] reads a tar stream entry by entry, lets a [`TarFilter`]
//! decide what happens to each header, and writes the result to another tar
//! stream. Filters can also inject header-only entries of their own through
//! the [`HeaderWriter`] they are handed, which is how buffered directories
//! get flushed.

use std::io::{Read, Write};

use tar_rs as tar;

use crate::error::{Result, TarError};
use crate::header::{EntryHeader, HeaderWriter, TarSink};

/// What to do with an entry after the filter has seen (and possibly
/// rewritten) its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Drop the entry.
    Skip,
    /// Write the header with no payload.
    HeaderOnly,
    /// Write the header followed by the original payload.
    Copy,
}

pub trait TarFilter {
    fn handle_entry(&mut self, header: &mut EntryHeader, out: &mut dyn HeaderWriter)
        -> Result<Action>;

    /// Called once after the last entry.
    fn finish(&mut self, _out: &mut dyn HeaderWriter) -> Result<()> {
        Ok(())
    }
}

/// Runs every entry of `reader` through `filter` into `writer`, then
/// terminates the archive and returns the writer.
pub fn filter_tar<R, W, F>(reader: R, writer: W, filter: &mut F) -> Result<W>
where
    R: Read,
    W: Write,
    F: TarFilter + ?Sized,
{
    let mut archive = tar::Archive::new(reader);
    let mut sink = TarSink::new(writer);

    for entry in archive.entries().map_err(TarError::Read)? {
        let mut entry = entry.map_err(TarError::Read)?;
        let mut header = EntryHeader::from_entry(&mut entry).map_err(TarError::Read)?;

        match filter.handle_entry(&mut header, &mut sink)? {
            Action::Skip => log::trace!("Filtered out {}", header.name),
            Action::HeaderOnly => sink.write_header(&header)?,
            Action::Copy => sink.append(&header, &mut entry)?,
        }
    }

    filter.finish(&mut sink)?;
    sink.finish()
}
