//! Typed view of a tar entry header and a writer for producing tar streams.
//!
//! [`EntryHeader`] decouples the pack, unpack and filter code from the raw
//! 512-byte `tar` header: it carries the resolved (long) path and link name,
//! PAX `SCHILY.xattr.*` extended attributes, and `chrono` timestamps, and it
//! round-trips through JSON for inspection.
//!
//! [`TarSink`] is the only place that serializes headers: it emits the PAX
//! xattr record, GNU long names/links, device numbers and GNU atime/ctime.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tar_rs as tar;

use crate::error::{Result, TarError};

/// PAX record prefix used by GNU tar and Go for extended attributes.
pub const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

const PAX_MTIME: &str = "mtime";
const PAX_ATIME: &str = "atime";
const PAX_CTIME: &str = "ctime";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Regular,
    HardLink,
    Symlink,
    Char,
    Block,
    Directory,
    Fifo,
    /// Any other typeflag, kept verbatim.
    Other(u8),
}

impl EntryKind {
    /// Whether entries of this kind carry a data payload after the header.
    pub fn carries_data(self) -> bool {
        matches!(self, EntryKind::Regular | EntryKind::Other(_))
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::Char | EntryKind::Block)
    }

    pub fn typeflag(self) -> u8 {
        tar::EntryType::from(self).as_byte()
    }
}

impl From<tar::EntryType> for EntryKind {
    fn from(ty: tar::EntryType) -> Self {
        match ty {
            tar::EntryType::Regular => EntryKind::Regular,
            tar::EntryType::Link => EntryKind::HardLink,
            tar::EntryType::Symlink => EntryKind::Symlink,
            tar::EntryType::Char => EntryKind::Char,
            tar::EntryType::Block => EntryKind::Block,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Fifo => EntryKind::Fifo,
            other => EntryKind::Other(other.as_byte()),
        }
    }
}

impl From<EntryKind> for tar::EntryType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::HardLink => tar::EntryType::Link,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::Char => tar::EntryType::Char,
            EntryKind::Block => tar::EntryType::Block,
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Fifo => tar::EntryType::Fifo,
            EntryKind::Other(byte) => tar::EntryType::new(byte),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryHeader {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_name: Option<String>,
    pub kind: EntryKind,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub gid: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dev_major: u32,
    #[serde(default)]
    pub dev_minor: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl EntryHeader {
    /// A bare header of the given kind, owned by root, stamped at the epoch.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            link_name: None,
            kind,
            mode: if kind == EntryKind::Directory { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            size: 0,
            mtime: DateTime::default(),
            atime: None,
            ctime: None,
            dev_major: 0,
            dev_minor: 0,
            xattrs: BTreeMap::new(),
        }
    }

    /// Decodes the header of an entry from a `tar::Archive`, including
    /// PAX-provided long names and extended attributes.
    pub fn from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> io::Result<Self> {
        let mut xattrs = BTreeMap::new();
        let mut pax_times = PaxTimes::default();
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                let key = extension
                    .key()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if let Some(attr) = key.strip_prefix(PAX_XATTR_PREFIX) {
                    xattrs.insert(attr.to_string(), extension.value_bytes().to_vec());
                    continue;
                }
                let slot = match key {
                    PAX_MTIME => &mut pax_times.mtime,
                    PAX_ATIME => &mut pax_times.atime,
                    PAX_CTIME => &mut pax_times.ctime,
                    _ => continue,
                };
                *slot = extension.value().ok().and_then(parse_pax_time);
            }
        }

        let header = entry.header();
        let kind = EntryKind::from(header.entry_type());

        let (dev_major, dev_minor) = if kind.is_device() {
            (
                header.device_major()?.unwrap_or(0),
                header.device_minor()?.unwrap_or(0),
            )
        } else {
            (0, 0)
        };

        let (atime, ctime) = match header.as_gnu() {
            Some(gnu) => (
                gnu.atime().ok().filter(|&t| t > 0).map(from_epoch_seconds),
                gnu.ctime().ok().filter(|&t| t > 0).map(from_epoch_seconds),
            ),
            None => (None, None),
        };

        Ok(Self {
            name: String::from_utf8_lossy(&entry.path_bytes()).into_owned(),
            link_name: entry
                .link_name_bytes()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            kind,
            mode: header.mode()?,
            uid: header.uid()?,
            gid: header.gid()?,
            size: entry.size(),
            mtime: match pax_times.mtime {
                Some(mtime) => mtime,
                None => from_epoch_seconds(header.mtime()?),
            },
            atime: pax_times.atime.or(atime),
            ctime: pax_times.ctime.or(ctime),
            dev_major,
            dev_minor,
            xattrs,
        })
    }

    /// Builds the raw GNU header. Name and link name are filled in by
    /// [`TarSink`] so long paths get their extension records.
    fn to_tar_header(&self) -> io::Result<tar::Header> {
        let mut raw = tar::Header::new_gnu();
        raw.set_entry_type(self.kind.into());
        raw.set_mode(self.mode);
        raw.set_uid(self.uid);
        raw.set_gid(self.gid);
        raw.set_mtime(to_epoch_seconds(&self.mtime));
        raw.set_size(if self.kind.carries_data() { self.size } else { 0 });

        if self.kind.is_device() {
            raw.set_device_major(self.dev_major)?;
            raw.set_device_minor(self.dev_minor)?;
        }

        if let Some(gnu) = raw.as_gnu_mut() {
            if let Some(atime) = &self.atime {
                gnu.set_atime(to_epoch_seconds(atime));
            }
            if let Some(ctime) = &self.ctime {
                gnu.set_ctime(to_epoch_seconds(ctime));
            }
        }

        Ok(raw)
    }
}

/// Times carried by PAX records, which override the header fields.
#[derive(Default)]
struct PaxTimes {
    mtime: Option<DateTime<Utc>>,
    atime: Option<DateTime<Utc>>,
    ctime: Option<DateTime<Utc>>,
}

/// Parses a PAX time value: decimal seconds since the epoch with an
/// optional fraction, e.g. `1600000000.25` or `-1.5`.
fn parse_pax_time(value: &str) -> Option<DateTime<Utc>> {
    let (int, frac) = value.split_once('.').unwrap_or((value, ""));
    if frac.is_empty() && value.contains('.') {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let mut secs: i64 = int.parse().ok()?;
    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
    let mut nanos: u32 = digits.parse().ok()?;
    if int.starts_with('-') && nanos > 0 {
        secs -= 1;
        nanos = 1_000_000_000 - nanos;
    }
    DateTime::from_timestamp(secs, nanos)
}

fn format_pax_time(time: &DateTime<Utc>) -> String {
    let nanos = time.timestamp_subsec_nanos();
    if nanos == 0 {
        return time.timestamp().to_string();
    }
    let (secs, nanos) = if time.timestamp() < 0 {
        (time.timestamp() + 1, 1_000_000_000 - nanos)
    } else {
        (time.timestamp(), nanos)
    };
    let sign = if time.timestamp() < 0 && secs == 0 { "-" } else { "" };
    let frac = format!("{nanos:09}");
    format!("{sign}{secs}.{}", frac.trim_end_matches('0'))
}

pub(crate) fn from_epoch_seconds(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}

fn to_epoch_seconds(time: &DateTime<Utc>) -> u64 {
    u64::try_from(time.timestamp()).unwrap_or(0)
}

/// Destination for headers that a [`crate::filter::TarFilter`] injects on
/// its own (flushed directories, extra markers).
pub trait HeaderWriter {
    /// Writes `header` with no payload; its size is forced to zero.
    fn write_header(&mut self, header: &EntryHeader) -> Result<()>;
}

/// Serializes [`EntryHeader`]s and their payloads into a tar stream.
pub struct TarSink<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> TarSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(writer),
        }
    }

    /// Appends an entry. For kinds that carry data, exactly `header.size`
    /// bytes are taken from `data`.
    pub fn append<R: Read>(&mut self, header: &EntryHeader, data: R) -> Result<()> {
        let mut raw = header.to_tar_header().map_err(TarError::Write)?;

        let records = pax_records(header);
        if !records.is_empty() {
            self.builder
                .append_pax_extensions(
                    records
                        .iter()
                        .map(|(key, value)| (key.as_str(), value.as_slice())),
                )
                .map_err(TarError::Write)?;
        }

        let result = match (header.kind, &header.link_name) {
            (EntryKind::Symlink | EntryKind::HardLink, Some(link)) => {
                self.builder.append_link(&mut raw, &header.name, link)
            }
            (kind, _) if kind.carries_data() => {
                let exact = Exact {
                    inner: data,
                    remaining: header.size,
                };
                self.builder.append_data(&mut raw, &header.name, exact)
            }
            _ => self.builder.append_data(&mut raw, &header.name, io::empty()),
        };
        result.map_err(TarError::Write)
    }

    /// Writes the end-of-archive marker and hands back the inner writer.
    pub fn finish(self) -> Result<W> {
        self.builder.into_inner().map_err(TarError::Write)
    }
}

/// PAX records for what the GNU header cannot hold: extended attributes,
/// and the timestamps whenever one of them has sub-second precision or
/// predates the epoch.
fn pax_records(header: &EntryHeader) -> Vec<(String, Vec<u8>)> {
    let mut records: Vec<(String, Vec<u8>)> = Vec::new();

    let times = [
        (PAX_MTIME, Some(&header.mtime)),
        (PAX_ATIME, header.atime.as_ref()),
        (PAX_CTIME, header.ctime.as_ref()),
    ];
    let precise = times
        .iter()
        .filter_map(|(_, time)| *time)
        .any(|time| time.timestamp_subsec_nanos() != 0 || time.timestamp() < 0);
    if precise {
        for (key, time) in times {
            if let Some(time) = time {
                records.push((key.to_string(), format_pax_time(time).into_bytes()));
            }
        }
    }

    for (attr, value) in &header.xattrs {
        records.push((format!("{PAX_XATTR_PREFIX}{attr}"), value.clone()));
    }
    records
}

impl<W: Write> HeaderWriter for TarSink<W> {
    fn write_header(&mut self, header: &EntryHeader) -> Result<()> {
        if header.size == 0 || !header.kind.carries_data() {
            return self.append(header, io::empty());
        }
        let mut empty = header.clone();
        empty.size = 0;
        self.append(&empty, io::empty())
    }
}

/// Yields exactly `remaining` bytes of `inner`, failing if it runs dry
/// first so a short payload cannot produce a corrupt archive.
struct Exact<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> Read for Exact<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("entry payload ended {} bytes early", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reads every header of a tar stream, skipping payloads.
pub fn read_headers<R: Read>(reader: R) -> Result<Vec<EntryHeader>> {
    let mut archive = tar::Archive::new(reader);
    let mut headers = Vec::new();
    for entry in archive.entries().map_err(TarError::Read)? {
        let mut entry = entry.map_err(TarError::Read)?;
        headers.push(EntryHeader::from_entry(&mut entry).map_err(TarError::Read)?);
    }
    Ok(headers)
}
