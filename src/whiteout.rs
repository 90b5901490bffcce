//! AUFS and overlayfs whiteout markers plus the path helpers used to
//! recognize and rewrite them inside tar entry names.

/// Prefix of an AUFS whiteout: `.wh.foo` deletes `foo` from lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of AUFS metadata entries, which are never real paths.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// AUFS hard-link directory.
pub const WHITEOUT_LINK_DIR: &str = ".wh..wh.plnk";

/// AUFS opaque directory marker.
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";

pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
pub const OVERLAY_OPAQUE_XATTR_VALUE: &[u8] = b"y";

/// What an entry's base name says about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Not a whiteout at all.
    None,
    /// Opaque directory marker.
    Opaque,
    /// AUFS metadata such as the link dir; carries no filesystem meaning.
    Meta,
    /// Deletes the named sibling.
    Whiteout(&'a str),
}

pub fn classify(base: &str) -> Marker<'_> {
    if base == WHITEOUT_OPAQUE_DIR {
        Marker::Opaque
    } else if base.starts_with(WHITEOUT_META_PREFIX) {
        Marker::Meta
    } else if let Some(original) = base.strip_prefix(WHITEOUT_PREFIX) {
        Marker::Whiteout(original)
    } else {
        Marker::None
    }
}

/// Whether any component of `name` is AUFS metadata (the link dir and
/// whatever lives under it).
pub fn is_metadata(name: &str) -> bool {
    name.split('/').any(|part| classify(part) == Marker::Meta)
}

/// Lexically cleans a tar entry name: drops `.` components, empty
/// segments and any leading or trailing slash.
pub fn clean_name(name: &str) -> String {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits a cleaned entry name into its directory (empty at the top level)
/// and base name.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('/') {
        Some(idx) => (&name[..idx], &name[idx + 1..]),
        None => ("", name),
    }
}

pub fn join_name(dir: &str, base: &str) -> String {
    if dir.is_empty() {
        base.to_string()
    } else {
        format!("{dir}/{base}")
    }
}
