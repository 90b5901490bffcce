//! Lexical path handling for archive names and link targets. Nothing here
//! touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Normalizes a path from a tar archive so it can be joined under a
/// destination root. `..` never climbs above the root and absolute paths
/// are treated as rooted at the destination.
pub fn sanitize_entry_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
            Component::RootDir | Component::Prefix(_) => {}
        }
    }

    out
}

/// Resolves `link` lexically, relative to `dir` (itself relative to the
/// destination root), or to the root when `link` is absolute. Returns `None`
/// when the result would climb above the root.
pub fn resolve_within(dir: &Path, link: &Path) -> Option<PathBuf> {
    let mut out = if link.is_absolute() {
        PathBuf::new()
    } else {
        sanitize_entry_path(dir)
    };

    for comp in link.components() {
        match comp {
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }

    Some(out)
}

/// Lexically cleans `p`, keeping leading `..` components of relative paths.
pub fn clean(p: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();

    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) => {}
                _ => parts.push(comp),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// Computes `target` relative to the directory `base`. Both must be absolute.
pub fn relative_to(base: &Path, target: &Path) -> PathBuf {
    let base = clean(base);
    let target = clean(target);

    let base_parts: Vec<_> = base.components().collect();
    let target_parts: Vec<_> = target.components().collect();
    let common = base_parts
        .iter()
        .zip(&target_parts)
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}
