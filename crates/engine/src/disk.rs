//! Free-space pre-flight for encode outputs.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

/// Free bytes on the filesystem holding `path`.
///
/// Resolves the path (or its nearest existing ancestor) and picks the disk
/// with the longest mount point that prefixes it. `None` when no disk
/// matches, which happens in some containers.
pub fn available_space(path: &Path) -> Option<u64> {
    let resolved = resolve_existing(path)?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

fn resolve_existing(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|p| p.exists())
        .and_then(|p| p.canonicalize().ok())
}

/// Outcome of the free-space check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceCheck {
    Sufficient,
    Insufficient { available: u64, required: u64 },
    /// Free space could not be determined; the encode proceeds.
    Unknown,
}

/// Compares available space against the configured floor.
pub fn evaluate(available: Option<u64>, min_free_bytes: u64) -> SpaceCheck {
    match available {
        None => SpaceCheck::Unknown,
        Some(a) if a < min_free_bytes => SpaceCheck::Insufficient {
            available: a,
            required: min_free_bytes,
        },
        Some(_) => SpaceCheck::Sufficient,
    }
}

/// Pre-flight for writing into `dir`.
pub fn check_free_space(dir: &Path, min_free_bytes: u64) -> SpaceCheck {
    if min_free_bytes == 0 {
        return SpaceCheck::Sufficient;
    }
    let check = evaluate(available_space(dir), min_free_bytes);
    if check == SpaceCheck::Unknown {
        tracing::warn!(dir = %dir.display(), "could not determine free space");
    }
    check
}
