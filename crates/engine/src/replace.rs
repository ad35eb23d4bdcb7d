//! Replacer module: swaps an accepted output in for its original.
//!
//! The output is first staged next to the original (a rename, or copy +
//! remove when it was written on another device) and given the original's
//! modification time. Only then is the original deleted and the staged file
//! renamed into place, after which permissions and ownership are restored.
//! A crash between the delete and the rename leaves the staged output beside
//! the original's old location, where [`recover_output`] finds it.

use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Tag carried by encoder outputs until they replace their original.
pub const OUTPUT_TAG: &str = "[Trans]";

const OUTPUT_ID_LEN: usize = 8;

/// Errors that can occur during file replacement.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// Could not read the original's metadata.
    #[error("Failed to read metadata of {path}: {source}")]
    Metadata {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The final path is a different file that already exists.
    #[error("Refusing to overwrite existing file {0}")]
    Conflict(PathBuf),

    /// Could not bring the output next to the original.
    #[error("Failed to stage output: {0}")]
    Stage(std::io::Error),

    /// Could not copy the modification time onto the staged output.
    #[error("Failed to set modification time: {0}")]
    Timestamp(std::io::Error),

    /// Could not delete the original.
    #[error("Failed to remove original: {0}")]
    RemoveOriginal(std::io::Error),

    /// The original is gone but the staged output could not be renamed.
    #[error("Failed to move {staged} into place: {source}")]
    Move {
        staged: PathBuf,
        source: std::io::Error,
    },

    /// The output is in place; its permissions or timestamp are not.
    #[error("Failed to restore attributes: {0}")]
    Restore(std::io::Error),
}

impl ReplaceError {
    /// The new file already sits at the destination.
    pub fn original_replaced(&self) -> bool {
        matches!(self, ReplaceError::Restore(_))
    }
}

/// Output file name for `source`: `"<source file name> [Trans] <id>.<container>"`.
///
/// The full source name lets an interrupted replacement find its way back;
/// the id keeps jobs with equal names apart.
pub fn output_file_name(source: &Path, id: &str, container: &str) -> String {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let id: String = id.chars().take(OUTPUT_ID_LEN).collect();
    format!("{} {} {}.{}", name, OUTPUT_TAG, id, container)
}

/// Source file name an output name was built from.
pub fn source_name_of(output_name: &str) -> Option<&str> {
    let marker = format!(" {} ", OUTPUT_TAG);
    let idx = output_name.rfind(&marker)?;
    let source = &output_name[..idx];
    let (id, ext) = output_name[idx + marker.len()..].split_once('.')?;
    let valid = !source.is_empty()
        && !ext.is_empty()
        && id.len() == OUTPUT_ID_LEN
        && id.chars().all(|c| c.is_ascii_hexdigit());
    valid.then_some(source)
}

/// Where the output ends up: the original path, or the same stem with the
/// target container extension when the container changes.
pub fn final_path(original: &Path, container: &str) -> PathBuf {
    let same = original
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(container))
        .unwrap_or(false);
    if same {
        original.to_path_buf()
    } else {
        original.with_extension(container)
    }
}

/// Rename, falling back to copy + remove when the rename fails (cross-device).
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if let Err(e) = fs::copy(from, to) {
        let _ = fs::remove_file(to);
        return Err(e);
    }
    fs::remove_file(from)
}

#[cfg(unix)]
fn restore_owner(path: &Path, metadata: &fs::Metadata) {
    use std::os::unix::fs::MetadataExt;

    // Unprivileged runs cannot chown; the file keeps the runner's ownership.
    if let Err(e) = std::os::unix::fs::chown(path, Some(metadata.uid()), Some(metadata.gid())) {
        tracing::debug!(path = %path.display(), error = %e, "could not restore ownership");
    }
}

#[cfg(not(unix))]
fn restore_owner(_path: &Path, _metadata: &fs::Metadata) {}

fn restore_attributes(
    destination: &Path,
    metadata: &fs::Metadata,
    mtime: FileTime,
) -> Result<(), ReplaceError> {
    fs::set_permissions(destination, metadata.permissions()).map_err(ReplaceError::Restore)?;
    restore_owner(destination, metadata);
    filetime::set_file_mtime(destination, mtime).map_err(ReplaceError::Restore)
}

/// Replaces `original` with `output`, placing the result at `destination`.
///
/// `destination` is normally `original` itself; it differs when the
/// container changed (see [`final_path`]). Any error before the original is
/// deleted leaves the original untouched and removes the staged copy.
pub fn replace_original(
    original: &Path,
    output: &Path,
    destination: &Path,
) -> Result<(), ReplaceError> {
    let metadata = fs::metadata(original).map_err(|source| ReplaceError::Metadata {
        path: original.to_path_buf(),
        source,
    })?;
    let mtime = FileTime::from_last_modification_time(&metadata);

    if destination != original && destination.exists() {
        return Err(ReplaceError::Conflict(destination.to_path_buf()));
    }

    let staged = match (original.parent(), output.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => output.to_path_buf(),
    };
    if staged != output {
        move_file(output, &staged).map_err(|e| {
            let _ = fs::remove_file(&staged);
            ReplaceError::Stage(e)
        })?;
    }
    let abandon = |e: ReplaceError| {
        let _ = fs::remove_file(&staged);
        e
    };

    filetime::set_file_mtime(&staged, mtime)
        .map_err(ReplaceError::Timestamp)
        .map_err(abandon)?;
    fs::remove_file(original)
        .map_err(ReplaceError::RemoveOriginal)
        .map_err(abandon)?;
    move_file(&staged, destination).map_err(|source| ReplaceError::Move {
        staged: staged.clone(),
        source,
    })?;

    restore_attributes(destination, &metadata, mtime)?;

    tracing::debug!(
        original = %original.display(),
        destination = %destination.display(),
        "original replaced"
    );
    Ok(())
}

/// What a tagged output found on disk turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leftover {
    /// Its original still exists; the output can be deleted.
    Stale,
    /// Its original was gone; the output now sits at this path.
    Recovered(PathBuf),
    /// No original could be identified, or the destination is taken.
    Orphaned,
}

/// Untagged stem of a file name carrying one of `tags`.
fn untagged_stem(name: &str, tags: &[String]) -> Option<String> {
    let stem = Path::new(name).file_stem()?.to_str()?;
    let mut stripped = stem.to_string();
    for tag in tags.iter().filter(|t| !t.is_empty()) {
        stripped = stripped.replace(tag.as_str(), "");
    }
    let stripped = stripped.trim().to_string();
    (!stripped.is_empty()).then_some(stripped)
}

/// Decides the fate of a tagged output sitting in a library directory,
/// finishing the replacement when its original was already deleted.
///
/// Outputs named by [`output_file_name`] name their original exactly. For
/// other tagged files the output is stale only if some untagged sibling
/// shares its stem.
pub fn recover_output(output: &Path, tags: &[String]) -> std::io::Result<Leftover> {
    let Some(dir) = output.parent() else {
        return Ok(Leftover::Orphaned);
    };
    let Some(name) = output.file_name().and_then(|n| n.to_str()) else {
        return Ok(Leftover::Orphaned);
    };

    let Some(source_name) = source_name_of(name) else {
        let Some(stem) = untagged_stem(name, tags) else {
            return Ok(Leftover::Orphaned);
        };
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path == output || !path.is_file() {
                continue;
            }
            let sibling = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let tagged = tags.iter().any(|t| !t.is_empty() && sibling.contains(t.as_str()));
            let same_stem = path.file_stem().and_then(|s| s.to_str()) == Some(stem.as_str());
            if same_stem && !tagged {
                return Ok(Leftover::Stale);
            }
        }
        return Ok(Leftover::Orphaned);
    };

    let original = dir.join(source_name);
    if original.exists() {
        return Ok(Leftover::Stale);
    }
    let container = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let destination = final_path(&original, container);
    if destination.exists() {
        return Ok(Leftover::Orphaned);
    }
    fs::rename(output, &destination)?;
    Ok(Leftover::Recovered(destination))
}
