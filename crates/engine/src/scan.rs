//! Candidate discovery for a library root.
//!
//! Recursively walks the root, skipping hidden directories, and yields video
//! files that match the configured extensions and minimum size. Files whose
//! names carry a processed tag (`[Trans]`, `[Cleaned]`) are leftovers from an
//! earlier run and are never yielded; the cleanup sweep removes them.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use vidshrink_config::ScanConfig;
use walkdir::{DirEntry, WalkDir};

/// A candidate video file discovered during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCandidate {
    /// Full path to the video file.
    pub path: PathBuf,
    /// File size in bytes at discovery time.
    pub size_bytes: u64,
    /// Last modified time of the file.
    pub modified_time: SystemTime,
}

/// Checks if a file has one of `extensions` (case-insensitive, no leading dot).
pub fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Checks if a file or directory name carries any of the processed tags.
pub fn has_processed_tag(path: &Path, tags: &[String]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| tags.iter().any(|t| !t.is_empty() && name.contains(t.as_str())))
        .unwrap_or(false)
}

/// Hidden directories below the root are pruned; the root itself may be hidden.
pub(crate) fn is_hidden_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|n| n.starts_with('.'))
            .unwrap_or(false)
}

/// Lazy, restartable file walker over one library root.
#[derive(Debug, Clone)]
pub struct FileWalker {
    root: PathBuf,
    extensions: Vec<String>,
    min_size_bytes: u64,
    processed_tags: Vec<String>,
}

impl FileWalker {
    pub fn new(
        root: PathBuf,
        extensions: Vec<String>,
        min_size_bytes: u64,
        processed_tags: Vec<String>,
    ) -> Self {
        Self {
            root,
            extensions,
            min_size_bytes,
            processed_tags,
        }
    }

    pub fn from_config(root: &Path, cfg: &ScanConfig) -> Self {
        Self::new(
            root.to_path_buf(),
            cfg.extensions.clone(),
            cfg.min_size_bytes,
            cfg.processed_tags.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Yields candidates as the tree is walked.
    ///
    /// Every call starts a fresh walk. Unreadable entries are logged and
    /// skipped. A missing root yields nothing.
    pub fn walk(&self) -> impl Iterator<Item = ScanCandidate> + '_ {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e))
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    None
                }
            })
            .filter(|e| e.file_type().is_file())
            .filter(|e| has_extension(e.path(), &self.extensions))
            .filter(|e| !has_processed_tag(e.path(), &self.processed_tags))
            .filter_map(|e| {
                let metadata = e.metadata().ok()?;
                let size_bytes = metadata.len();
                if size_bytes < self.min_size_bytes {
                    return None;
                }
                Some(ScanCandidate {
                    path: e.path().to_path_buf(),
                    size_bytes,
                    modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                })
            })
    }

    /// All candidates, ordered by path.
    pub fn walk_sorted(&self) -> Vec<ScanCandidate> {
        let mut candidates: Vec<ScanCandidate> = self.walk().collect();
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        candidates
    }
}
