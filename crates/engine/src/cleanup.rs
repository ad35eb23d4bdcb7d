//! Leftover removal.
//!
//! Encoder outputs carry a processed tag in their name until they replace the
//! original, so anything tagged that is still on disk when a run starts or
//! ends is debris from an interrupted run. In a library directory such a file
//! may be the only copy left of a video whose original was already deleted;
//! those are moved into place instead of removed. The [`TempRegistry`] tracks
//! the outputs of jobs in flight so an interrupted run can remove them
//! directly.

use crate::replace::{recover_output, Leftover};
use crate::scan::{has_processed_tag, is_hidden_dir};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

/// What kind of directory a sweep walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// The library: tagged files are checked against their originals.
    Library,
    /// A scratch directory holding nothing but temp outputs.
    Scratch,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub files_removed: usize,
    pub dirs_removed: usize,
    /// Outputs moved into the place of an already deleted original.
    pub recovered: usize,
    /// Tagged files left alone because no original could be matched.
    pub kept: usize,
    pub errors: usize,
}

fn remove_leftover_file(path: &Path, stats: &mut SweepStats) {
    match fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed leftover file");
            stats.files_removed += 1;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not remove leftover file");
            stats.errors += 1;
        }
    }
}

/// Cleans up every tagged file and directory under `root`.
///
/// Tagged directories are always deleted. Tagged files are deleted in
/// [`SweepMode::Scratch`]; in [`SweepMode::Library`] only when their
/// original still exists. Hidden directories are not entered. Paths in
/// `keep` are left alone.
pub fn sweep_tagged(
    root: &Path,
    tags: &[String],
    keep: &HashSet<PathBuf>,
    mode: SweepMode,
) -> SweepStats {
    let mut stats = SweepStats::default();
    let mut walker = WalkDir::new(root).into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if is_hidden_dir(&entry) {
            walker.skip_current_dir();
            continue;
        }
        if entry.depth() == 0 || !has_processed_tag(entry.path(), tags) {
            continue;
        }
        if keep.contains(entry.path()) {
            continue;
        }

        let path = entry.path();
        if entry.file_type().is_dir() {
            walker.skip_current_dir();
            match fs::remove_dir_all(path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "removed leftover directory");
                    stats.dirs_removed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove leftover directory");
                    stats.errors += 1;
                }
            }
            continue;
        }

        if mode == SweepMode::Scratch {
            remove_leftover_file(path, &mut stats);
            continue;
        }
        match recover_output(path, tags) {
            Ok(Leftover::Stale) => remove_leftover_file(path, &mut stats),
            Ok(Leftover::Recovered(destination)) => {
                tracing::warn!(
                    output = %path.display(),
                    destination = %destination.display(),
                    "finished an interrupted replacement"
                );
                stats.recovered += 1;
            }
            Ok(Leftover::Orphaned) => {
                tracing::warn!(path = %path.display(), "tagged file has no original, keeping it");
                stats.kept += 1;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not inspect leftover file");
                stats.errors += 1;
            }
        }
    }

    stats
}

#[derive(Debug, Default)]
struct TempState {
    active: HashSet<PathBuf>,
    preserved: HashSet<PathBuf>,
}

/// Temp outputs of in-flight jobs.
///
/// Cloning shares the registry.
#[derive(Debug, Clone, Default)]
pub struct TempRegistry {
    inner: Arc<Mutex<TempState>>,
}

impl TempRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: &Path) {
        if let Ok(mut state) = self.inner.lock() {
            state.active.insert(path.to_path_buf());
        }
    }

    /// The job finished with this path; it is no longer ours to delete.
    pub fn release(&self, path: &Path) {
        if let Ok(mut state) = self.inner.lock() {
            state.active.remove(path);
        }
    }

    /// Keeps an output for manual recovery, exempting it from sweeps.
    pub fn preserve(&self, path: &Path) {
        if let Ok(mut state) = self.inner.lock() {
            state.active.remove(path);
            state.preserved.insert(path.to_path_buf());
        }
    }

    pub fn preserved(&self) -> HashSet<PathBuf> {
        self.inner
            .lock()
            .map(|s| s.preserved.clone())
            .unwrap_or_default()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().map(|s| s.active.len()).unwrap_or(0)
    }

    /// Deletes every registered temp file, returning how many were removed.
    pub fn remove_all(&self) -> usize {
        let paths: Vec<PathBuf> = match self.inner.lock() {
            Ok(mut state) => state.active.drain().collect(),
            Err(_) => return 0,
        };
        paths
            .iter()
            .filter(|p| match fs::remove_file(p) {
                Ok(()) => {
                    tracing::info!(path = %p.display(), "removed temp output");
                    true
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "could not remove temp output");
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn tags() -> Vec<String> {
        vec!["[Cleaned]".into(), "[Trans]".into()]
    }

    #[test]
    fn test_sweep_removes_tagged_entries() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let season = root.join("Show/Season 1");
        fs::create_dir_all(&season).unwrap();

        let original = season.join("Show S01E01.mkv");
        let leftover = season.join("Show S01E01.mkv [Trans] 0123abcd.mkv");
        let cleaned_dir = root.join("Movie [Cleaned]");
        File::create(&original).unwrap();
        File::create(&leftover).unwrap();
        fs::create_dir_all(cleaned_dir.join("nested")).unwrap();
        File::create(cleaned_dir.join("nested/x.mkv")).unwrap();

        let stats = sweep_tagged(root, &tags(), &HashSet::new(), SweepMode::Library);

        assert_eq!(stats.files_removed, 1);
        assert_eq!(stats.dirs_removed, 1);
        assert_eq!(stats.errors, 0);
        assert!(original.exists());
        assert!(!leftover.exists());
        assert!(!cleaned_dir.exists());
    }

    #[test]
    fn test_sweep_recovers_output_whose_original_is_gone() {
        let temp = TempDir::new().unwrap();
        let staged = temp.path().join("Show/Show S01E01.ts [Trans] 0123abcd.mkv");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"encoded").unwrap();

        let stats = sweep_tagged(temp.path(), &tags(), &HashSet::new(), SweepMode::Library);

        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.files_removed, 0);
        assert!(!staged.exists());
        assert_eq!(
            fs::read(temp.path().join("Show/Show S01E01.mkv")).unwrap(),
            b"encoded"
        );
    }

    #[test]
    fn test_sweep_keeps_tagged_file_without_original() {
        let temp = TempDir::new().unwrap();
        let lone = temp.path().join("Show S01E01 [Trans].mkv");
        fs::write(&lone, b"only copy").unwrap();

        let stats = sweep_tagged(temp.path(), &tags(), &HashSet::new(), SweepMode::Library);

        assert_eq!(stats.kept, 1);
        assert_eq!(stats.files_removed, 0);
        assert_eq!(fs::read(&lone).unwrap(), b"only copy");
    }

    #[test]
    fn test_scratch_sweep_removes_every_tagged_file() {
        let temp = TempDir::new().unwrap();
        let named = temp.path().join("a.mkv [Trans] 0123abcd.mkv");
        let legacy = temp.path().join("b [Trans].mkv");
        File::create(&named).unwrap();
        File::create(&legacy).unwrap();

        let stats = sweep_tagged(temp.path(), &tags(), &HashSet::new(), SweepMode::Scratch);

        assert_eq!(stats.files_removed, 2);
        assert_eq!(stats.recovered, 0);
        assert!(!named.exists());
        assert!(!legacy.exists());
    }

    #[test]
    fn test_sweep_respects_keep_and_hidden() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let kept = root.join("a [Trans].mkv");
        let hidden = root.join(".vidshrink/b [Trans].mkv");
        File::create(&kept).unwrap();
        fs::create_dir_all(hidden.parent().unwrap()).unwrap();
        File::create(&hidden).unwrap();

        let keep: HashSet<PathBuf> = [kept.clone()].into_iter().collect();
        let stats = sweep_tagged(root, &tags(), &keep, SweepMode::Scratch);

        assert_eq!(stats, SweepStats::default());
        assert!(kept.exists());
        assert!(hidden.exists());
    }

    #[test]
    fn test_registry_removes_active_only() {
        let temp = TempDir::new().unwrap();
        let active = temp.path().join("active [Trans].mkv");
        let released = temp.path().join("released [Trans].mkv");
        let preserved = temp.path().join("preserved [Trans].mkv");
        for p in [&active, &released, &preserved] {
            File::create(p).unwrap();
        }

        let registry = TempRegistry::new();
        registry.register(&active);
        registry.register(&released);
        registry.register(&preserved);
        registry.release(&released);
        registry.preserve(&preserved);
        assert_eq!(registry.active_count(), 1);

        assert_eq!(registry.remove_all(), 1);
        assert!(!active.exists());
        assert!(released.exists());
        assert!(preserved.exists());
        assert!(registry.preserved().contains(&preserved));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_registry_tolerates_missing_files() {
        let registry = TempRegistry::new();
        registry.register(Path::new("/nonexistent/vidshrink [Trans].mkv"));
        assert_eq!(registry.remove_all(), 0);
    }
}
