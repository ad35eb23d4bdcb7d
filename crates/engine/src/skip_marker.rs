//! Skip markers: sentinel files that exclude work permanently.
//!
//! Two kinds exist. A directory marker (`.vidshrink-skip` by default) placed in
//! a library directory excludes that whole subtree. Name-scoped markers live in
//! a marker store directory and exclude every file whose derived key matches:
//! the show key is the first whitespace-delimited token of the file name, the
//! episode key is the full file stem. Markers are never removed by the program;
//! deleting one by hand is the only way to retry.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use vidshrink_config::{MarkersConfig, NameScope};

/// Granularity of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerScope {
    /// A directory and everything below it.
    Directory,
    Show,
    Episode,
}

impl From<NameScope> for MarkerScope {
    fn from(scope: NameScope) -> Self {
        match scope {
            NameScope::Show => MarkerScope::Show,
            NameScope::Episode => MarkerScope::Episode,
            NameScope::Directory => MarkerScope::Directory,
        }
    }
}

impl std::fmt::Display for MarkerScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MarkerScope::Directory => write!(f, "directory"),
            MarkerScope::Show => write!(f, "show"),
            MarkerScope::Episode => write!(f, "episode"),
        }
    }
}

/// A marker found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipMarker {
    pub scope: MarkerScope,
    pub key: String,
    pub path: PathBuf,
}

/// First whitespace-delimited token of the file name.
pub fn show_key(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    stem.split_whitespace().next().map(str::to_string)
}

/// Full file stem.
pub fn episode_key(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Keys become file names inside the store.
fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}

/// Filesystem-backed marker store.
#[derive(Debug, Clone)]
pub struct SkipMarkerStore {
    /// Directory markers are looked up no higher than this.
    root: PathBuf,
    directory_marker: String,
    store_dir: PathBuf,
}

impl SkipMarkerStore {
    pub fn new(root: PathBuf, directory_marker: String, store_dir: PathBuf) -> Self {
        Self {
            root,
            directory_marker,
            store_dir,
        }
    }

    /// Store rooted at a library, defaulting to `<root>/.vidshrink/markers`.
    pub fn from_config(root: &Path, cfg: &MarkersConfig) -> Self {
        let store_dir = cfg
            .store_dir
            .clone()
            .unwrap_or_else(|| root.join(".vidshrink").join("markers"));
        Self::new(root.to_path_buf(), cfg.directory_marker.clone(), store_dir)
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Key a file maps to under a name scope.
    pub fn key_for(scope: MarkerScope, path: &Path) -> Option<String> {
        match scope {
            MarkerScope::Directory => path.parent().map(|p| p.to_string_lossy().to_string()),
            MarkerScope::Show => show_key(path),
            MarkerScope::Episode => episode_key(path),
        }
    }

    /// Location of the sentinel file for a (scope, key) pair.
    pub fn marker_path(&self, scope: MarkerScope, key: &str) -> PathBuf {
        match scope {
            MarkerScope::Directory => Path::new(key).join(&self.directory_marker),
            MarkerScope::Show => self.store_dir.join("show").join(sanitize_key(key)),
            MarkerScope::Episode => self.store_dir.join("episode").join(sanitize_key(key)),
        }
    }

    /// Finds the marker excluding `path`, if any.
    ///
    /// Directory markers are checked first, from the file's directory up to
    /// the store root; they win over name-scoped markers.
    pub fn is_skipped(&self, path: &Path) -> Option<SkipMarker> {
        if let Some(parent) = path.parent() {
            for dir in parent.ancestors() {
                let marker = dir.join(&self.directory_marker);
                if marker.is_file() {
                    return Some(SkipMarker {
                        scope: MarkerScope::Directory,
                        key: dir.to_string_lossy().to_string(),
                        path: marker,
                    });
                }
                if dir == self.root || !dir.starts_with(&self.root) {
                    break;
                }
            }
        }

        for scope in [MarkerScope::Show, MarkerScope::Episode] {
            if let Some(key) = Self::key_for(scope, path) {
                let marker = self.marker_path(scope, &key);
                if marker.exists() {
                    return Some(SkipMarker {
                        scope,
                        key,
                        path: marker,
                    });
                }
            }
        }

        None
    }

    /// Creates the marker if it does not exist yet.
    ///
    /// Returns `Ok(true)` when this call created it and `Ok(false)` when it
    /// was already present; losing a creation race is not an error.
    pub fn mark_skipped(&self, scope: MarkerScope, key: &str) -> io::Result<bool> {
        let marker = self.marker_path(scope, key);
        if let Some(dir) = marker.parent() {
            std::fs::create_dir_all(dir)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(&marker) {
            Ok(_) => {
                tracing::info!(scope = %scope, key, marker = %marker.display(), "skip marker written");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store(root: &Path) -> SkipMarkerStore {
        SkipMarkerStore::from_config(root, &MarkersConfig::default())
    }

    #[test]
    fn test_key_derivation() {
        let p = Path::new("/tv/Frasier/Season 1/Frasier S01E01 The Good Son.mkv");
        assert_eq!(show_key(p).as_deref(), Some("Frasier"));
        assert_eq!(
            episode_key(p).as_deref(),
            Some("Frasier S01E01 The Good Son")
        );

        let dotted = Path::new("/tv/Show.Name.S02E03.mkv");
        assert_eq!(show_key(dotted).as_deref(), Some("Show.Name.S02E03"));
    }

    #[test]
    fn test_default_store_location() {
        let s = store(Path::new("/media/tv"));
        assert_eq!(s.store_dir(), Path::new("/media/tv/.vidshrink/markers"));
        assert_eq!(
            s.marker_path(MarkerScope::Show, "Frasier"),
            PathBuf::from("/media/tv/.vidshrink/markers/show/Frasier")
        );
        assert_eq!(
            s.marker_path(MarkerScope::Episode, "a/b"),
            PathBuf::from("/media/tv/.vidshrink/markers/episode/a_b")
        );
    }

    #[test]
    fn test_name_marker_suppresses_matching_files() {
        let temp = TempDir::new().unwrap();
        let s = store(temp.path());
        let ep1 = temp.path().join("Frasier S01E01.mkv");
        let ep2 = temp.path().join("Frasier S01E02.mkv");
        let other = temp.path().join("Cheers S01E01.mkv");

        assert!(s.is_skipped(&ep1).is_none());
        assert!(s.mark_skipped(MarkerScope::Show, "Frasier").unwrap());

        let hit = s.is_skipped(&ep2).expect("show marker applies");
        assert_eq!(hit.scope, MarkerScope::Show);
        assert_eq!(hit.key, "Frasier");
        assert!(s.is_skipped(&other).is_none());
    }

    #[test]
    fn test_episode_marker_is_narrower() {
        let temp = TempDir::new().unwrap();
        let s = store(temp.path());
        s.mark_skipped(MarkerScope::Episode, "Frasier S01E01").unwrap();

        assert!(s.is_skipped(&temp.path().join("Frasier S01E01.mkv")).is_some());
        assert!(s.is_skipped(&temp.path().join("Frasier S01E02.mkv")).is_none());
    }

    #[test]
    fn test_directory_marker_suppresses_subtree() {
        let temp = TempDir::new().unwrap();
        let show = temp.path().join("Frasier");
        let season = show.join("Season 1");
        fs::create_dir_all(&season).unwrap();
        File::create(show.join(".vidshrink-skip")).unwrap();

        let s = store(temp.path());
        let hit = s
            .is_skipped(&season.join("Frasier S01E01.mkv"))
            .expect("ancestor marker applies");
        assert_eq!(hit.scope, MarkerScope::Directory);
        assert_eq!(hit.path, show.join(".vidshrink-skip"));

        assert!(s.is_skipped(&temp.path().join("Cheers S01E01.mkv")).is_none());
    }

    #[test]
    fn test_directory_marker_wins_over_name_marker() {
        let temp = TempDir::new().unwrap();
        let s = store(temp.path());
        s.mark_skipped(MarkerScope::Show, "Frasier").unwrap();
        s.mark_skipped(MarkerScope::Directory, &temp.path().to_string_lossy())
            .unwrap();

        let hit = s.is_skipped(&temp.path().join("Frasier S01E01.mkv")).unwrap();
        assert_eq!(hit.scope, MarkerScope::Directory);
    }

    #[test]
    fn test_markers_above_root_are_ignored() {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        fs::create_dir_all(&library).unwrap();
        File::create(temp.path().join(".vidshrink-skip")).unwrap();

        let s = store(&library);
        assert!(s.is_skipped(&library.join("Show S01E01.mkv")).is_none());
    }

    #[test]
    fn test_mark_skipped_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let s = store(temp.path());

        assert!(s.mark_skipped(MarkerScope::Show, "Frasier").unwrap());
        assert!(!s.mark_skipped(MarkerScope::Show, "Frasier").unwrap());

        let marker = s.marker_path(MarkerScope::Show, "Frasier");
        assert!(fs::read(&marker).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_marking_never_errors() {
        let temp = TempDir::new().unwrap();
        let s = Arc::new(store(temp.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = Arc::clone(&s);
                std::thread::spawn(move || {
                    let key = if i % 2 == 0 { "Frasier" } else { "Cheers" };
                    s.mark_skipped(MarkerScope::Show, key)
                })
            })
            .collect();

        let created: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        // Exactly one winner per key
        assert_eq!(created.iter().filter(|c| **c).count(), 2);
    }
}
