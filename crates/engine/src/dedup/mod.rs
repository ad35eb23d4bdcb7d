//! Duplicate removal for TV and movie libraries.
//!
//! Each directory holding eligible videos is planned on its own. In TV mode
//! videos are grouped by episode code; in movies mode the whole folder is one
//! group, except for the library root and collection folders whose
//! subfolders hold videos of their own. The preferred member of each group is kept (container priority,
//! then size, then path order) and every other member is deleted together
//! with its sidecar files. Orphaned trickplay directories go too.
//!
//! Planning never touches the filesystem beyond reading it, so audit mode
//! runs the exact same plan and only logs what it would delete.

pub mod episode;

pub use episode::{parse_episode_code, EpisodeCode};

use crate::scan::is_hidden_dir;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vidshrink_config::{DedupConfig, DedupMode};
use walkdir::WalkDir;

const TRICKPLAY_SUFFIX: &str = ".trickplay";

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Library root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One video in a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupMember {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Position of the container in the priority list; lower wins.
    pub priority: usize,
}

/// Videos sharing a key inside one directory, best first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub directory: PathBuf,
    /// Normalized episode code, or the folder name in movies mode.
    pub key: String,
    pub members: Vec<DedupMember>,
}

impl DuplicateGroup {
    pub fn kept(&self) -> &DedupMember {
        &self.members[0]
    }

    pub fn removed(&self) -> &[DedupMember] {
        &self.members[1..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalKind {
    Video,
    Sidecar,
    Trickplay,
}

impl std::fmt::Display for RemovalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalKind::Video => write!(f, "video"),
            RemovalKind::Sidecar => write!(f, "sidecar"),
            RemovalKind::Trickplay => write!(f, "trickplay"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedRemoval {
    pub path: PathBuf,
    pub kind: RemovalKind,
    pub is_dir: bool,
    /// File size; zero for directories.
    pub size_bytes: u64,
}

/// Everything a dedup pass decided, in deletion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupPlan {
    pub groups: Vec<DuplicateGroup>,
    pub removals: Vec<PlannedRemoval>,
}

impl DedupPlan {
    /// Human-readable decision log; identical in audit and live mode.
    pub fn decisions(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .groups
            .iter()
            .map(|g| {
                format!(
                    "{} [{}]: keep {}",
                    g.directory.display(),
                    g.key,
                    g.kept().path.display()
                )
            })
            .collect();
        lines.extend(
            self.removals
                .iter()
                .map(|r| format!("delete {} {}", r.kind, r.path.display())),
        );
        lines
    }
}

/// Counts from applying a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupSummary {
    pub groups: usize,
    pub deleted: usize,
    /// Audit mode only.
    pub would_delete: usize,
    pub bytes_freed: u64,
    pub errors: usize,
}

#[derive(Debug, Clone)]
struct DirEntryInfo {
    path: PathBuf,
    name: String,
    is_dir: bool,
    size_bytes: u64,
}

/// Whether `name` is `<stem>.*` or `<stem>-*`.
fn belongs_to(name: &str, stem: &str) -> bool {
    name.strip_prefix(stem)
        .map(|rest| rest.starts_with('.') || rest.starts_with('-'))
        .unwrap_or(false)
}

pub struct DeduplicationEngine {
    root: PathBuf,
    mode: DedupMode,
    audit: bool,
    /// Eligible extensions in priority order.
    extensions: Vec<String>,
}

impl DeduplicationEngine {
    pub fn new(root: PathBuf, mode: DedupMode, audit: bool, extensions: Vec<String>) -> Self {
        Self {
            root,
            mode,
            audit,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn from_config(root: &Path, cfg: &DedupConfig) -> Self {
        Self::new(root.to_path_buf(), cfg.mode, cfg.audit, cfg.extensions.clone())
    }

    pub fn is_audit(&self) -> bool {
        self.audit
    }

    /// Container priority of a path, `None` if it is not an eligible video.
    pub fn container_priority(&self, path: &Path) -> Option<usize> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.extensions.iter().position(|e| *e == ext)
    }

    /// Builds the plan without modifying anything.
    pub fn plan(&self) -> Result<DedupPlan, DedupError> {
        if !self.root.is_dir() {
            return Err(DedupError::RootNotFound(self.root.clone()));
        }

        let mut plan = DedupPlan::default();
        let dirs = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir());

        for dir in dirs {
            self.plan_directory(dir.path(), dir.depth(), &mut plan)?;
        }
        Ok(plan)
    }

    /// Whether any non-trickplay subdirectory directly holds an eligible video.
    fn has_video_subdir(&self, entries: &[DirEntryInfo]) -> bool {
        entries
            .iter()
            .filter(|e| e.is_dir && !e.name.ends_with(TRICKPLAY_SUFFIX))
            .any(|e| {
                fs::read_dir(&e.path)
                    .map(|children| {
                        children.filter_map(|c| c.ok()).any(|c| {
                            c.file_type().map(|t| t.is_file()).unwrap_or(false)
                                && self.container_priority(&c.path()).is_some()
                        })
                    })
                    .unwrap_or(false)
            })
    }

    /// Movies are grouped per movie folder: never the root, never a
    /// collection folder.
    fn groups_directory(&self, depth: usize, entries: &[DirEntryInfo]) -> bool {
        match self.mode {
            DedupMode::Tv => true,
            DedupMode::Movies => depth > 0 && !self.has_video_subdir(entries),
        }
    }

    fn read_entries(dir: &Path) -> Result<Vec<DirEntryInfo>, DedupError> {
        let io_err = |source| DedupError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            entries.push(DirEntryInfo {
                path: entry.path(),
                name,
                is_dir: metadata.is_dir(),
                size_bytes: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn plan_directory(
        &self,
        dir: &Path,
        depth: usize,
        plan: &mut DedupPlan,
    ) -> Result<(), DedupError> {
        let entries = Self::read_entries(dir)?;
        let videos: Vec<DedupMember> = entries
            .iter()
            .filter(|e| !e.is_dir)
            .filter_map(|e| {
                Some(DedupMember {
                    path: e.path.clone(),
                    size_bytes: e.size_bytes,
                    priority: self.container_priority(&e.path)?,
                })
            })
            .collect();
        if videos.is_empty() {
            return Ok(());
        }
        let groupable: &[DedupMember] = if self.groups_directory(depth, &entries) {
            &videos
        } else {
            tracing::debug!(dir = %dir.display(), "not a movie folder, not grouping");
            &[]
        };

        let mut keyed: BTreeMap<String, Vec<DedupMember>> = BTreeMap::new();
        for video in groupable.iter().cloned() {
            let key = match self.mode {
                DedupMode::Tv => {
                    let name = video.path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    match parse_episode_code(name) {
                        Some(code) => code.to_string(),
                        None => continue,
                    }
                }
                DedupMode::Movies => dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            };
            keyed.entry(key).or_default().push(video);
        }

        let mut removed_videos: BTreeSet<PathBuf> = BTreeSet::new();
        for (key, mut members) in keyed {
            if members.len() < 2 {
                continue;
            }
            members.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.size_bytes.cmp(&a.size_bytes))
                    .then(a.path.cmp(&b.path))
            });
            let group = DuplicateGroup {
                directory: dir.to_path_buf(),
                key,
                members,
            };
            tracing::debug!(
                dir = %dir.display(),
                key = %group.key,
                kept = %group.kept().path.display(),
                "duplicate group"
            );
            removed_videos.extend(group.removed().iter().map(|m| m.path.clone()));
            plan.groups.push(group);
        }

        let stem = |p: &Path| -> String {
            p.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        };
        let kept_stems: BTreeSet<String> = videos
            .iter()
            .filter(|v| !removed_videos.contains(&v.path))
            .map(|v| stem(v.path.as_path()))
            .collect();
        let removed_stems: BTreeSet<String> =
            removed_videos.iter().map(|p| stem(p.as_path())).collect();

        let mut planned: BTreeSet<PathBuf> = BTreeSet::new();

        for member in videos.iter().filter(|v| removed_videos.contains(&v.path)) {
            plan.removals.push(PlannedRemoval {
                path: member.path.clone(),
                kind: RemovalKind::Video,
                is_dir: false,
                size_bytes: member.size_bytes,
            });
            planned.insert(member.path.clone());
        }

        for entry in &entries {
            if planned.contains(&entry.path) || videos.iter().any(|v| v.path == entry.path) {
                continue;
            }
            let of_removed = removed_stems.iter().any(|s| belongs_to(&entry.name, s));
            let of_kept = kept_stems.iter().any(|s| belongs_to(&entry.name, s));
            if !of_removed || of_kept {
                continue;
            }
            plan.removals.push(PlannedRemoval {
                path: entry.path.clone(),
                kind: RemovalKind::Sidecar,
                is_dir: entry.is_dir,
                size_bytes: entry.size_bytes,
            });
            planned.insert(entry.path.clone());
        }

        // Any surviving file counts as an owner, eligible video or not
        let surviving_stems: BTreeSet<String> = entries
            .iter()
            .filter(|e| !e.is_dir && !planned.contains(&e.path))
            .map(|e| stem(e.path.as_path()))
            .collect();
        for entry in entries.iter().filter(|e| e.is_dir) {
            let Some(base) = entry.name.strip_suffix(TRICKPLAY_SUFFIX) else {
                continue;
            };
            if planned.contains(&entry.path) || surviving_stems.contains(base) {
                continue;
            }
            plan.removals.push(PlannedRemoval {
                path: entry.path.clone(),
                kind: RemovalKind::Trickplay,
                is_dir: true,
                size_bytes: 0,
            });
            planned.insert(entry.path.clone());
        }

        Ok(())
    }

    /// Executes a plan, or only logs it in audit mode.
    pub fn apply(&self, plan: &DedupPlan) -> DedupSummary {
        let mut summary = DedupSummary {
            groups: plan.groups.len(),
            ..DedupSummary::default()
        };

        for group in &plan.groups {
            tracing::info!(
                key = %group.key,
                dir = %group.directory.display(),
                kept = %group.kept().path.display(),
                duplicates = group.removed().len(),
                "keeping best copy"
            );
        }

        for removal in &plan.removals {
            if self.audit {
                tracing::info!(path = %removal.path.display(), kind = %removal.kind, "would delete");
                summary.would_delete += 1;
                continue;
            }

            let result = if removal.is_dir {
                fs::remove_dir_all(&removal.path)
            } else {
                fs::remove_file(&removal.path)
            };
            match result {
                Ok(()) => {
                    tracing::info!(path = %removal.path.display(), kind = %removal.kind, "deleted");
                    summary.deleted += 1;
                    summary.bytes_freed += removal.size_bytes;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %removal.path.display(), error = %e, "could not delete");
                    summary.errors += 1;
                }
            }
        }

        summary
    }

    /// Plans and applies in one go.
    pub fn run(&self) -> Result<(DedupPlan, DedupSummary), DedupError> {
        let plan = self.plan()?;
        let summary = self.apply(&plan);
        Ok((plan, summary))
    }
}
