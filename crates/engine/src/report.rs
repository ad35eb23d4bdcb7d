//! Run reporting: per-file records and the end-of-run summary.
//!
//! Every finished job becomes one [`FileReport`], written as a JSON line
//! when a report file is configured. [`RunSummary`] aggregates the counts
//! printed at the end of a run.

use crate::job_executor::{JobOutcome, JobReport, JobState};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One JSON line per processed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileReport {
    pub timestamp_unix_ms: i64,
    pub job_id: String,
    pub path: String,
    pub state: JobState,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    pub size_before: u64,
    pub size_after: Option<u64>,
    pub slot: Option<usize>,
    pub exit_code: Option<i32>,
    pub reasons: Vec<String>,
}

impl From<&JobReport> for FileReport {
    fn from(report: &JobReport) -> Self {
        Self {
            timestamp_unix_ms: timestamp_ms(),
            job_id: report.record.id.to_string(),
            path: report.record.source.to_string_lossy().to_string(),
            state: report.record.state,
            outcome: report.outcome.clone(),
            size_before: report.record.size_before,
            size_after: report.record.size_after,
            slot: report.record.slot,
            exit_code: report.record.exit_code,
            reasons: report.reasons.clone(),
        }
    }
}

fn timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Appends [`FileReport`] lines to a file.
pub struct ReportWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ReportWriter {
    /// Creates (or truncates) the report file.
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(File::create(path)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line and flushes, so a crash loses at most the current line.
    pub fn write(&mut self, report: &FileReport) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, report)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Aggregate counts for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// Candidates the walker yielded.
    pub checked: u64,
    pub skipped: u64,
    pub replaced: u64,
    pub skip_marked: u64,
    pub failed: u64,
    pub interrupted: u64,
    /// Total size of replaced originals.
    pub bytes_before: u64,
    /// Total size of their replacements.
    pub bytes_after: u64,
    /// Leftovers removed by the cleanup sweeps and temp registry.
    pub leftovers_removed: u64,
    /// Outputs of interrupted replacements moved into place by the sweeps.
    pub recovered: u64,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn record(&mut self, report: &JobReport) {
        match &report.outcome {
            JobOutcome::Skipped { .. } => self.skipped += 1,
            JobOutcome::Replaced { .. } => {
                self.replaced += 1;
                self.bytes_before += report.record.size_before;
                self.bytes_after += report.record.size_after.unwrap_or(0);
            }
            JobOutcome::SkipMarked { .. } => self.skip_marked += 1,
            outcome if outcome.is_interrupted() => self.interrupted += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
        }
    }

    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }

    /// Every candidate reached a terminal state.
    pub fn is_balanced(&self) -> bool {
        self.checked
            == self.skipped + self.replaced + self.skip_marked + self.failed + self.interrupted
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checked {}, skipped {}, replaced {}, skip-marked {}, failed {}",
            self.checked, self.skipped, self.replaced, self.skip_marked, self.failed
        )?;
        if self.interrupted > 0 {
            write!(f, ", interrupted {}", self.interrupted)?;
        }
        if self.recovered > 0 {
            write!(f, ", recovered {}", self.recovered)?;
        }
        write!(f, "; saved {} bytes", self.bytes_saved())
    }
}
