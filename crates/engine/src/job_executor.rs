//! Job executor: drives one file through the transcode state machine.
//!
//! ```text
//! Pending -> Probing -> Classifying -> Skipped
//!                                   -> Encoding -> Verifying -> Replaced
//!                                                            -> SkipMarked
//!                                                            -> Failed
//! ```
//!
//! Work is split in two halves. [`JobExecutor::plan`] runs on the
//! coordinator: marker check, probe, optional deep scan and classification.
//! [`JobExecutor::encode`] runs once a worker slot is held: free-space
//! pre-flight, the encoder process, verification, a check that the source
//! was not modified meanwhile, and the replace or skip-mark decision. Every per-file error ends the job as `Failed` without
//! touching the original.

use crate::classify::{classify, needs_deep_scan, ClassificationResult, Thresholds};
use crate::cleanup::TempRegistry;
use crate::concurrency::SlotGuard;
use crate::disk::{check_free_space, SpaceCheck};
use crate::encode::{EncodeError, EncodeRequest, TranscodeWorker};
use crate::probe::{DeepScanWindow, MediaDescriptor, MediaProber, ProbeError};
use crate::replace::{final_path, output_file_name, replace_original, ReplaceError};
use crate::scan::ScanCandidate;
use crate::size_gate::{check_size_gate, SizeGateResult};
use crate::skip_marker::{MarkerScope, SkipMarker, SkipMarkerStore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use vidshrink_config::Config;

/// Per-file failures. None of these stop the run.
#[derive(Debug, Error)]
pub enum JobError {
    /// The metadata oracle failed or its output was unusable
    #[error("Probe failed: {0}")]
    ProbeFailed(#[from] ProbeError),

    /// Not enough room for the encoder output
    #[error("Insufficient disk space: {available} bytes free, {required} required")]
    InsufficientDiskSpace { available: u64, required: u64 },

    /// The encoder could not be run
    #[error("Encoder error: {0}")]
    Worker(EncodeError),

    /// The encoder ran but produced no usable output
    #[error("Encode failed (exit code {exit_code:?}): {message}")]
    EncodeFailed {
        exit_code: Option<i32>,
        message: String,
    },

    /// The source was modified while it was being encoded
    #[error("Source changed during encode: {0}")]
    SourceChanged(PathBuf),

    /// Swapping the output in failed
    #[error("Replacement failed: {0}")]
    Replacement(#[from] ReplaceError),

    /// Failed to write skip marker
    #[error("Failed to write skip marker: {0}")]
    SkipMarkerFailed(std::io::Error),

    /// The run was cancelled while this job was active
    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Stable snake_case name used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ProbeFailed(_) => "probe_failed",
            JobError::InsufficientDiskSpace { .. } => "insufficient_disk_space",
            JobError::Worker(_) | JobError::EncodeFailed { .. } => "encode_failed",
            JobError::SourceChanged(_) => "source_changed",
            JobError::Replacement(_) => "replace_failed",
            JobError::SkipMarkerFailed(_) => "skip_marker_failed",
            JobError::Interrupted => "interrupted",
            JobError::Io(_) => "io",
        }
    }
}

impl From<EncodeError> for JobError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Interrupted => JobError::Interrupted,
            other => JobError::Worker(other),
        }
    }
}

/// Job state representing the current stage in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Probing,
    Classifying,
    Skipped,
    Encoding,
    Verifying,
    Replaced,
    SkipMarked,
    Failed,
}

impl JobState {
    /// Convert state to string for reports
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Probing => "probing",
            JobState::Classifying => "classifying",
            JobState::Skipped => "skipped",
            JobState::Encoding => "encoding",
            JobState::Verifying => "verifying",
            JobState::Replaced => "replaced",
            JobState::SkipMarked => "skip_marked",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Skipped | JobState::Replaced | JobState::SkipMarked | JobState::Failed
        )
    }
}

/// Transient record of one file's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub source: PathBuf,
    pub temp_output: Option<PathBuf>,
    /// Worker slot the encode ran in.
    pub slot: Option<usize>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub size_before: u64,
    pub size_after: Option<u64>,
}

impl JobRecord {
    pub fn new(source: PathBuf, size_before: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            temp_output: None,
            slot: None,
            state: JobState::Pending,
            exit_code: None,
            size_before,
            size_after: None,
        }
    }
}

/// Why a file was left alone before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// A skip marker covers the file; it was never probed.
    Marker { marker: SkipMarker },
    /// AV1 source.
    Excluded,
    /// Already meets every target.
    Compliant,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Skipped {
        reason: SkipReason,
    },
    Replaced {
        destination: PathBuf,
    },
    /// The output was not smaller; a marker now excludes the file.
    SkipMarked {
        scope: MarkerScope,
        key: String,
    },
    Failed {
        kind: String,
        message: String,
    },
}

impl JobOutcome {
    fn failed(error: &JobError) -> Self {
        JobOutcome::Failed {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, JobOutcome::Failed { kind, .. } if kind == "interrupted")
    }
}

/// A finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub record: JobRecord,
    pub outcome: JobOutcome,
    /// Classification triggers, empty when the file was never classified.
    pub reasons: Vec<String>,
}

/// A classified file waiting for a worker slot.
#[derive(Debug, Clone)]
pub struct PendingEncode {
    pub record: JobRecord,
    pub descriptor: MediaDescriptor,
    pub classification: ClassificationResult,
    /// Source modification time when the file was scanned.
    pub modified_time: SystemTime,
}

/// Result of the coordinator half of a job.
#[derive(Debug, Clone)]
pub enum JobPlan {
    /// Terminal already (skipped or failed).
    Done(JobReport),
    Encode(Box<PendingEncode>),
}

/// Per-run settings for the executor.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub thresholds: Thresholds,
    pub window: DeepScanWindow,
    /// Output container extension.
    pub container: String,
    /// Directory for temp outputs; `None` writes next to the source.
    pub temp_dir: Option<PathBuf>,
    pub min_free_bytes: u64,
    /// Scope of markers written after a non-reducing encode.
    pub marker_scope: MarkerScope,
}

impl JobSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            thresholds: Thresholds::from_config(cfg),
            window: DeepScanWindow {
                frames: cfg.probe.deep_scan_frames,
                skip_offset_secs: cfg.probe.skip_offset_secs,
            },
            container: cfg.encode.container.to_lowercase(),
            temp_dir: cfg.encode.temp_dir.clone(),
            min_free_bytes: cfg.disk.min_free_bytes,
            marker_scope: cfg.markers.name_scope.into(),
        }
    }
}

/// Temp output location next to the source, or inside `temp_dir` when one
/// is configured. The job id makes the name unique per job.
pub fn temp_output_path(
    source: &Path,
    id: &Uuid,
    container: &str,
    temp_dir: Option<&Path>,
) -> PathBuf {
    let name = output_file_name(source, &id.simple().to_string(), container);
    match temp_dir {
        Some(dir) => dir.join(name),
        None => source.parent().unwrap_or(Path::new(".")).join(name),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Runs jobs against a prober, a worker and the marker store.
pub struct JobExecutor {
    prober: Arc<dyn MediaProber>,
    worker: Arc<dyn TranscodeWorker>,
    markers: SkipMarkerStore,
    settings: JobSettings,
    temps: TempRegistry,
}

impl JobExecutor {
    pub fn new(
        prober: Arc<dyn MediaProber>,
        worker: Arc<dyn TranscodeWorker>,
        markers: SkipMarkerStore,
        settings: JobSettings,
        temps: TempRegistry,
    ) -> Self {
        Self {
            prober,
            worker,
            markers,
            settings,
            temps,
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn temps(&self) -> &TempRegistry {
        &self.temps
    }

    fn finish(mut record: JobRecord, state: JobState, outcome: JobOutcome, reasons: Vec<String>) -> JobReport {
        record.state = state;
        JobReport {
            record,
            outcome,
            reasons,
        }
    }

    fn fail(record: JobRecord, error: JobError, reasons: Vec<String>) -> JobReport {
        if matches!(error, JobError::Interrupted) {
            tracing::info!(path = %record.source.display(), "job interrupted");
        } else {
            tracing::warn!(path = %record.source.display(), error = %error, "job failed");
        }
        Self::finish(record, JobState::Failed, JobOutcome::failed(&error), reasons)
    }

    /// Marker check, probe and classification.
    pub async fn plan(&self, candidate: &ScanCandidate) -> JobPlan {
        let mut record = JobRecord::new(candidate.path.clone(), candidate.size_bytes);
        let path = candidate.path.as_path();

        if let Some(marker) = self.markers.is_skipped(path) {
            tracing::info!(path = %path.display(), scope = %marker.scope, "skipped by marker");
            return JobPlan::Done(Self::finish(
                record,
                JobState::Skipped,
                JobOutcome::Skipped {
                    reason: SkipReason::Marker { marker },
                },
                Vec::new(),
            ));
        }

        record.state = JobState::Probing;
        let descriptor = match self.prober.probe(path).await {
            Ok(d) => d,
            Err(e) => return JobPlan::Done(Self::fail(record, e.into(), Vec::new())),
        };

        let scan = if needs_deep_scan(&descriptor) {
            tracing::debug!(path = %path.display(), "field order inconclusive, running deep scan");
            match self.prober.deep_scan(path, &self.settings.window).await {
                Ok(scan) => Some(scan),
                Err(e) => return JobPlan::Done(Self::fail(record, e.into(), Vec::new())),
            }
        } else {
            None
        };

        record.state = JobState::Classifying;
        let classification = classify(&descriptor, &self.settings.thresholds, scan.as_ref());
        let reasons = classification.reasons.clone();

        if classification.excluded {
            tracing::info!(path = %path.display(), "av1 source, leaving alone");
            return JobPlan::Done(Self::finish(
                record,
                JobState::Skipped,
                JobOutcome::Skipped {
                    reason: SkipReason::Excluded,
                },
                reasons,
            ));
        }
        if !classification.should_process() {
            tracing::info!(path = %path.display(), "already compliant");
            return JobPlan::Done(Self::finish(
                record,
                JobState::Skipped,
                JobOutcome::Skipped {
                    reason: SkipReason::Compliant,
                },
                reasons,
            ));
        }

        tracing::info!(
            path = %path.display(),
            status = %classification.interlace_status,
            reasons = ?classification.reasons,
            "queued for encode"
        );
        JobPlan::Encode(Box::new(PendingEncode {
            record,
            descriptor,
            classification,
            modified_time: candidate.modified_time,
        }))
    }

    /// Whether the source still has the size and mtime it was scanned with.
    fn source_unchanged(source: &Path, size: u64, modified: SystemTime) -> bool {
        std::fs::metadata(source)
            .map(|m| m.len() == size && m.modified().map(|t| t == modified).unwrap_or(true))
            .unwrap_or(false)
    }

    /// Encoder half; the slot is held until this returns.
    pub async fn encode(
        &self,
        pending: PendingEncode,
        slot: SlotGuard,
        cancel: &CancellationToken,
    ) -> JobReport {
        let PendingEncode {
            mut record,
            descriptor,
            classification,
            modified_time,
        } = pending;
        let reasons = classification.reasons.clone();
        record.slot = Some(slot.slot());

        if cancel.is_cancelled() {
            return Self::fail(record, JobError::Interrupted, reasons);
        }

        let source = record.source.clone();
        let temp = temp_output_path(
            &source,
            &record.id,
            &self.settings.container,
            self.settings.temp_dir.as_deref(),
        );
        record.temp_output = Some(temp.clone());
        record.state = JobState::Encoding;

        let temp_parent = temp.parent().unwrap_or(Path::new("."));
        if let Err(e) = std::fs::create_dir_all(temp_parent) {
            return Self::fail(record, e.into(), reasons);
        }
        if let SpaceCheck::Insufficient { available, required } =
            check_free_space(temp_parent, self.settings.min_free_bytes)
        {
            return Self::fail(
                record,
                JobError::InsufficientDiskSpace {
                    available,
                    required,
                },
                reasons,
            );
        }

        if let Err(e) = remove_if_exists(&temp) {
            return Self::fail(record, e.into(), reasons);
        }
        self.temps.register(&temp);

        let request = EncodeRequest::from_classification(
            source.clone(),
            temp.clone(),
            &descriptor,
            &classification,
            self.settings.thresholds.ceiling_for_width(descriptor.width),
        );

        tracing::info!(path = %source.display(), slot = slot.slot(), "encoding");
        let output = self.worker.transcode(&request, cancel).await;

        record.state = JobState::Verifying;
        let output = match output {
            Ok(o) => o,
            Err(e) => {
                self.discard_temp(&temp);
                return Self::fail(record, e.into(), reasons);
            }
        };
        record.exit_code = output.exit_code;

        let output_bytes = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        if !output.success() || output_bytes == 0 {
            self.discard_temp(&temp);
            let message = if !output.success() {
                output.stderr_tail().to_string()
            } else {
                "output missing or empty".to_string()
            };
            return Self::fail(
                record,
                JobError::EncodeFailed {
                    exit_code: output.exit_code,
                    message,
                },
                reasons,
            );
        }
        record.size_after = Some(output_bytes);

        if !Self::source_unchanged(&source, record.size_before, modified_time) {
            self.discard_temp(&temp);
            return Self::fail(record, JobError::SourceChanged(source), reasons);
        }

        match check_size_gate(record.size_before, output_bytes) {
            SizeGateResult::Accept => self.replace(record, &temp, reasons),
            SizeGateResult::Reject { ratio, .. } => {
                tracing::info!(
                    path = %source.display(),
                    before = record.size_before,
                    after = output_bytes,
                    ratio,
                    "output not smaller, marking"
                );
                self.discard_temp(&temp);
                self.skip_mark(record, reasons)
            }
        }
    }

    fn replace(&self, record: JobRecord, temp: &Path, reasons: Vec<String>) -> JobReport {
        let destination = final_path(&record.source, &self.settings.container);
        match replace_original(&record.source, temp, &destination) {
            Ok(()) => {
                self.temps.release(temp);
                tracing::info!(
                    path = %destination.display(),
                    before = record.size_before,
                    after = record.size_after.unwrap_or(0),
                    "replaced"
                );
                Self::finish(
                    record,
                    JobState::Replaced,
                    JobOutcome::Replaced { destination },
                    reasons,
                )
            }
            Err(e) if e.original_replaced() => {
                self.temps.release(temp);
                tracing::warn!(path = %destination.display(), error = %e, "replaced, but attributes not restored");
                Self::finish(
                    record,
                    JobState::Replaced,
                    JobOutcome::Replaced { destination },
                    reasons,
                )
            }
            Err(ReplaceError::Move { staged, source }) => {
                // Original is gone; the staged output is the only copy left
                self.temps.release(temp);
                self.temps.preserve(&staged);
                tracing::error!(
                    source = %record.source.display(),
                    output = %staged.display(),
                    "could not move output into place, keeping it for recovery"
                );
                Self::fail(
                    record,
                    ReplaceError::Move { staged, source }.into(),
                    reasons,
                )
            }
            Err(e) => {
                self.discard_temp(temp);
                Self::fail(record, e.into(), reasons)
            }
        }
    }

    fn skip_mark(&self, record: JobRecord, reasons: Vec<String>) -> JobReport {
        let scope = self.settings.marker_scope;
        let Some(key) = SkipMarkerStore::key_for(scope, &record.source) else {
            let error = JobError::SkipMarkerFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "file name yields no marker key",
            ));
            return Self::fail(record, error, reasons);
        };
        match self.markers.mark_skipped(scope, &key) {
            Ok(_) => Self::finish(
                record,
                JobState::SkipMarked,
                JobOutcome::SkipMarked { scope, key },
                reasons,
            ),
            Err(e) => Self::fail(record, JobError::SkipMarkerFailed(e), reasons),
        }
    }

    fn discard_temp(&self, temp: &Path) {
        if let Err(e) = remove_if_exists(temp) {
            tracing::warn!(path = %temp.display(), error = %e, "could not remove temp output");
        }
        self.temps.release(temp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::WorkerSlots;
    use crate::probe::FieldOrder;
    use crate::testing::{descriptor, tagged_files, write_sized, FakeProber, FakeWorker};
    use std::fs;
    use tempfile::TempDir;
    use vidshrink_config::{MarkersConfig, NameScope};

    fn settings() -> JobSettings {
        let mut cfg = Config::default();
        cfg.disk.min_free_bytes = 0;
        JobSettings::from_config(&cfg)
    }

    fn executor(root: &Path, prober: FakeProber, worker: FakeWorker) -> JobExecutor {
        executor_with(root, prober, worker, settings())
    }

    fn executor_with(
        root: &Path,
        prober: FakeProber,
        worker: FakeWorker,
        settings: JobSettings,
    ) -> JobExecutor {
        JobExecutor::new(
            Arc::new(prober),
            Arc::new(worker),
            SkipMarkerStore::from_config(root, &MarkersConfig::default()),
            settings,
            TempRegistry::new(),
        )
    }

    fn candidate(path: &Path) -> ScanCandidate {
        let meta = fs::metadata(path).unwrap();
        ScanCandidate {
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            modified_time: meta.modified().unwrap(),
        }
    }

    async fn run_one(exec: &JobExecutor, path: &Path) -> JobReport {
        match exec.plan(&candidate(path)).await {
            JobPlan::Done(report) => report,
            JobPlan::Encode(pending) => {
                let slots = WorkerSlots::new(1);
                let slot = slots.acquire().await.unwrap();
                exec.encode(*pending, slot, &CancellationToken::new()).await
            }
        }
    }

    #[test]
    fn test_temp_output_path() {
        let id = Uuid::parse_str("1a2b3c4d-0000-4000-8000-000000000000").unwrap();
        assert_eq!(
            temp_output_path(Path::new("/tv/Show S01E01.ts"), &id, "mkv", None),
            PathBuf::from("/tv/Show S01E01.ts [Trans] 1a2b3c4d.mkv")
        );
        assert_eq!(
            temp_output_path(Path::new("/tv/a.mkv"), &id, "mkv", Some(Path::new("/scratch"))),
            PathBuf::from("/scratch/a.mkv [Trans] 1a2b3c4d.mkv")
        );
    }

    #[test]
    fn test_same_named_sources_get_distinct_temps() {
        let scratch = Some(Path::new("/scratch"));
        let a = temp_output_path(Path::new("/tv/ShowA/Episode 1.mkv"), &Uuid::new_v4(), "mkv", scratch);
        let b = temp_output_path(Path::new("/tv/ShowB/Episode 1.mkv"), &Uuid::new_v4(), "mkv", scratch);
        assert_ne!(a, b);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Replaced.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Encoding.is_terminal());
        assert_eq!(JobState::SkipMarked.as_str(), "skip_marked");
    }

    #[tokio::test]
    async fn test_interlaced_h264_is_replaced_when_smaller() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober.clone(), FakeWorker::producing(1500));

        let report = run_one(&exec, &source).await;

        assert_eq!(report.record.state, JobState::Replaced);
        assert_eq!(report.outcome, JobOutcome::Replaced { destination: source.clone() });
        assert_eq!(fs::metadata(&source).unwrap().len(), 1500);
        assert_eq!(report.record.size_before, 2000);
        assert_eq!(report.record.size_after, Some(1500));
        assert_eq!(report.record.slot, Some(0));
        assert!(tagged_files(temp.path()).is_empty());
        assert_eq!(exec.temps().active_count(), 0);
    }

    #[tokio::test]
    async fn test_larger_output_marks_and_keeps_original() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);
        let before = fs::read(&source).unwrap();

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober.clone(), FakeWorker::producing(2100));

        let report = run_one(&exec, &source).await;

        assert_eq!(report.record.state, JobState::SkipMarked);
        assert_eq!(
            report.outcome,
            JobOutcome::SkipMarked {
                scope: MarkerScope::Show,
                key: "Show".to_string()
            }
        );
        assert_eq!(fs::read(&source).unwrap(), before);
        assert!(tagged_files(temp.path()).is_empty());

        // The marker now keeps the file from being probed again
        let probes = prober.probe_calls();
        let again = run_one(&exec, &source).await;
        assert!(matches!(
            again.outcome,
            JobOutcome::Skipped {
                reason: SkipReason::Marker { .. }
            }
        ));
        assert_eq!(prober.probe_calls(), probes);
    }

    #[tokio::test]
    async fn test_equal_size_is_not_replaced() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Progressive));
        let exec = executor(temp.path(), prober, FakeWorker::producing(2000));

        let report = run_one(&exec, &source).await;
        assert_eq!(report.record.state, JobState::SkipMarked);
    }

    #[tokio::test]
    async fn test_compliant_file_is_skipped_without_encoding() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let worker = FakeWorker::producing(10);
        let prober = FakeProber::new(descriptor("hevc", 1_000_000, "aac", FieldOrder::Progressive));
        let exec = executor(temp.path(), prober, worker.clone());

        let report = run_one(&exec, &source).await;
        assert_eq!(
            report.outcome,
            JobOutcome::Skipped {
                reason: SkipReason::Compliant
            }
        );
        assert_eq!(worker.calls(), 0);
    }

    #[tokio::test]
    async fn test_av1_is_excluded() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("av1", 9_000_000, "opus", FieldOrder::Unknown));
        let exec = executor(temp.path(), prober.clone(), FakeWorker::producing(10));

        let report = run_one(&exec, &source).await;
        assert_eq!(
            report.outcome,
            JobOutcome::Skipped {
                reason: SkipReason::Excluded
            }
        );
        assert_eq!(prober.deep_scan_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_field_order_runs_deep_scan() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("hevc", 1_000_000, "aac", FieldOrder::Unknown));
        let exec = executor(temp.path(), prober.clone(), FakeWorker::producing(10));

        let report = run_one(&exec, &source).await;
        assert_eq!(prober.deep_scan_calls(), 1);
        // The fake scan finds only progressive frames
        assert_eq!(report.record.state, JobState::Skipped);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_file_untouched() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let exec = executor(temp.path(), FakeProber::failing(), FakeWorker::producing(10));
        let report = run_one(&exec, &source).await;

        assert_eq!(report.record.state, JobState::Failed);
        assert!(matches!(report.outcome, JobOutcome::Failed { ref kind, .. } if kind == "probe_failed"));
        assert_eq!(fs::metadata(&source).unwrap().len(), 2000);
    }

    #[tokio::test]
    async fn test_failed_encode_removes_temp() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober, FakeWorker::exiting(1, 500));

        let report = run_one(&exec, &source).await;

        assert_eq!(report.record.state, JobState::Failed);
        assert_eq!(report.record.exit_code, Some(1));
        assert!(tagged_files(temp.path()).is_empty());
        assert_eq!(fs::metadata(&source).unwrap().len(), 2000);
    }

    #[tokio::test]
    async fn test_empty_output_fails_verification() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober, FakeWorker::producing(0));

        let report = run_one(&exec, &source).await;
        assert!(matches!(report.outcome, JobOutcome::Failed { ref kind, .. } if kind == "encode_failed"));
        assert_eq!(fs::metadata(&source).unwrap().len(), 2000);
    }

    #[tokio::test]
    async fn test_source_modified_during_encode_is_not_replaced() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober, FakeWorker::producing(1500));

        let JobPlan::Encode(pending) = exec.plan(&candidate(&source)).await else {
            panic!("expected an encode");
        };
        write_sized(&source, 2500);

        let slots = WorkerSlots::new(1);
        let report = exec
            .encode(*pending, slots.acquire().await.unwrap(), &CancellationToken::new())
            .await;

        assert!(matches!(report.outcome, JobOutcome::Failed { ref kind, .. } if kind == "source_changed"));
        assert_eq!(fs::metadata(&source).unwrap().len(), 2500);
        assert!(tagged_files(temp.path()).is_empty());
        assert_eq!(exec.temps().active_count(), 0);
    }

    #[tokio::test]
    async fn test_directory_marker_covers_sibling_episodes() {
        let temp = TempDir::new().unwrap();
        let season = temp.path().join("Show/Season 1");
        let source = season.join("Show S01E01.mkv");
        let sibling = season.join("Show S01E02.mkv");
        write_sized(&source, 2000);
        write_sized(&sibling, 2000);

        let mut cfg = Config::default();
        cfg.disk.min_free_bytes = 0;
        cfg.markers.name_scope = NameScope::Directory;
        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor_with(
            temp.path(),
            prober.clone(),
            FakeWorker::producing(2100),
            JobSettings::from_config(&cfg),
        );

        let report = run_one(&exec, &source).await;
        assert_eq!(
            report.outcome,
            JobOutcome::SkipMarked {
                scope: MarkerScope::Directory,
                key: season.to_string_lossy().to_string(),
            }
        );
        assert!(season.join(".vidshrink-skip").exists());

        let probes = prober.probe_calls();
        let again = run_one(&exec, &sibling).await;
        assert!(matches!(
            again.outcome,
            JobOutcome::Skipped {
                reason: SkipReason::Marker { .. }
            }
        ));
        assert_eq!(prober.probe_calls(), probes);
    }

    #[tokio::test]
    async fn test_container_change_lands_on_canonical_name() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.ts");
        write_sized(&source, 2000);

        let prober = FakeProber::new(descriptor("mpeg2video", 8_000_000, "ac3", FieldOrder::Tt));
        let exec = executor(temp.path(), prober, FakeWorker::producing(1500));

        let report = run_one(&exec, &source).await;
        let dest = temp.path().join("Show S01E01.mkv");
        assert_eq!(report.outcome, JobOutcome::Replaced { destination: dest.clone() });
        assert!(!source.exists());
        assert_eq!(fs::metadata(&dest).unwrap().len(), 1500);
    }

    #[tokio::test]
    async fn test_cancelled_before_encode() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("Show S01E01.mkv");
        write_sized(&source, 2000);

        let worker = FakeWorker::producing(1500);
        let prober = FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt));
        let exec = executor(temp.path(), prober, worker.clone());

        let JobPlan::Encode(pending) = exec.plan(&candidate(&source)).await else {
            panic!("expected an encode");
        };
        let slots = WorkerSlots::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = exec.encode(*pending, slots.acquire().await.unwrap(), &cancel).await;

        assert!(report.outcome.is_interrupted());
        assert_eq!(worker.calls(), 0);
        assert_eq!(fs::metadata(&source).unwrap().len(), 2000);
    }
}
