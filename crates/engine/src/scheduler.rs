//! Run coordinator for one library root.
//!
//! A single coordinator walks the library, plans each candidate (marker
//! check, probe, classification) and hands encodes to a bounded pool of
//! worker slots. Admission blocks while every slot is busy. On end of input
//! or cancellation it stops admitting, waits for in-flight jobs, removes
//! their temp outputs if any remain, and sweeps tagged leftovers. Sweeps of
//! the library finish replacements that a crash cut short.

use crate::cleanup::{sweep_tagged, SweepMode, TempRegistry};
use crate::concurrency::{ConcurrencyPlan, WorkerSlots};
use crate::encode::TranscodeWorker;
use crate::job_executor::{JobExecutor, JobPlan, JobReport, JobSettings};
use crate::probe::MediaProber;
use crate::replace::OUTPUT_TAG;
use crate::report::{FileReport, ReportWriter, RunSummary};
use crate::scan::FileWalker;
use crate::skip_marker::SkipMarkerStore;
use crate::startup::StartupError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use vidshrink_config::{Config, ConfigError};

/// Fatal errors: anything that stops a run before or outside per-file work.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Library root not found: {0}")]
    RootNotFound(PathBuf),

    #[error("Report error: {0}")]
    Report(#[from] std::io::Error),
}

/// Bounded-concurrency scheduler over one library root.
pub struct JobScheduler {
    walker: FileWalker,
    executor: Arc<JobExecutor>,
    slots: WorkerSlots,
    temps: TempRegistry,
    processed_tags: Vec<String>,
    temp_dir: Option<PathBuf>,
}

impl JobScheduler {
    pub fn new(walker: FileWalker, executor: JobExecutor, max_concurrent_jobs: usize) -> Self {
        let temps = executor.temps().clone();
        let temp_dir = executor.settings().temp_dir.clone();
        Self {
            walker,
            executor: Arc::new(executor),
            slots: WorkerSlots::new(max_concurrent_jobs),
            temps,
            processed_tags: vec![OUTPUT_TAG.to_string()],
            temp_dir,
        }
    }

    /// Wires the pipeline for `root` from configuration.
    pub fn from_config(
        root: &Path,
        cfg: &Config,
        prober: Arc<dyn MediaProber>,
        worker: Arc<dyn TranscodeWorker>,
    ) -> Self {
        let plan = ConcurrencyPlan::derive(cfg);
        let executor = JobExecutor::new(
            prober,
            worker,
            SkipMarkerStore::from_config(root, &cfg.markers),
            JobSettings::from_config(cfg),
            TempRegistry::new(),
        );
        let mut scheduler = Self::new(
            FileWalker::from_config(root, &cfg.scan),
            executor,
            plan.max_concurrent_jobs as usize,
        );
        scheduler.processed_tags = cfg.scan.processed_tags.clone();
        if !scheduler.processed_tags.iter().any(|t| t == OUTPUT_TAG) {
            scheduler.processed_tags.push(OUTPUT_TAG.to_string());
        }
        scheduler
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Scratch directory first, so a temp dir inside the library is never
    /// mistaken for library content.
    fn sweep(&self, summary: &mut RunSummary) {
        let keep = self.temps.preserved();
        let mut roots = Vec::new();
        if let Some(dir) = &self.temp_dir {
            if dir.exists() {
                roots.push((dir.as_path(), SweepMode::Scratch));
            }
        }
        roots.push((self.walker.root(), SweepMode::Library));
        for (root, mode) in roots {
            let stats = sweep_tagged(root, &self.processed_tags, &keep, mode);
            summary.leftovers_removed += (stats.files_removed + stats.dirs_removed) as u64;
            summary.recovered += stats.recovered as u64;
        }
    }

    fn record(
        &self,
        report: &JobReport,
        summary: &mut RunSummary,
        sink: &mut Option<&mut ReportWriter>,
    ) {
        summary.record(report);
        if let Some(writer) = sink.as_deref_mut() {
            if let Err(e) = writer.write(&FileReport::from(report)) {
                tracing::warn!(path = %writer.path().display(), error = %e, "could not write report line");
            }
        }
    }

    /// Processes the whole library once.
    ///
    /// Per-file failures are counted, never returned. Cancellation stops
    /// admissions, kills running encoders and still runs the cleanup.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        mut sink: Option<&mut ReportWriter>,
    ) -> Result<RunSummary, RunError> {
        let root = self.walker.root();
        if !root.is_dir() {
            return Err(RunError::RootNotFound(root.to_path_buf()));
        }

        let mut summary = RunSummary::default();
        self.sweep(&mut summary);

        tracing::info!(root = %root.display(), slots = self.capacity(), "run started");

        let mut jobs: JoinSet<JobReport> = JoinSet::new();

        // Collected up front: replacements rename files inside directories
        // that a lazy walk would still be reading
        for candidate in self.walker.walk_sorted() {
            if cancel.is_cancelled() {
                break;
            }
            summary.checked += 1;

            while let Some(done) = jobs.try_join_next() {
                self.collect(done, &mut summary, &mut sink);
            }

            let plan = tokio::select! {
                plan = self.executor.plan(&candidate) => plan,
                _ = cancel.cancelled() => {
                    summary.interrupted += 1;
                    break;
                }
            };

            let pending = match plan {
                JobPlan::Done(report) => {
                    self.record(&report, &mut summary, &mut sink);
                    continue;
                }
                JobPlan::Encode(pending) => pending,
            };

            let slot = tokio::select! {
                slot = self.slots.acquire() => slot,
                _ = cancel.cancelled() => None,
            };
            let Some(slot) = slot else {
                summary.interrupted += 1;
                break;
            };

            let executor = Arc::clone(&self.executor);
            let job_cancel = cancel.clone();
            jobs.spawn(async move { executor.encode(*pending, slot, &job_cancel).await });
        }

        if cancel.is_cancelled() {
            tracing::info!(in_flight = jobs.len(), "cancelled, waiting for running jobs");
        }
        while let Some(done) = jobs.join_next().await {
            self.collect(done, &mut summary, &mut sink);
        }

        summary.leftovers_removed += self.temps.remove_all() as u64;
        self.sweep(&mut summary);
        summary.cancelled = cancel.is_cancelled();

        tracing::info!(
            checked = summary.checked,
            replaced = summary.replaced,
            skip_marked = summary.skip_marked,
            failed = summary.failed,
            saved_bytes = summary.bytes_saved(),
            "run finished"
        );
        Ok(summary)
    }

    fn collect(
        &self,
        done: Result<JobReport, tokio::task::JoinError>,
        summary: &mut RunSummary,
        sink: &mut Option<&mut ReportWriter>,
    ) {
        match done {
            Ok(report) => self.record(&report, summary, sink),
            Err(e) => {
                tracing::error!(error = %e, "job task panicked");
                summary.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FieldOrder;
    use crate::skip_marker::MarkerScope;
    use crate::testing::{descriptor, stamp_for, tagged_files, write_sized, FakeProber, FakeWorker};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(max_jobs: u32) -> Config {
        let mut cfg = Config::default();
        cfg.scan.min_size_bytes = 1;
        cfg.disk.min_free_bytes = 0;
        cfg.scheduler.max_concurrent_jobs = max_jobs;
        cfg
    }

    fn scheduler(root: &Path, cfg: &Config, prober: &FakeProber, worker: &FakeWorker) -> JobScheduler {
        JobScheduler::from_config(
            root,
            cfg,
            Arc::new(prober.clone()),
            Arc::new(worker.clone()),
        )
    }

    fn interlaced() -> FakeProber {
        FakeProber::new(descriptor("h264", 8_000_000, "aac", FieldOrder::Tt))
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let temp = TempDir::new().unwrap();
        for i in 0..6 {
            write_sized(&temp.path().join(format!("Show{} S01E01.mkv", i)), 2000);
        }

        let worker = FakeWorker::producing(1500).with_delay(Duration::from_millis(30));
        let sched = scheduler(temp.path(), &config(2), &interlaced(), &worker);
        let summary = sched.run(CancellationToken::new(), None).await.unwrap();

        assert_eq!(summary.checked, 6);
        assert_eq!(summary.replaced, 6);
        assert_eq!(worker.calls(), 6);
        assert!(worker.max_active() <= 2);
        assert_eq!(worker.max_active(), 2);
        assert!(summary.is_balanced());
    }

    #[tokio::test]
    async fn test_marked_show_is_never_probed() {
        let temp = TempDir::new().unwrap();
        write_sized(&temp.path().join("Frasier S01E01.mkv"), 2000);
        write_sized(&temp.path().join("Frasier S01E02.mkv"), 2000);

        let cfg = config(2);
        SkipMarkerStore::from_config(temp.path(), &cfg.markers)
            .mark_skipped(MarkerScope::Show, "Frasier")
            .unwrap();

        let prober = interlaced();
        let worker = FakeWorker::producing(1500);
        let summary = scheduler(temp.path(), &cfg, &prober, &worker)
            .run(CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 2);
        assert_eq!(prober.probe_calls(), 0);
        assert_eq!(worker.calls(), 0);
    }

    #[tokio::test]
    async fn test_end_to_end_replace_and_skip_mark() {
        let temp = TempDir::new().unwrap();
        let replaced = temp.path().join("Cheers/Cheers S01E01.mkv");
        write_sized(&replaced, 2000);

        let cfg = config(1);
        let sched = scheduler(temp.path(), &cfg, &interlaced(), &FakeWorker::producing(1500));
        let summary = sched.run(CancellationToken::new(), None).await.unwrap();
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.bytes_saved(), 500);
        assert_eq!(fs::metadata(&replaced).unwrap().len(), 1500);

        let kept = temp.path().join("Frasier/Frasier S01E01.mkv");
        write_sized(&kept, 2000);
        let original = fs::read(&kept).unwrap();
        let prober = interlaced();
        let sched = scheduler(temp.path(), &cfg, &prober, &FakeWorker::producing(2100));
        let summary = sched.run(CancellationToken::new(), None).await.unwrap();

        assert_eq!(summary.skip_marked, 2);
        assert_eq!(fs::read(&kept).unwrap(), original);
        let store = SkipMarkerStore::from_config(temp.path(), &cfg.markers);
        assert!(store.is_skipped(&kept).is_some());
        assert!(tagged_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_cleans_up_temps() {
        let temp = TempDir::new().unwrap();
        for i in 0..3 {
            write_sized(&temp.path().join(format!("Show{} S01E01.mkv", i)), 2000);
        }

        let worker = FakeWorker::producing(1500).with_delay(Duration::from_secs(30));
        let sched = scheduler(temp.path(), &config(2), &interlaced(), &worker);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(5), sched.run(cancel, None))
            .await
            .expect("run stops promptly after cancellation")
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.replaced, 0);
        assert!(summary.interrupted >= 2);
        for i in 0..3 {
            let original = temp.path().join(format!("Show{} S01E01.mkv", i));
            assert_eq!(fs::metadata(&original).unwrap().len(), 2000);
        }
        assert!(tagged_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_leftovers_swept_before_scanning() {
        let temp = TempDir::new().unwrap();
        write_sized(&temp.path().join("Show S01E01.mkv"), 2000);
        let leftover = temp.path().join("Show S01E01.mkv [Trans] 0123abcd.mkv");
        let orphan = temp.path().join("Orphan S01E01 [Trans].mkv");
        write_sized(&leftover, 100);
        write_sized(&orphan, 100);

        let summary = scheduler(temp.path(), &config(1), &interlaced(), &FakeWorker::producing(1))
            .run(CancellationToken::new(), None)
            .await
            .unwrap();

        assert!(!leftover.exists());
        assert!(orphan.exists());
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.leftovers_removed, 1);
    }

    #[tokio::test]
    async fn test_interrupted_replacement_is_recovered() {
        let temp = TempDir::new().unwrap();
        // A crash after the original was deleted leaves only the staged output
        let staged = temp.path().join("Show/Show S01E01.ts [Trans] 0123abcd.mkv");
        fs::create_dir_all(staged.parent().unwrap()).unwrap();
        fs::write(&staged, b"encoded").unwrap();

        let compliant = FakeProber::new(descriptor("hevc", 1_000_000, "aac", FieldOrder::Progressive));
        let worker = FakeWorker::producing(1);
        let summary = scheduler(temp.path(), &config(1), &compliant, &worker)
            .run(CancellationToken::new(), None)
            .await
            .unwrap();

        let restored = temp.path().join("Show/Show S01E01.mkv");
        assert_eq!(fs::read(&restored).unwrap(), b"encoded");
        assert!(!staged.exists());
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.leftovers_removed, 0);
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(worker.calls(), 0);
    }

    #[tokio::test]
    async fn test_same_named_episodes_share_temp_dir_safely() {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        let scratch = temp.path().join("scratch");
        let a = library.join("ShowA/Episode 1.mkv");
        let b = library.join("ShowB/Episode 1.mkv");
        write_sized(&a, 2000);
        write_sized(&b, 2000);

        let mut cfg = config(2);
        cfg.encode.temp_dir = Some(scratch.clone());
        let worker = FakeWorker::producing(1500)
            .with_stamped_output()
            .with_delay(Duration::from_millis(50));
        let summary = scheduler(&library, &cfg, &interlaced(), &worker)
            .run(CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(summary.replaced, 2);
        assert_eq!(worker.max_active(), 2);
        assert_eq!(fs::read_to_string(&a).unwrap(), stamp_for(&a));
        assert_eq!(fs::read_to_string(&b).unwrap(), stamp_for(&b));
        assert!(tagged_files(&scratch).is_empty());
    }

    #[tokio::test]
    async fn test_report_lines_written() {
        let temp = TempDir::new().unwrap();
        let library = temp.path().join("library");
        write_sized(&library.join("a S01E01.mkv"), 2000);
        write_sized(&library.join("b S01E01.mkv"), 2000);

        let report_path = temp.path().join("run.jsonl");
        let mut writer = ReportWriter::create(&report_path).unwrap();
        scheduler(&library, &config(2), &interlaced(), &FakeWorker::producing(1500))
            .run(CancellationToken::new(), Some(&mut writer))
            .await
            .unwrap();
        drop(writer);

        let content = fs::read_to_string(&report_path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().all(|l| l.contains("\"replaced\"")));
    }

    #[tokio::test]
    async fn test_missing_root_is_fatal() {
        let worker = FakeWorker::producing(1);
        let sched = scheduler(
            Path::new("/nonexistent/vidshrink"),
            &config(1),
            &interlaced(),
            &worker,
        );
        let result = sched.run(CancellationToken::new(), None).await;
        assert!(matches!(result, Err(RunError::RootNotFound(_))));
    }
}
