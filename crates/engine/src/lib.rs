//! vidshrink
//!
//! Batch transcoder for video libraries: finds files that are too large,
//! interlaced or in the wrong format, re-encodes them under a bounded worker
//! pool, and replaces each original only when the result is smaller. A
//! separate dedup engine prunes inferior duplicate episodes and movies.

pub mod classify;
pub mod cleanup;
pub mod concurrency;
pub mod dedup;
pub mod disk;
pub mod encode;
pub mod job_executor;
pub mod probe;
pub mod replace;
pub mod report;
pub mod scan;
pub mod scheduler;
pub mod size_gate;
pub mod skip_marker;
pub mod startup;
pub mod tracks;

#[cfg(test)]
pub(crate) mod testing;

pub use vidshrink_config as config;
pub use vidshrink_config::Config;
pub use classify::{classify, ClassificationResult, InterlaceStatus, Thresholds};
pub use concurrency::{ConcurrencyPlan, WorkerSlots};
pub use dedup::{DedupError, DedupPlan, DedupSummary, DeduplicationEngine};
pub use encode::{EncodeError, EncoderSettings, FfmpegWorker, TranscodeWorker};
pub use job_executor::{JobError, JobExecutor, JobOutcome, JobReport, JobState};
pub use probe::{FfprobeProber, MediaDescriptor, MediaProber, ProbeError};
pub use report::{FileReport, ReportWriter, RunSummary};
pub use scan::{FileWalker, ScanCandidate};
pub use scheduler::{JobScheduler, RunError};
pub use skip_marker::{MarkerScope, SkipMarkerStore};
pub use startup::{run_startup_checks, StartupError};
