//! In-process stand-ins for the external tools, used by the pipeline tests.

use crate::encode::{EncodeError, EncodeRequest, TranscodeWorker, WorkerOutput};
use crate::probe::{
    AudioTrack, DeepScanWindow, FieldOrder, FrameScan, MediaDescriptor, MediaProber, ProbeError,
};
use async_trait::async_trait;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

pub fn write_sized(path: &Path, len: u64) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let f = File::create(path).unwrap();
    f.set_len(len).unwrap();
}

/// Files under `dir` still carrying the encoder output tag.
pub fn tagged_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().contains("[Trans]"))
        .map(|e| e.into_path())
        .collect()
}

/// 1080p, one English audio track, no subtitles.
pub fn descriptor(vcodec: &str, bps: u64, acodec: &str, field_order: FieldOrder) -> MediaDescriptor {
    MediaDescriptor {
        video_codec: vcodec.to_string(),
        video_bitrate_bps: bps,
        width: 1920,
        height: 1080,
        field_order,
        audio_codec: Some(acodec.to_string()),
        audio_tracks: vec![AudioTrack {
            index: 1,
            codec_name: acodec.to_string(),
            language: Some("eng".to_string()),
            is_default: true,
        }],
        subtitle_tracks: Vec::new(),
        duration_secs: 1320.0,
        size_bytes: 0,
    }
}

/// Content a stamped [`FakeWorker`] writes for `input`.
pub fn stamp_for(input: &Path) -> String {
    format!("encoded-from-{}", input.display())
}

/// Returns one canned descriptor for every file; deep scans find progressive frames.
#[derive(Clone)]
pub struct FakeProber {
    descriptor: Option<MediaDescriptor>,
    probes: Arc<AtomicUsize>,
    scans: Arc<AtomicUsize>,
}

impl FakeProber {
    pub fn new(descriptor: MediaDescriptor) -> Self {
        Self {
            descriptor: Some(descriptor),
            probes: Arc::new(AtomicUsize::new(0)),
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            descriptor: None,
            probes: Arc::new(AtomicUsize::new(0)),
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn probe_calls(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn deep_scan_calls(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProber for FakeProber {
    async fn probe(&self, _path: &Path) -> Result<MediaDescriptor, ProbeError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.descriptor.clone().ok_or_else(|| ProbeError::ToolFailed {
            tool: "ffprobe".to_string(),
            message: "Invalid data found when processing input".to_string(),
        })
    }

    async fn deep_scan(
        &self,
        _path: &Path,
        window: &DeepScanWindow,
    ) -> Result<FrameScan, ProbeError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(FrameScan {
            progressive_frames: window.frames as u64,
            ..FrameScan::default()
        })
    }
}

/// Writes an output of a fixed size and reports a fixed exit code.
#[derive(Clone)]
pub struct FakeWorker {
    output_bytes: u64,
    exit_code: i32,
    delay: Duration,
    stamped: bool,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl FakeWorker {
    pub fn producing(output_bytes: u64) -> Self {
        Self::exiting(0, output_bytes)
    }

    pub fn exiting(exit_code: i32, output_bytes: u64) -> Self {
        Self {
            output_bytes,
            exit_code,
            delay: Duration::ZERO,
            stamped: false,
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Output content names the input it was encoded from.
    pub fn with_stamped_output(mut self) -> Self {
        self.stamped = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous transcodes observed.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscodeWorker for FakeWorker {
    async fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutput, EncodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        // Partial output exists while the "encoder" runs
        write_sized(&request.output, self.output_bytes / 2);

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.delay) => false,
            _ = cancel.cancelled() => true,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if interrupted {
            return Err(EncodeError::Interrupted);
        }

        if self.stamped {
            fs::write(&request.output, stamp_for(&request.input)).unwrap();
        } else {
            write_sized(&request.output, self.output_bytes);
        }
        Ok(WorkerOutput {
            exit_code: Some(self.exit_code),
            stderr: if self.exit_code == 0 {
                String::new()
            } else {
                "Conversion failed!".to_string()
            },
        })
    }
}
