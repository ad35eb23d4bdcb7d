//! Encoder worker abstraction.
//!
//! A [`TranscodeWorker`] turns an [`EncodeRequest`] into a finished output
//! file. The worker reports the process exit code and captured stderr; the
//! job decides what a failure means.

pub mod ffmpeg;

pub use ffmpeg::{build_ffmpeg_args, video_encoder_name, EncoderSettings, FfmpegWorker};

use crate::classify::{ClassificationResult, FilterStage, StreamAction};
use crate::probe::MediaDescriptor;
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder binary could not be spawned
    #[error("{0} not found; is it installed and in PATH?")]
    ToolMissing(String),

    /// The run was cancelled and the worker process killed
    #[error("encode interrupted")]
    Interrupted,

    /// IO error during encoding
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A subtitle stream carried into the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSubtitle {
    pub index: u32,
    pub codec_name: String,
}

/// Everything the worker needs to produce one output file.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub video_action: StreamAction,
    pub filter_chain: Vec<FilterStage>,
    /// Rate ceiling for the encoded video, in bits per second.
    pub max_video_bitrate_bps: u64,
    pub audio_action: StreamAction,
    /// Absolute stream indices, in output order.
    pub audio_streams: Vec<u32>,
    /// Flagged default in the output.
    pub primary_audio: Option<u32>,
    pub subtitle_streams: Vec<MappedSubtitle>,
}

impl EncodeRequest {
    /// Builds the request from a classification.
    pub fn from_classification(
        input: PathBuf,
        output: PathBuf,
        descriptor: &MediaDescriptor,
        result: &ClassificationResult,
        max_video_bitrate_bps: u64,
    ) -> Self {
        let subtitle_streams = result
            .subtitle_selection
            .retained
            .iter()
            .map(|idx| MappedSubtitle {
                index: *idx,
                codec_name: descriptor
                    .subtitle_tracks
                    .iter()
                    .find(|s| s.index == *idx)
                    .map(|s| s.codec_name.clone())
                    .unwrap_or_default(),
            })
            .collect();

        Self {
            input,
            output,
            video_action: result.video_action,
            filter_chain: result.filter_chain.clone(),
            max_video_bitrate_bps,
            audio_action: result.audio_action,
            audio_streams: result.audio_selection.retained.clone(),
            primary_audio: result.audio_selection.primary,
            subtitle_streams,
        }
    }
}

/// Exit code and captured stderr of a finished worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl WorkerOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last non-empty stderr line, for log messages.
    pub fn stderr_tail(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// External encoder wrapper.
#[async_trait]
pub trait TranscodeWorker: Send + Sync {
    /// Runs the encoder to completion, or kills it when `cancel` fires and
    /// returns [`EncodeError::Interrupted`].
    async fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutput, EncodeError>;
}
