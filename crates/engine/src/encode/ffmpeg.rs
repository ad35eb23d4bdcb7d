//! ffmpeg-backed encoder worker.

use super::{EncodeError, EncodeRequest, TranscodeWorker, WorkerOutput};
use crate::classify::StreamAction;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use vidshrink_config::{EncodeConfig, HardwareAccel};

/// Render node used for VA-API uploads.
const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Encoder selection and quality knobs shared by every job of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    /// Target codec as ffprobe names it (e.g. "hevc").
    pub video_codec: String,
    /// Backend actually in use after the startup availability check.
    pub hardware: HardwareAccel,
    pub quality: u8,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    /// Output container extension.
    pub container: String,
}

impl EncoderSettings {
    pub fn from_config(cfg: &EncodeConfig, hardware: HardwareAccel) -> Self {
        Self {
            video_codec: cfg.video_codec.to_lowercase(),
            hardware,
            quality: cfg.quality,
            audio_codec: cfg.audio_codec.to_lowercase(),
            audio_bitrate_kbps: cfg.audio_bitrate_kbps,
            container: cfg.container.to_lowercase(),
        }
    }

    fn is_matroska(&self) -> bool {
        matches!(self.container.as_str(), "mkv" | "matroska")
    }
}

/// ffmpeg encoder name for a codec on a backend.
pub fn video_encoder_name(codec: &str, hardware: HardwareAccel) -> String {
    let family = match codec {
        "hevc" | "h265" | "x265" => "hevc",
        "h264" | "avc" | "x264" => "h264",
        "av1" => "av1",
        other => return other.to_string(),
    };
    match hardware {
        HardwareAccel::None => match family {
            "hevc" => "libx265".to_string(),
            "h264" => "libx264".to_string(),
            _ => "libsvtav1".to_string(),
        },
        HardwareAccel::Nvenc => format!("{}_nvenc", family),
        HardwareAccel::Qsv => format!("{}_qsv", family),
        HardwareAccel::Vaapi => format!("{}_vaapi", family),
    }
}

fn audio_encoder_name(codec: &str) -> &str {
    match codec {
        "opus" => "libopus",
        "mp3" => "libmp3lame",
        "vorbis" => "libvorbis",
        other => other,
    }
}

fn quality_args(hardware: HardwareAccel, quality: u8) -> [String; 2] {
    let flag = match hardware {
        HardwareAccel::None => "-crf",
        HardwareAccel::Nvenc => "-cq",
        HardwareAccel::Qsv => "-global_quality",
        HardwareAccel::Vaapi => "-qp",
    };
    [flag.to_string(), quality.to_string()]
}

/// Builds the full ffmpeg argument list for one request.
///
/// Streams are mapped explicitly: the first video stream, then the retained
/// audio and subtitle streams in order. Only the primary audio track keeps
/// the default disposition.
pub fn build_ffmpeg_args(request: &EncodeRequest, settings: &EncoderSettings) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
    ];

    let encoding_video = request.video_action == StreamAction::Encode;
    if encoding_video && settings.hardware == HardwareAccel::Vaapi {
        args.extend(["-vaapi_device".into(), VAAPI_DEVICE.into()]);
    }

    args.extend(["-i".into(), request.input.to_string_lossy().to_string()]);

    args.extend(["-map".into(), "0:v:0".into()]);
    for idx in &request.audio_streams {
        args.extend(["-map".into(), format!("0:{}", idx)]);
    }
    for sub in &request.subtitle_streams {
        args.extend(["-map".into(), format!("0:{}", sub.index)]);
    }
    args.extend([
        "-map_metadata".into(),
        "0".into(),
        "-map_chapters".into(),
        "0".into(),
    ]);

    if encoding_video {
        let mut filters: Vec<&str> = request
            .filter_chain
            .iter()
            .map(|s| s.ffmpeg_filter())
            .collect();
        if settings.hardware == HardwareAccel::Vaapi {
            filters.extend(["format=nv12", "hwupload"]);
        }
        if !filters.is_empty() {
            args.extend(["-vf".into(), filters.join(",")]);
        }

        args.extend([
            "-c:v".into(),
            video_encoder_name(&settings.video_codec, settings.hardware),
        ]);
        args.extend(quality_args(settings.hardware, settings.quality));
        if request.max_video_bitrate_bps > 0 {
            args.extend([
                "-maxrate".into(),
                request.max_video_bitrate_bps.to_string(),
                "-bufsize".into(),
                (request.max_video_bitrate_bps * 2).to_string(),
            ]);
        }
    } else {
        args.extend(["-c:v".into(), "copy".into()]);
    }

    if !request.audio_streams.is_empty() {
        match request.audio_action {
            StreamAction::Copy => args.extend(["-c:a".into(), "copy".into()]),
            StreamAction::Encode => args.extend([
                "-c:a".into(),
                audio_encoder_name(&settings.audio_codec).to_string(),
                "-b:a".into(),
                format!("{}k", settings.audio_bitrate_kbps),
            ]),
        }
        for (pos, idx) in request.audio_streams.iter().enumerate() {
            let disposition = if request.primary_audio == Some(*idx) {
                "default"
            } else {
                "0"
            };
            args.extend([format!("-disposition:a:{}", pos), disposition.into()]);
        }
    }

    if !request.subtitle_streams.is_empty() {
        args.extend(["-c:s".into(), "copy".into()]);
        for (pos, sub) in request.subtitle_streams.iter().enumerate() {
            // Matroska cannot carry mov_text
            if settings.is_matroska() && sub.codec_name == "mov_text" {
                args.extend([format!("-c:s:{}", pos), "srt".into()]);
            }
        }
    }

    args.push(request.output.to_string_lossy().to_string());
    args
}

/// [`TranscodeWorker`] that runs ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegWorker {
    ffmpeg: PathBuf,
    settings: EncoderSettings,
}

impl FfmpegWorker {
    pub fn new(ffmpeg: PathBuf, settings: EncoderSettings) -> Self {
        Self { ffmpeg, settings }
    }
}

#[async_trait]
impl TranscodeWorker for FfmpegWorker {
    async fn transcode(
        &self,
        request: &EncodeRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerOutput, EncodeError> {
        let args = build_ffmpeg_args(request, &self.settings);
        tracing::debug!(input = %request.input.display(), args = ?args, "spawning ffmpeg");

        let child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    EncodeError::ToolMissing(self.ffmpeg.to_string_lossy().to_string())
                }
                _ => EncodeError::Io(e),
            })?;

        // Dropping the wait future drops the child, which kills it
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                Ok(WorkerOutput {
                    exit_code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            _ = cancel.cancelled() => Err(EncodeError::Interrupted),
        }
    }
}
