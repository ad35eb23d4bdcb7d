//! Media probing through the external metadata oracle.
//!
//! Every candidate is inspected with a single `ffprobe` invocation whose JSON
//! output is parsed into a [`MediaDescriptor`]. The optional interlace deep
//! scan decodes a bounded frame window through ffmpeg's `idet` filter and, when
//! that finds nothing, reads `repeat_pict` flags to spot telecined content.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::process::Command;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The tool binary could not be spawned.
    #[error("{0} not found; is it installed and in PATH?")]
    ToolMissing(String),

    /// The tool ran but exited with a failure status.
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    /// Failed to parse tool output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The container holds no usable video stream.
    #[error("no video stream")]
    NoVideoStream,

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Container-level field order tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrder {
    Progressive,
    /// Top field first, top coded first.
    Tt,
    /// Bottom field first, bottom coded first.
    Bb,
    /// Top coded first, bottom displayed first.
    Tb,
    /// Bottom coded first, top displayed first.
    Bt,
    #[default]
    Unknown,
}

impl FieldOrder {
    /// Parse from the ffprobe `field_order` string.
    pub fn from_ffprobe(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "progressive" => Self::Progressive,
            "tt" => Self::Tt,
            "bb" => Self::Bb,
            "tb" => Self::Tb,
            "bt" => Self::Bt,
            _ => Self::Unknown,
        }
    }

    /// Whether the tag unambiguously marks interlaced content.
    pub fn is_interlaced(&self) -> bool {
        matches!(self, Self::Tt | Self::Bb | Self::Tb | Self::Bt)
    }
}

impl std::fmt::Display for FieldOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FieldOrder::Progressive => "progressive",
            FieldOrder::Tt => "tt",
            FieldOrder::Bb => "bb",
            FieldOrder::Tb => "tb",
            FieldOrder::Bt => "bt",
            FieldOrder::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// An audio stream of the probed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioTrack {
    /// Absolute stream index inside the container.
    pub index: u32,
    pub codec_name: String,
    /// Lowercased language tag, if any.
    pub language: Option<String>,
    pub is_default: bool,
}

/// A subtitle stream of the probed file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleTrack {
    /// Absolute stream index inside the container.
    pub index: u32,
    pub codec_name: String,
    /// Lowercased language tag, if any.
    pub language: Option<String>,
}

/// Snapshot of everything the classifier needs to know about one file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaDescriptor {
    /// Codec of the primary video stream (e.g. "h264", "hevc", "av1").
    pub video_codec: String,
    /// Video bitrate in bits per second; zero when the container does not say.
    pub video_bitrate_bps: u64,
    pub width: u32,
    pub height: u32,
    pub field_order: FieldOrder,
    /// Codec of the first audio stream, if the file has audio.
    pub audio_codec: Option<String>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
    pub duration_secs: f64,
    pub size_bytes: u64,
}

impl MediaDescriptor {
    /// AV1 sources are never touched.
    pub fn is_av1(&self) -> bool {
        self.video_codec.to_lowercase().contains("av1")
    }
}

/// Frame window for the interlace deep scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeepScanWindow {
    /// Frames decoded through the detector.
    pub frames: u32,
    /// Seconds skipped before the window starts.
    pub skip_offset_secs: u32,
}

impl Default for DeepScanWindow {
    fn default() -> Self {
        Self {
            frames: 1000,
            skip_offset_secs: 300,
        }
    }
}

/// Frame counts gathered by a deep scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameScan {
    /// TFF + BFF frames reported by the interlace detector.
    pub interlaced_frames: u64,
    pub progressive_frames: u64,
    pub undetermined_frames: u64,
    /// Frames carrying a non-zero `repeat_pict` flag.
    pub repeated_pictures: u64,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub bit_rate: Option<String>,
        pub field_order: Option<String>,
        pub tags: Option<HashMap<String, String>>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Default, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub default: i64,
        #[serde(default)]
        pub attached_pic: i64,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct FramesOutput {
        pub frames: Option<Vec<Frame>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Frame {
        pub repeat_pict: Option<i64>,
    }
}

/// Case-insensitive tag lookup; Matroska writers disagree on casing and
/// suffix statistics tags with the language (`BPS-eng`).
fn tag<'a>(tags: &'a Option<HashMap<String, String>>, name: &str) -> Option<&'a str> {
    let tags = tags.as_ref()?;
    let name = name.to_lowercase();
    tags.iter()
        .find(|(k, _)| {
            let k = k.to_lowercase();
            k == name || k.starts_with(&format!("{}-", name))
        })
        .map(|(_, v)| v.as_str())
}

fn language_of(tags: &Option<HashMap<String, String>>) -> Option<String> {
    tag(tags, "language")
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
}

/// Parses ffprobe `-show_streams -show_format` JSON into a [`MediaDescriptor`].
pub fn parse_ffprobe_output(json_str: &str) -> Result<MediaDescriptor, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let mut video: Option<&ffprobe_json::Stream> = None;
    let mut audio_tracks = Vec::new();
    let mut subtitle_tracks = Vec::new();

    for (position, stream) in streams.iter().enumerate() {
        let index = stream.index.unwrap_or(position as u32);
        let codec_name = stream.codec_name.clone().unwrap_or_default().to_lowercase();
        let disposition = stream.disposition.as_ref();

        match stream.codec_type.as_deref().unwrap_or("") {
            "video" => {
                // Cover art shows up as a video stream flagged attached_pic
                let attached = disposition.map(|d| d.attached_pic != 0).unwrap_or(false);
                if video.is_none() && !attached {
                    video = Some(stream);
                }
            }
            "audio" => audio_tracks.push(AudioTrack {
                index,
                codec_name,
                language: language_of(&stream.tags),
                is_default: disposition.map(|d| d.default != 0).unwrap_or(false),
            }),
            "subtitle" => subtitle_tracks.push(SubtitleTrack {
                index,
                codec_name,
                language: language_of(&stream.tags),
            }),
            _ => {}
        }
    }

    let video = video.ok_or(ProbeError::NoVideoStream)?;

    // Stream bit_rate first, then the Matroska statistics tag, then zero
    let video_bitrate_bps = video
        .bit_rate
        .as_deref()
        .and_then(|br| br.trim().parse::<u64>().ok())
        .or_else(|| tag(&video.tags, "bps").and_then(|br| br.trim().parse::<u64>().ok()))
        .unwrap_or(0);

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(MediaDescriptor {
        video_codec: video.codec_name.clone().unwrap_or_default().to_lowercase(),
        video_bitrate_bps,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        field_order: video
            .field_order
            .as_deref()
            .map(FieldOrder::from_ffprobe)
            .unwrap_or(FieldOrder::Unknown),
        audio_codec: audio_tracks.first().map(|t| t.codec_name.clone()),
        audio_tracks,
        subtitle_tracks,
        duration_secs,
        size_bytes,
    })
}

/// Detector totals from an `idet` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdetCounts {
    pub tff: u64,
    pub bff: u64,
    pub progressive: u64,
    pub undetermined: u64,
}

impl IdetCounts {
    pub fn total(&self) -> u64 {
        self.tff + self.bff + self.progressive + self.undetermined
    }
}

fn idet_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Multi frame detection:\s*TFF:\s*(\d+)\s*BFF:\s*(\d+)\s*Progressive:\s*(\d+)\s*Undetermined:\s*(\d+)",
        )
        .expect("static idet pattern is valid")
    })
}

/// Extracts the multi-frame summary ffmpeg's `idet` filter prints on stderr.
///
/// Returns the last summary in the log, or `None` when the filter never
/// reported (nothing decoded).
pub fn parse_idet_output(stderr: &str) -> Option<IdetCounts> {
    idet_regex().captures_iter(stderr).last().map(|caps| {
        let n = |i: usize| caps[i].parse::<u64>().unwrap_or(0);
        IdetCounts {
            tff: n(1),
            bff: n(2),
            progressive: n(3),
            undetermined: n(4),
        }
    })
}

/// Counts frames with a non-zero `repeat_pict` in ffprobe frame JSON.
pub fn parse_repeat_pict_output(json_str: &str) -> Result<u64, ProbeError> {
    let out: ffprobe_json::FramesOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;
    Ok(out
        .frames
        .unwrap_or_default()
        .iter()
        .filter(|f| f.repeat_pict.unwrap_or(0) > 0)
        .count() as u64)
}

/// Source of media metadata.
///
/// The production implementation shells out to ffprobe/ffmpeg; tests swap in
/// canned descriptors.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Probe one file's streams.
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError>;

    /// Decode a bounded window of frames looking for interlacing or telecine.
    async fn deep_scan(&self, path: &Path, window: &DeepScanWindow)
        -> Result<FrameScan, ProbeError>;
}

/// [`MediaProber`] backed by the ffprobe and ffmpeg binaries.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe: PathBuf, ffmpeg: PathBuf) -> Self {
        Self { ffprobe, ffmpeg }
    }

    async fn run(program: &Path, args: &[String]) -> Result<Output, ProbeError> {
        let name = program.to_string_lossy().to_string();
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ProbeError::ToolMissing(name.clone()),
                _ => ProbeError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::ToolFailed {
                tool: name,
                message: format!(
                    "exited with status {}: {}",
                    output.status,
                    stderr.lines().last().unwrap_or("").trim()
                ),
            });
        }
        Ok(output)
    }

    async fn run_idet(
        &self,
        path: &Path,
        frames: u32,
        offset_secs: u32,
    ) -> Result<IdetCounts, ProbeError> {
        let args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-nostats".to_string(),
            "-ss".to_string(),
            offset_secs.to_string(),
            "-i".to_string(),
            path.to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-frames:v".to_string(),
            frames.to_string(),
            "-vf".to_string(),
            "idet".to_string(),
            "-an".to_string(),
            "-sn".to_string(),
            "-dn".to_string(),
            "-f".to_string(),
            "null".to_string(),
            "-".to_string(),
        ];
        let output = Self::run(&self.ffmpeg, &args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_idet_output(&stderr).unwrap_or(IdetCounts {
            tff: 0,
            bff: 0,
            progressive: 0,
            undetermined: 0,
        }))
    }

    async fn run_repeat_pict(
        &self,
        path: &Path,
        frames: u32,
        offset_secs: u32,
    ) -> Result<u64, ProbeError> {
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-select_streams".to_string(),
            "v:0".to_string(),
            "-read_intervals".to_string(),
            format!("{}%+#{}", offset_secs, frames),
            "-show_entries".to_string(),
            "frame=repeat_pict".to_string(),
            "-of".to_string(),
            "json".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = Self::run(&self.ffprobe, &args).await?;
        parse_repeat_pict_output(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            "-show_format".to_string(),
            path.to_string_lossy().to_string(),
        ];
        let output = Self::run(&self.ffprobe, &args).await?;
        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout))
    }

    async fn deep_scan(
        &self,
        path: &Path,
        window: &DeepScanWindow,
    ) -> Result<FrameScan, ProbeError> {
        let mut offset = window.skip_offset_secs;
        let mut counts = self.run_idet(path, window.frames, offset).await?;

        // Shorter than the skip offset: nothing decoded, scan from the start
        if counts.total() == 0 && offset > 0 {
            tracing::debug!(path = %path.display(), "deep scan window past end, rescanning from 0s");
            offset = 0;
            counts = self.run_idet(path, window.frames, offset).await?;
        }

        let mut scan = FrameScan {
            interlaced_frames: counts.tff + counts.bff,
            progressive_frames: counts.progressive,
            undetermined_frames: counts.undetermined,
            repeated_pictures: 0,
        };

        if scan.interlaced_frames == 0 {
            scan.repeated_pictures = self.run_repeat_pict(path, window.frames, offset).await?;
        }

        Ok(scan)
    }
}
