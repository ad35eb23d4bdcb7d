//! Classifier deciding whether a probed file is worth re-encoding.
//!
//! The decision runs cheapest check first: audio codec, video codec, bitrate
//! ceiling, then interlace status. Interlace status comes from the container's
//! field order tag when it is conclusive and otherwise from a deep frame scan
//! the caller runs beforehand (see [`needs_deep_scan`]). The result is a pure
//! function of its inputs.

use crate::probe::{FieldOrder, FrameScan, MediaDescriptor};
use crate::tracks::{select_tracks, TrackPolicy, TrackSelection};
use serde::{Deserialize, Serialize};
use vidshrink_config::{Config, WidthCeiling};

/// Scan type of the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterlaceStatus {
    Progressive,
    Interlaced,
    /// 3:2 pulldown detected through repeated-picture flags.
    Telecine,
    /// Field order tag inconclusive and no scan evidence.
    Unknown,
}

impl std::fmt::Display for InterlaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterlaceStatus::Progressive => write!(f, "progressive"),
            InterlaceStatus::Interlaced => write!(f, "interlaced"),
            InterlaceStatus::Telecine => write!(f, "telecine"),
            InterlaceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// What to do with one kind of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    /// Bitstream passthrough.
    Copy,
    /// Re-encode to the target codec.
    Encode,
}

/// A named stage of the video filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    FieldMatch,
    Decimate,
    Deinterlace,
}

impl FilterStage {
    /// ffmpeg filter expression for this stage.
    pub fn ffmpeg_filter(&self) -> &'static str {
        match self {
            FilterStage::FieldMatch => "fieldmatch",
            FilterStage::Decimate => "decimate",
            FilterStage::Deinterlace => "yadif",
        }
    }
}

/// Targets and ceilings the classifier compares against.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    pub target_video_codec: String,
    pub target_audio_codec: String,
    /// Default bitrate ceiling in bits per second.
    pub max_video_bitrate_bps: u64,
    pub width_ceilings: Vec<WidthCeiling>,
    /// `None` disables track reduction.
    pub tracks: Option<TrackPolicy>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl Thresholds {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            target_video_codec: normalize_codec(&cfg.encode.video_codec),
            target_audio_codec: normalize_codec(&cfg.encode.audio_codec),
            max_video_bitrate_bps: cfg.encode.max_video_bitrate_bps,
            width_ceilings: cfg.encode.width_ceilings.clone(),
            tracks: cfg.tracks.enabled.then(|| TrackPolicy {
                preferred_language: cfg.tracks.preferred_language.to_lowercase(),
            }),
        }
    }

    /// Bitrate ceiling for a frame of the given width: the widest tier the
    /// frame reaches, or the default ceiling.
    pub fn ceiling_for_width(&self, width: u32) -> u64 {
        self.width_ceilings
            .iter()
            .filter(|c| width >= c.min_width)
            .max_by_key(|c| c.min_width)
            .map(|c| c.max_bitrate_bps)
            .unwrap_or(self.max_video_bitrate_bps)
    }
}

/// Folds codec aliases onto the names ffprobe reports.
pub fn normalize_codec(codec: &str) -> String {
    match codec.trim().to_lowercase().as_str() {
        "h265" | "x265" | "hevc" => "hevc".to_string(),
        "h264" | "x264" | "avc" => "h264".to_string(),
        other => other.to_string(),
    }
}

/// Outcome of classifying one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub interlace_status: InterlaceStatus,
    /// A codec, bitrate or interlace trigger fired.
    pub needs_conversion: bool,
    /// AV1 source; never touched.
    pub excluded: bool,
    pub video_action: StreamAction,
    pub audio_action: StreamAction,
    /// Ordered video filter stages; empty for passthrough.
    pub filter_chain: Vec<FilterStage>,
    pub audio_selection: TrackSelection,
    pub subtitle_selection: TrackSelection,
    /// Human-readable triggers, in evaluation order.
    pub reasons: Vec<String>,
}

impl ClassificationResult {
    /// Whether the file goes to the encoder at all.
    pub fn should_process(&self) -> bool {
        !self.excluded
            && (self.needs_conversion
                || !self.audio_selection.is_noop()
                || !self.subtitle_selection.is_noop())
    }
}

/// Whether [`classify`] needs frame-scan evidence for this descriptor.
pub fn needs_deep_scan(descriptor: &MediaDescriptor) -> bool {
    !descriptor.is_av1() && descriptor.field_order == FieldOrder::Unknown
}

/// Derives the scan type from the field order tag, falling back to the deep scan.
pub fn interlace_status(descriptor: &MediaDescriptor, scan: Option<&FrameScan>) -> InterlaceStatus {
    match descriptor.field_order {
        order if order.is_interlaced() => InterlaceStatus::Interlaced,
        FieldOrder::Progressive => InterlaceStatus::Progressive,
        _ => match scan {
            Some(s) if s.interlaced_frames > 0 => InterlaceStatus::Interlaced,
            Some(s) if s.repeated_pictures > 0 => InterlaceStatus::Telecine,
            Some(_) => InterlaceStatus::Progressive,
            None => InterlaceStatus::Unknown,
        },
    }
}

/// Filter stages for a scan type. Decimation must follow field matching so
/// the duplicated frames it drops are the ones field matching produced.
pub fn filter_chain_for(status: InterlaceStatus) -> Vec<FilterStage> {
    match status {
        InterlaceStatus::Progressive => Vec::new(),
        InterlaceStatus::Interlaced | InterlaceStatus::Unknown => vec![FilterStage::Deinterlace],
        InterlaceStatus::Telecine => vec![
            FilterStage::FieldMatch,
            FilterStage::Decimate,
            FilterStage::Deinterlace,
        ],
    }
}

fn audio_tuples(descriptor: &MediaDescriptor) -> Vec<(u32, Option<&str>, bool)> {
    descriptor
        .audio_tracks
        .iter()
        .map(|t| (t.index, t.language.as_deref(), t.is_default))
        .collect()
}

fn subtitle_tuples(descriptor: &MediaDescriptor) -> Vec<(u32, Option<&str>, bool)> {
    descriptor
        .subtitle_tracks
        .iter()
        .map(|t| (t.index, t.language.as_deref(), false))
        .collect()
}

/// Classifies a probed file against the configured thresholds.
///
/// `scan` is the deep-scan evidence, required only when
/// [`needs_deep_scan`] says so; without it an inconclusive field order
/// classifies as [`InterlaceStatus::Unknown`], which still forces an encode
/// with a deinterlace stage.
pub fn classify(
    descriptor: &MediaDescriptor,
    thresholds: &Thresholds,
    scan: Option<&FrameScan>,
) -> ClassificationResult {
    let audio = audio_tuples(descriptor);
    let subtitles = subtitle_tuples(descriptor);

    if descriptor.is_av1() {
        return ClassificationResult {
            interlace_status: interlace_status(descriptor, None),
            needs_conversion: false,
            excluded: true,
            video_action: StreamAction::Copy,
            audio_action: StreamAction::Copy,
            filter_chain: Vec::new(),
            audio_selection: TrackSelection::keep_all(&audio),
            subtitle_selection: TrackSelection::keep_all(&subtitles),
            reasons: vec!["av1 source is never re-encoded".to_string()],
        };
    }

    let target_audio = &thresholds.target_audio_codec;
    let target_video = &thresholds.target_video_codec;
    let video_codec = normalize_codec(&descriptor.video_codec);
    let ceiling = thresholds.ceiling_for_width(descriptor.width);
    let video_matches = &video_codec == target_video;
    let within_ceiling = descriptor.video_bitrate_bps <= ceiling;

    let mut reasons = Vec::new();
    let mut needs_conversion = false;

    // Cheap triggers first; the first one that fires decides
    if let Some(acodec) = descriptor
        .audio_codec
        .as_deref()
        .map(normalize_codec)
        .filter(|c| c != target_audio)
    {
        needs_conversion = true;
        reasons.push(format!("audio codec {} != {}", acodec, target_audio));
    } else if !video_matches {
        needs_conversion = true;
        reasons.push(format!("video codec {} != {}", video_codec, target_video));
    } else if !within_ceiling {
        needs_conversion = true;
        reasons.push(format!(
            "video bitrate {} bps > ceiling {} bps",
            descriptor.video_bitrate_bps, ceiling
        ));
    }

    let status = interlace_status(descriptor, scan);
    if status != InterlaceStatus::Progressive {
        needs_conversion = true;
        reasons.push(format!("scan type {}", status));
    }

    let video_action = if status != InterlaceStatus::Progressive {
        StreamAction::Encode
    } else if video_matches && within_ceiling {
        StreamAction::Copy
    } else {
        StreamAction::Encode
    };

    let (audio_selection, subtitle_selection) = match &thresholds.tracks {
        Some(policy) => (select_tracks(&audio, policy), select_tracks(&subtitles, policy)),
        None => (
            TrackSelection::keep_all(&audio),
            TrackSelection::keep_all(&subtitles),
        ),
    };

    let audio_action = if descriptor
        .audio_tracks
        .iter()
        .filter(|t| audio_selection.retained.contains(&t.index))
        .any(|t| &normalize_codec(&t.codec_name) != target_audio)
    {
        StreamAction::Encode
    } else {
        StreamAction::Copy
    };

    if !audio_selection.is_noop() {
        reasons.push(format!("dropping audio tracks {:?}", audio_selection.dropped));
    }
    if !subtitle_selection.is_noop() {
        reasons.push(format!(
            "dropping subtitle tracks {:?}",
            subtitle_selection.dropped
        ));
    }

    ClassificationResult {
        interlace_status: status,
        needs_conversion,
        excluded: false,
        video_action,
        audio_action,
        filter_chain: filter_chain_for(status),
        audio_selection,
        subtitle_selection,
        reasons,
    }
}
