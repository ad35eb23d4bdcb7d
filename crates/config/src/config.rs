//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// One gibibyte, the unit the size thresholds are expressed in.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Candidate discovery settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Eligible extensions, without the leading dot (case-insensitive)
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// Files smaller than this are never considered (default 1 GiB)
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
    /// Name tags marking output of an earlier run; such files are leftovers
    #[serde(default = "default_processed_tags")]
    pub processed_tags: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec!["mkv".into(), "mp4".into(), "ts".into()]
}

fn default_min_size_bytes() -> u64 {
    GIB
}

fn default_processed_tags() -> Vec<String> {
    vec!["[Cleaned]".into(), "[Trans]".into()]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            min_size_bytes: default_min_size_bytes(),
            processed_tags: default_processed_tags(),
        }
    }
}

/// Hardware acceleration backend for the encoder worker
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareAccel {
    /// Software encoders only
    #[default]
    None,
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
    /// VA-API
    Vaapi,
}

impl HardwareAccel {
    /// Parse a backend name, accepting the lowercase config spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" | "software" | "" => Some(HardwareAccel::None),
            "nvenc" | "cuda" => Some(HardwareAccel::Nvenc),
            "qsv" => Some(HardwareAccel::Qsv),
            "vaapi" => Some(HardwareAccel::Vaapi),
            _ => None,
        }
    }
}

/// Minimum frame width at which a different bitrate ceiling applies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WidthCeiling {
    pub min_width: u32,
    pub max_bitrate_bps: u64,
}

/// Target format and quality settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeConfig {
    /// Target video codec as reported by ffprobe (e.g. "hevc")
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Output container extension (e.g. "mkv")
    #[serde(default = "default_container")]
    pub container: String,
    /// Video bitrate ceiling in bits per second (default 2.5 Mbps)
    #[serde(default = "default_max_video_bitrate_bps")]
    pub max_video_bitrate_bps: u64,
    /// Width-aware ceilings; the largest `min_width` not above the frame width wins
    #[serde(default)]
    pub width_ceilings: Vec<WidthCeiling>,
    /// Target audio codec as reported by ffprobe (e.g. "aac")
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate used when re-encoding audio, in kbps
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    /// Constant quality value handed to the video encoder
    #[serde(default = "default_quality")]
    pub quality: u8,
    /// Hardware backend to prefer
    #[serde(default)]
    pub hardware: HardwareAccel,
    /// Directory for temporary outputs (default: next to the source)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

fn default_video_codec() -> String {
    "hevc".into()
}

fn default_container() -> String {
    "mkv".into()
}

fn default_max_video_bitrate_bps() -> u64 {
    2_500_000
}

fn default_audio_codec() -> String {
    "aac".into()
}

fn default_audio_bitrate_kbps() -> u32 {
    192
}

fn default_quality() -> u8 {
    24
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            video_codec: default_video_codec(),
            container: default_container(),
            max_video_bitrate_bps: default_max_video_bitrate_bps(),
            width_ceilings: Vec::new(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            quality: default_quality(),
            hardware: HardwareAccel::None,
            temp_dir: None,
        }
    }
}

/// Interlace deep-scan window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Number of frames decoded through the interlace detector
    #[serde(default = "default_deep_scan_frames")]
    pub deep_scan_frames: u32,
    /// Seconds skipped before the window starts (intros are not representative)
    #[serde(default = "default_skip_offset_secs")]
    pub skip_offset_secs: u32,
}

fn default_deep_scan_frames() -> u32 {
    1000
}

fn default_skip_offset_secs() -> u32 {
    300
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            deep_scan_frames: default_deep_scan_frames(),
            skip_offset_secs: default_skip_offset_secs(),
        }
    }
}

/// Audio/subtitle retention policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TracksConfig {
    /// Whether to drop tracks at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Language tag to keep when a file carries several tracks
    #[serde(default = "default_preferred_language")]
    pub preferred_language: String,
}

fn default_true() -> bool {
    true
}

fn default_preferred_language() -> String {
    "eng".into()
}

impl Default for TracksConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            preferred_language: default_preferred_language(),
        }
    }
}

/// Free-space guard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiskConfig {
    /// Abort a file when the target volume has less than this free (0 disables)
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

fn default_min_free_bytes() -> u64 {
    50 * GIB
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: default_min_free_bytes(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Maximum concurrent encoder processes (0 = auto-derive)
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    /// Logical cores used for auto-derivation (auto-detected if None)
    #[serde(default)]
    pub logical_cores: Option<u32>,
}

fn default_max_concurrent_jobs() -> u32 {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            logical_cores: None,
        }
    }
}

/// Which name-scoped marker an unproductive encode writes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NameScope {
    /// First whitespace-delimited token of the file name
    #[default]
    Show,
    /// Full file stem
    Episode,
    /// Marker in the file's directory, covering the whole subtree
    Directory,
}

/// Skip marker settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkersConfig {
    /// File name of the directory-level marker
    #[serde(default = "default_directory_marker")]
    pub directory_marker: String,
    /// Where name-scoped markers live (default: `<root>/.vidshrink/markers`)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Scope written after an encode that did not shrink the file
    #[serde(default)]
    pub name_scope: NameScope,
}

fn default_directory_marker() -> String {
    ".vidshrink-skip".into()
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            directory_marker: default_directory_marker(),
            store_dir: None,
            name_scope: NameScope::Show,
        }
    }
}

/// How duplicate groups are formed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DedupMode {
    /// Group by episode code within each directory
    #[default]
    Tv,
    /// Every video in a folder is one group
    Movies,
}

/// Duplicate removal settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupConfig {
    #[serde(default)]
    pub mode: DedupMode,
    /// Log deletions instead of performing them
    #[serde(default)]
    pub audit: bool,
    /// Eligible extensions, highest container priority first
    #[serde(default = "default_dedup_extensions")]
    pub extensions: Vec<String>,
}

fn default_dedup_extensions() -> Vec<String> {
    vec!["mkv".into(), "mp4".into(), "ts".into(), "avi".into()]
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: DedupMode::Tv,
            audit: false,
            extensions: default_dedup_extensions(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffprobe")]
    pub ffprobe: PathBuf,
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
}

fn default_ffprobe() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe: default_ffprobe(),
            ffmpeg: default_ffmpeg(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub encode: EncodeConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub tracks: TracksConfig,
    #[serde(default)]
    pub disk: DiskConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub markers: MarkersConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - VIDSHRINK_MAX_CONCURRENT_JOBS -> scheduler.max_concurrent_jobs
    /// - VIDSHRINK_MIN_SIZE_BYTES -> scan.min_size_bytes
    /// - VIDSHRINK_MIN_FREE_BYTES -> disk.min_free_bytes
    /// - VIDSHRINK_PREFERRED_LANGUAGE -> tracks.preferred_language
    /// - VIDSHRINK_TEMP_DIR -> encode.temp_dir
    /// - VIDSHRINK_HARDWARE -> encode.hardware
    /// - VIDSHRINK_DEDUP_AUDIT -> dedup.audit
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("VIDSHRINK_MAX_CONCURRENT_JOBS") {
            if let Ok(jobs) = val.parse::<u32>() {
                self.scheduler.max_concurrent_jobs = jobs;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_MIN_SIZE_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.scan.min_size_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_MIN_FREE_BYTES") {
            if let Ok(bytes) = val.parse::<u64>() {
                self.disk.min_free_bytes = bytes;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_PREFERRED_LANGUAGE") {
            if !val.trim().is_empty() {
                self.tracks.preferred_language = val.trim().to_lowercase();
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_TEMP_DIR") {
            if val.trim().is_empty() {
                self.encode.temp_dir = None;
            } else {
                self.encode.temp_dir = Some(PathBuf::from(val));
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_HARDWARE") {
            if let Some(hw) = HardwareAccel::parse(&val) {
                self.encode.hardware = hw;
            }
        }

        if let Ok(val) = env::var("VIDSHRINK_DEDUP_AUDIT") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.dedup.audit = true,
                "false" | "0" | "no" => self.dedup.audit = false,
                _ => {}
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }
}
