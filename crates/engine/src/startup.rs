//! Startup checks for vidshrink
//!
//! Provides preflight checks before a run starts:
//! - ffprobe and ffmpeg can be executed
//! - the configured hardware encoder is actually built into ffmpeg, falling
//!   back to the software encoder when it is not

use crate::encode::video_encoder_name;
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use vidshrink_config::{Config, HardwareAccel};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {message}")]
    ToolUnavailable { tool: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Verify a tool runs by invoking it with `-version`.
pub fn check_tool_available(program: &Path) -> Result<String, StartupError> {
    let tool = program.to_string_lossy().to_string();
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: tool.clone(),
            message: format!("{} -version failed; is it installed and in PATH? Error: {}", tool, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: tool.clone(),
            message: format!("{} -version exited with {}", tool, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or("").trim().to_string())
}

/// Parse the encoder names out of `ffmpeg -encoders` output.
///
/// Encoder lines look like ` V....D libx265              libx265 H.265 / HEVC`;
/// the legend above the `------` separator is ignored.
pub fn parse_encoder_list(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

/// Pick the backend to use given what ffmpeg offers.
///
/// Returns the requested backend when its encoder is listed, software
/// otherwise.
pub fn choose_hardware(
    requested: HardwareAccel,
    video_codec: &str,
    available: &HashSet<String>,
) -> HardwareAccel {
    if requested == HardwareAccel::None {
        return HardwareAccel::None;
    }
    let encoder = video_encoder_name(video_codec, requested);
    if available.contains(&encoder) {
        requested
    } else {
        tracing::warn!(
            encoder = %encoder,
            fallback = %video_encoder_name(video_codec, HardwareAccel::None),
            "hardware encoder not available, falling back to software"
        );
        HardwareAccel::None
    }
}

/// Resolve the hardware backend by asking ffmpeg which encoders it has.
pub fn resolve_hardware(ffmpeg: &Path, cfg: &Config) -> Result<HardwareAccel, StartupError> {
    if cfg.encode.hardware == HardwareAccel::None {
        return Ok(HardwareAccel::None);
    }

    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            tool: ffmpeg.to_string_lossy().to_string(),
            message: format!("ffmpeg -encoders failed: {}", e),
        })?;

    let listing = String::from_utf8_lossy(&output.stdout);
    Ok(choose_hardware(
        cfg.encode.hardware,
        &cfg.encode.video_codec.to_lowercase(),
        &parse_encoder_list(&listing),
    ))
}

/// Run all startup checks in order
///
/// 1. ffprobe availability
/// 2. ffmpeg availability
/// 3. hardware encoder resolution
pub fn run_startup_checks(cfg: &Config) -> Result<HardwareAccel, StartupError> {
    let probe_version = check_tool_available(&cfg.tools.ffprobe)?;
    tracing::debug!(version = %probe_version, "ffprobe found");
    let ffmpeg_version = check_tool_available(&cfg.tools.ffmpeg)?;
    tracing::debug!(version = %ffmpeg_version, "ffmpeg found");
    resolve_hardware(&cfg.tools.ffmpeg, cfg)
}
