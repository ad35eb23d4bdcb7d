//! CLI entry point for vidshrink
//!
//! `transcode` runs one pass over a library root; `dedup` prunes duplicate
//! episodes or movies.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use vidshrink::config::{DedupMode, HardwareAccel};
use vidshrink::{
    run_startup_checks, Config, DeduplicationEngine, EncoderSettings, FfmpegWorker,
    FfprobeProber, JobScheduler, ReportWriter, RunError,
};

/// vidshrink - shrink and normalize video libraries in place
#[derive(Parser, Debug)]
#[command(name = "vidshrink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug-level logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transcode every file under ROOT that needs it
    Transcode {
        root: PathBuf,

        /// Path to the configuration file
        #[arg(short, long, default_value = "vidshrink.toml")]
        config: PathBuf,

        /// Maximum concurrent encodes (0 derives from core count)
        #[arg(short = 'j', long)]
        max_jobs: Option<u32>,

        /// Ignore files smaller than this many bytes
        #[arg(long)]
        min_size: Option<u64>,

        /// Write temp outputs here instead of next to the source
        #[arg(short, long)]
        temp_dir: Option<PathBuf>,

        /// Append one JSON line per processed file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Skip the ffprobe/ffmpeg checks and use the configured backend as is
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },

    /// Remove inferior duplicates under ROOT
    Dedup {
        root: PathBuf,

        /// Path to the configuration file
        #[arg(short, long, default_value = "vidshrink.toml")]
        config: PathBuf,

        /// Grouping mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Log deletions without performing them
        #[arg(long)]
        audit: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Tv,
    Movies,
}

impl From<ModeArg> for DedupMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Tv => DedupMode::Tv,
            ModeArg::Movies => DedupMode::Movies,
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => return,
    }

    tracing::info!("shutdown requested, finishing running jobs");
    cancel.cancel();
}

#[allow(clippy::too_many_arguments)]
async fn transcode(
    root: &Path,
    config_path: &Path,
    max_jobs: Option<u32>,
    min_size: Option<u64>,
    temp_dir: Option<PathBuf>,
    report: Option<PathBuf>,
    skip_checks: bool,
) -> Result<bool, RunError> {
    let mut cfg = Config::load_or_default(config_path)?;
    if let Some(jobs) = max_jobs {
        cfg.scheduler.max_concurrent_jobs = jobs;
    }
    if let Some(bytes) = min_size {
        cfg.scan.min_size_bytes = bytes;
    }
    if temp_dir.is_some() {
        cfg.encode.temp_dir = temp_dir;
    }

    let hardware = if skip_checks {
        tracing::warn!("skipping startup checks (--skip-checks)");
        cfg.encode.hardware
    } else {
        run_startup_checks(&cfg)?
    };
    if hardware != HardwareAccel::None {
        tracing::info!(?hardware, "hardware encoding enabled");
    }

    let prober = FfprobeProber::new(cfg.tools.ffprobe.clone(), cfg.tools.ffmpeg.clone());
    let worker = FfmpegWorker::new(
        cfg.tools.ffmpeg.clone(),
        EncoderSettings::from_config(&cfg.encode, hardware),
    );
    let scheduler = JobScheduler::from_config(root, &cfg, Arc::new(prober), Arc::new(worker));

    let mut writer = match report {
        Some(path) => Some(ReportWriter::create(&path)?),
        None => None,
    };

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));
    let result = scheduler.run(cancel.clone(), writer.as_mut()).await;
    cancel.cancel();
    let _ = signals.await;

    let summary = result?;
    println!("{}", summary);
    if let Some(writer) = &writer {
        println!("Report written to {}", writer.path().display());
    }
    Ok(!summary.cancelled)
}

fn dedup(root: &Path, config_path: &Path, mode: Option<ModeArg>, audit: bool) -> Result<(), String> {
    let mut cfg = Config::load_or_default(config_path).map_err(|e| e.to_string())?;
    if let Some(mode) = mode {
        cfg.dedup.mode = mode.into();
    }
    if audit {
        cfg.dedup.audit = true;
    }

    let engine = DeduplicationEngine::from_config(root, &cfg.dedup);
    let (plan, summary) = engine.run().map_err(|e| e.to_string())?;

    for line in plan.decisions() {
        println!("{}", line);
    }
    if engine.is_audit() {
        println!(
            "audit: {} groups, {} entries would be deleted",
            summary.groups, summary.would_delete
        );
    } else {
        println!(
            "{} groups, {} entries deleted, {} bytes freed, {} errors",
            summary.groups, summary.deleted, summary.bytes_freed, summary.errors
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Transcode {
            root,
            config,
            max_jobs,
            min_size,
            temp_dir,
            report,
            skip_checks,
        } => match transcode(&root, &config, max_jobs, min_size, temp_dir, report, skip_checks).await
        {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(130),
            Err(e) => {
                eprintln!("vidshrink: {}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Dedup {
            root,
            config,
            mode,
            audit,
        } => match dedup(&root, &config, mode, audit) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("vidshrink: {}", e);
                ExitCode::FAILURE
            }
        },
    }
}
