/// LevelUp - batch loudness normalization
mod settings;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use levelup_engine::{
    default_output_directory, FfmpegTool, JobStatus, NormalizationEngine, NormalizationSettings,
    NormalizeEvent, OutputFormat,
};
use settings::CliConfig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "levelup")]
#[command(
    about = "Batch loudness normalization to a LUFS target with true peak limiting",
    long_about = None
)]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (defaults to ./levelup.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize audio files
    Normalize(NormalizeArgs),
    /// Remove leftover intermediate files
    ///
    /// Artifacts of a `normalize` run in another process are only recognised by
    /// age, so files modified within `--min-age` seconds are kept.
    Cleanup {
        /// Directory to sweep (defaults to the output directory)
        dir: Option<PathBuf>,

        /// Keep artifacts modified within this many seconds (0 sweeps everything)
        #[arg(long, default_value_t = 600)]
        min_age: u64,
    },
    /// Measure a single file
    Probe {
        /// Audio file
        file: PathBuf,
    },
}

#[derive(Args)]
struct NormalizeArgs {
    /// Audio files to normalize
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Target integrated loudness (LUFS)
    #[arg(short, long, allow_negative_numbers = true)]
    target: Option<f64>,

    /// True peak ceiling (dBTP)
    #[arg(long, allow_negative_numbers = true)]
    true_peak: Option<f64>,

    /// Output format
    #[arg(short, long, value_enum)]
    format: Option<FormatArg>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Maximum normalization passes (1-5)
    #[arg(long)]
    max_passes: Option<u8>,

    /// Stop once within this many LU of the target
    #[arg(long)]
    accuracy: Option<f64>,

    /// Worker count
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Keep each file's container and run three passes
    #[arg(long)]
    preserve_format: bool,

    /// Use lossless intermediates between passes
    #[arg(long)]
    high_quality: bool,

    /// Strip tags instead of copying them
    #[arg(long)]
    no_metadata: bool,

    /// Allow stopping after a single pass
    #[arg(long)]
    single_pass: bool,

    /// Print events and the summary as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Mp3,
    Wav,
    Flac,
}

impl From<FormatArg> for OutputFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Mp3 => OutputFormat::Mp3,
            FormatArg::Wav => OutputFormat::Wav,
            FormatArg::Flac => OutputFormat::Flac,
        }
    }
}

impl NormalizeArgs {
    /// Layer command-line overrides on top of configured settings
    fn apply(&self, settings: &mut NormalizationSettings) {
        if let Some(target) = self.target {
            settings.target_lufs = target;
        }
        if let Some(true_peak) = self.true_peak {
            settings.true_peak_limit = true_peak;
        }
        if let Some(format) = self.format {
            settings.output_format = format.into();
        }
        if let Some(output) = &self.output {
            settings.output_directory = Some(output.clone());
        }
        if let Some(max_passes) = self.max_passes {
            settings.max_passes = max_passes;
        }
        if let Some(accuracy) = self.accuracy {
            settings.accuracy_threshold = accuracy;
        }
        if let Some(jobs) = self.jobs {
            settings.max_concurrent_jobs = Some(jobs);
            settings.enable_parallel_processing = jobs > 1;
        }
        if self.preserve_format {
            settings.preserve_original_format = true;
        }
        if self.high_quality {
            settings.use_high_quality_mode = true;
        }
        if self.no_metadata {
            settings.preserve_metadata = false;
        }
        if self.single_pass {
            settings.two_pass_normalization = false;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose {
        "levelup=debug,levelup_engine=debug"
    } else {
        "levelup=info,levelup_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Normalize(args) => normalize(&config, args).await,
        Commands::Cleanup { dir, min_age } => {
            cleanup(&config, dir, Duration::from_secs(min_age)).await
        }
        Commands::Probe { file } => probe(&config, &file).await,
    }
}

async fn normalize(config: &CliConfig, args: NormalizeArgs) -> anyhow::Result<ExitCode> {
    let mut settings = config.normalization.clone();
    args.apply(&mut settings);

    let ffmpeg = FfmpegTool::new(config.engine.ffmpeg_path.clone());
    let version = ffmpeg.version().await.with_context(|| {
        format!("FFmpeg not found at {}", config.engine.ffmpeg_path.display())
    })?;
    tracing::debug!("Using {}", version);

    let engine = NormalizationEngine::with_ffmpeg(config.engine.ffmpeg_path.clone());
    let (mut events, handle) = engine.start(args.files.clone(), &settings)?;

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling batch");
            cancel.cancel();
        }
    });

    let batch = tokio::spawn(handle.join());

    let bar = if args.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("#>-"),
    );

    while let Some(event) = events.recv().await {
        if args.json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }

        match event {
            NormalizeEvent::Batch(summary) => {
                bar.set_position((summary.overall_progress * 100.0).round() as u64);
                bar.set_message(format!(
                    "{}/{} files",
                    summary.completed + summary.failed,
                    summary.total
                ));
            }
            NormalizeEvent::File(progress) => {
                if let Some(error) = progress.error {
                    bar.println(format!("✗ {}: {}", file_label(&progress.file_path), error));
                }
            }
            NormalizeEvent::JobStatus {
                file_path,
                status: JobStatus::Complete,
                ..
            } => {
                bar.println(format!("✓ {}", file_label(&file_path)));
            }
            NormalizeEvent::JobStatus { .. } => {}
        }
    }

    let report = batch.await.context("Batch task failed")?;
    bar.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string(&report.summary)?);
    } else {
        for job in &report.jobs {
            if let Some(output) = &job.output_path {
                println!("{} -> {}", job.name, output.display());
            }
        }
        println!("{}", report.summary.summary_text());
    }

    Ok(if report.summary.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn cleanup(
    config: &CliConfig,
    dir: Option<PathBuf>,
    min_age: Duration,
) -> anyhow::Result<ExitCode> {
    let dir = dir
        .or_else(|| config.normalization.output_directory.clone())
        .unwrap_or_else(default_output_directory);

    let engine = NormalizationEngine::with_ffmpeg(config.engine.ffmpeg_path.clone());
    let result = engine.cleanup_stale_temp_files(&dir, min_age).await;
    println!("{}", result.message);

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn probe(config: &CliConfig, file: &Path) -> anyhow::Result<ExitCode> {
    let engine = NormalizationEngine::with_ffmpeg(config.engine.ffmpeg_path.clone());
    let level = engine
        .measure(file)
        .await
        .with_context(|| format!("Failed to measure {}", file.display()))?;

    println!(
        "{}: {:.2} LUFS, {:.2} dBTP",
        file.display(),
        level.integrated_lufs,
        level.true_peak_dbtp
    );
    if let Some(range) = level.loudness_range {
        println!("Loudness range: {:.2} LU", range);
    }

    Ok(ExitCode::SUCCESS)
}

fn file_label(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}
