//! Batch loudness normalization for LevelUp
//!
//! This crate provides:
//! - Iterative LUFS targeting with a mandatory true peak clamp on every pass
//! - A bounded worker pool with per-file failure isolation and batch aggregation
//! - Scoped cleanup of intermediate files plus an orphan sweep
//! - Progress events for a UI collaborator
//!
//! Audio is never decoded in-process: measuring and encoding are delegated to an
//! external tool (ffmpeg by default) behind the [`AudioTool`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌───────────────────────┐
//! │ paths +      │ ──► │ BatchScheduler │ ──► │ SingleFileNormalizer  │ (one per worker)
//! │ settings     │     └────────────────┘     └───────────────────────┘
//! └──────────────┘             │                  │               │
//!                              ▼                  ▼               ▼
//!                     ┌──────────────────┐  ┌───────────┐  ┌──────────────┐
//!                     │ ProgressReporter │  │ AudioTool │  │ JobArtifacts │
//!                     └──────────────────┘  │ (ffmpeg)  │  └──────────────┘
//!                              │            └───────────┘
//!                              ▼
//!                     NormalizeEvent stream
//! ```
//!
//! # Example
//!
//! ```ignore
//! use levelup_engine::{NormalizationEngine, NormalizationSettings};
//!
//! let engine = NormalizationEngine::with_ffmpeg("ffmpeg");
//! let settings = NormalizationSettings {
//!     target_lufs: -16.0,
//!     true_peak_limit: -1.0,
//!     ..Default::default()
//! };
//!
//! let summary = engine.process_audio(vec!["/music/a.flac".into()], &settings).await?;
//! println!("{}", summary.summary_text());
//! ```

#![deny(unsafe_code)]

mod artifacts;
mod engine;
mod error;
mod ffmpeg;
mod normalizer;
mod progress;
mod scheduler;
mod settings;
mod tool;
mod types;

pub use artifacts::{
    artifact_file_name, parse_artifact_job_id, sweep, sweep_stale, ActiveJobs, JobArtifacts,
    SweepReport, ARTIFACT_PREFIX,
};
pub use engine::{CleanupResult, NormalizationEngine};
pub use error::{NormalizeError, Result};
pub use ffmpeg::{encode_args, measure_args, parse_loudnorm_report, FfmpegTool};
pub use normalizer::{
    peak_safe_gain, NormalizationOutcome, NormalizerState, ProgressFn, SingleFileNormalizer,
    SILENCE_FLOOR_LUFS,
};
pub use progress::{FileProgress, NormalizeEvent, ProgressReporter};
pub use scheduler::{BatchHandle, BatchReport, BatchScheduler};
pub use settings::{
    default_output_directory, effective_concurrency, is_decodable, AudioFormat,
    NormalizationSettings, OutputFormat, PassPlan, ResolvedSettings, AUTO_PARALLEL_THRESHOLD,
    MAX_PASSES_CAP, PRESERVE_FORMAT_PASSES,
};
pub use tool::{AudioTool, EncodeRequest, MeasureOptions};
pub use types::{AudioJob, BatchSummary, JobId, JobStatus, LoudnessMeasurement, PassResult};
