//! Single-file normalization
//!
//! Drives the iterative convergence loop for one file:
//! measure → compute gain → encode → re-measure → continue or stop.
//!
//! ```text
//! Pending → Measuring → Correcting → (Measuring | Converged) → Finalizing → Complete
//!                                  ↘ Error (from any non-terminal state)
//! ```
//!
//! Each pass encodes the previous pass's artifact (the source for pass 1) with
//! the difference between the new cumulative gain and the gain already baked
//! into that artifact. The cumulative gain is clamped on every pass so the
//! projected peak (`source peak + gain`) never exceeds the ceiling.

use crate::artifacts::JobArtifacts;
use crate::error::{NormalizeError, Result};
use crate::settings::{is_decodable, AudioFormat, ResolvedSettings};
use crate::tool::{AudioTool, EncodeRequest, MeasureOptions};
use crate::types::{display_name, JobId, LoudnessMeasurement, PassResult};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Integrated loudness at or below this is treated as silence (BS.1770 absolute gate)
pub const SILENCE_FLOOR_LUFS: f64 = -70.0;

/// States of the per-job state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizerState {
    Pending,
    Measuring,
    Correcting,
    Converged,
    Finalizing,
    Complete,
    Error,
}

/// Progress callback: current state and job progress in 0.0..=1.0
pub type ProgressFn<'a> = &'a (dyn Fn(NormalizerState, f64) + Send + Sync);

/// Clamp a gain so `peak + gain` does not exceed `ceiling`
///
/// Returns the safe gain and whether it was reduced.
pub fn peak_safe_gain(gain_db: f64, peak_dbtp: f64, ceiling_dbtp: f64) -> (f64, bool) {
    if peak_dbtp + gain_db > ceiling_dbtp {
        (ceiling_dbtp - peak_dbtp, true)
    } else {
        (gain_db, false)
    }
}

/// Result of a successful normalization
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationOutcome {
    pub output_path: PathBuf,
    pub format: AudioFormat,
    pub source: LoudnessMeasurement,
    pub passes: Vec<PassResult>,
    /// Final artifact within the accuracy threshold of the target
    pub converged: bool,
}

impl NormalizationOutcome {
    /// Measurement of the final artifact
    pub fn final_measurement(&self) -> LoudnessMeasurement {
        self.passes
            .last()
            .map(|p| p.measurement)
            .unwrap_or(self.source)
    }
}

pub struct SingleFileNormalizer<'a> {
    tool: &'a dyn AudioTool,
    settings: &'a ResolvedSettings,
    cancel: CancellationToken,
}

impl<'a> SingleFileNormalizer<'a> {
    pub fn new(tool: &'a dyn AudioTool, settings: &'a ResolvedSettings) -> Self {
        Self {
            tool,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Check `cancel` at every pass boundary
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Normalize `source`, releasing every intermediate artifact afterwards
    ///
    /// Intermediates are deleted on success and on failure; only the final
    /// output survives.
    pub async fn run(
        &self,
        job_id: &JobId,
        source: &Path,
        on_progress: ProgressFn<'_>,
    ) -> Result<NormalizationOutcome> {
        let mut artifacts = JobArtifacts::new(job_id.clone(), &self.settings.output_directory);
        let result = self.normalize(source, &mut artifacts, on_progress).await;
        artifacts.release().await;

        match &result {
            Ok(outcome) => {
                on_progress(NormalizerState::Complete, 1.0);
                let last = outcome.final_measurement();
                info!(
                    "Normalized {} in {} passes: {:.2} LUFS / {:.2} dBTP{}",
                    display_name(source),
                    outcome.passes.len(),
                    last.integrated_lufs,
                    last.true_peak_dbtp,
                    if outcome.converged { "" } else { " (best effort)" }
                );
            }
            Err(e) => debug!("Job {} -> {:?}: {}", job_id, NormalizerState::Error, e),
        }

        result
    }

    /// Run the convergence loop, tracking artifacts in `artifacts`
    ///
    /// The caller owns cleanup of `artifacts`.
    pub async fn normalize(
        &self,
        source: &Path,
        artifacts: &mut JobArtifacts,
        on_progress: ProgressFn<'_>,
    ) -> Result<NormalizationOutcome> {
        let settings = self.settings;
        let job_id = artifacts.job_id().clone();
        let target = settings.target_lufs;
        let ceiling = settings.true_peak_limit;
        let plan = settings.pass_plan();
        let final_format = settings.final_format_for(source);
        let total_steps = f64::from(plan.passes) + 2.0;
        let options = MeasureOptions::from(settings);

        if !is_decodable(source) {
            return Err(NormalizeError::UnsupportedFormat(source.display().to_string()));
        }
        self.check_cancelled()?;

        debug!("Job {} -> {:?}", job_id, NormalizerState::Measuring);
        on_progress(NormalizerState::Measuring, 0.0);
        let source_level = self.tool.measure(source, &options).await?;
        ensure_measurable(&source_level, source)?;
        on_progress(NormalizerState::Measuring, 1.0 / total_steps);

        info!(
            "Measured {}: {:.2} LUFS / {:.2} dBTP (target {:.1} LUFS, ceiling {:.1} dBTP, {} passes)",
            display_name(source),
            source_level.integrated_lufs,
            source_level.true_peak_dbtp,
            target,
            ceiling,
            plan.passes
        );

        tokio::fs::create_dir_all(artifacts.dir())
            .await
            .map_err(|e| NormalizeError::filesystem(artifacts.dir(), e))?;

        let metadata_source = settings.preserve_metadata.then(|| source.to_path_buf());
        let mut gain = target - source_level.integrated_lufs;
        let mut applied = 0.0;
        let mut input = source.to_path_buf();
        let mut last_format = final_format;
        let mut passes: Vec<PassResult> = Vec::with_capacity(usize::from(plan.passes));
        let mut converged = false;

        for pass in 1..=plan.passes {
            self.check_cancelled()?;

            debug!("Job {} -> {:?} (pass {})", job_id, NormalizerState::Correcting, pass);
            on_progress(NormalizerState::Correcting, f64::from(pass) / total_steps);

            let (safe_gain, clamped) = peak_safe_gain(gain, source_level.true_peak_dbtp, ceiling);
            if clamped {
                info!(
                    "Pass {}: gain {:+.2} dB would peak at {:.2} dBTP, clamped to {:+.2} dB",
                    pass,
                    gain,
                    source_level.true_peak_dbtp + gain,
                    safe_gain
                );
            }
            gain = safe_gain;

            let format = settings.pass_format(pass, plan.passes, final_format);
            let artifact = artifacts.allocate(pass, format);
            let request = EncodeRequest {
                input: input.clone(),
                output: artifact.clone(),
                gain_db: gain - applied,
                true_peak_ceiling: ceiling,
                format,
                metadata_source: if format == final_format {
                    metadata_source.clone()
                } else {
                    None
                },
            };
            self.tool.encode(&request).await?;
            applied = gain;

            debug!("Job {} -> {:?} (pass {})", job_id, NormalizerState::Measuring, pass);
            let level = self.tool.measure(&artifact, &options).await?;
            ensure_measurable(&level, &artifact)?;

            let error = (level.integrated_lufs - target).abs();
            converged = error <= settings.accuracy_threshold;
            info!(
                "Pass {}/{}: gain {:+.2} dB -> {:.2} LUFS / {:.2} dBTP (error {:.2} LU)",
                pass,
                plan.passes,
                gain,
                level.integrated_lufs,
                level.true_peak_dbtp,
                error
            );

            passes.push(PassResult {
                pass,
                gain_db: gain,
                clamped,
                measurement: level,
                artifact: artifact.clone(),
            });
            input = artifact;
            last_format = format;
            on_progress(NormalizerState::Measuring, f64::from(pass + 1) / total_steps);

            if converged && pass >= plan.min_passes {
                debug!("Job {} -> {:?}", job_id, NormalizerState::Converged);
                on_progress(NormalizerState::Converged, f64::from(pass + 1) / total_steps);
                break;
            }

            gain += target - level.integrated_lufs;
        }

        if !converged {
            info!(
                "{} did not converge within {} passes; keeping best effort",
                display_name(source),
                plan.passes
            );
        }

        debug!("Job {} -> {:?}", job_id, NormalizerState::Finalizing);
        on_progress(NormalizerState::Finalizing, (total_steps - 1.0) / total_steps);

        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| job_id.to_string());
        let output_path = artifacts.reserve_output(&stem, final_format).await?;

        if last_format == final_format {
            tokio::fs::rename(&input, &output_path)
                .await
                .map_err(|e| NormalizeError::filesystem(&output_path, e))?;
        } else {
            debug!(
                "Converting {:?} intermediate to {:?} for {}",
                last_format,
                final_format,
                display_name(source)
            );
            self.tool
                .encode(&EncodeRequest {
                    input: input.clone(),
                    output: output_path.clone(),
                    gain_db: 0.0,
                    true_peak_ceiling: ceiling,
                    format: final_format,
                    metadata_source,
                })
                .await?;
        }
        artifacts.commit_output();

        Ok(NormalizationOutcome {
            output_path,
            format: final_format,
            source: source_level,
            passes,
            converged,
        })
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NormalizeError::Cancelled);
        }
        Ok(())
    }
}

fn ensure_measurable(level: &LoudnessMeasurement, path: &Path) -> Result<()> {
    if !level.integrated_lufs.is_finite()
        || level.integrated_lufs <= SILENCE_FLOOR_LUFS
        || level.true_peak_dbtp.is_nan()
    {
        return Err(NormalizeError::Measurement(format!(
            "{} is silent or too quiet to measure ({} LUFS)",
            display_name(path),
            level.integrated_lufs
        )));
    }
    Ok(())
}
