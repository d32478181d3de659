//! Entry point for the UI collaborator

use crate::artifacts::{sweep_stale, ActiveJobs};
use crate::error::{NormalizeError, Result};
use crate::ffmpeg::FfmpegTool;
use crate::progress::NormalizeEvent;
use crate::scheduler::{BatchHandle, BatchScheduler};
use crate::settings::{is_decodable, NormalizationSettings};
use crate::tool::{AudioTool, MeasureOptions};
use crate::types::{BatchSummary, LoudnessMeasurement};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Outcome of a temp-file sweep, as reported to the UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Loudness normalization engine
///
/// Owns the audio tool and the set of active jobs shared by every batch it
/// starts, so a sweep issued through the same engine never touches artifacts
/// of a running job.
#[derive(Clone)]
pub struct NormalizationEngine {
    tool: Arc<dyn AudioTool>,
    active: ActiveJobs,
}

impl NormalizationEngine {
    pub fn new(tool: Arc<dyn AudioTool>) -> Self {
        Self {
            tool,
            active: ActiveJobs::new(),
        }
    }

    /// Engine backed by the ffmpeg binary at `ffmpeg_path`
    pub fn with_ffmpeg(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FfmpegTool::new(ffmpeg_path.into())))
    }

    pub fn active_jobs(&self) -> &ActiveJobs {
        &self.active
    }

    /// Start a batch and return its event stream and handle
    ///
    /// # Errors
    /// `InvalidSettings` if the settings fail validation.
    pub fn start(
        &self,
        paths: Vec<PathBuf>,
        settings: &NormalizationSettings,
    ) -> Result<(mpsc::UnboundedReceiver<NormalizeEvent>, BatchHandle)> {
        BatchScheduler::new(Arc::clone(&self.tool), self.active.clone()).run(paths, settings)
    }

    /// Normalize every file and wait for the batch summary
    ///
    /// Individual file failures are counted in the summary, never returned.
    ///
    /// # Errors
    /// `InvalidSettings` if the settings fail validation.
    pub async fn process_audio(
        &self,
        paths: Vec<PathBuf>,
        settings: &NormalizationSettings,
    ) -> Result<BatchSummary> {
        let (_, handle) = self.start(paths, settings)?;
        Ok(handle.join().await.summary)
    }

    /// Delete orphaned intermediate files in `dir`
    pub async fn cleanup_temp_files(&self, dir: &Path) -> CleanupResult {
        self.cleanup_stale_temp_files(dir, Duration::ZERO).await
    }

    /// Delete orphaned intermediate files older than `min_age`
    ///
    /// Use a non-zero age when another engine may be writing into `dir`.
    pub async fn cleanup_stale_temp_files(&self, dir: &Path, min_age: Duration) -> CleanupResult {
        match sweep_stale(dir, &self.active, min_age).await {
            Ok(report) => CleanupResult {
                success: true,
                message: report.message,
                count: Some(report.count),
            },
            Err(e) => {
                warn!("Temp file cleanup failed: {}", e);
                CleanupResult {
                    success: false,
                    message: e.to_string(),
                    count: None,
                }
            }
        }
    }

    /// Measure a single file with default analysis parameters
    ///
    /// # Errors
    /// `UnsupportedFormat` for undecodable files, `ToolInvocation` if the tool fails.
    pub async fn measure(&self, path: &Path) -> Result<LoudnessMeasurement> {
        if !is_decodable(path) {
            return Err(NormalizeError::UnsupportedFormat(path.display().to_string()));
        }
        self.tool.measure(path, &MeasureOptions::default()).await
    }
}
