//! Common types for jobs, measurements and batch aggregation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Job identifier
///
/// UUID v4 strings; the intermediate-artifact naming scheme embeds them, so
/// they must stay free of path separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job ID from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random job ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a single file in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    /// `complete` and `error` are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

/// One file accepted into a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioJob {
    pub id: JobId,
    /// Display name (file name component of the source path)
    pub name: String,
    pub source_path: PathBuf,
    /// File size, unknown until the job is picked up by a worker
    pub size_bytes: Option<u64>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
}

impl AudioJob {
    /// Create a pending job for the given source file
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        let source_path = source_path.into();
        let name = source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            id: JobId::generate(),
            name,
            source_path,
            size_bytes: None,
            status: JobStatus::Pending,
            error: None,
            output_path: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `processing`. Returns false if the job is not pending.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Processing;
        true
    }

    /// Move to `complete`. Terminal jobs are never changed.
    pub fn complete(&mut self, output_path: PathBuf) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Complete;
        self.output_path = Some(output_path);
        true
    }

    /// Move to `error`. Terminal jobs are never changed.
    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Error;
        self.error = Some(message.into());
        true
    }
}

/// Result of one loudness analysis run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoudnessMeasurement {
    /// Integrated loudness (LUFS)
    pub integrated_lufs: f64,
    /// True peak (dBTP)
    pub true_peak_dbtp: f64,
    /// Loudness range (LU), when the tool reports it
    pub loudness_range: Option<f64>,
}

impl LoudnessMeasurement {
    pub fn new(integrated_lufs: f64, true_peak_dbtp: f64) -> Self {
        Self {
            integrated_lufs,
            true_peak_dbtp,
            loudness_range: None,
        }
    }
}

/// Outcome of one measure-then-encode cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassResult {
    /// 1-based pass index
    pub pass: u8,
    /// Cumulative gain relative to the source (dB) after the peak clamp
    pub gain_db: f64,
    /// Whether the peak clamp reduced the requested gain on this pass
    pub clamped: bool,
    /// Measurement of the artifact written by this pass
    pub measurement: LoudnessMeasurement,
    pub artifact: PathBuf,
}

/// Batch-level aggregate, recomputed on every job state change
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    /// Mean per-job progress in 0.0..=1.0
    pub overall_progress: f64,
}

impl BatchSummary {
    /// An empty batch is complete by definition
    pub fn empty() -> Self {
        Self {
            completed: 0,
            failed: 0,
            total: 0,
            overall_progress: 1.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed + self.failed >= self.total
    }

    pub fn summary_text(&self) -> String {
        format!(
            "Normalization complete: {} of {} files succeeded, {} failed",
            self.completed, self.total, self.failed
        )
    }
}

/// Display name of a path, used in log lines
pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
