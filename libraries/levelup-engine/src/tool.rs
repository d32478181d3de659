//! Measurer/encoder adapter contract
//!
//! The engine never analyses or encodes audio itself. It delegates both to an
//! external tool behind this trait, which keeps the convergence loop testable
//! with a scripted implementation.

use crate::error::Result;
use crate::settings::{AudioFormat, ResolvedSettings};
use crate::types::LoudnessMeasurement;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Analysis parameters forwarded to the measurer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasureOptions {
    pub target_lufs: f64,
    pub true_peak_limit: f64,
    pub loudness_range: f64,
    pub dual_mono: bool,
}

impl From<&ResolvedSettings> for MeasureOptions {
    fn from(settings: &ResolvedSettings) -> Self {
        Self {
            target_lufs: settings.target_lufs,
            true_peak_limit: settings.true_peak_limit,
            loudness_range: settings.loudness_range,
            dual_mono: settings.dual_mono,
        }
    }
}

impl Default for MeasureOptions {
    fn default() -> Self {
        Self {
            target_lufs: -23.0,
            true_peak_limit: -1.0,
            loudness_range: 11.0,
            dual_mono: false,
        }
    }
}

/// One gain-and-limit encode
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Fixed gain applied before the limiter (dB)
    pub gain_db: f64,
    /// Hard limiter ceiling (dBTP)
    pub true_peak_ceiling: f64,
    pub format: AudioFormat,
    /// File whose tags are copied into the output; `None` strips tags
    pub metadata_source: Option<PathBuf>,
}

/// External audio coder/measurer
///
/// Implementations perform no retries; failures propagate to the caller.
#[async_trait]
pub trait AudioTool: Send + Sync {
    /// Measure integrated loudness and true peak of a file
    ///
    /// # Errors
    /// `UnsupportedFormat` if the container cannot be decoded,
    /// `ToolInvocation` on a failed run or unparseable output.
    async fn measure(&self, path: &Path, options: &MeasureOptions) -> Result<LoudnessMeasurement>;

    /// Apply gain and a true peak limiter, writing `request.output`
    ///
    /// Overwrites the output if present and returns its path.
    ///
    /// # Errors
    /// `ToolInvocation` on a failed run.
    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf>;
}
