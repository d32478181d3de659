//! Normalization settings
//!
//! `NormalizationSettings` mirrors the flexible settings object supplied by the
//! UI collaborator. It is validated once at batch start into
//! `ResolvedSettings`, which is immutable and shared by every job of the batch.

use crate::error::{NormalizeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hard cap on convergence passes
pub const MAX_PASSES_CAP: u8 = 5;

/// Pass count forced by format-preservation mode
pub const PRESERVE_FORMAT_PASSES: u8 = 3;

/// Batches larger than this run in parallel even when parallel processing is off
pub const AUTO_PARALLEL_THRESHOLD: usize = 3;

/// Audio containers the engine can write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    Flac,
    Ogg,
    Opus,
    M4a,
    Aac,
    Aiff,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::M4a => "m4a",
            AudioFormat::Aac => "aac",
            AudioFormat::Aiff => "aiff",
        }
    }

    /// Lossless containers do not degrade across repeated encodes
    pub fn is_lossless(&self) -> bool {
        matches!(self, AudioFormat::Wav | AudioFormat::Flac | AudioFormat::Aiff)
    }

    /// Container matching a file extension, if the engine can write it
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            "ogg" => Some(AudioFormat::Ogg),
            "opus" => Some(AudioFormat::Opus),
            "m4a" => Some(AudioFormat::M4a),
            "aac" => Some(AudioFormat::Aac),
            "aiff" | "aif" => Some(AudioFormat::Aiff),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Extensions the measurer can decode
const DECODABLE_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "flac", "ogg", "opus", "m4a", "aac", "aiff", "aif", "wma",
];

/// Whether the file extension names a container the measurer can decode
pub fn is_decodable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            DECODABLE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// User-selectable final container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Mp3,
    Wav,
    Flac,
}

impl From<OutputFormat> for AudioFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Mp3 => AudioFormat::Mp3,
            OutputFormat::Wav => AudioFormat::Wav,
            OutputFormat::Flac => AudioFormat::Flac,
        }
    }
}

/// Settings object supplied with each batch request
///
/// Field names follow the UI's camelCase settings object; snake_case aliases
/// let the same struct be loaded from TOML files and environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizationSettings {
    /// Convergence target (LUFS), -50..=-6
    #[serde(rename = "targetLUFS", alias = "target_lufs")]
    pub target_lufs: f64,

    /// True peak ceiling (dBTP), -20..=0
    #[serde(alias = "true_peak_limit")]
    pub true_peak_limit: f64,

    /// Forces at least two passes
    #[serde(alias = "two_pass_normalization")]
    pub two_pass_normalization: bool,

    /// Final container unless `preserve_original_format` is set
    #[serde(alias = "output_format")]
    pub output_format: OutputFormat,

    /// Copy tags from the source into the output
    #[serde(alias = "preserve_metadata")]
    pub preserve_metadata: bool,

    /// Destination root; defaults to `<Music>/LevelUp`
    #[serde(alias = "output_directory")]
    pub output_directory: Option<PathBuf>,

    /// Convergence iteration cap, 1..=5
    #[serde(alias = "max_passes")]
    pub max_passes: u8,

    /// Stop once within this many LU of the target (> 0)
    #[serde(alias = "accuracy_threshold")]
    pub accuracy_threshold: f64,

    /// Worker pool size override; defaults to available parallelism - 1
    #[serde(alias = "max_concurrent_jobs")]
    pub max_concurrent_jobs: Option<usize>,

    #[serde(alias = "enable_parallel_processing")]
    pub enable_parallel_processing: bool,

    /// Write lossless intermediates between passes
    #[serde(alias = "use_high_quality_mode")]
    pub use_high_quality_mode: bool,

    /// Keep the source container and force three passes
    #[serde(alias = "preserve_original_format")]
    pub preserve_original_format: bool,

    /// Loudness range target handed to the measurer (LU)
    #[serde(rename = "customLRA", alias = "custom_lra")]
    pub loudness_range: f64,

    /// Treat mono input as dual mono when measuring
    #[serde(rename = "useDualMono", alias = "use_dual_mono")]
    pub dual_mono: bool,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            target_lufs: -21.0,
            true_peak_limit: -9.0,
            two_pass_normalization: true,
            output_format: OutputFormat::Mp3,
            preserve_metadata: true,
            output_directory: None,
            max_passes: 3,
            accuracy_threshold: 0.1,
            max_concurrent_jobs: None,
            enable_parallel_processing: true,
            use_high_quality_mode: false,
            preserve_original_format: false,
            loudness_range: 11.0,
            dual_mono: false,
        }
    }
}

impl NormalizationSettings {
    /// Validate once at batch start
    pub fn validate(&self) -> Result<ResolvedSettings> {
        check_range("targetLUFS", self.target_lufs, -50.0, -6.0)?;
        check_range("truePeakLimit", self.true_peak_limit, -20.0, 0.0)?;
        check_range("customLRA", self.loudness_range, 1.0, 50.0)?;

        if !(1..=MAX_PASSES_CAP).contains(&self.max_passes) {
            return Err(NormalizeError::InvalidSettings(format!(
                "maxPasses must be between 1 and {}, got {}",
                MAX_PASSES_CAP, self.max_passes
            )));
        }

        if !self.accuracy_threshold.is_finite() || self.accuracy_threshold <= 0.0 {
            return Err(NormalizeError::InvalidSettings(format!(
                "accuracyThreshold must be greater than 0, got {}",
                self.accuracy_threshold
            )));
        }

        if self.max_concurrent_jobs == Some(0) {
            return Err(NormalizeError::InvalidSettings(
                "maxConcurrentJobs must be at least 1".to_string(),
            ));
        }

        let output_directory = self
            .output_directory
            .clone()
            .unwrap_or_else(default_output_directory);

        Ok(ResolvedSettings {
            target_lufs: self.target_lufs,
            true_peak_limit: self.true_peak_limit,
            two_pass: self.two_pass_normalization,
            output_format: self.output_format,
            preserve_metadata: self.preserve_metadata,
            output_directory,
            max_passes: self.max_passes,
            accuracy_threshold: self.accuracy_threshold,
            max_concurrent_jobs: self.max_concurrent_jobs,
            enable_parallel_processing: self.enable_parallel_processing,
            use_high_quality_mode: self.use_high_quality_mode,
            preserve_original_format: self.preserve_original_format,
            loudness_range: self.loudness_range,
            dual_mono: self.dual_mono,
        })
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(NormalizeError::InvalidSettings(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

/// Default destination: `<Music>/LevelUp`
pub fn default_output_directory() -> PathBuf {
    dirs::audio_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Music")))
        .map(|music| music.join("LevelUp"))
        .unwrap_or_else(|| PathBuf::from("LevelUp"))
}

/// How many passes a job plans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassPlan {
    /// Upper bound on passes
    pub passes: u8,
    /// Passes that run even after convergence
    pub min_passes: u8,
}

/// Validated settings, immutable for the duration of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSettings {
    pub target_lufs: f64,
    pub true_peak_limit: f64,
    pub two_pass: bool,
    pub output_format: OutputFormat,
    pub preserve_metadata: bool,
    pub output_directory: PathBuf,
    pub max_passes: u8,
    pub accuracy_threshold: f64,
    pub max_concurrent_jobs: Option<usize>,
    pub enable_parallel_processing: bool,
    pub use_high_quality_mode: bool,
    pub preserve_original_format: bool,
    pub loudness_range: f64,
    pub dual_mono: bool,
}

impl ResolvedSettings {
    pub fn pass_plan(&self) -> PassPlan {
        if self.preserve_original_format {
            return PassPlan {
                passes: PRESERVE_FORMAT_PASSES,
                min_passes: PRESERVE_FORMAT_PASSES,
            };
        }

        if self.two_pass {
            PassPlan {
                passes: self.max_passes.clamp(2, MAX_PASSES_CAP),
                min_passes: 2,
            }
        } else {
            PassPlan {
                passes: self.max_passes.min(MAX_PASSES_CAP),
                min_passes: 1,
            }
        }
    }

    /// Final container for a given source file
    ///
    /// Format preservation overrides `output_format`; sources without an
    /// encoder mapping fall back to FLAC.
    pub fn final_format_for(&self, source: &Path) -> AudioFormat {
        if self.preserve_original_format {
            AudioFormat::from_path(source).unwrap_or(AudioFormat::Flac)
        } else {
            self.output_format.into()
        }
    }

    /// Container written by a given pass
    ///
    /// The last planned pass always writes the final container. Earlier passes
    /// write WAV in high-quality mode and the final container otherwise.
    pub fn pass_format(&self, pass: u8, planned: u8, final_format: AudioFormat) -> AudioFormat {
        if pass >= planned || !self.use_high_quality_mode {
            final_format
        } else {
            AudioFormat::Wav
        }
    }

    /// Worker pool size for a batch of `batch_size` files on this machine
    pub fn concurrency_for(&self, batch_size: usize) -> usize {
        effective_concurrency(
            self.max_concurrent_jobs,
            self.enable_parallel_processing,
            batch_size,
            num_cpus::get(),
        )
    }
}

/// Worker pool size policy
///
/// Parallelism is used when enabled or when the batch is larger than
/// `AUTO_PARALLEL_THRESHOLD`; otherwise jobs run one at a time. The pool size is
/// the explicit override if given, else `available - 1`, never below 1 and
/// never larger than the batch.
pub fn effective_concurrency(
    max_concurrent_jobs: Option<usize>,
    enable_parallel_processing: bool,
    batch_size: usize,
    available: usize,
) -> usize {
    if !enable_parallel_processing && batch_size <= AUTO_PARALLEL_THRESHOLD {
        return 1;
    }

    let workers = max_concurrent_jobs.unwrap_or_else(|| available.saturating_sub(1));
    workers.max(1).min(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn resolved(settings: NormalizationSettings) -> ResolvedSettings {
        settings.validate().unwrap()
    }

    #[test]
    fn defaults_match_app_defaults() {
        let settings = NormalizationSettings::default();
        assert_eq!(settings.target_lufs, -21.0);
        assert_eq!(settings.true_peak_limit, -9.0);
        assert_eq!(settings.max_passes, 3);
        assert_eq!(settings.accuracy_threshold, 0.1);
        assert!(settings.two_pass_normalization);
        assert!(settings.max_concurrent_jobs.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn deserializes_ui_settings_object() {
        let json = r#"{
            "targetLUFS": -16,
            "truePeakLimit": -1,
            "twoPassNormalization": false,
            "outputFormat": "flac",
            "preserveMetadata": false,
            "maxPasses": 4,
            "accuracyThreshold": 0.05,
            "maxConcurrentJobs": 2,
            "useHighQualityMode": true,
            "customLRA": 7
        }"#;
        let settings: NormalizationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.target_lufs, -16.0);
        assert_eq!(settings.output_format, OutputFormat::Flac);
        assert_eq!(settings.max_concurrent_jobs, Some(2));
        assert_eq!(settings.loudness_range, 7.0);
        // Missing fields take defaults
        assert!(!settings.preserve_original_format);
        assert!(settings.enable_parallel_processing);
    }

    #[test]
    fn snake_case_aliases_are_accepted() {
        let json = r#"{ "target_lufs": -14, "max_passes": 2, "use_high_quality_mode": true }"#;
        let settings: NormalizationSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.target_lufs, -14.0);
        assert_eq!(settings.max_passes, 2);
        assert!(settings.use_high_quality_mode);
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        let cases = [
            NormalizationSettings {
                target_lufs: -60.0,
                ..Default::default()
            },
            NormalizationSettings {
                true_peak_limit: 0.5,
                ..Default::default()
            },
            NormalizationSettings {
                max_passes: 0,
                ..Default::default()
            },
            NormalizationSettings {
                max_passes: 6,
                ..Default::default()
            },
            NormalizationSettings {
                accuracy_threshold: 0.0,
                ..Default::default()
            },
            NormalizationSettings {
                accuracy_threshold: f64::NAN,
                ..Default::default()
            },
            NormalizationSettings {
                true_peak_limit: f64::NEG_INFINITY,
                ..Default::default()
            },
            NormalizationSettings {
                loudness_range: 0.5,
                ..Default::default()
            },
            NormalizationSettings {
                loudness_range: 51.0,
                ..Default::default()
            },
            NormalizationSettings {
                max_concurrent_jobs: Some(0),
                ..Default::default()
            },
        ];

        for settings in cases {
            let err = settings.validate().unwrap_err();
            assert_eq!(err.kind(), "invalid_settings", "{:?}", settings);
        }
    }

    #[test]
    fn explicit_output_directory_is_kept() {
        let settings = resolved(NormalizationSettings {
            output_directory: Some(PathBuf::from("/tmp/levelup-out")),
            ..Default::default()
        });
        assert_eq!(settings.output_directory, PathBuf::from("/tmp/levelup-out"));
    }

    #[test]
    fn default_output_directory_ends_with_levelup() {
        assert!(default_output_directory().ends_with("LevelUp"));
    }

    #[test]
    fn two_pass_forces_minimum_of_two() {
        let settings = resolved(NormalizationSettings {
            two_pass_normalization: true,
            max_passes: 1,
            ..Default::default()
        });
        assert_eq!(settings.pass_plan(), PassPlan { passes: 2, min_passes: 2 });

        let settings = resolved(NormalizationSettings {
            two_pass_normalization: false,
            max_passes: 1,
            ..Default::default()
        });
        assert_eq!(settings.pass_plan(), PassPlan { passes: 1, min_passes: 1 });
    }

    #[test]
    fn preserve_original_format_forces_three_exact_passes() {
        let settings = resolved(NormalizationSettings {
            preserve_original_format: true,
            max_passes: 5,
            output_format: OutputFormat::Mp3,
            ..Default::default()
        });
        assert_eq!(settings.pass_plan(), PassPlan { passes: 3, min_passes: 3 });
        assert_eq!(
            settings.final_format_for(Path::new("/music/a.FLAC")),
            AudioFormat::Flac
        );
        assert_eq!(
            settings.final_format_for(Path::new("/music/a.wma")),
            AudioFormat::Flac
        );
    }

    #[test]
    fn output_format_used_without_preservation() {
        let settings = resolved(NormalizationSettings {
            output_format: OutputFormat::Wav,
            ..Default::default()
        });
        assert_eq!(
            settings.final_format_for(Path::new("/music/a.flac")),
            AudioFormat::Wav
        );
    }

    #[test]
    fn intermediate_container_selection() {
        let hq = resolved(NormalizationSettings {
            use_high_quality_mode: true,
            ..Default::default()
        });
        assert_eq!(hq.pass_format(1, 3, AudioFormat::Mp3), AudioFormat::Wav);
        assert_eq!(hq.pass_format(2, 3, AudioFormat::Mp3), AudioFormat::Wav);
        assert_eq!(hq.pass_format(3, 3, AudioFormat::Mp3), AudioFormat::Mp3);

        let lossy = resolved(NormalizationSettings::default());
        assert_eq!(lossy.pass_format(1, 3, AudioFormat::Mp3), AudioFormat::Mp3);
    }

    #[test]
    fn decodable_extensions() {
        assert!(is_decodable(Path::new("/a/b.MP3")));
        assert!(is_decodable(Path::new("/a/b.wma")));
        assert!(!is_decodable(Path::new("/a/b.txt")));
        assert!(!is_decodable(Path::new("/a/noext")));
    }

    #[test]
    fn concurrency_policy() {
        // Small batch with parallelism disabled runs sequentially
        assert_eq!(effective_concurrency(Some(4), false, 3, 8), 1);
        // Large batch auto-enables parallelism
        assert_eq!(effective_concurrency(Some(4), false, 10, 8), 4);
        // Auto-detect uses available - 1
        assert_eq!(effective_concurrency(None, true, 10, 8), 7);
        // Single core still gets one worker
        assert_eq!(effective_concurrency(None, true, 10, 1), 1);
        // Never more workers than jobs
        assert_eq!(effective_concurrency(Some(8), true, 2, 8), 2);
        // Empty batch
        assert_eq!(effective_concurrency(None, true, 0, 8), 1);
    }

    proptest! {
        #[test]
        fn concurrency_is_bounded(
            max in proptest::option::of(1usize..64),
            parallel in any::<bool>(),
            batch in 0usize..200,
            available in 0usize..128,
        ) {
            let workers = effective_concurrency(max, parallel, batch, available);
            prop_assert!(workers >= 1);
            prop_assert!(workers <= batch.max(1));
            if let Some(max) = max {
                prop_assert!(workers <= max);
            }
        }
    }
}
