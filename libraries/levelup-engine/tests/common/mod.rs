//! Shared helpers for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use levelup_engine::{
    AudioTool, EncodeRequest, LoudnessMeasurement, MeasureOptions, NormalizationSettings,
    NormalizeError, Result,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Scripted stand-in for ffmpeg
///
/// Every file it knows has a loudness and peak. Encoding raises loudness by
/// `gain * efficiency` and peak by `gain`, capped at the requested ceiling the
/// way a limiter would. Outputs are real files so renames and sweeps see them.
pub struct FakeTool {
    levels: Mutex<HashMap<PathBuf, LoudnessMeasurement>>,
    /// Artifact -> source file it descends from
    origins: Mutex<HashMap<PathBuf, PathBuf>>,
    encode_counts: Mutex<HashMap<PathBuf, usize>>,
    /// Source -> 1-based encode number that fails
    failures: Mutex<HashMap<PathBuf, usize>>,
    panics: Mutex<HashSet<PathBuf>>,
    requests: Mutex<Vec<EncodeRequest>>,
    efficiency: f64,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTool {
    pub fn new() -> Self {
        Self::with_efficiency(1.0)
    }

    /// Encodes realize only `efficiency` of the requested loudness change
    pub fn with_efficiency(efficiency: f64) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            origins: Mutex::new(HashMap::new()),
            encode_counts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
            requests: Mutex::new(Vec::new()),
            efficiency,
            delay: Duration::from_millis(5),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_level(&self, path: &Path, integrated_lufs: f64, true_peak_dbtp: f64) {
        self.levels.lock().unwrap().insert(
            path.to_path_buf(),
            LoudnessMeasurement::new(integrated_lufs, true_peak_dbtp),
        );
    }

    /// Make the `nth` encode descending from `source` fail
    pub fn fail_encode(&self, source: &Path, nth: usize) {
        self.failures.lock().unwrap().insert(source.to_path_buf(), nth);
    }

    /// Make every encode descending from `source` panic
    pub fn panic_on(&self, source: &Path) {
        self.panics.lock().unwrap().insert(source.to_path_buf());
    }

    pub fn requests(&self) -> Vec<EncodeRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, source: &Path) -> Vec<EncodeRequest> {
        let origins = self.origins.lock().unwrap();
        self.requests()
            .into_iter()
            .filter(|r| origins.get(&r.output).map(PathBuf::as_path) == Some(source))
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn origin_of(&self, path: &Path) -> PathBuf {
        self.origins
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .unwrap_or_else(|| path.to_path_buf())
    }

    async fn busy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioTool for FakeTool {
    async fn measure(&self, path: &Path, _options: &MeasureOptions) -> Result<LoudnessMeasurement> {
        self.busy().await;
        self.levels
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .ok_or_else(|| {
                NormalizeError::ToolInvocation(format!("no level for {}", path.display()))
            })
    }

    async fn encode(&self, request: &EncodeRequest) -> Result<PathBuf> {
        self.busy().await;

        let origin = self.origin_of(&request.input);
        if self.panics.lock().unwrap().contains(&origin) {
            panic!("scripted panic for {}", origin.display());
        }

        let count = {
            let mut counts = self.encode_counts.lock().unwrap();
            let count = counts.entry(origin.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if self.failures.lock().unwrap().get(&origin) == Some(&count) {
            return Err(NormalizeError::ToolInvocation(format!(
                "FFmpeg exited with exit status: 1: scripted failure for {}",
                origin.display()
            )));
        }

        let input = self
            .levels
            .lock()
            .unwrap()
            .get(&request.input)
            .copied()
            .ok_or_else(|| {
                NormalizeError::ToolInvocation(format!("no level for {}", request.input.display()))
            })?;

        let output = LoudnessMeasurement::new(
            input.integrated_lufs + request.gain_db * self.efficiency,
            (input.true_peak_dbtp + request.gain_db).min(request.true_peak_ceiling),
        );

        std::fs::write(&request.output, b"fake audio")
            .map_err(|e| NormalizeError::filesystem(&request.output, e))?;

        self.levels.lock().unwrap().insert(request.output.clone(), output);
        self.origins.lock().unwrap().insert(request.output.clone(), origin);
        self.requests.lock().unwrap().push(request.clone());

        Ok(request.output.clone())
    }
}

/// Write a placeholder source file
pub fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"source audio").unwrap();
    path
}

/// Settings writing into `output_dir`
pub fn settings_for(output_dir: &Path) -> NormalizationSettings {
    NormalizationSettings {
        target_lufs: -16.0,
        true_peak_limit: -1.0,
        output_directory: Some(output_dir.to_path_buf()),
        ..Default::default()
    }
}

/// Intermediate artifacts left in `dir`
pub fn leftover_artifacts(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(levelup_engine::ARTIFACT_PREFIX))
        })
        .collect()
}
