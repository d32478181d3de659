//! Intermediate artifact lifecycle
//!
//! Every pass of a job writes `.levelup-<job id>-pass<k>.<ext>` into the output
//! directory. `JobArtifacts` tracks those files for one job and deletes them
//! when the job ends, whatever the outcome. `sweep` removes leftovers from
//! earlier runs whose job is no longer active.

use crate::error::{NormalizeError, Result};
use crate::settings::AudioFormat;
use crate::types::JobId;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File name prefix of every intermediate artifact
pub const ARTIFACT_PREFIX: &str = ".levelup-";

/// Highest numeric suffix tried when the output name is taken
const MAX_OUTPUT_SUFFIX: u32 = 10_000;

pub fn artifact_file_name(job_id: &JobId, pass: u8, format: AudioFormat) -> String {
    format!(
        "{}{}-pass{}.{}",
        ARTIFACT_PREFIX,
        job_id,
        pass,
        format.extension()
    )
}

/// Owning job of an artifact file name, if it follows the naming convention
pub fn parse_artifact_job_id(file_name: &str) -> Option<JobId> {
    let rest = file_name.strip_prefix(ARTIFACT_PREFIX)?;
    let (id, tail) = rest.rsplit_once("-pass")?;
    let (pass, ext) = tail.split_once('.')?;

    if pass.is_empty() || !pass.bytes().all(|b| b.is_ascii_digit()) || ext.is_empty() {
        return None;
    }

    Uuid::parse_str(id).ok()?;
    Some(JobId::new(id))
}

/// Set of jobs that may still own artifacts
///
/// A job is registered when it is accepted into a batch and removed only after
/// its artifacts have been released, so a sweep never races a live job.
#[derive(Debug, Clone, Default)]
pub struct ActiveJobs {
    inner: Arc<RwLock<HashSet<JobId>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: JobId) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn remove(&self, id: &JobId) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Artifacts owned by one job
pub struct JobArtifacts {
    job_id: JobId,
    dir: PathBuf,
    tracked: Vec<PathBuf>,
    reserved_output: Option<PathBuf>,
    output_committed: bool,
}

impl JobArtifacts {
    pub fn new(job_id: JobId, dir: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            dir: dir.into(),
            tracked: Vec::new(),
            reserved_output: None,
            output_committed: false,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for the artifact of a pass; tracked for cleanup
    pub fn allocate(&mut self, pass: u8, format: AudioFormat) -> PathBuf {
        let path = self.dir.join(artifact_file_name(&self.job_id, pass, format));
        if !self.tracked.contains(&path) {
            self.tracked.push(path.clone());
        }
        path
    }

    /// Paths currently tracked for deletion
    pub fn tracked(&self) -> &[PathBuf] {
        &self.tracked
    }

    /// Claim `<stem>_normalized.<ext>` (or `_<n>` variants) in the output directory
    ///
    /// The name is claimed by creating an empty placeholder, so concurrent jobs
    /// for the same source never pick the same file. The placeholder is deleted
    /// on release unless `commit_output` was called.
    pub async fn reserve_output(&mut self, stem: &str, format: AudioFormat) -> Result<PathBuf> {
        for n in 1..=MAX_OUTPUT_SUFFIX {
            let file_name = if n == 1 {
                format!("{}_normalized.{}", stem, format.extension())
            } else {
                format!("{}_normalized_{}.{}", stem, n, format.extension())
            };
            let candidate = self.dir.join(file_name);

            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(_) => {
                    debug!("Job {} reserved output {}", self.job_id, candidate.display());
                    self.reserved_output = Some(candidate.clone());
                    return Ok(candidate);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(NormalizeError::filesystem(&candidate, e)),
            }
        }

        Err(NormalizeError::filesystem(
            &self.dir,
            std::io::Error::new(ErrorKind::AlreadyExists, "no free output file name"),
        ))
    }

    /// Keep the reserved output when the job is released
    pub fn commit_output(&mut self) {
        self.output_committed = true;
    }

    /// Delete every tracked artifact (and an uncommitted output placeholder)
    ///
    /// Missing files are ignored. Returns the number of files deleted.
    pub async fn release(&mut self) -> usize {
        let mut removed = 0;

        for path in self.tracked.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove artifact {}: {}", path.display(), e),
            }
        }

        if let Some(output) = self.reserved_output.take() {
            if !self.output_committed {
                match tokio::fs::remove_file(&output).await {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove output {}: {}", output.display(), e),
                }
            }
        }

        if removed > 0 {
            debug!("Job {} released {} artifacts", self.job_id, removed);
        }
        removed
    }
}

impl Drop for JobArtifacts {
    // Reached with files still tracked only if the owning task was aborted or
    // panicked before `release` ran.
    fn drop(&mut self) {
        for path in self.tracked.drain(..) {
            let _ = std::fs::remove_file(path);
        }
        if let Some(output) = self.reserved_output.take() {
            if !self.output_committed {
                let _ = std::fs::remove_file(output);
            }
        }
    }
}

/// Outcome of a sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Orphaned artifacts deleted
    pub count: usize,
    /// Artifacts left alone because their job is active
    pub skipped_active: usize,
    /// Artifacts left alone because they were modified too recently
    pub skipped_recent: usize,
    pub message: String,
}

/// Remove orphaned artifacts from `dir`
///
/// Only files matching the artifact naming convention whose job is not in
/// `active` are deleted. Safe to run repeatedly and while jobs are running.
pub async fn sweep(dir: &Path, active: &ActiveJobs) -> Result<SweepReport> {
    sweep_stale(dir, active, Duration::ZERO).await
}

/// Like [`sweep`], but also keeps artifacts modified within `min_age`
///
/// `active` only knows the jobs of this process. Another process writing into
/// the same directory is protected by the age check alone.
pub async fn sweep_stale(
    dir: &Path,
    active: &ActiveJobs,
    min_age: Duration,
) -> Result<SweepReport> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| NormalizeError::filesystem(dir, e))?;

    let mut count = 0;
    let mut skipped_active = 0;
    let mut skipped_recent = 0;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| NormalizeError::filesystem(dir, e))?
    {
        let file_name = entry.file_name();
        let Some(job_id) = file_name.to_str().and_then(parse_artifact_job_id) else {
            continue;
        };

        let is_file = entry
            .file_type()
            .await
            .map(|t| t.is_file())
            .unwrap_or(false);
        if !is_file {
            continue;
        }

        if active.contains(&job_id) {
            skipped_active += 1;
            continue;
        }

        if !min_age.is_zero() && modified_within(&entry, min_age).await {
            skipped_recent += 1;
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Swept orphaned artifact {}", path.display());
                count += 1;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(NormalizeError::filesystem(&path, e)),
        }
    }

    let mut message = match count {
        0 => "No temporary files found".to_string(),
        1 => "Removed 1 temporary file".to_string(),
        n => format!("Removed {} temporary files", n),
    };
    if skipped_active > 0 {
        message.push_str(&format!(" ({} in use by active jobs)", skipped_active));
    }
    if skipped_recent > 0 {
        message.push_str(&format!(
            " ({} modified in the last {}s)",
            skipped_recent,
            min_age.as_secs()
        ));
    }

    info!("Sweep of {}: {}", dir.display(), message);

    Ok(SweepReport {
        count,
        skipped_active,
        skipped_recent,
        message,
    })
}

/// Unknown modification times count as recent
async fn modified_within(entry: &tokio::fs::DirEntry, min_age: Duration) -> bool {
    let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
        return true;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age < min_age)
        .unwrap_or(true)
}
