//! Batch scheduling
//!
//! A batch is a fixed pool of workers pulling jobs from a shared queue. Each
//! worker runs one job at a time to completion before pulling the next.
//! Job state lives behind a single lock; every transition that changes the
//! batch aggregate is applied and reported under that lock, so counts are
//! never lost and events leave in the order the state changed.

use crate::artifacts::ActiveJobs;
use crate::error::{NormalizeError, Result};
use crate::normalizer::{NormalizationOutcome, NormalizerState, SingleFileNormalizer};
use crate::progress::{NormalizeEvent, ProgressReporter};
use crate::settings::{NormalizationSettings, ResolvedSettings};
use crate::tool::AudioTool;
use crate::types::{AudioJob, BatchSummary, JobId, JobStatus};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Dispatches batches onto worker pools
pub struct BatchScheduler {
    tool: Arc<dyn AudioTool>,
    active: ActiveJobs,
}

impl BatchScheduler {
    pub fn new(tool: Arc<dyn AudioTool>, active: ActiveJobs) -> Self {
        Self { tool, active }
    }

    /// Start a batch
    ///
    /// Settings are validated once, up front; invalid settings reject the whole
    /// batch before any job is created. After that the batch never fails: each
    /// file's error is recorded on its job.
    ///
    /// Returns the event stream and a handle resolving to the final report.
    /// The stream ends once the batch has finished and the handle is gone.
    pub fn run(
        &self,
        paths: Vec<PathBuf>,
        settings: &NormalizationSettings,
    ) -> Result<(mpsc::UnboundedReceiver<NormalizeEvent>, BatchHandle)> {
        let settings = settings.validate()?;
        let workers = settings.concurrency_for(paths.len());
        let (reporter, events) = ProgressReporter::channel();

        let jobs: Vec<JobEntry> = paths
            .into_iter()
            .map(|path| JobEntry {
                job: AudioJob::new(path),
                progress: 0.0,
                withdrawn: false,
            })
            .collect();
        for entry in &jobs {
            self.active.insert(entry.job.id.clone());
        }

        info!(
            "Starting batch of {} files with {} workers (target {:.1} LUFS, ceiling {:.1} dBTP)",
            jobs.len(),
            workers,
            settings.target_lufs,
            settings.true_peak_limit
        );

        let shared = Arc::new(Shared {
            queue: tokio::sync::Mutex::new((0..jobs.len()).collect()),
            state: Mutex::new(BatchState { jobs }),
            tool: Arc::clone(&self.tool),
            settings,
            reporter,
            active: self.active.clone(),
            cancel: CancellationToken::new(),
        });

        {
            let state = shared.state();
            shared.reporter.batch_progress(state.summary());
        }

        let workers = (0..workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    debug!("Normalization worker {} started", worker_id);
                    shared.worker_loop(worker_id).await;
                    debug!("Normalization worker {} finished", worker_id);
                })
            })
            .collect();

        Ok((events, BatchHandle { shared, workers }))
    }
}

/// Final state of a batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub summary: BatchSummary,
    /// Every job that was not withdrawn, in input order
    pub jobs: Vec<AudioJob>,
}

/// Control over a running batch
///
/// Dropping the handle does not stop the batch.
pub struct BatchHandle {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchHandle {
    /// Current aggregate
    pub fn summary(&self) -> BatchSummary {
        self.shared.state().summary()
    }

    /// Snapshot of every job not withdrawn
    pub fn jobs(&self) -> Vec<AudioJob> {
        self.shared.state().live_jobs()
    }

    /// Stop the batch cooperatively
    ///
    /// Running jobs stop at their next pass boundary; queued jobs are failed
    /// without starting. Both end as `error` with the message "cancelled".
    pub fn cancel(&self) {
        info!("Cancelling batch");
        self.shared.cancel.cancel();
    }

    /// Token that cancels this batch, usable after the handle is consumed
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Remove a job that has not started yet
    ///
    /// The job leaves the batch entirely and no longer counts towards `total`.
    /// Returns false if the job is unknown or already picked up by a worker.
    pub async fn withdraw(&self, job_id: &JobId) -> bool {
        let mut queue = self.shared.queue.lock().await;

        let mut state = self.shared.state();
        let Some(position) = queue
            .iter()
            .position(|&index| state.jobs[index].job.id == *job_id)
        else {
            return false;
        };

        if let Some(index) = queue.remove(position) {
            state.jobs[index].withdrawn = true;
            debug!("Withdrew job {} ({})", job_id, state.jobs[index].job.name);
        }
        self.shared.active.remove(job_id);
        self.shared.reporter.batch_progress(state.summary());
        true
    }

    /// Wait for every job to reach a terminal state
    pub async fn join(self) -> BatchReport {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Normalization worker stopped unexpectedly: {}", e);
            }
        }

        let mut state = self.shared.state();

        // Only reachable if a worker died between jobs
        let stranded: Vec<usize> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.withdrawn && !entry.job.is_terminal())
            .map(|(index, _)| index)
            .collect();
        for index in stranded {
            let error =
                NormalizeError::Worker("worker stopped before the job finished".to_string());
            self.shared.finish_locked(&mut state, index, Err(error));
        }

        let summary = state.summary();
        info!("{}", summary.summary_text());

        BatchReport {
            summary,
            jobs: state.live_jobs(),
        }
    }
}

struct JobEntry {
    job: AudioJob,
    /// Progress in 0.0..=1.0
    progress: f64,
    withdrawn: bool,
}

struct BatchState {
    jobs: Vec<JobEntry>,
}

impl BatchState {
    fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            completed: 0,
            failed: 0,
            total: 0,
            overall_progress: 0.0,
        };
        let mut progress = 0.0;

        for entry in self.jobs.iter().filter(|e| !e.withdrawn) {
            summary.total += 1;
            match entry.job.status {
                JobStatus::Complete => summary.completed += 1,
                JobStatus::Error => summary.failed += 1,
                JobStatus::Pending | JobStatus::Processing => {}
            }
            progress += if entry.job.is_terminal() {
                1.0
            } else {
                entry.progress
            };
        }

        summary.overall_progress = if summary.total == 0 {
            1.0
        } else {
            (progress / summary.total as f64).clamp(0.0, 1.0)
        };
        summary
    }

    fn live_jobs(&self) -> Vec<AudioJob> {
        self.jobs
            .iter()
            .filter(|e| !e.withdrawn)
            .map(|e| e.job.clone())
            .collect()
    }
}

struct Shared {
    /// Indices into `BatchState::jobs` not yet picked up
    queue: tokio::sync::Mutex<VecDeque<usize>>,
    state: Mutex<BatchState>,
    tool: Arc<dyn AudioTool>,
    settings: ResolvedSettings,
    reporter: ProgressReporter,
    active: ActiveJobs,
    cancel: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let Some(index) = next else {
                break;
            };

            if self.cancel.is_cancelled() {
                self.finish(index, Err(NormalizeError::Cancelled));
                continue;
            }

            self.process(worker_id, index).await;
        }
    }

    async fn process(self: &Arc<Self>, worker_id: usize, index: usize) {
        let (job_id, source) = {
            let mut state = self.state();
            let entry = &mut state.jobs[index];
            entry.job.start();
            let started = (entry.job.id.clone(), entry.job.source_path.clone());
            self.reporter.job_status(&started.0, &started.1, JobStatus::Processing);
            self.reporter.file_progress(&started.1, 0.0);
            self.reporter.batch_progress(state.summary());
            started
        };

        info!("Worker {} processing {}", worker_id, source.display());

        match tokio::fs::metadata(&source).await {
            Ok(metadata) => {
                self.state().jobs[index].job.size_bytes = Some(metadata.len());
            }
            Err(e) => {
                self.finish(index, Err(NormalizeError::filesystem(&source, e)));
                return;
            }
        }

        // The job runs in its own task so a panic fails only this job
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let normalizer = SingleFileNormalizer::new(shared.tool.as_ref(), &shared.settings)
                .with_cancellation(shared.cancel.clone());
            let on_progress = |_state: NormalizerState, fraction: f64| {
                shared.update_progress(index, fraction);
            };
            normalizer.run(&job_id, &source, &on_progress).await
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(NormalizeError::Worker("job panicked".to_string())),
            Err(e) => Err(NormalizeError::Worker(e.to_string())),
        };
        self.finish(index, result);
    }

    fn update_progress(&self, index: usize, fraction: f64) {
        let mut state = self.state();
        let entry = &mut state.jobs[index];
        if entry.job.is_terminal() || fraction <= entry.progress {
            return;
        }
        entry.progress = fraction.min(1.0);
        let path = entry.job.source_path.clone();
        self.reporter.file_progress(&path, fraction);
        self.reporter.batch_progress(state.summary());
    }

    fn finish(&self, index: usize, result: Result<NormalizationOutcome>) {
        let mut state = self.state();
        self.finish_locked(&mut state, index, result);
    }

    fn finish_locked(
        &self,
        state: &mut BatchState,
        index: usize,
        result: Result<NormalizationOutcome>,
    ) {
        let entry = &mut state.jobs[index];
        let changed = match result {
            Ok(outcome) => entry.job.complete(outcome.output_path),
            Err(e) => entry.job.fail(e.to_string()),
        };
        if !changed {
            return;
        }

        let job = entry.job.clone();
        let reported = entry.progress;
        entry.progress = 1.0;

        match &job.error {
            Some(message) => {
                error!("Failed to normalize {}: {}", job.name, message);
                self.reporter.file_error(&job.source_path, reported, message);
            }
            None => self.reporter.file_progress(&job.source_path, 1.0),
        }
        self.reporter.job_status(&job.id, &job.source_path, job.status);
        self.reporter.batch_progress(state.summary());

        self.active.remove(&job.id);
    }
}
