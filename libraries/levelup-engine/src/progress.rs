//! Progress events
//!
//! The reporter translates job and batch state changes into events for the UI
//! collaborator. It is called synchronously at each state-change point and
//! sends on an unbounded channel, so it never blocks a worker and never drops
//! an event while the receiver is alive.

use crate::types::{BatchSummary, JobId, JobStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::mpsc;

/// Per-file progress, `percent` in 0..=100
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub file_path: String,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events emitted while a batch runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum NormalizeEvent {
    /// Per-file progress (and terminal error, if any)
    #[serde(rename = "progress-update")]
    File(FileProgress),

    /// Batch aggregate after any job state change
    #[serde(rename = "batch-progress-update")]
    Batch(BatchSummary),

    /// A job moved to a new lifecycle status
    #[serde(rename = "job-status", rename_all = "camelCase")]
    JobStatus {
        job_id: JobId,
        file_path: String,
        status: JobStatus,
    },
}

/// Fire-and-forget event sender
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<NormalizeEvent>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::UnboundedSender<NormalizeEvent>) -> Self {
        Self { tx }
    }

    /// Reporter plus the receiving end handed to the UI collaborator
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NormalizeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn file_progress(&self, path: &Path, fraction: f64) {
        self.send(NormalizeEvent::File(FileProgress {
            file_path: path.display().to_string(),
            percent: (fraction * 100.0).clamp(0.0, 100.0),
            error: None,
        }));
    }

    pub fn file_error(&self, path: &Path, fraction: f64, error: &str) {
        self.send(NormalizeEvent::File(FileProgress {
            file_path: path.display().to_string(),
            percent: (fraction * 100.0).clamp(0.0, 100.0),
            error: Some(error.to_string()),
        }));
    }

    pub fn job_status(&self, job_id: &JobId, path: &Path, status: JobStatus) {
        self.send(NormalizeEvent::JobStatus {
            job_id: job_id.clone(),
            file_path: path.display().to_string(),
            status,
        });
    }

    pub fn batch_progress(&self, summary: BatchSummary) {
        self.send(NormalizeEvent::Batch(summary));
    }

    fn send(&self, event: NormalizeEvent) {
        // A closed receiver means the UI stopped listening
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_progress_is_scaled_to_percent() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.file_progress(Path::new("/music/a.mp3"), 0.5);
        reporter.file_progress(Path::new("/music/a.mp3"), 1.2);

        let Some(NormalizeEvent::File(first)) = rx.try_recv().ok() else {
            panic!("expected file progress");
        };
        assert_eq!(first.percent, 50.0);
        assert_eq!(first.file_path, "/music/a.mp3");

        let Some(NormalizeEvent::File(second)) = rx.try_recv().ok() else {
            panic!("expected file progress");
        };
        assert_eq!(second.percent, 100.0);
    }

    #[test]
    fn events_serialize_with_ui_channel_names() {
        let event = NormalizeEvent::File(FileProgress {
            file_path: "/music/a.mp3".to_string(),
            percent: 100.0,
            error: None,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress-update");
        assert_eq!(json["data"]["filePath"], "/music/a.mp3");
        assert!(json["data"].get("error").is_none());

        let event = NormalizeEvent::Batch(BatchSummary::empty());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "batch-progress-update");
        assert_eq!(json["data"]["overallProgress"], 1.0);
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let (reporter, rx) = ProgressReporter::channel();
        drop(rx);
        reporter.batch_progress(BatchSummary::empty());
    }
}
