/// Temp artifact sweep tests
mod common;

use common::{init_tracing, leftover_artifacts, settings_for, write_source, FakeTool};
use levelup_engine::{
    artifact_file_name, sweep, ActiveJobs, AudioFormat, CleanupResult, JobId, NormalizationEngine,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn touch(dir: &std::path::Path, name: &str) {
    std::fs::write(dir.join(name), b"partial").unwrap();
}

#[tokio::test]
async fn test_sweep_removes_orphans_and_is_idempotent() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let orphan = JobId::generate();
    touch(dir.path(), &artifact_file_name(&orphan, 1, AudioFormat::Wav));
    touch(dir.path(), &artifact_file_name(&orphan, 2, AudioFormat::Mp3));
    touch(dir.path(), &artifact_file_name(&JobId::generate(), 1, AudioFormat::Flac));
    touch(dir.path(), "song_normalized.mp3");
    touch(dir.path(), ".levelup-not-a-uuid-pass1.wav");

    let active = ActiveJobs::new();
    let first = sweep(dir.path(), &active).await.unwrap();
    assert_eq!(first.count, 3);
    assert_eq!(first.message, "Removed 3 temporary files");

    let second = sweep(dir.path(), &active).await.unwrap();
    assert_eq!(second.count, 0);
    assert_eq!(second.message, "No temporary files found");

    assert!(dir.path().join("song_normalized.mp3").exists());
    assert!(dir.path().join(".levelup-not-a-uuid-pass1.wav").exists());
}

#[tokio::test]
async fn test_sweep_skips_active_jobs() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let running = JobId::generate();
    let orphan = JobId::generate();
    let running_file = artifact_file_name(&running, 1, AudioFormat::Wav);
    touch(dir.path(), &running_file);
    touch(dir.path(), &artifact_file_name(&orphan, 1, AudioFormat::Wav));

    let active = ActiveJobs::new();
    active.insert(running.clone());

    let report = sweep(dir.path(), &active).await.unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.skipped_active, 1);
    assert_eq!(report.message, "Removed 1 temporary file (1 in use by active jobs)");
    assert!(dir.path().join(&running_file).exists());

    // Once the job is gone its leftovers are fair game
    active.remove(&running);
    let report = sweep(dir.path(), &active).await.unwrap();
    assert_eq!(report.count, 1);
    assert!(!dir.path().join(&running_file).exists());
}

#[tokio::test]
async fn test_cleanup_temp_files_reports_result() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    touch(dir.path(), &artifact_file_name(&JobId::generate(), 3, AudioFormat::Ogg));
    let engine = NormalizationEngine::new(Arc::new(FakeTool::new()));

    let result = engine.cleanup_temp_files(dir.path()).await;
    assert_eq!(
        result,
        CleanupResult {
            success: true,
            message: "Removed 1 temporary file".to_string(),
            count: Some(1),
        }
    );

    let missing = engine.cleanup_temp_files(&dir.path().join("nope")).await;
    assert!(!missing.success);
    assert!(missing.count.is_none());

    let json = serde_json::to_value(&missing).unwrap();
    assert!(json.get("count").is_none());
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn test_stale_cleanup_spares_another_engines_running_job() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let tool = Arc::new(FakeTool::with_efficiency(0.5).with_delay(Duration::from_millis(30)));
    let source = write_source(dir.path(), "long.wav");
    tool.set_level(&source, -30.0, -20.0);

    let running = NormalizationEngine::new(tool.clone());
    let (_events, handle) = running
        .start(vec![source], &settings_for(dir.path()))
        .unwrap();

    let mut waited = 0;
    while leftover_artifacts(dir.path()).is_empty() {
        assert!(waited < 2000, "no intermediate artifact appeared");
        tokio::time::sleep(Duration::from_millis(1)).await;
        waited += 1;
    }

    // A separate engine knows nothing about the running job
    let other = NormalizationEngine::new(Arc::new(FakeTool::new()));
    let result = other
        .cleanup_stale_temp_files(dir.path(), Duration::from_secs(600))
        .await;
    assert!(result.success);
    assert_eq!(result.count, Some(0));

    let report = handle.join().await;
    assert_eq!(report.summary.completed, 1);
    assert_eq!(report.summary.failed, 0);
    assert!(leftover_artifacts(dir.path()).is_empty());
}
