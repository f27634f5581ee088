//! Timeout Integration Tests
//!
//! Tests for per-stage timeout configuration and enforcement.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use medibrief::config::Config;
use medibrief::core::{
    CollaboratorError, EventStore, RateLimiter, RetryDelay, RetryPolicy, StageExecutor,
    StageFailure,
};
use medibrief::domain::{ExtractedContent, PaperJob, PaperRecord, Stage, StageArtifact};
use tempfile::TempDir;
use uuid::Uuid;

#[test]
fn test_stage_timeout_configuration() {
    let yaml = r#"
pipeline:
  stage_timeouts:
    render_video: 5
    summarize: 2
"#;

    let config = Config::from_yaml_str(yaml).unwrap();
    let timeouts = config.pipeline.stage_timeouts().unwrap();

    assert_eq!(timeouts[&Stage::RenderVideo], Duration::from_secs(5));
    assert_eq!(timeouts[&Stage::Summarize], Duration::from_secs(2));

    // Stages without an override keep their default
    assert_eq!(timeouts[&Stage::Upload], Stage::Upload.default_timeout());
    assert_eq!(timeouts.len(), Stage::SEQUENCE.len());
}

#[test]
fn test_unknown_stage_is_rejected() {
    let yaml = r#"
pipeline:
  stage_timeouts:
    transcode: 10
"#;

    let config = Config::from_yaml_str(yaml).unwrap();
    assert!(config.pipeline.stage_timeouts().is_err());
    assert!(config.validate().is_err());
}

#[test]
fn test_default_timeouts() {
    for stage in [Stage::Extract, Stage::Summarize, Stage::SelectFigures] {
        assert!(Stage::RenderVideo.default_timeout() > stage.default_timeout());
        assert!(Stage::Upload.default_timeout() > stage.default_timeout());
    }
}

#[tokio::test]
async fn test_timeout_enforcement() {
    let temp = TempDir::new().unwrap();
    let store = EventStore::open(temp.path(), Uuid::new_v4()).await.unwrap();

    let mut timeouts = HashMap::new();
    timeouts.insert(Stage::Extract, Duration::from_millis(20));
    let executor = StageExecutor::new(
        Arc::new(RateLimiter::unlimited()),
        RetryPolicy::new(3, RetryDelay::Fixed { delay_ms: 1 }),
        timeouts,
        Arc::new(store),
    );

    let mut job = PaperJob::new(PaperRecord::new("1", "Slow"));
    job.admit().unwrap();

    let start = Instant::now();
    let failure = executor
        .execute(Stage::Extract, &mut job, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(StageArtifact::Extracted(ExtractedContent {
                text: "never".into(),
                figures: vec![],
                abstract_only: false,
            }))
        })
        .await
        .unwrap_err();

    // Three attempts, each cut off well before the call would finish
    assert!(start.elapsed() < Duration::from_secs(5));
    match failure {
        StageFailure::TransientExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_error, CollaboratorError::Timeout(Duration::from_millis(20)));
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
    assert!(job
        .error_history()
        .iter()
        .all(|record| record.code == "timeout"));
}
