//! Configuration Integration Tests
//!
//! Loading from disk, overrides, validation and collaborator wiring.

use std::sync::Arc;

use medibrief::adapters::{renderer_from_config, Collaborators};
use medibrief::config::{Config, RunOverrides, DEFAULT_CONFIG_TEMPLATE};
use medibrief::core::RateLimiter;
use tempfile::TempDir;

fn write_config(temp: &TempDir, yaml: &str) -> std::path::PathBuf {
    let dir = temp.path().join(".medibrief");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("config.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_load_explicit_file() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        &temp,
        r#"
paths:
  home: state
pubmed:
  specialties: [oncology, neurology]
  max_papers_per_run: 4
pipeline:
  max_concurrent_papers: 2
"#,
    );

    let config = Config::load(Some(&path)).unwrap();

    assert_eq!(config.pubmed.specialties, vec!["oncology", "neurology"]);
    assert_eq!(config.pubmed.max_papers_per_run, 4);
    assert_eq!(config.pipeline.max_concurrent_papers, 2);
    assert_eq!(config.config_file.as_deref(), Some(path.as_path()));
    assert!(config.runs_dir().ends_with("state/runs"));
}

#[test]
fn test_template_is_a_dry_run_config() {
    let config = Config::from_yaml_str(DEFAULT_CONFIG_TEMPLATE).unwrap();

    config.validate().unwrap();
    assert!(config.youtube.dry_run);
    assert!(config.is_template_renderer());
}

#[test]
fn test_overrides_then_validate() {
    let mut config = Config::default();
    config.apply_overrides(&RunOverrides {
        specialty: Some("dermatology".into()),
        days: Some(3),
        max_papers: Some(0),
        dry_run: true,
    });

    assert_eq!(config.pubmed.specialties, vec!["dermatology"]);
    assert_eq!(config.pubmed.time_period_days, 3);
    assert!(config.youtube.dry_run);
    config.validate().unwrap();

    config.pipeline.max_concurrent_papers = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_renderer_is_rejected() {
    let config = Config::from_yaml_str("video_generation:\n  method: blender\n").unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_renderer_selection() {
    let client = reqwest::Client::new();

    let template = Config::default();
    assert_eq!(renderer_from_config(&template, client.clone()).name(), "template");

    let runway = Config::from_yaml_str("video_generation:\n  method: runway\n").unwrap();
    assert_eq!(renderer_from_config(&runway, client).name(), "runway");
}

#[tokio::test]
async fn test_collaborators_from_config() {
    let temp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.paths.home = Some(temp.path().to_path_buf());
    config.summarization.fabric_binary = Some("/opt/fabric/bin/fabric".into());
    config.youtube.dry_run = true;

    let limiter = Arc::new(RateLimiter::new(&config.rate_limits.0));
    let collaborators = Collaborators::from_config(&config, limiter).unwrap();

    assert_eq!(collaborators.narrator.max_chunk_length(), config.tts.max_chunk_length);
    assert_eq!(collaborators.renderer.name(), "template");
    assert!(!collaborators
        .source
        .is_already_published("12345")
        .await
        .unwrap());
}

#[test]
fn test_degenerate_rates_and_timeouts_are_rejected() {
    for yaml in [
        "rate_limits:\n  archive: 1.0e-300\n",
        "pipeline:\n  stage_timeouts:\n    synthesize_narration: 0\n",
        "pipeline:\n  fetch_timeout_seconds: 0\n",
    ] {
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_err(), "accepted: {}", yaml);
    }

    // Building a limiter straight from an unvalidated map must not panic
    let config = Config::from_yaml_str("rate_limits:\n  archive: 1.0e-300\n").unwrap();
    let limiter = RateLimiter::new(&config.rate_limits.0);
    assert_eq!(limiter.interval("archive"), None);
}

#[test]
fn test_huge_retry_delay_is_accepted() {
    let config = Config::from_yaml_str("pipeline:\n  retry_delay_seconds: 1.0e16\n").unwrap();
    config.validate().unwrap();
    assert!(config.pipeline.retry_policy().unwrap().delay.cap() >= std::time::Duration::from_secs(1));
}

#[tokio::test]
async fn test_archive_from_config() {
    let temp = TempDir::new().unwrap();
    let path = write_config(
        &temp,
        r#"
paths:
  home: state
youtube:
  dry_run: true
cloud_storage:
  enabled: true
  backend: local
  archive_dir: videos
"#,
    );

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.archive_dir(), temp.path().join(".medibrief/videos"));

    let limiter = Arc::new(RateLimiter::new(&config.rate_limits.0));
    let collaborators = Collaborators::from_config(&config, limiter).unwrap();
    assert_eq!(collaborators.object_store.as_ref().unwrap().name(), "local");

    let mut plain = Config::default();
    plain.paths.home = Some(temp.path().to_path_buf());
    let disabled = Collaborators::from_config(&plain, Arc::new(RateLimiter::unlimited())).unwrap();
    assert!(disabled.object_store.is_none());
}
