#![allow(clippy::unwrap_used, clippy::expect_used)]

use harmonia_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Full configuration document
// ---------------------------------------------------------------------------

#[test]
fn full_config_document_parses() {
    let config = HarmoniaConfig::from_toml_str(
        r#"
[health]
interval_secs = 30
probe_timeout_ms = 250
history_limit = 100
timeout_streak_to_fail = 2

[coordinator]
capability_weight = 0.5
availability_weight = 0.25
performance_weight = 0.25

[patterns]
similarity_threshold = 0.9
occurrence_threshold = 5

[evolution]
queue_capacity = 64
drain_interval_ms = 200

[harmony]
interval_secs = 60
balanced_threshold = 0.75
critical_threshold = 0.4

[harmony.weights]
pattern = 1.0
task = 2.0
agent = 1.0

[execution]
timeout_secs = 30
auto_dispatch = false
"#,
    )
    .unwrap();

    assert_eq!(config.health.interval_secs, 30);
    assert_eq!(config.health.timeout_streak_to_fail, 2);
    assert_eq!(config.patterns.occurrence_threshold, 5);
    assert_eq!(config.evolution.queue_capacity, 64);
    assert!((config.harmony.weights.task - 2.0).abs() < f64::EPSILON);
    assert!(!config.execution.auto_dispatch);
}

// ---------------------------------------------------------------------------
// 2. Config serialization roundtrip
// ---------------------------------------------------------------------------

#[test]
fn config_toml_roundtrip() {
    let config = HarmoniaConfig::default();
    let text = toml::to_string(&config).unwrap();
    let parsed = HarmoniaConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed.health.interval_secs, config.health.interval_secs);
    assert_eq!(parsed.evolution.queue_capacity, config.evolution.queue_capacity);
}

// ---------------------------------------------------------------------------
// 3. Error taxonomy formatting
// ---------------------------------------------------------------------------

#[test]
fn error_messages_name_the_offender() {
    let task = Uuid::new_v4();
    let dep = Uuid::new_v4();
    let err = HarmoniaError::DependencyNotSatisfied {
        task,
        pending: vec![dep],
    };
    let msg = err.to_string();
    assert!(msg.contains(&task.to_string()));
    assert!(msg.contains(&dep.to_string()));

    let err = HarmoniaError::DuplicateTrigger {
        kind: "health_degraded".into(),
        payload: "agent:a1".into(),
    };
    assert_eq!(
        err.to_string(),
        "Duplicate pending trigger: health_degraded for agent:a1"
    );
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let err: HarmoniaError = io.into();
    assert!(err.to_string().starts_with("IO error"));
}
