//! Startup configuration.
//!
//! Every section and every field is optional in the TOML source; missing values
//! fall back to the defaults documented on each field. The configuration is read
//! once at startup and never mutated afterwards.

use crate::{HarmoniaError, HarmoniaResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete configuration for one Harmonia engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarmoniaConfig {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub patterns: PatternConfig,
    #[serde(default)]
    pub evolution: EvolutionConfig,
    #[serde(default)]
    pub harmony: HarmonyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Health monitor timing and hysteresis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between two `check_all` passes (default: 60).
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Per-probe timeout in milliseconds (default: 5000).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Size of the health history ring (default: 500).
    #[serde(default = "default_health_history_limit")]
    pub history_limit: usize,
    /// Consecutive probe timeouts that force an agent to Failed (default: 3).
    #[serde(default = "default_timeout_streak")]
    pub timeout_streak_to_fail: u32,
    /// Failed cycles spent in Failed before the agent is Stopped (default: 3).
    #[serde(default = "default_stop_after_failed_cycles")]
    pub stop_after_failed_cycles: u32,
    /// Trigger priority for an agent entering Degraded (default: 40).
    #[serde(default = "default_degraded_priority")]
    pub degraded_trigger_priority: i64,
    /// Trigger priority for an agent entering Unhealthy (default: 70).
    #[serde(default = "default_unhealthy_priority")]
    pub unhealthy_trigger_priority: i64,
}

/// Weights for best-fit agent selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_capability_weight")]
    pub capability_weight: f64,
    #[serde(default = "default_availability_weight")]
    pub availability_weight: f64,
    #[serde(default = "default_performance_weight")]
    pub performance_weight: f64,
    /// Maximum number of assignments kept in the assignment log (default: 1000).
    #[serde(default = "default_assignment_log_limit")]
    pub assignment_log_limit: usize,
}

/// Pattern store deduplication and confidence constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Similarity at or above which two observations are the same pattern (default: 0.8).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    /// Occurrence count that emits a `PatternDetected` trigger (default: 3).
    #[serde(default = "default_occurrence_threshold")]
    pub occurrence_threshold: u64,
    /// Confidence of a freshly inserted record (default: 0.5).
    #[serde(default = "default_base_confidence")]
    pub base_confidence: f64,
    /// Confidence gained per occurrence (default: 0.1).
    #[serde(default = "default_confidence_step")]
    pub confidence_step: f64,
    /// Confidence above which a record counts as established in statistics (default: 0.7).
    #[serde(default = "default_confidence_report_threshold")]
    pub confidence_report_threshold: f64,
    /// Priority of `PatternDetected` triggers (default: 50).
    #[serde(default = "default_pattern_trigger_priority")]
    pub trigger_priority: i64,
}

/// Evolution trigger queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Maximum number of pending triggers (default: 1000).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Milliseconds between two drain passes of the queue (default: 1000).
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
}

/// Relative weights of the three harmony sub-scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonyWeights {
    #[serde(default = "default_equal_weight")]
    pub pattern: f64,
    #[serde(default = "default_equal_weight")]
    pub task: f64,
    #[serde(default = "default_equal_weight")]
    pub agent: f64,
}

/// Meta-orchestrator evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonyConfig {
    /// Seconds between two harmony evaluations (default: 300).
    #[serde(default = "default_harmony_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub weights: HarmonyWeights,
    /// Overall score at or above which the system is Balanced (default: 0.8).
    #[serde(default = "default_balanced_threshold")]
    pub balanced_threshold: f64,
    /// Overall score below which the system is Critical (default: 0.5).
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    /// Number of snapshots kept in memory (default: 288).
    #[serde(default = "default_harmony_history_limit")]
    pub history_limit: usize,
}

/// Task execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds an agent may spend on one task before it is failed (default: 300).
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,
    /// Dispatch tasks to agents automatically on submission and release (default: true).
    #[serde(default = "default_auto_dispatch")]
    pub auto_dispatch: bool,
}

fn default_health_interval_secs() -> u64 {
    60
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_health_history_limit() -> usize {
    500
}
fn default_timeout_streak() -> u32 {
    3
}
fn default_stop_after_failed_cycles() -> u32 {
    3
}
fn default_degraded_priority() -> i64 {
    40
}
fn default_unhealthy_priority() -> i64 {
    70
}
fn default_capability_weight() -> f64 {
    0.4
}
fn default_availability_weight() -> f64 {
    0.3
}
fn default_performance_weight() -> f64 {
    0.3
}
fn default_assignment_log_limit() -> usize {
    1_000
}
fn default_similarity_threshold() -> f64 {
    0.8
}
fn default_occurrence_threshold() -> u64 {
    3
}
fn default_base_confidence() -> f64 {
    0.5
}
fn default_confidence_step() -> f64 {
    0.1
}
fn default_confidence_report_threshold() -> f64 {
    0.7
}
fn default_pattern_trigger_priority() -> i64 {
    50
}
fn default_queue_capacity() -> usize {
    1_000
}
fn default_drain_interval_ms() -> u64 {
    1_000
}
fn default_equal_weight() -> f64 {
    1.0 / 3.0
}
fn default_harmony_interval_secs() -> u64 {
    300
}
fn default_balanced_threshold() -> f64 {
    0.8
}
fn default_critical_threshold() -> f64 {
    0.5
}
fn default_harmony_history_limit() -> usize {
    288
}
fn default_execution_timeout_secs() -> u64 {
    300
}
fn default_auto_dispatch() -> bool {
    true
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            history_limit: default_health_history_limit(),
            timeout_streak_to_fail: default_timeout_streak(),
            stop_after_failed_cycles: default_stop_after_failed_cycles(),
            degraded_trigger_priority: default_degraded_priority(),
            unhealthy_trigger_priority: default_unhealthy_priority(),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            capability_weight: default_capability_weight(),
            availability_weight: default_availability_weight(),
            performance_weight: default_performance_weight(),
            assignment_log_limit: default_assignment_log_limit(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            occurrence_threshold: default_occurrence_threshold(),
            base_confidence: default_base_confidence(),
            confidence_step: default_confidence_step(),
            confidence_report_threshold: default_confidence_report_threshold(),
            trigger_priority: default_pattern_trigger_priority(),
        }
    }
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
        }
    }
}

impl Default for HarmonyWeights {
    fn default() -> Self {
        Self {
            pattern: default_equal_weight(),
            task: default_equal_weight(),
            agent: default_equal_weight(),
        }
    }
}

impl Default for HarmonyConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_harmony_interval_secs(),
            weights: HarmonyWeights::default(),
            balanced_threshold: default_balanced_threshold(),
            critical_threshold: default_critical_threshold(),
            history_limit: default_harmony_history_limit(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_execution_timeout_secs(),
            auto_dispatch: default_auto_dispatch(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl EvolutionConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

impl HarmonyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl HarmoniaConfig {
    /// Parse a TOML document and validate the result.
    pub fn from_toml_str(content: &str) -> HarmoniaResult<Self> {
        let config: HarmoniaConfig = toml::from_str(content)
            .map_err(|e| HarmoniaError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML config file.
    pub fn load(path: &Path) -> HarmoniaResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HarmoniaError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> HarmoniaResult<()> {
        if self.health.interval_secs == 0 {
            return Err(HarmoniaError::Config(
                "health.interval_secs must be greater than zero".into(),
            ));
        }
        if self.health.probe_timeout_ms == 0 {
            return Err(HarmoniaError::Config(
                "health.probe_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.health.history_limit == 0 {
            return Err(HarmoniaError::Config(
                "health.history_limit must be greater than zero".into(),
            ));
        }
        if self.health.timeout_streak_to_fail == 0 {
            return Err(HarmoniaError::Config(
                "health.timeout_streak_to_fail must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.patterns.similarity_threshold) {
            return Err(HarmoniaError::Config(format!(
                "patterns.similarity_threshold must be within [0, 1], got {}",
                self.patterns.similarity_threshold
            )));
        }
        if self.patterns.occurrence_threshold == 0 {
            return Err(HarmoniaError::Config(
                "patterns.occurrence_threshold must be greater than zero".into(),
            ));
        }
        if self.evolution.queue_capacity == 0 {
            return Err(HarmoniaError::Config(
                "evolution.queue_capacity must be greater than zero".into(),
            ));
        }
        if self.harmony.interval_secs == 0 {
            return Err(HarmoniaError::Config(
                "harmony.interval_secs must be greater than zero".into(),
            ));
        }
        let w = &self.harmony.weights;
        if w.pattern < 0.0 || w.task < 0.0 || w.agent < 0.0 || w.pattern + w.task + w.agent <= 0.0
        {
            return Err(HarmoniaError::Config(
                "harmony.weights must be non-negative with a positive sum".into(),
            ));
        }
        if self.harmony.critical_threshold > self.harmony.balanced_threshold {
            return Err(HarmoniaError::Config(format!(
                "harmony.critical_threshold ({}) exceeds balanced_threshold ({})",
                self.harmony.critical_threshold, self.harmony.balanced_threshold
            )));
        }
        let c = &self.coordinator;
        if c.capability_weight < 0.0 || c.availability_weight < 0.0 || c.performance_weight < 0.0
        {
            return Err(HarmoniaError::Config(
                "coordinator weights must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = HarmoniaConfig::default();
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.health.probe_timeout_ms, 5_000);
        assert_eq!(config.health.history_limit, 500);
        assert_eq!(config.patterns.occurrence_threshold, 3);
        assert!((config.patterns.similarity_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.evolution.queue_capacity, 1_000);
        assert_eq!(config.harmony.interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HarmoniaConfig::from_toml_str("").unwrap();
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.execution.timeout_secs, 300);
        assert!(config.execution.auto_dispatch);
    }

    #[test]
    fn test_partial_sections() {
        let config = HarmoniaConfig::from_toml_str(
            r#"
[health]
interval_secs = 10

[harmony.weights]
agent = 2.0
"#,
        )
        .unwrap();
        assert_eq!(config.health.interval_secs, 10);
        assert_eq!(config.health.probe_timeout_ms, 5_000);
        assert!((config.harmony.weights.agent - 2.0).abs() < f64::EPSILON);
        assert!((config.harmony.weights.task - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bad_similarity() {
        let err = HarmoniaConfig::from_toml_str("[patterns]\nsimilarity_threshold = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err =
            HarmoniaConfig::from_toml_str("[evolution]\nqueue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, HarmoniaError::Config(_)));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let err = HarmoniaConfig::from_toml_str(
            "[harmony]\nbalanced_threshold = 0.4\ncritical_threshold = 0.6\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("critical_threshold"));
    }

    #[test]
    fn test_load_from_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "[evolution]\nqueue_capacity = 10").unwrap();
        let config = HarmoniaConfig::load(tmp.path()).unwrap();
        assert_eq!(config.evolution.queue_capacity, 10);
    }

    #[test]
    fn test_load_missing_file() {
        let err = HarmoniaConfig::load(Path::new("/nonexistent/harmonia.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn test_durations() {
        let config = HarmoniaConfig::default();
        assert_eq!(config.health.probe_timeout(), Duration::from_secs(5));
        assert_eq!(config.harmony.interval(), Duration::from_secs(300));
    }
}
