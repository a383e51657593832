use crate::agent::ProbeSignal;
use crate::coordinator::AgentCoordinator;
use crate::evolution::EvolutionQueue;
use crate::types::{AgentRecord, AgentStatus, EvolutionTrigger, HealthEntry, HealthReport, ProbeResult};
use chrono::Utc;
use futures_util::future::join_all;
use harmonia_core::{HarmoniaError, HealthConfig};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Status and counters after applying one probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: AgentStatus,
    pub consecutive_timeouts: u32,
    pub failed_cycles: u32,
}

/// Apply one probe result to an agent's health state.
///
/// Successes move one level toward Active, failures one level toward Failed.
/// A run of `timeout_streak_to_fail` timeouts forces Failed; any other result
/// ends the run. Failed probes while already Failed count toward the stop
/// limit.
pub fn classify(record: &AgentRecord, probe: &ProbeResult, config: &HealthConfig) -> Classification {
    let current = record.status;
    if current == AgentStatus::Stopped {
        return Classification {
            status: current,
            consecutive_timeouts: record.consecutive_timeouts,
            failed_cycles: record.failed_cycles,
        };
    }

    if probe.is_success() {
        return Classification {
            status: current.recover(),
            consecutive_timeouts: 0,
            failed_cycles: 0,
        };
    }

    let consecutive_timeouts = match probe {
        ProbeResult::Timeout => record.consecutive_timeouts + 1,
        _ => 0,
    };
    let failed_cycles = if current == AgentStatus::Failed {
        record.failed_cycles + 1
    } else {
        0
    };

    let forced = config.timeout_streak_to_fail > 0
        && consecutive_timeouts >= config.timeout_streak_to_fail;
    let mut status = if forced {
        AgentStatus::Failed
    } else {
        current.degrade()
    };
    if config.stop_after_failed_cycles > 0 && failed_cycles >= config.stop_after_failed_cycles {
        status = AgentStatus::Stopped;
    }

    Classification {
        status,
        consecutive_timeouts,
        failed_cycles,
    }
}

/// Periodic prober of registered agents with a bounded history ring.
pub struct HealthMonitor {
    config: HealthConfig,
    history: Mutex<VecDeque<HealthEntry>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Probe every non-stopped agent once and apply the results.
    ///
    /// Probes run concurrently with the configured timeout and without any
    /// registry lock held. Failures never escape; they are classified and
    /// logged. Entering Degraded or Unhealthy raises a `HealthDegraded` trigger.
    pub async fn check_all(
        &self,
        coordinator: &AgentCoordinator,
        queue: &EvolutionQueue,
    ) -> Vec<HealthEntry> {
        let targets = coordinator.probe_targets().await;
        if targets.is_empty() {
            return Vec::new();
        }
        let timeout = self.config.probe_timeout();
        let timeout_ms = self.config.probe_timeout_ms;

        let (ids, probes): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .map(|(id, handle)| {
                let probe = tokio::spawn(async move {
                    let started = Instant::now();
                    let result = match tokio::time::timeout(timeout, handle.probe()).await {
                        Ok(Ok(ProbeSignal::Healthy)) => ProbeResult::Healthy,
                        Ok(Ok(ProbeSignal::Unhealthy)) => ProbeResult::Unhealthy,
                        Ok(Err(e)) => ProbeResult::Error(e.to_string()),
                        Err(_) => ProbeResult::Timeout,
                    };
                    (result, started.elapsed().as_millis() as u64)
                });
                (id, probe)
            })
            .unzip();

        let results = join_all(probes).await;
        let mut entries = Vec::with_capacity(ids.len());

        for (id, joined) in ids.into_iter().zip(results) {
            let (probe, latency_ms) = match joined {
                Ok(outcome) => outcome,
                Err(e) => (ProbeResult::Error(format!("probe task failed: {e}")), 0),
            };
            match &probe {
                ProbeResult::Timeout => {
                    let err = HarmoniaError::ProbeTimeout {
                        agent: id.clone(),
                        timeout_ms,
                    };
                    warn!(agent = %id, error = %err, "Health probe timed out");
                }
                ProbeResult::Error(reason) => {
                    warn!(agent = %id, reason = %reason, "Health probe failed");
                }
                _ => {}
            }

            let config = &self.config;
            let probed_at = Utc::now();
            let applied = coordinator
                .apply_health(&id, |record| {
                    let previous = record.status;
                    let next = classify(record, &probe, config);
                    record.status = next.status;
                    record.consecutive_timeouts = next.consecutive_timeouts;
                    record.failed_cycles = next.failed_cycles;
                    if probe == ProbeResult::Healthy {
                        record.metrics.last_active_at = Some(probed_at);
                    }
                    (previous, next.status)
                })
                .await;
            let Some((previous, status)) = applied else {
                debug!(agent = %id, "Agent gone or stopped before probe result applied");
                continue;
            };

            let entry = HealthEntry {
                agent_id: id.clone(),
                previous,
                status,
                probe,
                latency_ms,
                timestamp: Utc::now(),
            };
            self.push_history(entry.clone());

            if entry.changed() {
                match status {
                    AgentStatus::Active => info!(agent = %id, from = %previous, "Agent active"),
                    AgentStatus::Stopped => {
                        warn!(agent = %id, "Agent stopped after repeated failed health cycles");
                    }
                    _ => warn!(agent = %id, from = %previous, to = %status, "Agent health changed"),
                }
                self.raise_degraded(&id, status, queue);
            }
            entries.push(entry);
        }
        entries
    }

    fn raise_degraded(&self, id: &str, status: AgentStatus, queue: &EvolutionQueue) {
        let priority = match status {
            AgentStatus::Degraded => self.config.degraded_trigger_priority,
            AgentStatus::Unhealthy => self.config.unhealthy_trigger_priority,
            _ => return,
        };
        match queue.enqueue(EvolutionTrigger::health_degraded(id, status, priority)) {
            Ok(receipt) => debug!(agent = %id, trigger = %receipt.id, "Health trigger raised"),
            Err(e @ HarmoniaError::DuplicateTrigger { .. }) => {
                debug!(agent = %id, error = %e, "Health trigger already pending");
            }
            Err(e) => warn!(agent = %id, error = %e, "Health trigger not raised"),
        }
    }

    fn push_history(&self, entry: HealthEntry) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_limit.max(1) {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// Retained history entries of one agent, oldest first.
    pub fn history_for(&self, agent_id: &str) -> Vec<HealthEntry> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Up to `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HealthEntry> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub async fn health_report(&self, coordinator: &AgentCoordinator, recent: usize) -> HealthReport {
        let agents = coordinator.list().await;
        let mut counts = BTreeMap::new();
        for agent in &agents {
            *counts.entry(agent.status).or_insert(0) += 1;
        }
        HealthReport {
            agents,
            counts,
            recent: self.recent(recent),
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::{AgentHandle, CancelSignal};
    use crate::types::{Task, TaskOutcome, TriggerKind};
    use async_trait::async_trait;
    use harmonia_core::{CoordinatorConfig, EvolutionConfig, HarmoniaResult};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const HEALTHY: u8 = 0;
    const UNHEALTHY: u8 = 1;
    const HANG: u8 = 2;
    const ERROR: u8 = 3;

    struct Scripted(AtomicU8);

    impl Scripted {
        fn new(mode: u8) -> Arc<Self> {
            Arc::new(Self(AtomicU8::new(mode)))
        }

        fn set(&self, mode: u8) {
            self.0.store(mode, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AgentHandle for Scripted {
        async fn probe(&self) -> HarmoniaResult<ProbeSignal> {
            match self.0.load(Ordering::SeqCst) {
                HEALTHY => Ok(ProbeSignal::Healthy),
                UNHEALTHY => Ok(ProbeSignal::Unhealthy),
                HANG => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ProbeSignal::Healthy)
                }
                _ => Err(HarmoniaError::Execution("probe exploded".into())),
            }
        }

        async fn execute(&self, _task: &Task, _cancel: CancelSignal) -> HarmoniaResult<TaskOutcome> {
            Ok(TaskOutcome::completed(serde_json::Value::Null))
        }
    }

    fn config() -> HealthConfig {
        HealthConfig {
            probe_timeout_ms: 20,
            ..HealthConfig::default()
        }
    }

    fn record(status: AgentStatus) -> AgentRecord {
        let mut r = AgentRecord::new("a", BTreeSet::new());
        r.status = status;
        r
    }

    fn apply(r: &mut AgentRecord, probe: ProbeResult, config: &HealthConfig) {
        let c = classify(r, &probe, config);
        r.status = c.status;
        r.consecutive_timeouts = c.consecutive_timeouts;
        r.failed_cycles = c.failed_cycles;
    }

    #[test]
    fn test_failure_walks_ladder() {
        let cfg = HealthConfig::default();
        let mut r = record(AgentStatus::Active);
        apply(&mut r, ProbeResult::Unhealthy, &cfg);
        assert_eq!(r.status, AgentStatus::Degraded);
        apply(&mut r, ProbeResult::Error("x".into()), &cfg);
        assert_eq!(r.status, AgentStatus::Unhealthy);
        apply(&mut r, ProbeResult::Unhealthy, &cfg);
        assert_eq!(r.status, AgentStatus::Failed);
    }

    #[test]
    fn test_recovery_is_one_level_per_cycle() {
        let cfg = HealthConfig::default();
        let mut r = record(AgentStatus::Failed);
        apply(&mut r, ProbeResult::Healthy, &cfg);
        assert_eq!(r.status, AgentStatus::Unhealthy);
        apply(&mut r, ProbeResult::Healthy, &cfg);
        assert_eq!(r.status, AgentStatus::Degraded);
        apply(&mut r, ProbeResult::Healthy, &cfg);
        assert_eq!(r.status, AgentStatus::Active);
    }

    #[test]
    fn test_timeout_streak_boundary() {
        let cfg = HealthConfig {
            timeout_streak_to_fail: 2,
            ..HealthConfig::default()
        };
        let mut r = record(AgentStatus::Active);
        apply(&mut r, ProbeResult::Timeout, &cfg);
        assert_eq!(r.status, AgentStatus::Degraded);
        apply(&mut r, ProbeResult::Timeout, &cfg);
        assert_eq!(r.status, AgentStatus::Failed);
    }

    #[test]
    fn test_non_timeout_resets_streak() {
        let cfg = HealthConfig {
            timeout_streak_to_fail: 2,
            ..HealthConfig::default()
        };
        let mut r = record(AgentStatus::Active);
        apply(&mut r, ProbeResult::Timeout, &cfg);
        apply(&mut r, ProbeResult::Healthy, &cfg);
        assert_eq!(r.status, AgentStatus::Active);
        assert_eq!(r.consecutive_timeouts, 0);
        apply(&mut r, ProbeResult::Timeout, &cfg);
        assert_eq!(r.status, AgentStatus::Degraded);
    }

    #[test]
    fn test_stopped_after_failed_cycles() {
        let cfg = HealthConfig::default();
        let mut r = record(AgentStatus::Failed);
        for _ in 0..2 {
            apply(&mut r, ProbeResult::Unhealthy, &cfg);
            assert_eq!(r.status, AgentStatus::Failed);
        }
        apply(&mut r, ProbeResult::Unhealthy, &cfg);
        assert_eq!(r.status, AgentStatus::Stopped);

        let never = HealthConfig {
            stop_after_failed_cycles: 0,
            ..HealthConfig::default()
        };
        let mut r = record(AgentStatus::Failed);
        for _ in 0..10 {
            apply(&mut r, ProbeResult::Timeout, &never);
        }
        assert_eq!(r.status, AgentStatus::Failed);
    }

    #[test]
    fn test_initializing_transitions() {
        let cfg = HealthConfig::default();
        let c = classify(&record(AgentStatus::Initializing), &ProbeResult::Healthy, &cfg);
        assert_eq!(c.status, AgentStatus::Active);
        let c = classify(&record(AgentStatus::Initializing), &ProbeResult::Timeout, &cfg);
        assert_eq!(c.status, AgentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_check_all_applies_and_raises_triggers() {
        let coordinator = AgentCoordinator::new(CoordinatorConfig::default());
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        let monitor = HealthMonitor::new(config());

        let good = Scripted::new(HEALTHY);
        let flaky = Scripted::new(HEALTHY);
        coordinator.register("good", ["build"], good).await.unwrap();
        coordinator.register("flaky", ["build"], flaky.clone()).await.unwrap();

        let entries = monitor.check_all(&coordinator, &queue).await;
        assert_eq!(entries.len(), 2);
        let rec = coordinator.get("flaky").await.unwrap();
        assert_eq!(rec.status, AgentStatus::Active);
        let alive_at = rec.metrics.last_active_at.expect("healthy probe marks the agent live");
        assert_eq!(rec.metrics.tasks_completed, 0);
        assert!(queue.is_empty());

        flaky.set(HANG);
        monitor.check_all(&coordinator, &queue).await;
        let rec = coordinator.get("flaky").await.unwrap();
        assert_eq!(rec.status, AgentStatus::Degraded);
        assert_eq!(rec.consecutive_timeouts, 1);
        assert_eq!(rec.metrics.last_active_at, Some(alive_at));

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TriggerKind::HealthDegraded);

        // Unhealthy while the Degraded trigger is pending is absorbed.
        flaky.set(ERROR);
        monitor.check_all(&coordinator, &queue).await;
        assert_eq!(coordinator.get("flaky").await.unwrap().status, AgentStatus::Unhealthy);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().duplicates_rejected, 1);

        let history = monitor.history_for("flaky");
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].probe, ProbeResult::Timeout);
        assert_eq!(coordinator.get("good").await.unwrap().status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_stopped_agents_not_probed() {
        let coordinator = AgentCoordinator::new(CoordinatorConfig::default());
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        let monitor = HealthMonitor::new(config());
        coordinator
            .register("a", ["x"], Scripted::new(UNHEALTHY))
            .await
            .unwrap();
        coordinator.deregister("a").await.unwrap();
        assert!(monitor.check_all(&coordinator, &queue).await.is_empty());
        assert_eq!(monitor.history_len(), 0);
    }

    #[tokio::test]
    async fn test_history_bounded_and_report() {
        let coordinator = AgentCoordinator::new(CoordinatorConfig::default());
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        let monitor = HealthMonitor::new(HealthConfig {
            history_limit: 4,
            ..config()
        });
        coordinator.register("a", ["x"], Scripted::new(HEALTHY)).await.unwrap();
        coordinator.register("b", ["x"], Scripted::new(UNHEALTHY)).await.unwrap();
        for _ in 0..3 {
            monitor.check_all(&coordinator, &queue).await;
        }
        assert_eq!(monitor.history_len(), 4);

        let report = monitor.health_report(&coordinator, 2).await;
        assert_eq!(report.agents.len(), 2);
        assert_eq!(report.recent.len(), 2);
        assert_eq!(report.counts.get(&AgentStatus::Active), Some(&1));
        assert_eq!(report.counts.get(&AgentStatus::Failed), Some(&1));
    }
}
