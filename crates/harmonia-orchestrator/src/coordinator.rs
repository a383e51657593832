use crate::agent::{AgentHandle, CancelSignal};
use crate::task_graph::TaskOrchestrator;
use crate::types::{AgentId, AgentRecord, AgentStatus, Assignment, Task, TaskId};
use chrono::Utc;
use harmonia_core::{CoordinatorConfig, HarmoniaError, HarmoniaResult};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct AgentEntry {
    record: AgentRecord,
    handle: Arc<dyn AgentHandle>,
}

#[derive(Default)]
struct Registry {
    agents: BTreeMap<AgentId, AgentEntry>,
    assignments: VecDeque<Assignment>,
}

/// Selection score of one candidate agent.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateScore {
    pub agent_id: AgentId,
    pub status: AgentStatus,
    pub score: f64,
    pub in_flight: usize,
}

/// Result of trying to hand a task to an agent.
#[derive(Debug)]
pub enum AssignOutcome {
    /// The task moved to `Executing` on the agent.
    Executing { task: Task, cancel: CancelSignal },
    /// Dependencies are still pending; the task stays queued.
    Waiting { pending: Vec<TaskId> },
}

/// Registry of agents, their metrics, and the assignment log.
///
/// Holds the outermost lock of the engine. [`AgentCoordinator::assign_task`]
/// keeps its guard while calling into the [`TaskOrchestrator`] so the
/// coordinator-then-tasks order is never inverted.
pub struct AgentCoordinator {
    config: CoordinatorConfig,
    state: RwLock<Registry>,
}

impl AgentCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            state: RwLock::new(Registry::default()),
        }
    }

    /// Register an agent. A stopped record with the same id is replaced.
    pub async fn register(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        handle: Arc<dyn AgentHandle>,
    ) -> HarmoniaResult<AgentRecord> {
        let id = id.into();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let mut state = self.state.write().await;

        if let Some(existing) = state.agents.get(&id) {
            if existing.record.status != AgentStatus::Stopped {
                return Err(HarmoniaError::DuplicateId(id));
            }
            debug!(agent = %id, "Replacing stopped agent record");
        }

        let record = AgentRecord::new(id.clone(), capabilities);
        info!(
            agent = %id,
            capabilities = ?record.capabilities,
            "Agent registered"
        );
        state.agents.insert(
            id,
            AgentEntry {
                record: record.clone(),
                handle,
            },
        );
        Ok(record)
    }

    /// Mark an agent stopped. It keeps its record but is never probed or
    /// selected again.
    pub async fn deregister(&self, id: &str) -> HarmoniaResult<AgentRecord> {
        let mut state = self.state.write().await;
        let entry = state
            .agents
            .get_mut(id)
            .ok_or_else(|| HarmoniaError::UnknownAgent(id.to_string()))?;
        entry.record.status = AgentStatus::Stopped;
        info!(agent = %id, "Agent deregistered");
        Ok(entry.record.clone())
    }

    pub async fn get(&self, id: &str) -> Option<AgentRecord> {
        self.state.read().await.agents.get(id).map(|e| e.record.clone())
    }

    /// All agent records in id order.
    pub async fn list(&self) -> Vec<AgentRecord> {
        let state = self.state.read().await;
        state.agents.values().map(|e| e.record.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.agents.is_empty()
    }

    pub async fn handle(&self, id: &str) -> Option<Arc<dyn AgentHandle>> {
        self.state.read().await.agents.get(id).map(|e| e.handle.clone())
    }

    /// Agents the health monitor should probe: everything not stopped.
    pub async fn probe_targets(&self) -> Vec<(AgentId, Arc<dyn AgentHandle>)> {
        let state = self.state.read().await;
        state
            .agents
            .iter()
            .filter(|(_, e)| e.record.status != AgentStatus::Stopped)
            .map(|(id, e)| (id.clone(), e.handle.clone()))
            .collect()
    }

    /// Apply a health update to one record. Stopped or unknown agents are
    /// skipped and yield `None`.
    pub async fn apply_health<R>(&self, id: &str, update: impl FnOnce(&mut AgentRecord) -> R) -> Option<R> {
        let mut state = self.state.write().await;
        let entry = state.agents.get_mut(id)?;
        if entry.record.status == AgentStatus::Stopped {
            return None;
        }
        Some(update(&mut entry.record))
    }

    /// Weighted selection score of one record for `capability`.
    pub fn score(&self, record: &AgentRecord, capability: &str) -> f64 {
        let capability_match = if record.has_capability(capability) { 1.0 } else { 0.0 };
        self.config.capability_weight * capability_match
            + self.config.availability_weight * record.status.availability()
            + self.config.performance_weight * record.metrics.performance()
    }

    /// Score every agent offering `capability`, best first.
    ///
    /// Ties go to the agent with fewer in-flight tasks, then to the lower id.
    pub async fn score_candidates(&self, capability: &str) -> Vec<CandidateScore> {
        let state = self.state.read().await;
        let mut candidates: Vec<CandidateScore> = state
            .agents
            .values()
            .filter(|e| e.record.has_capability(capability))
            .map(|e| CandidateScore {
                agent_id: e.record.id.clone(),
                status: e.record.status,
                score: self.score(&e.record, capability),
                in_flight: e.record.in_flight,
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.in_flight.cmp(&b.in_flight))
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        candidates
    }

    /// Pick the best Active or Degraded agent offering `capability`.
    pub async fn select_agent(&self, capability: &str) -> HarmoniaResult<AgentId> {
        let selected = self
            .score_candidates(capability)
            .await
            .into_iter()
            .find(|c| c.status.is_selectable());
        match selected {
            Some(candidate) => {
                debug!(
                    agent = %candidate.agent_id,
                    capability,
                    score = candidate.score,
                    "Agent selected"
                );
                Ok(candidate.agent_id)
            }
            None => Err(HarmoniaError::NoEligibleAgent {
                capability: capability.to_string(),
            }),
        }
    }

    /// Hand `task_id` to `agent_id`.
    ///
    /// The task orchestrator decides whether dependencies allow the start. On
    /// success the agent's in-flight count grows and an [`Assignment`] is
    /// logged; otherwise the task stays queued and [`AssignOutcome::Waiting`]
    /// lists what it still waits for.
    pub async fn assign_task(
        &self,
        agent_id: &str,
        task_id: TaskId,
        tasks: &TaskOrchestrator,
    ) -> HarmoniaResult<AssignOutcome> {
        let mut state = self.state.write().await;
        let task = tasks
            .get(task_id)
            .await
            .ok_or(HarmoniaError::UnknownTask(task_id))?;
        let entry = state
            .agents
            .get(agent_id)
            .ok_or_else(|| HarmoniaError::UnknownAgent(agent_id.to_string()))?;
        if !entry.record.status.is_selectable() || !entry.record.has_capability(task.capability()) {
            return Err(HarmoniaError::NoEligibleAgent {
                capability: task.capability().to_string(),
            });
        }

        let (task, cancel) = match tasks.start(task_id, agent_id).await {
            Ok(started) => started,
            Err(HarmoniaError::DependencyNotSatisfied { pending, .. }) => {
                debug!(task = %task_id, agent = %agent_id, pending = pending.len(), "Assignment deferred");
                return Ok(AssignOutcome::Waiting { pending });
            }
            Err(e) => return Err(e),
        };

        if let Some(entry) = state.agents.get_mut(agent_id) {
            entry.record.in_flight += 1;
        }
        if state.assignments.len() >= self.config.assignment_log_limit.max(1) {
            state.assignments.pop_front();
        }
        state.assignments.push_back(Assignment {
            agent_id: agent_id.to_string(),
            task_id,
            assigned_at: Utc::now(),
        });
        info!(task = %task_id, agent = %agent_id, "Task assigned");
        Ok(AssignOutcome::Executing { task, cancel })
    }

    /// Fold a finished task into the agent's metrics and free its slot.
    pub async fn record_outcome(&self, id: &str, success: bool, duration_ms: u64) -> HarmoniaResult<AgentRecord> {
        let mut state = self.state.write().await;
        let entry = state
            .agents
            .get_mut(id)
            .ok_or_else(|| HarmoniaError::UnknownAgent(id.to_string()))?;
        entry.record.metrics.record(success, duration_ms);
        entry.record.in_flight = entry.record.in_flight.saturating_sub(1);
        debug!(
            agent = %id,
            success,
            duration_ms,
            success_rate = entry.record.metrics.success_rate,
            "Agent metrics updated"
        );
        Ok(entry.record.clone())
    }

    /// Free an in-flight slot without touching metrics (cancelled work).
    pub async fn release(&self, id: &str) {
        let mut state = self.state.write().await;
        match state.agents.get_mut(id) {
            Some(entry) => entry.record.in_flight = entry.record.in_flight.saturating_sub(1),
            None => warn!(agent = %id, "Release for unknown agent"),
        }
    }

    /// Share of non-stopped agents that are Active; 0 with no agents.
    pub async fn fraction_active(&self) -> f64 {
        let state = self.state.read().await;
        let live: Vec<&AgentEntry> = state
            .agents
            .values()
            .filter(|e| e.record.status != AgentStatus::Stopped)
            .collect();
        if live.is_empty() {
            return 0.0;
        }
        let active = live
            .iter()
            .filter(|e| e.record.status == AgentStatus::Active)
            .count();
        active as f64 / live.len() as f64
    }

    /// Assignment log, oldest first.
    pub async fn assignments(&self) -> Vec<Assignment> {
        self.state.read().await.assignments.iter().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::ProbeSignal;
    use crate::types::{TaskDefinition, TaskOutcome, TaskStatus};
    use async_trait::async_trait;

    struct Idle;

    #[async_trait]
    impl AgentHandle for Idle {
        async fn probe(&self) -> HarmoniaResult<ProbeSignal> {
            Ok(ProbeSignal::Healthy)
        }

        async fn execute(&self, _task: &Task, _cancel: CancelSignal) -> HarmoniaResult<TaskOutcome> {
            Ok(TaskOutcome::completed(serde_json::Value::Null))
        }
    }

    fn coordinator() -> AgentCoordinator {
        AgentCoordinator::new(CoordinatorConfig::default())
    }

    async fn activate(c: &AgentCoordinator, id: &str) {
        c.apply_health(id, |r| r.status = AgentStatus::Active).await;
    }

    #[tokio::test]
    async fn test_register_and_duplicate() {
        let c = coordinator();
        let rec = c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        assert_eq!(rec.status, AgentStatus::Initializing);

        let err = c.register("a1", ["test"], Arc::new(Idle)).await.unwrap_err();
        assert!(matches!(err, HarmoniaError::DuplicateId(id) if id == "a1"));
    }

    #[tokio::test]
    async fn test_reregister_over_stopped() {
        let c = coordinator();
        c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        c.deregister("a1").await.unwrap();
        assert!(c.probe_targets().await.is_empty());

        let rec = c.register("a1", ["lint"], Arc::new(Idle)).await.unwrap();
        assert!(rec.has_capability("lint"));
        assert_eq!(c.len().await, 1);
    }

    #[tokio::test]
    async fn test_select_requires_active_or_degraded() {
        let c = coordinator();
        c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        // Still initializing.
        assert!(matches!(
            c.select_agent("build").await,
            Err(HarmoniaError::NoEligibleAgent { .. })
        ));
        activate(&c, "a1").await;
        assert_eq!(c.select_agent("build").await.unwrap(), "a1");
        assert!(c.select_agent("deploy").await.is_err());
    }

    #[tokio::test]
    async fn test_score_formula() {
        let c = coordinator();
        let mut rec = AgentRecord::new("a", BTreeSet::from(["build".to_string()]));
        rec.status = AgentStatus::Degraded;
        // 0.4*1 + 0.3*0.5 + 0.3*0.5
        assert!((c.score(&rec, "build") - 0.7).abs() < 1e-9);
        rec.metrics.record(true, 10);
        // 0.4 + 0.15 + 0.3
        assert!((c.score(&rec, "build") - 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ties_break_on_in_flight_then_id() {
        let c = coordinator();
        let tasks = TaskOrchestrator::new();
        for id in ["b", "a"] {
            c.register(id, ["build"], Arc::new(Idle)).await.unwrap();
            activate(&c, id).await;
        }
        assert_eq!(c.select_agent("build").await.unwrap(), "a");

        let t = tasks.submit(TaskDefinition::new("build"), [], 0).await.unwrap();
        c.assign_task("a", t.id, &tasks).await.unwrap();
        assert_eq!(c.select_agent("build").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_assign_waits_on_dependencies() {
        let c = coordinator();
        let tasks = TaskOrchestrator::new();
        c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        activate(&c, "a1").await;

        let t1 = tasks.submit(TaskDefinition::new("build"), [], 0).await.unwrap();
        let t2 = tasks.submit(TaskDefinition::new("build"), [t1.id], 0).await.unwrap();

        match c.assign_task("a1", t2.id, &tasks).await.unwrap() {
            AssignOutcome::Waiting { pending } => assert_eq!(pending, vec![t1.id]),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(c.get("a1").await.unwrap().in_flight, 0);

        match c.assign_task("a1", t1.id, &tasks).await.unwrap() {
            AssignOutcome::Executing { task, .. } => assert_eq!(task.status, TaskStatus::Executing),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(c.get("a1").await.unwrap().in_flight, 1);
        assert_eq!(c.assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_record_outcome_updates_metrics() {
        let c = coordinator();
        c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        let rec = c.record_outcome("a1", true, 40).await.unwrap();
        assert_eq!(rec.metrics.tasks_completed, 1);
        assert_eq!(rec.metrics.success_rate, 1.0);
        assert!(c.record_outcome("ghost", true, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_fraction_active() {
        let c = coordinator();
        assert_eq!(c.fraction_active().await, 0.0);
        c.register("a", ["x"], Arc::new(Idle)).await.unwrap();
        c.register("b", ["x"], Arc::new(Idle)).await.unwrap();
        c.register("c", ["x"], Arc::new(Idle)).await.unwrap();
        activate(&c, "a").await;
        c.deregister("c").await.unwrap();
        assert!((c.fraction_active().await - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_assignment_log_bounded() {
        let config = CoordinatorConfig {
            assignment_log_limit: 2,
            ..CoordinatorConfig::default()
        };
        let c = AgentCoordinator::new(config);
        let tasks = TaskOrchestrator::new();
        c.register("a1", ["build"], Arc::new(Idle)).await.unwrap();
        activate(&c, "a1").await;
        for _ in 0..3 {
            let t = tasks.submit(TaskDefinition::new("build"), [], 0).await.unwrap();
            c.assign_task("a1", t.id, &tasks).await.unwrap();
        }
        assert_eq!(c.assignments().await.len(), 2);
    }
}
