use crate::agent::{AgentHandle, CancelSignal};
use crate::coordinator::{AgentCoordinator, AssignOutcome};
use crate::evolution::{DefaultTriggerHandler, EvolutionQueue, TriggerHandler};
use crate::harmony::{HarmonyController, HarmonyEvaluation, HarmonyInputs};
use crate::journal::{JournalSink, NullJournal};
use crate::monitor::HealthMonitor;
use crate::scheduler::LoopHandles;
use crate::task_graph::TaskOrchestrator;
use crate::types::{
    AgentId, AgentRecord, EvolutionRecord, EvolutionTrigger, HarmonySnapshot, HealthEntry,
    HealthReport, QueueStats, Task, TaskDefinition, TaskId, TaskOutcome, TaskStats,
};
use harmonia_core::{HarmoniaConfig, HarmoniaError, HarmoniaResult};
use harmonia_memory::{JaccardSimilarity, PatternStatistics, PatternStore, RecordOutcome, Similarity};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECENT_HEALTH_ENTRIES: usize = 50;

/// Point-in-time overview of every subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub agents: Vec<AgentRecord>,
    pub tasks: TaskStats,
    pub queue: QueueStats,
    pub patterns: PatternStatistics,
    pub harmony: HarmonySnapshot,
}

/// Builder for [`Harmonia`].
pub struct HarmoniaBuilder {
    config: HarmoniaConfig,
    journal: Option<Arc<dyn JournalSink>>,
    handler: Option<Box<dyn TriggerHandler>>,
    similarity: Option<Box<dyn Similarity>>,
}

impl HarmoniaBuilder {
    pub fn new(config: HarmoniaConfig) -> Self {
        Self {
            config,
            journal: None,
            handler: None,
            similarity: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn JournalSink>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_handler(mut self, handler: impl TriggerHandler + 'static) -> Self {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_similarity(mut self, similarity: impl Similarity + 'static) -> Self {
        self.similarity = Some(Box::new(similarity));
        self
    }

    /// Validate the configuration and wire up the subsystems.
    pub fn build(self) -> HarmoniaResult<Arc<Harmonia>> {
        self.config.validate()?;
        let config = self.config;
        let journal: Arc<dyn JournalSink> = self.journal.unwrap_or_else(|| Arc::new(NullJournal));
        let handler = self
            .handler
            .unwrap_or_else(|| Box::new(DefaultTriggerHandler));
        let similarity = self
            .similarity
            .unwrap_or_else(|| Box::new(JaccardSimilarity));

        info!(
            health_interval_secs = config.health.interval_secs,
            queue_capacity = config.evolution.queue_capacity,
            harmony_interval_secs = config.harmony.interval_secs,
            "Harmonia engine created"
        );

        Ok(Arc::new(Harmonia {
            coordinator: AgentCoordinator::new(config.coordinator.clone()),
            tasks: TaskOrchestrator::new(),
            patterns: PatternStore::with_boxed_similarity(config.patterns.clone(), similarity),
            queue: EvolutionQueue::with_parts(&config.evolution, handler, journal.clone()),
            monitor: HealthMonitor::new(config.health.clone()),
            harmony: HarmonyController::new(config.harmony.clone(), journal.clone()),
            journal,
            config,
        }))
    }
}

/// The coordination engine: one instance of every subsystem, wired together.
///
/// Subsystems only affect each other through the operations below. Nested
/// locking always follows coordinator, then tasks, then patterns, then the
/// trigger queue.
pub struct Harmonia {
    config: HarmoniaConfig,
    coordinator: AgentCoordinator,
    tasks: TaskOrchestrator,
    patterns: PatternStore,
    queue: EvolutionQueue,
    monitor: HealthMonitor,
    harmony: HarmonyController,
    journal: Arc<dyn JournalSink>,
}

impl Harmonia {
    /// Engine with default handler, similarity and a discarding journal.
    pub fn new(config: HarmoniaConfig) -> HarmoniaResult<Arc<Self>> {
        HarmoniaBuilder::new(config).build()
    }

    pub fn builder(config: HarmoniaConfig) -> HarmoniaBuilder {
        HarmoniaBuilder::new(config)
    }

    pub fn config(&self) -> &HarmoniaConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &AgentCoordinator {
        &self.coordinator
    }

    pub fn tasks(&self) -> &TaskOrchestrator {
        &self.tasks
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn queue(&self) -> &EvolutionQueue {
        &self.queue
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn harmony(&self) -> &HarmonyController {
        &self.harmony
    }

    pub fn journal(&self) -> &Arc<dyn JournalSink> {
        &self.journal
    }

    // --- Agents ---

    /// Register an agent. It starts `Initializing` and becomes selectable
    /// after its first successful probe.
    pub async fn register_agent(
        &self,
        id: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        handle: Arc<dyn AgentHandle>,
    ) -> HarmoniaResult<AgentRecord> {
        self.coordinator.register(id, capabilities, handle).await
    }

    pub async fn deregister_agent(&self, id: &str) -> HarmoniaResult<AgentRecord> {
        self.coordinator.deregister(id).await
    }

    // --- Tasks ---

    /// Submit a task. With auto-dispatch on, a task whose dependencies are
    /// already complete is handed to an agent right away.
    pub async fn submit(
        self: &Arc<Self>,
        definition: TaskDefinition,
        dependencies: impl IntoIterator<Item = TaskId>,
        priority: i64,
    ) -> HarmoniaResult<TaskId> {
        let task = self.tasks.submit(definition, dependencies, priority).await?;
        if self.config.execution.auto_dispatch && self.tasks.is_ready(task.id).await {
            self.try_dispatch(task.id).await;
        }
        Ok(task.id)
    }

    /// Best agent for a submitted task.
    pub async fn select_agent(&self, task_id: TaskId) -> HarmoniaResult<AgentId> {
        let task = self
            .tasks
            .get(task_id)
            .await
            .ok_or(HarmoniaError::UnknownTask(task_id))?;
        self.coordinator.select_agent(task.capability()).await
    }

    /// Assign without executing. The caller owns execution and must report
    /// the result through [`Harmonia::report_result`].
    pub async fn assign_task(&self, agent_id: &str, task_id: TaskId) -> HarmoniaResult<AssignOutcome> {
        self.coordinator.assign_task(agent_id, task_id, &self.tasks).await
    }

    /// Select an agent, assign the task and start its execution.
    ///
    /// Returns the agent when execution started, `None` when the task waits
    /// on dependencies.
    pub async fn dispatch(self: &Arc<Self>, task_id: TaskId) -> HarmoniaResult<Option<AgentId>> {
        let agent_id = self.select_agent(task_id).await?;
        match self.assign_task(&agent_id, task_id).await? {
            AssignOutcome::Executing { task, cancel } => {
                self.spawn_execution(agent_id.clone(), task, cancel);
                Ok(Some(agent_id))
            }
            AssignOutcome::Waiting { .. } => Ok(None),
        }
    }

    /// Dispatch every ready, unassigned task. Returns how many started.
    pub async fn dispatch_ready(self: &Arc<Self>) -> usize {
        let mut started = 0;
        for task_id in self.tasks.ready_unassigned().await {
            if self.try_dispatch(task_id).await {
                started += 1;
            }
        }
        if started > 0 {
            debug!(started, "Ready tasks dispatched");
        }
        started
    }

    async fn try_dispatch(self: &Arc<Self>, task_id: TaskId) -> bool {
        match self.dispatch(task_id).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e @ HarmoniaError::NoEligibleAgent { .. }) => {
                debug!(task = %task_id, error = %e, "Task waits for an eligible agent");
                false
            }
            Err(e) => {
                warn!(task = %task_id, error = %e, "Dispatch failed");
                false
            }
        }
    }

    /// Apply an execution result.
    ///
    /// Updates the task and the agent's metrics, records the outcome as a
    /// pattern observation, and (with auto-dispatch) starts every dependent
    /// the completion released. Returns the released task ids.
    pub async fn report_result(
        self: &Arc<Self>,
        task_id: TaskId,
        outcome: TaskOutcome,
    ) -> HarmoniaResult<Vec<TaskId>> {
        let success = outcome.is_success();
        let (task, released, reason) = match outcome {
            TaskOutcome::Completed { output } => {
                let (task, released) = self.tasks.complete(task_id, output).await?;
                (task, released, None)
            }
            TaskOutcome::Failed { reason } => {
                let task = self.tasks.fail(task_id, reason.clone()).await?;
                (task, Vec::new(), Some(reason))
            }
        };

        let agent_id = task.assigned_agent.clone().unwrap_or_default();
        if let Err(e) = self
            .coordinator
            .record_outcome(&agent_id, success, task.duration_ms().unwrap_or(0))
            .await
        {
            warn!(task = %task_id, agent = %agent_id, error = %e, "Outcome not attributed");
        }

        self.record_pattern(
            &json!({ "capability": task.capability(), "agent": agent_id }),
            &json!({ "status": task.status, "reason": reason }),
        );

        if self.config.execution.auto_dispatch {
            let mut work: VecDeque<TaskId> = released.iter().copied().collect();
            while let Some(next) = work.pop_front() {
                self.try_dispatch(next).await;
            }
        }
        Ok(released)
    }

    /// Cancel a queued or executing task. Executing work gets its cancel
    /// signal; dependents stay blocked.
    pub async fn cancel(&self, task_id: TaskId) -> HarmoniaResult<Task> {
        let task = self.tasks.cancel(task_id).await?;
        if task.started_at.is_some() {
            if let Some(agent_id) = &task.assigned_agent {
                self.coordinator.release(agent_id).await;
            }
        }
        Ok(task)
    }

    fn spawn_execution(self: &Arc<Self>, agent_id: AgentId, task: Task, cancel: CancelSignal) {
        let engine = Arc::clone(self);
        let timeout = self.config.execution.timeout();
        tokio::spawn(async move {
            let outcome = match engine.coordinator.handle(&agent_id).await {
                None => TaskOutcome::failed(format!("agent '{agent_id}' is not registered")),
                Some(handle) => match tokio::time::timeout(timeout, handle.execute(&task, cancel)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => TaskOutcome::failed(e.to_string()),
                    Err(_) => {
                        TaskOutcome::failed(format!("execution timed out after {}s", timeout.as_secs()))
                    }
                },
            };
            match engine.report_result(task.id, outcome).await {
                Ok(_) => {}
                Err(e @ HarmoniaError::InvalidTransition { .. }) => {
                    debug!(task = %task.id, error = %e, "Late result ignored");
                }
                Err(e) => warn!(task = %task.id, error = %e, "Result not applied"),
            }
        });
    }

    // --- Patterns and evolution ---

    /// Record an observation. Crossing the occurrence threshold enqueues one
    /// `PatternDetected` trigger for the record.
    pub fn record_pattern(&self, context: &Value, outcome: &Value) -> RecordOutcome {
        let recorded = self.patterns.record(context, outcome);
        if recorded.threshold_crossed {
            let record = &recorded.record;
            let trigger = EvolutionTrigger::pattern_detected(
                record.id,
                record.fingerprint(),
                record.occurrences,
                record.confidence,
                record.context.clone(),
                record.outcome.clone(),
                self.config.patterns.trigger_priority,
            );
            match self.queue.enqueue(trigger) {
                Ok(receipt) => {
                    info!(
                        pattern = record.id,
                        signature = %record.signature.short(),
                        trigger = %receipt.id,
                        "Pattern detected"
                    );
                }
                Err(e) => debug!(error = %e, "Pattern trigger not enqueued"),
            }
        }
        recorded
    }

    pub fn process_next_trigger(&self) -> Option<EvolutionRecord> {
        self.queue.process_next()
    }

    pub fn drain_triggers(&self) -> Vec<EvolutionRecord> {
        self.queue.drain()
    }

    // --- Health and harmony ---

    /// One health cycle. Agents that recovered pick up waiting work.
    pub async fn check_health(self: &Arc<Self>) -> Vec<HealthEntry> {
        let entries = self.monitor.check_all(&self.coordinator, &self.queue).await;
        if self.config.execution.auto_dispatch {
            self.dispatch_ready().await;
        }
        entries
    }

    async fn harmony_inputs(&self) -> HarmonyInputs {
        let fraction_active = self.coordinator.fraction_active().await;
        let stats = self.tasks.stats().await;
        HarmonyInputs {
            duplicate_rate: self.queue.duplicate_reject_rate(),
            tasks_completed: stats.completed,
            tasks_failed: stats.failed,
            fraction_active,
        }
    }

    pub async fn evaluate_harmony(&self) -> HarmonyEvaluation {
        let inputs = self.harmony_inputs().await;
        self.harmony.evaluate(&inputs, &self.queue)
    }

    // --- Reports ---

    pub async fn get_agent_status(&self, id: &str) -> Option<AgentRecord> {
        self.coordinator.get(id).await
    }

    pub async fn get_health_report(&self) -> HealthReport {
        self.monitor
            .health_report(&self.coordinator, RECENT_HEALTH_ENTRIES)
            .await
    }

    /// Latest stored snapshot, or a fresh unstored one before the first
    /// harmony cycle.
    pub async fn get_harmony_snapshot(&self) -> HarmonySnapshot {
        match self.harmony.latest() {
            Some(snapshot) => snapshot,
            None => self.harmony.compute(&self.harmony_inputs().await),
        }
    }

    pub fn get_queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(id).await
    }

    pub async fn task_stats(&self) -> TaskStats {
        self.tasks.stats().await
    }

    pub async fn status_report(&self) -> StatusReport {
        StatusReport {
            agents: self.coordinator.list().await,
            tasks: self.tasks.stats().await,
            queue: self.queue.stats(),
            patterns: self.patterns.statistics(),
            harmony: self.get_harmony_snapshot().await,
        }
    }

    // --- Loops ---

    /// Start the health, evolution-drain and harmony loops.
    ///
    /// Health and drain tick immediately; the first harmony evaluation waits
    /// one full period.
    pub fn start(self: &Arc<Self>) -> LoopHandles {
        let mut loops = LoopHandles::new();

        let engine = Arc::clone(self);
        loops.spawn_periodic("health", self.config.health.interval(), Duration::ZERO, move || {
            let engine = engine.clone();
            async move {
                engine.check_health().await;
            }
        });

        let engine = Arc::clone(self);
        loops.spawn_periodic(
            "evolution",
            self.config.evolution.drain_interval(),
            Duration::ZERO,
            move || {
                let engine = engine.clone();
                async move {
                    let processed = engine.drain_triggers();
                    if !processed.is_empty() {
                        debug!(processed = processed.len(), "Evolution queue drained");
                    }
                }
            },
        );

        let engine = Arc::clone(self);
        let harmony_period = self.config.harmony.interval();
        loops.spawn_periodic("harmony", harmony_period, harmony_period, move || {
            let engine = engine.clone();
            async move {
                engine.evaluate_harmony().await;
            }
        });

        info!(loops = ?loops.names(), "Harmonia loops started");
        loops
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::ProbeSignal;
    use crate::types::{AgentStatus, TaskStatus};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AgentHandle for Echo {
        async fn probe(&self) -> HarmoniaResult<ProbeSignal> {
            Ok(ProbeSignal::Healthy)
        }

        async fn execute(&self, task: &Task, _cancel: CancelSignal) -> HarmoniaResult<TaskOutcome> {
            Ok(TaskOutcome::completed(task.definition.payload.clone()))
        }
    }

    fn manual_config() -> HarmoniaConfig {
        let mut config = HarmoniaConfig::default();
        config.execution.auto_dispatch = false;
        config
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = HarmoniaConfig::default();
        config.evolution.queue_capacity = 0;
        assert!(Harmonia::new(config).is_err());
    }

    #[tokio::test]
    async fn test_manual_assign_and_report() {
        let engine = Harmonia::new(manual_config()).unwrap();
        engine.register_agent("a1", ["build"], Arc::new(Echo)).await.unwrap();
        engine.check_health().await;

        let t1 = engine.submit(TaskDefinition::new("build"), [], 0).await.unwrap();
        assert_eq!(engine.get_task(t1).await.unwrap().status, TaskStatus::Queued);
        assert_eq!(engine.select_agent(t1).await.unwrap(), "a1");

        let outcome = engine.assign_task("a1", t1).await.unwrap();
        assert!(matches!(outcome, AssignOutcome::Executing { .. }));
        engine
            .report_result(t1, TaskOutcome::completed(json!({"artifact": "bin"})))
            .await
            .unwrap();

        let agent = engine.get_agent_status("a1").await.unwrap();
        assert_eq!(agent.metrics.tasks_completed, 1);
        assert_eq!(agent.in_flight, 0);
        assert_eq!(engine.patterns().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let engine = Harmonia::new(manual_config()).unwrap();
        engine.register_agent("a1", ["build"], Arc::new(Echo)).await.unwrap();
        engine.check_health().await;
        let t1 = engine.submit(TaskDefinition::new("build"), [], 0).await.unwrap();
        engine.assign_task("a1", t1).await.unwrap();
        assert_eq!(engine.get_agent_status("a1").await.unwrap().in_flight, 1);

        let task = engine.cancel(t1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let agent = engine.get_agent_status("a1").await.unwrap();
        assert_eq!(agent.in_flight, 0);
        assert_eq!(agent.metrics.tasks_finished(), 0);

        let err = engine.report_result(t1, TaskOutcome::completed(Value::Null)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_record_pattern_emits_one_trigger() {
        let engine = Harmonia::new(HarmoniaConfig::default()).unwrap();
        let ctx = json!({"capability": "build", "error": "E0308"});
        let out = json!({"status": "failed"});
        for _ in 0..5 {
            engine.record_pattern(&ctx, &out);
        }
        let stats = engine.get_queue_stats();
        assert_eq!(stats.pending, 1);
        let records = engine.drain_triggers();
        assert_eq!(records.len(), 1);
        assert!(records[0].action.is_some());
    }

    #[tokio::test]
    async fn test_harmony_snapshot_before_first_cycle() {
        let engine = Harmonia::new(HarmoniaConfig::default()).unwrap();
        let snapshot = engine.get_harmony_snapshot().await;
        assert_eq!(snapshot.task_score, 0.5);
        assert!(engine.harmony().history().is_empty());
    }

    #[tokio::test]
    async fn test_status_report() {
        let engine = Harmonia::new(HarmoniaConfig::default()).unwrap();
        engine.register_agent("a1", ["build"], Arc::new(Echo)).await.unwrap();
        engine.check_health().await;
        let report = engine.status_report().await;
        assert_eq!(report.agents.len(), 1);
        assert_eq!(report.agents[0].status, AgentStatus::Active);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("harmony").is_some());
    }
}
