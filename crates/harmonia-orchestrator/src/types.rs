use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Unique, caller-chosen agent identifier.
pub type AgentId = String;
/// Task identifier assigned on submission.
pub type TaskId = Uuid;

/// Health status of a registered agent.
///
/// Ordered by severity for the probed states: Active < Degraded < Unhealthy < Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Initializing,
    Active,
    Degraded,
    Unhealthy,
    Failed,
    Stopped,
}

impl AgentStatus {
    /// Availability component of the selection score.
    pub fn availability(self) -> f64 {
        match self {
            AgentStatus::Active => 1.0,
            AgentStatus::Degraded => 0.5,
            AgentStatus::Unhealthy => 0.1,
            AgentStatus::Failed | AgentStatus::Stopped | AgentStatus::Initializing => 0.0,
        }
    }

    /// Whether the agent may receive new tasks.
    pub fn is_selectable(self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::Degraded)
    }

    /// One severity level down, used after a failed probe.
    pub fn degrade(self) -> Self {
        match self {
            AgentStatus::Initializing | AgentStatus::Active => AgentStatus::Degraded,
            AgentStatus::Degraded => AgentStatus::Unhealthy,
            AgentStatus::Unhealthy | AgentStatus::Failed => AgentStatus::Failed,
            AgentStatus::Stopped => AgentStatus::Stopped,
        }
    }

    /// One severity level up, used after a successful probe.
    pub fn recover(self) -> Self {
        match self {
            AgentStatus::Initializing | AgentStatus::Active | AgentStatus::Degraded => {
                AgentStatus::Active
            }
            AgentStatus::Unhealthy => AgentStatus::Degraded,
            AgentStatus::Failed => AgentStatus::Unhealthy,
            AgentStatus::Stopped => AgentStatus::Stopped,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Initializing => write!(f, "initializing"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Degraded => write!(f, "degraded"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Failed => write!(f, "failed"),
            AgentStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Performance metrics tracked per agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// `tasks_completed / (tasks_completed + tasks_failed)`, 0 before any result.
    pub success_rate: f64,
    pub average_duration_ms: f64,
    /// Last healthy probe or finished task.
    pub last_active_at: Option<DateTime<Utc>>,
}

impl AgentMetrics {
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }

    /// Performance component of the selection score. Agents without any
    /// finished task score a neutral 0.5 so new agents are not starved.
    pub fn performance(&self) -> f64 {
        if self.tasks_finished() == 0 {
            0.5
        } else {
            self.success_rate
        }
    }

    /// Fold one finished task into the metrics.
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let finished = self.tasks_finished() as f64;
        self.success_rate = self.tasks_completed as f64 / finished;
        self.average_duration_ms += (duration_ms as f64 - self.average_duration_ms) / finished;
        self.last_active_at = Some(Utc::now());
    }
}

/// Registry entry for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
    /// Assigned tasks that have not reported a result yet.
    pub in_flight: usize,
    pub consecutive_timeouts: u32,
    /// Failed probes observed while already in `Failed`.
    pub failed_cycles: u32,
    pub registered_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: impl Into<String>, capabilities: BTreeSet<String>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            status: AgentStatus::Initializing,
            metrics: AgentMetrics::default(),
            in_flight: 0,
            consecutive_timeouts: 0,
            failed_cycles: 0,
            registered_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

/// What a task needs: the capability tag plus an opaque payload for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub capability: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub label: Option<String>,
}

impl TaskDefinition {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            payload: Value::Null,
            label: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Status of a task in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Queued,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Created => write!(f, "created"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Executing => write!(f, "executing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work tracked by the task orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub definition: TaskDefinition,
    pub dependencies: BTreeSet<TaskId>,
    /// Higher is more urgent.
    pub priority: i64,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub output: Option<Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(definition: TaskDefinition, dependencies: BTreeSet<TaskId>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            definition,
            dependencies,
            priority,
            status: TaskStatus::Created,
            assigned_agent: None,
            output: None,
            failure_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn capability(&self) -> &str {
        &self.definition.capability
    }

    /// Execution time in milliseconds, once the task has started and finished.
    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds().max(0) as u64)
    }
}

/// Result reported by an agent's execute callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed {
        #[serde(default)]
        output: Value,
    },
    Failed {
        reason: String,
    },
}

impl TaskOutcome {
    pub fn completed(output: Value) -> Self {
        TaskOutcome::Completed { output }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }
}

/// Record of a task handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub assigned_at: DateTime<Utc>,
}

/// Counts of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub created: usize,
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn total(&self) -> usize {
        self.created + self.queued + self.executing + self.completed + self.failed
    }
}

/// The three subsystems scored by the harmony controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Patterns,
    Tasks,
    Agents,
}

impl std::fmt::Display for Subsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subsystem::Patterns => write!(f, "patterns"),
            Subsystem::Tasks => write!(f, "tasks"),
            Subsystem::Agents => write!(f, "agents"),
        }
    }
}

/// Kind of structural-change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    PatternDetected,
    HealthDegraded,
    ManualRequest,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::PatternDetected => write!(f, "pattern_detected"),
            TriggerKind::HealthDegraded => write!(f, "health_degraded"),
            TriggerKind::ManualRequest => write!(f, "manual_request"),
        }
    }
}

/// What a trigger refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum TriggerPayload {
    Pattern {
        pattern_id: u64,
        fingerprint: String,
        occurrences: u64,
        confidence: f64,
        context: Value,
        outcome: Value,
    },
    Agent {
        agent_id: AgentId,
        status: AgentStatus,
    },
    Subsystem {
        subsystem: Subsystem,
        score: f64,
        overall: f64,
    },
}

impl TriggerPayload {
    /// Stable reference used to detect equivalent pending triggers.
    pub fn reference(&self) -> String {
        match self {
            TriggerPayload::Pattern { pattern_id, .. } => format!("pattern:{pattern_id}"),
            TriggerPayload::Agent { agent_id, .. } => format!("agent:{agent_id}"),
            TriggerPayload::Subsystem { subsystem, .. } => format!("subsystem:{subsystem}"),
        }
    }
}

/// Processing state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

/// A queued request for structural adjustment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionTrigger {
    pub id: Uuid,
    pub kind: TriggerKind,
    pub payload: TriggerPayload,
    pub priority: i64,
    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
}

impl EvolutionTrigger {
    fn new(kind: TriggerKind, payload: TriggerPayload, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            priority,
            status: TriggerStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// A recurring pattern crossed its occurrence threshold.
    pub fn pattern_detected(
        pattern_id: u64,
        fingerprint: impl Into<String>,
        occurrences: u64,
        confidence: f64,
        context: Value,
        outcome: Value,
        priority: i64,
    ) -> Self {
        Self::new(
            TriggerKind::PatternDetected,
            TriggerPayload::Pattern {
                pattern_id,
                fingerprint: fingerprint.into(),
                occurrences,
                confidence,
                context,
                outcome,
            },
            priority,
        )
    }

    /// An agent entered a degraded health state.
    pub fn health_degraded(agent_id: impl Into<String>, status: AgentStatus, priority: i64) -> Self {
        Self::new(
            TriggerKind::HealthDegraded,
            TriggerPayload::Agent {
                agent_id: agent_id.into(),
                status,
            },
            priority,
        )
    }

    /// Rebalancing request. Only the harmony controller creates these.
    pub(crate) fn manual_request(
        subsystem: Subsystem,
        score: f64,
        overall: f64,
        priority: i64,
    ) -> Self {
        Self::new(
            TriggerKind::ManualRequest,
            TriggerPayload::Subsystem {
                subsystem,
                score,
                overall,
            },
            priority,
        )
    }

    /// Kind plus payload reference; equal keys are equivalent triggers.
    pub fn dedup_key(&self) -> (TriggerKind, String) {
        (self.kind, self.payload.reference())
    }
}

/// Action produced by a trigger handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EvolutionAction {
    /// Generalized template distilled from a recurring pattern.
    SolutionTemplate {
        pattern_id: u64,
        fingerprint: String,
        occurrences: u64,
        confidence: f64,
        template: Value,
    },
    RestartAgent {
        agent_id: AgentId,
    },
    ReplaceAgent {
        agent_id: AgentId,
        status: AgentStatus,
    },
    Rebalance {
        subsystem: Subsystem,
        score: f64,
        recommendation: String,
    },
}

/// Outcome of processing one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionRecord {
    pub trigger_id: Uuid,
    pub kind: TriggerKind,
    pub payload: TriggerPayload,
    pub priority: i64,
    pub status: TriggerStatus,
    pub action: Option<EvolutionAction>,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// Evolution queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub capacity: usize,
    pub processing: bool,
    pub completed: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub enqueue_attempts: u64,
    pub duplicates_rejected: u64,
    pub pending_by_kind: BTreeMap<TriggerKind, usize>,
}

/// Composite health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarmonyStatus {
    Balanced,
    Unbalanced,
    Critical,
}

impl std::fmt::Display for HarmonyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarmonyStatus::Balanced => write!(f, "balanced"),
            HarmonyStatus::Unbalanced => write!(f, "unbalanced"),
            HarmonyStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Point-in-time composite score. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonySnapshot {
    pub pattern_score: f64,
    pub task_score: f64,
    pub agent_score: f64,
    pub overall: f64,
    pub status: HarmonyStatus,
    pub weakest: Subsystem,
    pub timestamp: DateTime<Utc>,
}

impl HarmonySnapshot {
    pub fn score_of(&self, subsystem: Subsystem) -> f64 {
        match subsystem {
            Subsystem::Patterns => self.pattern_score,
            Subsystem::Tasks => self.task_score,
            Subsystem::Agents => self.agent_score,
        }
    }
}

/// Classification of one probe attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "detail", rename_all = "snake_case")]
pub enum ProbeResult {
    Healthy,
    Unhealthy,
    Error(String),
    Timeout,
}

impl ProbeResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// One entry of the health history ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEntry {
    pub agent_id: AgentId,
    pub previous: AgentStatus,
    pub status: AgentStatus,
    pub probe: ProbeResult,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl HealthEntry {
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Best-effort health overview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub agents: Vec<AgentRecord>,
    pub counts: BTreeMap<AgentStatus, usize>,
    pub recent: Vec<HealthEntry>,
    pub generated_at: DateTime<Utc>,
}
