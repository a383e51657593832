use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`HarmoniaError`].
pub type HarmoniaResult<T> = Result<T, HarmoniaError>;

/// Top-level error type for the Harmonia coordination core.
///
/// Caller-facing contract violations (duplicate ids, missing agents, premature
/// starts) are returned from the synchronous operations. The periodic loops
/// catch and log everything else.
#[derive(Error, Debug)]
pub enum HarmoniaError {
    /// An agent with this id is already registered and not stopped.
    #[error("Duplicate agent id: {0}")]
    DuplicateId(String),

    /// No Active or Degraded agent offers the required capability.
    #[error("No eligible agent for capability '{capability}'")]
    NoEligibleAgent { capability: String },

    /// A task was started before every dependency completed.
    #[error("Task {task} has unsatisfied dependencies: {pending:?}")]
    DependencyNotSatisfied { task: Uuid, pending: Vec<Uuid> },

    /// An equivalent trigger is already pending in the evolution queue.
    #[error("Duplicate pending trigger: {kind} for {payload}")]
    DuplicateTrigger { kind: String, payload: String },

    /// A health probe did not answer in time. Never surfaces past the health monitor.
    #[error("Probe for agent '{agent}' timed out after {timeout_ms}ms")]
    ProbeTimeout { agent: String, timeout_ms: u64 },

    /// The evolution queue overflowed and evicted a trigger. Logged, not propagated.
    #[error("Evolution queue at capacity {capacity}, dropped trigger {dropped}")]
    QueueOverflow { capacity: usize, dropped: Uuid },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown task: {0}")]
    UnknownTask(Uuid),

    /// A submitted task names a dependency that was never submitted.
    #[error("Unknown dependency: {0}")]
    UnknownDependency(Uuid),

    /// A task state change that its state machine does not allow.
    #[error("Task {task} cannot move from {from} to {to}")]
    InvalidTransition {
        task: Uuid,
        from: String,
        to: String,
    },

    /// A trigger handler refused or failed to process a trigger.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An agent's execute callback failed outside the task's own outcome.
    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarmoniaError {
    /// Whether the error is a caller-facing contract violation rather than a
    /// transient failure inside a loop.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            HarmoniaError::DuplicateId(_)
                | HarmoniaError::NoEligibleAgent { .. }
                | HarmoniaError::DependencyNotSatisfied { .. }
                | HarmoniaError::UnknownAgent(_)
                | HarmoniaError::UnknownTask(_)
                | HarmoniaError::UnknownDependency(_)
                | HarmoniaError::InvalidTransition { .. }
        )
    }
}
