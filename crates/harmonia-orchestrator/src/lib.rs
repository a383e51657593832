//! Agent coordination and evolution scheduling.
//!
//! Agents register with a capability set and a probe/execute handle; tasks
//! form a dependency graph and are released to the best-scoring eligible
//! agent once their dependencies complete. Recurring outcomes, degraded
//! agents and drops in the composite harmony score turn into prioritized
//! evolution triggers.
//!
//! # Main types
//!
//! - [`Harmonia`]: Engine wiring every subsystem together, plus the periodic loops.
//! - [`AgentCoordinator`]: Agent registry, selection scoring and assignment log.
//! - [`TaskOrchestrator`]: Dependency-gated task state machine.
//! - [`HealthMonitor`]: Concurrent probing with hysteresis and a history ring.
//! - [`EvolutionQueue`]: Bounded, deduplicating priority queue of triggers.
//! - [`HarmonyController`]: Composite score and rebalancing requests.
//! - [`JournalSink`]: Destination for evolution records and harmony snapshots.

/// Agent handle trait and cooperative cancellation.
pub mod agent;
/// Agent registry and selection.
pub mod coordinator;
/// The engine.
pub mod engine;
/// Evolution trigger queue and handlers.
pub mod evolution;
/// Meta-orchestrator.
pub mod harmony;
/// Journal sinks.
pub mod journal;
/// Health monitoring.
pub mod monitor;
/// Periodic background loops.
pub mod scheduler;
/// Task dependency graph.
pub mod task_graph;
/// Shared types (agents, tasks, triggers, snapshots).
pub mod types;

pub use agent::{cancel_pair, AgentHandle, CancelHandle, CancelSignal, ProbeSignal};
pub use coordinator::{AgentCoordinator, AssignOutcome, CandidateScore};
pub use engine::{Harmonia, HarmoniaBuilder, StatusReport};
pub use evolution::{DefaultTriggerHandler, EnqueueReceipt, EvolutionQueue, TriggerHandler};
pub use harmony::{HarmonyController, HarmonyEvaluation, HarmonyInputs};
pub use journal::{FileJournal, JournalEntry, JournalSink, MemoryJournal, NullJournal};
pub use monitor::{classify, Classification, HealthMonitor};
pub use scheduler::LoopHandles;
pub use task_graph::TaskOrchestrator;
pub use types::{
    AgentId, AgentMetrics, AgentRecord, AgentStatus, Assignment, EvolutionAction,
    EvolutionRecord, EvolutionTrigger, HarmonySnapshot, HarmonyStatus, HealthEntry,
    HealthReport, ProbeResult, QueueStats, Subsystem, Task, TaskDefinition, TaskId, TaskOutcome,
    TaskStats, TaskStatus, TriggerKind, TriggerPayload, TriggerStatus,
};
