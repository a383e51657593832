use crate::journal::{JournalEntry, JournalSink, NullJournal};
use crate::types::{
    AgentStatus, EvolutionAction, EvolutionRecord, EvolutionTrigger, QueueStats, Subsystem,
    TriggerKind, TriggerPayload, TriggerStatus,
};
use chrono::Utc;
use harmonia_core::{EvolutionConfig, HarmoniaError, HarmoniaResult};
use parking_lot::Mutex;
use serde_json::json;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Turns a trigger into a concrete evolution action.
///
/// Implementations must be quick and side-effect free with respect to the
/// engine; the action is recorded, not executed, by the queue.
pub trait TriggerHandler: Send + Sync {
    fn handle(&self, trigger: &EvolutionTrigger) -> HarmoniaResult<EvolutionAction>;
}

/// Built-in handler: templates for patterns, restart/replace for degraded
/// agents, rebalancing for harmony requests.
#[derive(Debug, Default)]
pub struct DefaultTriggerHandler;

impl DefaultTriggerHandler {
    fn recommendation(subsystem: Subsystem) -> &'static str {
        match subsystem {
            Subsystem::Patterns => "consolidate near-duplicate pattern records",
            Subsystem::Tasks => "investigate failing tasks and resubmit blocked work",
            Subsystem::Agents => "restore or add agents for under-served capabilities",
        }
    }
}

impl TriggerHandler for DefaultTriggerHandler {
    fn handle(&self, trigger: &EvolutionTrigger) -> HarmoniaResult<EvolutionAction> {
        match (trigger.kind, &trigger.payload) {
            (
                TriggerKind::PatternDetected,
                TriggerPayload::Pattern {
                    pattern_id,
                    fingerprint,
                    occurrences,
                    confidence,
                    context,
                    outcome,
                },
            ) => Ok(EvolutionAction::SolutionTemplate {
                pattern_id: *pattern_id,
                fingerprint: fingerprint.clone(),
                occurrences: *occurrences,
                confidence: *confidence,
                template: json!({
                    "when": context,
                    "expect": outcome,
                    "confidence": confidence,
                }),
            }),
            (TriggerKind::HealthDegraded, TriggerPayload::Agent { agent_id, status }) => {
                match status {
                    AgentStatus::Degraded => Ok(EvolutionAction::RestartAgent {
                        agent_id: agent_id.clone(),
                    }),
                    AgentStatus::Unhealthy | AgentStatus::Failed => {
                        Ok(EvolutionAction::ReplaceAgent {
                            agent_id: agent_id.clone(),
                            status: *status,
                        })
                    }
                    other => Err(HarmoniaError::Handler(format!(
                        "agent '{agent_id}' is {other}, nothing to repair"
                    ))),
                }
            }
            (
                TriggerKind::ManualRequest,
                TriggerPayload::Subsystem {
                    subsystem, score, ..
                },
            ) => Ok(EvolutionAction::Rebalance {
                subsystem: *subsystem,
                score: *score,
                recommendation: Self::recommendation(*subsystem).to_string(),
            }),
            (kind, payload) => Err(HarmoniaError::Handler(format!(
                "{kind} trigger cannot carry {}",
                payload.reference()
            ))),
        }
    }
}

/// Result of a successful enqueue.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
    pub id: Uuid,
    /// Trigger evicted to make room. May be the enqueued trigger itself when
    /// it had the lowest priority.
    pub evicted: Option<EvolutionTrigger>,
}

impl EnqueueReceipt {
    /// Whether the enqueued trigger is actually pending.
    pub fn accepted(&self) -> bool {
        self.evicted.as_ref().map(|t| t.id) != Some(self.id)
    }
}

type OrderKey = (Reverse<i64>, u64);

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<OrderKey, EvolutionTrigger>,
    keys: HashMap<(TriggerKind, String), OrderKey>,
    seq: u64,
    in_progress: usize,
    completed: u64,
    rejected: u64,
    dropped: u64,
    attempts: BTreeMap<TriggerKind, u64>,
    duplicates: BTreeMap<TriggerKind, u64>,
}

/// Bounded max-priority queue of evolution triggers.
///
/// Ordered by priority descending, then enqueue order. At most one pending
/// trigger per (kind, payload reference). Processed triggers are journaled
/// and never re-enqueued.
pub struct EvolutionQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    handler: Box<dyn TriggerHandler>,
    journal: Arc<dyn JournalSink>,
}

impl EvolutionQueue {
    pub fn new(config: &EvolutionConfig) -> Self {
        Self::with_parts(config, Box::new(DefaultTriggerHandler), Arc::new(NullJournal))
    }

    pub fn with_parts(
        config: &EvolutionConfig,
        handler: Box<dyn TriggerHandler>,
        journal: Arc<dyn JournalSink>,
    ) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            state: Mutex::new(QueueState::default()),
            handler,
            journal,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a trigger. Equivalent pending triggers are refused with
    /// [`HarmoniaError::DuplicateTrigger`]; on overflow the lowest-priority
    /// pending trigger is evicted and journaled.
    pub fn enqueue(&self, mut trigger: EvolutionTrigger) -> HarmoniaResult<EnqueueReceipt> {
        trigger.status = TriggerStatus::Pending;
        let id = trigger.id;
        let key = trigger.dedup_key();

        let evicted = {
            let mut state = self.state.lock();
            *state.attempts.entry(trigger.kind).or_insert(0) += 1;
            if state.keys.contains_key(&key) {
                *state.duplicates.entry(trigger.kind).or_insert(0) += 1;
                return Err(HarmoniaError::DuplicateTrigger {
                    kind: key.0.to_string(),
                    payload: key.1,
                });
            }

            state.seq += 1;
            let order = (Reverse(trigger.priority), state.seq);
            debug!(trigger = %id, kind = %trigger.kind, priority = trigger.priority, "Trigger enqueued");
            state.keys.insert(key, order);
            state.pending.insert(order, trigger);

            if state.pending.len() > self.capacity {
                let lowest = state.pending.pop_last().map(|(_, t)| t);
                if let Some(lowest) = &lowest {
                    state.keys.remove(&lowest.dedup_key());
                    state.dropped += 1;
                }
                lowest
            } else {
                None
            }
        };

        if let Some(dropped) = &evicted {
            let err = HarmoniaError::QueueOverflow {
                capacity: self.capacity,
                dropped: dropped.id,
            };
            warn!(
                kind = %dropped.kind,
                priority = dropped.priority,
                error = %err,
                "Evolution trigger dropped"
            );
            self.journal.write(JournalEntry::TriggerDropped {
                trigger: dropped.clone(),
                capacity: self.capacity,
                dropped_at: Utc::now(),
            });
        }

        Ok(EnqueueReceipt { id, evicted })
    }

    /// Pop the highest-priority trigger and run the handler on it.
    ///
    /// Handler errors and panics reject the trigger; they never escape.
    pub fn process_next(&self) -> Option<EvolutionRecord> {
        let mut trigger = {
            let mut state = self.state.lock();
            let (_, trigger) = state.pending.pop_first()?;
            state.keys.remove(&trigger.dedup_key());
            state.in_progress += 1;
            trigger
        };
        trigger.status = TriggerStatus::Processing;

        let result = match catch_unwind(AssertUnwindSafe(|| self.handler.handle(&trigger))) {
            Ok(result) => result,
            Err(_) => Err(HarmoniaError::Handler("trigger handler panicked".to_string())),
        };

        let (status, action, error) = match result {
            Ok(action) => {
                info!(trigger = %trigger.id, kind = %trigger.kind, "Trigger processed");
                (TriggerStatus::Completed, Some(action), None)
            }
            Err(e) => {
                warn!(trigger = %trigger.id, kind = %trigger.kind, error = %e, "Trigger rejected");
                (TriggerStatus::Rejected, None, Some(e.to_string()))
            }
        };

        {
            let mut state = self.state.lock();
            state.in_progress = state.in_progress.saturating_sub(1);
            match status {
                TriggerStatus::Completed => state.completed += 1,
                _ => state.rejected += 1,
            }
        }

        let record = EvolutionRecord {
            trigger_id: trigger.id,
            kind: trigger.kind,
            payload: trigger.payload,
            priority: trigger.priority,
            status,
            action,
            error,
            processed_at: Utc::now(),
        };
        self.journal.write(JournalEntry::Evolution(record.clone()));
        Some(record)
    }

    /// Process until the queue is empty.
    pub fn drain(&self) -> Vec<EvolutionRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.process_next() {
            records.push(record);
        }
        records
    }

    /// Pending triggers in processing order.
    pub fn pending(&self) -> Vec<EvolutionTrigger> {
        self.state.lock().pending.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut pending_by_kind = BTreeMap::new();
        for trigger in state.pending.values() {
            *pending_by_kind.entry(trigger.kind).or_insert(0) += 1;
        }
        QueueStats {
            pending: state.pending.len(),
            capacity: self.capacity,
            processing: state.in_progress > 0,
            completed: state.completed,
            rejected: state.rejected,
            dropped: state.dropped,
            enqueue_attempts: state.attempts.values().sum(),
            duplicates_rejected: state.duplicates.values().sum(),
            pending_by_kind,
        }
    }

    /// Share of enqueue attempts refused as duplicates of a pending trigger.
    ///
    /// `ManualRequest` triggers are left out: they are raised by the harmony
    /// controller itself, which reads this rate. Zero before any attempt.
    pub fn duplicate_reject_rate(&self) -> f64 {
        let state = self.state.lock();
        let counted = |counts: &BTreeMap<TriggerKind, u64>| -> u64 {
            counts
                .iter()
                .filter(|(kind, _)| **kind != TriggerKind::ManualRequest)
                .map(|(_, n)| n)
                .sum()
        };
        let attempts = counted(&state.attempts);
        if attempts == 0 {
            0.0
        } else {
            counted(&state.duplicates) as f64 / attempts as f64
        }
    }
}
