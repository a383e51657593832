use crate::evolution::EvolutionQueue;
use crate::journal::{JournalEntry, JournalSink};
use crate::types::{EvolutionTrigger, HarmonySnapshot, HarmonyStatus, Subsystem};
use chrono::Utc;
use harmonia_core::{HarmonyConfig, HarmoniaError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Raw measurements the harmony score is computed from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HarmonyInputs {
    /// Share of trigger enqueue attempts refused as duplicates.
    pub duplicate_rate: f64,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    /// Share of non-stopped agents that are Active.
    pub fraction_active: f64,
}

/// Snapshot plus the rebalancing trigger it raised, if any.
#[derive(Debug, Clone)]
pub struct HarmonyEvaluation {
    pub snapshot: HarmonySnapshot,
    pub trigger: Option<Uuid>,
}

/// Meta-orchestrator: scores the three subsystems and asks for rebalancing
/// when the system drifts out of balance.
///
/// The only producer of `ManualRequest` triggers.
pub struct HarmonyController {
    config: HarmonyConfig,
    history: Mutex<VecDeque<HarmonySnapshot>>,
    journal: Arc<dyn JournalSink>,
}

impl HarmonyController {
    pub fn new(config: HarmonyConfig, journal: Arc<dyn JournalSink>) -> Self {
        Self {
            config,
            history: Mutex::new(VecDeque::new()),
            journal,
        }
    }

    /// Score the inputs. Pure; nothing is stored.
    pub fn compute(&self, inputs: &HarmonyInputs) -> HarmonySnapshot {
        let pattern_score = (1.0 - inputs.duplicate_rate).clamp(0.0, 1.0);
        let finished = inputs.tasks_completed + inputs.tasks_failed;
        let task_score = if finished == 0 {
            0.5
        } else {
            inputs.tasks_completed as f64 / finished as f64
        };
        let agent_score = inputs.fraction_active.clamp(0.0, 1.0);

        let w = &self.config.weights;
        let (wp, wt, wa) = if w.pattern + w.task + w.agent > 0.0 {
            (w.pattern, w.task, w.agent)
        } else {
            (1.0, 1.0, 1.0)
        };
        let overall =
            (wp * pattern_score + wt * task_score + wa * agent_score) / (wp + wt + wa);

        let status = if overall >= self.config.balanced_threshold {
            HarmonyStatus::Balanced
        } else if overall >= self.config.critical_threshold {
            HarmonyStatus::Unbalanced
        } else {
            HarmonyStatus::Critical
        };

        let mut weakest = (Subsystem::Patterns, pattern_score);
        for candidate in [(Subsystem::Tasks, task_score), (Subsystem::Agents, agent_score)] {
            if candidate.1 < weakest.1 {
                weakest = candidate;
            }
        }

        HarmonySnapshot {
            pattern_score,
            task_score,
            agent_score,
            overall,
            status,
            weakest: weakest.0,
            timestamp: Utc::now(),
        }
    }

    /// Compute, store and journal a snapshot. When the system is not
    /// balanced a `ManualRequest` naming the weakest subsystem is enqueued,
    /// with priority growing as that score falls.
    pub fn evaluate(&self, inputs: &HarmonyInputs, queue: &EvolutionQueue) -> HarmonyEvaluation {
        let snapshot = self.compute(inputs);
        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_limit.max(1) {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }
        self.journal.write(JournalEntry::Harmony(snapshot.clone()));

        let mut trigger = None;
        match snapshot.status {
            HarmonyStatus::Balanced => {
                debug!(overall = snapshot.overall, "Harmony balanced");
            }
            status => {
                let score = snapshot.score_of(snapshot.weakest);
                let priority = Self::rebalance_priority(score);
                warn!(
                    status = %status,
                    overall = snapshot.overall,
                    weakest = %snapshot.weakest,
                    score,
                    "Harmony out of balance"
                );
                let request =
                    EvolutionTrigger::manual_request(snapshot.weakest, score, snapshot.overall, priority);
                match queue.enqueue(request) {
                    Ok(receipt) => {
                        info!(trigger = %receipt.id, priority, "Rebalance requested");
                        trigger = Some(receipt.id);
                    }
                    Err(e @ HarmoniaError::DuplicateTrigger { .. }) => {
                        debug!(error = %e, "Rebalance already pending");
                    }
                    Err(e) => warn!(error = %e, "Rebalance request failed"),
                }
            }
        }

        HarmonyEvaluation { snapshot, trigger }
    }

    /// Priority of a rebalance request for a sub-score in `[0, 1]`.
    pub fn rebalance_priority(score: f64) -> i64 {
        ((1.0 - score.clamp(0.0, 1.0)) * 100.0).round() as i64
    }

    pub fn latest(&self) -> Option<HarmonySnapshot> {
        self.history.lock().back().cloned()
    }

    /// Retained snapshots, oldest first.
    pub fn history(&self) -> Vec<HarmonySnapshot> {
        self.history.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::types::{TriggerKind, TriggerPayload};
    use harmonia_core::{EvolutionConfig, HarmonyWeights};

    fn controller() -> (HarmonyController, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new(64));
        (HarmonyController::new(HarmonyConfig::default(), journal.clone()), journal)
    }

    #[test]
    fn test_task_score_defaults_to_half() {
        let (h, _) = controller();
        let snap = h.compute(&HarmonyInputs {
            duplicate_rate: 0.0,
            tasks_completed: 0,
            tasks_failed: 0,
            fraction_active: 1.0,
        });
        assert_eq!(snap.task_score, 0.5);
        assert_eq!(snap.weakest, Subsystem::Tasks);
    }

    #[test]
    fn test_status_bands() {
        let (h, _) = controller();
        let balanced = h.compute(&HarmonyInputs {
            duplicate_rate: 0.0,
            tasks_completed: 1,
            tasks_failed: 0,
            fraction_active: 1.0,
        });
        assert_eq!(balanced.status, HarmonyStatus::Balanced);
        assert!((balanced.overall - 1.0).abs() < 1e-9);

        let unbalanced = h.compute(&HarmonyInputs {
            duplicate_rate: 0.4,
            tasks_completed: 1,
            tasks_failed: 1,
            fraction_active: 1.0,
        });
        // (0.6 + 0.5 + 1.0) / 3 = 0.7
        assert_eq!(unbalanced.status, HarmonyStatus::Unbalanced);

        let critical = h.compute(&HarmonyInputs {
            duplicate_rate: 0.9,
            tasks_completed: 0,
            tasks_failed: 3,
            fraction_active: 0.0,
        });
        assert_eq!(critical.status, HarmonyStatus::Critical);
    }

    #[test]
    fn test_custom_weights() {
        let config = HarmonyConfig {
            weights: HarmonyWeights {
                pattern: 0.0,
                task: 1.0,
                agent: 0.0,
            },
            ..HarmonyConfig::default()
        };
        let h = HarmonyController::new(config, Arc::new(MemoryJournal::new(4)));
        let snap = h.compute(&HarmonyInputs {
            duplicate_rate: 1.0,
            tasks_completed: 9,
            tasks_failed: 1,
            fraction_active: 0.0,
        });
        assert!((snap.overall - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_unbalanced_enqueues_manual_request_once() {
        let (h, journal) = controller();
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        let inputs = HarmonyInputs {
            duplicate_rate: 0.0,
            tasks_completed: 1,
            tasks_failed: 1,
            fraction_active: 0.25,
        };

        let eval = h.evaluate(&inputs, &queue);
        assert_eq!(eval.snapshot.weakest, Subsystem::Agents);
        assert!(eval.trigger.is_some());

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TriggerKind::ManualRequest);
        assert_eq!(pending[0].priority, 75);
        assert!(matches!(
            pending[0].payload,
            TriggerPayload::Subsystem { subsystem: Subsystem::Agents, .. }
        ));

        // Same weakness while the first request is pending is absorbed.
        let eval = h.evaluate(&inputs, &queue);
        assert!(eval.trigger.is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(h.history().len(), 2);
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_balanced_enqueues_nothing() {
        let (h, _) = controller();
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        let eval = h.evaluate(
            &HarmonyInputs {
                duplicate_rate: 0.0,
                tasks_completed: 5,
                tasks_failed: 0,
                fraction_active: 1.0,
            },
            &queue,
        );
        assert!(eval.trigger.is_none());
        assert!(queue.is_empty());
        assert_eq!(h.latest().unwrap().status, HarmonyStatus::Balanced);
    }

    #[test]
    fn test_history_bounded() {
        let config = HarmonyConfig {
            history_limit: 3,
            ..HarmonyConfig::default()
        };
        let h = HarmonyController::new(config, Arc::new(MemoryJournal::new(16)));
        let queue = EvolutionQueue::new(&EvolutionConfig::default());
        for _ in 0..5 {
            h.evaluate(&HarmonyInputs::default(), &queue);
        }
        assert_eq!(h.history().len(), 3);
    }

    #[test]
    fn test_rebalance_priority() {
        assert_eq!(HarmonyController::rebalance_priority(0.0), 100);
        assert_eq!(HarmonyController::rebalance_priority(1.0), 0);
        assert_eq!(HarmonyController::rebalance_priority(0.456), 54);
    }
}
