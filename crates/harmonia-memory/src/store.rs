use crate::signature::Signature;
use crate::similarity::{JaccardSimilarity, Similarity};
use chrono::{DateTime, Utc};
use harmonia_core::PatternConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A deduplicated, recurring observation.
///
/// Records are identified by `id`, assigned by the store in insertion order.
/// Two records may share a signature when the similarity function refuses
/// to merge them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: u64,
    pub signature: Signature,
    /// The first context observed for this pattern.
    pub context: Value,
    /// The first outcome observed for this pattern.
    pub outcome: Value,
    pub occurrences: u64,
    pub confidence: f64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Set once the occurrence threshold was crossed and reported.
    pub trigger_emitted: bool,
}

impl PatternRecord {
    pub fn fingerprint(&self) -> &str {
        &self.signature.fingerprint
    }
}

/// Result of [`PatternStore::record`].
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    /// State of the record after this observation.
    pub record: PatternRecord,
    /// Similarity to the matched record (1.0 for a fresh insert).
    pub similarity: f64,
    /// Whether the observation was folded into an existing record.
    pub merged: bool,
    /// True exactly once per record: on the observation that reached the
    /// occurrence threshold.
    pub threshold_crossed: bool,
}

/// A record together with its similarity to a queried observation.
#[derive(Debug, Clone)]
pub struct SimilarMatch {
    pub record: PatternRecord,
    pub similarity: f64,
}

/// Aggregate view of the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStatistics {
    pub count: usize,
    pub mean_confidence: f64,
    pub confidence_threshold: f64,
    pub above_threshold: usize,
    /// Every call to `record`.
    pub observations: u64,
    /// Observations folded into an existing record.
    pub merged: u64,
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<u64, PatternRecord>,
    next_id: u64,
    observations: u64,
    merged: u64,
}

/// Similarity-deduplicating store of pattern records.
///
/// Reads take a shared lock; `record` takes the exclusive lock for the whole
/// search-and-update so two concurrent observations of the same pattern can
/// never both insert.
pub struct PatternStore {
    config: PatternConfig,
    similarity: Box<dyn Similarity>,
    state: RwLock<StoreState>,
}

impl PatternStore {
    /// Create a store using Jaccard similarity.
    pub fn new(config: PatternConfig) -> Self {
        Self::with_similarity(config, JaccardSimilarity)
    }

    /// Create a store with a caller-supplied similarity function.
    pub fn with_similarity(config: PatternConfig, similarity: impl Similarity + 'static) -> Self {
        Self::with_boxed_similarity(config, Box::new(similarity))
    }

    pub fn with_boxed_similarity(config: PatternConfig, similarity: Box<dyn Similarity>) -> Self {
        Self {
            config,
            similarity,
            state: RwLock::new(StoreState::default()),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Record one observation.
    ///
    /// The most similar stored record at or above the similarity threshold
    /// absorbs the observation; otherwise a new record is inserted.
    pub fn record(&self, context: &Value, outcome: &Value) -> RecordOutcome {
        let signature = Signature::of(context, outcome);
        let now = Utc::now();
        let mut state = self.state.write();
        state.observations += 1;

        let best = best_match(&state.records, &signature, self.similarity.as_ref());

        if let Some((id, similarity)) = best {
            if similarity >= self.config.similarity_threshold {
                state.merged += 1;
                let threshold = self.config.occurrence_threshold;
                let (base, step) = (self.config.base_confidence, self.config.confidence_step);
                if let Some(record) = state.records.get_mut(&id) {
                    record.occurrences += 1;
                    record.confidence = (base + step * record.occurrences as f64).min(1.0);
                    record.last_seen_at = now;
                    let threshold_crossed =
                        record.occurrences >= threshold && !record.trigger_emitted;
                    if threshold_crossed {
                        record.trigger_emitted = true;
                        info!(
                            pattern = %record.signature.short(),
                            occurrences = record.occurrences,
                            "Pattern crossed occurrence threshold"
                        );
                    }
                    debug!(
                        pattern = %record.signature.short(),
                        similarity,
                        occurrences = record.occurrences,
                        "Observation merged into existing pattern"
                    );
                    return RecordOutcome {
                        record: record.clone(),
                        similarity,
                        merged: true,
                        threshold_crossed,
                    };
                }
            }
        }

        let threshold_crossed = self.config.occurrence_threshold <= 1;
        state.next_id += 1;
        let record = PatternRecord {
            id: state.next_id,
            signature,
            context: context.clone(),
            outcome: outcome.clone(),
            occurrences: 1,
            confidence: self.config.base_confidence.min(1.0),
            first_seen_at: now,
            last_seen_at: now,
            trigger_emitted: threshold_crossed,
        };
        debug!(pattern = %record.signature.short(), "New pattern recorded");
        state.records.insert(record.id, record.clone());

        RecordOutcome {
            record,
            similarity: 1.0,
            merged: false,
            threshold_crossed,
        }
    }

    /// Records whose similarity to the observation is at least `min_similarity`,
    /// most similar first.
    pub fn find_by_similarity(
        &self,
        context: &Value,
        outcome: &Value,
        min_similarity: f64,
    ) -> Vec<SimilarMatch> {
        let observed = Signature::of(context, outcome);
        let state = self.state.read();
        let mut matches: Vec<SimilarMatch> = state
            .records
            .values()
            .map(|r| SimilarMatch {
                similarity: self.similarity.similarity(&observed, &r.signature),
                record: r.clone(),
            })
            .filter(|m| m.similarity >= min_similarity)
            .collect();
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        matches
    }

    /// The `n` most confident records (ties: more occurrences, then oldest).
    pub fn top_by_confidence(&self, n: usize) -> Vec<PatternRecord> {
        let state = self.state.read();
        let mut records: Vec<PatternRecord> = state.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.occurrences.cmp(&a.occurrences))
                .then_with(|| a.id.cmp(&b.id))
        });
        records.truncate(n);
        records
    }

    pub fn get(&self, id: u64) -> Option<PatternRecord> {
        self.state.read().records.get(&id).cloned()
    }

    /// Every record carrying this signature fingerprint, oldest first.
    pub fn find_by_fingerprint(&self, fingerprint: &str) -> Vec<PatternRecord> {
        self.state
            .read()
            .records
            .values()
            .filter(|r| r.fingerprint() == fingerprint)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count, mean confidence and established-record count.
    pub fn statistics(&self) -> PatternStatistics {
        let state = self.state.read();
        let count = state.records.len();
        let threshold = self.config.confidence_report_threshold;
        let total: f64 = state.records.values().map(|r| r.confidence).sum();
        PatternStatistics {
            count,
            mean_confidence: if count == 0 { 0.0 } else { total / count as f64 },
            confidence_threshold: threshold,
            above_threshold: state
                .records
                .values()
                .filter(|r| r.confidence > threshold)
                .count(),
            observations: state.observations,
            merged: state.merged,
        }
    }

    /// Share of observations folded into an existing record.
    pub fn merge_rate(&self) -> f64 {
        let state = self.state.read();
        if state.observations == 0 {
            0.0
        } else {
            state.merged as f64 / state.observations as f64
        }
    }
}

/// Highest-similarity record. Ties resolve to the oldest record.
fn best_match(
    records: &BTreeMap<u64, PatternRecord>,
    observed: &Signature,
    similarity: &dyn Similarity,
) -> Option<(u64, f64)> {
    let mut best: Option<(u64, f64)> = None;
    for (id, record) in records {
        let score = similarity.similarity(observed, &record.signature);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((*id, score)),
        }
    }
    best
}
