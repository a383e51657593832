//! Pattern memory for recurring (context, outcome) observations.
//!
//! Observations are projected onto a canonical token set, deduplicated by a
//! pluggable similarity function and tracked with an occurrence count and a
//! confidence score. Crossing the configured occurrence threshold is reported
//! exactly once per record so callers can raise an evolution trigger.
//!
//! # Main types
//!
//! - [`PatternStore`]: Reader/writer-locked store of [`PatternRecord`]s.
//! - [`Signature`]: Canonical token projection plus SHA-256 fingerprint.
//! - [`Similarity`]: Trait for comparing two signatures.
//! - [`JaccardSimilarity`]: Default similarity over signature tokens.

/// Signature similarity functions.
pub mod similarity;
/// Canonical signatures of observations.
pub mod signature;
/// The pattern store.
pub mod store;

pub use signature::Signature;
pub use similarity::{JaccardSimilarity, Similarity};
pub use store::{PatternRecord, PatternStatistics, PatternStore, RecordOutcome, SimilarMatch};
