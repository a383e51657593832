use crate::signature::Signature;

/// Compares two observation signatures, returning a value in `[0, 1]`.
pub trait Similarity: Send + Sync {
    fn similarity(&self, a: &Signature, b: &Signature) -> f64;
}

/// Jaccard index over signature tokens: `|A ∩ B| / |A ∪ B|`.
///
/// Two empty signatures are identical (1.0).
#[derive(Debug, Clone, Copy, Default)]
pub struct JaccardSimilarity;

impl Similarity for JaccardSimilarity {
    fn similarity(&self, a: &Signature, b: &Signature) -> f64 {
        if a.tokens.is_empty() && b.tokens.is_empty() {
            return 1.0;
        }
        let intersection = a.tokens.intersection(&b.tokens).count();
        let union = a.tokens.len() + b.tokens.len() - intersection;
        intersection as f64 / union as f64
    }
}

impl<F> Similarity for F
where
    F: Fn(&Signature, &Signature) -> f64 + Send + Sync,
{
    fn similarity(&self, a: &Signature, b: &Signature) -> f64 {
        self(a, b).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_is_one() {
        let a = Signature::of(&json!({"a": 1}), &json!({"b": 2}));
        assert!((JaccardSimilarity.similarity(&a, &a) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_disjoint_is_zero() {
        let a = Signature::of(&json!({"a": 1}), &json!({}));
        let b = Signature::of(&json!({"z": 9}), &json!({"y": 8}));
        assert_eq!(JaccardSimilarity.similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_partial_overlap() {
        let a = Signature::of(&json!({"a": 1, "b": 2, "c": 3, "d": 4}), &json!({}));
        let b = Signature::of(&json!({"a": 1, "b": 2, "c": 3, "d": 4}), &json!({"e": 5}));
        let s = JaccardSimilarity.similarity(&a, &b);
        // 4 shared ctx tokens, out={} and out.e differ
        assert!((s - 4.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_closure_is_clamped() {
        let sim = |_: &Signature, _: &Signature| 3.0;
        let a = Signature::of(&json!({}), &json!({}));
        assert_eq!(sim.similarity(&a, &a), 1.0);
    }
}
