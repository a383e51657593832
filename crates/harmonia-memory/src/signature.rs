use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Canonical projection of one (context, outcome) observation.
///
/// Both JSON documents are flattened into `path=value` tokens, prefixed with
/// `ctx` and `out` respectively. Object key order and whitespace therefore never
/// affect the signature. The fingerprint is the hex SHA-256 of the sorted tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub tokens: BTreeSet<String>,
    pub fingerprint: String,
}

impl Signature {
    /// Compute the signature of an observation.
    pub fn of(context: &Value, outcome: &Value) -> Self {
        let mut tokens = BTreeSet::new();
        flatten("ctx", context, &mut tokens);
        flatten("out", outcome, &mut tokens);
        Self::from_tokens(tokens)
    }

    /// Build a signature from an already canonical token set.
    pub fn from_tokens(tokens: BTreeSet<String>) -> Self {
        let mut hasher = Sha256::new();
        for token in &tokens {
            hasher.update(token.as_bytes());
            hasher.update(b"\n");
        }
        let fingerprint = hex::encode(hasher.finalize());
        Self {
            tokens,
            fingerprint,
        }
    }

    /// First 12 hex characters of the fingerprint, for log lines.
    pub fn short(&self) -> &str {
        &self.fingerprint[..12.min(self.fingerprint.len())]
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) if map.is_empty() => {
            out.insert(format!("{prefix}={{}}"));
        }
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{prefix}.{key}"), child, out);
            }
        }
        Value::Array(items) if items.is_empty() => {
            out.insert(format!("{prefix}=[]"));
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                flatten(&format!("{prefix}[{idx}]"), child, out);
            }
        }
        Value::String(s) => {
            out.insert(format!("{prefix}={s}"));
        }
        other => {
            out.insert(format!("{prefix}={other}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = Signature::of(&json!({"a": 1, "b": "x"}), &json!({"ok": true}));
        let b = Signature::of(&json!({"b": "x", "a": 1}), &json!({"ok": true}));
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 64);
    }

    #[test]
    fn test_tokens_are_prefixed() {
        let sig = Signature::of(
            &json!({"capability": "build", "tags": ["ci"]}),
            &json!({"status": "failed"}),
        );
        assert!(sig.tokens.contains("ctx.capability=build"));
        assert!(sig.tokens.contains("ctx.tags[0]=ci"));
        assert!(sig.tokens.contains("out.status=failed"));
    }

    #[test]
    fn test_context_and_outcome_are_distinguished() {
        let a = Signature::of(&json!({"x": 1}), &json!({}));
        let b = Signature::of(&json!({}), &json!({"x": 1}));
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_empty_containers_and_null() {
        let sig = Signature::of(&json!({"list": [], "obj": {}, "n": null}), &Value::Null);
        assert!(sig.tokens.contains("ctx.list=[]"));
        assert!(sig.tokens.contains("ctx.obj={}"));
        assert!(sig.tokens.contains("ctx.n=null"));
        assert!(sig.tokens.contains("out=null"));
    }

    #[test]
    fn test_short_fingerprint() {
        let sig = Signature::of(&json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(sig.short().len(), 12);
        assert!(sig.fingerprint.starts_with(sig.short()));
    }
}
