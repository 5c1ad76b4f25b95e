//! Bounded-size digests for run/step outputs and variable-map state (§3
//! "truncated output digest", §7 "bounded-size error summary").
//!
//! Full outputs can be arbitrarily large JSON trees; only a digest of the
//! canonical serialization is kept in the durable `Run` record, not the
//! value itself.

use cadence_kernel::Value;
use sha2::{Digest, Sha256};

const SUMMARY_MAX_LEN: usize = 2048;

/// SHA-256 of the canonical (serde_json, key-order-preserving) serialization
/// of `value`, hex-encoded.
pub fn digest_value(value: &Value) -> String {
    let canonical = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

/// Truncates an error message to a bounded size so a single pathological
/// error can't blow up the stored run record.
pub fn bounded_summary(message: &str) -> String {
    if message.len() <= SUMMARY_MAX_LEN {
        message.to_string()
    } else {
        let mut truncated = message[..SUMMARY_MAX_LEN].to_string();
        truncated.push_str("... (truncated)");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_deterministic() {
        let a = digest_value(&json!({"x": 1, "y": [1, 2, 3]}));
        let b = digest_value(&json!({"x": 1, "y": [1, 2, 3]}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_values_digest_differently() {
        assert_ne!(digest_value(&json!(1)), digest_value(&json!(2)));
    }

    #[test]
    fn long_summary_is_truncated() {
        let long = "e".repeat(SUMMARY_MAX_LEN + 100);
        let summary = bounded_summary(&long);
        assert!(summary.len() < long.len());
        assert!(summary.ends_with("(truncated)"));
    }
}
