// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical fingerprinting for [`wdp_core::Workflow`] values (§3 Job
//! record: `fingerprint`, GLOSSARY: Fingerprint).
//!
//! The fingerprint is a content hash of the workflow graph used as the
//! failover bookkeeping key: two submissions with the same fingerprint
//! share the same per-backend failure history regardless of job id.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use sha2::{Digest, Sha256};

use wdp_core::Workflow;

/// Produce a deterministic JSON string for a workflow: object keys sorted
/// at every depth, arrays preserved in their original order.
///
/// This relies on [`serde_json::Map`] being backed by a `BTreeMap` (the
/// default, without the `preserve_order` feature), which already sorts
/// keys recursively; there is no separate canonicalization pass to write.
#[must_use]
pub fn canonical_json(workflow: &Workflow) -> String {
    serde_json::to_string(workflow).expect("Workflow always serializes")
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Compute the fingerprint of a workflow: the SHA-256 hex digest of its
/// canonical JSON encoding.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use wdp_core::Workflow;
///
/// let a = Workflow::from_value(json!({"A": {"class_type": "X", "inputs": {"b": 1, "a": 2}}})).unwrap();
/// let b = Workflow::from_value(json!({"A": {"class_type": "X", "inputs": {"a": 2, "b": 1}}})).unwrap();
/// assert_eq!(wdp_fingerprint::fingerprint(&a), wdp_fingerprint::fingerprint(&b));
/// ```
#[must_use]
pub fn fingerprint(workflow: &Workflow) -> String {
    sha256_hex(canonical_json(workflow).as_bytes())
}

/// Fingerprint any serializable value directly, bypassing the
/// [`Workflow`] newtype. Used by callers that already hold a raw
/// `serde_json::Value` and want to avoid the `Option`-returning
/// [`Workflow::from_value`] round trip (e.g. config fixtures, tests).
pub fn fingerprint_value<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_string(&serde_json::to_value(value)?)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow(v: serde_json::Value) -> Workflow {
        Workflow::from_value(v).expect("object")
    }

    #[test]
    fn fingerprint_is_stable_under_key_reordering() {
        let a = workflow(json!({
            "A": {"class_type": "X", "inputs": {"z": 1, "a": 2}},
            "B": {"class_type": "Y", "inputs": {}}
        }));
        let b = workflow(json!({
            "B": {"class_type": "Y", "inputs": {}},
            "A": {"class_type": "X", "inputs": {"a": 2, "z": 1}}
        }));
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_when_array_order_changes() {
        let a = workflow(json!({
            "A": {"class_type": "X", "inputs": {"list": [1, 2, 3]}}
        }));
        let b = workflow(json!({
            "A": {"class_type": "X", "inputs": {"list": [3, 2, 1]}}
        }));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_when_a_value_changes() {
        let a = workflow(json!({"A": {"class_type": "X", "inputs": {"seed": 1}}}));
        let b = workflow(json!({"A": {"class_type": "X", "inputs": {"seed": 2}}}));
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_is_a_64_char_hex_string() {
        let wf = workflow(json!({"A": {"class_type": "X", "inputs": {}}}));
        let fp = fingerprint(&wf);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_value_matches_workflow_fingerprint() {
        let raw = json!({"A": {"class_type": "X", "inputs": {"a": 1}}});
        let wf = workflow(raw.clone());
        assert_eq!(fingerprint(&wf), fingerprint_value(&raw).unwrap());
    }
}
