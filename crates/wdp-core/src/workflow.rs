// SPDX-License-Identifier: MIT OR Apache-2.0
//! The opaque workflow graph and the handful of field names the core is
//! allowed to look at.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CHECKPOINT_INPUT_FIELDS, DEFAULT_CHECKPOINT_KEY};

/// A directed node graph submitted for execution: a mapping from node id
/// to node object. The core never interprets node semantics beyond what
/// [`checkpoint_key`] and the fingerprint algorithm read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workflow(Map<String, Value>);

impl Workflow {
    /// Wrap a raw JSON object as a workflow. Returns `None` if `value` is
    /// not a JSON object.
    #[must_use]
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Borrow the underlying node map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Look up a single node by id.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&Value> {
        self.0.get(node_id)
    }

    /// Iterate over `(node_id, node)` pairs in lexicographic key order
    /// (the backing `Map` is a `BTreeMap`, not insertion-ordered).
    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for Workflow {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Identifier for a registered backend, e.g. `"gpu-1"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub String);

impl BackendId {
    /// Borrow the backend id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BackendId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Derive the checkpoint key used to partition the queue (§4.4).
///
/// Scans every node's `inputs` for any of [`CHECKPOINT_INPUT_FIELDS`], in
/// order, taking the first match found while iterating nodes in
/// lexicographic key order. The matched value is lowercased and has its
/// file extension stripped. Falls back to [`DEFAULT_CHECKPOINT_KEY`] when
/// no node carries a recognized field.
#[must_use]
pub fn checkpoint_key(workflow: &Workflow) -> String {
    for (_, node) in workflow.nodes() {
        let Some(inputs) = node.get("inputs").and_then(Value::as_object) else {
            continue;
        };
        for field in CHECKPOINT_INPUT_FIELDS {
            if let Some(raw) = inputs.get(*field).and_then(Value::as_str) {
                return normalize_checkpoint_name(raw);
            }
        }
    }
    DEFAULT_CHECKPOINT_KEY.to_string()
}

fn normalize_checkpoint_name(raw: &str) -> String {
    let lower = raw.to_lowercase();
    match lower.rfind('.') {
        Some(idx) if idx > 0 => lower[..idx].to_string(),
        _ => lower,
    }
}
