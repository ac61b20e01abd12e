// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-submission [`Job`] record and its lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{BackendId, Workflow};

/// Unique identifier for a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new random job id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single file attached to a workflow submission, targeting one node's
/// input (§3 Job record: `attachments`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Node the uploaded bytes are destined for.
    pub node_id: String,
    /// The input name on that node the upload fills in.
    pub input_name: String,
    /// Raw file bytes.
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Original filename, passed through to the backend.
    pub filename: String,
}

pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Caller-supplied options for [`crate::Job`] creation (the Enqueue API,
/// §6). Every field has a default applied by the dispatcher when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Scheduling priority; higher dequeues first. Default `0`.
    pub priority: Option<i64>,
    /// Maximum submission attempts before the job is failed. Default `3`.
    pub max_attempts: Option<u32>,
    /// Delay applied between a retryable failure and the next attempt.
    /// Default `1000`.
    pub retry_delay_ms: Option<u64>,
    /// Restrict dispatch to one of these backends, if non-empty.
    pub preferred_backend_ids: Option<BTreeSet<BackendId>>,
    /// Never dispatch to any of these backends.
    pub exclude_backend_ids: Option<BTreeSet<BackendId>>,
    /// Arbitrary caller metadata, opaque to the core.
    pub metadata: Option<BTreeMap<String, Value>>,
    /// Node ids whose outputs must be collected into `job.result`.
    pub include_outputs: Option<Vec<String>>,
    /// Files to upload alongside the workflow.
    pub attachments: Option<Vec<Attachment>>,
}

/// Terminal and non-terminal states a [`Job`] passes through. See the
/// dispatcher's state machine (§4.7); no state is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the queue (or re-queued for retry).
    Queued,
    /// Submitted to a backend and not yet resolved.
    Running,
    /// Finished successfully; `result` is populated.
    Completed,
    /// Exhausted retries, or failed for a non-retryable reason.
    Failed,
    /// Cancelled by caller request.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal (no further transitions occur).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// The per-submission state record (§3). Created by `enqueue`, mutated
/// only by the dispatcher's single thread of control.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique id assigned at enqueue time.
    pub id: JobId,
    /// The opaque workflow graph.
    pub workflow: Workflow,
    /// Structural hash of `workflow`, used as the routing key.
    pub fingerprint: String,
    /// Scheduling priority.
    pub priority: i64,
    /// Maximum submission attempts before giving up.
    pub max_attempts: u32,
    /// Delay between a retryable failure and the next attempt.
    pub retry_delay_ms: u64,
    /// Restrict dispatch to one of these backends, if non-empty.
    pub preferred_backend_ids: BTreeSet<BackendId>,
    /// Never dispatch to any of these backends.
    pub exclude_backend_ids: BTreeSet<BackendId>,
    /// Arbitrary caller metadata.
    pub metadata: BTreeMap<String, Value>,
    /// Files to upload alongside the workflow.
    pub attachments: Vec<Attachment>,
    /// Node ids whose outputs must be collected.
    pub include_outputs: Vec<String>,
    /// Number of submission attempts made so far.
    pub attempts: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// When the current (or most recent) run started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Backend currently (or most recently) running this job.
    pub backend_id: Option<BackendId>,
    /// Id the backend assigned to this submission.
    pub prompt_id: Option<String>,
    /// The last classified error observed, if any.
    pub last_error: Option<Value>,
    /// Collected output descriptors for `include_outputs`, once completed.
    pub result: Option<BTreeMap<String, Value>>,
}

impl Job {
    /// Construct a freshly-enqueued job. `attempts` starts at `0` and
    /// `status` starts at [`JobStatus::Queued`].
    #[must_use]
    pub fn new(workflow: Workflow, fingerprint: String, options: EnqueueOptions) -> Self {
        Self {
            id: JobId::new(),
            workflow,
            fingerprint,
            priority: options.priority.unwrap_or(0),
            max_attempts: options.max_attempts.unwrap_or(3),
            retry_delay_ms: options.retry_delay_ms.unwrap_or(1000),
            preferred_backend_ids: options.preferred_backend_ids.unwrap_or_default(),
            exclude_backend_ids: options.exclude_backend_ids.unwrap_or_default(),
            metadata: options.metadata.unwrap_or_default(),
            attachments: options.attachments.unwrap_or_default(),
            include_outputs: options.include_outputs.unwrap_or_default(),
            attempts: 0,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            status: JobStatus::Queued,
            backend_id: None,
            prompt_id: None,
            last_error: None,
            result: None,
        }
    }
}
