// SPDX-License-Identifier: MIT OR Apache-2.0
//! The typed [`Event`] envelope published on the dispatcher's event bus
//! (§6 Event bus).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobId};
use crate::workflow::BackendId;

/// A timestamped event published by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// When the event was emitted.
    pub ts: DateTime<Utc>,
    /// The event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// Wrap a kind with the current timestamp.
    #[must_use]
    pub fn now(kind: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            kind,
        }
    }

    /// The stable event name used for name-based subscription, e.g.
    /// `"job:started"`.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Discriminated payload for [`Event`]. Names and payload shapes follow
/// the Enqueue API's event table (§6) exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A job was placed in the queue.
    JobQueued {
        /// Snapshot of the job at enqueue time.
        job: Job,
    },
    /// A job was submitted to a backend and accepted.
    JobStarted {
        /// Snapshot of the job.
        job: Job,
        /// The backend the job was dispatched to.
        backend_id: BackendId,
    },
    /// Incremental progress reported by the backend for one node.
    JobProgress {
        /// Job the progress belongs to.
        job_id: JobId,
        /// Node currently executing, if known.
        node_id: Option<String>,
        /// Current progress value.
        value: u64,
        /// Progress denominator.
        max: u64,
    },
    /// A preview image frame was received.
    JobPreview {
        /// Job the preview belongs to.
        job_id: JobId,
        /// Raw preview bytes.
        #[serde(with = "crate::job::base64_bytes")]
        bytes: Vec<u8>,
        /// Optional backend-supplied metadata about the preview.
        meta: Option<Value>,
    },
    /// One node finished executing and produced an output.
    JobNodeExecuted {
        /// Job the node belongs to.
        job_id: JobId,
        /// The node that finished.
        node_id: String,
        /// Backend-reported output descriptor.
        output: Value,
    },
    /// A job finished successfully.
    JobCompleted {
        /// The completed job, including `result`.
        job: Job,
    },
    /// A job failed, either terminally or ahead of a retry.
    JobFailed {
        /// The job (status reflects `failed` only when `will_retry` is false).
        job: Job,
        /// Whether the dispatcher will re-enqueue this job.
        will_retry: bool,
        /// The classification that produced this failure.
        classification: Value,
    },
    /// A job is being re-enqueued after a retryable failure.
    JobRetrying {
        /// The job about to be retried.
        job: Job,
        /// Delay, in milliseconds, before the job becomes available again.
        delay_ms: u64,
    },
    /// A job was cancelled.
    JobCancelled {
        /// The cancelled job.
        job: Job,
    },
    /// A backend's lifecycle state changed.
    BackendState {
        /// The backend whose state changed.
        backend_id: BackendId,
        /// The new state, serialized as its snake_case name.
        state: String,
    },
    /// A backend was blocked from handling a given fingerprint.
    BackendBlockedFingerprint {
        /// The blocked backend.
        backend_id: BackendId,
        /// The fingerprint it was blocked for.
        fingerprint: String,
        /// Epoch-millisecond timestamp the block expires at, if not permanent.
        until_ms: Option<i64>,
    },
    /// A previously-blocked backend/fingerprint pair was cleared.
    BackendUnblockedFingerprint {
        /// The unblocked backend.
        backend_id: BackendId,
        /// The fingerprint it is unblocked for.
        fingerprint: String,
    },
    /// At least one backend has become ready for the first time.
    PoolReady {
        /// Backends currently in the `ready` state.
        backend_ids: Vec<BackendId>,
    },
}

impl EventKind {
    /// The stable event name, matching §6's event table.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job:queued",
            Self::JobStarted { .. } => "job:started",
            Self::JobProgress { .. } => "job:progress",
            Self::JobPreview { .. } => "job:preview",
            Self::JobNodeExecuted { .. } => "job:node_executed",
            Self::JobCompleted { .. } => "job:completed",
            Self::JobFailed { .. } => "job:failed",
            Self::JobRetrying { .. } => "job:retrying",
            Self::JobCancelled { .. } => "job:cancelled",
            Self::BackendState { .. } => "backend:state",
            Self::BackendBlockedFingerprint { .. } => "backend:blocked_fingerprint",
            Self::BackendUnblockedFingerprint { .. } => "backend:unblocked_fingerprint",
            Self::PoolReady { .. } => "pool:ready",
        }
    }

    /// The job id this event pertains to, if any. Used by subscribers that
    /// want to follow one job's full lifecycle (§5 ordering guarantees).
    #[must_use]
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobQueued { job }
            | Self::JobStarted { job, .. }
            | Self::JobCompleted { job }
            | Self::JobFailed { job, .. }
            | Self::JobRetrying { job, .. }
            | Self::JobCancelled { job } => Some(job.id),
            Self::JobProgress { job_id, .. }
            | Self::JobPreview { job_id, .. }
            | Self::JobNodeExecuted { job_id, .. } => Some(*job_id),
            Self::BackendState { .. }
            | Self::BackendBlockedFingerprint { .. }
            | Self::BackendUnblockedFingerprint { .. }
            | Self::PoolReady { .. } => None,
        }
    }
}
