#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The Backend Client capability boundary the core consumes (§4.5): one
//! instance per registered backend. Backend discovery, authentication, and
//! protocol upgrades are deliberately outside this crate — they live in
//! whatever adapter implements [`BackendClient`] for a concrete server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use wdp_core::{Attachment, Workflow};
use wdp_error::{BackendErrorSignal, DispatchError};

/// A single item in a backend's ordered event stream (§4.5 `events()`).
/// At-most-once per logical event; the capability, not the core, owns
/// reconnection and re-delivery semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendEvent {
    /// The backend accepted the prompt and queued it.
    Pending {
        /// The backend-assigned submission id.
        prompt_id: String,
    },
    /// The backend began executing the prompt.
    ExecutionStart {
        /// The backend-assigned submission id.
        prompt_id: String,
    },
    /// The backend is executing a specific node (or an unspecified one).
    Executing {
        /// The backend-assigned submission id.
        prompt_id: String,
        /// The node currently executing, if the backend reports one.
        node_id: Option<String>,
    },
    /// A node finished executing and produced an output descriptor.
    NodeExecuted {
        /// The backend-assigned submission id.
        prompt_id: String,
        /// The node that finished.
        node_id: String,
        /// Backend-reported output descriptor (opaque to the core).
        output: Value,
    },
    /// Incremental progress within a node (e.g. sampler steps).
    Progress {
        /// The backend-assigned submission id.
        prompt_id: String,
        /// The node this progress pertains to, if known.
        node_id: Option<String>,
        /// Current progress value.
        value: u64,
        /// Progress denominator.
        max: u64,
    },
    /// A preview image frame.
    PreviewBlob {
        /// The backend-assigned submission id.
        prompt_id: String,
        /// Raw preview bytes.
        bytes: Vec<u8>,
        /// Optional backend-supplied metadata about the preview.
        meta: Option<Value>,
    },
    /// The prompt finished successfully.
    ExecutionSuccess {
        /// The backend-assigned submission id.
        prompt_id: String,
    },
    /// The prompt failed. `error` is handed directly to the failure
    /// classifier (§4.2); nothing downstream of this event inspects raw
    /// backend error shapes.
    ExecutionError {
        /// The backend-assigned submission id.
        prompt_id: String,
        /// The raw error signal to classify.
        error: BackendErrorSignal,
    },
    /// The backend reports its remaining queue depth.
    StatusUpdate {
        /// Number of prompts still queued on the backend.
        queue_remaining: u64,
    },
    /// Transport was lost. The capability is responsible for reconnecting;
    /// in-flight jobs are not considered lost until the dispatcher's
    /// execution-start timeout elapses.
    Disconnected,
    /// Transport was re-established after a [`BackendEvent::Disconnected`].
    /// Always followed by a fresh [`BackendEvent::StatusUpdate`].
    Reconnected,
}

/// Backend-reported queue depth, used once at startup and again on
/// reconnect to resync the registry's approximate counters (§4.5
/// `queueSnapshot`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Prompts currently executing on the backend.
    pub running: u64,
    /// Prompts queued but not yet executing.
    pub pending: u64,
}

/// The capability the dispatcher injects per backend. Implementations
/// adapt a concrete backend's wire protocol to this interface; the core
/// never speaks HTTP or WebSocket directly.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Establish transport. Fails with a transport or timeout
    /// [`DispatchError`] if the backend cannot be reached within `timeout`.
    async fn connect(&self, timeout: Duration) -> Result<(), DispatchError>;

    /// Queue a workflow on the backend. Fails fast with a classifiable
    /// error (§4.2) rather than blocking until completion; completion is
    /// observed through [`BackendClient::events`].
    async fn submit(
        &self,
        workflow: &Workflow,
        attachments: &[Attachment],
        include_outputs: &[String],
        metadata: &BTreeMap<String, Value>,
    ) -> Result<String, DispatchError>;

    /// Best-effort cancellation. May no-op if the backend already
    /// completed the prompt.
    async fn interrupt(&self, prompt_id: &str) -> Result<(), DispatchError>;

    /// Subscribe to this backend's event stream. Multiple subscribers may
    /// call this; each receives every event from the point of
    /// subscription onward.
    fn events(&self) -> broadcast::Receiver<BackendEvent>;

    /// Synchronously fetch a produced artifact over the backend's HTTP
    /// surface.
    async fn fetch_artifact(
        &self,
        filename: &str,
        subfolder: Option<&str>,
        kind: Option<&str>,
    ) -> Result<Vec<u8>, DispatchError>;

    /// Resync approximate `running`/`pending` counters.
    async fn queue_snapshot(&self) -> Result<QueueSnapshot, DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_event_serializes_with_kind_tag() {
        let ev = BackendEvent::Pending {
            prompt_id: "p1".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "pending");
        assert_eq!(json["prompt_id"], "p1");
    }

    #[test]
    fn queue_snapshot_defaults_to_zero() {
        let snap = QueueSnapshot::default();
        assert_eq!(snap.running, 0);
        assert_eq!(snap.pending, 0);
    }
}
