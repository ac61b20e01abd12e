#![deny(unsafe_code)]
#![warn(missing_docs)]
//! A scriptable [`BackendClient`] used to exercise the dispatcher's state
//! machine (§8, scenarios S1-S6) without a real image-generation server.
//!
//! Tests script `connect`/`submit` outcomes up front, then drive the rest
//! of a job's lifecycle by pushing [`BackendEvent`]s directly onto the
//! mock's broadcast channel, giving full control over timing — including
//! the execution-start stall scenario (S4), which requires withholding
//! `executionStart` entirely.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use wdp_backend_core::{BackendClient, BackendEvent, QueueSnapshot};
use wdp_core::{Attachment, Workflow};
use wdp_error::{DispatchError, ErrorCode};

/// A scripted response to one `submit` call.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The mock accepts the submission and assigns `prompt_id`.
    Accept {
        /// The id the mock hands back as if it were backend-assigned.
        prompt_id: String,
    },
    /// The mock rejects the submission with `error`.
    Reject(DispatchError),
}

struct Inner {
    connect_failures: VecDeque<DispatchError>,
    submit_outcomes: VecDeque<SubmitOutcome>,
    interrupted: Vec<String>,
    artifacts: HashMap<String, Vec<u8>>,
    queue_snapshot: QueueSnapshot,
    next_prompt_id: u64,
}

/// A scriptable mock implementing [`BackendClient`].
pub struct MockBackendClient {
    events_tx: broadcast::Sender<BackendEvent>,
    inner: Mutex<Inner>,
}

impl MockBackendClient {
    /// Create a mock with no scripted failures and an empty event
    /// history. `capacity` bounds the broadcast channel's backlog.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (events_tx, _rx) = broadcast::channel(capacity);
        Self {
            events_tx,
            inner: Mutex::new(Inner {
                connect_failures: VecDeque::new(),
                submit_outcomes: VecDeque::new(),
                interrupted: Vec::new(),
                artifacts: HashMap::new(),
                queue_snapshot: QueueSnapshot::default(),
                next_prompt_id: 0,
            }),
        }
    }

    /// Queue a `connect` failure to be returned on the next call.
    pub fn push_connect_failure(&self, err: DispatchError) {
        self.inner.lock().unwrap().connect_failures.push_back(err);
    }

    /// Queue a `submit` outcome to be returned on the next call. When the
    /// queue is empty, `submit` defaults to accepting with an
    /// auto-generated prompt id.
    pub fn push_submit_outcome(&self, outcome: SubmitOutcome) {
        self.inner
            .lock()
            .unwrap()
            .submit_outcomes
            .push_back(outcome);
    }

    /// Push an event directly onto the broadcast channel, as if the
    /// backend had emitted it.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Prompt ids passed to `interrupt` so far, in call order.
    #[must_use]
    pub fn interrupted_prompts(&self) -> Vec<String> {
        self.inner.lock().unwrap().interrupted.clone()
    }

    /// Install bytes `fetch_artifact` returns for `filename`.
    pub fn put_artifact(&self, filename: impl Into<String>, bytes: Vec<u8>) {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .insert(filename.into(), bytes);
    }

    /// Set the snapshot returned by `queue_snapshot`.
    pub fn set_queue_snapshot(&self, snapshot: QueueSnapshot) {
        self.inner.lock().unwrap().queue_snapshot = snapshot;
    }
}

impl Default for MockBackendClient {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl BackendClient for MockBackendClient {
    async fn connect(&self, _timeout: Duration) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.connect_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn submit(
        &self,
        _workflow: &Workflow,
        _attachments: &[Attachment],
        _include_outputs: &[String],
        _metadata: &std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<String, DispatchError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.submit_outcomes.pop_front() {
            Some(SubmitOutcome::Accept { prompt_id }) => Ok(prompt_id),
            Some(SubmitOutcome::Reject(err)) => Err(err),
            None => {
                let id = inner.next_prompt_id;
                inner.next_prompt_id += 1;
                Ok(format!("mock-prompt-{id}"))
            }
        }
    }

    async fn interrupt(&self, prompt_id: &str) -> Result<(), DispatchError> {
        self.inner
            .lock()
            .unwrap()
            .interrupted
            .push(prompt_id.to_string());
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events_tx.subscribe()
    }

    async fn fetch_artifact(
        &self,
        filename: &str,
        _subfolder: Option<&str>,
        _kind: Option<&str>,
    ) -> Result<Vec<u8>, DispatchError> {
        self.inner
            .lock()
            .unwrap()
            .artifacts
            .get(filename)
            .cloned()
            .ok_or_else(|| {
                DispatchError::new(ErrorCode::Internal, format!("no mock artifact: {filename}"))
            })
    }

    async fn queue_snapshot(&self) -> Result<QueueSnapshot, DispatchError> {
        Ok(self.inner.lock().unwrap().queue_snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow() -> Workflow {
        Workflow::from_value(serde_json::json!({"A": {"class_type": "X", "inputs": {}}})).unwrap()
    }

    #[tokio::test]
    async fn connect_succeeds_by_default() {
        let mock = MockBackendClient::default();
        assert!(mock.connect(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn connect_failure_is_scripted_once() {
        let mock = MockBackendClient::default();
        mock.push_connect_failure(DispatchError::new(ErrorCode::Internal, "timeout"));
        assert!(mock.connect(Duration::from_secs(1)).await.is_err());
        assert!(mock.connect(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn submit_without_script_auto_generates_prompt_ids() {
        let mock = MockBackendClient::default();
        let wf = workflow();
        let p1 = mock
            .submit(&wf, &[], &[], &Default::default())
            .await
            .unwrap();
        let p2 = mock
            .submit(&wf, &[], &[], &Default::default())
            .await
            .unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn submit_rejection_is_scriptable() {
        let mock = MockBackendClient::default();
        mock.push_submit_outcome(SubmitOutcome::Reject(DispatchError::new(
            ErrorCode::Internal,
            "missing_checkpoint",
        )));
        let wf = workflow();
        assert!(mock
            .submit(&wf, &[], &[], &Default::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn events_are_broadcast_to_subscribers() {
        let mock = MockBackendClient::default();
        let mut rx = mock.events();
        mock.emit(BackendEvent::ExecutionStart {
            prompt_id: "p1".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, BackendEvent::ExecutionStart { prompt_id } if prompt_id == "p1"));
    }

    #[tokio::test]
    async fn interrupt_records_prompt_id() {
        let mock = MockBackendClient::default();
        mock.interrupt("p1").await.unwrap();
        assert_eq!(mock.interrupted_prompts(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn fetch_artifact_returns_installed_bytes() {
        let mock = MockBackendClient::default();
        mock.put_artifact("out.png", vec![1, 2, 3]);
        let bytes = mock.fetch_artifact("out.png", None, None).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetch_artifact_missing_is_an_error() {
        let mock = MockBackendClient::default();
        assert!(mock
            .fetch_artifact("missing.png", None, None)
            .await
            .is_err());
    }
}
