// SPDX-License-Identifier: MIT OR Apache-2.0
//! The dispatcher (§4.7): the single owner of job-state transitions, driven
//! entirely by wakeups — job enqueued, a backend became ready, a job
//! finished on a backend, the execution-start timer fired, or the
//! failover policy's earliest block expired. No wakeup source, no work;
//! the scheduler never polls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Notify;

use wdp_backend_core::{BackendClient, BackendEvent};
use wdp_core::{
    BackendId, EnqueueOptions, Event, EventKind, Job, JobId, JobStatus, Workflow, checkpoint_key,
};
use wdp_error::{BackendErrorSignal, BlockBackend, Classification, DispatchError, ErrorCode, FailureType, classify};
use wdp_failover::{FailoverConfig, FailoverPolicy};
use wdp_queue::{EnqueueOptions as QueueEnqueueOptions, JobQueue, ReservationId};
use wdp_registry::{BackendRegistry, BackendState};

use crate::bus::{EventBus, EventSubscription};
use crate::cancel::CancellationToken;
use crate::queue_job::QueueJob;
use crate::store::JobStore;

/// Tunable parameters for a [`Dispatcher`] instance.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Maximum time between a successful submit and observing
    /// `executionStart` before the attempt is treated as stalled (§4.7
    /// step 6). Default 60 000 ms.
    pub execution_start_timeout_ms: u64,
    /// Timeout passed to [`BackendClient::connect`] when registering a
    /// backend. Default 5 000 ms.
    pub connect_timeout_ms: u64,
    /// Event bus channel capacity.
    pub event_bus_capacity: usize,
    /// Failover bookkeeping parameters (cooldown length, failures before
    /// a temporary block is applied).
    pub failover: FailoverConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            execution_start_timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
            event_bus_capacity: 1024,
            failover: FailoverConfig::default(),
        }
    }
}

/// Per-backend load snapshot exposed by [`Dispatcher::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStat {
    /// Jobs currently running on this backend.
    pub running: u64,
    /// Jobs queued on the backend itself, per its own `queueSnapshot`.
    pub queued: u64,
}

/// Snapshot of pool-wide load (§11 queue/backend statistics surface).
#[derive(Debug, Clone, Default)]
pub struct DispatcherStats {
    /// Counts across the job queue's sub-queues.
    pub queue: wdp_queue::QueueStats,
    /// Per-backend load, keyed by backend id.
    pub backends: BTreeMap<BackendId, BackendStat>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

struct Inner {
    config: DispatcherConfig,
    registry: Mutex<BackendRegistry>,
    queue: Mutex<JobQueue<QueueJob>>,
    failover: Mutex<FailoverPolicy>,
    store: JobStore,
    bus: EventBus,
    backends: Mutex<HashMap<BackendId, Arc<dyn BackendClient>>>,
    prompt_jobs: Mutex<HashMap<String, JobId>>,
    outputs: Mutex<HashMap<JobId, BTreeMap<String, Value>>>,
    exec_timers: Mutex<HashMap<JobId, CancellationToken>>,
    wake: Notify,
    pool_ready: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    fn wake(&self) {
        self.wake.notify_one();
    }

    fn publish(&self, kind: EventKind) {
        self.bus.publish(Event::now(kind));
    }
}

/// The Workflow Dispatch Pool's dispatcher.
///
/// Cloning a `Dispatcher` is cheap (it wraps an `Arc`); clones share the
/// same scheduler task, registry, queue, and event bus.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Construct a dispatcher and spawn its scheduler loop.
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        let inner = Arc::new(Inner {
            registry: Mutex::new(BackendRegistry::new()),
            queue: Mutex::new(JobQueue::new()),
            failover: Mutex::new(FailoverPolicy::new(config.failover)),
            store: JobStore::new(),
            bus: EventBus::with_capacity(config.event_bus_capacity),
            backends: Mutex::new(HashMap::new()),
            prompt_jobs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            exec_timers: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            pool_ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            config,
        });
        tokio::spawn(scheduler_loop(inner.clone()));
        Self { inner }
    }

    /// Stop the scheduler loop. In-flight backend I/O is not aborted; it
    /// simply has no scheduler left to hand its result to.
    pub fn shutdown(&self) {
        tracing::info!("dispatcher shutdown requested");
        self.inner.shutdown.cancel();
        self.inner.wake();
    }

    /// Register a backend, connect to it, and mark it `Ready` once its
    /// queue snapshot has been reconciled. Spawns a task forwarding the
    /// backend's event stream into the dispatcher.
    pub async fn register_backend(
        &self,
        id: BackendId,
        priority: i64,
        client: Arc<dyn BackendClient>,
    ) -> Result<(), DispatchError> {
        self.inner.registry.lock().expect("registry lock poisoned").register(id.clone(), priority);

        client
            .connect(Duration::from_millis(self.inner.config.connect_timeout_ms))
            .await?;
        let snapshot = client.queue_snapshot().await?;

        {
            let mut registry = self.inner.registry.lock().expect("registry lock poisoned");
            registry.reconcile(&id, snapshot.running, snapshot.pending);
            registry.set_state(&id, BackendState::Ready);
        }
        self.inner.backends.lock().expect("backends lock poisoned").insert(id.clone(), client.clone());
        spawn_event_forwarder(self.inner.clone(), id.clone(), client);

        tracing::info!(backend_id = %id, priority, "backend registered and ready");
        self.inner.publish(EventKind::BackendState {
            backend_id: id.clone(),
            state: "ready".to_string(),
        });

        let was_ready_before = self.inner.pool_ready.swap(true, Ordering::SeqCst);
        if !was_ready_before {
            let ready_ids = self.inner.registry.lock().expect("registry lock poisoned").ready_backend_ids();
            self.inner.publish(EventKind::PoolReady {
                backend_ids: ready_ids,
            });
        }

        self.inner.wake();
        Ok(())
    }

    /// Declare the set of fingerprints a backend is permitted to handle.
    /// An empty set (the default) means no restriction.
    pub fn declare_affinity(&self, backend_id: &BackendId, fingerprints: BTreeSet<String>) {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .declare_affinity(backend_id, fingerprints);
        self.inner.wake();
    }

    /// Clear every recorded failure for `fingerprint`, across all
    /// backends (an admin action, not driven by backend events).
    pub fn reset_for_fingerprint(&self, fingerprint: &str) {
        let cleared = self.inner.failover.lock().expect("failover lock poisoned").reset_for_fingerprint(fingerprint);
        for backend_id in cleared {
            self.inner.publish(EventKind::BackendUnblockedFingerprint {
                backend_id,
                fingerprint: fingerprint.to_string(),
            });
        }
        self.inner.wake();
    }

    /// Submit a workflow. Returns the assigned job id immediately; the
    /// job is dispatched asynchronously by the scheduler loop.
    pub fn enqueue(&self, workflow: Workflow, options: EnqueueOptions) -> JobId {
        let fingerprint = wdp_fingerprint::fingerprint(&workflow);
        let checkpoint = checkpoint_key(&workflow);
        let job = Job::new(workflow, fingerprint, options);
        let job_id = job.id;

        self.inner.store.insert(job.clone());
        tracing::debug!(job_id = %job_id, fingerprint = %job.fingerprint, "job queued");
        self.inner.publish(EventKind::JobQueued { job: job.clone() });

        let priority = job.priority;
        self.inner.queue.lock().expect("queue lock poisoned").enqueue(
            QueueJob(job),
            checkpoint,
            QueueEnqueueOptions {
                priority,
                delay_ms: 0,
            },
            now_ms(),
        );
        self.inner.wake();
        job_id
    }

    /// Cancel a job (§4.7 cancellation).
    pub async fn cancel(&self, job_id: JobId) -> Result<(), DispatchError> {
        let Some(job) = self.inner.store.get(job_id) else {
            return Err(DispatchError::new(ErrorCode::InvalidState, "unknown job id")
                .with_context("job_id", job_id.to_string()));
        };

        match job.status {
            JobStatus::Queued => {
                self.inner.queue.lock().expect("queue lock poisoned").remove(&job_id);
                self.inner.store.update(job_id, |j| {
                    j.status = JobStatus::Cancelled;
                    j.completed_at = Some(Utc::now());
                });
                let cancelled = self.inner.store.get(job_id).expect("just updated");
                self.inner.publish(EventKind::JobCancelled { job: cancelled });
                Ok(())
            }
            JobStatus::Running => {
                if let Some(backend_id) = job.backend_id.clone() {
                    if let Some(client) = self.inner.backends.lock().expect("backends lock poisoned").get(&backend_id).cloned() {
                        if let Some(prompt_id) = job.prompt_id.clone() {
                            let _ = client.interrupt(&prompt_id).await;
                            self.inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").remove(&prompt_id);
                        }
                        self.inner.registry.lock().expect("registry lock poisoned").decrement_running(&backend_id);
                    }
                }
                if let Some(token) = self.inner.exec_timers.lock().expect("exec_timers lock poisoned").remove(&job_id) {
                    token.cancel();
                }
                self.inner.outputs.lock().expect("outputs lock poisoned").remove(&job_id);
                self.inner.store.update(job_id, |j| {
                    j.status = JobStatus::Cancelled;
                    j.completed_at = Some(Utc::now());
                });
                let cancelled = self.inner.store.get(job_id).expect("just updated");
                self.inner.publish(EventKind::JobCancelled { job: cancelled });
                self.inner.wake();
                Ok(())
            }
            _ => Err(DispatchError::new(ErrorCode::InvalidState, "job already in a terminal state")
                .with_context("job_id", job_id.to_string())
                .with_context("status", format!("{:?}", job.status))),
        }
    }

    /// Snapshot a job's current record.
    #[must_use]
    pub fn status(&self, job_id: JobId) -> Option<Job> {
        self.inner.store.get(job_id)
    }

    /// Subscribe to the event bus.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        self.inner.bus.subscribe()
    }

    /// Snapshot of queue and per-backend load.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let now = now_ms();
        let queue = self.inner.queue.lock().expect("queue lock poisoned").stats(now);
        let registry = self.inner.registry.lock().expect("registry lock poisoned");
        let backends = self
            .inner
            .backends
            .lock()
            .expect("backends lock poisoned")
            .keys()
            .filter_map(|id| {
                registry.get(id).map(|r| {
                    (
                        id.clone(),
                        BackendStat {
                            running: r.running,
                            queued: r.queued,
                        },
                    )
                })
            })
            .collect();
        DispatcherStats { queue, backends }
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

async fn scheduler_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        while try_dispatch_one(&inner).await {}

        let next_expiry = inner.failover.lock().expect("failover lock poisoned").next_expiry_ms();
        tokio::select! {
            () = inner.shutdown.cancelled() => return,
            () = wait_for_wakeup(&inner, next_expiry) => {}
        }
    }
}

async fn wait_for_wakeup(inner: &Inner, next_expiry_ms: Option<i64>) {
    match next_expiry_ms {
        Some(expiry) => {
            let delay_ms = (expiry - now_ms()).max(0) as u64;
            tokio::select! {
                () = inner.wake.notified() => {}
                () = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
        None => inner.wake.notified().await,
    }
}

/// Attempt one reserve-and-submit cycle. Returns `true` if it made
/// forward progress (so the caller should immediately try again), `false`
/// if there is nothing left to do this round.
async fn try_dispatch_one(inner: &Arc<Inner>) -> bool {
    let available_checkpoints = inner.registry.lock().expect("registry lock poisoned").ready_resident_checkpoints();
    let reservation = inner
        .queue
        .lock()
        .expect("queue lock poisoned")
        .reserve(Some(&available_checkpoints), now_ms());
    let Some(reservation) = reservation else {
        return false;
    };

    let job = reservation.payload.0.clone();
    let backend_id = {
        let registry = inner.registry.lock().expect("registry lock poisoned");
        let mut failover = inner.failover.lock().expect("failover lock poisoned");
        registry.pick_backend_for(&job, &mut failover, now_ms())
    };

    let Some(backend_id) = backend_id else {
        inner.queue.lock().expect("queue lock poisoned").retry(reservation.reservation_id, 0, now_ms());
        return false;
    };

    let Some(client) = inner.backends.lock().expect("backends lock poisoned").get(&backend_id).cloned() else {
        inner.queue.lock().expect("queue lock poisoned").retry(reservation.reservation_id, 0, now_ms());
        return false;
    };

    let result = client
        .submit(&job.workflow, &job.attachments, &job.include_outputs, &job.metadata)
        .await;

    match result {
        Ok(prompt_id) => {
            on_submit_success(inner, reservation.reservation_id, job, backend_id, prompt_id).await;
        }
        Err(err) => {
            let signal = error_signal_from(&err);
            let classification = classify(&signal);
            on_submit_failure(inner, reservation.reservation_id, job, backend_id, classification).await;
        }
    }
    true
}

async fn on_submit_success(
    inner: &Arc<Inner>,
    reservation_id: ReservationId,
    mut job: Job,
    backend_id: BackendId,
    prompt_id: String,
) {
    inner.queue.lock().expect("queue lock poisoned").commit(reservation_id);

    let job_id = job.id;
    job.prompt_id = Some(prompt_id.clone());
    job.status = JobStatus::Running;
    job.started_at = Some(Utc::now());
    job.backend_id = Some(backend_id.clone());
    inner.store.update(job_id, |stored| {
        stored.prompt_id = job.prompt_id.clone();
        stored.status = job.status;
        stored.started_at = job.started_at;
        stored.backend_id = job.backend_id.clone();
    });

    inner.registry.lock().expect("registry lock poisoned").increment_running(&backend_id);
    inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").insert(prompt_id.clone(), job_id);
    tracing::debug!(job_id = %job_id, backend_id = %backend_id, prompt_id, "job started");
    inner.publish(EventKind::JobStarted {
        job: job.clone(),
        backend_id: backend_id.clone(),
    });

    arm_execution_start_timer(inner.clone(), job, backend_id, prompt_id);
}

async fn on_submit_failure(
    inner: &Arc<Inner>,
    reservation_id: ReservationId,
    mut job: Job,
    backend_id: BackendId,
    classification: Classification,
) {
    let job_id = job.id;
    let last_error = serde_json::to_value(&classification).unwrap_or(Value::Null);
    job.last_error = Some(last_error.clone());

    match classification.failure_type {
        FailureType::WorkflowInvalid => {
            inner.queue.lock().expect("queue lock poisoned").discard(reservation_id, Some(classification.reason.clone()));
            finalize_failed(inner, job_id, job, false, classification);
        }
        FailureType::BackendIncompatible => {
            record_block(inner, &backend_id, &job.fingerprint, classification.block_backend);
            inner.queue.lock().expect("queue lock poisoned").retry(reservation_id, 0, now_ms());
            job.attempts += 1;
            inner.store.update(job_id, |stored| stored.attempts = job.attempts);
            inner.publish(EventKind::JobFailed {
                job: job.clone(),
                will_retry: true,
                classification: last_error,
            });
            inner.wake();
        }
        FailureType::Transient | FailureType::Unknown => {
            record_block(inner, &backend_id, &job.fingerprint, classification.block_backend);
            if job.attempts + 1 < job.max_attempts {
                inner.queue.lock().expect("queue lock poisoned").retry(reservation_id, job.retry_delay_ms, now_ms());
                job.attempts += 1;
                inner.store.update(job_id, |stored| stored.attempts = job.attempts);
                inner.publish(EventKind::JobFailed {
                    job: job.clone(),
                    will_retry: true,
                    classification: last_error,
                });
                inner.publish(EventKind::JobRetrying {
                    job: job.clone(),
                    delay_ms: job.retry_delay_ms,
                });
            } else {
                inner.queue.lock().expect("queue lock poisoned").discard(reservation_id, Some(classification.reason.clone()));
                finalize_failed(inner, job_id, job, false, classification);
            }
        }
    }
}

fn finalize_failed(inner: &Arc<Inner>, job_id: JobId, mut job: Job, will_retry: bool, classification: Classification) {
    let value = serde_json::to_value(&classification).unwrap_or(Value::Null);
    job.status = JobStatus::Failed;
    job.completed_at = Some(Utc::now());
    job.last_error = Some(value.clone());
    inner.store.update(job_id, |stored| {
        stored.status = job.status;
        stored.completed_at = job.completed_at;
        stored.last_error = job.last_error.clone();
    });
    tracing::warn!(job_id = %job_id, reason = %classification.reason, "job failed");
    inner.publish(EventKind::JobFailed {
        job,
        will_retry,
        classification: value,
    });
}

fn record_block(inner: &Arc<Inner>, backend_id: &BackendId, fingerprint: &str, block: BlockBackend) {
    if block == BlockBackend::None {
        return;
    }
    let until_ms = {
        let mut failover = inner.failover.lock().expect("failover lock poisoned");
        failover.record_failure(backend_id, fingerprint, block, now_ms());
        failover.blocked_until_ms(backend_id, fingerprint)
    };
    inner.publish(EventKind::BackendBlockedFingerprint {
        backend_id: backend_id.clone(),
        fingerprint: fingerprint.to_string(),
        until_ms,
    });
}

fn arm_execution_start_timer(inner: Arc<Inner>, job: Job, backend_id: BackendId, prompt_id: String) {
    let token = CancellationToken::new();
    inner.exec_timers.lock().expect("exec_timers lock poisoned").insert(job.id, token.clone());
    let timeout_ms = inner.config.execution_start_timeout_ms;

    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                handle_execution_start_timeout(inner, job, backend_id, prompt_id).await;
            }
        }
    });
}

async fn handle_execution_start_timeout(inner: Arc<Inner>, job: Job, backend_id: BackendId, prompt_id: String) {
    inner.exec_timers.lock().expect("exec_timers lock poisoned").remove(&job.id);
    inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").remove(&prompt_id);

    if let Some(client) = inner.backends.lock().expect("backends lock poisoned").get(&backend_id).cloned() {
        let _ = client.interrupt(&prompt_id).await;
    }
    inner.registry.lock().expect("registry lock poisoned").decrement_running(&backend_id);

    let classification = Classification {
        failure_type: FailureType::Transient,
        retryable: true,
        block_backend: BlockBackend::Temporary,
        reason: "execution-start timeout elapsed".to_string(),
    };
    record_block(&inner, &backend_id, &job.fingerprint, classification.block_backend);
    retry_or_fail_running_job(&inner, job, classification);
}

/// Shared by execution-start timeout and `executionError` handling: the
/// job is currently `running`, with no live queue reservation, so it must
/// be re-enqueued fresh rather than retried through the queue.
fn retry_or_fail_running_job(inner: &Arc<Inner>, mut job: Job, classification: Classification) {
    let job_id = job.id;
    let next_attempt = job.attempts + 1;
    let last_error = serde_json::to_value(&classification).unwrap_or(Value::Null);
    job.last_error = Some(last_error.clone());

    if next_attempt < job.max_attempts {
        job.attempts = next_attempt;
        job.status = JobStatus::Queued;
        job.backend_id = None;
        job.prompt_id = None;
        inner.store.update(job_id, |stored| {
            stored.attempts = job.attempts;
            stored.status = job.status;
            stored.backend_id = None;
            stored.prompt_id = None;
            stored.last_error = job.last_error.clone();
        });
        inner.publish(EventKind::JobFailed {
            job: job.clone(),
            will_retry: true,
            classification: last_error,
        });
        inner.publish(EventKind::JobRetrying {
            job: job.clone(),
            delay_ms: job.retry_delay_ms,
        });

        let checkpoint = checkpoint_key(&job.workflow);
        let priority = job.priority;
        let retry_delay_ms = job.retry_delay_ms;
        inner.queue.lock().expect("queue lock poisoned").enqueue(
            QueueJob(job),
            checkpoint,
            QueueEnqueueOptions {
                priority,
                delay_ms: retry_delay_ms,
            },
            now_ms(),
        );
    } else {
        finalize_failed(inner, job_id, job, false, classification);
    }
    inner.wake();
}

// ---------------------------------------------------------------------------
// Backend event forwarding
// ---------------------------------------------------------------------------

fn spawn_event_forwarder(inner: Arc<Inner>, backend_id: BackendId, client: Arc<dyn BackendClient>) {
    let mut rx = client.events();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => handle_backend_event(&inner, &backend_id, event).await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn handle_backend_event(inner: &Arc<Inner>, backend_id: &BackendId, event: BackendEvent) {
    match event {
        BackendEvent::Pending { .. } => {}
        BackendEvent::ExecutionStart { prompt_id } => {
            if let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").get(&prompt_id).copied() {
                if let Some(token) = inner.exec_timers.lock().expect("exec_timers lock poisoned").remove(&job_id) {
                    token.cancel();
                }
            }
        }
        BackendEvent::Executing { .. } => {}
        BackendEvent::NodeExecuted {
            prompt_id,
            node_id,
            output,
        } => {
            let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").get(&prompt_id).copied() else {
                return;
            };
            if let Some(job) = inner.store.get(job_id) {
                if job.include_outputs.contains(&node_id) {
                    inner
                        .outputs
                        .lock()
                        .expect("outputs lock poisoned")
                        .entry(job_id)
                        .or_default()
                        .insert(node_id.clone(), output.clone());
                }
            }
            inner.publish(EventKind::JobNodeExecuted {
                job_id,
                node_id,
                output,
            });
        }
        BackendEvent::Progress {
            prompt_id,
            node_id,
            value,
            max,
        } => {
            if let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").get(&prompt_id).copied() {
                inner.publish(EventKind::JobProgress {
                    job_id,
                    node_id,
                    value,
                    max,
                });
            }
        }
        BackendEvent::PreviewBlob {
            prompt_id,
            bytes,
            meta,
        } => {
            if let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").get(&prompt_id).copied() {
                inner.publish(EventKind::JobPreview { job_id, bytes, meta });
            }
        }
        BackendEvent::ExecutionSuccess { prompt_id } => {
            handle_execution_success(inner, backend_id, &prompt_id).await;
        }
        BackendEvent::ExecutionError { prompt_id, error } => {
            handle_execution_error(inner, backend_id, &prompt_id, error).await;
        }
        BackendEvent::StatusUpdate { queue_remaining } => {
            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            let running = registry.get(backend_id).map_or(0, |r| r.running);
            registry.reconcile(backend_id, running, queue_remaining);
        }
        BackendEvent::Disconnected => {
            inner.registry.lock().expect("registry lock poisoned").set_state(backend_id, BackendState::Disconnected);
            inner.publish(EventKind::BackendState {
                backend_id: backend_id.clone(),
                state: "disconnected".to_string(),
            });
        }
        BackendEvent::Reconnected => {
            inner.registry.lock().expect("registry lock poisoned").set_state(backend_id, BackendState::Ready);
            inner.publish(EventKind::BackendState {
                backend_id: backend_id.clone(),
                state: "ready".to_string(),
            });
            inner.wake();
        }
    }
}

async fn handle_execution_success(inner: &Arc<Inner>, backend_id: &BackendId, prompt_id: &str) {
    let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").remove(prompt_id) else {
        return;
    };
    let Some(mut job) = inner.store.get(job_id) else {
        return;
    };
    // A job cancelled just before this event arrived is already terminal;
    // late success for its promptId is ignored (§4.7 cancellation).
    if job.status.is_terminal() {
        return;
    }

    let result = inner.outputs.lock().expect("outputs lock poisoned").remove(&job_id).unwrap_or_default();
    job.result = Some(result);
    job.status = JobStatus::Completed;
    job.completed_at = Some(Utc::now());
    inner.store.update(job_id, |stored| {
        stored.result = job.result.clone();
        stored.status = job.status;
        stored.completed_at = job.completed_at;
    });

    inner.registry.lock().expect("registry lock poisoned").decrement_running(backend_id);
    let unblocked = inner.failover.lock().expect("failover lock poisoned").record_success(backend_id, &job.fingerprint);
    if unblocked {
        inner.publish(EventKind::BackendUnblockedFingerprint {
            backend_id: backend_id.clone(),
            fingerprint: job.fingerprint.clone(),
        });
    }
    tracing::debug!(job_id = %job_id, backend_id = %backend_id, "job completed");
    inner.publish(EventKind::JobCompleted { job });
    inner.wake();
}

async fn handle_execution_error(
    inner: &Arc<Inner>,
    backend_id: &BackendId,
    prompt_id: &str,
    error: BackendErrorSignal,
) {
    let Some(job_id) = inner.prompt_jobs.lock().expect("prompt_jobs lock poisoned").remove(prompt_id) else {
        return;
    };
    let Some(job) = inner.store.get(job_id) else {
        return;
    };
    if job.status.is_terminal() {
        return;
    }
    if let Some(token) = inner.exec_timers.lock().expect("exec_timers lock poisoned").remove(&job_id) {
        token.cancel();
    }
    inner.outputs.lock().expect("outputs lock poisoned").remove(&job_id);
    inner.registry.lock().expect("registry lock poisoned").decrement_running(backend_id);

    let classification = classify(&error);
    match classification.failure_type {
        FailureType::WorkflowInvalid => {
            record_block(inner, backend_id, &job.fingerprint, BlockBackend::None);
            finalize_failed(inner, job_id, job, false, classification);
            inner.wake();
        }
        FailureType::BackendIncompatible => {
            record_block(inner, backend_id, &job.fingerprint, classification.block_backend);
            retry_or_fail_running_job(inner, job, classification);
        }
        FailureType::Transient | FailureType::Unknown => {
            record_block(inner, backend_id, &job.fingerprint, classification.block_backend);
            retry_or_fail_running_job(inner, job, classification);
        }
    }
}

/// Bridge a generic [`DispatchError`] surfaced by a [`BackendClient`] call
/// into the raw signal the classifier understands, using whatever
/// structured context the caller attached (§4.2/§4.5 boundary).
fn error_signal_from(err: &DispatchError) -> BackendErrorSignal {
    BackendErrorSignal {
        code: err
            .context
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string),
        message: Some(err.message.clone()),
        http_status: err
            .context
            .get("http_status")
            .and_then(Value::as_u64)
            .map(|v| v as u16),
        is_transport_error: err
            .context
            .get("is_transport_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        caller_detected_schema_fault: err
            .context
            .get("caller_detected_schema_fault")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}
