// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end scenarios exercising the dispatcher against
//! [`MockBackendClient`], one test per documented scenario: a happy path,
//! failover past a permanently-blocked backend, a transient retry, an
//! execution-start stall, FIFO ordering under retry, and cancellation of
//! a running job.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use wdp_backend_core::BackendEvent;
use wdp_backend_mock::{MockBackendClient, SubmitOutcome};
use wdp_core::{BackendId, EnqueueOptions, EventKind, JobStatus, Workflow};
use wdp_dispatcher::{Dispatcher, DispatcherConfig, EventSubscription};
use wdp_error::{BackendErrorSignal, DispatchError, ErrorCode};

fn workflow() -> Workflow {
    Workflow::from_value(serde_json::json!({"A": {"class_type": "X", "inputs": {}}})).unwrap()
}

async fn next_matching<F: Fn(&EventKind) -> bool>(
    sub: &mut EventSubscription,
    pred: F,
) -> EventKind {
    timeout(Duration::from_secs(5), async {
        loop {
            let ev = sub.recv().await.expect("event bus should not close mid-test");
            if pred(&ev.kind) {
                return ev.kind;
            }
        }
    })
    .await
    .expect("expected event did not arrive in time")
}

async fn wait_completed(dispatcher: &Dispatcher, job_id: wdp_core::JobId) -> wdp_core::Job {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = dispatcher.status(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state in time")
}

// ── S1: happy path ──────────────────────────────────────────────────

#[tokio::test]
async fn s1_happy_path_completes_with_collected_output() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let mock = Arc::new(MockBackendClient::default());
    dispatcher
        .register_backend("b1".into(), 0, mock.clone())
        .await
        .unwrap();

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(
        workflow(),
        EnqueueOptions {
            include_outputs: Some(vec!["A".into()]),
            ..Default::default()
        },
    );

    let started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, .. } = started else { unreachable!() };
    let prompt_id = job.prompt_id.clone().expect("prompt id assigned on submit success");

    mock.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    mock.emit(BackendEvent::Executing { prompt_id: prompt_id.clone(), node_id: Some("A".into()) });
    mock.emit(BackendEvent::NodeExecuted {
        prompt_id: prompt_id.clone(),
        node_id: "A".into(),
        output: serde_json::json!({"images": [{"filename": "f.png"}]}),
    });
    mock.emit(BackendEvent::ExecutionSuccess { prompt_id });

    let job = wait_completed(&dispatcher, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.expect("completed job has a result map");
    assert_eq!(
        result.get("A").unwrap(),
        &serde_json::json!({"images": [{"filename": "f.png"}]}),
    );
}

// ── S2: permanent block, successful failover ────────────────────────

#[tokio::test]
async fn s2_permanent_block_fails_over_to_the_other_backend() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let b1 = Arc::new(MockBackendClient::default());
    let b2 = Arc::new(MockBackendClient::default());

    b1.push_submit_outcome(SubmitOutcome::Reject(
        DispatchError::new(ErrorCode::Internal, "missing checkpoint")
            .with_context("code", "value_not_in_list"),
    ));

    dispatcher.register_backend("b1".into(), 0, b1.clone()).await.unwrap();
    dispatcher.register_backend("b2".into(), 0, b2.clone()).await.unwrap();

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(workflow(), EnqueueOptions::default());

    let blocked = next_matching(&mut sub, |k| matches!(k, EventKind::BackendBlockedFingerprint { .. })).await;
    let EventKind::BackendBlockedFingerprint { backend_id, .. } = blocked else { unreachable!() };
    assert_eq!(backend_id, BackendId::from("b1"));

    let started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, backend_id } = started else { unreachable!() };
    assert_eq!(backend_id, BackendId::from("b2"));
    let prompt_id = job.prompt_id.unwrap();

    b2.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    b2.emit(BackendEvent::ExecutionSuccess { prompt_id });

    let job = wait_completed(&dispatcher, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);

    // A second job with the same fingerprint should be dispatched
    // straight to b2, skipping the blocked backend entirely.
    let job_id2 = dispatcher.enqueue(workflow(), EnqueueOptions::default());
    let started2 = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id2)).await;
    let EventKind::JobStarted { backend_id, .. } = started2 else { unreachable!() };
    assert_eq!(backend_id, BackendId::from("b2"));
}

// ── S3: transient retry ──────────────────────────────────────────────

#[tokio::test]
async fn s3_transient_submit_failure_retries_then_completes() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        failover: wdp_failover::FailoverConfig { cooldown_ms: 10, max_failures_before_block: 1 },
        ..DispatcherConfig::default()
    });
    let mock = Arc::new(MockBackendClient::default());
    mock.push_submit_outcome(SubmitOutcome::Reject(
        DispatchError::new(ErrorCode::Internal, "server error").with_context("http_status", 500u16),
    ));

    dispatcher.register_backend("b1".into(), 0, mock.clone()).await.unwrap();

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(
        workflow(),
        EnqueueOptions { max_attempts: Some(3), retry_delay_ms: Some(50), ..Default::default() },
    );

    let retrying = next_matching(&mut sub, |k| matches!(k, EventKind::JobRetrying { job, .. } if job.id == job_id)).await;
    let EventKind::JobRetrying { delay_ms, .. } = retrying else { unreachable!() };
    assert!(delay_ms >= 50);

    let started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, .. } = started else { unreachable!() };
    let prompt_id = job.prompt_id.unwrap();
    mock.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    mock.emit(BackendEvent::ExecutionSuccess { prompt_id });

    let job = wait_completed(&dispatcher, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
}

// ── S4: execution stall ──────────────────────────────────────────────

#[tokio::test]
async fn s4_execution_start_stall_interrupts_and_fails_over() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        execution_start_timeout_ms: 200,
        ..DispatcherConfig::default()
    });
    let b1 = Arc::new(MockBackendClient::default());
    let b2 = Arc::new(MockBackendClient::default());
    dispatcher.register_backend("b1".into(), 0, b1.clone()).await.unwrap();
    dispatcher.register_backend("b2".into(), 0, b2.clone()).await.unwrap();

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(workflow(), EnqueueOptions::default());

    // b1 never emits executionStart; after the timeout it must be
    // interrupted and the job re-submitted elsewhere.
    let started_b1 = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, backend_id } = started_b1 else { unreachable!() };
    assert_eq!(backend_id, BackendId::from("b1"));
    let stalled_prompt_id = job.prompt_id.unwrap();

    let retrying = next_matching(&mut sub, |k| matches!(k, EventKind::JobRetrying { job, .. } if job.id == job_id)).await;
    assert!(matches!(retrying, EventKind::JobRetrying { .. }));
    assert_eq!(b1.interrupted_prompts(), vec![stalled_prompt_id]);

    let started_b2 = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, backend_id } = started_b2 else { unreachable!() };
    assert_eq!(backend_id, BackendId::from("b2"));
    let prompt_id = job.prompt_id.unwrap();
    b2.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    b2.emit(BackendEvent::ExecutionSuccess { prompt_id });

    let job = wait_completed(&dispatcher, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
}

// ── S5: FIFO ordering survives a retry ──────────────────────────────

#[tokio::test]
async fn s5_retried_job_is_dispatched_before_the_next_in_line() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        failover: wdp_failover::FailoverConfig { cooldown_ms: 0, max_failures_before_block: 1 },
        ..DispatcherConfig::default()
    });
    let mock = Arc::new(MockBackendClient::default());
    // J1's first submit fails transiently; its retry must still beat J2.
    mock.push_submit_outcome(SubmitOutcome::Reject(
        DispatchError::new(ErrorCode::Internal, "server error").with_context("http_status", 500u16),
    ));
    dispatcher.register_backend("b1".into(), 0, mock.clone()).await.unwrap();

    let mut sub = dispatcher.subscribe();
    let job1 = dispatcher.enqueue(
        workflow(),
        EnqueueOptions { priority: Some(0), retry_delay_ms: Some(0), ..Default::default() },
    );
    let job2 = dispatcher.enqueue(workflow(), EnqueueOptions { priority: Some(0), ..Default::default() });

    let first_started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { .. })).await;
    let EventKind::JobStarted { job, .. } = first_started else { unreachable!() };
    assert_eq!(job.id, job1, "the retried job must be re-dispatched before job2");

    let prompt_id = job.prompt_id.unwrap();
    mock.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    mock.emit(BackendEvent::ExecutionSuccess { prompt_id });
    wait_completed(&dispatcher, job1).await;

    let second_started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job2)).await;
    let EventKind::JobStarted { job, .. } = second_started else { unreachable!() };
    assert_eq!(job.id, job2);
}

// ── Regression: queue-internal retries must not count as job attempts ──

#[tokio::test]
async fn queue_retries_before_backend_ready_do_not_count_toward_job_max_attempts() {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        failover: wdp_failover::FailoverConfig { cooldown_ms: 10, max_failures_before_block: 1 },
        ..DispatcherConfig::default()
    });

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(
        workflow(),
        EnqueueOptions { max_attempts: Some(3), retry_delay_ms: Some(0), ..Default::default() },
    );

    // No backend is registered yet: each of these wakes drives the
    // scheduler through a reserve/no-backend/retry cycle for the same
    // job, bumping the queue's own reservation bookkeeping without a
    // single real submission ever being attempted.
    let phantom: BackendId = "phantom".into();
    for _ in 0..3 {
        dispatcher.declare_affinity(&phantom, Default::default());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(dispatcher.status(job_id).unwrap().attempts, 0);

    // Now a real backend rejects the job's first genuine submission
    // transiently. With max_attempts=3 this must still retry rather than
    // being finalized failed outright on the very first real attempt.
    let mock = Arc::new(MockBackendClient::default());
    mock.push_submit_outcome(SubmitOutcome::Reject(
        DispatchError::new(ErrorCode::Internal, "server error").with_context("http_status", 500u16),
    ));
    dispatcher.register_backend("b1".into(), 0, mock.clone()).await.unwrap();

    let retrying = next_matching(&mut sub, |k| matches!(k, EventKind::JobRetrying { job, .. } if job.id == job_id)).await;
    assert!(matches!(retrying, EventKind::JobRetrying { .. }));

    let started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, .. } = started else { unreachable!() };
    let prompt_id = job.prompt_id.unwrap();
    mock.emit(BackendEvent::ExecutionStart { prompt_id: prompt_id.clone() });
    mock.emit(BackendEvent::ExecutionSuccess { prompt_id });

    let job = wait_completed(&dispatcher, job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1, "job.attempts must count only real submission failures");
}

// ── S6: cancellation while running ──────────────────────────────────

#[tokio::test]
async fn s6_cancel_while_running_interrupts_and_ignores_late_events() {
    let dispatcher = Dispatcher::new(DispatcherConfig::default());
    let mock = Arc::new(MockBackendClient::default());
    dispatcher.register_backend("b1".into(), 0, mock.clone()).await.unwrap();

    let mut sub = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(workflow(), EnqueueOptions::default());

    let started = next_matching(&mut sub, |k| matches!(k, EventKind::JobStarted { job, .. } if job.id == job_id)).await;
    let EventKind::JobStarted { job, .. } = started else { unreachable!() };
    let prompt_id = job.prompt_id.unwrap();

    dispatcher.cancel(job_id).await.unwrap();
    assert_eq!(mock.interrupted_prompts(), vec![prompt_id.clone()]);

    let job = dispatcher.status(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // A late success for the interrupted prompt must not resurrect the job.
    mock.emit(BackendEvent::ExecutionSuccess { prompt_id });
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = dispatcher.status(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
}
