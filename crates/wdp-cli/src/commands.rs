// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared command implementations for the Workflow Dispatch Pool CLI.
//!
//! These functions are library-level so they can be tested without
//! spawning the binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use schemars::schema_for;
use tokio_stream::StreamExt;
use wdp_backend_core::BackendEvent;
use wdp_backend_mock::MockBackendClient;
use wdp_core::{BackendId, EnqueueOptions, Event, EventKind, Job, JobStatus, Workflow};
use wdp_dispatcher::{Dispatcher, DispatcherConfig};

/// Schema types that can be printed by the `schema` subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// JSON schema for [`wdp_config::PoolConfig`].
    PoolConfig,
    /// JSON schema for [`Job`].
    Job,
}

/// Return the JSON schema string for the given kind.
pub fn schema_json(kind: SchemaKind) -> Result<String> {
    let value = match kind {
        SchemaKind::PoolConfig => serde_json::to_value(schema_for!(wdp_config::PoolConfig))?,
        SchemaKind::Job => serde_json::to_value(schema_for!(Job))?,
    };
    serde_json::to_string_pretty(&value).context("serialize schema")
}

/// Parse a workflow JSON file into a [`Workflow`].
pub fn load_workflow_file(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read workflow file '{}'", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("parse JSON from '{}'", path.display()))?;
    Workflow::from_value(value)
        .with_context(|| format!("'{}' is not a JSON object", path.display()))
}

/// Load and validate a pool configuration file, returning human-readable
/// diagnostics (errors and warnings) rather than failing on warnings.
pub fn config_check(path: Option<&Path>) -> Result<Vec<String>> {
    let mut diagnostics = Vec::new();

    let config = match wdp_config::load_config(path) {
        Ok(c) => c,
        Err(e) => {
            diagnostics.push(format!("error: {e}"));
            return Ok(diagnostics);
        }
    };

    match wdp_config::validate_config(&config) {
        Ok(warnings) => {
            if warnings.is_empty() {
                diagnostics.push("config: ok".into());
            }
            for w in &warnings {
                diagnostics.push(format!("warning: {w}"));
            }
        }
        Err(wdp_config::ConfigError::ValidationError { reasons }) => {
            for r in &reasons {
                diagnostics.push(format!("error: {r}"));
            }
        }
        Err(e) => diagnostics.push(format!("error: {e}")),
    }

    Ok(diagnostics)
}

/// Options accepted by [`submit_workflow`], mirroring the Enqueue API's
/// caller-supplied fields.
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    /// Scheduling priority, if the caller overrides the pool default.
    pub priority: Option<i64>,
    /// Maximum attempts, if the caller overrides the pool default.
    pub max_attempts: Option<u32>,
    /// Retry delay in milliseconds, if the caller overrides the pool default.
    pub retry_delay_ms: Option<u64>,
    /// Node ids whose outputs should be collected into the final result.
    pub include_outputs: Vec<String>,
    /// How long to wait for the job to reach a terminal state.
    pub timeout: Duration,
}

/// Run a single workflow to completion against a pool backed by one mock
/// backend, printing nothing; the caller decides how to present the
/// result and the stream of events observed along the way.
///
/// There is no real backend adapter in this workspace (protocol adapters
/// are out of scope), so the CLI demonstrates the dispatcher's behavior
/// against [`MockBackendClient`]: a background task watches for
/// `job:started` and immediately scripts an `executionStart` followed by
/// an `executionSuccess` for that submission, standing in for a real
/// server's completion.
pub async fn submit_workflow(
    pool_config: &wdp_config::PoolConfig,
    workflow: Workflow,
    args: SubmitArgs,
) -> Result<(Job, Vec<Event>)> {
    let dispatcher = Dispatcher::new(DispatcherConfig {
        execution_start_timeout_ms: pool_config.execution_start_timeout_ms(),
        failover: wdp_failover::FailoverConfig {
            cooldown_ms: pool_config.cooldown_ms(),
            max_failures_before_block: pool_config.max_failures_before_block(),
        },
        ..DispatcherConfig::default()
    });

    let mock = Arc::new(MockBackendClient::default());
    let backend_id: BackendId = "mock".into();
    dispatcher
        .register_backend(backend_id, 0, mock.clone())
        .await
        .context("register mock backend")?;

    let mut subscription = dispatcher.subscribe();
    let job_id = dispatcher.enqueue(
        workflow,
        EnqueueOptions {
            priority: args.priority.or(Some(pool_config.default_priority())),
            max_attempts: args.max_attempts.or(Some(pool_config.default_max_attempts())),
            retry_delay_ms: args.retry_delay_ms.or(Some(pool_config.default_retry_delay_ms())),
            include_outputs: Some(args.include_outputs),
            ..EnqueueOptions::default()
        },
    );

    tokio::spawn(auto_complete_on_start(mock, dispatcher.subscribe(), job_id));

    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + args.timeout;
    loop {
        if let Some(job) = dispatcher.status(job_id) {
            if job.status.is_terminal() {
                return Ok((job, events));
            }
        }
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                anyhow::bail!("timed out waiting for job {job_id} to finish");
            }
            ev = subscription.recv() => {
                let Some(ev) = ev else { continue };
                if ev.kind.job_id() != Some(job_id) {
                    continue;
                }
                events.push(ev.clone());
                if let Some(job) = dispatcher.status(job_id) {
                    if job.status.is_terminal() {
                        return Ok((job, events));
                    }
                }
            }
        }
    }
}

/// Background task standing in for a real backend: scripts a completion
/// for the one prompt id this job is submitted under.
async fn auto_complete_on_start(
    mock: Arc<MockBackendClient>,
    mut subscription: wdp_dispatcher::EventSubscription,
    job_id: wdp_core::JobId,
) {
    while let Some(ev) = subscription.recv().await {
        if ev.kind.job_id() != Some(job_id) {
            continue;
        }
        if let EventKind::JobStarted { job, .. } = ev.kind {
            if let Some(prompt_id) = job.prompt_id {
                mock.emit(BackendEvent::ExecutionStart {
                    prompt_id: prompt_id.clone(),
                });
                mock.emit(BackendEvent::ExecutionSuccess { prompt_id });
            }
            return;
        }
    }
}

/// Whether a finished [`Job`] should cause the CLI to exit non-zero.
#[must_use]
pub fn is_failure(status: JobStatus) -> bool {
    matches!(status, JobStatus::Failed | JobStatus::Cancelled)
}
