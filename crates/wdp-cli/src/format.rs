// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output formatting utilities for the Workflow Dispatch Pool CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use wdp_core::{Event, EventKind, Job, JobStatus};

/// Supported output formats for CLI display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Compact JSON (single line).
    Json,
    /// Pretty-printed JSON.
    JsonPretty,
    /// Human-readable multi-line text.
    Text,
    /// Single-line summary.
    Compact,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Json => "json",
            Self::JsonPretty => "json-pretty",
            Self::Text => "text",
            Self::Compact => "compact",
        };
        f.write_str(s)
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "json-pretty" | "json_pretty" | "jsonpretty" => Ok(Self::JsonPretty),
            "text" => Ok(Self::Text),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Formats pool types for CLI output.
#[derive(Debug, Clone)]
pub struct Formatter {
    format: OutputFormat,
}

impl Formatter {
    /// Create a new formatter with the given output format.
    #[must_use]
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Format a finished [`Job`] according to the configured output format.
    #[must_use]
    pub fn format_job(&self, job: &Job) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(job).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(job).unwrap_or_default(),
            OutputFormat::Text => format_job_text(job),
            OutputFormat::Compact => format_job_compact(job),
        }
    }

    /// Format an [`Event`] according to the configured output format.
    #[must_use]
    pub fn format_event(&self, event: &Event) -> String {
        match &self.format {
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(event).unwrap_or_default(),
            OutputFormat::Text => format_event_text(event),
            OutputFormat::Compact => format_event_compact(event),
        }
    }

    /// Format an error message according to the configured output format.
    #[must_use]
    pub fn format_error(&self, err: &str) -> String {
        match &self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => {
                serde_json::json!({"error": err}).to_string()
            }
            OutputFormat::Text => format!("Error: {err}"),
            OutputFormat::Compact => format!("[error] {err}"),
        }
    }
}

fn status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

fn format_job_text(job: &Job) -> String {
    format!(
        "Job:        {}\nStatus:     {}\nFingerprint: {}\nAttempts:   {}\nBackend:    {}",
        job.id,
        status_str(job.status),
        job.fingerprint,
        job.attempts,
        job.backend_id.as_ref().map(ToString::to_string).unwrap_or_else(|| "<none>".into()),
    )
}

fn format_job_compact(job: &Job) -> String {
    format!("[{}] {} attempts={}", status_str(job.status), job.id, job.attempts)
}

fn event_brief(kind: &EventKind) -> String {
    match kind {
        EventKind::JobQueued { job } => format!("job {} queued", job.id),
        EventKind::JobStarted { job, backend_id } => format!("job {} started on {backend_id}", job.id),
        EventKind::JobProgress { job_id, value, max, .. } => format!("job {job_id} progress {value}/{max}"),
        EventKind::JobPreview { job_id, .. } => format!("job {job_id} preview frame"),
        EventKind::JobNodeExecuted { job_id, node_id, .. } => format!("job {job_id} node {node_id} executed"),
        EventKind::JobCompleted { job } => format!("job {} completed", job.id),
        EventKind::JobFailed { job, will_retry, .. } => {
            format!("job {} failed (retry={will_retry})", job.id)
        }
        EventKind::JobRetrying { job, delay_ms } => format!("job {} retrying in {delay_ms}ms", job.id),
        EventKind::JobCancelled { job } => format!("job {} cancelled", job.id),
        EventKind::BackendState { backend_id, state } => format!("backend {backend_id} -> {state}"),
        EventKind::BackendBlockedFingerprint { backend_id, fingerprint, .. } => {
            format!("backend {backend_id} blocked for {fingerprint}")
        }
        EventKind::BackendUnblockedFingerprint { backend_id, fingerprint } => {
            format!("backend {backend_id} unblocked for {fingerprint}")
        }
        EventKind::PoolReady { backend_ids } => format!("pool ready ({} backends)", backend_ids.len()),
    }
}

fn format_event_text(ev: &Event) -> String {
    let ts = ev.ts.format("%H:%M:%S%.3f");
    format!("[{ts}] {}: {}", ev.name(), event_brief(&ev.kind))
}

fn format_event_compact(ev: &Event) -> String {
    format!("[{}] {}", ev.name(), event_brief(&ev.kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_format_display_roundtrips() {
        for fmt in &[
            OutputFormat::Json,
            OutputFormat::JsonPretty,
            OutputFormat::Text,
            OutputFormat::Compact,
        ] {
            let s = fmt.to_string();
            let parsed: OutputFormat = s.parse().unwrap();
            assert_eq!(&parsed, fmt);
        }
    }

    #[test]
    fn output_format_from_str_rejects_unknown() {
        assert!("nope".parse::<OutputFormat>().is_err());
    }

    fn sample_job() -> Job {
        let wf = wdp_core::Workflow::from_value(serde_json::json!({"A": {"class_type": "X", "inputs": {}}})).unwrap();
        Job::new(wf, "fp".into(), wdp_core::EnqueueOptions::default())
    }

    #[test]
    fn format_job_text_includes_status() {
        let job = sample_job();
        let f = Formatter::new(OutputFormat::Text);
        assert!(f.format_job(&job).contains("queued"));
    }

    #[test]
    fn format_job_compact_includes_id() {
        let job = sample_job();
        let f = Formatter::new(OutputFormat::Compact);
        let out = f.format_job(&job);
        assert!(out.contains(&job.id.to_string()));
    }

    #[test]
    fn format_job_json_round_trips() {
        let job = sample_job();
        let f = Formatter::new(OutputFormat::Json);
        let out = f.format_job(&job);
        let back: Job = serde_json::from_str(&out).unwrap();
        assert_eq!(back.id, job.id);
    }

    #[test]
    fn format_error_variants() {
        let f = Formatter::new(OutputFormat::Compact);
        assert_eq!(f.format_error("boom"), "[error] boom");
        let f = Formatter::new(OutputFormat::Text);
        assert_eq!(f.format_error("boom"), "Error: boom");
    }

    #[test]
    fn format_event_text_includes_name() {
        let ev = Event::now(EventKind::PoolReady { backend_ids: vec!["b1".into()] });
        let f = Formatter::new(OutputFormat::Text);
        assert!(f.format_event(&ev).contains("pool:ready"));
    }
}
