// SPDX-License-Identifier: MIT OR Apache-2.0
//! The failure classifier (§4.2): the only place raw backend error codes
//! and messages are interpreted.

use serde::{Deserialize, Serialize};

/// What the classifier thinks went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureType {
    /// The caller-submitted workflow graph is structurally invalid.
    WorkflowInvalid,
    /// The backend lacks a resource the workflow requires (checkpoint,
    /// LoRA, node type, ...).
    BackendIncompatible,
    /// A transport, server, or resource-exhaustion fault expected to
    /// clear on its own.
    Transient,
    /// None of the above signals matched.
    Unknown,
}

/// What the failover policy should do about the backend that produced
/// this failure, for the fingerprint in question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockBackend {
    /// No block; the backend remains eligible.
    None,
    /// Block until `cooldownMs` elapses.
    Temporary,
    /// Block until an explicit `resetForFingerprint` admin action.
    Permanent,
}

/// The classifier's verdict for one backend error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// The failure family.
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    /// Whether the job should be retried (on another backend, if blocked).
    pub retryable: bool,
    /// What the failover policy should record.
    pub block_backend: BlockBackend,
    /// Human-readable rationale, for logs and `job.lastError`.
    pub reason: String,
}

/// The raw signal a Backend Client capability reports on failure. The
/// classifier is the only consumer that inspects these fields directly;
/// everything downstream of [`classify`] works from [`Classification`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendErrorSignal {
    /// Backend-reported error code, e.g. `"value_not_in_list"`.
    pub code: Option<String>,
    /// Free-text error/exception message.
    pub message: Option<String>,
    /// HTTP status code, if the failure came over HTTP.
    pub http_status: Option<u16>,
    /// Set when the failure is a connection/transport fault rather than
    /// an application-level response.
    pub is_transport_error: bool,
    /// Set when the caller itself detected a schema fault (e.g. a
    /// missing node reference) before ever reaching the backend.
    pub caller_detected_schema_fault: bool,
}

const BACKEND_INCOMPATIBLE_CODES: &[&str] = &[
    "value_not_in_list",
    "missing_choice",
    "missing_checkpoint",
    "missing_model",
    "missing_file",
    "unknown_model",
    "unknown_checkpoint",
    "node_missing",
    "lora_missing",
];

const BACKEND_INCOMPATIBLE_PHRASES: &[&str] = &[
    "not found",
    "no module named",
    "failed to load model",
    "failed to load checkpoint",
    "no such file",
];

const WORKFLOW_INVALID_CODES: &[&str] = &[
    "workflow_invalid",
    "invalid_node_reference",
    "invalid_workflow",
    "missing_input",
    "invalid_prompt",
];

const WORKFLOW_INVALID_PHRASES: &[&str] = &[
    "invalid workflow",
    "invalid graph",
    "invalid node",
    "invalid prompt",
    "invalid input",
];

/// Classify a backend error signal per the decision table in §4.2. The
/// first matching rule wins.
#[must_use]
pub fn classify(signal: &BackendErrorSignal) -> Classification {
    let code = signal.code.as_deref().unwrap_or_default();
    let message_lower = signal
        .message
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();

    if signal.caller_detected_schema_fault {
        return Classification {
            failure_type: FailureType::WorkflowInvalid,
            retryable: false,
            block_backend: BlockBackend::None,
            reason: "caller-detected schema fault".into(),
        };
    }

    if BACKEND_INCOMPATIBLE_CODES.contains(&code)
        || BACKEND_INCOMPATIBLE_PHRASES
            .iter()
            .any(|p| message_lower.contains(p))
    {
        return Classification {
            failure_type: FailureType::BackendIncompatible,
            retryable: true,
            block_backend: BlockBackend::Permanent,
            reason: format!("backend incompatible: code={code:?} message={message_lower:?}"),
        };
    }

    if WORKFLOW_INVALID_CODES.contains(&code)
        || WORKFLOW_INVALID_PHRASES
            .iter()
            .any(|p| message_lower.contains(p))
    {
        return Classification {
            failure_type: FailureType::WorkflowInvalid,
            retryable: false,
            block_backend: BlockBackend::None,
            reason: format!("workflow invalid: code={code:?}"),
        };
    }

    if let Some(status) = signal.http_status {
        if status >= 500 {
            return Classification {
                failure_type: FailureType::Transient,
                retryable: true,
                block_backend: BlockBackend::Temporary,
                reason: format!("server error: HTTP {status}"),
            };
        }
        if status == 429 {
            return Classification {
                failure_type: FailureType::Transient,
                retryable: true,
                block_backend: BlockBackend::Temporary,
                reason: "rate limited: HTTP 429".into(),
            };
        }
    }

    if signal.is_transport_error {
        return Classification {
            failure_type: FailureType::Transient,
            retryable: true,
            block_backend: BlockBackend::Temporary,
            reason: "connection/transport error".into(),
        };
    }

    if message_lower.contains("out of memory") {
        return Classification {
            failure_type: FailureType::Transient,
            retryable: true,
            block_backend: BlockBackend::Temporary,
            reason: "out of memory".into(),
        };
    }

    Classification {
        failure_type: FailureType::Unknown,
        retryable: true,
        block_backend: BlockBackend::Temporary,
        reason: "unclassified error".into(),
    }
}
