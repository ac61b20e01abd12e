//! Unified error taxonomy and failure classifier for the Workflow Dispatch
//! Pool.
//!
//! Every [`DispatchError`] carries an [`ErrorCode`] (a stable,
//! machine-readable tag), a human-readable message, an optional cause
//! chain, and arbitrary key-value context. [`classify`] is the *only*
//! place raw backend error strings/codes are interpreted (§4.2) — every
//! other component branches on [`Classification`], never on
//! [`BackendErrorSignal`] directly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The failure classifier: maps a raw backend error signal to a
/// [`Classification`] per the decision table in §4.2.
pub mod classify;

pub use classify::{BackendErrorSignal, BlockBackend, Classification, FailureType, classify};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serializes to a `SCREAMING_SNAKE_CASE` string guaranteed
/// not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Requested backend name is not registered.
    BackendNotFound,
    /// No backend in the candidate set could be selected (§7).
    NoEligibleBackend,
    /// The queue rejected an operation (duplicate id, capacity, etc).
    QueueInvalidOperation,
    /// A reservation id did not resolve to an in-flight entry.
    ReservationNotFound,
    /// `cancel` was called on a job already in a terminal state.
    InvalidState,
    /// Configuration file or value is invalid.
    ConfigInvalid,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Stable `&'static str` representation, e.g. `"BACKEND_NOT_FOUND"`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BackendNotFound => "BACKEND_NOT_FOUND",
            Self::NoEligibleBackend => "NO_ELIGIBLE_BACKEND",
            Self::QueueInvalidOperation => "QUEUE_INVALID_OPERATION",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DispatchError
// ---------------------------------------------------------------------------

/// Unified dispatch-pool error.
///
/// # Examples
///
/// ```
/// use wdp_error::{DispatchError, ErrorCode};
///
/// let err = DispatchError::new(ErrorCode::BackendNotFound, "no backend named 'gpu-9'")
///     .with_context("backend_id", "gpu-9");
/// assert_eq!(err.code, ErrorCode::BackendNotFound);
/// ```
pub struct DispatchError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl DispatchError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if
    /// serialization fails, the entry is silently skipped.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Debug for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("DispatchError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}
