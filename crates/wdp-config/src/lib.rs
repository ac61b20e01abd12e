// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the Workflow Dispatch Pool.
//!
//! This crate provides [`PoolConfig`] — the top-level pool settings — together
//! with helpers for loading from TOML files, merging overlays, and producing
//! advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// Two configs could not be merged because of conflicting constraints.
    #[error("merge conflict: {reason}")]
    MergeConflict {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `cooldownMs` resolved to zero: a temporarily-blocked backend becomes
    /// eligible again on the very next scheduler tick.
    ZeroCooldown,
    /// `executionStartTimeoutMs` is unusually large, delaying detection of a
    /// stalled backend.
    LargeExecutionStartTimeout {
        /// The resolved timeout, in milliseconds.
        ms: u64,
    },
    /// No `[[backends]]` entries were declared; the pool has nothing to
    /// dispatch to until `register_backend` is called programmatically.
    NoBackendsConfigured,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ZeroCooldown => {
                write!(f, "cooldown_ms is zero: blocked backends unblock immediately")
            }
            ConfigWarning::LargeExecutionStartTimeout { ms } => {
                write!(f, "execution_start_timeout_ms is unusually large ({ms}ms)")
            }
            ConfigWarning::NoBackendsConfigured => {
                write!(f, "no backends configured: pool is idle until backends are registered")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level pool configuration for the Workflow Dispatch Pool.
///
/// Every tunable is `Option`-wrapped so a partially-specified overlay can be
/// [`merge`](Self::merge)d over a base without losing the distinction between
/// "unset" and "explicitly set to the default value". Callers read resolved
/// values through the `*_or_default`-style accessor methods.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PoolConfig {
    /// How long, in milliseconds, a temporary failover block lasts. Default 60 000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_ms: Option<i64>,

    /// Failures for a (backend, fingerprint) pair before a temporary block
    /// is applied. Default 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failures_before_block: Option<u32>,

    /// Maximum time between a successful submit and observing
    /// `executionStart` before the attempt is treated as stalled. Default 60 000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_start_timeout_ms: Option<u64>,

    /// Scheduling priority assigned to jobs enqueued without one. Default 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<i64>,

    /// Maximum attempts assigned to jobs enqueued without one. Default 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_max_attempts: Option<u32>,

    /// Retry delay, in milliseconds, assigned to jobs enqueued without one.
    /// Default 1000.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_retry_delay_ms: Option<u64>,

    /// Backends to seed a registry with at startup.
    #[serde(default)]
    pub backends: Vec<BackendConfigEntry>,
}

impl PoolConfig {
    /// Resolved `cooldown_ms`, applying the default if unset.
    #[must_use]
    pub fn cooldown_ms(&self) -> i64 {
        self.cooldown_ms.unwrap_or(60_000)
    }

    /// Resolved `max_failures_before_block`, applying the default if unset.
    #[must_use]
    pub fn max_failures_before_block(&self) -> u32 {
        self.max_failures_before_block.unwrap_or(1)
    }

    /// Resolved `execution_start_timeout_ms`, applying the default if unset.
    #[must_use]
    pub fn execution_start_timeout_ms(&self) -> u64 {
        self.execution_start_timeout_ms.unwrap_or(60_000)
    }

    /// Resolved `default_priority`, applying the default if unset.
    #[must_use]
    pub fn default_priority(&self) -> i64 {
        self.default_priority.unwrap_or(0)
    }

    /// Resolved `default_max_attempts`, applying the default if unset.
    #[must_use]
    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts.unwrap_or(3)
    }

    /// Resolved `default_retry_delay_ms`, applying the default if unset.
    #[must_use]
    pub fn default_retry_delay_ms(&self) -> u64 {
        self.default_retry_delay_ms.unwrap_or(1000)
    }

    /// Merge `overlay` over `self`. Scalar fields in `overlay` take
    /// precedence when set; `backends` lists are concatenated (the caller is
    /// responsible for resolving id collisions before registering them).
    #[must_use]
    pub fn merge(self, overlay: Self) -> Self {
        let mut backends = self.backends;
        backends.extend(overlay.backends);
        Self {
            cooldown_ms: overlay.cooldown_ms.or(self.cooldown_ms),
            max_failures_before_block: overlay
                .max_failures_before_block
                .or(self.max_failures_before_block),
            execution_start_timeout_ms: overlay
                .execution_start_timeout_ms
                .or(self.execution_start_timeout_ms),
            default_priority: overlay.default_priority.or(self.default_priority),
            default_max_attempts: overlay.default_max_attempts.or(self.default_max_attempts),
            default_retry_delay_ms: overlay
                .default_retry_delay_ms
                .or(self.default_retry_delay_ms),
            backends,
        }
    }
}

/// A backend to register at startup.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BackendConfigEntry {
    /// Unique backend id.
    pub id: String,
    /// Host the backend's adapter connects to (e.g. `http://gpu-1:8188`).
    pub host: String,
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Threshold above which `execution_start_timeout_ms` generates a warning
/// (10 minutes).
const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 600_000;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`PoolConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`PoolConfig::default()`].
pub fn load_config(path: Option<&Path>) -> Result<PoolConfig, ConfigError> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)
        }
        None => Ok(PoolConfig::default()),
    }
}

/// Parse a TOML string into a [`PoolConfig`].
pub fn parse_toml(content: &str) -> Result<PoolConfig, ConfigError> {
    toml::from_str::<PoolConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (negative cooldown, zero-valued thresholds that would make the
/// pool unable to make progress, duplicate or empty backend identifiers) are
/// returned as a [`ConfigError::ValidationError`]; soft issues come back as
/// warnings.
pub fn validate_config(config: &PoolConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if config.cooldown_ms() < 0 {
        errors.push(format!("cooldown_ms must not be negative, got {}", config.cooldown_ms()));
    } else if config.cooldown_ms() == 0 {
        warnings.push(ConfigWarning::ZeroCooldown);
    }

    if config.max_failures_before_block() == 0 {
        errors.push("max_failures_before_block must be at least 1".into());
    }

    if config.execution_start_timeout_ms() == 0 {
        errors.push("execution_start_timeout_ms must not be zero".into());
    } else if config.execution_start_timeout_ms() > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeExecutionStartTimeout {
            ms: config.execution_start_timeout_ms(),
        });
    }

    if config.default_max_attempts() == 0 {
        errors.push("default_max_attempts must be at least 1".into());
    }

    let mut seen_ids = std::collections::BTreeSet::new();
    for backend in &config.backends {
        if backend.id.trim().is_empty() {
            errors.push("backend id must not be empty".into());
        } else if !seen_ids.insert(backend.id.clone()) {
            errors.push(format!("duplicate backend id '{}'", backend.id));
        }
        if backend.host.trim().is_empty() {
            errors.push(format!("backend '{}': host must not be empty", backend.id));
        }
    }

    if config.backends.is_empty() {
        warnings.push(ConfigWarning::NoBackendsConfigured);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
