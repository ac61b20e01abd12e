// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failover policy (§4.3): per-(backend, fingerprint) failure bookkeeping
//! that decides whether a backend should be skipped for a given workflow.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wdp_core::BackendId;
use wdp_error::BlockBackend;

/// Sentinel `blockedUntil` for a permanent block (§4.3: "store as
/// `blockedUntil = +∞` sentinel").
pub const PERMANENT_BLOCK: i64 = i64::MAX;

/// Tunable parameters for [`FailoverPolicy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    /// How long, in milliseconds, a temporary block lasts once triggered.
    pub cooldown_ms: i64,
    /// Number of recorded failures for a (backend, fingerprint) pair
    /// before a temporary block is applied.
    pub max_failures_before_block: u32,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 60_000,
            max_failures_before_block: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BlockEntry {
    failure_count: u32,
    blocked_until_ms: Option<i64>,
}

/// Per-(backend, fingerprint) failure and block bookkeeping.
///
/// Invariant: a (backend, fingerprint) pair is either absent (implicitly
/// healthy) or present with `blockedUntil` set to an explicit expiry —
/// there is no "cooling down but still usable" state visible to
/// [`FailoverPolicy::should_skip`].
pub struct FailoverPolicy {
    config: FailoverConfig,
    entries: HashMap<(BackendId, String), BlockEntry>,
}

impl FailoverPolicy {
    /// Construct a policy with the given parameters.
    #[must_use]
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    /// `true` iff `backend_id` is currently blocked for `fingerprint`.
    /// Expired temporary blocks are removed from the map as a side
    /// effect, per §4.3's "expired entries are lazily cleared".
    pub fn should_skip(&mut self, backend_id: &BackendId, fingerprint: &str, now_ms: i64) -> bool {
        let key = (backend_id.clone(), fingerprint.to_string());
        match self.entries.get(&key).and_then(|e| e.blocked_until_ms) {
            Some(until) if until > now_ms => true,
            Some(_) => {
                self.entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Record a classified failure for `(backend_id, fingerprint)`.
    ///
    /// Increments the failure count; applies a temporary block once the
    /// count reaches `maxFailuresBeforeBlock`, or an immediate permanent
    /// block if `classification` demands one, regardless of count.
    pub fn record_failure(
        &mut self,
        backend_id: &BackendId,
        fingerprint: &str,
        block: BlockBackend,
        now_ms: i64,
    ) {
        let key = (backend_id.clone(), fingerprint.to_string());
        let entry = self.entries.entry(key).or_default();
        entry.failure_count += 1;

        if block == BlockBackend::Permanent {
            entry.blocked_until_ms = Some(PERMANENT_BLOCK);
            tracing::warn!(%backend_id, fingerprint, "backend permanently blocked for fingerprint");
        } else if entry.failure_count >= self.config.max_failures_before_block {
            entry.blocked_until_ms = Some(now_ms + self.config.cooldown_ms);
            tracing::warn!(
                %backend_id,
                fingerprint,
                cooldown_ms = self.config.cooldown_ms,
                "backend temporarily blocked for fingerprint"
            );
        }
    }

    /// Erase the entry for `(backend_id, fingerprint)`, restoring the
    /// backend to healthy for that fingerprint. Returns `true` if a block
    /// (not merely an unblocked failure count) was actually cleared.
    pub fn record_success(&mut self, backend_id: &BackendId, fingerprint: &str) -> bool {
        self.entries
            .remove(&(backend_id.clone(), fingerprint.to_string()))
            .is_some_and(|e| e.blocked_until_ms.is_some())
    }

    /// Erase every entry for `fingerprint`, across all backends. An admin
    /// action; not driven by backend events. Returns the backends that had
    /// an actual block (not just a failure count) cleared.
    pub fn reset_for_fingerprint(&mut self, fingerprint: &str) -> Vec<BackendId> {
        let cleared: Vec<BackendId> = self
            .entries
            .iter()
            .filter(|((_, fp), e)| fp == fingerprint && e.blocked_until_ms.is_some())
            .map(|((backend_id, _), _)| backend_id.clone())
            .collect();
        self.entries.retain(|(_, fp), _| fp != fingerprint);
        cleared
    }

    /// The expiry instant for a specific `(backend_id, fingerprint)` block,
    /// if one is currently recorded.
    #[must_use]
    pub fn blocked_until_ms(&self, backend_id: &BackendId, fingerprint: &str) -> Option<i64> {
        self.entries
            .get(&(backend_id.clone(), fingerprint.to_string()))
            .and_then(|e| e.blocked_until_ms)
    }

    /// The nearest upcoming temporary-block expiry, excluding permanent
    /// blocks. Drives the dispatcher's failover-expiry wakeup source: it
    /// sleeps until this instant rather than polling.
    #[must_use]
    pub fn next_expiry_ms(&self) -> Option<i64> {
        self.entries
            .values()
            .filter_map(|e| e.blocked_until_ms)
            .filter(|&until| until < PERMANENT_BLOCK)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(name: &str) -> BackendId {
        BackendId::from(name)
    }

    #[test]
    fn healthy_backend_is_never_skipped() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        assert!(!p.should_skip(&backend("gpu-1"), "fp1", 0));
    }

    #[test]
    fn default_config_blocks_after_one_failure() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 0);
        assert!(p.should_skip(&backend("gpu-1"), "fp1", 0));
    }

    #[test]
    fn temporary_block_expires_after_cooldown() {
        let mut p = FailoverPolicy::new(FailoverConfig {
            cooldown_ms: 1000,
            max_failures_before_block: 1,
        });
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 0);
        assert!(p.should_skip(&backend("gpu-1"), "fp1", 999));
        assert!(!p.should_skip(&backend("gpu-1"), "fp1", 1000));
    }

    #[test]
    fn expired_entry_is_lazily_cleared_and_count_resets() {
        let mut p = FailoverPolicy::new(FailoverConfig {
            cooldown_ms: 1000,
            max_failures_before_block: 2,
        });
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 0);
        // First failure only increments count; threshold is 2.
        assert!(!p.should_skip(&backend("gpu-1"), "fp1", 0));
    }

    #[test]
    fn permanent_block_never_expires() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Permanent, 0);
        assert!(p.should_skip(&backend("gpu-1"), "fp1", i64::MAX - 1));
    }

    #[test]
    fn record_success_clears_the_entry() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 0);
        assert!(p.should_skip(&backend("gpu-1"), "fp1", 0));
        p.record_success(&backend("gpu-1"), "fp1");
        assert!(!p.should_skip(&backend("gpu-1"), "fp1", 0));
    }

    #[test]
    fn reset_for_fingerprint_clears_across_all_backends() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Permanent, 0);
        p.record_failure(&backend("gpu-2"), "fp1", BlockBackend::Permanent, 0);
        p.record_failure(&backend("gpu-1"), "fp2", BlockBackend::Permanent, 0);

        p.reset_for_fingerprint("fp1");

        assert!(!p.should_skip(&backend("gpu-1"), "fp1", 0));
        assert!(!p.should_skip(&backend("gpu-2"), "fp1", 0));
        assert!(p.should_skip(&backend("gpu-1"), "fp2", 0));
    }

    #[test]
    fn record_success_reports_whether_a_block_was_cleared() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        // Only one failure recorded; threshold is the default of 1, so it blocks.
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 0);
        assert!(p.record_success(&backend("gpu-1"), "fp1"));
        // No entry at all: nothing to clear.
        assert!(!p.record_success(&backend("gpu-1"), "fp1"));
    }

    #[test]
    fn reset_for_fingerprint_reports_cleared_backends() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Permanent, 0);
        p.record_failure(&backend("gpu-2"), "fp1", BlockBackend::Permanent, 0);
        let mut cleared = p.reset_for_fingerprint("fp1");
        cleared.sort();
        assert_eq!(cleared, vec![backend("gpu-1"), backend("gpu-2")]);
    }

    #[test]
    fn blocked_until_ms_reports_the_recorded_expiry() {
        let mut p = FailoverPolicy::new(FailoverConfig {
            cooldown_ms: 1000,
            max_failures_before_block: 1,
        });
        assert_eq!(p.blocked_until_ms(&backend("gpu-1"), "fp1"), None);
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Temporary, 500);
        assert_eq!(p.blocked_until_ms(&backend("gpu-1"), "fp1"), Some(1500));
    }

    #[test]
    fn next_expiry_ignores_permanent_blocks() {
        let mut p = FailoverPolicy::new(FailoverConfig {
            cooldown_ms: 1000,
            max_failures_before_block: 1,
        });
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Permanent, 0);
        assert_eq!(p.next_expiry_ms(), None);
        p.record_failure(&backend("gpu-2"), "fp2", BlockBackend::Temporary, 500);
        assert_eq!(p.next_expiry_ms(), Some(1500));
    }

    #[test]
    fn blocks_are_independent_per_fingerprint() {
        let mut p = FailoverPolicy::new(FailoverConfig::default());
        p.record_failure(&backend("gpu-1"), "fp1", BlockBackend::Permanent, 0);
        assert!(p.should_skip(&backend("gpu-1"), "fp1", 0));
        assert!(!p.should_skip(&backend("gpu-1"), "fp2", 0));
    }
}
