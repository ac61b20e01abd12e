#![deny(unsafe_code)]
#![warn(missing_docs)]
//! The backend registry (§4.6): tracks backend lifecycle state, approximate
//! load counters, declared workflow affinity, and picks the best candidate
//! backend for a job.

use std::collections::{BTreeMap, BTreeSet};

use wdp_core::{BackendId, Job};
use wdp_failover::FailoverPolicy;

/// Lifecycle state of a registered backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// `connect` has not yet succeeded.
    Connecting,
    /// Connected and eligible for dispatch.
    Ready,
    /// Transport was lost; not eligible for dispatch until reconnected.
    Disconnected,
}

/// A registered backend's tracked state.
#[derive(Debug, Clone)]
pub struct BackendRecord {
    /// The backend's id.
    pub id: BackendId,
    /// Current lifecycle state.
    pub state: BackendState,
    /// Approximate count of jobs this backend is currently running.
    pub running: u64,
    /// Approximate count of jobs queued on the backend itself (distinct
    /// from the pool's own queue), reconciled via `queueSnapshot`.
    pub queued: u64,
    /// User-declared scheduling priority; ties break lexicographically.
    pub priority: i64,
    /// If non-empty, this backend is only considered for jobs whose
    /// fingerprint is in this set (§4.6 `declareAffinity`).
    pub workflow_affinity: BTreeSet<String>,
    /// Checkpoints this backend currently has loaded/resident, as
    /// reported by its adapter. Opaque to the core beyond set membership.
    pub resident_checkpoints: BTreeSet<String>,
}

impl BackendRecord {
    fn new(id: BackendId, priority: i64) -> Self {
        Self {
            id,
            state: BackendState::Connecting,
            running: 0,
            queued: 0,
            priority,
            workflow_affinity: BTreeSet::new(),
            resident_checkpoints: BTreeSet::new(),
        }
    }

    /// `true` if this backend is neither running nor queued anything.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.running == 0 && self.queued == 0
    }
}

/// The set of registered backends and their state.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendId, BackendRecord>,
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend with the given scheduling priority. Starts in
    /// [`BackendState::Connecting`].
    pub fn register(&mut self, id: BackendId, priority: i64) {
        self.backends
            .entry(id.clone())
            .or_insert_with(|| BackendRecord::new(id, priority));
    }

    /// Transition a backend to a new lifecycle state.
    pub fn set_state(&mut self, id: &BackendId, state: BackendState) {
        if let Some(record) = self.backends.get_mut(id) {
            tracing::debug!(backend_id = %id, ?state, "backend state transition");
            record.state = state;
        }
    }

    /// Replace the declared workflow affinity for a backend.
    pub fn declare_affinity(&mut self, id: &BackendId, fingerprints: BTreeSet<String>) {
        if let Some(record) = self.backends.get_mut(id) {
            record.workflow_affinity = fingerprints;
        }
    }

    /// Record the checkpoints a backend currently has resident.
    pub fn set_resident_checkpoints(&mut self, id: &BackendId, checkpoints: BTreeSet<String>) {
        if let Some(record) = self.backends.get_mut(id) {
            record.resident_checkpoints = checkpoints;
        }
    }

    /// A backend accepted a submission: bump its running counter.
    pub fn increment_running(&mut self, id: &BackendId) {
        if let Some(record) = self.backends.get_mut(id) {
            record.running += 1;
        }
    }

    /// A backend's job reached a terminal state: drop its running counter.
    pub fn decrement_running(&mut self, id: &BackendId) {
        if let Some(record) = self.backends.get_mut(id) {
            record.running = record.running.saturating_sub(1);
        }
    }

    /// Reconcile `running`/`queued` from a backend's `queueSnapshot`.
    pub fn reconcile(&mut self, id: &BackendId, running: u64, queued: u64) {
        if let Some(record) = self.backends.get_mut(id) {
            record.running = running;
            record.queued = queued;
        }
    }

    /// Look up a backend's record.
    #[must_use]
    pub fn get(&self, id: &BackendId) -> Option<&BackendRecord> {
        self.backends.get(id)
    }

    /// Ids of every backend currently `Ready` (§11 pool-level readiness).
    #[must_use]
    pub fn ready_backend_ids(&self) -> Vec<BackendId> {
        self.backends
            .values()
            .filter(|b| b.state == BackendState::Ready)
            .map(|b| b.id.clone())
            .collect()
    }

    /// Union of resident checkpoints across every backend currently
    /// [`BackendState::Ready`] — the `availableCheckpoints` the
    /// dispatcher passes into `reserve` (§4.7 step 1).
    #[must_use]
    pub fn ready_resident_checkpoints(&self) -> BTreeSet<String> {
        self.backends
            .values()
            .filter(|b| b.state == BackendState::Ready)
            .flat_map(|b| b.resident_checkpoints.iter().cloned())
            .collect()
    }

    /// Select the best backend for `job`, per §4.6's five-step selection
    /// algorithm. Returns `None` if no idle, eligible backend exists; the
    /// job then waits for the next wake.
    pub fn pick_backend_for(
        &self,
        job: &Job,
        failover: &mut FailoverPolicy,
        now_ms: i64,
    ) -> Option<BackendId> {
        let mut candidates: Vec<&BackendRecord> = self
            .backends
            .values()
            .filter(|b| b.state == BackendState::Ready)
            .filter(|b| !job.exclude_backend_ids.contains(&b.id))
            .collect();

        if !job.preferred_backend_ids.is_empty() {
            candidates.retain(|b| job.preferred_backend_ids.contains(&b.id));
        }

        // Affinity filters first, then failover: a backend outside the
        // job's declared affinity is never asked whether it is blocked.
        candidates.retain(|b| {
            b.workflow_affinity.is_empty() || b.workflow_affinity.contains(&job.fingerprint)
        });

        candidates.retain(|b| !failover.should_skip(&b.id, &job.fingerprint, now_ms));

        candidates
            .into_iter()
            .filter(|b| b.is_idle())
            .reduce(|best, candidate| {
                if candidate.priority > best.priority
                    || (candidate.priority == best.priority && candidate.id < best.id)
                {
                    candidate
                } else {
                    best
                }
            })
            .map(|b| b.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wdp_core::{EnqueueOptions, Workflow};
    use wdp_failover::FailoverConfig;

    fn sample_job(fingerprint: &str) -> Job {
        let wf = Workflow::from_value(json!({"A": {"class_type": "X", "inputs": {}}})).unwrap();
        Job::new(wf, fingerprint.to_string(), EnqueueOptions::default())
    }

    #[test]
    fn picks_none_when_no_backend_ready() {
        let mut reg = BackendRegistry::new();
        reg.register(BackendId::from("gpu-1"), 0);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert!(reg.pick_backend_for(&job, &mut failover, 0).is_none());
    }

    #[test]
    fn picks_ready_idle_backend() {
        let mut reg = BackendRegistry::new();
        let id = BackendId::from("gpu-1");
        reg.register(id.clone(), 0);
        reg.set_state(&id, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert_eq!(reg.pick_backend_for(&job, &mut failover, 0), Some(id));
    }

    #[test]
    fn busy_backend_is_never_picked() {
        let mut reg = BackendRegistry::new();
        let id = BackendId::from("gpu-1");
        reg.register(id.clone(), 0);
        reg.set_state(&id, BackendState::Ready);
        reg.increment_running(&id);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert!(reg.pick_backend_for(&job, &mut failover, 0).is_none());
    }

    #[test]
    fn higher_priority_idle_backend_wins() {
        let mut reg = BackendRegistry::new();
        let low = BackendId::from("gpu-low");
        let high = BackendId::from("gpu-high");
        reg.register(low.clone(), 0);
        reg.register(high.clone(), 5);
        reg.set_state(&low, BackendState::Ready);
        reg.set_state(&high, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert_eq!(reg.pick_backend_for(&job, &mut failover, 0), Some(high));
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut reg = BackendRegistry::new();
        let a = BackendId::from("gpu-a");
        let b = BackendId::from("gpu-b");
        reg.register(b.clone(), 3);
        reg.register(a.clone(), 3);
        reg.set_state(&a, BackendState::Ready);
        reg.set_state(&b, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert_eq!(reg.pick_backend_for(&job, &mut failover, 0), Some(a));
    }

    #[test]
    fn excluded_backend_is_never_picked() {
        let mut reg = BackendRegistry::new();
        let id = BackendId::from("gpu-1");
        reg.register(id.clone(), 0);
        reg.set_state(&id, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let mut job = sample_job("fp1");
        job.exclude_backend_ids.insert(id);
        assert!(reg.pick_backend_for(&job, &mut failover, 0).is_none());
    }

    #[test]
    fn blocked_backend_is_skipped() {
        let mut reg = BackendRegistry::new();
        let id = BackendId::from("gpu-1");
        reg.register(id.clone(), 0);
        reg.set_state(&id, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        failover.record_failure(&id, "fp1", wdp_error::BlockBackend::Permanent, 0);
        let job = sample_job("fp1");
        assert!(reg.pick_backend_for(&job, &mut failover, 0).is_none());
    }

    #[test]
    fn affinity_restricts_to_declared_fingerprints() {
        let mut reg = BackendRegistry::new();
        let id = BackendId::from("gpu-1");
        reg.register(id.clone(), 0);
        reg.set_state(&id, BackendState::Ready);
        reg.declare_affinity(&id, BTreeSet::from(["other-fp".to_string()]));
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let job = sample_job("fp1");
        assert!(reg.pick_backend_for(&job, &mut failover, 0).is_none());
    }

    #[test]
    fn preferred_backend_ids_restrict_candidates() {
        let mut reg = BackendRegistry::new();
        let a = BackendId::from("gpu-a");
        let b = BackendId::from("gpu-b");
        reg.register(a.clone(), 10);
        reg.register(b.clone(), 0);
        reg.set_state(&a, BackendState::Ready);
        reg.set_state(&b, BackendState::Ready);
        let mut failover = FailoverPolicy::new(FailoverConfig::default());
        let mut job = sample_job("fp1");
        job.preferred_backend_ids.insert(b.clone());
        assert_eq!(reg.pick_backend_for(&job, &mut failover, 0), Some(b));
    }

    #[test]
    fn ready_backend_ids_excludes_non_ready() {
        let mut reg = BackendRegistry::new();
        let a = BackendId::from("gpu-a");
        let b = BackendId::from("gpu-b");
        reg.register(a.clone(), 0);
        reg.register(b.clone(), 0);
        reg.set_state(&a, BackendState::Ready);
        assert_eq!(reg.ready_backend_ids(), vec![a]);
    }
}
