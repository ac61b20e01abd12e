// SPDX-License-Identifier: MIT OR Apache-2.0
//! The job store (§5 Concurrency & Resource Model): the single owner of
//! `Job` records. Mutated only by the dispatcher's scheduling loop; read
//! by `status()` and the event bus snapshot API via copy-on-read.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use wdp_core::{Job, JobId};

/// In-memory table of every job the dispatcher knows about, keyed by id.
/// Terminal jobs are retained for the lifetime of the dispatcher so
/// `status()` remains answerable after completion; nothing currently
/// evicts them.
#[derive(Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly-enqueued job.
    pub fn insert(&self, job: Job) {
        self.jobs.lock().expect("job store poisoned").insert(job.id, job);
    }

    /// Copy-on-read snapshot of one job.
    #[must_use]
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().expect("job store poisoned").get(&id).cloned()
    }

    /// Mutate a job in place via `f`, returning its id's lookup result.
    /// Returns `false` if `id` is not known.
    pub fn update(&self, id: JobId, f: impl FnOnce(&mut Job)) -> bool {
        let mut guard = self.jobs.lock().expect("job store poisoned");
        match guard.get_mut(&id) {
            Some(job) => {
                f(job);
                true
            }
            None => false,
        }
    }

    /// Remove a job from the store entirely (used when a queued job is
    /// cancelled and dropped rather than retained as a terminal record).
    pub fn remove(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().expect("job store poisoned").remove(&id)
    }

    /// Drop terminal jobs whose `completed_at` is older than `ttl` relative
    /// to `now` (§11 job TTL sweep). Not driven by a background timer;
    /// callers invoke this explicitly. Returns how many jobs were dropped.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let mut guard = self.jobs.lock().expect("job store poisoned");
        let expired: Vec<JobId> = guard
            .values()
            .filter(|j| {
                j.status.is_terminal()
                    && j.completed_at.is_some_and(|at| now - at >= ttl)
            })
            .map(|j| j.id)
            .collect();
        for id in &expired {
            guard.remove(id);
        }
        expired.len()
    }
}
