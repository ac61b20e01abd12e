// SPDX-License-Identifier: MIT OR Apache-2.0
//! Adapts `wdp_core::Job` to `wdp_queue::QueuedPayload`.
//!
//! `wdp-queue` is deliberately domain-agnostic (it never depends on
//! `wdp-core`), so the trait can't be implemented for `Job` directly from
//! here without running afoul of the orphan rule. `QueueJob` is a local
//! newtype that closes the gap.

use wdp_core::{Job, JobId};
use wdp_queue::QueuedPayload;

/// Thin wrapper making a [`Job`] queueable.
#[derive(Debug, Clone)]
pub struct QueueJob(pub Job);

impl QueuedPayload for QueueJob {
    type Id = JobId;

    fn id(&self) -> JobId {
        self.0.id
    }
}

impl From<Job> for QueueJob {
    fn from(job: Job) -> Self {
        Self(job)
    }
}

impl From<QueueJob> for Job {
    fn from(wrapped: QueueJob) -> Self {
        wrapped.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wdp_core::{EnqueueOptions, Workflow};

    #[test]
    fn id_delegates_to_inner_job() {
        let wf = Workflow::from_value(json!({"A": {"class_type": "X", "inputs": {}}})).unwrap();
        let job = Job::new(wf, "fp".into(), EnqueueOptions::default());
        let id = job.id;
        let wrapped = QueueJob(job);
        assert_eq!(wrapped.id(), id);
    }
}
