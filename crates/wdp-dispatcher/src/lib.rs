// SPDX-License-Identifier: MIT OR Apache-2.0
//! wdp-dispatcher
//!
//! The dispatcher: the event-driven scheduling loop of the Workflow
//! Dispatch Pool.
//!
//! Responsibilities:
//! - own job-state transitions from `queued` through a terminal state
//! - reserve jobs from the priority queue and pick an eligible backend
//! - submit to backends, forward their event streams, and re-publish a
//!   unified event timeline
//! - drive retry, failover cooldown, and execution-start-timeout policy

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Broadcast-based event bus for decoupled event distribution.
pub mod bus;
/// Cancellation primitive for per-attempt timers.
pub mod cancel;
/// The dispatcher's scheduling loop and public API.
pub mod dispatcher;
/// Adapts `wdp_core::Job` to `wdp_queue::QueuedPayload`.
pub mod queue_job;
/// In-memory job record store.
pub mod store;

pub use bus::{EventBus, EventBusStats, EventSubscription};
pub use cancel::CancellationToken;
pub use dispatcher::{BackendStat, Dispatcher, DispatcherConfig, DispatcherStats};
pub use queue_job::QueueJob;
pub use store::JobStore;
