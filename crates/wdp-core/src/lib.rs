// SPDX-License-Identifier: MIT OR Apache-2.0
//! wdp-core
//!
//! Stable contract types shared by every other crate in the workspace:
//! the opaque [`Workflow`] graph, the [`Job`] record that tracks one
//! submission through its lifecycle, and the [`Event`] envelope published
//! on the dispatcher's event bus.
//!
//! This crate does not interpret workflow *semantics*. It only reads
//! `inputs.ckpt_name`-shaped fields for checkpoint-key extraction
//! (see [`workflow::checkpoint_key`]) and serializes the graph for
//! fingerprinting (see the `wdp-fingerprint` crate, which depends on
//! this one).
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Typed event envelope published on the dispatcher's event bus.
pub mod event;
/// Job record and lifecycle types.
pub mod job;
/// Opaque workflow graph type and node accessors.
pub mod workflow;

pub use event::{Event, EventKind};
pub use job::{Attachment, EnqueueOptions, Job, JobId, JobStatus};
pub use workflow::{BackendId, Workflow};

/// Checkpoint key used when a workflow references no identifiable model.
pub const DEFAULT_CHECKPOINT_KEY: &str = "default";

/// Candidate input field names scanned (in order) when deriving a
/// workflow's checkpoint key. See [`workflow::checkpoint_key`].
pub const CHECKPOINT_INPUT_FIELDS: &[&str] = &["ckpt_name", "checkpoint_name", "model_name"];
