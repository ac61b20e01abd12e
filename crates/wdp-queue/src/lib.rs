// SPDX-License-Identifier: MIT OR Apache-2.0
//! Reservation-based priority queue (§4.4), partitioned into per-checkpoint
//! sub-queues.
//!
//! A [`JobQueue`] is generic over any payload implementing [`QueuedPayload`];
//! `wdp-core`'s `Job` is the payload used in production, but the queue
//! itself knows nothing about workflows, jobs, or dispatch. This mirrors
//! the "external adapter contract" in §4.4: any type satisfying the same
//! operations with equivalent ordering semantics is substitutable.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The checkpoint key used when a payload declares no checkpoint affinity.
pub const DEFAULT_SUBQUEUE: &str = "default";

/// A payload a [`JobQueue`] can hold. `Id` must be stable across retries
/// so the queue can dedupe in-flight supersession and track sequence
/// numbers per logical job.
pub trait QueuedPayload: Clone {
    /// Stable identity of this payload, independent of its queue position.
    type Id: Clone + Eq + Hash + Ord;

    /// This payload's identity.
    fn id(&self) -> Self::Id;
}

/// Opaque handle for an in-flight reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub Uuid);

impl ReservationId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A reservation handed out by [`JobQueue::reserve`]. Ownership belongs to
/// the caller until [`JobQueue::commit`], [`JobQueue::retry`], or
/// [`JobQueue::discard`] resolves it.
#[derive(Debug, Clone)]
pub struct Reservation<T> {
    /// Handle used to resolve this reservation.
    pub reservation_id: ReservationId,
    /// The reserved payload.
    pub payload: T,
    /// Attempt count at the time of this reservation (0 on first attempt).
    pub attempt: u32,
    /// The `availableAt` the payload carried when it was reserved.
    pub available_at_ms: i64,
}

/// Scheduling parameters for [`JobQueue::enqueue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Scheduling priority; higher dequeues first. Default `0`.
    pub priority: i64,
    /// Delay, in milliseconds from `now`, before this payload is eligible
    /// for reservation. Default `0`.
    pub delay_ms: u64,
}

/// Snapshot counts across every sub-queue (§4.4 `stats()`).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Entries with `availableAt <= now`, eligible for reservation.
    pub waiting: usize,
    /// Entries currently reserved and not yet committed/retried/discarded.
    pub in_flight: usize,
    /// Entries with `availableAt > now`, not yet eligible.
    pub delayed: usize,
    /// Entries moved to the dead-letter map by `discard`.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority_desc: Reverse<i64>,
    available_at_ms: i64,
    sequence_number: u64,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    payload: T,
    priority: i64,
    available_at_ms: i64,
    sequence_number: u64,
    attempts: u32,
}

impl<T> Entry<T> {
    fn order_key(&self) -> OrderKey {
        OrderKey {
            priority_desc: Reverse(self.priority),
            available_at_ms: self.available_at_ms,
            sequence_number: self.sequence_number,
        }
    }
}

struct InFlight<T> {
    checkpoint_key: String,
    entry: Entry<T>,
}

struct FailedEntry<T> {
    entry: Entry<T>,
    #[allow(dead_code)]
    reason: Option<String>,
}

/// Reservation-based priority queue, partitioned by checkpoint key.
///
/// Ordering within a sub-queue is the total order `(priority desc,
/// availableAt asc, sequenceNumber asc)`. `sequenceNumber` is assigned
/// once per logical job (on its first `enqueue`) and preserved across
/// `retry`, which is what lands retried jobs back in their original FIFO
/// position among equal-priority peers.
pub struct JobQueue<T: QueuedPayload> {
    subqueues: BTreeMap<String, BTreeMap<OrderKey, Entry<T>>>,
    in_flight: HashMap<ReservationId, InFlight<T>>,
    failed: HashMap<T::Id, FailedEntry<T>>,
    known_sequence: HashMap<T::Id, u64>,
    next_sequence: u64,
}

impl<T: QueuedPayload> Default for JobQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueuedPayload> JobQueue<T> {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subqueues: BTreeMap::new(),
            in_flight: HashMap::new(),
            failed: HashMap::new(),
            known_sequence: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Place `payload` in the sub-queue for `checkpoint_key`.
    ///
    /// If `payload.id()` is currently in flight, that reservation is
    /// dropped and superseded by this new entry (§4.4: "if a payload is
    /// re-enqueued while still in-flight, the in-flight entry is dropped
    /// and the new entry supersedes it").
    pub fn enqueue(
        &mut self,
        payload: T,
        checkpoint_key: impl Into<String>,
        opts: EnqueueOptions,
        now_ms: i64,
    ) {
        let id = payload.id();
        let superseded = self
            .in_flight
            .iter()
            .find(|(_, f)| f.entry.payload.id() == id)
            .map(|(rid, _)| *rid);
        if let Some(rid) = superseded {
            self.in_flight.remove(&rid);
            tracing::debug!(reservation_id = %rid, "in-flight reservation superseded by re-enqueue");
        }

        let sequence_number = if let Some(seq) = self.known_sequence.get(&id).copied() {
            seq
        } else {
            let seq = self.next_sequence;
            self.next_sequence += 1;
            self.known_sequence.insert(id, seq);
            seq
        };

        let checkpoint_key = checkpoint_key.into();
        let entry = Entry {
            payload,
            priority: opts.priority,
            available_at_ms: now_ms + opts.delay_ms as i64,
            sequence_number,
            attempts: 0,
        };
        self.subqueues
            .entry(checkpoint_key)
            .or_default()
            .insert(entry.order_key(), entry);
    }

    /// Reserve the globally-best eligible payload across the candidate
    /// sub-queues, or `None` if nothing is ready (§4.4 `reserve`).
    ///
    /// With `available_checkpoints = None`, every sub-queue is scanned.
    /// With `Some(set)`, only sub-queues named in `set` plus
    /// [`DEFAULT_SUBQUEUE`] are scanned.
    pub fn reserve(
        &mut self,
        available_checkpoints: Option<&BTreeSet<String>>,
        now_ms: i64,
    ) -> Option<Reservation<T>> {
        let candidate_keys: Vec<String> = match available_checkpoints {
            None => self.subqueues.keys().cloned().collect(),
            Some(set) => {
                let mut keys: BTreeSet<String> = set.clone();
                keys.insert(DEFAULT_SUBQUEUE.to_string());
                keys.into_iter()
                    .filter(|k| self.subqueues.contains_key(k))
                    .collect()
            }
        };

        let mut best: Option<(String, OrderKey)> = None;
        for key in &candidate_keys {
            let Some(sub) = self.subqueues.get(key) else {
                continue;
            };
            // Sub-queue iteration order already encodes (priority desc,
            // availableAt asc, sequenceNumber asc); the first entry whose
            // availableAt has elapsed is that sub-queue's best candidate.
            if let Some((order_key, _)) = sub.iter().find(|(_, e)| e.available_at_ms <= now_ms) {
                let better = best.as_ref().is_none_or(|(_, b)| order_key < b);
                if better {
                    best = Some((key.clone(), order_key.clone()));
                }
            }
        }

        let (key, order_key) = best?;
        let sub = self.subqueues.get_mut(&key)?;
        let entry = sub.remove(&order_key)?;
        if sub.is_empty() {
            self.subqueues.remove(&key);
        }

        let reservation_id = ReservationId::new();
        let reservation = Reservation {
            reservation_id,
            payload: entry.payload.clone(),
            attempt: entry.attempts,
            available_at_ms: entry.available_at_ms,
        };
        self.in_flight.insert(
            reservation_id,
            InFlight {
                checkpoint_key: key,
                entry,
            },
        );
        Some(reservation)
    }

    /// Resolve a reservation as successful. No-op (returns `false`) if the
    /// reservation id is unknown, already committed, retried, or discarded.
    pub fn commit(&mut self, reservation_id: ReservationId) -> bool {
        let Some(in_flight) = self.in_flight.remove(&reservation_id) else {
            return false;
        };
        self.known_sequence.remove(&in_flight.entry.payload.id());
        true
    }

    /// Resolve a reservation by re-inserting its payload into its original
    /// sub-queue with `attempts` incremented and `availableAt = now +
    /// delayMs`, preserving the original `sequenceNumber`. No-op (returns
    /// `false`) if the reservation id is unknown.
    pub fn retry(&mut self, reservation_id: ReservationId, delay_ms: u64, now_ms: i64) -> bool {
        let Some(in_flight) = self.in_flight.remove(&reservation_id) else {
            return false;
        };
        let mut entry = in_flight.entry;
        entry.attempts += 1;
        entry.available_at_ms = now_ms + delay_ms as i64;
        self.subqueues
            .entry(in_flight.checkpoint_key)
            .or_default()
            .insert(entry.order_key(), entry);
        true
    }

    /// Resolve a reservation by moving its payload to the dead-letter map.
    /// No-op (returns `false`) if the reservation id is unknown.
    pub fn discard(&mut self, reservation_id: ReservationId, reason: Option<String>) -> bool {
        let Some(in_flight) = self.in_flight.remove(&reservation_id) else {
            return false;
        };
        let id = in_flight.entry.payload.id();
        self.known_sequence.remove(&id);
        self.failed.insert(
            id,
            FailedEntry {
                entry: in_flight.entry,
                reason,
            },
        );
        true
    }

    /// Remove `id` from any sub-queue or the dead-letter map, returning the
    /// payload. Returns `None` without effect if `id` is currently
    /// in-flight (§4.4 `remove`: "returns false if job is in-flight").
    pub fn remove(&mut self, id: &T::Id) -> Option<T> {
        if self
            .in_flight
            .values()
            .any(|f| &f.entry.payload.id() == id)
        {
            return None;
        }

        for sub in self.subqueues.values_mut() {
            if let Some(key) = sub
                .iter()
                .find(|(_, e)| &e.payload.id() == id)
                .map(|(k, _)| k.clone())
            {
                let entry = sub.remove(&key).expect("key just found");
                self.known_sequence.remove(id);
                return Some(entry.payload);
            }
        }

        if let Some(failed) = self.failed.remove(id) {
            self.known_sequence.remove(id);
            return Some(failed.entry.payload);
        }

        None
    }

    /// Snapshot counts across every sub-queue, the in-flight map, and the
    /// dead-letter map.
    #[must_use]
    pub fn stats(&self, now_ms: i64) -> QueueStats {
        let mut waiting = 0;
        let mut delayed = 0;
        for sub in self.subqueues.values() {
            for entry in sub.values() {
                if entry.available_at_ms <= now_ms {
                    waiting += 1;
                } else {
                    delayed += 1;
                }
            }
        }
        QueueStats {
            waiting,
            in_flight: self.in_flight.len(),
            delayed,
            failed: self.failed.len(),
        }
    }

    /// Total number of payloads waiting or delayed (excludes in-flight and
    /// failed). Useful for quick emptiness checks without a timestamp.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subqueues.values().map(BTreeMap::len).sum()
    }

    /// `true` if no sub-queue holds a payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subqueues.values().all(BTreeMap::is_empty)
    }
}
