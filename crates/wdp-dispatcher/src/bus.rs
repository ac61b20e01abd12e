// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast-based event bus for distributing [`Event`]s to subscribers
//! (§6 Event bus), with built-in publish/drop statistics.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use wdp_core::Event;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_events: AtomicU64,
}

/// Broadcast-based event bus. Publish order is preserved per-subscriber;
/// §5 requires that, for any single job, all of its events arrive in
/// emission order, which a single `broadcast::Sender` guarantees.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a new event bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with the given channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Publish an event to all current subscribers. If none are
    /// listening, the event is dropped and counted.
    pub fn publish(&self, event: Event) {
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(event).is_err() {
            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Snapshot of bus statistics.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            active_subscribers: self.tx.receiver_count(),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle for receiving events from an [`EventBus`].
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    stats: Arc<StatsInner>,
}

impl EventSubscription {
    /// Receive the next event, waiting asynchronously. Returns `None`
    /// once the bus is dropped. A lagged subscriber skips forward and
    /// its loss is counted in [`EventBusStats::dropped_events`], rather
    /// than returned as an error — subscribers that need every event
    /// must keep up or use a larger channel capacity.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_events.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Snapshot of event bus statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBusStats {
    /// Total number of events published to the bus.
    pub total_published: u64,
    /// Number of subscribers currently listening.
    pub active_subscribers: usize,
    /// Events lost because no subscribers were listening, or a
    /// subscriber lagged.
    pub dropped_events: u64,
}
