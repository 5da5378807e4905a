//! ==============================================================================
//! notify.rs - "tell me when the reading table changes"
//! ==============================================================================
//!
//! purpose:
//!     dashboards want to refetch when new readings land. the endpoint itself
//!     never depends on how that notification travels; it only sees the
//!     ChangeFeed capability.
//!
//! feeds:
//!     - BroadcastFeed: in-process fan-out, fed directly by MemoryStore
//!     - PollingFeed: works over any ReadingStore by comparing its change mark
//!       (newest id, row count) periodically; the history itself is never read
//!
//! lifecycle:
//!     subscribe() spawns a forwarding task and hands back a Subscription.
//!     dropping (or unsubscribing) the Subscription stops delivery.
//!
//! ==============================================================================

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::store::{ChangeMark, ReadingStore};

const BROADCAST_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeEvent {
    /// rows were appended, count known
    Inserted { count: usize },
    /// something changed, details unknown
    Changed,
}

pub type OnChange = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

pub trait ChangeFeed: Send + Sync {
    fn subscribe(&self, on_change: OnChange) -> Subscription;
}

/// handle to a live subscription
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ==============================================================================
// broadcast feed
// ==============================================================================

#[derive(Clone)]
pub struct BroadcastFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }
}

impl BroadcastFeed {
    pub fn publish(&self, event: ChangeEvent) {
        // no subscribers is not an error
        let _ = self.tx.send(event);
    }
}

impl ChangeFeed for BroadcastFeed {
    fn subscribe(&self, on_change: OnChange) -> Subscription {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => on_change(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("change feed lagged, coalescing {} events", skipped);
                        on_change(ChangeEvent::Changed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { task }
    }
}

// ==============================================================================
// polling feed
// ==============================================================================

pub struct PollingFeed {
    store: Arc<dyn ReadingStore>,
    interval: Duration,
}

impl PollingFeed {
    pub fn new(store: Arc<dyn ReadingStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

impl ChangeFeed for PollingFeed {
    fn subscribe(&self, on_change: OnChange) -> Subscription {
        let store = self.store.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut previous: Option<ChangeMark> = None;

            loop {
                ticker.tick().await;
                let mark = match store.change_mark().await {
                    Ok(mark) => mark,
                    Err(e) => {
                        tracing::warn!("change poll failed: {}", e);
                        continue;
                    }
                };

                if previous.as_ref().is_some_and(|p| *p != mark) {
                    on_change(ChangeEvent::Changed);
                }
                previous = Some(mark);
            }
        });
        Subscription { task }
    }
}
