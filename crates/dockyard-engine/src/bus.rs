//! In-process event fan-out.
//!
//! Subscribers register a bounded channel. `publish` never waits: each
//! delivery is a `try_send`, and a full or closed channel only loses
//! that one event (closed channels are also unsubscribed).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use dockyard_core::Event;

pub type SubscriptionId = u64;

#[derive(Default)]
pub struct EventBus {
    sinks: Mutex<BTreeMap<SubscriptionId, mpsc::Sender<Event>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: mpsc::Sender<Event>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sink);
        debug!(subscription = id, "bus subscriber added");
        id
    }

    /// Subscribe a fresh channel holding up to `capacity` undelivered events.
    pub fn channel(&self, capacity: usize) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (self.subscribe(tx), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some();
        if removed {
            debug!(subscription = id, "bus subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every subscriber. Returns how many accepted it.
    pub fn publish(&self, event: Event) -> usize {
        let sinks: Vec<(SubscriptionId, mpsc::Sender<Event>)> = self
            .sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in sinks {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(subscription = id, event = %event.name, "subscriber full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        for id in closed {
            self.unsubscribe(id);
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
