//! Fan-out of job updates to live subscribers.
//!
//! Every subscriber owns a bounded channel. Publishing never waits: a
//! subscriber whose buffer is full misses that update, everyone else still
//! receives it.

use crate::jobs::JobUpdate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Identifies one subscription for [`Broadcaster::unsubscribe`].
pub type SubscriberId = u64;

/// A registered subscriber: its id and the receiving end of its channel.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<JobUpdate>,
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<JobUpdate>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Broadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        debug!(subscriber = id, "subscriber added");
        Subscription { id, receiver: rx }
    }

    /// Removes a subscriber and closes its channel. Returns whether it was
    /// registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Delivers `update` to every subscriber without blocking.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, update: &JobUpdate) -> usize {
        let mut delivered = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(update.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(subscriber = id, job_id = %update.job_id, "subscriber buffer full, update dropped");
                true
            }
            // Receiver dropped without unsubscribing
            Err(TrySendError::Closed(_)) => false,
        });
        delivered
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}
