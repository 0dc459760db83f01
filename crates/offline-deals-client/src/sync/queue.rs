//! Bounded dispatch queues between the reconciler and the workers.
//!
//! A queue carries ledger keys, never records: the worker re-reads the
//! record under the ledger lock when it dequeues a key, so a queued key can
//! go stale without harm.
//!
//! Offers never block. When a queue is full the offer is dropped and logged;
//! the next reconciliation sweep offers the key again. The queue is a
//! dispatch cache, the ledger is what guarantees every deal is retried.

use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Result of [`DispatchQueue::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// The key was queued.
    Queued,
    /// The key was already waiting in the queue.
    AlreadyQueued,
    /// The queue was full; the key was dropped.
    Full,
    /// The consumer is gone.
    Closed,
}

/// Sending half of a dispatch queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchQueue {
    name: &'static str,
    capacity: usize,
    tx: mpsc::Sender<String>,
    waiting: Arc<Mutex<HashSet<String>>>,
}

/// Receiving half of a dispatch queue. Owned by exactly one worker.
#[derive(Debug)]
pub struct QueueReceiver {
    name: &'static str,
    rx: mpsc::Receiver<String>,
    waiting: Arc<Mutex<HashSet<String>>>,
}

/// Create a queue holding at most `capacity` keys.
pub fn dispatch_queue(name: &'static str, capacity: usize) -> (DispatchQueue, QueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let waiting = Arc::new(Mutex::new(HashSet::new()));
    (
        DispatchQueue {
            name,
            capacity,
            tx,
            waiting: waiting.clone(),
        },
        QueueReceiver { name, rx, waiting },
    )
}

impl DispatchQueue {
    /// Try to queue `key` without waiting.
    pub fn offer(&self, key: &str) -> Offer {
        let mut waiting = self.waiting.lock();
        if waiting.contains(key) {
            return Offer::AlreadyQueued;
        }
        match self.tx.try_send(key.to_string()) {
            Ok(()) => {
                waiting.insert(key.to_string());
                gauge!("queue_depth", "queue" => self.name).set(waiting.len() as f64);
                Offer::Queued
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(cid = %key, "{} queue is full, push failed", self.name);
                counter!("queue_full_total", "queue" => self.name).increment(1);
                Offer::Full
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Keys currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueReceiver {
    /// Wait for the next key. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<String> {
        let key = self.rx.recv().await?;
        let mut waiting = self.waiting.lock();
        waiting.remove(&key);
        gauge!("queue_depth", "queue" => self.name).set(waiting.len() as f64);
        Some(key)
    }

    /// Refuse further offers. Keys already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
