//! Snapshot broadcast between the photo store and its consumers.
//!
//! Every publish hands the full collection to each subscriber that is
//! registered at that moment. There is no replay: a subscriber only sees
//! publishes that happen after it subscribed.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::mpsc;

use crate::photo_metadata::PhotoRecord;

/// Immutable view of the whole collection, newest first.
pub type Snapshot = Arc<Vec<PhotoRecord>>;

type Callback = Arc<dyn Fn(&Snapshot) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    callbacks: BTreeMap<u64, Callback>,
}

#[derive(Clone, Default)]
pub struct ChangeChannel {
    inner: Arc<Mutex<Subscribers>>,
}

impl ChangeChannel {
    pub fn new() -> ChangeChannel {
        ChangeChannel::default()
    }

    /// Registers a callback invoked synchronously on every publish.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let mut subscribers = lock(&self.inner);
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.callbacks.insert(id, Arc::new(callback));
        tracing::debug!(subscription = id, "channel subscribe");
        Subscription {
            id,
            channel: Some(Arc::downgrade(&self.inner)),
        }
    }

    /// Subscribes through an unbounded queue, for consumers that poll from
    /// their own task. Nothing is dropped, so no publish is ever skipped.
    pub fn subscribe_stream(&self) -> (Subscription, mpsc::UnboundedReceiver<Snapshot>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |snapshot| {
            let _ = tx.send(Arc::clone(snapshot));
        });
        (subscription, rx)
    }

    pub fn publish(&self, snapshot: &Snapshot) {
        // Callbacks run outside the lock so they may unsubscribe themselves
        let callbacks: Vec<Callback> = lock(&self.inner).callbacks.values().cloned().collect();
        tracing::debug!(
            subscriber_count = callbacks.len(),
            count = snapshot.len(),
            "channel publish"
        );
        for callback in callbacks {
            callback(snapshot);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).callbacks.len()
    }
}

impl std::fmt::Debug for ChangeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeChannel")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Handle for one registration. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    channel: Option<Weak<Mutex<Subscribers>>>,
}

impl Subscription {
    /// Releases the callback. Later calls do nothing.
    pub fn unsubscribe(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Some(inner) = channel.upgrade() {
            lock(&inner).callbacks.remove(&self.id);
            tracing::debug!(subscription = self.id, "channel unsubscribe");
        }
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn lock(inner: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
