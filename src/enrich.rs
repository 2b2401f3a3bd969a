//! Background place-name lookups.
//!
//! Each record with coordinates and no place gets at most one lookup task
//! at a time, keyed by record id. A task whose record disappears from the
//! store is cancelled. A failed lookup leaves `place` empty until the next
//! [`Enricher::enrich_pending`] pass.
//!
//! Cancellation only interrupts the lookup itself. Once a label is in hand
//! the merge into the store runs to completion, so the persisted collection
//! and the in-memory one never disagree.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{oneshot, Notify};

use crate::{
    channel::{Snapshot, Subscription},
    geocode::Geocoder,
    photo_metadata::Coordinates,
    store::PhotoStore,
};

/// A queued lookup. Dropping `_cancel` cancels it.
struct Job {
    generation: u64,
    _cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct Tasks {
    next_generation: u64,
    running: HashMap<String, Job>,
    // Spawned tasks that have not returned yet, cancelled ones included
    live: usize,
}

#[derive(Default)]
struct Shared {
    tasks: Mutex<Tasks>,
    idle: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts a task as live until it returns, panics included.
struct LiveGuard(Arc<Shared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut tasks = self.0.lock();
        tasks.live -= 1;
        if tasks.live == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

pub struct Enricher {
    store: Arc<PhotoStore>,
    geocoder: Arc<dyn Geocoder>,
    timeout: Duration,
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl Enricher {
    pub fn new(store: Arc<PhotoStore>, geocoder: Arc<dyn Geocoder>, timeout: Duration) -> Enricher {
        let shared = Arc::new(Shared::default());
        let watched = Arc::clone(&shared);
        let subscription = store.subscribe(move |snapshot| cancel_vanished(&watched, snapshot));
        Enricher {
            store,
            geocoder,
            timeout,
            shared,
            _subscription: subscription,
        }
    }

    /// Starts a lookup for every record still missing its place. Records
    /// that already have a lookup running are skipped. Returns how many
    /// lookups were started.
    pub fn enrich_pending(&self) -> usize {
        let snapshot = self.store.snapshot();
        let mut tasks = self.shared.lock();
        let mut queued = 0;
        for record in snapshot.iter() {
            let Some(coords) = record.coordinates() else {
                continue;
            };
            if record.place().is_some() || tasks.running.contains_key(record.id()) {
                continue;
            }
            let id = record.id().to_string();
            let generation = tasks.next_generation;
            tasks.next_generation += 1;
            let (cancel, cancelled) = oneshot::channel();
            tasks.live += 1;
            let guard = LiveGuard(Arc::clone(&self.shared));
            tokio::spawn(enrich_one(
                Arc::clone(&self.store),
                Arc::clone(&self.geocoder),
                self.timeout,
                id.clone(),
                coords,
                cancelled,
                guard,
                generation,
            ));
            tracing::trace!(photo_id = %id, "queued place lookup");
            tasks.running.insert(
                id,
                Job {
                    generation,
                    _cancel: cancel,
                },
            );
            queued += 1;
        }
        if queued > 0 {
            tracing::debug!(count = queued, "enrichment pass started");
        }
        queued
    }

    /// Cancels the lookup for one record. Returns false if none was running.
    /// A lookup that already has its label still merges it.
    pub fn cancel(&self, id: &str) -> bool {
        self.shared.lock().running.remove(id).is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().running.len()
    }

    /// Waits until every spawned task has returned, including ones queued
    /// while waiting.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.shared.idle.notified();
            if self.shared.lock().live == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for Enricher {
    fn drop(&mut self) {
        self.shared.lock().running.clear();
    }
}

/// Runs one lookup under `timeout`. Any failure becomes `None`.
pub async fn resolve_place(
    geocoder: &dyn Geocoder,
    coords: Coordinates,
    timeout: Duration,
) -> Option<String> {
    match tokio::time::timeout(timeout, geocoder.reverse_geocode(coords)).await {
        Ok(Ok(label)) => label,
        Ok(Err(e)) => {
            tracing::warn!(lat = coords.lat, lon = coords.lon, error = %e, "reverse geocoding failed");
            None
        }
        Err(_) => {
            tracing::warn!(
                lat = coords.lat,
                lon = coords.lon,
                timeout_ms = timeout.as_millis() as u64,
                "reverse geocoding timed out"
            );
            None
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn enrich_one(
    store: Arc<PhotoStore>,
    geocoder: Arc<dyn Geocoder>,
    timeout: Duration,
    id: String,
    coords: Coordinates,
    mut cancelled: oneshot::Receiver<()>,
    live: LiveGuard,
    generation: u64,
) {
    let label = tokio::select! {
        _ = &mut cancelled => {
            tracing::debug!(photo_id = %id, "place lookup cancelled");
            None
        }
        label = resolve_place(geocoder.as_ref(), coords, timeout) => label,
    };

    // Last chance to honour a cancel; past this point the merge is not interrupted
    let still_wanted = matches!(cancelled.try_recv(), Err(oneshot::error::TryRecvError::Empty));
    if let (Some(label), true) = (label, still_wanted) {
        match store.fill_place(&id, label).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(photo_id = %id, "place not merged"),
            Err(e) => tracing::warn!(photo_id = %id, error = %e, "could not persist place"),
        }
    }

    let mut tasks = live.0.lock();
    if matches!(tasks.running.get(&id), Some(job) if job.generation == generation) {
        tasks.running.remove(&id);
    }
    drop(tasks);
    drop(live);
}

fn cancel_vanished(shared: &Shared, snapshot: &Snapshot) {
    let mut tasks = shared.lock();
    if tasks.running.is_empty() {
        return;
    }
    let present: HashSet<&str> = snapshot.iter().map(|p| p.id()).collect();
    tasks.running.retain(|id, _| {
        if present.contains(id.as_str()) {
            return true;
        }
        tracing::debug!(photo_id = %id, "photo removed, cancelling place lookup");
        false
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::{
        cache::{KeyValueStore, MemoryStore},
        error::{Error, Result},
        files::{DisplayMode, MemoryFiles},
        photo_metadata::NewPhoto,
        store::PhotoRef,
    };

    enum Reply {
        Label(&'static str),
        Fail,
        Hang,
    }

    struct FakeGeocoder {
        reply: Reply,
        calls: AtomicUsize,
        gate: Option<Semaphore>,
    }

    impl FakeGeocoder {
        fn new(reply: Reply) -> Arc<FakeGeocoder> {
            Arc::new(FakeGeocoder {
                reply,
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(reply: Reply) -> Arc<FakeGeocoder> {
            Arc::new(FakeGeocoder {
                reply,
                calls: AtomicUsize::new(0),
                gate: Some(Semaphore::new(0)),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for FakeGeocoder {
        async fn reverse_geocode(&self, _coords: Coordinates) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            match self.reply {
                Reply::Label(label) => Ok(Some(label.to_string())),
                Reply::Fail => Err(Error::Unavailable("offline".to_string())),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }
        }
    }

    /// Writes through to memory, then optionally parks until released.
    struct SlowWrites {
        inner: MemoryStore,
        hold: AtomicBool,
        written: Notify,
        release: Semaphore,
    }

    impl SlowWrites {
        fn new() -> Arc<SlowWrites> {
            Arc::new(SlowWrites {
                inner: MemoryStore::new(),
                hold: AtomicBool::new(false),
                written: Notify::new(),
                release: Semaphore::new(0),
            })
        }
    }

    #[async_trait]
    impl KeyValueStore for SlowWrites {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set(key, value).await?;
            if self.hold.load(Ordering::SeqCst) {
                self.written.notify_one();
                let _permit = self.release.acquire().await;
            }
            Ok(())
        }
    }

    fn store() -> Arc<PhotoStore> {
        Arc::new(PhotoStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryFiles::new()),
            DisplayMode::Native,
        ))
    }

    fn located(lat: f64, lon: f64) -> NewPhoto {
        NewPhoto {
            file_path: "x.jpeg".to_string(),
            coordinates: Some(Coordinates::new(lat, lon)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fills_missing_places_once() {
        let store = store();
        let geocoder = FakeGeocoder::new(Reply::Label("Marseille, FR"));
        let enricher = Enricher::new(store.clone(), geocoder.clone(), Duration::from_secs(5));
        let here = store.insert_new(located(43.3, 5.4)).await.unwrap();
        let unlocated = store.insert_new(NewPhoto::default()).await.unwrap();
        let labelled = store
            .insert_new(NewPhoto {
                place: Some("Paris, FR".to_string()),
                ..located(48.8, 2.3)
            })
            .await
            .unwrap();

        assert_eq!(enricher.enrich_pending(), 1);
        enricher.wait_idle().await;

        assert_eq!(store.get(here.id()).unwrap().place(), Some("Marseille, FR"));
        assert_eq!(store.get(unlocated.id()).unwrap().place(), None);
        assert_eq!(store.get(labelled.id()).unwrap().place(), Some("Paris, FR"));
        assert_eq!(geocoder.calls(), 1);

        assert_eq!(enricher.enrich_pending(), 0);
        assert_eq!(geocoder.calls(), 1);
    }

    #[tokio::test]
    async fn in_flight_lookups_are_not_duplicated() {
        let store = store();
        let geocoder = FakeGeocoder::gated(Reply::Label("Marseille, FR"));
        let enricher = Enricher::new(store.clone(), geocoder.clone(), Duration::from_secs(5));
        store.insert_new(located(43.3, 5.4)).await.unwrap();

        assert_eq!(enricher.enrich_pending(), 1);
        assert_eq!(enricher.enrich_pending(), 0);
        assert_eq!(enricher.in_flight(), 1);

        geocoder.gate.as_ref().unwrap().add_permits(1);
        enricher.wait_idle().await;
        assert_eq!(enricher.in_flight(), 0);
    }

    #[tokio::test]
    async fn removal_cancels_lookup() {
        let store = store();
        let geocoder = FakeGeocoder::gated(Reply::Label("Marseille, FR"));
        let enricher = Enricher::new(store.clone(), geocoder.clone(), Duration::from_secs(5));
        let record = store.insert_new(located(43.3, 5.4)).await.unwrap();
        enricher.enrich_pending();

        store.remove(PhotoRef::Id(record.id())).await.unwrap();

        assert_eq!(enricher.in_flight(), 0);
        geocoder.gate.as_ref().unwrap().add_permits(1);
        enricher.wait_idle().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failure_leaves_place_empty_until_next_pass() {
        let store = store();
        let geocoder = FakeGeocoder::new(Reply::Fail);
        let enricher = Enricher::new(store.clone(), geocoder.clone(), Duration::from_secs(5));
        let record = store.insert_new(located(43.3, 5.4)).await.unwrap();

        enricher.enrich_pending();
        enricher.wait_idle().await;

        assert_eq!(store.get(record.id()).unwrap().place(), None);
        assert_eq!(geocoder.calls(), 1);

        assert_eq!(enricher.enrich_pending(), 1);
        enricher.wait_idle().await;
        assert_eq!(geocoder.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_time_out() {
        let geocoder = FakeGeocoder::new(Reply::Hang);

        let label = resolve_place(
            geocoder.as_ref(),
            Coordinates::new(43.3, 5.4),
            Duration::from_secs(8),
        )
        .await;

        assert!(label.is_none());
    }

    #[tokio::test]
    async fn cancel_by_id() {
        let store = store();
        let geocoder = FakeGeocoder::gated(Reply::Label("Marseille, FR"));
        let enricher = Enricher::new(store.clone(), geocoder.clone(), Duration::from_secs(5));
        let record = store.insert_new(located(43.3, 5.4)).await.unwrap();
        enricher.enrich_pending();

        assert!(enricher.cancel(record.id()));
        assert!(!enricher.cancel(record.id()));
        geocoder.gate.as_ref().unwrap().add_permits(1);
        enricher.wait_idle().await;

        assert_eq!(store.get(record.id()).unwrap().place(), None);
    }

    #[tokio::test]
    async fn lookups_stay_tracked_while_waiting() {
        let store = store();
        let geocoder = FakeGeocoder::gated(Reply::Label("Marseille, FR"));
        let enricher = Arc::new(Enricher::new(
            store.clone(),
            geocoder.clone(),
            Duration::from_secs(5),
        ));
        let record = store.insert_new(located(43.3, 5.4)).await.unwrap();
        assert_eq!(enricher.enrich_pending(), 1);

        while geocoder.calls() == 0 {
            tokio::task::yield_now().await;
        }
        let waiter = tokio::spawn({
            let enricher = Arc::clone(&enricher);
            async move { enricher.wait_idle().await }
        });
        tokio::task::yield_now().await;

        assert_eq!(enricher.in_flight(), 1);
        assert_eq!(enricher.enrich_pending(), 0);
        assert!(enricher.cancel(record.id()));

        waiter.await.unwrap();
        assert_eq!(geocoder.calls(), 1);
        assert_eq!(enricher.in_flight(), 0);
        assert_eq!(store.get(record.id()).unwrap().place(), None);
    }

    #[tokio::test]
    async fn cancel_during_merge_keeps_disk_and_memory_in_step() {
        let kv = SlowWrites::new();
        let store = Arc::new(PhotoStore::new(
            kv.clone(),
            Arc::new(MemoryFiles::new()),
            DisplayMode::Native,
        ));
        let geocoder = FakeGeocoder::new(Reply::Label("Marseille, FR"));
        let enricher = Enricher::new(store.clone(), geocoder, Duration::from_secs(5));
        let record = store.insert_new(located(43.3, 5.4)).await.unwrap();

        kv.hold.store(true, Ordering::SeqCst);
        enricher.enrich_pending();
        kv.written.notified().await;
        assert!(enricher.cancel(record.id()));
        kv.release.add_permits(1);
        enricher.wait_idle().await;

        assert_eq!(store.get(record.id()).unwrap().place(), Some("Marseille, FR"));
        let on_disk = kv.inner.entry(crate::store::PHOTO_STORAGE_KEY).unwrap();
        assert!(on_disk.contains("Marseille, FR"));
    }
}
