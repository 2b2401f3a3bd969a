//! The canonical photo collection.
//!
//! [`PhotoStore`] owns the ordered list of records. Every mutation runs
//! under one async mutex, in a fixed order: build the next collection,
//! persist it, install it as current, then publish it on the
//! [`ChangeChannel`]. A failed persist leaves the current collection
//! untouched and publishes nothing, so subscribers never see state the
//! disk does not hold.

use std::{
    collections::HashSet,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    cache::KeyValueStore,
    channel::{ChangeChannel, Snapshot, Subscription},
    error::{Error, Result},
    files::{data_uri, DisplayMode, FileStore},
    photo_metadata::{derive_id, has_created_at, NewPhoto, PhotoRecord},
};

/// Key the whole collection is stored under.
pub const PHOTO_STORAGE_KEY: &str = "photos";

/// Selects the record to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoRef<'a> {
    Id(&'a str),
    Position(usize),
}

pub struct PhotoStore {
    kv: Arc<dyn KeyValueStore>,
    files: Arc<dyn FileStore>,
    display_mode: DisplayMode,
    mutation: Mutex<()>,
    current: RwLock<Snapshot>,
    channel: ChangeChannel,
}

impl PhotoStore {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        files: Arc<dyn FileStore>,
        display_mode: DisplayMode,
    ) -> PhotoStore {
        PhotoStore {
            kv,
            files,
            display_mode,
            mutation: Mutex::new(()),
            current: RwLock::new(Arc::new(Vec::new())),
            channel: ChangeChannel::new(),
        }
    }

    /// Last committed collection.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, id: &str) -> Option<PhotoRecord> {
        self.snapshot().iter().find(|p| p.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channel(&self) -> &ChangeChannel {
        &self.channel
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.channel.subscribe(callback)
    }

    pub fn files(&self) -> &Arc<dyn FileStore> {
        &self.files
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    /// Reads and normalizes the persisted collection and makes it current.
    ///
    /// Unparsable data loads as an empty collection. When normalization had
    /// to fill anything in, the normalized form is written back so that the
    /// next load reads exactly what this one produced. Subscribers are only
    /// notified if the loaded collection differs from the current one.
    pub async fn load(&self) -> Result<Snapshot> {
        let guard = self.mutation.lock().await;

        let raw = self.kv.get(PHOTO_STORAGE_KEY).await?;
        let previous = self.snapshot();
        let (mut records, rewritten) = match raw.as_deref() {
            None | Some("") => (Vec::new(), false),
            Some(raw) => parse_collection(raw, &previous),
        };

        if rewritten {
            match self.persist(&guard, &records).await {
                Ok(()) => tracing::info!(count = records.len(), "rewrote normalized collection"),
                Err(e) => tracing::warn!(error = %e, "could not write back normalized collection"),
            }
        }

        self.resolve_display_paths(&mut records).await;

        if *previous == records {
            tracing::debug!(count = records.len(), "load found no changes");
            return Ok(previous);
        }
        let snapshot = self.install(&guard, records);
        tracing::info!(count = snapshot.len(), "collection loaded");
        self.channel.publish(&snapshot);
        Ok(snapshot)
    }

    /// Adds a new record at the front of the collection.
    pub async fn insert_new(&self, input: NewPhoto) -> Result<PhotoRecord> {
        let guard = self.mutation.lock().await;

        let record = PhotoRecord::new(input);
        let mut next = Vec::clone(&self.snapshot());
        next.insert(0, record.clone());

        self.persist(&guard, &next).await?;
        let snapshot = self.install(&guard, next);
        tracing::info!(photo_id = record.id(), count = snapshot.len(), "photo added");
        self.channel.publish(&snapshot);
        Ok(record)
    }

    /// Flips `liked` on the record. An unknown id is not an error: nothing
    /// is persisted or published and `None` is returned.
    pub async fn toggle_like(&self, id: &str) -> Result<Option<PhotoRecord>> {
        let guard = self.mutation.lock().await;

        let current = self.snapshot();
        let Some(index) = current.iter().position(|p| p.id() == id) else {
            tracing::debug!(photo_id = id, "toggle_like on unknown id");
            return Ok(None);
        };
        let mut next = Vec::clone(&current);
        next[index].toggle_like();
        let record = next[index].clone();

        self.persist(&guard, &next).await?;
        let snapshot = self.install(&guard, next);
        tracing::info!(
            photo_id = id,
            liked = record.liked(),
            likes = record.like_count(),
            "like toggled"
        );
        self.channel.publish(&snapshot);
        Ok(Some(record))
    }

    /// Removes a record and asks the file store to delete its image.
    /// File deletion is best-effort; the record is gone either way.
    pub async fn remove(&self, target: PhotoRef<'_>) -> Result<Option<PhotoRecord>> {
        let guard = self.mutation.lock().await;

        let current = self.snapshot();
        let index = match target {
            PhotoRef::Id(id) => current.iter().position(|p| p.id() == id),
            PhotoRef::Position(index) => (index < current.len()).then_some(index),
        };
        let Some(index) = index else {
            tracing::debug!(?target, "remove on unknown record");
            return Ok(None);
        };
        let mut next = Vec::clone(&current);
        let removed = next.remove(index);

        self.persist(&guard, &next).await?;
        let snapshot = self.install(&guard, next);

        if let Err(e) = self.files.delete(removed.file_path()).await {
            tracing::warn!(
                photo_id = removed.id(),
                path = removed.file_path(),
                error = %e,
                "could not delete photo file"
            );
        }

        tracing::info!(photo_id = removed.id(), count = snapshot.len(), "photo removed");
        self.channel.publish(&snapshot);
        Ok(Some(removed))
    }

    /// Sets `place` on a record that does not have one yet. Returns false
    /// when the record is gone or already labelled.
    pub async fn fill_place(&self, id: &str, place: String) -> Result<bool> {
        let guard = self.mutation.lock().await;

        let current = self.snapshot();
        let Some(index) = current.iter().position(|p| p.id() == id) else {
            tracing::debug!(photo_id = id, "place resolved for removed photo");
            return Ok(false);
        };
        let mut next = Vec::clone(&current);
        if !next[index].fill_place(place) {
            return Ok(false);
        }

        self.persist(&guard, &next).await?;
        let snapshot = self.install(&guard, next);
        tracing::info!(photo_id = id, place = ?snapshot[index].place(), "place filled");
        self.channel.publish(&snapshot);
        Ok(true)
    }

    async fn persist(&self, _guard: &MutexGuard<'_, ()>, records: &[PhotoRecord]) -> Result<()> {
        let json = serde_json::to_string(records)?;
        self.kv
            .set(PHOTO_STORAGE_KEY, &json)
            .await
            .map_err(|e| match e {
                Error::Persistence(msg) => Error::Persistence(msg),
                other => Error::Persistence(other.to_string()),
            })
    }

    fn install(&self, _guard: &MutexGuard<'_, ()>, records: Vec<PhotoRecord>) -> Snapshot {
        let snapshot = Arc::new(records);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        snapshot
    }

    async fn resolve_display_paths(&self, records: &mut [PhotoRecord]) {
        for record in records.iter_mut() {
            match self.display_mode {
                DisplayMode::DataUri => match self.files.read(record.file_path()).await {
                    Ok(bytes) => record.set_display_path(data_uri(&bytes)),
                    Err(e) => tracing::warn!(
                        photo_id = record.id(),
                        error = %e,
                        "could not read photo file, keeping stored display path"
                    ),
                },
                DisplayMode::Native => {
                    if record.display_path().is_empty() && !record.file_path().is_empty() {
                        let uri = self.files.display_uri(record.file_path());
                        record.set_display_path(uri);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for PhotoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhotoStore")
            .field("count", &self.len())
            .field("display_mode", &self.display_mode)
            .finish()
    }
}

/// Returns the normalized records and whether they differ from `raw`.
///
/// Values normalization has to invent are stable across loads: missing or
/// colliding ids are derived from the stored element, and a missing
/// creation time is taken from `previous` when the record is already known.
fn parse_collection(raw: &str, previous: &[PhotoRecord]) -> (Vec<PhotoRecord>, bool) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %Error::Corrupt(e), "stored collection unreadable, starting empty");
            return (Vec::new(), false);
        }
    };
    let Value::Array(items) = &value else {
        tracing::warn!("stored collection is not an array, starting empty");
        return (Vec::new(), false);
    };

    let mut seen = HashSet::new();
    let mut records: Vec<PhotoRecord> = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let mut record = PhotoRecord::normalize(item, position);
        let mut attempt = 1;
        while seen.contains(record.id()) {
            record.set_id(derive_id(item, position, attempt));
            attempt += 1;
        }
        if attempt > 1 {
            tracing::warn!(photo_id = record.id(), "reassigned duplicate id");
        }
        if !has_created_at(item) {
            if let Some(known) = previous.iter().find(|p| p.id() == record.id()) {
                record.set_created_at(known.created_at());
            }
        }
        seen.insert(record.id().to_string());
        records.push(record);
    }

    let rewritten = match serde_json::to_value(&records) {
        Ok(normalized) => normalized != value,
        Err(_) => true,
    };
    (records, rewritten)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        cache::MemoryStore,
        files::MemoryFiles,
        photo_metadata::Coordinates,
    };

    /// Memory store whose writes can be switched to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value).await
        }
    }

    fn store_with(kv: Arc<dyn KeyValueStore>) -> (PhotoStore, Arc<MemoryFiles>) {
        let files = Arc::new(MemoryFiles::new());
        let store = PhotoStore::new(kv, files.clone(), DisplayMode::Native);
        (store, files)
    }

    fn new_photo(path: &str, coordinates: Option<Coordinates>) -> NewPhoto {
        NewPhoto {
            file_path: path.to_string(),
            display_path: format!("memory://{}", path),
            coordinates,
            place: None,
        }
    }

    fn recorder(store: &PhotoStore) -> (Subscription, Arc<StdMutex<Vec<Snapshot>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let sub = store.subscribe(move |snapshot| s.lock().unwrap().push(Arc::clone(snapshot)));
        (sub, seen)
    }

    #[tokio::test]
    async fn load_empty_store() {
        let (store, _) = store_with(Arc::new(MemoryStore::new()));

        let snapshot = store.load().await.unwrap();

        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn load_corrupt_store_is_empty() {
        let kv = Arc::new(MemoryStore::with_entry(PHOTO_STORAGE_KEY, "{not json"));
        let (store, _) = store_with(kv.clone());

        assert!(store.load().await.unwrap().is_empty());
        assert!(store.load().await.unwrap().is_empty());
        // Not overwritten until the next mutation
        assert_eq!(kv.entry(PHOTO_STORAGE_KEY).as_deref(), Some("{not json"));
    }

    #[tokio::test]
    async fn load_non_array_is_empty() {
        let kv = Arc::new(MemoryStore::with_entry(PHOTO_STORAGE_KEY, "{\"id\":\"a\"}"));
        let (store, _) = store_with(kv);

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_twice_is_identical() {
        let kv = Arc::new(MemoryStore::with_entry(
            PHOTO_STORAGE_KEY,
            r#"[{"filepath":"1.jpeg","liked":1,"likes":"many","latitude":43.3,"longitude":5.4}]"#,
        ));
        let (store, _) = store_with(kv.clone());
        let (_sub, seen) = recorder(&store);

        let first = store.load().await.unwrap();
        let written = kv.entry(PHOTO_STORAGE_KEY).unwrap();
        let second = store.load().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(kv.entry(PHOTO_STORAGE_KEY).unwrap(), written);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(first[0].liked());
        assert_eq!(first[0].like_count(), 0);
    }

    #[tokio::test]
    async fn load_reassigns_duplicate_ids() {
        let kv = Arc::new(MemoryStore::with_entry(
            PHOTO_STORAGE_KEY,
            r#"[{"id":"a","filepath":"1.jpeg"},{"id":"a","filepath":"2.jpeg"}]"#,
        ));
        let (store, _) = store_with(kv);

        let snapshot = store.load().await.unwrap();

        assert_eq!(snapshot[0].id(), "a");
        assert_ne!(snapshot[1].id(), "a");
        assert_eq!(snapshot[1].file_path(), "2.jpeg");
    }

    #[tokio::test]
    async fn load_without_write_back_keeps_ids() {
        let kv = Arc::new(FlakyStore::default());
        kv.inner.insert(
            PHOTO_STORAGE_KEY,
            r#"[{"filepath":"1.jpeg","latitude":43.3,"longitude":5.4}]"#,
        );
        kv.fail.store(true, Ordering::SeqCst);
        let (store, _) = store_with(kv.clone());
        let (_sub, seen) = recorder(&store);

        let first = store.load().await.unwrap();
        let second = store.load().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(kv.writes.load(Ordering::SeqCst), 0);

        // A fresh instance over the same unwritten data agrees on the id
        let (restarted, _) = store_with(kv);
        let third = restarted.load().await.unwrap();
        assert_eq!(third[0].id(), first[0].id());
    }

    #[tokio::test]
    async fn load_resolves_data_uris() {
        let kv = Arc::new(MemoryStore::with_entry(
            PHOTO_STORAGE_KEY,
            r#"[{"id":"a","filepath":"1.jpeg","webviewPath":"blob:stale"},{"id":"b","filepath":"missing.jpeg","webviewPath":"blob:kept"}]"#,
        ));
        let files = Arc::new(MemoryFiles::new());
        files.insert("1.jpeg", b"hi");
        let store = PhotoStore::new(kv, files, DisplayMode::DataUri);

        let snapshot = store.load().await.unwrap();

        assert_eq!(snapshot[0].display_path(), "data:image/jpeg;base64,aGk=");
        assert_eq!(snapshot[1].display_path(), "blob:kept");
    }

    #[tokio::test]
    async fn insert_persists_before_publishing() {
        let kv = Arc::new(MemoryStore::new());
        let (store, _) = store_with(kv.clone());
        let persisted_at_publish = Arc::new(StdMutex::new(Vec::new()));
        let p = Arc::clone(&persisted_at_publish);
        let probe = kv.clone();
        let _sub = store.subscribe(move |snapshot| {
            let on_disk = probe.entry(PHOTO_STORAGE_KEY).unwrap_or_default();
            p.lock()
                .unwrap()
                .push(snapshot.iter().all(|r| on_disk.contains(r.id())));
        });

        let first = store.insert_new(new_photo("1.jpeg", None)).await.unwrap();
        let second = store.insert_new(new_photo("2.jpeg", None)).await.unwrap();

        assert_eq!(*persisted_at_publish.lock().unwrap(), vec![true, true]);
        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].id(), second.id());
        assert_eq!(snapshot[1].id(), first.id());
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_without_publishing() {
        let kv = Arc::new(FlakyStore::default());
        let (store, _) = store_with(kv.clone());
        let kept = store.insert_new(new_photo("1.jpeg", None)).await.unwrap();
        let (_sub, seen) = recorder(&store);

        kv.fail.store(true, Ordering::SeqCst);
        let insert = store.insert_new(new_photo("2.jpeg", None)).await;
        let toggle = store.toggle_like(kept.id()).await;
        let remove = store.remove(PhotoRef::Id(kept.id())).await;

        assert!(matches!(insert, Err(Error::Persistence(_))));
        assert!(matches!(toggle, Err(Error::Persistence(_))));
        assert!(matches!(remove, Err(Error::Persistence(_))));
        assert!(seen.lock().unwrap().is_empty());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].liked());
    }

    #[tokio::test]
    async fn toggle_like_unknown_id_is_noop() {
        let kv = Arc::new(FlakyStore::default());
        let (store, _) = store_with(kv.clone());
        store.insert_new(new_photo("1.jpeg", None)).await.unwrap();
        let before = store.snapshot();
        let (_sub, seen) = recorder(&store);

        let result = store.toggle_like("nope").await.unwrap();

        assert!(result.is_none());
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(kv.writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn toggle_like_twice() {
        let (store, _) = store_with(Arc::new(MemoryStore::new()));
        let record = store.insert_new(new_photo("1.jpeg", None)).await.unwrap();

        let liked = store.toggle_like(record.id()).await.unwrap().unwrap();
        assert!(liked.liked());
        assert_eq!(liked.like_count(), 1);

        let unliked = store.toggle_like(record.id()).await.unwrap().unwrap();
        assert!(!unliked.liked());
        assert_eq!(unliked.like_count(), 0);
    }

    #[tokio::test]
    async fn remove_deletes_file() {
        let (store, files) = store_with(Arc::new(MemoryStore::new()));
        files.insert("1.jpeg", b"x");
        let record = store.insert_new(new_photo("1.jpeg", None)).await.unwrap();

        let removed = store.remove(PhotoRef::Id(record.id())).await.unwrap();

        assert_eq!(removed.unwrap().id(), record.id());
        assert!(store.is_empty());
        assert!(!files.contains("1.jpeg"));
    }

    #[tokio::test]
    async fn remove_survives_file_delete_failure() {
        let (store, _) = store_with(Arc::new(MemoryStore::new()));
        store.insert_new(new_photo("gone.jpeg", None)).await.unwrap();
        let (_sub, seen) = recorder(&store);

        let removed = store.remove(PhotoRef::Position(0)).await.unwrap();

        assert!(removed.is_some());
        assert!(store.is_empty());
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_out_of_range() {
        let (store, _) = store_with(Arc::new(MemoryStore::new()));
        store.insert_new(new_photo("1.jpeg", None)).await.unwrap();

        assert!(store.remove(PhotoRef::Position(3)).await.unwrap().is_none());
        assert!(store.remove(PhotoRef::Id("nope")).await.unwrap().is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn fill_place_never_overwrites() {
        let (store, _) = store_with(Arc::new(MemoryStore::new()));
        let record = store
            .insert_new(new_photo("1.jpeg", Some(Coordinates::new(43.3, 5.4))))
            .await
            .unwrap();

        assert!(store.fill_place(record.id(), "Marseille, FR".into()).await.unwrap());
        assert!(!store.fill_place(record.id(), "Elsewhere".into()).await.unwrap());
        assert!(!store.fill_place("vanished", "Nowhere".into()).await.unwrap());
        assert_eq!(store.get(record.id()).unwrap().place(), Some("Marseille, FR"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_inserts_are_serialized() {
        let kv = Arc::new(MemoryStore::new());
        let (store, _) = store_with(kv.clone());
        let store = Arc::new(store);
        let (_sub, seen) = recorder(&store);

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .insert_new(new_photo(&format!("{}.jpeg", i), None))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let lens: Vec<usize> = seen.lock().unwrap().iter().map(|s| s.len()).collect();
        assert_eq!(lens, (1..=20).collect::<Vec<_>>());
        let on_disk: Vec<Value> =
            serde_json::from_str(&kv.entry(PHOTO_STORAGE_KEY).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 20);
        let snapshot = store.snapshot();
        let ids: HashSet<&str> = snapshot.iter().map(|p| p.id()).collect();
        assert_eq!(ids.len(), 20);
    }
}
