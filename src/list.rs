use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};

use crate::{
    channel::{Snapshot, Subscription},
    photo_metadata::PhotoRecord,
    store::PhotoStore,
};

/// Flat newest-first list that re-renders from the full snapshot on every change.
pub struct ListView {
    photos: Arc<Mutex<Snapshot>>,
    subscription: Option<Subscription>,
}

impl ListView {
    pub fn attach(store: &PhotoStore) -> ListView {
        let photos = Arc::new(Mutex::new(Arc::new(Vec::new())));
        let watched = Arc::clone(&photos);
        let subscription = store.subscribe(move |snapshot: &Snapshot| {
            *watched.lock().unwrap_or_else(PoisonError::into_inner) = Arc::clone(snapshot);
        });
        // After subscribing, so a concurrent publish cannot be lost
        *photos.lock().unwrap_or_else(PoisonError::into_inner) = store.snapshot();
        ListView {
            photos,
            subscription: Some(subscription),
        }
    }

    pub fn photos(&self) -> Snapshot {
        Arc::clone(&self.photos.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn favorites(&self) -> Vec<PhotoRecord> {
        self.photos().iter().filter(|p| p.liked()).cloned().collect()
    }

    pub fn detach(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

/// `dd/MM/yyyy HH:mm` in local time; unparsable timestamps are shown as stored.
pub fn when(iso: &str) -> String {
    match DateTime::parse_from_rfc3339(iso) {
        Ok(at) => at.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string(),
        Err(_) => iso.to_string(),
    }
}
