//! Incremental marker index for the map.
//!
//! [`SpatialReconciler`] keeps one marker per geolocated record, keyed by
//! record id, and diffs each new snapshot against that index: markers are
//! added for unseen ids and removed for vanished ones, never recreated for
//! ids present on both sides. The bounding region only ever grows, so
//! removing markers does not zoom the map in.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use geo::{coord, Point, Rect};

use crate::{
    channel::{Snapshot, Subscription},
    photo_metadata::{Coordinates, PhotoRecord},
    store::PhotoStore,
};

/// Opaque reference to a marker on a [`MapSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerHandle(pub u64);

/// What a surface needs to draw one marker and its popup.
#[derive(Debug, Clone, Copy)]
pub struct MarkerSpec<'a> {
    pub id: &'a str,
    pub position: Point<f64>,
    pub display_path: &'a str,
    pub created_at: &'a str,
}

/// A clustered marker layer on a map widget.
pub trait MapSurface {
    fn create(&mut self, center: Point<f64>, zoom: u8);
    fn add_marker(&mut self, marker: &MarkerSpec<'_>) -> MarkerHandle;
    fn remove_marker(&mut self, handle: MarkerHandle);
    fn fit_bounds(&mut self, bounds: &Rect<f64>, padding: u32);
}

#[derive(Debug, Clone, Copy)]
pub struct MapOptions {
    pub center: Coordinates,
    pub zoom: u8,
    /// Pixels kept free around the fitted bounds
    pub padding: u32,
}

impl Default for MapOptions {
    fn default() -> Self {
        MapOptions {
            center: Coordinates::new(43.3, 5.4),
            zoom: 11,
            padding: 24,
        }
    }
}

/// Geographic extent that only grows. x is longitude, y is latitude.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BoundingRegion(Option<Rect<f64>>);

impl BoundingRegion {
    pub fn extend(&mut self, at: Coordinates) {
        let point = coord! { x: at.lon, y: at.lat };
        self.0 = Some(match self.0 {
            None => Rect::new(point, point),
            Some(rect) => Rect::new(
                coord! { x: rect.min().x.min(point.x), y: rect.min().y.min(point.y) },
                coord! { x: rect.max().x.max(point.x), y: rect.max().y.max(point.y) },
            ),
        });
    }

    pub fn rect(&self) -> Option<Rect<f64>> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
}

pub struct SpatialReconciler<S> {
    surface: S,
    options: MapOptions,
    initialized: bool,
    markers: HashMap<String, MarkerHandle>,
    bounds: BoundingRegion,
}

impl<S: MapSurface> SpatialReconciler<S> {
    pub fn new(surface: S, options: MapOptions) -> SpatialReconciler<S> {
        SpatialReconciler {
            surface,
            options,
            initialized: false,
            markers: HashMap::new(),
            bounds: BoundingRegion::default(),
        }
    }

    /// Creates the map on first call and returns true. Later calls only
    /// refit the view to the current bounds.
    pub fn initialize(&mut self) -> bool {
        if self.initialized {
            self.fit();
            return false;
        }
        let center = Point::new(self.options.center.lon, self.options.center.lat);
        self.surface.create(center, self.options.zoom);
        self.bounds = BoundingRegion::default();
        self.initialized = true;
        tracing::debug!(zoom = self.options.zoom, "map initialized");
        true
    }

    /// First render after [`initialize`](Self::initialize): markers for every
    /// geolocated record, bounds rebuilt from scratch.
    pub fn reconcile_full(&mut self, snapshot: &[PhotoRecord]) -> ReconcileReport {
        if !self.initialized {
            tracing::warn!("reconcile_full before map initialization ignored");
            return ReconcileReport::default();
        }
        self.bounds = BoundingRegion::default();
        let mut report = ReconcileReport::default();
        for record in snapshot {
            let Some(at) = record.coordinates() else {
                continue;
            };
            if self.add_marker(record, at) {
                report.added += 1;
            }
            self.bounds.extend(at);
        }
        if report.added > 0 {
            self.fit();
        }
        tracing::debug!(added = report.added, markers = self.markers.len(), "full reconcile");
        report
    }

    /// Applies one snapshot: removes markers whose id is gone, adds markers
    /// for new geolocated ids and widens the bounds to include them.
    pub fn reconcile_diff(&mut self, snapshot: &[PhotoRecord]) -> ReconcileReport {
        if !self.initialized {
            tracing::warn!("reconcile_diff before map initialization ignored");
            return ReconcileReport::default();
        }
        let mut report = ReconcileReport::default();

        let present: HashSet<&str> = snapshot.iter().map(PhotoRecord::id).collect();
        let surface = &mut self.surface;
        self.markers.retain(|id, handle| {
            if present.contains(id.as_str()) {
                return true;
            }
            surface.remove_marker(*handle);
            report.removed += 1;
            false
        });

        for record in snapshot {
            let Some(at) = record.coordinates() else {
                continue;
            };
            if self.add_marker(record, at) {
                self.bounds.extend(at);
                report.added += 1;
            }
        }

        if report.added > 0 {
            self.fit();
        }
        if report != ReconcileReport::default() {
            tracing::debug!(
                added = report.added,
                removed = report.removed,
                markers = self.markers.len(),
                "diff reconcile"
            );
        }
        report
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn bounds(&self) -> BoundingRegion {
        self.bounds
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn marker(&self, id: &str) -> Option<MarkerHandle> {
        self.markers.get(id).copied()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    fn add_marker(&mut self, record: &PhotoRecord, at: Coordinates) -> bool {
        if self.markers.contains_key(record.id()) {
            return false;
        }
        let spec = MarkerSpec {
            id: record.id(),
            position: Point::new(at.lon, at.lat),
            display_path: record.display_path(),
            created_at: record.created_at(),
        };
        let handle = self.surface.add_marker(&spec);
        tracing::trace!(photo_id = record.id(), ?handle, "marker added");
        self.markers.insert(record.id().to_string(), handle);
        true
    }

    fn fit(&mut self) {
        if let Some(rect) = self.bounds.rect() {
            self.surface.fit_bounds(&rect, self.options.padding);
        }
    }
}

/// A map screen bound to a store: first entry builds the map and renders
/// everything, every later broadcast is applied as a diff until teardown.
pub struct MapView<S> {
    reconciler: Arc<Mutex<SpatialReconciler<S>>>,
    subscription: Option<Subscription>,
}

impl<S: MapSurface + Send + 'static> MapView<S> {
    pub fn new(surface: S, options: MapOptions) -> MapView<S> {
        MapView {
            reconciler: Arc::new(Mutex::new(SpatialReconciler::new(surface, options))),
            subscription: None,
        }
    }

    /// Call each time the view is shown. The first entry builds the map and
    /// renders the whole collection. Re-entering a live view only refits it;
    /// re-entering after [`MapView::teardown`] subscribes again and catches
    /// up on whatever changed while the view was hidden.
    pub fn enter(&mut self, store: &PhotoStore) {
        let mut reconciler = lock(&self.reconciler);
        let created = reconciler.initialize();
        if self.subscription.is_some() {
            return;
        }
        // Subscribe before reading the snapshot; a publish racing with the
        // render waits on the lock and is applied as a diff afterwards.
        let watched = Arc::clone(&self.reconciler);
        self.subscription = Some(store.subscribe(move |snapshot: &Snapshot| {
            lock(&watched).reconcile_diff(snapshot);
        }));
        let snapshot = store.snapshot();
        if created {
            reconciler.reconcile_full(&snapshot);
        } else {
            reconciler.reconcile_diff(&snapshot);
        }
    }

    pub fn teardown(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&SpatialReconciler<S>) -> R) -> R {
        f(&lock(&self.reconciler))
    }
}

fn lock<S>(reconciler: &Mutex<SpatialReconciler<S>>) -> MutexGuard<'_, SpatialReconciler<S>> {
    reconciler.lock().unwrap_or_else(PoisonError::into_inner)
}
