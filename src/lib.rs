pub use cache::{Cache, KeyValueStore, MemoryStore};
pub use capture::{visit_images, Camera, CapturedImage, Capturer, FileCamera};
pub use channel::{ChangeChannel, Snapshot, Subscription};
pub use config::Config;
pub use enrich::Enricher;
pub use error::{Error, Result};
pub use files::{DisplayMode, FileStore, LocalFiles, MemoryFiles};
pub use geocode::{Geocoder, Nominatim};
pub use list::ListView;
pub use location::{ExifLocation, FixedLocation, LocationProvider};
pub use photo_metadata::{Coordinates, NewPhoto, PhotoRecord};
pub use spatial::{
    BoundingRegion, MapOptions, MapSurface, MapView, MarkerHandle, MarkerSpec, ReconcileReport,
    SpatialReconciler,
};
pub use store::{PhotoRef, PhotoStore, PHOTO_STORAGE_KEY};

pub mod cache;
pub mod capture;
pub mod channel;
pub mod config;
pub mod enrich;
pub mod error;
pub mod files;
pub mod geocode;
pub mod list;
pub mod location;
pub mod photo_metadata;
pub mod spatial;
pub mod store;
