use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Coordinates {
        Coordinates { lat, lon }
    }
}

/// One captured photograph and its metadata.
///
/// Field names on disk match the layout written by earlier versions of the
/// gallery, so existing stores load without migration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhotoRecord {
    id: String,
    #[serde(rename = "filepath")]
    file_path: String,
    #[serde(rename = "webviewPath")]
    display_path: String,
    #[serde(rename = "createdAt")]
    created_at: String,
    liked: bool,
    #[serde(rename = "likes")]
    like_count: u32,
    latitude: Option<f64>,
    longitude: Option<f64>,
    place: Option<String>,
}

/// Input for a freshly captured photo, before it has an identity.
#[derive(Debug, Clone, Default)]
pub struct NewPhoto {
    pub file_path: String,
    pub display_path: String,
    pub coordinates: Option<Coordinates>,
    pub place: Option<String>,
}

impl PhotoRecord {
    pub fn new(input: NewPhoto) -> PhotoRecord {
        PhotoRecord {
            id: generate_id(),
            file_path: input.file_path,
            display_path: input.display_path,
            created_at: now_iso(),
            liked: false,
            like_count: 0,
            latitude: input.coordinates.map(|c| c.lat),
            longitude: input.coordinates.map(|c| c.lon),
            place: input.place,
        }
    }

    /// Builds a record from element `position` of the persisted array.
    /// Missing or mistyped fields get safe defaults; nothing is rejected.
    /// A missing id is derived from the element itself, so the same stored
    /// data always yields the same id even if it was never written back.
    pub fn normalize(value: &Value, position: usize) -> PhotoRecord {
        let id = non_empty_str(value.get("id")).unwrap_or_else(|| derive_id(value, position, 0));
        let created_at = non_empty_str(value.get("createdAt")).unwrap_or_else(now_iso);

        let latitude = value.get("latitude").and_then(Value::as_f64);
        let longitude = value.get("longitude").and_then(Value::as_f64);
        // Coordinates are a pair or nothing
        let (latitude, longitude) = match (latitude, longitude) {
            (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
            _ => (None, None),
        };

        PhotoRecord {
            id,
            file_path: str_or_empty(value.get("filepath")),
            display_path: str_or_empty(value.get("webviewPath")),
            created_at,
            liked: truthy(value.get("liked")),
            like_count: like_count(value.get("likes")),
            latitude,
            longitude,
            place: value.get("place").and_then(Value::as_str).map(String::from),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn display_path(&self) -> &str {
        &self.display_path
    }

    pub fn created_at(&self) -> &str {
        &self.created_at
    }

    pub fn liked(&self) -> bool {
        self.liked
    }

    pub fn like_count(&self) -> u32 {
        self.like_count
    }

    pub fn place(&self) -> Option<&str> {
        self.place.as_deref()
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
            _ => None,
        }
    }

    /// True when the record has coordinates but no place label yet.
    pub fn needs_place(&self) -> bool {
        self.place.is_none() && self.coordinates().is_some()
    }

    pub(crate) fn toggle_like(&mut self) {
        self.liked = !self.liked;
        self.like_count = if self.liked {
            self.like_count.saturating_add(1)
        } else {
            self.like_count.saturating_sub(1)
        };
    }

    /// Returns false when a place was already set; an existing label is never replaced.
    pub(crate) fn fill_place(&mut self, place: String) -> bool {
        if self.place.is_some() {
            return false;
        }
        self.place = Some(place);
        true
    }

    pub(crate) fn set_id(&mut self, id: String) {
        self.id = id;
    }

    pub(crate) fn set_created_at(&mut self, created_at: &str) {
        self.created_at = created_at.to_string();
    }

    pub(crate) fn set_display_path(&mut self, display_path: String) {
        self.display_path = display_path;
    }
}

static LAST_ID_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Time-ordered id with a random suffix. The time part is strictly
/// increasing within the process, so two calls never share it.
pub fn generate_id() -> String {
    let now = Utc::now().timestamp_millis().max(0) as u64;
    let prev = LAST_ID_MILLIS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    let millis = now.max(prev + 1);
    let suffix: u64 = rand::thread_rng().gen();
    format!("{}{}", to_base36(millis), to_base36(suffix))
}

/// Stable id for a stored element that has none, or whose id collides.
/// `attempt` is bumped to step past collisions.
pub fn derive_id(value: &Value, position: usize, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(position.to_le_bytes());
    hasher.update(attempt.to_le_bytes());
    hasher.update(value.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    format!("d{}", to_base36(u64::from_be_bytes(prefix)))
}

/// True when the stored element carries its own creation time.
pub(crate) fn has_created_at(value: &Value) -> bool {
    non_empty_str(value.get("createdAt")).is_some()
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn str_or_empty(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn like_count(value: Option<&Value>) -> u32 {
    match value.and_then(Value::as_f64) {
        Some(n) if n.is_finite() && n > 0.0 => n.floor().min(u32::MAX as f64) as u32,
        _ => 0,
    }
}
