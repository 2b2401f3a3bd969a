use std::io::Cursor;

use async_trait::async_trait;

use crate::{error::Result, photo_metadata::Coordinates};

/// Where a photo was taken. `Ok(None)` when no fix is available.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self, image: &[u8]) -> Result<Option<Coordinates>>;
}

/// Always reports the same position (or none).
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLocation(pub Option<Coordinates>);

#[async_trait]
impl LocationProvider for FixedLocation {
    async fn current_position(&self, _image: &[u8]) -> Result<Option<Coordinates>> {
        Ok(self.0)
    }
}

/// Reads the GPS tags embedded in the captured image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifLocation;

#[async_trait]
impl LocationProvider for ExifLocation {
    async fn current_position(&self, image: &[u8]) -> Result<Option<Coordinates>> {
        read_exif_coords(image)
    }
}

pub fn read_exif_coords(image: &[u8]) -> Result<Option<Coordinates>> {
    let exifreader = exif::Reader::new();
    let exif = exifreader.read_from_container(&mut Cursor::new(image))?;

    let lat = match gps_degrees(&exif, exif::Tag::GPSLatitude, exif::Tag::GPSLatitudeRef) {
        Some(lat) => lat,
        None => return Ok(None),
    };
    let lon = match gps_degrees(&exif, exif::Tag::GPSLongitude, exif::Tag::GPSLongitudeRef) {
        Some(lon) => lon,
        None => return Ok(None),
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        tracing::debug!(lat, lon, "ignoring out-of-range GPS tags");
        return Ok(None);
    }

    Ok(Some(Coordinates::new(lat, lon)))
}

fn gps_degrees(exif: &exif::Exif, value_tag: exif::Tag, ref_tag: exif::Tag) -> Option<f64> {
    let coord_ref = exif
        .get_field(ref_tag, exif::In::PRIMARY)?
        .display_value()
        .to_string();
    let dms = match &exif.get_field(value_tag, exif::In::PRIMARY)?.value {
        exif::Value::Rational(parts) => parts.iter().map(|p| p.to_f64()).collect::<Vec<_>>(),
        exif::Value::SRational(parts) => parts.iter().map(|p| p.to_f64()).collect::<Vec<_>>(),
        _ => return None,
    };
    dms_to_degrees(&dms, &coord_ref)
}

fn dms_to_degrees(dms: &[f64], coord_ref: &str) -> Option<f64> {
    let [deg, min, sec] = dms else {
        return None;
    };
    let sign = match coord_ref.trim() {
        "S" | "W" => -1.0,
        _ => 1.0,
    };
    let value = sign * (deg + min / 60.0 + sec / 60.0 / 60.0);
    value.is_finite().then_some(value)
}
