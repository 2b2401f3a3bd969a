use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    Client,
};
use serde_json::Value;

use crate::{
    cache::Cache,
    error::Result,
    photo_metadata::Coordinates,
};

/// Reverse geocoding. `Ok(None)` means the lookup worked but found nothing usable.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse_geocode(&self, coords: Coordinates) -> Result<Option<String>>;
}

/// Settlement-level address keys, most specific first.
const SETTLEMENT_KEYS: [&str; 6] = ["city", "town", "village", "hamlet", "municipality", "county"];

pub struct Nominatim {
    client: Client,
    base_url: String,
    cache: Option<Cache>,
}

impl Nominatim {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Nominatim> {
        let mut headers = HeaderMap::new();
        let agent = HeaderValue::from_str(user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("photomap"));
        headers.insert(USER_AGENT, agent);
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Nominatim {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: None,
        })
    }

    /// Keeps raw responses on disk so the same spot is only looked up once.
    pub fn with_cache(mut self, cache: Cache) -> Nominatim {
        self.cache = Some(cache);
        self
    }

    async fn request_api(&self, coords: Coordinates) -> Result<Value> {
        let url = format!("{}/reverse", self.base_url);
        let lat = coords.lat.to_string();
        let lon = coords.lon.to_string();
        let params = [
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("format", "json"),
            ("addressdetails", "1"),
        ];
        let res = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        Ok(res.json::<Value>().await?)
    }
}

#[async_trait]
impl Geocoder for Nominatim {
    async fn reverse_geocode(&self, coords: Coordinates) -> Result<Option<String>> {
        let key = cache_key(coords);
        let cached = match &self.cache {
            Some(cache) => cache.read_into::<Value>(&key).await,
            None => None,
        };
        let res_json = match cached {
            Some(res_json) => res_json,
            None => {
                tracing::debug!(lat = coords.lat, lon = coords.lon, "geocode cache miss");
                let res_json = self.request_api(coords).await?;
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.write_from(&key, &res_json).await {
                        tracing::warn!(key, error = %e, "could not cache geocode response");
                    }
                }
                res_json
            }
        };
        Ok(label_from_response(&res_json))
    }
}

/// Builds a short place label from a reverse-geocoding response.
///
/// A settlement name (with the upper-cased country code when present) wins;
/// failing that, the first segment of the formatted address.
pub fn label_from_response(json: &Value) -> Option<String> {
    let address = &json["address"];
    let settlement = SETTLEMENT_KEYS
        .iter()
        .filter_map(|key| address[*key].as_str())
        .map(str::trim)
        .find(|name| !name.is_empty());

    if let Some(settlement) = settlement {
        let country = address["country_code"]
            .as_str()
            .map(str::trim)
            .filter(|code| !code.is_empty());
        return Some(match country {
            Some(code) => format!("{}, {}", settlement, code.to_uppercase()),
            None => settlement.to_string(),
        });
    }

    json["display_name"]
        .as_str()
        .and_then(|name| name.split(',').next())
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(String::from)
}

fn cache_key(coords: Coordinates) -> String {
    format!("reverse_{:.5}_{:.5}", coords.lat, coords.lon)
}
