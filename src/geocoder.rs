//! Text ⇄ coordinate lookup.
//!
//! The engine only needs geocoding at the edges: labeling an area for
//! local-sentiment answers and area summaries, and resolving a viewer
//! location given as a place name. Failures are never fatal; callers fall
//! back to unlabeled results.
//!
//! [`NominatimClient`] speaks the Nominatim `jsonv2` API.
//!
//! # API Reference
//!
//! See: <https://nominatim.org/release-docs/latest/api/Overview/>

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::Coordinates;

/// Nominatim asks every client to identify itself.
const DEFAULT_USER_AGENT: &str = concat!("vibewatch/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// A short human-readable label for a position.
    async fn reverse_geocode(&self, at: Coordinates) -> anyhow::Result<String>;

    /// The best match for a free-text place, if any.
    async fn forward_geocode(&self, place: &str) -> anyhow::Result<Option<Coordinates>>;
}

/// Client for a Nominatim-compatible geocoding service.
#[derive(Clone)]
pub struct NominatimClient {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimClient {
    /// Create a client against `base_url` (e.g. "https://nominatim.openstreetmap.org").
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimClient {
    async fn reverse_geocode(&self, at: Coordinates) -> anyhow::Result<String> {
        let url = format!(
            "{}/reverse?format=jsonv2&lat={}&lon={}",
            self.base_url, at.latitude, at.longitude
        );

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let place = response.json::<NominatimPlace>().await?;

        place
            .label()
            .ok_or_else(|| anyhow::anyhow!("no place name for ({}, {})", at.latitude, at.longitude))
    }

    async fn forward_geocode(&self, place: &str) -> anyhow::Result<Option<Coordinates>> {
        let url = format!(
            "{}/search?format=jsonv2&limit=1&q={}",
            self.base_url,
            urlencoding::encode(place)
        );

        let response = self.client.get(&url).send().await?.error_for_status()?;
        let matches = response.json::<Vec<NominatimPlace>>().await?;

        Ok(matches.first().and_then(NominatimPlace::coordinates))
    }
}

// ============================================================================
// Response types
// ============================================================================

/// A place returned by `/reverse` or `/search`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NominatimPlace {
    /// Latitude as a decimal string.
    #[serde(default)]
    pub lat: String,

    /// Longitude as a decimal string.
    #[serde(default)]
    pub lon: String,

    /// Primary name of the feature, often empty for plain addresses.
    #[serde(default)]
    pub name: String,

    /// Full comma-separated address.
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub address: NominatimAddress,
}

/// The address parts used for labeling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NominatimAddress {
    #[serde(default)]
    pub neighbourhood: Option<String>,

    #[serde(default)]
    pub suburb: Option<String>,

    #[serde(default)]
    pub city: Option<String>,
}

impl NominatimPlace {
    /// Most specific non-empty name: neighbourhood, suburb, feature name,
    /// city, then the first segment of the display name.
    pub fn label(&self) -> Option<String> {
        let address = &self.address;
        [
            address.neighbourhood.as_deref(),
            address.suburb.as_deref(),
            Some(self.name.as_str()),
            address.city.as_deref(),
            self.display_name.split(',').next(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        let lat = self.lat.parse().ok()?;
        let lon = self.lon.parse().ok()?;
        Coordinates::checked(lat, lon).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_place_label_prefers_neighbourhood() {
        let place: NominatimPlace = serde_json::from_str(
            r#"{
                "lat": "30.0561",
                "lon": "31.2243",
                "name": "",
                "display_name": "26th of July Street, Zamalek, Cairo, Egypt",
                "address": {"suburb": "Zamalek", "city": "Cairo"}
            }"#,
        )
        .unwrap();

        assert_eq!(place.label().as_deref(), Some("Zamalek"));
        assert_eq!(place.coordinates(), Some(Coordinates::new(30.0561, 31.2243)));
    }

    #[test]
    fn test_place_label_falls_back_to_display_name() {
        let place: NominatimPlace =
            serde_json::from_str(r#"{"display_name": "Midan Tahrir, Cairo"}"#).unwrap();

        assert_eq!(place.label().as_deref(), Some("Midan Tahrir"));
        assert_eq!(place.coordinates(), None);
    }

    #[test]
    fn test_empty_place_has_no_label() {
        assert_eq!(NominatimPlace::default().label(), None);
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = NominatimClient::new("https://nominatim.example.org/").unwrap();
        assert_eq!(client.base_url, "https://nominatim.example.org");
    }
}
