//! Address to coordinates through the Google Geocoding API.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl std::fmt::Display for LatLng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{}", self.lat, self.lng)
    }
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("address not found")]
    NotFound,
    #[error("geocoding request denied: {0}")]
    Denied(String),
    #[error("geocoding API returned {status}: {message}")]
    Api { status: String, message: String },
    #[error("geocoding request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed geocoding response: {0}")]
    Malformed(String),
}

/// Resolves a free-text address to coordinates.
pub trait Geocoder {
    fn geocode(&self, address: &str) -> Result<LatLng, GeocodeError>;
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

/// Interprets a Geocoding API body. The first result wins.
pub fn parse_response(body: &str) -> Result<LatLng, GeocodeError> {
    let response: GeocodeResponse =
        serde_json::from_str(body).map_err(|e| GeocodeError::Malformed(e.to_string()))?;
    let message = response.error_message.unwrap_or_default();

    match response.status.as_str() {
        "OK" => response
            .results
            .first()
            .map(|r| LatLng {
                lat: r.geometry.location.lat,
                lng: r.geometry.location.lng,
            })
            .ok_or(GeocodeError::NotFound),
        "ZERO_RESULTS" => Err(GeocodeError::NotFound),
        "REQUEST_DENIED" | "OVER_DAILY_LIMIT" => Err(GeocodeError::Denied(message)),
        _ => Err(GeocodeError::Api {
            status: response.status,
            message,
        }),
    }
}

pub struct GoogleGeocoder {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: impl Into<String>, endpoint: Option<String>) -> Result<Self, GeocodeError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            api_key: api_key.into(),
        })
    }
}

impl Geocoder for GoogleGeocoder {
    fn geocode(&self, address: &str) -> Result<LatLng, GeocodeError> {
        tracing::debug!(address, "Geocoding");
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("address", address), ("key", self.api_key.as_str())])
            .header("User-Agent", "streetmesh")
            .send()?;

        // The API reports most failures in the body with HTTP 200
        let status = response.status();
        let body = response.text()?;
        match parse_response(&body) {
            Err(GeocodeError::Malformed(_)) if !status.is_success() => Err(GeocodeError::Api {
                status: format!("HTTP {}", status.as_u16()),
                message: body.chars().take(200).collect(),
            }),
            other => other,
        }
    }
}
