use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::ingestion::NormalizedAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    PrimaryCommercial,
    OpenFallback,
    SecondaryFallback,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::PrimaryCommercial => "primary",
            ProviderKind::OpenFallback => "open",
            ProviderKind::SecondaryFallback => "secondary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "primary" | "primary_commercial" | "google" => Some(ProviderKind::PrimaryCommercial),
            "open" | "open_fallback" | "nominatim" => Some(ProviderKind::OpenFallback),
            "secondary" | "secondary_fallback" | "opencage" => {
                Some(ProviderKind::SecondaryFallback)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
    pub provider: ProviderKind,
    pub resolved_at: DateTime<Utc>,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64, provider: ProviderKind) -> Result<Self, ProviderFailure> {
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon);
        if !valid {
            return Err(ProviderFailure::Provider(format!(
                "coordinate out of range: lat={lat}, lon={lon}"
            )));
        }
        Ok(Self {
            lat,
            lon,
            provider,
            resolved_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderFailure {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("address not found")]
    NotFound,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider unreachable: {0}")]
    Transport(String),
}

/// One external geocoding API. Adapters never touch the cache.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn resolve(&self, address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure>;
}

pub fn build_providers(config: &AppConfig) -> AppResult<Vec<Arc<dyn GeocodeProvider>>> {
    let timeout = Duration::from_millis(config.provider_timeout_ms.max(1));
    let mut providers: Vec<Arc<dyn GeocodeProvider>> = Vec::new();
    for kind in &config.provider_order {
        match kind {
            ProviderKind::PrimaryCommercial => match &config.google_geocoding_api_key {
                Some(key) => providers.push(Arc::new(GoogleGeocodingProvider::new(
                    &config.google_geocoding_endpoint,
                    key.clone(),
                    timeout,
                )?)),
                None => warn!("GOOGLE_GEOCODING_API_KEY not set; skipping primary provider"),
            },
            ProviderKind::OpenFallback => providers.push(Arc::new(NominatimProvider::new(
                &config.nominatim_endpoint,
                &config.nominatim_user_agent,
                timeout,
            )?)),
            ProviderKind::SecondaryFallback => match &config.opencage_api_key {
                Some(key) => providers.push(Arc::new(OpenCageProvider::new(
                    &config.opencage_endpoint,
                    key.clone(),
                    timeout,
                )?)),
                None => warn!("OPENCAGE_API_KEY not set; skipping secondary provider"),
            },
        }
    }
    if providers.is_empty() {
        return Err(AppError::Config(
            "no geocoding provider is configured".into(),
        ));
    }
    Ok(providers)
}

fn build_client(timeout: Duration, user_agent: &str) -> AppResult<Client> {
    Ok(Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()?)
}

fn default_user_agent() -> String {
    format!("venue-footprints/{}", env!("CARGO_PKG_VERSION"))
}

fn map_request_error(err: reqwest::Error) -> ProviderFailure {
    if err.is_timeout() || err.is_connect() {
        ProviderFailure::Transport(err.to_string())
    } else {
        ProviderFailure::Provider(err.to_string())
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Shared status handling; returns the response when the body should be decoded.
fn check_status(
    response: Response,
    quota_statuses: &[StatusCode],
) -> Result<Response, ProviderFailure> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS || quota_statuses.contains(&status) {
        return Err(ProviderFailure::RateLimited {
            retry_after: retry_after(&response),
        });
    }
    if status.is_server_error() {
        return Err(ProviderFailure::Transport(format!("upstream returned {status}")));
    }
    if !status.is_success() {
        return Err(ProviderFailure::Provider(format!("upstream returned {status}")));
    }
    Ok(response)
}

pub struct GoogleGeocodingProvider {
    http: Client,
    endpoint: String,
    api_key: SecretString,
}

impl GoogleGeocodingProvider {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: build_client(timeout, &default_user_agent())?,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocodingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::PrimaryCommercial
    }

    async fn resolve(&self, address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
            error_message: Option<String>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            location: ResponseLocation,
        }

        #[derive(Deserialize)]
        struct ResponseLocation {
            lat: f64,
            lng: f64,
        }

        debug!(%address, "querying primary geocoder");
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("address", address.as_str()),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response, &[])?;
        let parsed: Response = response.json().await.map_err(map_request_error)?;

        match parsed.status.as_str() {
            "OK" => {
                let location = parsed
                    .results
                    .into_iter()
                    .next()
                    .map(|result| result.geometry.location)
                    .ok_or(ProviderFailure::NotFound)?;
                Coordinate::new(location.lat, location.lng, self.kind())
            }
            "ZERO_RESULTS" => Err(ProviderFailure::NotFound),
            "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => {
                Err(ProviderFailure::RateLimited { retry_after: None })
            }
            other => Err(ProviderFailure::Provider(match parsed.error_message {
                Some(message) => format!("{other}: {message}"),
                None => other.to_string(),
            })),
        }
    }
}

pub struct NominatimProvider {
    http: Client,
    endpoint: String,
}

impl NominatimProvider {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: build_client(timeout, user_agent)?,
            endpoint: endpoint.to_string(),
        })
    }
}

/// Nominatim sends coordinates as strings; some mirrors send numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum Degrees {
    Number(f64),
    Text(String),
}

impl Degrees {
    fn value(&self) -> Result<f64, ProviderFailure> {
        match self {
            Degrees::Number(value) => Ok(*value),
            Degrees::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| ProviderFailure::Provider(format!("invalid coordinate '{text}'"))),
        }
    }
}

#[async_trait]
impl GeocodeProvider for NominatimProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenFallback
    }

    async fn resolve(&self, address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure> {
        #[derive(Deserialize)]
        struct Place {
            lat: Degrees,
            lon: Degrees,
        }

        debug!(%address, "querying open geocoder");
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", address.as_str()), ("format", "json"), ("limit", "1")])
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response, &[])?;
        let places: Vec<Place> = response.json().await.map_err(map_request_error)?;
        let place = places.into_iter().next().ok_or(ProviderFailure::NotFound)?;
        Coordinate::new(place.lat.value()?, place.lon.value()?, self.kind())
    }
}

pub struct OpenCageProvider {
    http: Client,
    endpoint: String,
    api_key: SecretString,
}

impl OpenCageProvider {
    pub fn new(endpoint: &str, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        Ok(Self {
            http: build_client(timeout, &default_user_agent())?,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl GeocodeProvider for OpenCageProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SecondaryFallback
    }

    async fn resolve(&self, address: &NormalizedAddress) -> Result<Coordinate, ProviderFailure> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: ResponseGeometry,
        }

        #[derive(Deserialize)]
        struct ResponseGeometry {
            lat: f64,
            lng: f64,
        }

        debug!(%address, "querying secondary geocoder");
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("q", address.as_str()),
                ("key", self.api_key.expose_secret()),
                ("limit", "1"),
                ("no_annotations", "1"),
            ])
            .send()
            .await
            .map_err(map_request_error)?;
        // 402 is OpenCage's "quota exceeded".
        let response = check_status(response, &[StatusCode::PAYMENT_REQUIRED])?;
        let parsed: Response = response.json().await.map_err(map_request_error)?;
        let geometry = parsed
            .results
            .into_iter()
            .next()
            .map(|result| result.geometry)
            .ok_or(ProviderFailure::NotFound)?;
        Coordinate::new(geometry.lat, geometry.lng, self.kind())
    }
}

#[cfg(test)]
mod tests {
    use httptest::matchers::{all_of, contains, request, url_decoded};
    use httptest::responders::{json_encoded, status_code};
    use httptest::{Expectation, Server};
    use serde_json::json;

    use super::*;

    const ADDRESS: &str = "1 main st, springfield, il 62701";

    fn address() -> NormalizedAddress {
        NormalizedAddress::from_raw(ADDRESS)
    }

    fn google(server: &Server) -> GoogleGeocodingProvider {
        GoogleGeocodingProvider::new(
            &server.url_str("/geocode/json"),
            SecretString::from("test-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn google_maps_ok_response_to_coordinate() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/geocode/json"),
                request::query(url_decoded(contains(("address", ADDRESS)))),
                request::query(url_decoded(contains(("key", "test-key")))),
            ])
            .respond_with(json_encoded(json!({
                "status": "OK",
                "results": [{"geometry": {"location": {"lat": 39.78, "lng": -89.65}}}]
            }))),
        );

        let coordinate = google(&server).resolve(&address()).await.unwrap();
        assert_eq!(coordinate.lat, 39.78);
        assert_eq!(coordinate.lon, -89.65);
        assert_eq!(coordinate.provider, ProviderKind::PrimaryCommercial);
    }

    #[tokio::test]
    async fn google_maps_status_strings() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/geocode/json"))
                .times(3)
                .respond_with(httptest::cycle![
                    json_encoded(json!({"status": "ZERO_RESULTS", "results": []})),
                    json_encoded(json!({"status": "OVER_QUERY_LIMIT", "results": []})),
                    json_encoded(json!({
                        "status": "REQUEST_DENIED",
                        "error_message": "bad key",
                        "results": []
                    })),
                ]),
        );

        let provider = google(&server);
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::NotFound)
        );
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::RateLimited { retry_after: None })
        );
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::Provider("REQUEST_DENIED: bad key".into()))
        );
    }

    #[tokio::test]
    async fn http_429_carries_retry_after() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/search")).respond_with(
                status_code(429).append_header("Retry-After", "2"),
            ),
        );

        let provider = NominatimProvider::new(
            &server.url_str("/search"),
            "venue-footprints-test",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            })
        );
    }

    #[tokio::test]
    async fn nominatim_parses_string_coordinates_and_empty_results() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", "/search"),
                request::query(url_decoded(contains(("format", "json")))),
                request::query(url_decoded(contains(("q", ADDRESS)))),
            ])
            .times(2)
            .respond_with(httptest::cycle![
                json_encoded(json!([{"lat": "39.78", "lon": "-89.65", "display_name": "x"}])),
                json_encoded(json!([])),
            ]),
        );

        let provider = NominatimProvider::new(
            &server.url_str("/search"),
            "venue-footprints-test",
            Duration::from_secs(5),
        )
        .unwrap();
        let coordinate = provider.resolve(&address()).await.unwrap();
        assert_eq!((coordinate.lat, coordinate.lon), (39.78, -89.65));
        assert_eq!(coordinate.provider, ProviderKind::OpenFallback);
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::NotFound)
        );
    }

    #[tokio::test]
    async fn opencage_maps_quota_and_server_errors() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/geocode/v1/json"))
                .times(3)
                .respond_with(httptest::cycle![
                    status_code(402),
                    status_code(503),
                    json_encoded(json!({
                        "status": {"code": 200, "message": "OK"},
                        "results": [{"geometry": {"lat": 51.5, "lng": -0.1}}]
                    })),
                ]),
        );

        let provider = OpenCageProvider::new(
            &server.url_str("/geocode/v1/json"),
            SecretString::from("oc-key".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::RateLimited { retry_after: None })
        );
        assert!(matches!(
            provider.resolve(&address()).await,
            Err(ProviderFailure::Transport(_))
        ));
        let coordinate = provider.resolve(&address()).await.unwrap();
        assert_eq!(coordinate.provider, ProviderKind::SecondaryFallback);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(Coordinate::new(91.0, 0.0, ProviderKind::OpenFallback).is_err());
        assert!(Coordinate::new(0.0, f64::NAN, ProviderKind::OpenFallback).is_err());
        assert!(Coordinate::new(-89.9, 179.9, ProviderKind::OpenFallback).is_ok());
    }

    #[test]
    fn skips_keyed_providers_without_keys() {
        let config = AppConfig::default();
        let providers = build_providers(&config).unwrap();
        let kinds: Vec<_> = providers.iter().map(|p| p.kind()).collect();
        assert_eq!(kinds, vec![ProviderKind::OpenFallback]);

        let config = AppConfig {
            provider_order: vec![ProviderKind::SecondaryFallback],
            ..AppConfig::default()
        };
        assert!(matches!(
            build_providers(&config),
            Err(AppError::Config(_))
        ));
    }
}
