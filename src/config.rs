use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::providers::ProviderKind;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_TELEMETRY_BUFFER_MAX_FILES: usize = 5;
const MAX_WORKER_CONCURRENCY: usize = 5;

pub const DEFAULT_GOOGLE_GEOCODING_ENDPOINT: &str =
    "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
pub const DEFAULT_OPENCAGE_ENDPOINT: &str = "https://api.opencagedata.com/geocode/v1/json";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub cache_file_name: String,
    pub cache_ttl_secs: u64,
    pub provider_order: Vec<ProviderKind>,
    pub google_geocoding_api_key: Option<SecretString>,
    pub google_geocoding_endpoint: String,
    pub nominatim_endpoint: String,
    pub nominatim_user_agent: String,
    pub opencage_api_key: Option<SecretString>,
    pub opencage_endpoint: String,
    pub provider_timeout_ms: u64,
    pub rate_limit_qps: u32,
    pub max_rate_limit_attempts: u32,
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
    pub throttle_batch_size: usize,
    pub throttle_pause_ms: u64,
    pub worker_concurrency: usize,
    pub outage_threshold: usize,
    pub venue_half_width: f64,
    pub parking_half_width: f64,
    pub include_parking: bool,
    pub emit_kml: bool,
    pub output_dir: PathBuf,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub cache_file_name: String,
    pub cache_ttl_secs: u64,
    pub provider_order: Vec<&'static str>,
    pub google_geocoding_endpoint: String,
    pub nominatim_endpoint: String,
    pub opencage_endpoint: String,
    pub rate_limit_qps: u32,
    pub throttle_batch_size: usize,
    pub throttle_pause_ms: u64,
    pub worker_concurrency: usize,
    pub venue_half_width: f64,
    pub parking_half_width: f64,
    pub include_parking: bool,
    pub emit_kml: bool,
    pub output_dir: String,
    pub has_google_geocoding_key: bool,
    pub has_opencage_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_file_name: "geocode-cache.db".to_string(),
            cache_ttl_secs: 24 * 60 * 60,
            provider_order: vec![
                ProviderKind::PrimaryCommercial,
                ProviderKind::OpenFallback,
                ProviderKind::SecondaryFallback,
            ],
            google_geocoding_api_key: None,
            google_geocoding_endpoint: DEFAULT_GOOGLE_GEOCODING_ENDPOINT.to_string(),
            nominatim_endpoint: DEFAULT_NOMINATIM_ENDPOINT.to_string(),
            nominatim_user_agent: format!("venue-footprints/{}", env!("CARGO_PKG_VERSION")),
            opencage_api_key: None,
            opencage_endpoint: DEFAULT_OPENCAGE_ENDPOINT.to_string(),
            provider_timeout_ms: 10_000,
            rate_limit_qps: 3,
            max_rate_limit_attempts: 5,
            backoff_base_ms: 250,
            max_backoff_ms: 30_000,
            throttle_batch_size: 10,
            throttle_pause_ms: 1_000,
            worker_concurrency: 3,
            outage_threshold: 3,
            venue_half_width: 0.0005,
            parking_half_width: 0.001,
            include_parking: true,
            emit_kml: true,
            output_dir: PathBuf::from("output"),
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            telemetry_buffer_max_files: DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_file_name: env::var("GEOCODE_CACHE_FILE").unwrap_or(defaults.cache_file_name),
            cache_ttl_secs: parse_u64("GEOCODE_CACHE_TTL_SECS", defaults.cache_ttl_secs),
            provider_order: env::var("GEOCODE_PROVIDER_ORDER")
                .ok()
                .and_then(|value| parse_provider_order(&value))
                .unwrap_or(defaults.provider_order),
            google_geocoding_api_key: parse_secret("GOOGLE_GEOCODING_API_KEY"),
            google_geocoding_endpoint: env::var("GOOGLE_GEOCODING_ENDPOINT")
                .unwrap_or(defaults.google_geocoding_endpoint),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or(defaults.nominatim_endpoint),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or(defaults.nominatim_user_agent),
            opencage_api_key: parse_secret("OPENCAGE_API_KEY"),
            opencage_endpoint: env::var("OPENCAGE_ENDPOINT").unwrap_or(defaults.opencage_endpoint),
            provider_timeout_ms: parse_u64("PROVIDER_TIMEOUT_MS", defaults.provider_timeout_ms),
            rate_limit_qps: parse_u32("GEOCODE_RATE_LIMIT_QPS", defaults.rate_limit_qps),
            max_rate_limit_attempts: parse_u32(
                "GEOCODE_MAX_ATTEMPTS",
                defaults.max_rate_limit_attempts,
            )
            .max(1),
            backoff_base_ms: parse_u64("GEOCODE_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            max_backoff_ms: parse_u64("GEOCODE_MAX_BACKOFF_MS", defaults.max_backoff_ms),
            throttle_batch_size: parse_usize(
                "GEOCODE_THROTTLE_BATCH_SIZE",
                defaults.throttle_batch_size,
            )
            .max(1),
            throttle_pause_ms: parse_u64("GEOCODE_THROTTLE_PAUSE_MS", defaults.throttle_pause_ms),
            worker_concurrency: clamp_concurrency(parse_usize(
                "JOB_CONCURRENCY",
                defaults.worker_concurrency,
            )),
            outage_threshold: parse_usize("JOB_OUTAGE_THRESHOLD", defaults.outage_threshold)
                .max(1),
            venue_half_width: parse_f64("VENUE_HALF_WIDTH_DEG", defaults.venue_half_width),
            parking_half_width: parse_f64("PARKING_HALF_WIDTH_DEG", defaults.parking_half_width),
            include_parking: parse_bool("INCLUDE_PARKING", defaults.include_parking),
            emit_kml: parse_bool("EMIT_KML", defaults.emit_kml),
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            telemetry_enabled_by_default: parse_bool(
                "TELEMETRY_ENABLED",
                defaults.telemetry_enabled_by_default,
            ),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
            telemetry_buffer_max_files: parse_usize(
                "TELEMETRY_BUFFER_MAX_FILES",
                DEFAULT_TELEMETRY_BUFFER_MAX_FILES,
            )
            .max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            cache_file_name: self.cache_file_name.clone(),
            cache_ttl_secs: self.cache_ttl_secs,
            provider_order: self.provider_order.iter().map(|kind| kind.as_str()).collect(),
            google_geocoding_endpoint: self.google_geocoding_endpoint.clone(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            opencage_endpoint: self.opencage_endpoint.clone(),
            rate_limit_qps: self.rate_limit_qps,
            throttle_batch_size: self.throttle_batch_size,
            throttle_pause_ms: self.throttle_pause_ms,
            worker_concurrency: self.worker_concurrency,
            venue_half_width: self.venue_half_width,
            parking_half_width: self.parking_half_width,
            include_parking: self.include_parking,
            emit_kml: self.emit_kml,
            output_dir: self.output_dir.to_string_lossy().to_string(),
            has_google_geocoding_key: self.google_geocoding_api_key.is_some(),
            has_opencage_key: self.opencage_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

/// Unknown names drop the whole value so a typo never silently removes a provider.
fn parse_provider_order(value: &str) -> Option<Vec<ProviderKind>> {
    let mut order = Vec::new();
    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        match ProviderKind::parse(name) {
            Some(kind) if !order.contains(&kind) => order.push(kind),
            Some(_) => {}
            None => {
                warn!(provider = name, "unknown geocoding provider in GEOCODE_PROVIDER_ORDER");
                return None;
            }
        }
    }
    if order.is_empty() {
        None
    } else {
        Some(order)
    }
}

fn clamp_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_WORKER_CONCURRENCY)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_GEOCODING_API_KEY", "secret");
        env::set_var("OPENCAGE_API_KEY", "  ");
        env::set_var("GEOCODE_CACHE_FILE", "custom.db");
        env::set_var("JOB_CONCURRENCY", "42");
        env::set_var("GEOCODE_PROVIDER_ORDER", "open, primary");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.cache_file_name, "custom.db");
        assert!(public.has_google_geocoding_key);
        assert!(!public.has_opencage_key);
        assert_eq!(public.worker_concurrency, MAX_WORKER_CONCURRENCY);
        assert_eq!(public.provider_order, vec!["open", "primary"]);
        let rendered = serde_json::to_string(&public).unwrap();
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn rejects_unknown_provider_names() {
        assert!(parse_provider_order("primary,bogus").is_none());
        assert!(parse_provider_order(" , ").is_none());
        assert_eq!(
            parse_provider_order("secondary,secondary,open"),
            Some(vec![ProviderKind::SecondaryFallback, ProviderKind::OpenFallback])
        );
    }

    #[test]
    fn defaults_keep_parking_wider_than_venue() {
        let config = AppConfig::default();
        assert!(config.parking_half_width > config.venue_half_width);
        assert_eq!(config.cache_ttl_secs, 86_400);
    }
}
