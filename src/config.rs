use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub dispatch_queue_size: usize,
    pub event_buffer_size: usize,
    pub dispatch: DispatchConfig,
}

/// The subset of configuration the dispatch core reads. Kept as its own
/// value so tests can build isolated instances with short timeouts.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub offer_timeout: Duration,
    pub search_radius_km: f64,
    pub nearby_radius_km: f64,
    pub nearby_limit: usize,
    pub approach_rate_per_km: f64,
    pub trip_rate_per_km: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(20),
            search_radius_km: 10.0,
            nearby_radius_km: 5.0,
            nearby_limit: 5,
            approach_rate_per_km: 0.5,
            trip_rate_per_km: 1.2,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            dispatch_queue_size: parse_or_default("DISPATCH_QUEUE_SIZE", 1024)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            dispatch: DispatchConfig {
                offer_timeout: Duration::from_millis(parse_or_default(
                    "OFFER_TIMEOUT_MS",
                    20_000,
                )?),
                search_radius_km: parse_or_default("SEARCH_RADIUS_KM", 10.0)?,
                nearby_radius_km: parse_or_default("NEARBY_RADIUS_KM", 5.0)?,
                nearby_limit: parse_or_default("NEARBY_LIMIT", 5)?,
                approach_rate_per_km: parse_or_default("APPROACH_RATE_PER_KM", 0.5)?,
                trip_rate_per_km: parse_or_default("TRIP_RATE_PER_KM", 1.2)?,
            },
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
