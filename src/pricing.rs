use crate::config::DispatchConfig;

/// Current per-km rates. The dispatch core only ever reads these; fare
/// policy beyond the two inputs it needs lives elsewhere.
pub trait RateSource: Send + Sync {
    fn approach_rate_per_km(&self) -> f64;
    fn trip_rate_per_km(&self) -> f64;
}

#[derive(Debug, Clone)]
pub struct FixedRates {
    pub approach_per_km: f64,
    pub trip_per_km: f64,
}

impl FixedRates {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            approach_per_km: config.approach_rate_per_km,
            trip_per_km: config.trip_rate_per_km,
        }
    }
}

impl RateSource for FixedRates {
    fn approach_rate_per_km(&self) -> f64 {
        self.approach_per_km
    }

    fn trip_rate_per_km(&self) -> f64 {
        self.trip_per_km
    }
}
