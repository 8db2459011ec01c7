use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_total: IntCounterVec,
    pub jobs_in_queue: IntGauge,
    pub offers_outstanding: IntGauge,
    pub offer_resolution_seconds: HistogramVec,
    pub reachable_drivers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_total = IntCounterVec::new(
            Opts::new("dispatch_total", "Total dispatch attempts by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_total metric");

        let jobs_in_queue = IntGauge::new(
            "dispatch_jobs_in_queue",
            "Current number of dispatch jobs waiting in the queue",
        )
        .expect("valid dispatch_jobs_in_queue metric");

        let offers_outstanding = IntGauge::new(
            "offers_outstanding",
            "Current number of unresolved driver offers",
        )
        .expect("valid offers_outstanding metric");

        let offer_resolution_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "offer_resolution_seconds",
                "Time from offer to resolution in seconds",
            ),
            &["outcome"],
        )
        .expect("valid offer_resolution_seconds metric");

        let reachable_drivers = IntGauge::new(
            "reachable_drivers",
            "Current number of drivers with a live delivery channel",
        )
        .expect("valid reachable_drivers metric");

        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("register dispatch_total");
        registry
            .register(Box::new(jobs_in_queue.clone()))
            .expect("register dispatch_jobs_in_queue");
        registry
            .register(Box::new(offers_outstanding.clone()))
            .expect("register offers_outstanding");
        registry
            .register(Box::new(offer_resolution_seconds.clone()))
            .expect("register offer_resolution_seconds");
        registry
            .register(Box::new(reachable_drivers.clone()))
            .expect("register reachable_drivers");

        Self {
            registry,
            dispatch_total,
            jobs_in_queue,
            offers_outstanding,
            offer_resolution_seconds,
            reachable_drivers,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
