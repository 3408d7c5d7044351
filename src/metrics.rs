use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

/// Outcome class of a served image request.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    /// Value used for the `X-Cache` response header.
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub cache: CacheOutcome,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Request counters per outcome class.
pub struct Metrics {
    pub requests: Family<RequestLabels, Counter>,
    pub request_elapsed_milliseconds: Family<RequestLabels, Counter<f64, AtomicU64>>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "edgecache_requests",
            "Served image requests by cache outcome",
            requests.clone(),
        );

        let request_elapsed_milliseconds =
            Family::<RequestLabels, Counter<f64, AtomicU64>>::default();
        registry.register(
            "edgecache_request_elapsed_milliseconds",
            "Cumulative time spent serving image requests by cache outcome",
            request_elapsed_milliseconds.clone(),
        );

        Self {
            requests,
            request_elapsed_milliseconds,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Count one request of class `outcome` that took `elapsed_ms`.
    pub fn record(&self, outcome: CacheOutcome, elapsed_ms: f64) {
        let labels = RequestLabels { cache: outcome };
        self.metrics.requests.get_or_create(&labels).inc();
        self.metrics
            .request_elapsed_milliseconds
            .get_or_create(&labels)
            .inc_by(elapsed_ms);
    }

    /// `(count, cumulative elapsed ms)` recorded so far for `outcome`.
    pub fn totals(&self, outcome: CacheOutcome) -> (u64, f64) {
        let labels = RequestLabels { cache: outcome };
        let count = self.metrics.requests.get_or_create(&labels).get();
        let elapsed = self
            .metrics
            .request_elapsed_milliseconds
            .get_or_create(&labels)
            .get();
        (count, elapsed)
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
