use std::sync::Arc;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal state of one depot request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Caching was not wanted; the client was redirected to the origin.
    Skip,
    /// Served from the local cache.
    Hit { bytes: u64 },
    /// Fetched from the origin and stored.
    MissSuccess { bytes: u64 },
    /// Fetching or storing failed.
    MissError,
}

/// Receives request events from the depot handler.
///
/// Implementations must tolerate concurrent calls from many request tasks.
pub trait RequestObserver: Send + Sync {
    /// A depot request arrived.
    fn request_received(&self);

    /// The object for `depot` was not in the cache and will be fetched.
    /// Reported as soon as the miss is detected, before the outcome.
    fn cache_miss(&self, depot: &str);

    /// The request for `depot` finished with `outcome` after `elapsed`.
    /// Called exactly once per request that reached the cache logic.
    fn request_finished(&self, depot: &str, outcome: &RequestOutcome, elapsed: Duration);

    /// The origin declared `bytes` of content for a miss on `depot`.
    fn upstream_bytes(&self, depot: &str, bytes: u64);
}

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DepotLabels {
    pub depot: String,
}

impl DepotLabels {
    fn new(depot: &str) -> Self {
        Self {
            depot: depot.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Upper bounds (seconds) for the request duration histogram.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    pub requests: Counter,
    pub http_duration_seconds: Family<DepotLabels, Histogram>,

    pub cache_hits: Family<DepotLabels, Counter>,
    pub cache_hit_bytes: Family<DepotLabels, Counter>,
    pub cache_misses: Family<DepotLabels, Counter>,
    pub cache_miss_bytes: Family<DepotLabels, Counter>,
    pub cache_miss_errors: Family<DepotLabels, Counter>,
    pub cache_skips: Family<DepotLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let requests = Counter::default();
        registry.register(
            "lancache_requests",
            "The total number of processed requests",
            requests.clone(),
        );

        let http_duration_seconds =
            Family::<DepotLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "lancache_http_duration_seconds",
            "The response time of requests",
            http_duration_seconds.clone(),
        );

        let cache_hits = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_hits",
            "The total number of cache hits",
            cache_hits.clone(),
        );

        let cache_hit_bytes = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_hit_bytes",
            "The total number of bytes served from the cache",
            cache_hit_bytes.clone(),
        );

        let cache_misses = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_misses",
            "The total number of cache misses",
            cache_misses.clone(),
        );

        let cache_miss_bytes = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_miss_bytes",
            "The total number of bytes fetched from the upstream server",
            cache_miss_bytes.clone(),
        );

        let cache_miss_errors = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_miss_errors",
            "The total number of cache misses that failed to complete",
            cache_miss_errors.clone(),
        );

        let cache_skips = Family::<DepotLabels, Counter>::default();
        registry.register(
            "lancache_cache_skips",
            "The total number of cache skips",
            cache_skips.clone(),
        );

        Self {
            requests,
            http_duration_seconds,
            cache_hits,
            cache_hit_bytes,
            cache_misses,
            cache_miss_bytes,
            cache_miss_errors,
            cache_skips,
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

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestObserver for MetricsRegistry {
    fn request_received(&self) {
        self.metrics.requests.inc();
    }

    fn cache_miss(&self, depot: &str) {
        self.metrics
            .cache_misses
            .get_or_create(&DepotLabels::new(depot))
            .inc();
    }

    fn request_finished(&self, depot: &str, outcome: &RequestOutcome, elapsed: Duration) {
        let labels = DepotLabels::new(depot);
        let m = &self.metrics;
        match outcome {
            RequestOutcome::Skip => {
                m.cache_skips.get_or_create(&labels).inc();
            }
            RequestOutcome::Hit { bytes } => {
                m.cache_hits.get_or_create(&labels).inc();
                m.cache_hit_bytes.get_or_create(&labels).inc_by(*bytes);
            }
            // Counted in `cache_miss` when the miss was detected.
            RequestOutcome::MissSuccess { .. } => {}
            RequestOutcome::MissError => {
                m.cache_miss_errors.get_or_create(&labels).inc();
            }
        }
        m.http_duration_seconds
            .get_or_create(&labels)
            .observe(elapsed.as_secs_f64());
    }

    fn upstream_bytes(&self, depot: &str, bytes: u64) {
        self.metrics
            .cache_miss_bytes
            .get_or_create(&DepotLabels::new(depot))
            .inc_by(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_counters() {
        let registry = MetricsRegistry::new();
        registry.request_received();
        registry.request_received();
        registry.request_received();
        registry.request_finished("730", &RequestOutcome::Hit { bytes: 1024 }, Duration::ZERO);
        registry.cache_miss("730");
        registry.request_finished(
            "730",
            &RequestOutcome::MissSuccess { bytes: 2048 },
            Duration::from_millis(20),
        );
        registry.upstream_bytes("730", 2048);
        registry.request_finished("440", &RequestOutcome::Skip, Duration::ZERO);

        let text = registry.encode().unwrap();
        assert!(text.contains("lancache_requests_total 3"), "{text}");
        assert!(text.contains("lancache_cache_hits_total{depot=\"730\"} 1"), "{text}");
        assert!(text.contains("lancache_cache_hit_bytes_total{depot=\"730\"} 1024"), "{text}");
        assert!(text.contains("lancache_cache_misses_total{depot=\"730\"} 1"), "{text}");
        assert!(text.contains("lancache_cache_miss_bytes_total{depot=\"730\"} 2048"), "{text}");
        assert!(text.contains("lancache_cache_skips_total{depot=\"440\"} 1"), "{text}");
        assert!(
            text.contains("lancache_http_duration_seconds_count{depot=\"730\"} 2"),
            "{text}"
        );
    }

    #[test]
    fn miss_is_counted_before_it_finishes() {
        let registry = MetricsRegistry::new();
        let m = &registry.metrics;
        let labels = DepotLabels::new("730");

        registry.cache_miss("730");
        assert_eq!(m.cache_misses.get_or_create(&labels).get(), 1);
        assert_eq!(m.cache_miss_errors.get_or_create(&labels).get(), 0);

        registry.request_finished("730", &RequestOutcome::MissError, Duration::ZERO);
        assert_eq!(m.cache_misses.get_or_create(&labels).get(), 1);
        assert_eq!(m.cache_miss_errors.get_or_create(&labels).get(), 1);
        assert_eq!(m.cache_hits.get_or_create(&labels).get(), 0);
    }
}
