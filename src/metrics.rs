use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};

/// Prometheus instruments shared by the proxy handler and the `/metrics`
/// endpoint.
pub struct ProxyMetrics {
    pub registry: Registry,
    /// Total number of requests served from cache.
    pub cache_hits_total: IntCounter,
    /// Total number of requests forwarded to the upstream.
    pub cache_misses_total: IntCounter,
    /// Upstream request latency in seconds, observed once per dispatch
    /// regardless of outcome.
    pub upstream_duration: Histogram,
    /// Number of entries currently in the cache, including expired entries
    /// the sweeper has not removed yet.
    pub cache_size: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let cache_hits_total = IntCounter::with_opts(Opts::new(
            "chronocache_cache_hits_total",
            "Total number of cache hits",
        ))
        .unwrap();

        let cache_misses_total = IntCounter::with_opts(Opts::new(
            "chronocache_cache_misses_total",
            "Total number of cache misses",
        ))
        .unwrap();

        let upstream_duration = Histogram::with_opts(HistogramOpts::new(
            "chronocache_upstream_request_duration_seconds",
            "Upstream request latency in seconds",
        ))
        .unwrap();

        let cache_size = IntGauge::new(
            "chronocache_cache_size",
            "Current number of entries in the cache",
        )
        .unwrap();

        registry
            .register(Box::new(cache_hits_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cache_misses_total.clone()))
            .unwrap();
        registry
            .register(Box::new(upstream_duration.clone()))
            .unwrap();
        registry.register(Box::new(cache_size.clone())).unwrap();

        Self {
            registry,
            cache_hits_total,
            cache_misses_total,
            upstream_duration,
            cache_size,
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_all_instruments() {
        let metrics = ProxyMetrics::new();
        metrics.cache_hits_total.inc();
        metrics.cache_misses_total.inc();
        metrics.upstream_duration.observe(0.25);
        metrics.cache_size.set(3);

        let body = metrics.encode();
        assert!(body.contains("chronocache_cache_hits_total 1"));
        assert!(body.contains("chronocache_cache_misses_total 1"));
        assert!(body.contains("chronocache_upstream_request_duration_seconds"));
        assert!(body.contains("chronocache_cache_size 3"));
    }
}
