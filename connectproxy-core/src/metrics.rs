use crate::tracker::RequestStats;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

/// Prometheus collectors shared by the listener, tunnels and the completion
/// observer.
#[derive(Clone)]
pub struct ProxyMetrics {
    /// Client-facing bytes, `direction` is `upload` or `download`
    pub bytes_transferred: IntCounterVec,
    pub connections_total: IntCounterVec,
    pub connections_active: IntGauge,
    pub request_duration: HistogramVec,
    pub errors_total: IntCounterVec,
    pub requests_completed: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let bytes_transferred = IntCounterVec::new(
            Opts::new(
                "connectproxy_bytes_transferred_total",
                "Total bytes exchanged with clients per direction",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(bytes_transferred.clone()))?;

        let connections_total = IntCounterVec::new(
            Opts::new(
                "connectproxy_connections_total",
                "Total number of client connections handled",
            ),
            &["kind", "status"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = IntGauge::new(
            "connectproxy_connections_active",
            "Number of currently open client connections",
        )?;
        registry.register(Box::new(connections_active.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "connectproxy_request_duration_seconds",
                "Request duration in seconds, from tracking start to completion",
            )
            .buckets(vec![
                0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0,
            ]),
            &["kind"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("connectproxy_errors_total", "Total number of errors by type"),
            &["error_type"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let requests_completed = IntCounterVec::new(
            Opts::new(
                "connectproxy_requests_completed_total",
                "Tracked requests finalized, by kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(requests_completed.clone()))?;

        Ok(Self {
            bytes_transferred,
            connections_total,
            connections_active,
            request_duration,
            errors_total,
            requests_completed,
        })
    }

    /// Records a finalized traffic record.
    pub fn observe_completed(&self, stats: &RequestStats) {
        let kind = request_kind(stats.is_http);
        self.requests_completed.with_label_values(&[kind]).inc();
        if let Some(duration_ms) = stats.duration {
            self.request_duration
                .with_label_values(&[kind])
                .observe(duration_ms as f64 / 1000.0);
        }
        if stats.error.is_some() {
            self.errors_total.with_label_values(&["request"]).inc();
        }
    }
}

#[inline]
pub fn request_kind(is_http: bool) -> &'static str {
    if is_http { "http" } else { "connect" }
}
