//! Metrics module for Prometheus
//!
//! Gateway metrics:
//! - Request count by method, service and status
//! - Request latency histogram by method and service
//! - Admission rejections by pipeline stage
//! - Counter store failures (the rate limiter failed open)

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Label used when a request never resolved to a service
pub const UNRESOLVED_SERVICE: &str = "-";

/// Gateway metrics collector
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_counter: CounterVec,
    request_latency: HistogramVec,
    rejection_counter: CounterVec,
    store_errors: IntCounter,
}

impl GatewayMetrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_counter = CounterVec::new(
            Opts::new("gateway_requests_total", "Total number of gateway requests"),
            &["method", "service", "status"],
        )
        .expect("Failed to create request counter");

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_latency_seconds",
                "Gateway request latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ]),
            &["method", "service"],
        )
        .expect("Failed to create latency histogram");

        let rejection_counter = CounterVec::new(
            Opts::new(
                "gateway_rejections_total",
                "Requests rejected by the admission pipeline",
            ),
            &["stage"],
        )
        .expect("Failed to create rejection counter");

        let store_errors = IntCounter::new(
            "gateway_rate_limit_store_errors_total",
            "Counter store failures during rate limiting",
        )
        .expect("Failed to create store error counter");

        registry
            .register(Box::new(request_counter.clone()))
            .expect("Failed to register request counter");
        registry
            .register(Box::new(request_latency.clone()))
            .expect("Failed to register latency histogram");
        registry
            .register(Box::new(rejection_counter.clone()))
            .expect("Failed to register rejection counter");
        registry
            .register(Box::new(store_errors.clone()))
            .expect("Failed to register store error counter");

        Self {
            registry,
            request_counter,
            request_latency,
            rejection_counter,
            store_errors,
        }
    }

    /// Record a finished gateway request
    ///
    /// `service` is the logical service name, labelled by name rather than by
    /// raw path to keep cardinality bounded.
    pub fn record_request(&self, method: &str, service: &str, status: u16, latency: Duration) {
        let status_str = status.to_string();

        self.request_counter
            .with_label_values(&[method, service, &status_str])
            .inc();

        self.request_latency
            .with_label_values(&[method, service])
            .observe(latency.as_secs_f64());
    }

    /// Record a rejection at a pipeline stage
    pub fn record_rejection(&self, stage: &str) {
        self.rejection_counter.with_label_values(&[stage]).inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors.inc();
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.get()
    }

    pub fn rejections(&self, stage: &str) -> f64 {
        self.rejection_counter.with_label_values(&[stage]).get()
    }

    /// Get the Prometheus metrics output
    pub fn prometheus_output(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
