//! Fixed-window rate limiting
//!
//! A counter per `(key, window)` lives in the shared [`CounterStore`]. The
//! window id is `floor(now / window)`, so counting starts afresh when the
//! window rolls over without any explicit reset. Counters expire after two
//! windows.
//!
//! The limiter fails open: without a store, or when the store errors, every
//! request is allowed.

use crate::metrics::GatewayMetrics;
use crate::store::CounterStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

/// Outcome of a limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// `count` is the post-increment value, 0 when the store was bypassed
    Allowed { count: u64 },
    Limited { retry_after: u64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Per-service limiter key
pub fn service_key(service_id: i64, user_id: Option<i64>) -> String {
    match user_id {
        Some(uid) => format!("service:{}:user:{}", service_id, uid),
        None => format!("service:{}:user:anonymous", service_id),
    }
}

/// Global shedding limiter key
pub fn global_key(user_id: Option<i64>, client_ip: &str) -> String {
    match user_id {
        Some(uid) => format!("global:user:{}", uid),
        None => format!("global:ip:{}", client_ip),
    }
}

#[derive(Clone)]
pub struct FixedWindowLimiter {
    store: Option<Arc<dyn CounterStore>>,
    metrics: Option<GatewayMetrics>,
}

impl FixedWindowLimiter {
    pub fn new(store: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            store,
            metrics: None,
        }
    }

    /// Report store failures to the metrics registry
    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Count one request against `key`
    pub async fn check(&self, key: &str, limit: u32, window: u64) -> RateDecision {
        self.check_at(key, limit, window, Utc::now().timestamp().max(0) as u64)
            .await
    }

    /// Count one request against `key` at `now` (unix seconds)
    pub async fn check_at(&self, key: &str, limit: u32, window: u64, now: u64) -> RateDecision {
        let store = match &self.store {
            Some(store) => store,
            None => return RateDecision::Allowed { count: 0 },
        };
        let window = window.max(1);
        let counter_key = format!("rate:{}:{}", key, now / window);

        let count = match store.incr_with_expiry(&counter_key, window * 2).await {
            Ok(count) => count,
            Err(e) => {
                warn!(key = %counter_key, "Rate limit store unavailable, allowing request: {}", e);
                self.note_store_error();
                return RateDecision::Allowed { count: 0 };
            }
        };

        if count <= u64::from(limit) {
            return RateDecision::Allowed { count };
        }

        let mut retry_after = window - now % window;
        match store.ttl(&counter_key).await {
            Ok(Some(ttl)) if ttl > 0 && ttl < retry_after => retry_after = ttl,
            Ok(_) => {}
            Err(e) => {
                warn!(key = %counter_key, "Failed to read counter ttl: {}", e);
                self.note_store_error();
            }
        }

        RateDecision::Limited { retry_after }
    }

    fn note_store_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_error();
        }
    }
}
