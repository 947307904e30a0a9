//! Health check module
//!
//! Liveness is always healthy while the process runs. Readiness reports
//! `unhealthy` before startup completes (and while shutting down) and
//! `degraded` when the gateway runs without a shared counter store.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Degraded,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health checker service
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Instant,
    ready: Arc<AtomicBool>,
    degraded: Arc<RwLock<Option<String>>>,
    version: String,
}

impl HealthChecker {
    /// Create a health checker; not ready until `set_ready(true)`
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            degraded: Arc::new(RwLock::new(None)),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get liveness status (always healthy if the service is running)
    pub fn liveness(&self) -> HealthResponse {
        HealthResponse {
            status: HealthStatus::Healthy,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message: None,
        }
    }

    /// Get readiness status
    pub fn readiness(&self) -> HealthResponse {
        let (status, message) = if !self.is_ready() {
            (
                HealthStatus::Unhealthy,
                Some("Service is not ready".to_string()),
            )
        } else {
            match self.degraded_reason() {
                Some(reason) => (HealthStatus::Degraded, Some(reason)),
                None => (HealthStatus::Healthy, None),
            }
        };

        HealthResponse {
            status,
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            message,
        }
    }

    /// Set the readiness status
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Mark the gateway as running with reduced guarantees
    pub fn set_degraded(&self, reason: impl Into<String>) {
        if let Ok(mut degraded) = self.degraded.write() {
            *degraded = Some(reason.into());
        }
    }

    pub fn degraded_reason(&self) -> Option<String> {
        self.degraded.read().ok().and_then(|d| d.clone())
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
