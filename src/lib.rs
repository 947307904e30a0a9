//! API Gateway - request admission and forwarding for registered backends
//!
//! Each request under `/gateway/{service}` passes through:
//! - credential resolution (API key or bearer token)
//! - global load shedding
//! - owner-scoped service resolution and status checks
//! - per-service fixed-window rate limiting
//! - header-filtered forwarding to the backend
//!
//! and leaves one access log record behind, whatever the outcome.

pub mod access_log;
pub mod api;
pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod store;

pub use api::{router, AppState, Stores};
pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
