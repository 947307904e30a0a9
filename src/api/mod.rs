//! HTTP surface
//!
//! - `ANY /gateway/{service}` and `ANY /gateway/{service}/{*path}`: the admission pipeline
//! - management API under the configured prefix (see [`management`])
//! - health and metrics endpoints

pub mod management;

use crate::access_log::AccessLogger;
use crate::auth::CredentialResolver;
use crate::config::GatewayConfig;
use crate::directory::ServiceDirectory;
use crate::error::GatewayError;
use crate::health::{HealthChecker, HealthStatus};
use crate::metrics::GatewayMetrics;
use crate::pipeline::{AdmissionPipeline, InboundRequest, ShedPolicy};
use crate::proxy::Forward;
use crate::rate_limit::{global_key, FixedWindowLimiter, RateDecision};
use crate::store::{ApiKeyStore, CounterStore, LogStore, MemoryStore, ServiceStore, UserStore};
use axum::{
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Largest request body forwarded to a backend
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Collaborator stores injected at startup
#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub keys: Arc<dyn ApiKeyStore>,
    pub services: Arc<dyn ServiceStore>,
    pub logs: Arc<dyn LogStore>,
}

impl Stores {
    /// Back every store with one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            users: store.clone(),
            keys: store.clone(),
            services: store.clone(),
            logs: store,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub stores: Stores,
    pub resolver: CredentialResolver,
    pub directory: ServiceDirectory,
    pub pipeline: AdmissionPipeline,
    pub shedding: ShedPolicy,
    pub logger: AccessLogger,
    pub metrics: GatewayMetrics,
    pub health: HealthChecker,
}

impl AppState {
    /// Wire the gateway; returns the state and the access log writer task
    ///
    /// `counters` of `None` disables rate limiting (fail-open).
    pub fn new(
        config: GatewayConfig,
        stores: Stores,
        counters: Option<Arc<dyn CounterStore>>,
        forwarder: Arc<dyn Forward>,
    ) -> (Self, JoinHandle<()>) {
        let metrics = GatewayMetrics::new();
        let health = HealthChecker::new();
        let (logger, writer) = AccessLogger::spawn(stores.logs.clone(), config.access_log.buffer);

        let resolver = CredentialResolver::new(
            stores.users.clone(),
            stores.keys.clone(),
            config.auth.jwt_secret.clone(),
        );
        let directory = ServiceDirectory::new(stores.services.clone(), stores.logs.clone());

        let service_limiter =
            FixedWindowLimiter::new(counters.clone()).with_metrics(metrics.clone());
        let shedding = ShedPolicy {
            limiter: FixedWindowLimiter::new(counters).with_metrics(metrics.clone()),
            limit: config.rate_limit.global_limit,
            window: config.rate_limit.global_window,
        };

        let pipeline = AdmissionPipeline::new(
            resolver.clone(),
            directory.clone(),
            service_limiter,
            shedding.clone(),
            forwarder,
            logger.clone(),
            metrics.clone(),
        );

        let state = Self {
            config: Arc::new(config),
            stores,
            resolver,
            directory,
            pipeline,
            shedding,
            logger,
            metrics,
            health,
        };
        (state, writer)
    }
}

/// Build the gateway router
pub fn router(state: AppState) -> Router {
    let config = state.config.clone();

    let management = management::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        shed_management,
    ));

    let mut app = Router::new()
        .route("/gateway/:service_name", any(gateway_root))
        .route("/gateway/:service_name/*path", any(gateway_nested))
        .nest(&config.server.api_prefix, management);

    if config.health.enabled {
        let ready_path = format!("{}/ready", config.health.path.trim_end_matches('/'));
        app = app
            .route(&config.health.path, get(liveness_handler))
            .route(&ready_path, get(readiness_handler));
    }
    if config.metrics.enabled {
        app = app.route(&config.metrics.path, get(metrics_handler));
    }

    app.layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn client_ip(connect: Option<ConnectInfo<SocketAddr>>) -> String {
    connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn gateway_root(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    admit(state, service_name, None, client_ip(connect), request).await
}

async fn gateway_nested(
    State(state): State<AppState>,
    Path((service_name, path)): Path<(String, String)>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
) -> Response {
    admit(state, service_name, Some(path), client_ip(connect), request).await
}

async fn admit(
    state: AppState,
    service_name: String,
    sub_path: Option<String>,
    client_ip: String,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            return GatewayError::BadRequest(format!("Failed to read request body: {}", e))
                .into_response()
        }
    };

    let query_params = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(params)| params)
        .unwrap_or_default();

    let inbound = InboundRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        service_name,
        sub_path,
        query: parts.uri.query().map(str::to_string),
        query_params,
        headers: parts.headers,
        body,
        client_ip,
    };

    state.pipeline.handle(inbound).await
}

/// Global shedding for management routes, keyed by client address
async fn shed_management(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let key = global_key(None, &client_ip(connect));
    let policy = &state.shedding;
    match policy.limiter.check(&key, policy.limit, policy.window).await {
        RateDecision::Allowed { .. } => next.run(request).await,
        RateDecision::Limited { retry_after } => {
            state.metrics.record_rejection("rate_limit");
            GatewayError::RateLimited {
                detail: "Too many requests".to_string(),
                retry_after,
            }
            .into_response()
        }
    }
}

async fn liveness_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.health.liveness()))
}

async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.health.readiness();
    (
        if health.status == HealthStatus::Unhealthy {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        },
        Json(health),
    )
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.prometheus_output())
}
