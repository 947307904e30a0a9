//! Request admission pipeline
//!
//! Every `/gateway` request runs through the same ordered stages:
//!
//! 1. resolve the caller's identity
//! 2. global shedding limit
//! 3. resolve the service
//! 4. reject services that are not active
//! 5. reject anonymous callers of services requiring authentication
//! 6. per-service rate limit
//! 7. forward to the backend
//!
//! The first rejecting stage produces the response. Whatever the outcome, one
//! access log record is written. Store failures are carried separately from
//! rejections and answered with a 500.

use crate::access_log::AccessLogger;
use crate::auth::{extract_credentials, CredentialResolver, API_KEY_HEADER};
use crate::directory::ServiceDirectory;
use crate::error::GatewayError;
use crate::metrics::{GatewayMetrics, UNRESOLVED_SERVICE};
use crate::model::{AccessLogRecord, Identity};
use crate::proxy::{BackendResponse, Forward, OutboundRequest};
use crate::rate_limit::{global_key, service_key, FixedWindowLimiter, RateDecision};
use crate::store::StoreResult;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Status recorded when the caller goes away before a response is produced
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Outcome of a single pipeline stage
#[derive(Debug)]
pub enum Stage<T> {
    Continue(T),
    Reject(GatewayError),
}

/// Unwrap a `Continue`, or return the rejection from the enclosing stage runner
macro_rules! proceed {
    ($stage:expr) => {
        match $stage {
            Stage::Continue(value) => value,
            Stage::Reject(e) => return Ok(Stage::Reject(e)),
        }
    };
}

/// A `/gateway` request as received
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Inbound path, recorded in the access log
    pub path: String,
    pub service_name: String,
    /// Path after `/gateway/{service}/`
    pub sub_path: Option<String>,
    pub query: Option<String>,
    pub query_params: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
}

/// Global shedding limit applied before service resolution
#[derive(Clone)]
pub struct ShedPolicy {
    pub limiter: FixedWindowLimiter,
    pub limit: u32,
    pub window: u64,
}

/// Per-request fields the access log record is built from
#[derive(Debug, Clone, Default)]
struct LogContext {
    method: String,
    path: String,
    client_ip: String,
    headers: HashMap<String, String>,
    query_params: HashMap<String, String>,
    user_id: Option<i64>,
    api_key_id: Option<i64>,
    service_id: Option<i64>,
    service_label: String,
}

impl LogContext {
    fn from_request(request: &InboundRequest) -> Self {
        Self {
            method: request.method.to_string(),
            path: request.path.clone(),
            client_ip: request.client_ip.clone(),
            headers: header_snapshot(&request.headers),
            query_params: request.query_params.clone(),
            user_id: None,
            api_key_id: None,
            service_id: None,
            service_label: UNRESOLVED_SERVICE.to_string(),
        }
    }

    fn into_record(
        self,
        status_code: u16,
        elapsed: Duration,
        error: Option<String>,
    ) -> AccessLogRecord {
        AccessLogRecord {
            method: self.method,
            path: self.path,
            status_code,
            response_time: elapsed.as_secs_f64() * 1000.0,
            client_ip: self.client_ip,
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            service_id: self.service_id,
            headers: self.headers,
            query_params: self.query_params,
            error,
            timestamp: Utc::now(),
        }
    }
}

/// Request headers as logged; credential values are masked
fn header_snapshot(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if name == header::AUTHORIZATION || name.as_str() == API_KEY_HEADER {
                "[redacted]".to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_string(), value)
        })
        .collect()
}

/// Writes the access log record for one request
///
/// If the request future is dropped before `complete` (the client
/// disconnected), the drop writes a 499 record instead.
struct InFlight {
    logger: AccessLogger,
    metrics: GatewayMetrics,
    started: Instant,
    context: LogContext,
    finished: bool,
}

impl InFlight {
    fn new(logger: AccessLogger, metrics: GatewayMetrics, context: LogContext) -> Self {
        Self {
            logger,
            metrics,
            started: Instant::now(),
            context,
            finished: false,
        }
    }

    fn finish(&mut self, status: u16, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let context = std::mem::take(&mut self.context);
        let elapsed = self.started.elapsed();
        self.metrics
            .record_request(&context.method, &context.service_label, status, elapsed);
        self.logger
            .record(context.into_record(status, elapsed, error));
    }

    fn complete(mut self, outcome: StoreResult<Stage<BackendResponse>>) -> Response {
        match outcome {
            Ok(Stage::Continue(backend)) => {
                self.finish(backend.status.as_u16(), None);
                let mut response = Response::new(Body::from(backend.body));
                *response.status_mut() = backend.status;
                *response.headers_mut() = backend.headers;
                response
            }
            Ok(Stage::Reject(e)) => {
                debug!(stage = e.stage(), "Request rejected: {}", e);
                self.metrics.record_rejection(e.stage());
                self.finish(e.status_code().as_u16(), Some(e.to_string()));
                e.into_response()
            }
            Err(e) => {
                error!("Store failure while admitting request: {}", e);
                let e = GatewayError::Store(e);
                self.metrics.record_rejection(e.stage());
                self.finish(StatusCode::INTERNAL_SERVER_ERROR.as_u16(), Some(e.to_string()));
                e.into_response()
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.finished {
            debug!("Client disconnected before the response was ready");
            self.finish(CLIENT_CLOSED_REQUEST, Some("client disconnected".to_string()));
        }
    }
}

/// The ordered admission stages with their collaborators
#[derive(Clone)]
pub struct AdmissionPipeline {
    resolver: CredentialResolver,
    directory: ServiceDirectory,
    limiter: FixedWindowLimiter,
    shedding: ShedPolicy,
    forwarder: Arc<dyn Forward>,
    logger: AccessLogger,
    metrics: GatewayMetrics,
}

impl AdmissionPipeline {
    pub fn new(
        resolver: CredentialResolver,
        directory: ServiceDirectory,
        limiter: FixedWindowLimiter,
        shedding: ShedPolicy,
        forwarder: Arc<dyn Forward>,
        logger: AccessLogger,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            resolver,
            directory,
            limiter,
            shedding,
            forwarder,
            logger,
            metrics,
        }
    }

    /// Admit, forward and log one request
    pub async fn handle(&self, request: InboundRequest) -> Response {
        let mut in_flight = InFlight::new(
            self.logger.clone(),
            self.metrics.clone(),
            LogContext::from_request(&request),
        );
        let outcome = self.run(request, &mut in_flight.context).await;
        in_flight.complete(outcome)
    }

    async fn run(
        &self,
        request: InboundRequest,
        context: &mut LogContext,
    ) -> StoreResult<Stage<BackendResponse>> {
        let credentials = extract_credentials(&request.headers);
        let identity = proceed!(self.resolver.resolve(&credentials).await?);
        context.user_id = identity.user_id();
        context.api_key_id = identity.api_key_id();

        proceed!(self.shed(&identity, &request.client_ip).await);

        let service = proceed!(
            self.directory
                .resolve(&request.service_name, &identity)
                .await?
        );
        context.service_id = Some(service.id);
        context.service_label = service.name.clone();

        if !service.is_routable() {
            return Ok(Stage::Reject(GatewayError::ServiceUnavailable(format!(
                "Service '{}' is {}",
                service.name, service.status
            ))));
        }

        if service.require_authentication && !identity.is_authenticated() {
            return Ok(Stage::Reject(GatewayError::bearer(
                "Authentication required for this service",
            )));
        }

        let key = service_key(service.id, identity.user_id());
        if let RateDecision::Limited { retry_after } = self
            .limiter
            .check(&key, service.rate_limit, service.rate_limit_duration)
            .await
        {
            return Ok(Stage::Reject(GatewayError::RateLimited {
                detail: format!("Rate limit exceeded. Try again in {} seconds.", retry_after),
                retry_after,
            }));
        }

        let outbound = OutboundRequest {
            method: request.method,
            sub_path: request.sub_path,
            query: request.query,
            headers: request.headers,
            body: request.body,
        };
        Ok(match self.forwarder.forward(&service, &identity, outbound).await {
            Ok(response) => Stage::Continue(response),
            Err(e) => Stage::Reject(e),
        })
    }

    async fn shed(&self, identity: &Identity, client_ip: &str) -> Stage<()> {
        let key = global_key(identity.user_id(), client_ip);
        match self
            .shedding
            .limiter
            .check(&key, self.shedding.limit, self.shedding.window)
            .await
        {
            RateDecision::Allowed { .. } => Stage::Continue(()),
            RateDecision::Limited { retry_after } => Stage::Reject(GatewayError::RateLimited {
                detail: "Too many requests".to_string(),
                retry_after,
            }),
        }
    }
}
