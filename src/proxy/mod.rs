//! Proxy module for forwarding admitted requests to backend services
//!
//! This module handles:
//! - Target URL construction (base URL plus the sub-path after the service name)
//! - Outbound header policy (hop-by-hop stripping, allow-list, identity injection)
//! - One outbound call per request under a process-wide timeout
//! - Mapping transport failures to gateway errors

use crate::error::GatewayError;
use crate::model::{CredentialSource, Identity, ServiceDescriptor};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, warn};

/// Marker header set on every forwarded request
pub const GATEWAY_MARKER_HEADER: &str = "x-api-gateway";

/// A request on its way to a backend
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path after `/gateway/{service}/`, without the leading slash
    pub sub_path: Option<String>,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A response received from a backend
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwarding seam between the admission pipeline and the network
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        identity: &Identity,
        request: OutboundRequest,
    ) -> Result<BackendResponse, GatewayError>;
}

/// Forwards requests over HTTP(S) with reqwest
#[derive(Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
}

impl ProxyForwarder {
    /// Create a forwarder whose calls are bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Forward for ProxyForwarder {
    async fn forward(
        &self,
        service: &ServiceDescriptor,
        identity: &Identity,
        request: OutboundRequest,
    ) -> Result<BackendResponse, GatewayError> {
        let target_url = build_target_url(
            &service.base_url,
            request.sub_path.as_deref(),
            request.query.as_deref(),
        );
        let headers = outbound_headers(service, identity, &request.headers);
        debug!(
            service = %service.name,
            method = %request.method,
            url = %target_url,
            "Forwarding request"
        );

        let response = self
            .client
            .request(request.method, &target_url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| map_transport_error(&service.name, e))?;

        let status = response.status();
        let mut headers = response_headers(response.headers());
        // the backend answered; a broken body never replaces its status
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    service = %service.name,
                    %status,
                    "Failed to read backend response body: {}",
                    e
                );
                headers.remove(axum::http::header::CONTENT_TYPE);
                Bytes::new()
            }
        };

        let (headers, body) = json_body_only(&service.name, headers, body);
        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_transport_error(service: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        warn!(service = %service, "Backend call timed out");
        GatewayError::bad_gateway("Service timeout")
    } else if e.is_builder() {
        GatewayError::proxy_failure(format!("Failed to build request: {}", e))
    } else {
        warn!(service = %service, "Backend call failed: {}", e);
        GatewayError::bad_gateway(format!("Error communicating with service: {}", e))
    }
}

/// Join the base URL, sub-path and query with single separators
pub fn build_target_url(base_url: &str, sub_path: Option<&str>, query: Option<&str>) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();

    if let Some(path) = sub_path.map(|p| p.trim_start_matches('/')) {
        if !path.is_empty() {
            url.push('/');
            url.push_str(path);
        }
    }

    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", url, q),
        _ => url,
    }
}

/// Check if a header is hop-by-hop (or recomputed per hop) and must not be copied
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Build the headers sent to the backend
///
/// `Host` and hop-by-hop headers are dropped, a non-empty allow-list keeps
/// only the listed names, the caller's identity is injected when the service
/// asks for it and the gateway marker is always set.
pub fn outbound_headers(
    service: &ServiceDescriptor,
    identity: &Identity,
    inbound: &HeaderMap,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in inbound.iter() {
        if is_hop_by_hop_header(name.as_str()) {
            continue;
        }
        // header names are already lowercase
        if !service.forward_headers.is_empty()
            && !service.forward_headers.iter().any(|h| h == name.as_str())
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if service.require_authentication {
        if let Some(header_name) = &service.auth_header_name {
            inject_identity(&mut headers, header_name, identity);
        }
    }

    headers.insert(
        HeaderName::from_static(GATEWAY_MARKER_HEADER),
        HeaderValue::from_static("true"),
    );
    headers
}

fn inject_identity(headers: &mut HeaderMap, header_name: &str, identity: &Identity) {
    let value = match identity {
        Identity::Authenticated {
            source: CredentialSource::ApiKey { key, .. },
            ..
        } => format!("ApiKey {}", key),
        Identity::Authenticated {
            source: CredentialSource::BearerToken,
            user_id,
            ..
        } => user_id.to_string(),
        Identity::Anonymous => return,
    };

    match (
        HeaderName::try_from(header_name),
        HeaderValue::try_from(value),
    ) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => warn!("Invalid identity injection header '{}'", header_name),
    }
}

/// Backend response headers passed through to the caller
pub fn response_headers(backend: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in backend.iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Drop a non-empty body that is not JSON, keeping the status
fn json_body_only(service: &str, mut headers: HeaderMap, body: Bytes) -> (HeaderMap, Bytes) {
    if body.is_empty() || serde_json::from_slice::<serde_json::Value>(&body).is_ok() {
        return (headers, body);
    }

    debug!(
        service = %service,
        bytes = body.len(),
        "Dropping non-JSON backend response body"
    );
    headers.remove(axum::http::header::CONTENT_TYPE);
    (headers, Bytes::new())
}
