//! Gateway error taxonomy
//!
//! Every stage failure maps to exactly one variant; the variant decides the
//! status code, the error code and any extra response headers.

use crate::store::StoreError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Challenge scheme advertised on 401 responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    ApiKey,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Bearer => "Bearer",
            AuthScheme::ApiKey => "ApiKey",
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{detail}")]
    Authentication { detail: String, scheme: AuthScheme },

    #[error("{0}")]
    Authorization(String),

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{detail}")]
    RateLimited { detail: String, retry_after: u64 },

    #[error("{detail}")]
    Proxy { status: StatusCode, detail: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn bearer(detail: impl Into<String>) -> Self {
        Self::Authentication {
            detail: detail.into(),
            scheme: AuthScheme::Bearer,
        }
    }

    pub fn api_key(detail: impl Into<String>) -> Self {
        Self::Authentication {
            detail: detail.into(),
            scheme: AuthScheme::ApiKey,
        }
    }

    pub fn bad_gateway(detail: impl Into<String>) -> Self {
        Self::Proxy {
            status: StatusCode::BAD_GATEWAY,
            detail: detail.into(),
        }
    }

    /// Failure preparing the backend call
    pub fn proxy_failure(detail: impl Into<String>) -> Self {
        Self::Proxy {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            Self::ServiceNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Proxy { status, .. } => *status,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code carried in the error body
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization(_) => "authorization_error",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::NotFound(_) => "not_found",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::RateLimited { .. } => "rate_limit_exceeded",
            Self::Proxy { .. } => "proxy_error",
            Self::BadRequest(_) => "bad_request",
            Self::Store(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Short stage label used for the rejection metric
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Authentication { .. } | Self::Authorization(_) => "auth",
            Self::ServiceNotFound(_) | Self::NotFound(_) => "resolve",
            Self::ServiceUnavailable(_) => "status",
            Self::RateLimited { .. } => "rate_limit",
            Self::Proxy { .. } => "proxy",
            Self::BadRequest(_) => "request",
            Self::Store(_) => "store",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    detail: String,
    error_code: &'a str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            detail: self.to_string(),
            error_code: self.error_code(),
        };
        let mut response = (status, Json(body)).into_response();

        let headers = response.headers_mut();
        match &self {
            Self::Authentication { scheme, .. } => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(scheme.as_str()),
                );
            }
            Self::RateLimited { retry_after, .. } => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(*retry_after));
            }
            _ => {}
        }

        response
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
