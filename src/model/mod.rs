//! Domain model
//!
//! Types shared by the admission pipeline, the collaborator stores and the
//! management API:
//! - Identities and roles
//! - Users and API keys
//! - Service descriptors and their partial-update patches
//! - Access log records and log filters

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// User role used for authorization decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    ServiceOwner,
    #[default]
    Developer,
    Viewer,
}

impl Role {
    /// Get the role name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::ServiceOwner => "service_owner",
            Role::Developer => "developer",
            Role::Viewer => "viewer",
        }
    }

    /// Whether the role may register and modify services
    pub fn can_manage_services(&self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// User fields accepted by the user store (password already hashed)
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub is_active: bool,
}

/// Partial update of a user (password already hashed)
///
/// `None` leaves the current value unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub password_hash: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

impl UserPatch {
    pub fn apply(&self, user: &mut User) {
        if let Some(email) = &self.email {
            user.email = email.clone();
        }
        if let Some(full_name) = &self.full_name {
            user.full_name = Some(full_name.clone());
        }
        if let Some(hash) = &self.password_hash {
            user.password_hash = hash.clone();
        }
        if let Some(role) = self.role {
            user.role = role;
        }
        if let Some(active) = self.is_active {
            user.is_active = active;
        }
    }
}

/// An API key issued to a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub user_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Whether `expires_at` is set and lies before `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp < now).unwrap_or(false)
    }

    /// Active and not expired
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

/// API key fields supplied on creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewApiKey {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// How an authenticated identity was established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    BearerToken,
    ApiKey { key_id: i64, key: String },
}

/// The principal making a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Anonymous,
    Authenticated {
        user_id: i64,
        role: Role,
        source: CredentialSource,
    },
}

impl Identity {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Identity::Authenticated { .. })
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Identity::Authenticated { user_id, .. } => Some(*user_id),
            Identity::Anonymous => None,
        }
    }

    /// Id of the API key the identity was resolved from, if any
    pub fn api_key_id(&self) -> Option<i64> {
        match self {
            Identity::Authenticated {
                source: CredentialSource::ApiKey { key_id, .. },
                ..
            } => Some(*key_id),
            _ => None,
        }
    }
}

/// Service lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Active => write!(f, "active"),
            ServiceStatus::Inactive => write!(f, "inactive"),
            ServiceStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Service visibility
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    #[default]
    Private,
}

fn default_rate_limit() -> u32 {
    60
}

fn default_rate_limit_duration() -> u64 {
    60
}

fn default_require_authentication() -> bool {
    true
}

/// A backend registered with the gateway under an owner-scoped name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub base_url: String,
    pub status: ServiceStatus,
    pub visibility: Visibility,
    pub owner_id: i64,
    /// Requests allowed per window
    pub rate_limit: u32,
    /// Window length in seconds
    pub rate_limit_duration: u64,
    pub require_authentication: bool,
    /// Forwarded-header allow-list (lowercase); empty forwards everything
    pub forward_headers: Vec<String>,
    /// Header used to tell the backend who the caller is
    pub auth_header_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServiceDescriptor {
    /// Only active services accept traffic
    pub fn is_routable(&self) -> bool {
        self.status == ServiceStatus::Active
    }

    pub fn is_public(&self) -> bool {
        self.visibility == Visibility::Public
    }

    /// Build a descriptor from creation fields
    pub fn from_new(id: i64, owner_id: i64, new: NewService, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: new.name,
            description: new.description,
            base_url: new.base_url,
            status: new.status,
            visibility: new.visibility,
            owner_id,
            rate_limit: new.rate_limit,
            rate_limit_duration: new.rate_limit_duration,
            require_authentication: new.require_authentication,
            forward_headers: normalize_header_list(new.forward_headers),
            auth_header_name: new.auth_header_name,
            created_at: now,
            updated_at: None,
        }
    }
}

/// Service fields supplied on creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewService {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_rate_limit_duration")]
    pub rate_limit_duration: u64,
    #[serde(default = "default_require_authentication")]
    pub require_authentication: bool,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default)]
    pub forward_headers: Vec<String>,
}

impl NewService {
    /// Validate creation fields
    pub fn validate(&self) -> Result<(), String> {
        validate_name(&self.name)?;
        validate_base_url(&self.base_url)?;
        validate_window(self.rate_limit, self.rate_limit_duration)
    }
}

/// Partial update of a service descriptor
///
/// Every field is optional; `None` leaves the current value unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub status: Option<ServiceStatus>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub rate_limit_duration: Option<u64>,
    #[serde(default)]
    pub require_authentication: Option<bool>,
    #[serde(default)]
    pub auth_header_name: Option<String>,
    #[serde(default)]
    pub forward_headers: Option<Vec<String>>,
}

impl ServicePatch {
    /// Validate the fields that are present
    pub fn validate(&self) -> Result<(), String> {
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(url) = &self.base_url {
            validate_base_url(url)?;
        }
        validate_window(
            self.rate_limit.unwrap_or(1),
            self.rate_limit_duration.unwrap_or(1),
        )
    }

    /// Apply the patch field by field
    pub fn apply(&self, service: &mut ServiceDescriptor, now: DateTime<Utc>) {
        if let Some(name) = &self.name {
            service.name = name.clone();
        }
        if let Some(description) = &self.description {
            service.description = Some(description.clone());
        }
        if let Some(base_url) = &self.base_url {
            service.base_url = base_url.clone();
        }
        if let Some(status) = self.status {
            service.status = status;
        }
        if let Some(visibility) = self.visibility {
            service.visibility = visibility;
        }
        if let Some(rate_limit) = self.rate_limit {
            service.rate_limit = rate_limit;
        }
        if let Some(duration) = self.rate_limit_duration {
            service.rate_limit_duration = duration;
        }
        if let Some(required) = self.require_authentication {
            service.require_authentication = required;
        }
        if let Some(header) = &self.auth_header_name {
            service.auth_header_name = Some(header.clone());
        }
        if let Some(headers) = &self.forward_headers {
            service.forward_headers = normalize_header_list(headers.clone());
        }
        service.updated_at = Some(now);
    }
}

fn normalize_header_list(headers: Vec<String>) -> Vec<String> {
    headers
        .into_iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("service name must not be empty".to_string());
    }
    if name.contains('/') {
        return Err(format!("service name '{}' must not contain '/'", name));
    }
    Ok(())
}

fn validate_base_url(url: &str) -> Result<(), String> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(format!("base_url '{}' must start with http:// or https://", url))
    }
}

fn validate_window(limit: u32, duration: u64) -> Result<(), String> {
    if limit == 0 {
        return Err("rate_limit must be greater than zero".to_string());
    }
    if duration == 0 {
        return Err("rate_limit_duration must be greater than zero".to_string());
    }
    Ok(())
}

/// One completed (or failed) request through the gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessLogRecord {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    /// Milliseconds
    pub response_time: f64,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query_params: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Filter for access log retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default)]
    pub service_id: Option<i64>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub method: Option<String>,
    /// Case-insensitive substring of the path
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub from_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

/// Largest page the log store hands out
pub const MAX_LOG_PAGE: usize = 1000;

fn default_log_limit() -> usize {
    100
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            service_id: None,
            user_id: None,
            status_code: None,
            method: None,
            path: None,
            from_date: None,
            to_date: None,
            skip: 0,
            limit: default_log_limit(),
        }
    }
}

impl LogFilter {
    /// Check whether a record satisfies every set criterion (paging excluded)
    pub fn matches(&self, record: &AccessLogRecord) -> bool {
        if self.service_id.is_some() && record.service_id != self.service_id {
            return false;
        }
        if self.user_id.is_some() && record.user_id != self.user_id {
            return false;
        }
        if let Some(status) = self.status_code {
            if record.status_code != status {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if !record.method.eq_ignore_ascii_case(method) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if !record
                .path
                .to_lowercase()
                .contains(&path.to_lowercase())
            {
                return false;
            }
        }
        if let Some(from) = self.from_date {
            if record.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to_date {
            if record.timestamp > to {
                return false;
            }
        }
        true
    }

    /// Page size clamped to `1..=MAX_LOG_PAGE`
    pub fn page_size(&self) -> usize {
        self.limit.clamp(1, MAX_LOG_PAGE)
    }
}
