//! Configuration module for the gateway service
//!
//! This module handles loading, validating and seeding configuration from
//! TOML files.

use crate::model::{NewApiKey, NewService, NewUser, Role};
use crate::store::{ApiKeyStore, MemoryStore, ServiceStore, UserStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;

/// Environment variable overriding `auth.jwt_secret`
pub const JWT_SECRET_ENV: &str = "GATEWAY_JWT_SECRET";

fn default_enabled() -> bool {
    true
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix of the management API
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Origins allowed by CORS; `"*"` allows any
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_prefix: default_api_prefix(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Token signing and password hashing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 signing secret (overridden by `GATEWAY_JWT_SECRET`)
    #[serde(default)]
    pub jwt_secret: String,
    /// Bearer token lifetime
    #[serde(default = "default_token_expire_minutes")]
    pub token_expire_minutes: i64,
    /// bcrypt cost for new password hashes
    #[serde(default = "default_password_hash_cost")]
    pub password_hash_cost: u32,
}

fn default_token_expire_minutes() -> i64 {
    60 * 24 * 8
}

fn default_password_hash_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_expire_minutes: default_token_expire_minutes(),
            password_hash_cost: default_password_hash_cost(),
        }
    }
}

/// Counter store used by the rate limiters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackend {
    /// Process-local counters
    #[default]
    Memory,
    /// Counters shared through Redis
    Redis,
    /// No counters; limits are never enforced
    Disabled,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub backend: CounterBackend,
    /// Redis URL, required by the `redis` backend
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Requests per window allowed by the global shedding limiter
    #[serde(default = "default_global_limit")]
    pub global_limit: u32,
    /// Global shedding window in seconds
    #[serde(default = "default_global_window")]
    pub global_window: u64,
}

fn default_global_limit() -> u32 {
    120
}

fn default_global_window() -> u64 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            redis_url: None,
            global_limit: default_global_limit(),
            global_window: default_global_window(),
        }
    }
}

/// Backend forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Timeout of one backend call in seconds
    #[serde(default = "default_proxy_timeout")]
    pub timeout: u64,
}

fn default_proxy_timeout() -> u64 {
    60
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout: default_proxy_timeout(),
        }
    }
}

/// Access log writer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    /// Records buffered before new ones are dropped
    #[serde(default = "default_access_log_buffer")]
    pub buffer: usize,
}

fn default_access_log_buffer() -> usize {
    1024
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            buffer: default_access_log_buffer(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path to expose metrics
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Whether health check is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Path for the liveness endpoint; readiness is served at `{path}/ready`
    #[serde(default = "default_health_path")]
    pub path: String,
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_health_path(),
        }
    }
}

/// A user created at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    /// bcrypt hash, see the `hash-password` command
    pub password_hash: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default = "default_enabled")]
    pub is_active: bool,
}

/// A service registered at startup on behalf of `owner`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    /// Username of the owner
    pub owner: String,
    #[serde(flatten)]
    pub service: NewService,
}

/// An API key issued at startup to `owner`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedApiKey {
    /// Username of the owner
    pub owner: String,
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// RFC 3339 timestamp, quoted
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub services: Vec<SeedService>,
    #[serde(default)]
    pub api_keys: Vec<SeedApiKey>,
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Load configuration from a TOML string
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut config: GatewayConfig = toml::from_str(s)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.auth.jwt_secret.is_empty() {
            anyhow::bail!(
                "auth.jwt_secret is empty; set it in the config or via {}",
                JWT_SECRET_ENV
            );
        }
        if self.auth.token_expire_minutes <= 0 {
            anyhow::bail!("auth.token_expire_minutes must be positive");
        }
        if !(4..=31).contains(&self.auth.password_hash_cost) {
            anyhow::bail!("auth.password_hash_cost must be between 4 and 31");
        }

        if !self.server.api_prefix.starts_with('/') || self.server.api_prefix == "/" {
            anyhow::bail!(
                "server.api_prefix '{}' must start with '/' and not be the root",
                self.server.api_prefix
            );
        }

        if self.rate_limit.global_limit == 0 || self.rate_limit.global_window == 0 {
            anyhow::bail!("rate_limit.global_limit and rate_limit.global_window must be positive");
        }
        if self.rate_limit.backend == CounterBackend::Redis && self.rate_limit.redis_url.is_none() {
            anyhow::bail!("rate_limit.backend = \"redis\" requires rate_limit.redis_url");
        }

        if self.proxy.timeout == 0 {
            anyhow::bail!("proxy.timeout must be positive");
        }

        let mut usernames = HashSet::new();
        for user in &self.users {
            if !usernames.insert(user.username.as_str()) {
                anyhow::bail!("Duplicate user '{}'", user.username);
            }
        }

        let mut service_names = HashSet::new();
        for seed in &self.services {
            if !usernames.contains(seed.owner.as_str()) {
                anyhow::bail!(
                    "Service '{}' references unknown owner '{}'",
                    seed.service.name,
                    seed.owner
                );
            }
            if let Err(e) = seed.service.validate() {
                anyhow::bail!("Invalid service '{}': {}", seed.service.name, e);
            }
            if !service_names.insert((seed.owner.as_str(), seed.service.name.as_str())) {
                anyhow::bail!(
                    "Duplicate service '{}' for owner '{}'",
                    seed.service.name,
                    seed.owner
                );
            }
        }

        let mut keys = HashSet::new();
        for seed in &self.api_keys {
            if !usernames.contains(seed.owner.as_str()) {
                anyhow::bail!(
                    "API key '{}' references unknown owner '{}'",
                    seed.name,
                    seed.owner
                );
            }
            if seed.key.is_empty() {
                anyhow::bail!("API key '{}' has an empty value", seed.name);
            }
            if !keys.insert(seed.key.as_str()) {
                anyhow::bail!("Duplicate API key value for key '{}'", seed.name);
            }
        }

        Ok(())
    }

    /// Get server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Insert the seed users, services and API keys into `store`
    pub async fn seed(&self, store: &MemoryStore) -> anyhow::Result<()> {
        let mut user_ids: HashMap<&str, i64> = HashMap::new();

        for seed in &self.users {
            let user = store
                .insert_user(NewUser {
                    username: seed.username.clone(),
                    email: seed
                        .email
                        .clone()
                        .unwrap_or_else(|| format!("{}@localhost", seed.username)),
                    full_name: seed.full_name.clone(),
                    password_hash: seed.password_hash.clone(),
                    role: seed.role,
                    is_active: seed.is_active,
                })
                .await?;
            user_ids.insert(seed.username.as_str(), user.id);
        }

        for seed in &self.services {
            let owner_id = owner_id(&user_ids, &seed.owner)?;
            let service = store.insert_service(owner_id, seed.service.clone()).await?;
            info!(
                "Registered service '{}' -> {} (owner: {})",
                service.name, service.base_url, seed.owner
            );
        }

        for seed in &self.api_keys {
            let owner_id = owner_id(&user_ids, &seed.owner)?;
            store
                .insert_key(
                    owner_id,
                    seed.key.clone(),
                    NewApiKey {
                        name: seed.name.clone(),
                        description: seed.description.clone(),
                        expires_at: seed.expires_at,
                    },
                )
                .await?;
        }

        info!(
            users = self.users.len(),
            services = self.services.len(),
            api_keys = self.api_keys.len(),
            "Seeded in-memory stores"
        );
        Ok(())
    }
}

fn owner_id(user_ids: &HashMap<&str, i64>, owner: &str) -> anyhow::Result<i64> {
    user_ids
        .get(owner)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("Unknown owner '{}'", owner))
}
