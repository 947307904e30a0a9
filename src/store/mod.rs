//! Collaborator store contracts
//!
//! The gateway core depends on these traits only:
//! - `UserStore`, `ApiKeyStore`, `ServiceStore`: the relational store
//! - `LogStore`: the access log document store
//! - `CounterStore`: the atomic-increment counter store used by rate limiting
//!
//! Implementations are injected at startup as `Arc<dyn Trait>` so tests can
//! substitute fakes.

mod memory;
mod redis_counter;

pub use self::memory::{MemoryCounterStore, MemoryStore};
pub use self::redis_counter::RedisCounterStore;

use crate::model::{
    AccessLogRecord, ApiKey, LogFilter, NewApiKey, NewService, NewUser, ServiceDescriptor,
    ServicePatch, ServiceStatus, User, UserPatch, Visibility,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Page {
    /// Page `page` (1-based) of `size` items; `None` when the offset overflows
    pub fn numbered(page: usize, size: usize) -> Option<Self> {
        let skip = page.saturating_sub(1).checked_mul(size)?;
        Some(Self { skip, limit: size })
    }
}

/// Filter for listing services
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub owner_id: Option<i64>,
    pub status: Option<ServiceStatus>,
    pub visibility: Option<Visibility>,
}

/// Scope of a log statistics scan
#[derive(Debug, Clone, Default)]
pub struct LogScope {
    pub service_id: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_id(&self, id: i64) -> StoreResult<Option<User>>;

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>>;

    /// Insert a user; `Conflict` when the username is taken
    async fn insert_user(&self, user: NewUser) -> StoreResult<User>;

    /// All users ordered by id, with the total count
    async fn list_users(&self, page: Page) -> StoreResult<(Vec<User>, usize)>;

    /// Apply a patch; `None` when the user does not exist
    async fn update_user(&self, id: i64, patch: &UserPatch) -> StoreResult<Option<User>>;

    async fn delete_user(&self, id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Point lookup by the key value itself
    async fn key_by_value(&self, key: &str) -> StoreResult<Option<ApiKey>>;

    async fn insert_key(&self, user_id: i64, value: String, key: NewApiKey) -> StoreResult<ApiKey>;

    /// Keys owned by a user with the total count
    async fn keys_for_user(&self, user_id: i64, page: Page) -> StoreResult<(Vec<ApiKey>, usize)>;

    /// Mark a key inactive; false when the user owns no such key
    async fn deactivate_key(&self, key_id: i64, user_id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn service_by_id(&self, id: i64) -> StoreResult<Option<ServiceDescriptor>>;

    async fn service_by_owner_and_name(
        &self,
        owner_id: i64,
        name: &str,
    ) -> StoreResult<Option<ServiceDescriptor>>;

    /// Public service registered under `name`, lowest id first
    async fn public_service_by_name(&self, name: &str) -> StoreResult<Option<ServiceDescriptor>>;

    async fn list_services(
        &self,
        query: &ServiceQuery,
        page: Page,
    ) -> StoreResult<(Vec<ServiceDescriptor>, usize)>;

    /// Insert a service; `Conflict` when the owner already has that name
    async fn insert_service(
        &self,
        owner_id: i64,
        service: NewService,
    ) -> StoreResult<ServiceDescriptor>;

    /// Apply a patch; `None` when the service does not exist
    async fn update_service(
        &self,
        id: i64,
        patch: &ServicePatch,
    ) -> StoreResult<Option<ServiceDescriptor>>;

    async fn delete_service(&self, id: i64) -> StoreResult<bool>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn insert_log(&self, record: AccessLogRecord) -> StoreResult<()>;

    /// Matching records, newest first, paged by the filter
    async fn find_logs(&self, filter: &LogFilter) -> StoreResult<Vec<AccessLogRecord>>;

    /// Every record in scope, for aggregation
    async fn scan_logs(&self, scope: &LogScope) -> StoreResult<Vec<AccessLogRecord>>;
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key`; when the new value is 1 the key expires
    /// after `ttl_secs`. Returns the post-increment value.
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> StoreResult<u64>;

    /// Remaining time to live in seconds, `None` for missing or persistent keys
    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>>;
}
