//! In-memory store implementations
//!
//! Used by single-process deployments (seeded from the configuration file)
//! and by tests. State is lost on restart.

use super::{
    ApiKeyStore, CounterStore, LogScope, LogStore, Page, ServiceQuery, ServiceStore,
    StoreError, StoreResult, UserStore,
};
use crate::model::{
    AccessLogRecord, ApiKey, LogFilter, NewApiKey, NewService, NewUser, ServiceDescriptor,
    ServicePatch, User, UserPatch,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// In-memory relational and log store
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<i64, User>>,
    api_keys: RwLock<HashMap<i64, ApiKey>>,
    services: RwLock<HashMap<i64, ServiceDescriptor>>,
    logs: RwLock<Vec<AccessLogRecord>>,
    next_user_id: AtomicI64,
    next_key_id: AtomicI64,
    next_service_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(counter: &AtomicI64) -> i64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of stored log records
    pub async fn log_count(&self) -> usize {
        self.logs.read().await.len()
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items.into_iter().skip(page.skip).take(page.limit).collect()
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn user_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn insert_user(&self, user: NewUser) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if users.values().any(|u| u.username == user.username) {
            return Err(StoreError::Conflict(format!(
                "username '{}' already registered",
                user.username
            )));
        }

        let stored = User {
            id: Self::next_id(&self.next_user_id),
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            password_hash: user.password_hash,
            role: user.role,
            is_active: user.is_active,
            created_at: Utc::now(),
        };
        users.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn list_users(&self, page: Page) -> StoreResult<(Vec<User>, usize)> {
        let mut users: Vec<User> = self.users.read().await.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        let total = users.len();
        Ok((paginate(users, page), total))
    }

    async fn update_user(&self, id: i64, patch: &UserPatch) -> StoreResult<Option<User>> {
        Ok(self.users.write().await.get_mut(&id).map(|user| {
            patch.apply(user);
            user.clone()
        }))
    }

    async fn delete_user(&self, id: i64) -> StoreResult<bool> {
        Ok(self.users.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn key_by_value(&self, key: &str) -> StoreResult<Option<ApiKey>> {
        Ok(self
            .api_keys
            .read()
            .await
            .values()
            .find(|k| k.key == key)
            .cloned())
    }

    async fn insert_key(&self, user_id: i64, value: String, key: NewApiKey) -> StoreResult<ApiKey> {
        let mut keys = self.api_keys.write().await;
        if keys.values().any(|k| k.key == value) {
            return Err(StoreError::Conflict("API key value already exists".to_string()));
        }

        let stored = ApiKey {
            id: Self::next_id(&self.next_key_id),
            key: value,
            name: key.name,
            description: key.description,
            user_id,
            is_active: true,
            created_at: Utc::now(),
            expires_at: key.expires_at,
        };
        keys.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn keys_for_user(&self, user_id: i64, page: Page) -> StoreResult<(Vec<ApiKey>, usize)> {
        let mut owned: Vec<ApiKey> = self
            .api_keys
            .read()
            .await
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        owned.sort_by_key(|k| k.id);
        let total = owned.len();
        Ok((paginate(owned, page), total))
    }

    async fn deactivate_key(&self, key_id: i64, user_id: i64) -> StoreResult<bool> {
        let mut keys = self.api_keys.write().await;
        match keys.get_mut(&key_id) {
            Some(key) if key.user_id == user_id => {
                key.is_active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn service_by_id(&self, id: i64) -> StoreResult<Option<ServiceDescriptor>> {
        Ok(self.services.read().await.get(&id).cloned())
    }

    async fn service_by_owner_and_name(
        &self,
        owner_id: i64,
        name: &str,
    ) -> StoreResult<Option<ServiceDescriptor>> {
        Ok(self
            .services
            .read()
            .await
            .values()
            .find(|s| s.owner_id == owner_id && s.name == name)
            .cloned())
    }

    async fn public_service_by_name(&self, name: &str) -> StoreResult<Option<ServiceDescriptor>> {
        Ok(self
            .services
            .read()
            .await
            .values()
            .filter(|s| s.name == name && s.is_public())
            .min_by_key(|s| s.id)
            .cloned())
    }

    async fn list_services(
        &self,
        query: &ServiceQuery,
        page: Page,
    ) -> StoreResult<(Vec<ServiceDescriptor>, usize)> {
        let mut matching: Vec<ServiceDescriptor> = self
            .services
            .read()
            .await
            .values()
            .filter(|s| query.owner_id.map(|o| s.owner_id == o).unwrap_or(true))
            .filter(|s| query.status.map(|st| s.status == st).unwrap_or(true))
            .filter(|s| query.visibility.map(|v| s.visibility == v).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.id);
        let total = matching.len();
        Ok((paginate(matching, page), total))
    }

    async fn insert_service(
        &self,
        owner_id: i64,
        service: NewService,
    ) -> StoreResult<ServiceDescriptor> {
        let mut services = self.services.write().await;
        if services
            .values()
            .any(|s| s.owner_id == owner_id && s.name == service.name)
        {
            return Err(StoreError::Conflict(format!(
                "service '{}' already exists for this owner",
                service.name
            )));
        }

        let stored = ServiceDescriptor::from_new(
            Self::next_id(&self.next_service_id),
            owner_id,
            service,
            Utc::now(),
        );
        services.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_service(
        &self,
        id: i64,
        patch: &ServicePatch,
    ) -> StoreResult<Option<ServiceDescriptor>> {
        let mut services = self.services.write().await;
        let owner_id = match services.get(&id) {
            Some(s) => s.owner_id,
            None => return Ok(None),
        };

        if let Some(name) = &patch.name {
            if services
                .values()
                .any(|s| s.id != id && s.owner_id == owner_id && &s.name == name)
            {
                return Err(StoreError::Conflict(format!(
                    "service '{}' already exists for this owner",
                    name
                )));
            }
        }

        Ok(services.get_mut(&id).map(|service| {
            patch.apply(service, Utc::now());
            service.clone()
        }))
    }

    async fn delete_service(&self, id: i64) -> StoreResult<bool> {
        Ok(self.services.write().await.remove(&id).is_some())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn insert_log(&self, record: AccessLogRecord) -> StoreResult<()> {
        self.logs.write().await.push(record);
        Ok(())
    }

    async fn find_logs(&self, filter: &LogFilter) -> StoreResult<Vec<AccessLogRecord>> {
        let logs = self.logs.read().await;
        let mut matching: Vec<AccessLogRecord> =
            logs.iter().filter(|r| filter.matches(r)).cloned().collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matching
            .into_iter()
            .skip(filter.skip)
            .take(filter.page_size())
            .collect())
    }

    async fn scan_logs(&self, scope: &LogScope) -> StoreResult<Vec<AccessLogRecord>> {
        let filter = LogFilter {
            service_id: scope.service_id,
            from_date: scope.from,
            to_date: scope.to,
            ..Default::default()
        };
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-memory atomic counter store
///
/// Each increment holds the shard lock of its key, so concurrent increments
/// of one key never lose updates. Expired counters restart from zero on next
/// access; `purge_expired` drops them eagerly.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, Counter>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired counters, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, c| !c.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl_secs: u64) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });

        if entry.is_expired(now) {
            entry.value = 0;
            entry.expires_at = None;
        }

        entry.value += 1;
        if entry.value == 1 {
            entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
        }
        Ok(entry.value)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = Instant::now();
        Ok(self.counters.get(key).and_then(|c| match c.expires_at {
            Some(at) if at > now => {
                let remaining = at.duration_since(now);
                // round up so a live key never reports zero
                Some(remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0))
            }
            _ => None,
        }))
    }
}
