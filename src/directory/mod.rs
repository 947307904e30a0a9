//! Service directory
//!
//! Resolves a logical service name to a descriptor. Lookup is owner-scoped:
//! an authenticated requester's own services win, otherwise only a public
//! service of that name is visible. Private services of other owners resolve
//! exactly like missing ones.

use crate::access_log::compute_stats;
use crate::error::GatewayError;
use crate::model::{Identity, ServiceDescriptor};
use crate::pipeline::Stage;
use crate::store::{LogScope, LogStore, ServiceStore, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A descriptor together with its usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceWithStats {
    #[serde(flatten)]
    pub service: ServiceDescriptor,
    pub total_requests: usize,
    pub success_rate: f64,
    pub avg_response_time: f64,
}

#[derive(Clone)]
pub struct ServiceDirectory {
    services: Arc<dyn ServiceStore>,
    logs: Arc<dyn LogStore>,
}

impl ServiceDirectory {
    pub fn new(services: Arc<dyn ServiceStore>, logs: Arc<dyn LogStore>) -> Self {
        Self { services, logs }
    }

    /// Find the service `name` as seen by `identity`
    pub async fn lookup(
        &self,
        name: &str,
        identity: &Identity,
    ) -> StoreResult<Option<ServiceDescriptor>> {
        if let Some(owner_id) = identity.user_id() {
            if let Some(service) = self.services.service_by_owner_and_name(owner_id, name).await? {
                return Ok(Some(service));
            }
        }
        self.services.public_service_by_name(name).await
    }

    /// Resolve `name` for the admission pipeline; a miss rejects with 404
    pub async fn resolve(
        &self,
        name: &str,
        identity: &Identity,
    ) -> StoreResult<Stage<ServiceDescriptor>> {
        Ok(match self.lookup(name, identity).await? {
            Some(service) => Stage::Continue(service),
            None => Stage::Reject(GatewayError::ServiceNotFound(name.to_string())),
        })
    }

    /// Descriptor plus request statistics from the access log
    pub async fn service_with_stats(&self, id: i64) -> StoreResult<Option<ServiceWithStats>> {
        let service = match self.services.service_by_id(id).await? {
            Some(service) => service,
            None => return Ok(None),
        };

        let scope = LogScope {
            service_id: Some(id),
            ..Default::default()
        };
        let records = self.logs.scan_logs(&scope).await?;
        let stats = compute_stats(&records, None, None);

        Ok(Some(ServiceWithStats {
            service,
            total_requests: stats.total_requests,
            success_rate: stats.success_rate,
            avg_response_time: stats.average_response_time,
        }))
    }
}
