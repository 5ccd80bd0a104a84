//! GPU capacity and organization quota signals.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::CapacityConfig;
use crate::core::types::OrganizationId;

/// Read-only capacity signals consulted during admission.
#[async_trait]
pub trait CapacitySignals: Send + Sync {
    /// Number of GPU reservations the platform can hold; `None` if unknown.
    async fn gpu_capacity(&self) -> Option<u32>;

    /// Job quota of an organization.
    async fn org_quota(&self, organization_id: &OrganizationId) -> u32;
}

/// Capacity signals taken from configuration.
///
/// The GPU capacity can be changed at runtime, e.g. by a node watcher.
pub struct StaticCapacity {
    gpu: RwLock<Option<u32>>,
    default_quota: u32,
    quotas: HashMap<OrganizationId, u32>,
}

impl StaticCapacity {
    pub fn new(gpu: Option<u32>, default_quota: u32) -> Self {
        Self {
            gpu: RwLock::new(gpu),
            default_quota,
            quotas: HashMap::new(),
        }
    }

    pub fn from_config(config: &CapacityConfig) -> Self {
        let mut capacity = Self::new(config.gpu, config.default_quota);
        for (org, quota) in &config.quotas {
            capacity.quotas.insert(OrganizationId::new(org.clone()), *quota);
        }
        capacity
    }

    pub fn with_quota(mut self, organization_id: impl Into<OrganizationId>, quota: u32) -> Self {
        self.quotas.insert(organization_id.into(), quota);
        self
    }

    pub fn set_gpu_capacity(&self, gpu: Option<u32>) {
        if let Ok(mut current) = self.gpu.write() {
            *current = gpu;
        }
    }
}

#[async_trait]
impl CapacitySignals for StaticCapacity {
    async fn gpu_capacity(&self) -> Option<u32> {
        self.gpu.read().ok().and_then(|gpu| *gpu)
    }

    async fn org_quota(&self, organization_id: &OrganizationId) -> u32 {
        self.quotas
            .get(organization_id)
            .copied()
            .unwrap_or(self.default_quota)
    }
}
