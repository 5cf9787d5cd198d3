//! `ProviderAdapter` implementation over [`MemoryCloud`]

use crate::cloud::{InFlight, MemoryCloud};
use crate::fault::CallKind;
use async_trait::async_trait;
use serde_json::Value;
use stackflow_engine::{
    Attributes, CreatedResource, ProviderAdapter, ProviderError, ResolvedProps, ResourceType,
};

/// Serves one resource type out of a shared [`MemoryCloud`]
pub struct MemoryAdapter {
    cloud: MemoryCloud,
    resource_type: ResourceType,
    name: String,
}

impl MemoryAdapter {
    pub fn new(cloud: MemoryCloud, resource_type: ResourceType) -> Self {
        Self {
            cloud,
            resource_type,
            name: format!("memory-{}", resource_type.as_str()),
        }
    }

    async fn enter(&self, kind: CallKind, target: &str) -> Result<InFlight, ProviderError> {
        let (guard, latency) = self.cloud.begin(kind, self.resource_type, target)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(guard)
    }
}

#[async_trait]
impl ProviderAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, props: &ResolvedProps) -> Result<CreatedResource, ProviderError> {
        let target = props
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let _in_flight = self.enter(CallKind::Create, target).await?;
        self.cloud.create(self.resource_type, props)
    }

    async fn read(&self, remote_id: &str) -> Result<Attributes, ProviderError> {
        let _in_flight = self.enter(CallKind::Read, remote_id).await?;
        self.cloud.read(remote_id)
    }

    async fn update(
        &self,
        remote_id: &str,
        props: &ResolvedProps,
    ) -> Result<Attributes, ProviderError> {
        let _in_flight = self.enter(CallKind::Update, remote_id).await?;
        self.cloud.update(remote_id, props)
    }

    async fn delete(&self, remote_id: &str) -> Result<(), ProviderError> {
        let _in_flight = self.enter(CallKind::Delete, remote_id).await?;
        self.cloud.delete(remote_id)
    }
}
