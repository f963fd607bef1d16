//! Evented Resource Store
//!
//! Decorates any ResourceStore so that every call is bounded by a timeout
//! and every successful write is announced on the event bus.

use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::value_objects::ResourceType;
use crate::infrastructure::event_bus::{EventBus, Operation, ResourceChangedEvent};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Store decorator publishing change events.
pub struct EventedResourceStore {
    inner: Arc<dyn ResourceStore>,
    bus: EventBus,
    timeout: Duration,
}

impl EventedResourceStore {
    pub fn new(inner: Arc<dyn ResourceStore>, bus: EventBus, timeout: Duration) -> Self {
        Self {
            inner,
            bus,
            timeout,
        }
    }

    /// Bus this store publishes to.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{} timed out after {:?}",
                op, self.timeout
            ))),
        }
    }

    fn announce(&self, operation: Operation, key: ResourceKey, version: u64) {
        tracing::debug!("resource {:?} {} version={}", operation, key, version);
        self.bus.publish(ResourceChangedEvent {
            operation,
            key,
            version,
        });
    }
}

#[async_trait]
impl ResourceStore for EventedResourceStore {
    fn store_id(&self) -> &str {
        self.inner.store_id()
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn list(
        &self,
        resource_type: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError> {
        self.bounded("list", self.inner.list(resource_type, mesh))
            .await
    }

    async fn create(&self, resource: Resource) -> Result<Resource, StoreError> {
        let created = self.bounded("create", self.inner.create(resource)).await?;
        self.announce(Operation::Create, created.key(), created.version);
        Ok(created)
    }

    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> {
        let updated = self.bounded("update", self.inner.update(resource)).await?;
        self.announce(Operation::Update, updated.key(), updated.version);
        Ok(updated)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<u64, StoreError> {
        let version = self.bounded("delete", self.inner.delete(key)).await?;
        self.announce(Operation::Delete, key.clone(), version);
        Ok(version)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryResourceStore;
    use crate::domain::entities::{MeshSpec, ResourceSpec};
    use crate::infrastructure::event_bus::BusEvent;

    /// Store whose calls never complete.
    struct HangingStore;

    #[async_trait]
    impl ResourceStore for HangingStore {
        fn store_id(&self) -> &str {
            "hanging"
        }
        async fn get(&self, _key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
            std::future::pending().await
        }
        async fn list(
            &self,
            _resource_type: ResourceType,
            _mesh: Option<&str>,
        ) -> Result<Vec<Resource>, StoreError> {
            std::future::pending().await
        }
        async fn create(&self, _resource: Resource) -> Result<Resource, StoreError> {
            std::future::pending().await
        }
        async fn update(&self, _resource: Resource) -> Result<Resource, StoreError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &ResourceKey) -> Result<u64, StoreError> {
            std::future::pending().await
        }
    }

    fn mesh(name: &str) -> Resource {
        Resource::new(
            ResourceKey::global(ResourceType::Mesh, name),
            ResourceSpec::Mesh(MeshSpec::default()),
        )
    }

    #[tokio::test]
    async fn test_writes_are_announced() {
        let bus = EventBus::new(10);
        let mut listener = bus.subscribe(|_| true);
        let store = EventedResourceStore::new(
            Arc::new(MemoryResourceStore::new()),
            bus,
            Duration::from_secs(1),
        );

        let created = store.create(mesh("default")).await.unwrap();
        let updated = store.update(created.clone()).await.unwrap();
        let deleted_at = store.delete(&created.key()).await.unwrap();

        let mut seen = Vec::new();
        while let Some(BusEvent::Changed(ev)) = listener.try_recv() {
            seen.push((ev.operation, ev.version));
        }
        assert_eq!(
            seen,
            vec![
                (Operation::Create, created.version),
                (Operation::Update, updated.version),
                (Operation::Delete, deleted_at),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_write_is_not_announced() {
        let bus = EventBus::new(10);
        let mut listener = bus.subscribe(|_| true);
        let store = EventedResourceStore::new(
            Arc::new(MemoryResourceStore::new()),
            bus,
            Duration::from_secs(1),
        );

        assert!(store.update(mesh("missing")).await.is_err());
        assert_eq!(listener.try_recv(), None);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        let store = EventedResourceStore::new(
            Arc::new(HangingStore),
            EventBus::default(),
            Duration::from_millis(20),
        );

        let err = store
            .get(&ResourceKey::global(ResourceType::Mesh, "default"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
