//! In-Memory Resource Store
//!
//! Implements ResourceStore using DashMap for lock-free concurrent access.
//! State lives only as long as the process; every instance gets a fresh
//! store id.

use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::registry;
use crate::domain::value_objects::ResourceType;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// DashMap-backed resource store.
pub struct MemoryResourceStore {
    resources: DashMap<ResourceKey, Resource>,
    revision: AtomicU64,
    store_id: String,
}

impl MemoryResourceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            revision: AtomicU64::new(0),
            store_id: format!("memory-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Number of stored resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        Ok(self.resources.get(key).map(|e| e.value().clone()))
    }

    async fn list(
        &self,
        resource_type: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError> {
        let mut resources: Vec<Resource> = self
            .resources
            .iter()
            .filter(|e| e.key().resource_type == resource_type)
            .filter(|e| match mesh {
                Some(m) => e.key().mesh.as_deref() == Some(m),
                None => true,
            })
            .map(|e| e.value().clone())
            .collect();
        resources.sort_by(|a, b| (&a.mesh, &a.name).cmp(&(&b.mesh, &b.name)));
        Ok(resources)
    }

    async fn create(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        registry::validate(&resource)?;
        let key = resource.key();

        match self.resources.entry(key.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(key.to_string())),
            Entry::Vacant(slot) => {
                resource.version = self.next_revision();
                slot.insert(resource.clone());
                Ok(resource)
            }
        }
    }

    async fn update(&self, mut resource: Resource) -> Result<Resource, StoreError> {
        registry::validate(&resource)?;
        let key = resource.key();

        match self.resources.get_mut(&key) {
            None => Err(StoreError::NotFound(key.to_string())),
            Some(mut entry) => {
                let stored = entry.value().version;
                if stored != resource.version {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                        expected: resource.version,
                        actual: stored,
                    });
                }
                resource.version = self.next_revision();
                *entry.value_mut() = resource.clone();
                Ok(resource)
            }
        }
    }

    async fn delete(&self, key: &ResourceKey) -> Result<u64, StoreError> {
        match self.resources.remove(key) {
            Some(_) => Ok(self.next_revision()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }
}
