//! Resource Store Port
//!
//! Defines the interface to the versioned resource store backing the
//! control plane.

use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::value_objects::ResourceType;
use async_trait::async_trait;

/// Versioned CRUD store for resources.
///
/// This is an outbound port. Every write assigns a new version taken from a
/// store-wide revision counter, so versions of one resource only ever grow,
/// even across delete and re-create. Writes are visible to `get`/`list` as
/// soon as they return.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Identity of the backing data set. Changes when the data is lost.
    fn store_id(&self) -> &str;

    /// Get a resource by key.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError>;

    /// List resources of a type, optionally restricted to one mesh.
    async fn list(
        &self,
        resource_type: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError>;

    /// Create a resource. Fails with `AlreadyExists` if the key is taken.
    async fn create(&self, resource: Resource) -> Result<Resource, StoreError>;

    /// Update a resource. Fails with `Conflict` if `resource.version` does
    /// not match the stored version.
    async fn update(&self, resource: Resource) -> Result<Resource, StoreError>;

    /// Delete a resource, returning the revision assigned to the deletion.
    async fn delete(&self, key: &ResourceKey) -> Result<u64, StoreError>;
}
