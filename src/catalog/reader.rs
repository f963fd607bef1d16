//! Catalog reader
//!
//! Read-only view used to route zone sessions to a global replica.

use super::{load, CatalogConfig};
use crate::domain::entities::CatalogInstance;
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use std::sync::Arc;

/// Pick the replica owning `zone` by rendezvous hashing.
///
/// Every replica computes the same owner from the same instance set, and
/// only zones owned by a departed replica move when membership changes.
pub fn rendezvous_owner<'a>(
    zone: &str,
    instances: &'a [CatalogInstance],
) -> Option<&'a CatalogInstance> {
    instances.iter().max_by(|a, b| {
        let wa = weight(zone, &a.id);
        let wb = weight(zone, &b.id);
        wa.cmp(&wb).then_with(|| b.id.cmp(&a.id))
    })
}

fn weight(zone: &str, instance_id: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(zone.as_bytes());
    hasher.update(b"/");
    hasher.update(instance_id.as_bytes());
    hasher.finalize()
}

#[derive(Clone)]
pub struct CatalogReader {
    store: Arc<dyn ResourceStore>,
    config: CatalogConfig,
}

impl CatalogReader {
    pub fn new(store: Arc<dyn ResourceStore>, config: CatalogConfig) -> Self {
        Self { store, config }
    }

    /// Live replicas at `now`, sorted by id.
    pub async fn instances(&self, now: u64) -> Result<Vec<CatalogInstance>, StoreError> {
        let (catalog, _) = load(self.store.as_ref()).await?;
        Ok(catalog.live(now, self.config.staleness_ms()))
    }

    /// Replica a session for `zone` should be served by.
    pub async fn owner_of(
        &self,
        zone: &str,
        now: u64,
    ) -> Result<Option<CatalogInstance>, StoreError> {
        let instances = self.instances(now).await?;
        Ok(rendezvous_owner(zone, &instances).cloned())
    }
}
