//! Instance Catalog
//!
//! Registry of live control-plane replicas, persisted as one config record
//! in the resource store. Every replica heartbeats its own entry; only the
//! leader prunes.

mod heartbeat;
mod reader;
mod writer;

pub use heartbeat::CatalogHeartbeat;
pub use reader::{rendezvous_owner, CatalogReader};
pub use writer::CatalogWriter;

use crate::domain::entities::{Catalog, ConfigSpec, Resource, ResourceKey, ResourceSpec};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::value_objects::ResourceType;
use std::time::Duration;

/// Attempts for one read-modify-write of the catalog record.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Catalog timing.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    /// How often each replica refreshes its entry (default: 5s)
    pub heartbeat_interval: Duration,
    /// How often the leader prunes the catalog (default: 15s)
    pub writer_interval: Duration,
    /// Entries older than `heartbeat_interval × staleness_multiplier` are stale (default: 3)
    pub staleness_multiplier: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            writer_interval: Duration::from_secs(15),
            staleness_multiplier: 3,
        }
    }
}

impl CatalogConfig {
    pub fn new(heartbeat_interval: Duration, writer_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            writer_interval,
            ..Default::default()
        }
    }

    pub fn staleness_multiplier(mut self, multiplier: u32) -> Self {
        self.staleness_multiplier = multiplier;
        self
    }

    /// Age after which an entry counts as stale, in milliseconds.
    pub fn staleness_ms(&self) -> u64 {
        (self.heartbeat_interval * self.staleness_multiplier.max(1)).as_millis() as u64
    }
}

pub(crate) fn catalog_key() -> ResourceKey {
    ResourceKey::global(ResourceType::Config, Catalog::RECORD_NAME)
}

/// Read the catalog together with the record it came from.
pub(crate) async fn load(
    store: &dyn ResourceStore,
) -> Result<(Catalog, Option<Resource>), StoreError> {
    let Some(record) = store.get(&catalog_key()).await? else {
        return Ok((Catalog::default(), None));
    };
    let data = record
        .spec
        .as_config()
        .map(|c| c.config.as_str())
        .unwrap_or("");
    let catalog = Catalog::from_json(data)
        .map_err(|e| StoreError::Invalid(format!("catalog record: {}", e)))?;
    Ok((catalog, Some(record)))
}

/// Write the catalog back, creating the record if needed.
pub(crate) async fn save(
    store: &dyn ResourceStore,
    catalog: &Catalog,
    record: Option<Resource>,
) -> Result<(), StoreError> {
    let data = catalog
        .to_json()
        .map_err(|e| StoreError::Invalid(format!("catalog record: {}", e)))?;
    let spec = ResourceSpec::Config(ConfigSpec { config: data });

    match record {
        Some(mut record) => {
            record.spec = spec;
            store.update(record).await?;
        }
        None => {
            store.create(Resource::new(catalog_key(), spec)).await?;
        }
    }
    Ok(())
}
