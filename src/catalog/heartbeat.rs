//! Catalog heartbeat
//!
//! Every replica, leader or not, periodically upserts its own entry.

use super::{load, save, CatalogConfig, MAX_WRITE_ATTEMPTS};
use crate::domain::entities::CatalogInstance;
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::value_objects::unix_millis;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Periodic self-registration of one replica.
pub struct CatalogHeartbeat {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<dyn MetricsStore>,
    config: CatalogConfig,
    instance_id: String,
    address: String,
}

impl CatalogHeartbeat {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsStore>,
        config: CatalogConfig,
        instance_id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
            instance_id: instance_id.into(),
            address: address.into(),
        }
    }

    /// Upsert this replica's entry stamped with `now`.
    pub async fn beat(&self, now: u64) -> Result<(), StoreError> {
        let mut last_err = None;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let (mut catalog, record) = load(self.store.as_ref()).await?;
            catalog.upsert(CatalogInstance {
                id: self.instance_id.clone(),
                address: self.address.clone(),
                last_heartbeat: now,
            });

            match save(self.store.as_ref(), &catalog, record).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    tracing::debug!("catalog heartbeat conflict, retrying: {}", e);
                    self.metrics.record_catalog_conflict();
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::Unavailable("catalog heartbeat".to_string())))
    }

    /// Heartbeat until `cancel` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.beat(unix_millis()).await {
                tracing::warn!("catalog heartbeat for {} failed: {}", self.instance_id, e);
            }
        }
    }
}
