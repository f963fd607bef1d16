//! Catalog writer
//!
//! Leader-only pruning of stale and duplicate catalog entries.

use super::{load, save, CatalogConfig, MAX_WRITE_ATTEMPTS};
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::value_objects::unix_millis;
use crate::leader::{LeaderComponent, LeaderContext};
use async_trait::async_trait;
use std::sync::Arc;

pub struct CatalogWriter {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<dyn MetricsStore>,
    config: CatalogConfig,
}

impl CatalogWriter {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsStore>,
        config: CatalogConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    /// Drop stale and duplicate entries. Returns how many were removed.
    pub async fn prune(&self, now: u64) -> Result<usize, StoreError> {
        let mut last_err = None;

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let (mut catalog, record) = load(self.store.as_ref()).await?;
            let removed = catalog.prune(now, self.config.staleness_ms());
            if removed == 0 {
                return Ok(0);
            }

            match save(self.store.as_ref(), &catalog, record).await {
                Ok(()) => return Ok(removed),
                Err(e) if e.is_conflict() => {
                    self.metrics.record_catalog_conflict();
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| StoreError::Unavailable("catalog prune".to_string())))
    }
}

#[async_trait]
impl LeaderComponent for CatalogWriter {
    fn name(&self) -> &str {
        "catalog-writer"
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(&self, ctx: LeaderContext) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.writer_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if !ctx.leadership.is_held().await {
                tracing::debug!("catalog writer skipping tick, lease not held");
                continue;
            }

            match self.prune(unix_millis()).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("catalog writer pruned {} stale instances", removed),
                Err(e) => tracing::warn!("catalog prune failed: {}", e),
            }
        }
    }
}
