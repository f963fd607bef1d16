//! Insight resyncer
//!
//! Leader-only sweep that recomputes `online` for every insight. A zone
//! whose owning replica died stops being flushed; this is what turns it
//! offline.

use super::{InsightConfig, InsightKind};
use crate::domain::entities::{Resource, ResourceSpec};
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::value_objects::unix_millis;
use crate::leader::{LeaderComponent, LeaderContext};
use async_trait::async_trait;
use std::sync::Arc;

pub struct InsightResyncer {
    store: Arc<dyn ResourceStore>,
    config: InsightConfig,
}

impl InsightResyncer {
    pub fn new(store: Arc<dyn ResourceStore>, config: InsightConfig) -> Self {
        Self { store, config }
    }

    /// Recompute every insight at `now`. Returns how many were rewritten.
    pub async fn resync(&self, now: u64) -> Result<usize, StoreError> {
        let mut updated = 0;

        for kind in InsightKind::ALL {
            for resource in self.store.list(kind.resource_type(), None).await? {
                let Some(next) = self.recompute(&resource, now) else {
                    continue;
                };
                match self.store.update(next).await {
                    Ok(_) => updated += 1,
                    // The owner rewrote it meanwhile; next sweep will look again
                    Err(e) if e.is_conflict() => {
                        tracing::debug!("insight {} changed during resync: {}", resource.key(), e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(updated)
    }

    /// Updated copy of `resource`, or `None` if nothing changed.
    fn recompute(&self, resource: &Resource, now: u64) -> Option<Resource> {
        let mut spec = resource.spec.as_insight()?.clone();
        let timeout_ms = self.config.timeout_ms();
        let mut changed = false;

        if let Some(current) = spec.subscriptions.last_mut() {
            if current.is_connected() && now.saturating_sub(current.last_heartbeat_at) >= timeout_ms
            {
                current.disconnected_at = Some(now);
                changed = true;
            }
        }

        let online = spec.compute_online(now, timeout_ms);
        if online != spec.online {
            spec.online = online;
            changed = true;
        }

        if !changed {
            return None;
        }
        let mut next = resource.clone();
        next.spec = ResourceSpec::Insight(spec);
        Some(next)
    }
}

#[async_trait]
impl LeaderComponent for InsightResyncer {
    fn name(&self) -> &str {
        "insight-resyncer"
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(&self, ctx: LeaderContext) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            if !ctx.leadership.is_held().await {
                tracing::debug!("insight resyncer skipping tick, lease not held");
                continue;
            }

            match self.resync(unix_millis()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("insight resync updated {} insights", n),
                Err(e) => tracing::warn!("insight resync failed: {}", e),
            }
        }
    }
}
