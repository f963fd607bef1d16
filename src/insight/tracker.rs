//! Insight tracker
//!
//! Writes subscriptions of the sessions this replica owns.

use super::{InsightConfig, InsightKind};
use crate::domain::entities::{InsightSpec, Resource, ResourceKey, ResourceSpec, Subscription};
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::value_objects::{labels, unix_millis};
use crate::sync::HeartbeatHook;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const MAX_WRITE_ATTEMPTS: usize = 5;

/// Writes insight records.
#[derive(Clone)]
pub struct InsightTracker {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<dyn MetricsStore>,
    config: InsightConfig,
}

impl InsightTracker {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        metrics: Arc<dyn MetricsStore>,
        config: InsightConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &InsightConfig {
        &self.config
    }

    /// Record `subscription` in the insight `name` of `kind` and recompute
    /// its online flag at `now`. Returns the resulting flag.
    pub async fn record(
        &self,
        kind: InsightKind,
        name: &str,
        subscription: &Subscription,
        now: u64,
    ) -> Result<bool, StoreError> {
        let key = ResourceKey::global(kind.resource_type(), name);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let existing = self.store.get(&key).await?;
            let mut spec = existing
                .as_ref()
                .and_then(|r| r.spec.as_insight().cloned())
                .unwrap_or_default();
            if !spec.upsert_subscription(subscription.clone(), self.config.max_subscriptions) {
                tracing::debug!(
                    "ignoring subscription {} for {}: superseded and no longer in history",
                    subscription.id,
                    key
                );
            }
            spec.online = spec.compute_online(now, self.config.timeout_ms());
            let online = spec.online;

            let result = match existing {
                Some(mut resource) => {
                    resource.spec = ResourceSpec::Insight(spec);
                    self.store.update(resource).await
                }
                None => {
                    self.store
                        .create(Resource::new(key.clone(), ResourceSpec::Insight(spec)))
                        .await
                }
            };

            match result {
                Ok(_) => return Ok(online),
                Err(e) if e.is_conflict() && attempt < MAX_WRITE_ATTEMPTS => {
                    tracing::debug!("conflict writing insight {}, retrying: {}", key, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read an insight.
    pub async fn get(&self, kind: InsightKind, name: &str) -> Result<Option<InsightSpec>, StoreError> {
        let key = ResourceKey::global(kind.resource_type(), name);
        Ok(self
            .store
            .get(&key)
            .await?
            .and_then(|r| r.spec.as_insight().cloned()))
    }
}

/// Liveness of one zone session: the zone itself plus the ingress and
/// egress gateways that zone has synced up.
pub struct ZoneSessionInsights {
    tracker: InsightTracker,
    subscription: Mutex<Subscription>,
    /// Gateways seen so far, as (kind, resource name)
    gateways: Mutex<BTreeSet<(InsightKind, String)>>,
}

impl ZoneSessionInsights {
    /// Start tracking a session and record it right away. A failed first
    /// write is retried by the flusher.
    pub async fn open(tracker: InsightTracker, subscription: Subscription) -> Arc<Self> {
        let insights = Arc::new(Self {
            tracker,
            subscription: Mutex::new(subscription),
            gateways: Mutex::new(BTreeSet::new()),
        });
        if let Err(e) = insights.flush_at(unix_millis()).await {
            tracing::warn!("initial insight write for zone {} failed: {}", insights.zone(), e);
        }
        insights
    }

    pub fn zone(&self) -> String {
        self.subscription.lock().zone.clone()
    }

    pub fn subscription(&self) -> Subscription {
        self.subscription.lock().clone()
    }

    pub fn heartbeat(&self, now: u64) {
        let mut sub = self.subscription.lock();
        if now > sub.last_heartbeat_at {
            sub.last_heartbeat_at = now;
        }
    }

    /// Write the subscription to every insight of this session.
    ///
    /// Keeps going after a failed write; returns the first failure.
    pub async fn flush_at(&self, now: u64) -> Result<(), StoreError> {
        let subscription = self.subscription();
        let mut first_err = None;

        if let Err(e) = self.discover_gateways(&subscription.zone).await {
            tracing::warn!("cannot list gateways of zone {}: {}", subscription.zone, e);
            first_err = Some(e);
        }

        let mut targets = vec![(InsightKind::Zone, subscription.zone.clone())];
        targets.extend(self.gateways.lock().iter().cloned());

        for (kind, name) in targets {
            if let Err(e) = self.tracker.record(kind, &name, &subscription, now).await {
                tracing::warn!("failed to flush {} {}: {}", kind.resource_type(), name, e);
                self.tracker.metrics.record_flush_failure(kind.resource_type());
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn discover_gateways(&self, zone: &str) -> Result<(), StoreError> {
        for kind in [InsightKind::ZoneIngress, InsightKind::ZoneEgress] {
            let Some(gateway_type) = kind.gateway_type() else {
                continue;
            };
            let found: Vec<String> = self
                .tracker
                .store
                .list(gateway_type, None)
                .await?
                .into_iter()
                .filter(|r| r.label(labels::ZONE) == Some(zone))
                .map(|r| r.name)
                .collect();
            let mut gateways = self.gateways.lock();
            for name in found {
                gateways.insert((kind, name));
            }
        }
        Ok(())
    }

    /// Rewrite the insights every flush interval until `cancel` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run_flusher(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tracker.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick is immediate and open() already flushed
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    // Failures are retried on the next tick
                    let _ = self.flush_at(unix_millis()).await;
                }
            }
        }
    }

    /// Mark the session disconnected and write it out.
    pub async fn close(&self, now: u64) -> Result<(), StoreError> {
        {
            let mut sub = self.subscription.lock();
            if sub.disconnected_at.is_none() {
                sub.disconnected_at = Some(now);
            }
        }
        self.flush_at(now).await
    }
}

impl HeartbeatHook for ZoneSessionInsights {
    fn on_heartbeat(&self, at: u64) {
        self.heartbeat(at);
    }
}
