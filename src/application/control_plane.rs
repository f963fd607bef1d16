//! Control Plane - composition root
//!
//! Wires the store, event bus, leader election, catalog, sync and liveness
//! components of one replica according to its mode, and runs them until
//! shutdown.

use crate::adapters::inbound::{ApiServer, ApiState};
use crate::adapters::outbound::{
    EventedResourceStore, MemoryResourceStore, PrometheusMetricsStore, SqliteResourceStore,
};
use crate::catalog::{CatalogHeartbeat, CatalogReader, CatalogWriter};
use crate::config::{Config, StoreBackend};
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::value_objects::Mode;
use crate::infrastructure::{EventBus, ShutdownController};
use crate::insight::{InsightResyncer, InsightTracker};
use crate::leader::{LeaderElector, LeaseClient};
use crate::sync::{QuicTransport, SyncClient, SyncConnector, SyncServer};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// One control-plane replica.
pub struct ControlPlane {
    config: Config,
    store: Arc<dyn ResourceStore>,
    bus: EventBus,
    metrics: Arc<PrometheusMetricsStore>,
}

impl ControlPlane {
    /// Open the configured store and wrap it so every write is published.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let inner: Arc<dyn ResourceStore> = match config.store {
            StoreBackend::Memory => Arc::new(MemoryResourceStore::new()),
            StoreBackend::Sqlite => Arc::new(
                SqliteResourceStore::open(&config.db_path)
                    .with_context(|| format!("opening store at {}", config.db_path))?,
            ),
        };
        let bus = EventBus::new(config.event_bus_buffer_size);

        Ok(Self::with_store(config, inner, bus))
    }

    /// Build around an existing store.
    pub fn with_store(config: Config, inner: Arc<dyn ResourceStore>, bus: EventBus) -> Self {
        let store: Arc<dyn ResourceStore> = Arc::new(EventedResourceStore::new(
            inner,
            bus.clone(),
            config.store_timeout(),
        ));
        let metrics = Arc::new(PrometheusMetricsStore::new(config.instance_id.clone()));

        Self {
            config,
            store,
            bus,
            metrics,
        }
    }

    pub fn store(&self) -> Arc<dyn ResourceStore> {
        self.store.clone()
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn metrics(&self) -> Arc<PrometheusMetricsStore> {
        self.metrics.clone()
    }

    /// Run every component until `shutdown` fires, then drain sessions.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let cfg = &self.config;
        let metrics: Arc<dyn MetricsStore> = self.metrics.clone();
        let cancel = shutdown.token();
        let mut tasks = JoinSet::new();

        tracing::info!(
            "starting mesh-sync mode={} instance={} store={:?}",
            cfg.mode.as_str(),
            cfg.instance_id,
            cfg.store
        );

        // Catalog heartbeat runs on every replica
        let heartbeat = CatalogHeartbeat::new(
            self.store.clone(),
            metrics.clone(),
            cfg.catalog_config(),
            cfg.instance_id.clone(),
            cfg.advertise_addr.clone(),
        );
        {
            let cancel = cancel.clone();
            tasks.spawn(async move { heartbeat.run(cancel).await });
        }

        let mut elector = LeaderElector::new(
            LeaseClient::new(
                self.store.clone(),
                cfg.leader_slot(),
                cfg.instance_id.clone(),
                cfg.leader_config().lease_ttl,
            ),
            cfg.leader_config(),
            metrics.clone(),
        );
        elector.add_component(Arc::new(CatalogWriter::new(
            self.store.clone(),
            metrics.clone(),
            cfg.catalog_config(),
        )));

        match cfg.mode {
            Mode::Global => {
                elector.add_component(Arc::new(InsightResyncer::new(
                    self.store.clone(),
                    cfg.insight_config(),
                )));

                let listen: SocketAddr = cfg
                    .sync_listen_addr
                    .parse()
                    .with_context(|| format!("invalid sync listen address {}", cfg.sync_listen_addr))?;
                let transport = Arc::new(QuicTransport::server(listen)?);
                tracing::info!("sync server listening on {}", transport.local_addr()?);

                let server = Arc::new(SyncServer::new(
                    cfg.instance_id.clone(),
                    self.store.clone(),
                    self.bus.clone(),
                    metrics.clone(),
                    CatalogReader::new(self.store.clone(), cfg.catalog_config()),
                    InsightTracker::new(self.store.clone(), metrics.clone(), cfg.insight_config()),
                    cfg.session_config(),
                    shutdown.clone(),
                ));
                let cancel = cancel.clone();
                tasks.spawn(async move { server.serve(transport, cancel).await });
            }
            Mode::Zone => {
                let zone = cfg
                    .zone
                    .clone()
                    .context("zone mode requires a zone name")?;
                let global_addr = cfg
                    .global_addr
                    .clone()
                    .context("zone mode requires a global address")?;
                let connector: Arc<dyn SyncConnector> = Arc::new(QuicTransport::client()?);

                elector.add_component(Arc::new(SyncClient::new(
                    zone,
                    cfg.instance_id.clone(),
                    global_addr,
                    connector,
                    self.store.clone(),
                    self.bus.clone(),
                    metrics.clone(),
                    cfg.session_config(),
                )));
            }
        }

        {
            let cancel = cancel.clone();
            tasks.spawn(async move { elector.run(cancel).await });
        }

        let api = ApiServer::new(
            cfg.api_listen_addr.clone(),
            ApiState::new(
                self.store.clone(),
                self.metrics.clone(),
                cfg.mode,
                cfg.instance_id.clone(),
            ),
        );
        {
            let cancel = cancel.clone();
            tasks.spawn(async move {
                if let Err(e) = api.run(cancel).await {
                    tracing::error!("status API failed: {:?}", e);
                }
            });
        }

        cancel.cancelled().await;
        tracing::info!("shutting down, draining sessions");
        shutdown.wait_for_drain(DRAIN_TIMEOUT).await;

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!("task ended abnormally: {}", e);
            }
        }
        tracing::info!("mesh-sync stopped");
        Ok(())
    }
}
