//! Shared fixtures for the integration tests: in-process replicas, a
//! fault-injecting store and an in-memory connector between zone and global.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_sync::adapters::outbound::{
    EventedResourceStore, MemoryResourceStore, PrometheusMetricsStore,
};
use mesh_sync::catalog::{CatalogConfig, CatalogReader};
use mesh_sync::domain::entities::{
    DataplaneSpec, MeshSpec, PolicySpec, Resource, ResourceKey, ResourceSpec,
};
use mesh_sync::domain::errors::StoreError;
use mesh_sync::domain::ports::{MetricsStore, ResourceStore};
use mesh_sync::domain::value_objects::ResourceType;
use mesh_sync::infrastructure::{EventBus, ShutdownController};
use mesh_sync::insight::{InsightConfig, InsightKind, InsightTracker};
use mesh_sync::leader::{LeaderConfig, LeaderElector, LeaseClient};
use mesh_sync::sync::{SessionConfig, SyncConnector, SyncError, SyncServer, SyncStream};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Store wrapper whose backend can be switched off.
pub struct FlakyStore {
    inner: Arc<dyn ResourceStore>,
    offline: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn ResourceStore>) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for FlakyStore {
    fn store_id(&self) -> &str {
        self.inner.store_id()
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn list(
        &self,
        resource_type: ResourceType,
        mesh: Option<&str>,
    ) -> Result<Vec<Resource>, StoreError> {
        self.check()?;
        self.inner.list(resource_type, mesh).await
    }

    async fn create(&self, resource: Resource) -> Result<Resource, StoreError> {
        self.check()?;
        self.inner.create(resource).await
    }

    async fn update(&self, resource: Resource) -> Result<Resource, StoreError> {
        self.check()?;
        self.inner.update(resource).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<u64, StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// The store, bus and metrics of one control-plane replica.
#[derive(Clone)]
pub struct Replica {
    pub id: String,
    pub store: Arc<dyn ResourceStore>,
    pub bus: EventBus,
    pub metrics: Arc<PrometheusMetricsStore>,
}

impl Replica {
    /// Replica with its own in-memory store.
    pub fn new(id: &str) -> Self {
        Self::on_store(id, Arc::new(MemoryResourceStore::new()))
    }

    /// Replica on a backend shared with other replicas of the same instance.
    pub fn on_store(id: &str, backend: Arc<dyn ResourceStore>) -> Self {
        let bus = EventBus::new(100);
        Self {
            id: id.to_string(),
            store: Arc::new(EventedResourceStore::new(
                backend,
                bus.clone(),
                Duration::from_secs(1),
            )),
            bus,
            metrics: Arc::new(PrometheusMetricsStore::new(id)),
        }
    }

    pub fn metrics_port(&self) -> Arc<dyn MetricsStore> {
        self.metrics.clone()
    }

    pub fn elector(&self, slot: &str) -> LeaderElector {
        let config = leader_config();
        LeaderElector::new(
            LeaseClient::new(self.store.clone(), slot, self.id.clone(), config.lease_ttl),
            config,
            self.metrics_port(),
        )
    }

    /// Global sync server on this replica.
    pub fn sync_server(&self, shutdown: &ShutdownController) -> Arc<SyncServer> {
        Arc::new(SyncServer::new(
            self.id.clone(),
            self.store.clone(),
            self.bus.clone(),
            self.metrics_port(),
            CatalogReader::new(self.store.clone(), catalog_config()),
            InsightTracker::new(self.store.clone(), self.metrics_port(), insight_config()),
            session_config(),
            shutdown.clone(),
        ))
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<Resource> {
        self.store.get(key).await.ok().flatten()
    }

    pub async fn has(&self, key: &ResourceKey) -> bool {
        self.get(key).await.is_some()
    }

    pub async fn lacks(&self, key: &ResourceKey) -> bool {
        matches!(self.store.get(key).await, Ok(None))
    }

    /// Online flag of the insight `name` of `kind`, false if absent.
    pub async fn insight_online(&self, kind: InsightKind, name: &str) -> bool {
        let tracker = InsightTracker::new(self.store.clone(), self.metrics_port(), insight_config());
        matches!(tracker.get(kind, name).await, Ok(Some(insight)) if insight.online)
    }
}

pub fn leader_config() -> LeaderConfig {
    LeaderConfig::new(Duration::from_millis(600), Duration::from_millis(100))
        .grace_period(Duration::from_millis(200))
        .store_timeout(Duration::from_millis(200))
}

pub fn catalog_config() -> CatalogConfig {
    CatalogConfig::new(Duration::from_millis(100), Duration::from_millis(200))
}

pub fn insight_config() -> InsightConfig {
    InsightConfig::new(Duration::from_millis(100))
}

pub fn session_config() -> SessionConfig {
    SessionConfig::new(Duration::from_millis(50), Duration::from_secs(2))
        .handshake_timeout(Duration::from_secs(1))
        .backoff(Duration::from_millis(20), Duration::from_millis(200))
}

/// Connects zone clients to in-process global servers over duplex pipes.
///
/// Servers are registered under the address the client dials.
pub struct DuplexConnector {
    servers: DashMap<String, Arc<SyncServer>>,
    connections: Mutex<Vec<CancellationToken>>,
    refuse: AtomicBool,
}

impl DuplexConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: DashMap::new(),
            connections: Mutex::new(Vec::new()),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn register(&self, address: &str, server: Arc<SyncServer>) {
        self.servers.insert(address.to_string(), server);
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// End every open connection from the server side.
    pub fn drop_connections(&self) {
        for token in self.connections.lock().drain(..) {
            token.cancel();
        }
    }
}

#[async_trait]
impl SyncConnector for DuplexConnector {
    async fn connect(&self, address: &str) -> Result<SyncStream, SyncError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!("{} refused", address)));
        }
        let server = self
            .servers
            .get(address)
            .map(|s| s.value().clone())
            .ok_or_else(|| SyncError::Transport(format!("no server at {}", address)))?;

        let (client, served) = pipe(address);
        let cancel = CancellationToken::new();
        self.connections.lock().push(cancel.clone());
        tokio::spawn(async move {
            let _ = server.handle_stream(served, cancel).await;
        });
        Ok(client)
    }
}

/// Two connected stream ends: (client side, server side).
pub fn pipe(address: &str) -> (SyncStream, SyncStream) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        SyncStream::new(Box::new(a_read), Box::new(a_write), address),
        SyncStream::new(Box::new(b_read), Box::new(b_write), "zone"),
    )
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn mesh(name: &str) -> Resource {
    Resource::new(
        ResourceKey::global(ResourceType::Mesh, name),
        ResourceSpec::Mesh(MeshSpec::default()),
    )
}

pub fn traffic_permission(mesh: &str, name: &str) -> Resource {
    Resource::new(
        ResourceKey::scoped(ResourceType::TrafficPermission, mesh, name),
        ResourceSpec::Policy(PolicySpec::default()),
    )
}

pub fn dataplane(mesh: &str, name: &str) -> Resource {
    Resource::new(
        ResourceKey::scoped(ResourceType::Dataplane, mesh, name),
        ResourceSpec::Dataplane(DataplaneSpec::default()),
    )
}
