//! Sync Session
//!
//! One established session: a writer task that sends a full snapshot and
//! then deltas and heartbeats, and a reader task that applies what the peer
//! sends. Either task ending cancels the other.

use super::codec::{read_message, write_message};
use super::filter::OutboundFilter;
use super::syncer::ResourceSyncer;
use super::transport::{BoxedReader, BoxedWriter, SyncStream};
use super::types::{message_type_name, Message, ResourceDelta, SyncError};
use super::SessionConfig;
use crate::domain::entities::{Resource, ResourceKey};
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::registry;
use crate::domain::value_objects::{unix_millis, ResourceType};
use crate::infrastructure::{Backoff, BusEvent, EventBus, Operation, ResourceChangedEvent};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Time allowed for a farewell message on close.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a zone's connection to global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshake,
    Streaming,
    Reconnecting,
    Closed,
}

/// Notified whenever the peer's heartbeat arrives.
pub trait HeartbeatHook: Send + Sync {
    fn on_heartbeat(&self, at: u64);
}

/// Versions sent so far in this session, per key.
type SentVersions = HashMap<ResourceKey, u64>;

/// An established sync session.
pub struct SyncSession {
    store: Arc<dyn ResourceStore>,
    bus: EventBus,
    metrics: Arc<dyn MetricsStore>,
    config: SessionConfig,
    filter: OutboundFilter,
    syncer: ResourceSyncer,
    hook: Option<Arc<dyn HeartbeatHook>>,
}

impl SyncSession {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        bus: EventBus,
        metrics: Arc<dyn MetricsStore>,
        config: SessionConfig,
        filter: OutboundFilter,
        syncer: ResourceSyncer,
    ) -> Self {
        Self {
            store,
            bus,
            metrics,
            config,
            filter,
            syncer,
            hook: None,
        }
    }

    pub fn with_heartbeat_hook(mut self, hook: Arc<dyn HeartbeatHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Stream until the peer leaves, the stream fails, or `cancel` fires.
    ///
    /// A peer `Goodbye` and local cancellation end the session with `Ok`.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(
        self: Arc<Self>,
        stream: SyncStream,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let SyncStream {
            reader,
            writer,
            peer,
        } = stream;
        let session_cancel = cancel.child_token();
        tracing::info!("sync session with {} streaming", peer);

        let writer_task = tokio::spawn(self.clone().write_loop(writer, session_cancel.clone()));
        let reader_task = tokio::spawn(self.clone().read_loop(reader, session_cancel.clone()));
        let (written, read) = tokio::join!(writer_task, reader_task);

        let read = read.map_err(|e| SyncError::Transport(format!("reader task failed: {}", e)))?;
        let written =
            written.map_err(|e| SyncError::Transport(format!("writer task failed: {}", e)))?;

        tracing::info!("sync session with {} closed", peer);
        read.and(written)
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn write_loop(
        self: Arc<Self>,
        mut writer: BoxedWriter,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = cancel.clone().drop_guard();

        // Subscribe before reading the snapshot so no change falls in between.
        // Meshes are always watched: a new mesh unblocks resources scoped to it.
        let mut types = self.filter.types();
        if !types.contains(&ResourceType::Mesh) {
            types.push(ResourceType::Mesh);
        }
        let mut listener = self.bus.subscribe_types(types);
        let mut sent = SentVersions::new();
        let mut resync_pending = false;

        if let Err(e) = self.send_snapshot(&mut writer, &mut sent).await {
            match e {
                SyncError::Store(e) => {
                    tracing::warn!("snapshot deferred, store unavailable: {}", e);
                    resync_pending = true;
                }
                other => return Err(other),
            }
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tokio::time::timeout(
                        GOODBYE_TIMEOUT,
                        write_message(&mut writer, &Message::Goodbye),
                    )
                    .await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if resync_pending {
                        resync_pending = self.resync(&mut writer, &mut sent).await?;
                    }
                    write_message(&mut writer, &Message::Heartbeat { sent_at: unix_millis() }).await?;
                }
                event = listener.recv() => match event {
                    None => return Ok(()),
                    Some(BusEvent::Lagged) => {
                        tracing::debug!("event listener lagged, resending snapshot");
                        resync_pending = self.resync(&mut writer, &mut sent).await?;
                    }
                    Some(BusEvent::Changed(event)) => {
                        let result = if event.resource_type() == ResourceType::Mesh {
                            self.send_mesh(&mut writer, &event, &mut sent).await
                        } else {
                            self.send_change(&mut writer, &event, &mut sent).await
                        };
                        match result {
                            Ok(()) => {}
                            Err(SyncError::Store(e)) => {
                                tracing::warn!("cannot read {}, will resync: {}", event.key, e);
                                resync_pending = true;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
    }

    /// Resend a full snapshot. Returns whether a resync is still pending.
    async fn resync(
        &self,
        writer: &mut BoxedWriter,
        sent: &mut SentVersions,
    ) -> Result<bool, SyncError> {
        match self.send_snapshot(writer, sent).await {
            Ok(()) => Ok(false),
            Err(SyncError::Store(e)) => {
                tracing::warn!("resync deferred, store unavailable: {}", e);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a snapshot of every permitted type, even empty ones.
    async fn send_snapshot(
        &self,
        writer: &mut BoxedWriter,
        sent: &mut SentVersions,
    ) -> Result<(), SyncError> {
        let meshes: BTreeSet<String> = self
            .store
            .list(ResourceType::Mesh, None)
            .await?
            .into_iter()
            .map(|m| m.name)
            .collect();

        // Read everything first so a store failure sends nothing partial.
        let mut snapshots = Vec::new();
        for resource_type in self.filter.types() {
            let resources: Vec<Resource> = self
                .store
                .list(resource_type, None)
                .await?
                .into_iter()
                .filter(|r| self.filter.admits(r, mesh_known(r, &meshes)))
                .collect();
            snapshots.push((resource_type, resources));
        }

        sent.clear();
        for (resource_type, resources) in snapshots {
            for resource in &resources {
                sent.insert(resource.key(), resource.version);
            }
            let count = resources.len() as u64;
            let msg = Message::Snapshot {
                resource_type,
                resources: resources.iter().map(|r| self.filter.delta(r)).collect(),
            };
            write_message(writer, &msg).await?;
            self.metrics.record_sent(resource_type, count);
            tracing::debug!("sent snapshot of {} ({} resources)", resource_type, count);
        }
        Ok(())
    }

    /// A mesh changed: send it if the peer takes meshes, then resend
    /// everything scoped to it. Either side drops resources of a mesh it
    /// does not know yet, so those are sent again once the mesh exists.
    async fn send_mesh(
        &self,
        writer: &mut BoxedWriter,
        event: &ResourceChangedEvent,
        sent: &mut SentVersions,
    ) -> Result<(), SyncError> {
        if self.filter.types().contains(&ResourceType::Mesh) {
            self.send_change(writer, event, sent).await?;
        }
        if event.operation == Operation::Delete || self.store.get(&event.key).await?.is_none() {
            return Ok(());
        }

        let mesh = event.key.name.as_str();
        let mut count = 0;
        for resource_type in self.filter.types() {
            if !registry::descriptor(resource_type).is_mesh_scoped() {
                continue;
            }
            for resource in self.store.list(resource_type, Some(mesh)).await? {
                if !self.filter.admits(&resource, true) {
                    continue;
                }
                sent.insert(resource.key(), resource.version);
                write_message(writer, &Message::Delta(self.filter.delta(&resource))).await?;
                self.metrics.record_sent(resource_type, 1);
                count += 1;
            }
        }
        if count > 0 {
            tracing::debug!("mesh {} changed, resent {} scoped resources", mesh, count);
        }
        Ok(())
    }

    /// Re-read a changed resource and send it, or a tombstone if it is gone.
    async fn send_change(
        &self,
        writer: &mut BoxedWriter,
        event: &ResourceChangedEvent,
        sent: &mut SentVersions,
    ) -> Result<(), SyncError> {
        if sent.get(&event.key).is_some_and(|v| *v >= event.version) {
            return Ok(());
        }

        let delta = match self.store.get(&event.key).await? {
            Some(resource) => {
                let known = match &resource.mesh {
                    Some(mesh) if registry::descriptor(resource.resource_type).is_mesh_scoped() => {
                        let mesh_key = ResourceKey::global(ResourceType::Mesh, mesh.clone());
                        self.store.get(&mesh_key).await?.is_some()
                    }
                    _ => true,
                };
                if self.filter.admits(&resource, known) {
                    sent.insert(resource.key(), resource.version);
                    self.filter.delta(&resource)
                } else if sent.remove(&event.key).is_some() {
                    // Sent earlier, no longer eligible
                    tombstone(&event.key, resource.version)
                } else {
                    return Ok(());
                }
            }
            None => match sent.remove(&event.key) {
                Some(_) => tombstone(&event.key, event.version),
                None => return Ok(()),
            },
        };

        write_message(writer, &Message::Delta(delta)).await?;
        self.metrics.record_sent(event.resource_type(), 1);
        Ok(())
    }

    /// Run `apply` until it stops failing with `Unavailable`, for at most
    /// the heartbeat timeout. Any other failure ends the session, which the
    /// zone then re-establishes with a fresh snapshot.
    ///
    /// Returns `Ok(None)` when cancelled while waiting.
    async fn apply_with_retry<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut apply: F,
    ) -> Result<Option<T>, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let deadline = tokio::time::Instant::now() + self.config.heartbeat_timeout;
        let mut backoff = Backoff::new(
            self.config.reconnect_backoff_initial,
            self.config.heartbeat_interval,
        );

        loop {
            match apply().await {
                Ok(value) => return Ok(Some(value)),
                Err(StoreError::Unavailable(e)) if tokio::time::Instant::now() < deadline => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "store unavailable applying {}, retrying in {:?}: {}",
                        what,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("cannot apply {}, recycling session: {}", what, e);
                    return Err(e.into());
                }
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn read_loop(
        self: Arc<Self>,
        mut reader: BoxedReader,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let _guard = cancel.clone().drop_guard();
        let timeout = self.config.heartbeat_timeout;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = tokio::time::timeout(timeout, read_message(&mut reader)) => match read {
                    Err(_) => return Err(SyncError::HeartbeatTimeout(timeout)),
                    Ok(Ok(Some(msg))) => msg,
                    Ok(Ok(None)) => {
                        return Err(SyncError::Transport("stream closed by peer".to_string()))
                    }
                    Ok(Err(e)) => return Err(e),
                }
            };

            match msg {
                Message::Snapshot {
                    resource_type,
                    resources,
                } => {
                    let what = format!("snapshot of {}", resource_type);
                    let applied = self
                        .apply_with_retry(&what, &cancel, || {
                            self.syncer.apply_snapshot(resource_type, &resources)
                        })
                        .await?;
                    let Some(outcomes) = applied else {
                        return Ok(());
                    };
                    tracing::debug!("applied {} ({} outcomes)", what, outcomes.len());
                }
                Message::Delta(delta) => {
                    let what = format!("delta {}/{}", delta.resource_type, delta.name);
                    let applied = self
                        .apply_with_retry(&what, &cancel, || self.syncer.apply_delta(&delta))
                        .await?;
                    if applied.is_none() {
                        return Ok(());
                    }
                }
                Message::Heartbeat { .. } => {
                    if let Some(hook) = &self.hook {
                        hook.on_heartbeat(unix_millis());
                    }
                }
                Message::Goodbye => {
                    tracing::info!("peer closed the session");
                    return Ok(());
                }
                other => {
                    tracing::debug!("ignoring unexpected {} message", message_type_name(&other));
                }
            }
        }
    }
}

fn mesh_known(resource: &Resource, meshes: &BTreeSet<String>) -> bool {
    match &resource.mesh {
        Some(mesh) => meshes.contains(mesh),
        None => true,
    }
}

fn tombstone(key: &ResourceKey, version: u64) -> ResourceDelta {
    ResourceDelta::tombstone(key.resource_type, key.mesh.clone(), key.name.clone(), version)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::{
        EventedResourceStore, MemoryResourceStore, PrometheusMetricsStore,
    };
    use crate::domain::entities::{DataplaneSpec, MeshSpec, ResourceSpec, ZoneIngressSpec};
    use crate::domain::value_objects::labels;
    use crate::sync::syncer::InboundPeer;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Side {
        store: Arc<dyn ResourceStore>,
        metrics: Arc<PrometheusMetricsStore>,
        bus: EventBus,
    }

    fn side(instance: &str) -> Side {
        side_on(instance, Arc::new(MemoryResourceStore::new()), 100)
    }

    fn side_on(instance: &str, inner: Arc<dyn ResourceStore>, buffer_size: usize) -> Side {
        let bus = EventBus::new(buffer_size);
        Side {
            store: Arc::new(EventedResourceStore::new(inner, bus.clone(), Duration::from_secs(1))),
            metrics: Arc::new(PrometheusMetricsStore::new(instance)),
            bus,
        }
    }

    /// Memory store that can be taken offline.
    #[derive(Default)]
    struct OutageStore {
        inner: MemoryResourceStore,
        offline: AtomicBool,
    }

    impl OutageStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("outage".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl ResourceStore for OutageStore {
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

    struct CountingHook(AtomicUsize);

    impl HeartbeatHook for CountingHook {
        fn on_heartbeat(&self, _at: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new(Duration::from_millis(50), Duration::from_millis(500))
            .backoff(Duration::from_millis(10), Duration::from_millis(100))
    }

    fn pipe() -> (SyncStream, SyncStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            SyncStream::new(Box::new(a_read), Box::new(a_write), "zone"),
            SyncStream::new(Box::new(b_read), Box::new(b_write), "global"),
        )
    }

    fn global_session(global: &Side, zone: &Side) -> SyncSession {
        SyncSession::new(
            global.store.clone(),
            global.bus.clone(),
            global.metrics.clone(),
            config(),
            OutboundFilter::ToZone {
                zone: "east".to_string(),
            },
            ResourceSyncer::new(
                global.store.clone(),
                global.metrics.clone(),
                InboundPeer::Zone {
                    zone: "east".to_string(),
                },
                zone.store.store_id(),
            ),
        )
    }

    fn zone_session(global: &Side, zone: &Side) -> SyncSession {
        SyncSession::new(
            zone.store.clone(),
            zone.bus.clone(),
            zone.metrics.clone(),
            config(),
            OutboundFilter::ToGlobal,
            ResourceSyncer::new(
                zone.store.clone(),
                zone.metrics.clone(),
                InboundPeer::Global {
                    local_zone: "east".to_string(),
                },
                global.store.store_id(),
            ),
        )
    }

    fn sessions(global: &Side, zone: &Side) -> (Arc<SyncSession>, Arc<SyncSession>) {
        (
            Arc::new(global_session(global, zone)),
            Arc::new(zone_session(global, zone)),
        )
    }

    fn mesh(name: &str) -> Resource {
        Resource::new(
            ResourceKey::global(ResourceType::Mesh, name),
            ResourceSpec::Mesh(MeshSpec::default()),
        )
    }

    fn dataplane(name: &str) -> Resource {
        Resource::new(
            ResourceKey::scoped(ResourceType::Dataplane, "default", name),
            ResourceSpec::Dataplane(DataplaneSpec::default()),
        )
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_snapshot_then_deltas_flow_both_ways() {
        let global = side("global-1");
        let zone = side("zone-1");
        global.store.create(mesh("default")).await.unwrap();
        zone.store.create(mesh("default")).await.unwrap();
        zone.store.create(dataplane("dp-1")).await.unwrap();

        let (on_global, on_zone) = sessions(&global, &zone);
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        let g = tokio::spawn(on_global.run(global_stream, cancel.clone()));
        let z = tokio::spawn(on_zone.run(zone_stream, cancel.clone()));

        let prefixed = ResourceKey::scoped(ResourceType::Dataplane, "default", "east.dp-1");
        assert!(eventually(|| async { global.store.get(&prefixed).await.unwrap().is_some() }).await);

        // A mesh created on global reaches the zone as a delta
        global.store.create(mesh("payments")).await.unwrap();
        let payments = ResourceKey::global(ResourceType::Mesh, "payments");
        assert!(eventually(|| async { zone.store.get(&payments).await.unwrap().is_some() }).await);
        let received = zone.store.get(&payments).await.unwrap().unwrap();
        assert_eq!(received.label(labels::ORIGIN), Some(labels::ORIGIN_GLOBAL));

        // Deletes propagate as tombstones
        zone.store
            .delete(&ResourceKey::scoped(ResourceType::Dataplane, "default", "dp-1"))
            .await
            .unwrap();
        assert!(eventually(|| async { global.store.get(&prefixed).await.unwrap().is_none() }).await);

        cancel.cancel();
        assert!(g.await.unwrap().is_ok());
        assert!(z.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_scoped_resources_follow_late_mesh() {
        let global = side("global-1");
        let zone = side("zone-1");
        // The zone runs a dataplane before the mesh exists anywhere
        zone.store.create(dataplane("dp-1")).await.unwrap();

        let (on_global, on_zone) = sessions(&global, &zone);
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        tokio::spawn(on_global.run(global_stream, cancel.clone()));
        tokio::spawn(on_zone.run(zone_stream, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        global.store.create(mesh("default")).await.unwrap();
        let mesh_key = ResourceKey::global(ResourceType::Mesh, "default");
        assert!(eventually(|| async { zone.store.get(&mesh_key).await.unwrap().is_some() }).await);

        let prefixed = ResourceKey::scoped(ResourceType::Dataplane, "default", "east.dp-1");
        assert!(eventually(|| async { global.store.get(&prefixed).await.unwrap().is_some() }).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_lagged_listener_resends_everything() {
        let global = side("global-1");
        let zone = side_on("zone-1", Arc::new(MemoryResourceStore::new()), 1);
        global.store.create(mesh("default")).await.unwrap();
        zone.store.create(mesh("default")).await.unwrap();

        let (on_global, on_zone) = sessions(&global, &zone);
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        tokio::spawn(on_global.run(global_stream, cancel.clone()));
        tokio::spawn(on_zone.run(zone_stream, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Far more changes than the zone's listener can buffer
        for i in 0..30 {
            zone.store.create(dataplane(&format!("dp-{}", i))).await.unwrap();
        }

        let synced = || async {
            global
                .store
                .list(ResourceType::Dataplane, Some("default"))
                .await
                .unwrap()
                .len()
                == 30
        };
        assert!(eventually(synced).await);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_store_outage_is_retried_in_session() {
        let outage = Arc::new(OutageStore::default());
        let global = side_on("global-1", outage.clone(), 100);
        let zone = side("zone-1");
        global.store.create(mesh("default")).await.unwrap();
        zone.store.create(mesh("default")).await.unwrap();
        zone.store.create(dataplane("dp-1")).await.unwrap();

        let (on_global, on_zone) = sessions(&global, &zone);
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        let g = tokio::spawn(on_global.run(global_stream, cancel.clone()));
        tokio::spawn(on_zone.run(zone_stream, cancel.clone()));

        let first = ResourceKey::scoped(ResourceType::Dataplane, "default", "east.dp-1");
        assert!(eventually(|| async { global.store.get(&first).await.unwrap().is_some() }).await);

        outage.offline.store(true, Ordering::SeqCst);
        zone.store.create(dataplane("dp-2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        outage.offline.store(false, Ordering::SeqCst);

        let second = ResourceKey::scoped(ResourceType::Dataplane, "default", "east.dp-2");
        assert!(eventually(|| async { global.store.get(&second).await.unwrap().is_some() }).await);
        // Same session throughout
        assert!(!g.is_finished());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_received_resources_are_not_echoed() {
        let global = side("global-1");
        let zone = side("zone-1");

        // An ingress global learned from another zone
        let west = Resource::new(
            ResourceKey::global(ResourceType::ZoneIngress, "west.ingress"),
            ResourceSpec::ZoneIngress(ZoneIngressSpec::default()),
        )
        .with_label(labels::ZONE, "west")
        .with_label(labels::ORIGIN, labels::ORIGIN_ZONE);
        global.store.create(west).await.unwrap();

        let (on_global, on_zone) = sessions(&global, &zone);
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        tokio::spawn(on_global.run(global_stream, cancel.clone()));
        tokio::spawn(on_zone.run(zone_stream, cancel.clone()));

        let key = ResourceKey::global(ResourceType::ZoneIngress, "west.ingress");
        assert!(eventually(|| async { zone.store.get(&key).await.unwrap().is_some() }).await);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The zone holds it but never sends it back up
        assert_eq!(zone.metrics.sent_count(ResourceType::ZoneIngress), 0);
        assert!(global
            .store
            .get(&ResourceKey::global(ResourceType::ZoneIngress, "east.west.ingress"))
            .await
            .unwrap()
            .is_none());
        // ...and global's copy survives the zone's (empty) ingress snapshot
        assert!(global.store.get(&key).await.unwrap().is_some());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_heartbeats_reach_hook() {
        let global = side("global-1");
        let zone = side("zone-1");
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));

        let on_global = Arc::new(global_session(&global, &zone).with_heartbeat_hook(hook.clone()));
        let on_zone = Arc::new(zone_session(&global, &zone));
        let (zone_stream, global_stream) = pipe();
        let cancel = CancellationToken::new();
        tokio::spawn(on_global.run(global_stream, cancel.clone()));
        tokio::spawn(on_zone.run(zone_stream, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hook.0.load(Ordering::SeqCst) >= 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let global = side("global-1");
        let zone = side("zone-1");
        let (on_global, _) = sessions(&global, &zone);

        // The zone end never writes anything
        let (_zone_stream, global_stream) = pipe();
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            on_global.run(global_stream, CancellationToken::new()),
        )
        .await
        .unwrap();

        assert!(matches!(result, Err(SyncError::HeartbeatTimeout(_))));
    }

    #[tokio::test]
    async fn test_peer_goodbye_ends_session_cleanly() {
        let global = side("global-1");
        let zone = side("zone-1");
        let (on_global, _) = sessions(&global, &zone);

        let (mut zone_stream, global_stream) = pipe();
        let run = tokio::spawn(on_global.run(global_stream, CancellationToken::new()));
        write_message(&mut zone_stream.writer, &Message::Goodbye).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), run).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
