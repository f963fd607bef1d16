//! Sync Server
//!
//! Global side of the sync protocol. Each incoming stream is handshaken,
//! routed to the replica owning the zone, and then served as a session on
//! this replica. A newer session for the same zone supersedes the older one.

use super::codec::{read_message, write_message};
use super::filter::OutboundFilter;
use super::session::SyncSession;
use super::syncer::{InboundPeer, ResourceSyncer};
use super::transport::{QuicTransport, SyncStream};
use super::types::{message_type_name, Handshake, Message, SyncError};
use super::SessionConfig;
use crate::catalog::CatalogReader;
use crate::domain::entities::{
    CatalogInstance, Resource, ResourceKey, ResourceSpec, Subscription, ZoneSpec,
};
use crate::domain::errors::StoreError;
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::domain::value_objects::{unix_millis, ResourceType};
use crate::infrastructure::{EventBus, ShutdownController};
use crate::insight::{InsightTracker, ZoneSessionInsights};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
}

pub struct SyncServer {
    instance_id: String,
    store: Arc<dyn ResourceStore>,
    bus: EventBus,
    metrics: Arc<dyn MetricsStore>,
    catalog: CatalogReader,
    insights: InsightTracker,
    config: SessionConfig,
    shutdown: ShutdownController,
    /// Session currently served per zone
    sessions: DashMap<String, ActiveSession>,
}

impl SyncServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: impl Into<String>,
        store: Arc<dyn ResourceStore>,
        bus: EventBus,
        metrics: Arc<dyn MetricsStore>,
        catalog: CatalogReader,
        insights: InsightTracker,
        config: SessionConfig,
        shutdown: ShutdownController,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            store,
            bus,
            metrics,
            catalog,
            insights,
            config,
            shutdown,
            sessions: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Zones with a session on this replica.
    pub fn active_zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        zones.sort();
        zones
    }

    /// Accept QUIC connections until `cancel` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn serve(self: Arc<Self>, transport: Arc<QuicTransport>, cancel: CancellationToken) {
        loop {
            let incoming = tokio::select! {
                _ = cancel.cancelled() => break,
                incoming = transport.accept() => incoming,
            };
            let Some(incoming) = incoming else {
                break;
            };

            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match QuicTransport::open_incoming(incoming).await {
                    Ok(stream) => {
                        let peer = stream.peer.clone();
                        if let Err(e) = server.handle_stream(stream, cancel).await {
                            tracing::warn!("sync session from {} ended: {}", peer, e);
                        }
                    }
                    Err(e) => tracing::warn!("failed to accept sync connection: {}", e),
                }
            });
        }
        transport.close();
        tracing::info!("sync server stopped");
    }

    /// Handshake and serve one session stream.
    pub async fn handle_stream(
        self: Arc<Self>,
        stream: SyncStream,
        cancel: CancellationToken,
    ) -> Result<(), SyncError> {
        let SyncStream {
            mut reader,
            mut writer,
            peer,
        } = stream;

        let hello = match tokio::time::timeout(
            self.config.handshake_timeout,
            read_message(&mut reader),
        )
        .await
        {
            Err(_) => return Err(SyncError::Handshake(format!("no hello from {}", peer))),
            Ok(read) => match read? {
                Some(Message::Hello(hello)) => hello,
                Some(other) => {
                    return Err(SyncError::Handshake(format!(
                        "expected hello, got {}",
                        message_type_name(&other)
                    )))
                }
                None => return Err(SyncError::Handshake("closed before hello".to_string())),
            },
        };
        let zone = hello.zone.clone();

        if zone.trim().is_empty() {
            let reason = "empty zone name".to_string();
            write_message(&mut writer, &Message::Reject { reason: reason.clone() }).await?;
            return Err(SyncError::Rejected(reason));
        }

        if let Some(owner) = self.route(&zone).await {
            tracing::info!("redirecting zone {} to {}", zone, owner.id);
            write_message(
                &mut writer,
                &Message::Redirect {
                    instance_id: owner.id,
                    address: owner.address,
                },
            )
            .await?;
            return Ok(());
        }

        if !self.ensure_zone(&zone).await? {
            let reason = format!("zone {} is disabled", zone);
            tracing::warn!("rejecting session: {}", reason);
            write_message(&mut writer, &Message::Reject { reason: reason.clone() }).await?;
            return Err(SyncError::Rejected(reason));
        }

        write_message(
            &mut writer,
            &Message::Welcome {
                global_instance_id: self.instance_id.clone(),
                store_id: self.store.store_id().to_string(),
            },
        )
        .await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let session_cancel = cancel.child_token();
        if let Some(previous) = self.sessions.insert(
            zone.clone(),
            ActiveSession {
                id: session_id.clone(),
                cancel: session_cancel.clone(),
            },
        ) {
            tracing::info!("new session for zone {} supersedes {}", zone, previous.id);
            previous.cancel.cancel();
        }
        tracing::info!(
            "zone {} connected from {} (instance {}, version {})",
            zone,
            peer,
            hello.instance_id,
            hello.version
        );

        let now = unix_millis();
        let insights = ZoneSessionInsights::open(
            self.insights.clone(),
            self.subscription(&session_id, &hello, now),
        )
        .await;
        let flusher = {
            let insights = insights.clone();
            let cancel = session_cancel.clone();
            tokio::spawn(async move { insights.run_flusher(cancel).await })
        };

        let _guard = self.shutdown.session_guard();
        self.metrics.session_opened(&zone);

        let session = Arc::new(
            SyncSession::new(
                self.store.clone(),
                self.bus.clone(),
                self.metrics.clone(),
                self.config.clone(),
                OutboundFilter::ToZone { zone: zone.clone() },
                ResourceSyncer::new(
                    self.store.clone(),
                    self.metrics.clone(),
                    InboundPeer::Zone { zone: zone.clone() },
                    hello.store_id.clone(),
                ),
            )
            .with_heartbeat_hook(insights.clone()),
        );
        let result = session
            .run(SyncStream::new(reader, writer, peer), session_cancel.clone())
            .await;

        session_cancel.cancel();
        let _ = flusher.await;
        self.metrics.session_closed(&zone);
        self.sessions.remove_if(&zone, |_, active| active.id == session_id);
        if let Err(e) = insights.close(unix_millis()).await {
            tracing::warn!("failed to record disconnect of zone {}: {}", zone, e);
        }
        tracing::info!("zone {} disconnected", zone);

        result
    }

    fn subscription(&self, id: &str, hello: &Handshake, now: u64) -> Subscription {
        Subscription {
            id: id.to_string(),
            generation: 0,
            zone: hello.zone.clone(),
            global_instance_id: self.instance_id.clone(),
            zone_instance_id: hello.instance_id.clone(),
            connected_at: now,
            disconnected_at: None,
            last_heartbeat_at: now,
            control_plane_version: hello.version.clone(),
        }
    }

    /// The replica that should serve `zone`, if it is not this one. Without
    /// a usable catalog the session is served here.
    async fn route(&self, zone: &str) -> Option<CatalogInstance> {
        match self.catalog.owner_of(zone, unix_millis()).await {
            Ok(Some(owner)) if owner.id != self.instance_id => Some(owner),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("catalog unavailable, serving zone {} locally: {}", zone, e);
                None
            }
        }
    }

    /// Register the zone on first connect. Returns whether it is enabled.
    async fn ensure_zone(&self, zone: &str) -> Result<bool, StoreError> {
        let key = ResourceKey::global(ResourceType::Zone, zone);
        if let Some(existing) = self.store.get(&key).await? {
            return Ok(existing.spec.as_zone().map(|z| z.enabled).unwrap_or(true));
        }

        match self
            .store
            .create(Resource::new(key.clone(), ResourceSpec::Zone(ZoneSpec::default())))
            .await
        {
            Ok(_) => {
                tracing::info!("registered zone {}", zone);
                Ok(true)
            }
            Err(StoreError::AlreadyExists(_)) => Ok(self
                .store
                .get(&key)
                .await?
                .and_then(|r| r.spec.as_zone().map(|z| z.enabled))
                .unwrap_or(true)),
            Err(e) => Err(e),
        }
    }
}
