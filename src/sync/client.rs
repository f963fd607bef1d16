//! Sync Client
//!
//! Zone side of the sync protocol. Runs only on the zone leader: dials
//! global, follows redirects to the replica that owns this zone, and keeps
//! reconnecting with capped exponential backoff. Every reconnect restarts
//! from a full snapshot.

use super::codec::{read_message, write_message};
use super::filter::OutboundFilter;
use super::session::{SessionState, SyncSession};
use super::syncer::{InboundPeer, ResourceSyncer};
use super::transport::{SyncConnector, SyncStream};
use super::types::{message_type_name, Handshake, Message, SyncError, CONTROL_PLANE_VERSION};
use super::{SessionConfig, MAX_REDIRECTS};
use crate::domain::ports::{MetricsStore, ResourceStore};
use crate::infrastructure::{Backoff, EventBus};
use crate::leader::{LeaderComponent, LeaderContext};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Accepted handshake.
struct Established {
    stream: SyncStream,
    global_instance_id: String,
    global_store_id: String,
}

pub struct SyncClient {
    zone: String,
    instance_id: String,
    global_address: String,
    connector: Arc<dyn SyncConnector>,
    store: Arc<dyn ResourceStore>,
    bus: EventBus,
    metrics: Arc<dyn MetricsStore>,
    config: SessionConfig,
    state: RwLock<SessionState>,
}

impl SyncClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        zone: impl Into<String>,
        instance_id: impl Into<String>,
        global_address: impl Into<String>,
        connector: Arc<dyn SyncConnector>,
        store: Arc<dyn ResourceStore>,
        bus: EventBus,
        metrics: Arc<dyn MetricsStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            zone: zone.into(),
            instance_id: instance_id.into(),
            global_address: global_address.into(),
            connector,
            store,
            bus,
            metrics,
            config,
            state: RwLock::new(SessionState::Closed),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn hello(&self) -> Message {
        Message::Hello(Handshake {
            zone: self.zone.clone(),
            instance_id: self.instance_id.clone(),
            version: CONTROL_PLANE_VERSION.to_string(),
            store_id: self.store.store_id().to_string(),
        })
    }

    /// Connect and handshake, following up to [`MAX_REDIRECTS`] redirects.
    async fn establish(&self) -> Result<Established, SyncError> {
        let mut address = self.global_address.clone();

        for _ in 0..=MAX_REDIRECTS {
            self.set_state(SessionState::Connecting);
            let mut stream = tokio::time::timeout(
                self.config.handshake_timeout,
                self.connector.connect(&address),
            )
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {} timed out", address)))??;

            self.set_state(SessionState::Handshake);
            write_message(&mut stream.writer, &self.hello()).await?;
            let reply =
                tokio::time::timeout(self.config.handshake_timeout, read_message(&mut stream.reader))
                    .await
                    .map_err(|_| SyncError::Handshake("no reply to hello".to_string()))??;

            match reply {
                Some(Message::Welcome {
                    global_instance_id,
                    store_id,
                }) => {
                    return Ok(Established {
                        stream,
                        global_instance_id,
                        global_store_id: store_id,
                    });
                }
                Some(Message::Redirect {
                    instance_id,
                    address: next,
                }) => {
                    tracing::info!("redirected to {} at {}", instance_id, next);
                    address = next;
                }
                Some(Message::Reject { reason }) => return Err(SyncError::Rejected(reason)),
                Some(other) => {
                    return Err(SyncError::Handshake(format!(
                        "expected welcome, got {}",
                        message_type_name(&other)
                    )))
                }
                None => {
                    return Err(SyncError::Handshake(
                        "connection closed during handshake".to_string(),
                    ))
                }
            }
        }

        Err(SyncError::TooManyRedirects(address))
    }

    /// One connection: handshake, then stream until the session ends.
    async fn connect_once(
        &self,
        backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> Result<(), SyncError> {
        let established = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            established = self.establish() => established?,
        };
        backoff.reset();
        self.set_state(SessionState::Streaming);
        tracing::info!(
            "zone {} connected to global instance {}",
            self.zone,
            established.global_instance_id
        );

        let session = Arc::new(SyncSession::new(
            self.store.clone(),
            self.bus.clone(),
            self.metrics.clone(),
            self.config.clone(),
            OutboundFilter::ToGlobal,
            ResourceSyncer::new(
                self.store.clone(),
                self.metrics.clone(),
                InboundPeer::Global {
                    local_zone: self.zone.clone(),
                },
                established.global_store_id,
            ),
        ));
        session.run(established.stream, cancel.clone()).await
    }
}

#[async_trait]
impl LeaderComponent for SyncClient {
    fn name(&self) -> &str {
        "sync-client"
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn run(&self, ctx: LeaderContext) -> anyhow::Result<()> {
        let mut backoff = Backoff::new(
            self.config.reconnect_backoff_initial,
            self.config.reconnect_backoff_max,
        );

        while !ctx.cancel.is_cancelled() {
            if ctx.leadership.is_held().await {
                match self.connect_once(&mut backoff, &ctx.cancel).await {
                    Ok(()) => tracing::info!("sync session of zone {} ended", self.zone),
                    Err(SyncError::Rejected(reason)) => {
                        tracing::warn!("global rejected zone {}: {}", self.zone, reason)
                    }
                    Err(e) => tracing::warn!("sync session of zone {} failed: {}", self.zone, e),
                }
            } else {
                tracing::debug!("not holding {}, not connecting", ctx.leadership.slot());
            }

            if ctx.cancel.is_cancelled() {
                break;
            }
            self.set_state(SessionState::Reconnecting);
            let delay = backoff.next_delay();
            tracing::debug!("reconnecting in {:?}", delay);
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SessionState::Closed);
        Ok(())
    }
}
