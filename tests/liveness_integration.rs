//! Integration tests for zone liveness
//!
//! Zone, ingress and egress insights follow the sync session that global
//! holds for a zone, and the global leader turns zones offline whose
//! owning replica stopped reporting.

mod common;

use common::*;
use mesh_sync::adapters::outbound::MemoryResourceStore;
use mesh_sync::domain::entities::{
    Resource, ResourceKey, ResourceSpec, Subscription, ZoneEgressSpec, ZoneIngressSpec,
};
use mesh_sync::domain::ports::ResourceStore;
use mesh_sync::domain::value_objects::{unix_millis, ResourceType};
use mesh_sync::infrastructure::ShutdownController;
use mesh_sync::insight::{InsightKind, InsightResyncer, InsightTracker};
use mesh_sync::sync::SyncClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_zone(zone: &Replica, connector: Arc<DuplexConnector>, cancel: CancellationToken) {
    let client = Arc::new(SyncClient::new(
        "east",
        zone.id.clone(),
        "global-1",
        connector,
        zone.store.clone(),
        zone.bus.clone(),
        zone.metrics_port(),
        session_config(),
    ));
    let mut elector = zone.elector("zone-leader/east");
    elector.add_component(client);
    tokio::spawn(async move { elector.run(cancel).await });
}

#[tokio::test]
async fn test_zone_and_gateways_follow_session() {
    let shutdown = ShutdownController::new();
    let global = Replica::new("global-1");
    let zone = Replica::new("zone-cp-1");
    let connector = DuplexConnector::new();
    connector.register("global-1", global.sync_server(&shutdown));

    zone.store
        .create(Resource::new(
            ResourceKey::global(ResourceType::ZoneIngress, "ingress-1"),
            ResourceSpec::ZoneIngress(ZoneIngressSpec::default()),
        ))
        .await
        .unwrap();
    zone.store
        .create(Resource::new(
            ResourceKey::global(ResourceType::ZoneEgress, "egress-1"),
            ResourceSpec::ZoneEgress(ZoneEgressSpec::default()),
        ))
        .await
        .unwrap();

    let zone_cancel = CancellationToken::new();
    start_zone(&zone, connector.clone(), zone_cancel.clone());

    assert!(wait_until(TIMEOUT, || global.insight_online(InsightKind::Zone, "east")).await);
    // Gateways are picked up by the next flush after they synced
    assert!(
        wait_until(TIMEOUT, || {
            global.insight_online(InsightKind::ZoneIngress, "east.ingress-1")
        })
        .await
    );
    assert!(
        wait_until(TIMEOUT, || {
            global.insight_online(InsightKind::ZoneEgress, "east.egress-1")
        })
        .await
    );

    // Insights stay on global
    let zone_insights = zone
        .store
        .list(ResourceType::ZoneInsight, None)
        .await
        .unwrap();
    assert!(zone_insights.is_empty());

    // The zone leaves; everything goes offline at once
    zone_cancel.cancel();
    assert!(
        wait_until(TIMEOUT, || async {
            !global.insight_online(InsightKind::Zone, "east").await
                && !global
                    .insight_online(InsightKind::ZoneIngress, "east.ingress-1")
                    .await
        })
        .await
    );

    let tracker = InsightTracker::new(global.store.clone(), global.metrics_port(), insight_config());
    let insight = tracker.get(InsightKind::Zone, "east").await.unwrap().unwrap();
    assert!(insight.current().unwrap().disconnected_at.is_some());

    shutdown.shutdown();
}

#[tokio::test]
async fn test_leader_turns_orphaned_zone_offline() {
    // Two global replicas on one store; global-1 owned the session and died
    let backend: Arc<dyn ResourceStore> = Arc::new(MemoryResourceStore::new());
    let dead = Replica::on_store("global-1", backend.clone());
    let survivor = Replica::on_store("global-2", backend);

    let tracker = InsightTracker::new(dead.store.clone(), dead.metrics_port(), insight_config());
    let now = unix_millis();
    let subscription = Subscription {
        id: "s1".to_string(),
        generation: 0,
        zone: "east".to_string(),
        global_instance_id: "global-1".to_string(),
        zone_instance_id: "zone-cp-1".to_string(),
        connected_at: now,
        disconnected_at: None,
        last_heartbeat_at: now,
        control_plane_version: "0.1.0".to_string(),
    };
    assert!(tracker
        .record(InsightKind::Zone, "east", &subscription, now)
        .await
        .unwrap());

    let mut elector = survivor.elector("global-leader");
    elector.add_component(Arc::new(InsightResyncer::new(
        survivor.store.clone(),
        insight_config(),
    )));
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move { elector.run(cancel).await });
    }

    // Offline within a few flush intervals past the liveness timeout
    let started = std::time::Instant::now();
    assert!(
        wait_until(TIMEOUT, || async {
            !survivor.insight_online(InsightKind::Zone, "east").await
        })
        .await
    );
    assert!(started.elapsed() >= insight_config().timeout() / 2);

    let insight = tracker.get(InsightKind::Zone, "east").await.unwrap().unwrap();
    assert_eq!(insight.subscriptions.len(), 1);
    assert!(insight.current().unwrap().disconnected_at.is_some());

    cancel.cancel();
}
