//! Status API Server
//!
//! Read-only HTTP surface over the control plane: zone status, insight
//! inspection and Prometheus metrics.

use crate::adapters::outbound::PrometheusMetricsStore;
use crate::domain::entities::InsightSpec;
use crate::domain::errors::StoreError;
use crate::domain::ports::ResourceStore;
use crate::domain::value_objects::{Mode, ResourceType};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Status of one zone as shown on `/status/zones`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ZoneStatus {
    pub name: String,
    pub active: bool,
}

/// One insight as shown on `/inspect/*`.
#[derive(Debug, Clone, Serialize)]
pub struct InsightView {
    pub name: String,
    #[serde(flatten)]
    pub insight: InsightSpec,
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    store: Arc<dyn ResourceStore>,
    metrics: Arc<PrometheusMetricsStore>,
    mode: Mode,
    instance_id: String,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        metrics: Arc<PrometheusMetricsStore>,
        mode: Mode,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            metrics,
            mode,
            instance_id: instance_id.into(),
        }
    }

    /// Registered zones and whether each is currently online.
    pub async fn zone_statuses(&self) -> Result<Vec<ZoneStatus>, StoreError> {
        let zones = self.store.list(ResourceType::Zone, None).await?;
        let insights = self.store.list(ResourceType::ZoneInsight, None).await?;

        Ok(zones
            .into_iter()
            .map(|zone| {
                let active = insights
                    .iter()
                    .find(|i| i.name == zone.name)
                    .and_then(|i| i.spec.as_insight())
                    .map(|i| i.online)
                    .unwrap_or(false);
                ZoneStatus {
                    name: zone.name,
                    active,
                }
            })
            .collect())
    }

    pub async fn insights(
        &self,
        insight_type: ResourceType,
    ) -> Result<Vec<InsightView>, StoreError> {
        Ok(self
            .store
            .list(insight_type, None)
            .await?
            .into_iter()
            .filter_map(|r| {
                let insight = r.spec.as_insight()?.clone();
                Some(InsightView {
                    name: r.name,
                    insight,
                })
            })
            .collect())
    }
}

/// HTTP server for the status API.
pub struct ApiServer {
    listen_addr: String,
    state: ApiState,
}

impl ApiServer {
    pub fn new(listen_addr: impl Into<String>, state: ApiState) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            state,
        }
    }

    pub fn state(&self) -> ApiState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve until `cancel` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let app = self.router().layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("status API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;
        Ok(())
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status/zones", get(zone_status_handler))
        .route("/inspect/zones", get(zone_insights_handler))
        .route("/inspect/zones/:name", get(zone_insight_handler))
        .route("/inspect/zone-ingresses", get(ingress_insights_handler))
        .route("/inspect/zone-egresses", get(egress_insights_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

fn unavailable(e: StoreError) -> (StatusCode, Json<serde_json::Value>) {
    tracing::warn!("status API store read failed: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
}

// Handler functions

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.mode.as_str(),
        "instance_id": state.instance_id,
    }))
}

async fn zone_status_handler(State(state): State<ApiState>) -> impl IntoResponse {
    match state.zone_statuses().await {
        Ok(zones) => (StatusCode::OK, Json(serde_json::json!(zones))),
        Err(e) => unavailable(e),
    }
}

async fn list_insights(state: &ApiState, insight_type: ResourceType) -> impl IntoResponse {
    match state.insights(insight_type).await {
        Ok(insights) => (StatusCode::OK, Json(serde_json::json!(insights))),
        Err(e) => unavailable(e),
    }
}

async fn zone_insights_handler(State(state): State<ApiState>) -> impl IntoResponse {
    list_insights(&state, ResourceType::ZoneInsight).await
}

async fn ingress_insights_handler(State(state): State<ApiState>) -> impl IntoResponse {
    list_insights(&state, ResourceType::ZoneIngressInsight).await
}

async fn egress_insights_handler(State(state): State<ApiState>) -> impl IntoResponse {
    list_insights(&state, ResourceType::ZoneEgressInsight).await
}

async fn zone_insight_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.insights(ResourceType::ZoneInsight).await {
        Ok(insights) => match insights.into_iter().find(|i| i.name == name) {
            Some(view) => (StatusCode::OK, Json(serde_json::json!(view))),
            None => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": format!("no insight for zone {}", name)
                })),
            ),
        },
        Err(e) => unavailable(e),
    }
}

async fn metrics_handler(State(state): State<ApiState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::MemoryResourceStore;
    use crate::domain::entities::{Resource, ResourceKey, ResourceSpec, Subscription, ZoneSpec};
    use crate::domain::ports::MetricsStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn insight(zone: &str, online: bool) -> Resource {
        Resource::new(
            ResourceKey::global(ResourceType::ZoneInsight, zone),
            ResourceSpec::Insight(InsightSpec {
                subscriptions: vec![Subscription {
                    id: "s1".to_string(),
                    generation: 1,
                    zone: zone.to_string(),
                    global_instance_id: "global-1".to_string(),
                    zone_instance_id: "zone-cp-1".to_string(),
                    connected_at: 1,
                    disconnected_at: None,
                    last_heartbeat_at: 1,
                    control_plane_version: "0.1.0".to_string(),
                }],
                online,
            }),
        )
    }

    async fn create_test_state() -> ApiState {
        let store = Arc::new(MemoryResourceStore::new());
        for (zone, enabled) in [("east", true), ("west", true), ("north", false)] {
            store
                .create(Resource::new(
                    ResourceKey::global(ResourceType::Zone, zone),
                    ResourceSpec::Zone(ZoneSpec { enabled }),
                ))
                .await
                .unwrap();
        }
        store.create(insight("east", true)).await.unwrap();
        store.create(insight("west", false)).await.unwrap();

        let metrics = Arc::new(PrometheusMetricsStore::new("global-1"));
        metrics.set_leader("global-leader", true);
        ApiState::new(store, metrics, Mode::Global, "global-1")
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_handler() {
        let app = router(create_test_state().await);
        let (status, body) = get_json(app, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "global");
    }

    #[tokio::test]
    async fn test_zone_status_reports_activity() {
        let app = router(create_test_state().await);
        let (status, body) = get_json(app, "/status/zones").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            serde_json::json!([
                { "name": "east", "active": true },
                { "name": "north", "active": false },
                { "name": "west", "active": false },
            ])
        );
    }

    #[tokio::test]
    async fn test_inspect_zones_lists_insights() {
        let app = router(create_test_state().await);
        let (status, body) = get_json(app, "/inspect/zones").await;

        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["name"], "east");
        assert_eq!(items[0]["online"], true);
        assert_eq!(items[0]["subscriptions"][0]["generation"], 1);
    }

    #[tokio::test]
    async fn test_inspect_single_zone() {
        let state = create_test_state().await;

        let (status, body) = get_json(router(state.clone()), "/inspect/zones/west").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online"], false);

        let (status, _) = get_json(router(state), "/inspect/zones/nowhere").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_gateway_insights_empty() {
        let state = create_test_state().await;
        let (status, body) = get_json(router(state.clone()), "/inspect/zone-ingresses").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!([]));

        let (_, body) = get_json(router(state), "/inspect/zone-egresses").await;
        assert_eq!(body, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_metrics_handler() {
        let app = router(create_test_state().await);
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("meshsync_leader{instance=\"global-1\",slot=\"global-leader\"} 1"));
    }
}
