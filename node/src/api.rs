//! # HTTP API
//!
//! Read-only axum router over the running daemon.
//!
//! ## Endpoints
//!
//! | Method | Path         | Description                               |
//! |--------|--------------|-------------------------------------------|
//! | GET    | `/health`    | Liveness probe                            |
//! | GET    | `/status`    | Maps summary, radar, QSPN levels, counters |
//! | GET    | `/neighbors` | The rnode list                            |
//! | GET    | `/routes`    | Routes and gateways handed to the kernel  |
//! | GET    | `/metrics`   | Prometheus text format                    |

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use ntk_protocol::daemon::{Daemon, DaemonStatus};
use ntk_protocol::map::NodeId;
use ntk_protocol::radar::RlistEntry;

use crate::metrics::{metrics_handler, SharedMetrics};
use crate::routes::{GatewayEntry, RouteEntry, RouteTable};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub daemon: Arc<Daemon>,
    pub routes: Arc<RouteTable>,
    pub metrics: SharedMetrics,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/neighbors", get(neighbors_handler))
        .route("/routes", get(routes_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub uptime_secs: i64,
    pub timestamp: String,
    #[serde(flatten)]
    pub daemon: DaemonStatus,
}

#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub routes: std::collections::BTreeMap<String, RouteEntry>,
    pub gateways: Vec<GatewayEntry>,
    pub pending_rehook: Option<(NodeId, u8)>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let now = Utc::now();
    Json(StatusResponse {
        version: state.version.clone(),
        uptime_secs: (now - state.started_at).num_seconds(),
        timestamp: now.to_rfc3339(),
        daemon: state.daemon.status(),
    })
}

async fn neighbors_handler(State(state): State<AppState>) -> Json<Vec<RlistEntry>> {
    let mut neighbors = state.daemon.rlist().snapshot();
    neighbors.sort_by_key(|n| n.ip);
    Json(neighbors)
}

async fn routes_handler(State(state): State<AppState>) -> Json<RoutesResponse> {
    Json(RoutesResponse {
        routes: state.routes.routes(),
        gateways: state.routes.gateways(),
        pending_rehook: state.routes.pending_rehook(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use ntk_protocol::config::ProtocolConfig;
    use ntk_protocol::map::{QuadroGroup, RnodeTarget, Topology};
    use ntk_protocol::transport::Collaborators;

    use crate::metrics::NodeMetrics;
    use crate::udp::UdpTransport;

    async fn test_state() -> AppState {
        let me = "127.0.0.1".parse().unwrap();
        let transport = UdpTransport::bind(me, 0, vec!["lo".into()]).await.unwrap();
        let routes = Arc::new(RouteTable::new());
        let daemon = Daemon::new(
            ProtocolConfig::default(),
            Arc::new(Topology::new(me)),
            Arc::new(transport),
            routes.clone(),
        );
        AppState {
            version: "0.1.0-test".into(),
            started_at: Utc::now(),
            daemon: Arc::new(daemon),
            routes,
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_state().await);
        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_shows_the_maps() {
        let router = create_router(test_state().await);
        let (status, body) = get(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["map"]["ip"], "127.0.0.1");
        assert_eq!(json["map"]["alive_nodes"], 1);
        assert_eq!(json["radar"], "idle");
        assert_eq!(json["qspn"].as_array().unwrap().len(), 4);
        assert_eq!(json["stats"]["packets_dropped"], 0);
    }

    #[tokio::test]
    async fn neighbors_lists_the_rnode_list() {
        let state = test_state().await;
        let quadg = QuadroGroup::from_ip("127.0.0.2".parse().unwrap());
        state.daemon.rlist().upsert(RlistEntry {
            ip: quadg.ip(),
            target: RnodeTarget::Local(quadg.gid(0)),
            quadg,
            ifaces: vec!["lo".into()],
            rtt: 12,
            hooking: false,
            misses: 0,
        });
        let router = create_router(state);
        let (status, body) = get(&router, "/neighbors").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json[0]["ip"], "127.0.0.2");
        assert_eq!(json[0]["rtt"], 12);
    }

    #[tokio::test]
    async fn routes_reflect_collaborator_calls() {
        let state = test_state().await;
        state.routes.rehook(0, 0);
        let router = create_router(state);
        let (status, body) = get(&router, "/routes").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["pending_rehook"], serde_json::json!([0, 0]));
    }

    #[tokio::test]
    async fn metrics_are_scraped_from_the_daemon() {
        let router = create_router(test_state().await);
        let (status, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("ntk_alive_nodes 1"));
        assert!(text.contains("ntk_qspn_round{level=\"0\"} 0"));
    }
}
