//! # Prometheus Metrics
//!
//! Mirrors the daemon counters and a few map gauges into a dedicated
//! [`prometheus::Registry`] (prefix `ntk`). Values are pulled from a
//! [`DaemonStatus`] on every scrape of `/metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use ntk_protocol::daemon::DaemonStatus;

use crate::api::AppState;

pub struct NodeMetrics {
    registry: Registry,
    pub scans_total: IntCounter,
    pub packets_handled_total: IntCounter,
    pub packets_dropped_total: IntCounter,
    pub qspn_rounds_total: IntCounter,
    pub tracers_started_total: IntCounter,
    pub route_updates_total: IntCounter,
    pub rehooks_total: IntCounter,
    pub neighbors: IntGauge,
    pub alive_nodes: IntGauge,
    pub network_gcount: IntGauge,
    /// Current QSPN round id per level.
    pub qspn_round: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Raises `counter` to `value`; counters never go down.
fn catch_up(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl NodeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("ntk".into()), None)?;

        let qspn_round = IntGaugeVec::new(
            Opts::new("qspn_round", "Current QSPN round id per level"),
            &["level"],
        )?;
        registry.register(Box::new(qspn_round.clone()))?;

        Ok(Self {
            scans_total: counter(&registry, "radar_scans_total", "Radar scans completed")?,
            packets_handled_total: counter(&registry, "packets_handled_total", "Inbound packets processed")?,
            packets_dropped_total: counter(&registry, "packets_dropped_total", "Inbound packets rejected")?,
            qspn_rounds_total: counter(&registry, "qspn_rounds_total", "QSPN rounds started by this node")?,
            tracers_started_total: counter(&registry, "tracers_started_total", "Tracer floods started")?,
            route_updates_total: counter(&registry, "route_updates_total", "Route changes handed to the kernel")?,
            rehooks_total: counter(&registry, "rehooks_total", "Rehooks after identity collisions")?,
            neighbors: gauge(&registry, "neighbors", "Direct neighbors in the rnode list")?,
            alive_nodes: gauge(&registry, "alive_nodes", "Live nodes in the internal map")?,
            network_gcount: gauge(&registry, "network_gcount", "Estimated nodes in the whole network")?,
            qspn_round,
            registry,
        })
    }

    pub fn observe(&self, status: &DaemonStatus) {
        let stats = &status.stats;
        catch_up(&self.scans_total, stats.scans);
        catch_up(&self.packets_handled_total, stats.packets_handled);
        catch_up(&self.packets_dropped_total, stats.packets_dropped);
        catch_up(&self.qspn_rounds_total, stats.rounds_started);
        catch_up(&self.tracers_started_total, stats.tracers_started);
        catch_up(&self.route_updates_total, stats.routes_updated);
        catch_up(&self.rehooks_total, stats.rehooks);

        self.neighbors.set(status.neighbors.len() as i64);
        self.alive_nodes.set(status.map.alive_nodes as i64);
        self.network_gcount.set(i64::from(status.map.network_gcount));
        for level in &status.qspn {
            self.qspn_round
                .with_label_values(&[&level.level.to_string()])
                .set(i64::from(level.round));
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.observe(&state.daemon.status());
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
