//! Probes and Prometheus metrics served next to the controller.
//!
//! - `/healthz`: the process is up
//! - `/readyz`: leadership acquired and the controller started
//! - `/metrics`: Prometheus text exposition

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tracing::{error, info};

/// Port the health and metrics server listens on.
pub const HEALTH_PORT: u16 = 8080;

const METRIC_PREFIX: &str = "vertica_operator";

/// Identifies one VerticaDB in metric labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct VdbLabels {
    pub namespace: String,
    pub name: String,
}

impl VdbLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for VdbLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())
    }
}

/// The actor that ended a pass early.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ActorLabels {
    pub actor: String,
}

impl EncodeLabelSet for ActorLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("actor", self.actor.as_str()).encode(encoder.encode_label())
    }
}

type DurationFamily = Family<VdbLabels, Histogram, fn() -> Histogram>;

fn duration_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.005, 2.0, 14))
}

/// Operator metrics.
pub struct Metrics {
    reconciles: Family<VdbLabels, Counter>,
    reconcile_errors: Family<VdbLabels, Counter>,
    reconcile_duration: DurationFamily,
    actor_aborts: Family<ActorLabels, Counter>,
    up_nodes: Family<VdbLabels, Gauge>,
    subclusters: Family<VdbLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix(METRIC_PREFIX);

        let reconciles = Family::<VdbLabels, Counter>::default();
        registry.register("reconciliations", "Reconcile passes that completed", reconciles.clone());

        let reconcile_errors = Family::<VdbLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Reconcile passes that failed",
            reconcile_errors.clone(),
        );

        let reconcile_duration: DurationFamily = Family::new_with_constructor(duration_histogram);
        registry.register(
            "reconcile_duration_seconds",
            "Wall time of a reconcile pass",
            reconcile_duration.clone(),
        );

        let actor_aborts = Family::<ActorLabels, Counter>::default();
        registry.register(
            "actor_aborts",
            "Reconcile passes stopped early, by actor",
            actor_aborts.clone(),
        );

        let up_nodes = Family::<VdbLabels, Gauge>::default();
        registry.register("up_nodes", "Vertica nodes reported up", up_nodes.clone());

        let subclusters = Family::<VdbLabels, Gauge>::default();
        registry.register("subclusters", "Subclusters known to the status", subclusters.clone());

        Self {
            reconciles,
            reconcile_errors,
            reconcile_duration,
            actor_aborts,
            up_nodes,
            subclusters,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = VdbLabels::new(namespace, name);
        self.reconciles.get_or_create(&labels).inc();
        self.reconcile_duration
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconcile_errors
            .get_or_create(&VdbLabels::new(namespace, name))
            .inc();
    }

    pub fn record_actor_abort(&self, actor: &str) {
        self.actor_aborts
            .get_or_create(&ActorLabels {
                actor: actor.to_string(),
            })
            .inc();
    }

    /// Publish the node and subcluster counts from a VerticaDB status.
    pub fn set_cluster_counts(&self, namespace: &str, name: &str, up_nodes: i64, subclusters: i64) {
        let labels = VdbLabels::new(namespace, name);
        self.up_nodes.get_or_create(&labels).set(up_nodes);
        self.subclusters.get_or_create(&labels).set(subclusters);
    }

    /// Prometheus text format of every registered metric.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            error!(error = %e, "failed to encode metrics");
            return "# metrics unavailable\n".to_string();
        }
        buffer
    }
}

/// State shared by the health endpoints, the controller and the metrics.
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
    /// Unix seconds of the last reconcile pass that finished.
    last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Starts not ready.
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Record that a reconcile pass just finished.
    pub fn mark_reconciled(&self) {
        let now = u64::try_from(jiff::Timestamp::now().as_second()).unwrap_or_default();
        self.last_reconcile.store(now, Ordering::Relaxed);
    }

    /// Unix seconds of the last finished pass; zero before the first.
    pub fn last_reconcile(&self) -> u64 {
        self.last_reconcile.load(Ordering::Relaxed)
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if !state.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response();
    }
    match state.last_reconcile() {
        0 => (StatusCode::OK, "ready").into_response(),
        at => (StatusCode::OK, format!("ready, last reconcile at {at}")).into_response(),
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the health endpoints on all interfaces until the listener fails.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "health server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, create_router(state)).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_metrics_are_prefixed() {
        let metrics = Metrics::new();
        metrics.record_reconcile("default", "vdb", 0.5);
        metrics.record_error("default", "vdb");

        let encoded = metrics.encode();
        assert!(encoded.contains("vertica_operator_reconciliations_total"));
        assert!(encoded.contains("vertica_operator_reconciliation_errors_total"));
        assert!(encoded.contains("vertica_operator_reconcile_duration_seconds"));
    }

    #[test]
    fn test_actor_aborts_by_actor() {
        let metrics = Metrics::new();
        metrics.record_actor_abort("Restart");
        metrics.record_actor_abort("Restart");
        metrics.record_actor_abort("DrainNode");

        let encoded = metrics.encode();
        assert!(encoded.contains("vertica_operator_actor_aborts_total{actor=\"Restart\"} 2"));
        assert!(encoded.contains("vertica_operator_actor_aborts_total{actor=\"DrainNode\"} 1"));
    }

    #[test]
    fn test_cluster_gauges_follow_latest_value() {
        let metrics = Metrics::new();
        metrics.set_cluster_counts("default", "vdb", 3, 2);
        metrics.set_cluster_counts("default", "vdb", 2, 2);

        let encoded = metrics.encode();
        assert!(encoded.contains("vertica_operator_up_nodes{namespace=\"default\",name=\"vdb\"} 2"));
        assert!(encoded.contains("vertica_operator_subclusters{namespace=\"default\",name=\"vdb\"} 2"));
    }

    #[test]
    fn test_readiness_and_last_reconcile() {
        let state = HealthState::new();
        assert!(!state.is_ready());
        assert_eq!(state.last_reconcile(), 0);

        state.set_ready(true);
        state.mark_reconciled();
        assert!(state.is_ready());
        assert!(state.last_reconcile() > 0);
    }
}
