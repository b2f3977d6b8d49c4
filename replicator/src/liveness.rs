//! Liveness aggregates per-kind sync state and serves the HTTP status
//! endpoint.
//!
//! Each replicator's event loop answers probe pings with its synced bit; a
//! loop that stops servicing its mailbox (hung API call, dead task) fails the
//! ping and shows up in `notReady` without being killed.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{Result, prelude::CancellationToken};

/// SyncProbe is the replicator side of a probe registration: a mailbox of
/// reply slots the event loop answers with its synced bit.
pub type SyncProbe = mpsc::Receiver<oneshot::Sender<bool>>;

struct Probe {
    kind: String,
    tx: mpsc::Sender<oneshot::Sender<bool>>,
}

/// Liveness is the shared sync-status aggregate.
///
/// The mutex only guards registration and the published not-ready snapshot;
/// probing itself happens outside the lock.
pub struct Liveness {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    probes: Vec<Probe>,
    not_ready: Vec<String>,
}

impl Liveness {
    /// New creates an empty aggregate. Kinds are not-ready until their first
    /// successful probe.
    pub fn new() -> Arc<Liveness> {
        Arc::new(Liveness {
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Register adds `kind` to the aggregate and returns the probe mailbox
    /// its event loop must service.
    pub fn register(&self, kind: &str) -> SyncProbe {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock().expect("liveness lock poisoned");
        inner.probes.push(Probe {
            kind: kind.to_string(),
            tx,
        });
        inner.not_ready.push(kind.to_string());
        rx
    }

    /// Not_ready returns a copy of the latest probe verdict.
    pub fn not_ready(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("liveness lock poisoned")
            .not_ready
            .clone()
    }

    /// Probe_loop pings every registered replicator once per `period`,
    /// giving each the full period to answer, and publishes the result.
    pub async fn probe_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let probes: Vec<(String, mpsc::Sender<oneshot::Sender<bool>>)> = {
                let inner = self.inner.lock().expect("liveness lock poisoned");
                inner
                    .probes
                    .iter()
                    .map(|p| (p.kind.clone(), p.tx.clone()))
                    .collect()
            };
            let mut not_ready = Vec::new();
            for (kind, tx) in probes {
                if !probe_one(&tx, period).await {
                    warn!(kind, "replicator not ready");
                    not_ready.push(kind);
                }
            }
            debug!(not_ready = not_ready.len(), "probe pass done");
            self.inner.lock().expect("liveness lock poisoned").not_ready = not_ready;
        }
    }
}

async fn probe_one(tx: &mpsc::Sender<oneshot::Sender<bool>>, period: Duration) -> bool {
    let (reply_tx, reply_rx) = oneshot::channel();
    // A full mailbox means the previous ping is still unanswered.
    if tx.try_send(reply_tx).is_err() {
        return false;
    }
    matches!(timeout(period, reply_rx).await, Ok(Ok(true)))
}

/// AppState is the status server state.
#[derive(Clone)]
pub struct AppState {
    liveness: Arc<Liveness>,
    metrics: PrometheusHandle,
}

impl AppState {
    /// New bundles the aggregate and the Prometheus render handle.
    pub fn new(liveness: Arc<Liveness>, metrics: PrometheusHandle) -> AppState {
        AppState { liveness, metrics }
    }
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(rename = "notReady")]
    not_ready: Vec<String>,
}

/// App returns the status `axum::Router`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .fallback(get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn status(State(state): State<AppState>) -> (StatusCode, Json<StatusBody>) {
    // Copy out of the lock before encoding.
    let not_ready = state.liveness.not_ready();
    let code = if not_ready.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(StatusBody { not_ready }))
}

/// Serve runs the status server until cancellation.
pub async fn serve(addr: SocketAddr, state: AppState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "started status server");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}
