//! Ingest HTTP API
//!
//! Receives alerts from detectors over `POST /alerts`, exposes liveness on
//! `GET /health`, and offers `POST /plan` as a debug adapter straight into
//! the planner (never the executor). The server owns nothing: the alert
//! sink and planner are injected by the supervisor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::alerts::AlertSink;
use crate::planner::Planner;
use crate::types::{Alert, DefenderError, Fingerprint, IngestError};

/// Maximum accepted alert payload.
pub const MAX_ALERT_BYTES: usize = 64 * 1024;

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct IngestState {
    pub sink: Arc<dyn AlertSink>,
    pub planner: Arc<dyn Planner>,
    pub run_id: String,
    /// Unix millis of the last alert append, shared with the store.
    pub last_append_ms: Arc<AtomicI64>,
}

/// The ingest API server.
pub struct IngestServer {
    addr: SocketAddr,
    listener: tokio::net::TcpListener,
    state: IngestState,
}

impl IngestServer {
    /// Bind the listener; port 0 picks an ephemeral port (tests).
    pub async fn bind(bind_addr: &str, port: u16, state: IngestState) -> Result<Self, DefenderError> {
        let addr = format!("{bind_addr}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DefenderError::Internal(format!("failed to bind {addr}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| DefenderError::Internal(e.to_string()))?;
        Ok(Self {
            addr,
            listener,
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the shutdown signal flips; in-flight requests drain.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<(), DefenderError> {
        let app = Router::new()
            .route("/alerts", post(post_alert))
            .route("/health", get(health))
            .route("/plan", post(debug_plan))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(DefaultBodyLimit::max(MAX_ALERT_BYTES)),
            )
            .with_state(self.state);

        tracing::info!(addr = %self.addr, "ingest API listening");

        axum::serve(self.listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .map_err(|e| DefenderError::Internal(format!("ingest server error: {e}")))
    }
}

/// Parse `{raw, run_id?}` out of a request body.
fn parse_submission(body: &Bytes) -> Result<(String, Option<String>), IngestError> {
    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|err| IngestError::Malformed(format!("invalid JSON: {err}")))?;
    let raw = payload
        .get("raw")
        .and_then(|r| r.as_str())
        .ok_or_else(|| IngestError::Malformed("body must carry a string `raw` field".into()))?;
    let run_id = payload
        .get("run_id")
        .and_then(|r| r.as_str())
        .map(String::from);
    Ok((raw.to_string(), run_id))
}

fn ingest_error_response(err: &IngestError) -> Response {
    let status = match err {
        IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
        IngestError::Oversize { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IngestError::Persist(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, err.to_string())
}

/// `POST /alerts` — persist and enqueue one alert.
async fn post_alert(State(state): State<IngestState>, body: Bytes) -> Response {
    let (raw, run_id) = match parse_submission(&body) {
        Ok(parsed) => parsed,
        Err(err) => return ingest_error_response(&err),
    };

    match state.sink.accept(&raw, run_id.as_deref()).await {
        Ok(alert) => (
            StatusCode::OK,
            Json(serde_json::json!({ "accepted": true, "offset": alert.offset })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "alert persist failed");
            ingest_error_response(&IngestError::Persist(err.to_string()))
        }
    }
}

/// `GET /health` — liveness plus alert-flow freshness.
async fn health(State(state): State<IngestState>) -> Response {
    let last = state.last_append_ms.load(Ordering::Relaxed);
    let age_ms = (Utc::now().timestamp_millis() - last).max(0);
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "last_append_age_ms": age_ms })),
    )
        .into_response()
}

/// `POST /plan` — generate plans for an ad-hoc alert without executing.
async fn debug_plan(State(state): State<IngestState>, body: Bytes) -> Response {
    let (raw, _) = match parse_submission(&body) {
        Ok(parsed) => parsed,
        Err(err) => return ingest_error_response(&err),
    };

    let alert = Alert::new(raw, state.run_id.clone(), 0);
    let facets = crate::alerts::parse(&alert.raw_text);
    let fingerprint = Fingerprint::derive(&facets, &alert.raw_text);

    match state.planner.generate_for(&alert, &fingerprint).await {
        Ok(plans) => {
            let plans: Vec<_> = plans
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "executor_host_ip": p.executor_host_ip,
                        "plan": p.plan_text,
                        "model": p.model,
                    })
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "plans": plans }))).into_response()
        }
        Err(err) => error_response(StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
