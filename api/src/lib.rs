#![deny(unused_crate_dependencies)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]
#![warn(unused_imports)]

//! HTTP surface of the exporter.
//!
//! Two routers served by two listeners: health probes plus the reload
//! hook on one port, the Prometheus text exposition on the other. Both
//! only read shared state; nothing here blocks on an in-flight poll.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use metrics::{ChainHealth, ChainHealthSnapshot, ChainStatus, MetricsBundle};
use poller::{ReloadError, Reloader};

/// Shared read-only state behind the HTTP handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Metric registry serialised by `/metrics`.
    pub bundle: Arc<MetricsBundle>,
    /// Per-chain freshness state behind the probes.
    pub health: Arc<ChainHealth>,
    /// Serialised reload entry point.
    pub reloader: Arc<Reloader>,
}

/// Router for the health listener.
pub fn health_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/livez", get(livez))
        .route("/health/readyz", get(readyz))
        .route("/health/details", get(details))
        .route("/health/reload", post(reload))
        .with_state(state)
}

/// Router for the metrics listener.
pub fn metrics_router(state: ApiState) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(state)
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn chain_entry(snapshot: &ChainHealthSnapshot, include_details: bool) -> Value {
    let mut entry = json!({
        "chain": snapshot.chain,
        "chain_id": snapshot
            .chain_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        "status": snapshot.status.as_str(),
    });

    if let Some(ts) = snapshot.last_success_ts {
        entry["last_success_ts"] = json!(ts);
    }

    if include_details {
        if let Some(error) = &snapshot.last_error {
            entry["last_error"] = json!(error);
        }
        entry["consecutive_failures"] = json!(snapshot.consecutive_failures);
        entry["current_backoff_s"] = json!(snapshot.current_backoff.as_secs_f64());
    }

    entry
}

fn overall_status(snapshots: &[ChainHealthSnapshot]) -> &'static str {
    if snapshots.is_empty() {
        return "ok";
    }

    let healthy = snapshots
        .iter()
        .filter(|snapshot| snapshot.status == ChainStatus::Healthy)
        .count();

    if healthy == snapshots.len() {
        "ok"
    } else if healthy > 0 {
        "degraded"
    } else {
        "unhealthy"
    }
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let snapshots = state.health.snapshot(epoch_seconds());

    Json(json!({
        "status": overall_status(&snapshots),
        "chains": snapshots
            .iter()
            .map(|snapshot| chain_entry(snapshot, false))
            .collect::<Vec<_>>(),
    }))
}

async fn details(State(state): State<ApiState>) -> Json<Value> {
    let snapshots = state.health.snapshot(epoch_seconds());

    Json(json!({
        "status": overall_status(&snapshots),
        "chains": snapshots
            .iter()
            .map(|snapshot| chain_entry(snapshot, true))
            .collect::<Vec<_>>(),
    }))
}

async fn livez(State(state): State<ApiState>) -> Response {
    if state.health.live() {
        (StatusCode::OK, Json(json!({"status": "alive"}))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "dead"})),
        )
            .into_response()
    }
}

async fn readyz(State(state): State<ApiState>) -> Response {
    let now = epoch_seconds();
    let ready = state.health.ready(now);
    let snapshots = state.health.snapshot(now);

    let body = Json(json!({
        "status": if ready { "ready" } else { "not_ready" },
        "chains": snapshots
            .iter()
            .map(|snapshot| chain_entry(snapshot, false))
            .collect::<Vec<_>>(),
    }));

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, body).into_response()
}

async fn reload(State(state): State<ApiState>) -> Response {
    match state.reloader.try_reload().await {
        Ok(summary) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "accepted",
                "added": summary.added,
                "removed": summary.removed,
                "replaced": summary.replaced,
                "total": summary.total,
            })),
        )
            .into_response(),
        Err(error @ ReloadError::InFlight) => (
            StatusCode::CONFLICT,
            Json(json!({"error": error.to_string()})),
        )
            .into_response(),
        Err(error @ ReloadError::Invalid(_)) => {
            tracing::warn!(%error, "reload rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": error.to_string()})),
            )
                .into_response()
        }
    }
}

async fn metrics(State(state): State<ApiState>) -> Response {
    match state.bundle.encode_text() {
        Ok(payload) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            payload,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests;
