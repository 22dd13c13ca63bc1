//! Status and control HTTP surface.
//!
//! Read-only views of the latest measurement, detector progress, alerts and
//! the voice session, plus manual trigger and stop endpoints for testing.

use crate::alert::{AlertManager, TriggerRejection};
use crate::detector::AbnormalityDetector;
use crate::vitals::{LatestVitals, MeasurementSample};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 20;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub latest: Arc<LatestVitals>,
    pub detector: Arc<AbnormalityDetector>,
    pub alerts: Arc<AlertManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/vitals/current", get(current_vitals))
        .route("/api/alerts/active", get(active_alert))
        .route("/api/alerts/history", get(alert_history))
        .route("/api/alerts/clear", post(clear_alert))
        .route("/api/status", get(session_status))
        .route("/api/trigger-alert", post(trigger_alert))
        .route("/api/emergency/test-trigger", post(test_trigger))
        .route("/api/stop", post(stop_session))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")
}

async fn health() -> Json<Value> {
    Json(json!({
        "healthy": true,
        "service": "pulse-guard",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn current_vitals(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.latest.snapshot();
    let detector = state.detector.status();
    Json(json!({
        "status": snapshot.status,
        "vitals": snapshot.sample,
        "received": snapshot.received,
        "is_abnormal": detector.is_abnormal,
        "abnormal_duration_secs": detector.abnormal_duration_secs,
        "threshold_secs": detector.threshold_secs,
        "alert_active": state.alerts.get_active().is_some(),
    }))
}

async fn active_alert(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "alert": state.alerts.get_active() }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

/// Closed alerts, newest first; the response states this in `order`
async fn alert_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let alerts = state
        .alerts
        .get_history(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT));
    Json(json!({ "count": alerts.len(), "order": "newest_first", "alerts": alerts }))
}

async fn clear_alert(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match state.alerts.clear_active() {
        Some(alert_id) => (StatusCode::OK, Json(json!({ "cleared": alert_id }))),
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No active alert" })),
        ),
    }
}

async fn session_status(State(state): State<AppState>) -> Json<Value> {
    let status = state.alerts.session_status();
    Json(json!({
        "session_active": status.session_active,
        "alert_id": status.alert_id,
        "conversation_state": status.conversation_state,
        "result": status.last_outcome,
        "cooldown_remaining_secs": state.alerts.cooldown_remaining().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct TriggerVitals {
    heart_rate: i32,
    breathing_rate: i32,
    #[serde(default = "full_confidence")]
    pulse_confidence: f32,
    #[serde(default = "full_confidence")]
    breathing_confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    patient_id: Option<String>,
    vitals: TriggerVitals,
}

async fn trigger_alert(
    State(state): State<AppState>,
    Json(body): Json<TriggerBody>,
) -> (StatusCode, Json<Value>) {
    let sample = MeasurementSample {
        heart_rate: body.vitals.heart_rate,
        breathing_rate: body.vitals.breathing_rate,
        heart_confidence: body.vitals.pulse_confidence,
        breathing_confidence: body.vitals.breathing_confidence,
        is_talking: false,
        timestamp: Utc::now(),
    };
    match state.alerts.trigger(sample, body.patient_id) {
        Ok(alert_id) => (
            StatusCode::OK,
            Json(json!({ "status": "started", "alert_id": alert_id })),
        ),
        Err(rejection) => {
            warn!("Trigger request rejected: {}", rejection);
            (StatusCode::CONFLICT, Json(rejection_body(&rejection)))
        }
    }
}

/// Start an alert from the latest sample, or canned vitals before any arrive
async fn test_trigger(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let sample = state
        .latest
        .latest()
        .unwrap_or_else(|| MeasurementSample::new(140, 28, 0.9));
    match state.alerts.trigger(sample.clone(), None) {
        Ok(alert_id) => (
            StatusCode::OK,
            Json(json!({ "status": "started", "alert_id": alert_id, "vitals": sample })),
        ),
        Err(rejection) => (StatusCode::BAD_REQUEST, Json(rejection_body(&rejection))),
    }
}

async fn stop_session(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.alerts.stop_active() {
        (StatusCode::OK, Json(json!({ "status": "stopping" })))
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "No session running" })),
        )
    }
}

fn rejection_body(rejection: &TriggerRejection) -> Value {
    match rejection {
        TriggerRejection::AlreadyActive => json!({ "error": rejection.to_string() }),
        TriggerRejection::Cooldown { remaining_secs } => json!({
            "error": rejection.to_string(),
            "cooldown_remaining_secs": remaining_secs,
        }),
    }
}
