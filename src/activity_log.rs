//! Activity Logging Module
//!
//! Structured activity logging for auditing escalations and debugging sessions.
//!
//! What IS logged:
//! - Alert ids, session ids
//! - Vital-sign values that crossed a threshold
//! - Conversation state transitions and resolved actions
//! - Dispatch outcomes (success/failure)
//! - Error messages
//!
//! What is NOT logged at info level:
//! - Transcript text (debug only)
//! - Audio content

use std::path::Path;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Guard that must be held for the duration of the application
/// to ensure logs are flushed before exit
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the activity logging system
///
/// Sets up dual logging:
/// - Console output (human-readable, filtered by `RUST_LOG`)
/// - File output (JSON, daily rotation) under `log_dir`
pub fn init_logging(log_dir: &Path, verbose: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "activity.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    // File layer - JSON format with explicit UTC timestamps
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(EnvFilter::new("pulse_guard=debug,info"));

    let default_level = if verbose { "debug" } else { "info" };
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        );

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    info!(
        event = "logging_initialized",
        log_dir = %log_dir.display(),
        "Activity logging system initialized"
    );

    Ok(())
}

// ============================================================================
// Measurement Events
// ============================================================================

pub fn log_sample_rejected(reason: &str) {
    warn!(event = "sample_rejected", reason = %reason, "Measurement record rejected");
}

pub fn log_abnormal_episode_started(heart_rate: i32, breathing_rate: i32) {
    info!(
        event = "abnormal_episode_started",
        heart_rate = heart_rate,
        breathing_rate = breathing_rate,
        "Vitals out of range, timing episode"
    );
}

pub fn log_vitals_normalized(episode_ms: u64) {
    info!(
        event = "vitals_normalized",
        episode_ms = episode_ms,
        "Vitals back in range"
    );
}

pub fn log_escalation_fired(heart_rate: i32, breathing_rate: i32, duration_ms: u64) {
    warn!(
        event = "escalation_fired",
        heart_rate = heart_rate,
        breathing_rate = breathing_rate,
        duration_ms = duration_ms,
        "Sustained abnormal vitals, escalating"
    );
}

// ============================================================================
// Alert Lifecycle Events
// ============================================================================

pub fn log_alert_triggered(alert_id: u64, heart_rate: i32, breathing_rate: i32) {
    warn!(
        event = "alert_triggered",
        alert_id = alert_id,
        heart_rate = heart_rate,
        breathing_rate = breathing_rate,
        "Alert triggered"
    );
}

pub fn log_alert_rejected(reason: &str) {
    info!(event = "alert_rejected", reason = %reason, "Alert trigger rejected");
}

pub fn log_alert_closed(alert_id: u64, status: &str, response: Option<&str>) {
    info!(
        event = "alert_closed",
        alert_id = alert_id,
        status = %status,
        response = response,
        "Alert moved to history"
    );
}

// ============================================================================
// Conversation Events
// ============================================================================

pub fn log_session_started(session_id: &str, alert_id: u64) {
    info!(
        event = "session_started",
        session_id = %session_id,
        alert_id = alert_id,
        "Conversation session started"
    );
}

pub fn log_state_change(session_id: &str, from: &str, to: &str) {
    info!(
        event = "state_change",
        session_id = %session_id,
        from = %from,
        to = %to,
        "Conversation state changed"
    );
}

pub fn log_deadline_forced(session_id: &str, had_partial: bool, window: u32) {
    warn!(
        event = "deadline_forced",
        session_id = %session_id,
        had_partial = had_partial,
        window = window,
        "Hard deadline reached without a decision"
    );
}

pub fn log_session_ended(session_id: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "session_ended",
        session_id = %session_id,
        outcome = %outcome,
        duration_ms = duration_ms,
        "Conversation session ended"
    );
}

pub fn log_session_error(session_id: &str, error_msg: &str) {
    error!(
        event = "session_error",
        session_id = %session_id,
        error = %error_msg,
        "Conversation session failed"
    );
}

// ============================================================================
// External Service Events
// ============================================================================

pub fn log_service_fallback(service: &str, reason: &str) {
    warn!(
        event = "service_fallback",
        service = %service,
        reason = %reason,
        "External service unavailable, using fallback"
    );
}

pub fn log_dispatch_issued(alert_id: u64, severity: &str) {
    info!(
        event = "dispatch_issued",
        alert_id = alert_id,
        severity = %severity,
        "Dispatch call requested"
    );
}

pub fn log_dispatch_failed(alert_id: u64, error_msg: &str) {
    error!(
        event = "dispatch_failed",
        alert_id = alert_id,
        error = %error_msg,
        "Dispatch call failed"
    );
}

pub fn log_action_resolved(alert_id: u64, action: &str) {
    info!(
        event = "action_resolved",
        alert_id = alert_id,
        action = %action,
        "Action resolved"
    );
}
