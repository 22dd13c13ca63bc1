//! Alert Lifecycle Manager
//!
//! Owns the single active alert and its conversation session. Triggers are
//! rejected synchronously while an alert is active or within the cooldown
//! measured from the previous alert's start. When the session ends the alert
//! moves to history, whatever the outcome.

use crate::actions::ActionResolver;
use crate::activity_log;
use crate::conversation::{ConversationState, SessionOutcome};
use crate::vitals::MeasurementSample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: u64,
    pub vitals: MeasurementSample,
    pub triggered_at: DateTime<Utc>,
    pub status: AlertStatus,
    pub patient_response: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TriggerRejection {
    #[error("an alert is already active")]
    AlreadyActive,

    #[error("cooldown active for another {remaining_secs}s")]
    Cooldown { remaining_secs: u64 },
}

/// What a conversation is started with
#[derive(Debug, Clone)]
pub struct EscalationRequest {
    pub alert_id: u64,
    pub patient_id: String,
    pub vitals: MeasurementSample,
}

/// Session-scoped handles passed to the conversation
pub struct SessionControl {
    pub cancel: CancellationToken,
    pub state: watch::Sender<ConversationState>,
}

/// Starts the conversation for an alert and reports how it ended
#[async_trait]
pub trait ConversationLauncher: Send + Sync {
    async fn run(&self, request: EscalationRequest, control: SessionControl) -> SessionOutcome;
}

struct ActiveSession {
    alert_id: u64,
    cancel: CancellationToken,
    state: watch::Receiver<ConversationState>,
}

#[derive(Default)]
struct AlertBook {
    active: Option<Alert>,
    history: Vec<Alert>,
    last_alert_time: Option<Instant>,
    last_id: u64,
    session: Option<ActiveSession>,
    last_outcome: Option<SessionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_active: bool,
    pub alert_id: Option<u64>,
    pub conversation_state: Option<ConversationState>,
    pub last_outcome: Option<SessionOutcome>,
}

pub struct AlertManager {
    book: Mutex<AlertBook>,
    cooldown: Duration,
    patient_id: String,
    launcher: Arc<dyn ConversationLauncher>,
    resolver: Arc<ActionResolver>,
}

impl AlertManager {
    pub fn new(
        cooldown: Duration,
        patient_id: String,
        launcher: Arc<dyn ConversationLauncher>,
        resolver: Arc<ActionResolver>,
    ) -> Self {
        Self {
            book: Mutex::new(AlertBook::default()),
            cooldown,
            patient_id,
            launcher,
            resolver,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Escalation entry point; false when rejected
    pub fn try_trigger(self: &Arc<Self>, sample: MeasurementSample) -> bool {
        self.trigger_at(sample, None, Instant::now()).is_ok()
    }

    pub fn trigger(
        self: &Arc<Self>,
        sample: MeasurementSample,
        patient_id: Option<String>,
    ) -> Result<u64, TriggerRejection> {
        self.trigger_at(sample, patient_id, Instant::now())
    }

    pub fn trigger_at(
        self: &Arc<Self>,
        sample: MeasurementSample,
        patient_id: Option<String>,
        now: Instant,
    ) -> Result<u64, TriggerRejection> {
        let (request, control) = {
            let mut book = self.lock();

            if book.active.is_some() {
                activity_log::log_alert_rejected("already active");
                return Err(TriggerRejection::AlreadyActive);
            }
            if let Some(last) = book.last_alert_time {
                let since = now.saturating_duration_since(last);
                if since < self.cooldown {
                    let remaining = self.cooldown - since;
                    activity_log::log_alert_rejected("cooldown");
                    return Err(TriggerRejection::Cooldown {
                        remaining_secs: remaining.as_secs_f64().ceil() as u64,
                    });
                }
            }

            // Time-derived, strictly increasing
            let unix = Utc::now().timestamp().max(0) as u64;
            let id = unix.max(book.last_id + 1);
            book.last_id = id;

            let alert = Alert {
                id,
                vitals: sample.clone(),
                triggered_at: Utc::now(),
                status: AlertStatus::Active,
                patient_response: None,
                error: None,
            };
            book.active = Some(alert);
            book.last_alert_time = Some(now);

            let cancel = CancellationToken::new();
            let (state_tx, state_rx) = watch::channel(ConversationState::Initial);
            book.session = Some(ActiveSession {
                alert_id: id,
                cancel: cancel.clone(),
                state: state_rx,
            });

            activity_log::log_alert_triggered(id, sample.heart_rate, sample.breathing_rate);
            (
                EscalationRequest {
                    alert_id: id,
                    patient_id: patient_id.unwrap_or_else(|| self.patient_id.clone()),
                    vitals: sample,
                },
                SessionControl {
                    cancel,
                    state: state_tx,
                },
            )
        };

        let alert_id = request.alert_id;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let vitals = request.vitals.clone();
            let outcome = manager.launcher.run(request, control).await;
            manager.resolver.resolve(alert_id, &outcome, &vitals);
            manager.complete(alert_id, outcome);
        });

        Ok(alert_id)
    }

    /// Move the alert to history once its session has ended
    pub fn complete(&self, alert_id: u64, outcome: SessionOutcome) {
        let mut book = self.lock();
        if book.session.as_ref().map(|s| s.alert_id) == Some(alert_id) {
            book.session = None;
        }

        if book.active.as_ref().map(|a| a.id) == Some(alert_id) {
            if let Some(mut alert) = book.active.take() {
                match &outcome {
                    SessionOutcome::Resolved { message, .. } => {
                        alert.status = AlertStatus::Resolved;
                        alert.patient_response = Some(format!("{}: {}", outcome.label(), message));
                    }
                    SessionOutcome::Stopped => {
                        alert.status = AlertStatus::Resolved;
                        alert.patient_response = Some("STOPPED".to_string());
                    }
                    SessionOutcome::Failed { reason } => {
                        alert.status = AlertStatus::Error;
                        alert.error = Some(reason.clone());
                    }
                }
                activity_log::log_alert_closed(
                    alert.id,
                    outcome.label(),
                    alert.patient_response.as_deref(),
                );
                book.history.push(alert);
            }
        }
        book.last_outcome = Some(outcome);
    }

    pub fn get_active(&self) -> Option<Alert> {
        self.lock().active.clone()
    }

    /// Most recent first
    pub fn get_history(&self, limit: usize) -> Vec<Alert> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    /// Close the active alert without waiting for its session
    pub fn clear_active(&self) -> Option<u64> {
        let mut book = self.lock();
        let mut alert = book.active.take()?;
        if let Some(session) = book.session.take() {
            session.cancel.cancel();
        }
        alert.status = AlertStatus::Resolved;
        alert.patient_response = Some("CLEARED".to_string());
        activity_log::log_alert_closed(alert.id, "CLEARED", alert.patient_response.as_deref());
        let id = alert.id;
        book.history.push(alert);
        Some(id)
    }

    /// Ask the running session to stop; false if none is running
    pub fn stop_active(&self) -> bool {
        match self.lock().session.as_ref() {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn session_status(&self) -> SessionStatus {
        let book = self.lock();
        SessionStatus {
            session_active: book.session.is_some(),
            alert_id: book.session.as_ref().map(|s| s.alert_id),
            conversation_state: book.session.as_ref().map(|s| *s.state.borrow()),
            last_outcome: book.last_outcome.clone(),
        }
    }

    /// Seconds left before a new alert may start
    pub fn cooldown_remaining(&self) -> Duration {
        let book = self.lock();
        book.last_alert_time
            .map(|last| self.cooldown.saturating_sub(last.elapsed()))
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionLedger};
    use crate::config::DispatchConfig;
    use crate::services::{CallRequest, Dispatcher, ServiceOutcome};
    use tokio::sync::Notify;

    struct NoopDispatcher;

    #[async_trait]
    impl Dispatcher for NoopDispatcher {
        async fn make_call(&self, _request: &CallRequest) -> ServiceOutcome<serde_json::Value> {
            ServiceOutcome::Ok(serde_json::Value::Null)
        }
    }

    /// Holds the session open until released, then returns a fixed outcome
    struct GatedLauncher {
        release: Notify,
        outcome: SessionOutcome,
        started: Mutex<Vec<EscalationRequest>>,
    }

    #[async_trait]
    impl ConversationLauncher for GatedLauncher {
        async fn run(&self, request: EscalationRequest, control: SessionControl) -> SessionOutcome {
            self.started.lock().unwrap().push(request);
            control.state.send_replace(ConversationState::WaitingForChoice);
            tokio::select! {
                _ = control.cancel.cancelled() => SessionOutcome::Stopped,
                _ = self.release.notified() => self.outcome.clone(),
            }
        }
    }

    fn manager(outcome: SessionOutcome) -> (Arc<AlertManager>, Arc<GatedLauncher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(GatedLauncher {
            release: Notify::new(),
            outcome,
            started: Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(ActionResolver::new(
            Arc::new(NoopDispatcher),
            DispatchConfig::default(),
            ActionLedger::new(dir.path()),
        ));
        let manager = Arc::new(AlertManager::new(
            Duration::from_secs(300),
            "patient-1".to_string(),
            launcher.clone(),
            resolver,
        ));
        (manager, launcher, dir)
    }

    fn sample() -> MeasurementSample {
        MeasurementSample::new(140, 22, 0.9)
    }

    fn self_calm() -> SessionOutcome {
        SessionOutcome::Resolved {
            action: Action::SelfCalm,
            message: "Breathe slowly.".to_string(),
        }
    }

    async fn wait_for_history(manager: &AlertManager, len: usize) {
        for _ in 0..100 {
            if manager.get_history(usize::MAX).len() >= len {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("alert never reached history");
    }

    #[tokio::test]
    async fn test_trigger_creates_active_alert_and_starts_session() {
        let (manager, launcher, _dir) = manager(self_calm());
        let id = manager.trigger(sample(), None).unwrap();

        let active = manager.get_active().unwrap();
        assert_eq!(active.id, id);
        assert_eq!(active.status, AlertStatus::Active);
        assert_eq!(active.vitals.heart_rate, 140);

        tokio::task::yield_now().await;
        let started = launcher.started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].alert_id, id);
        assert_eq!(started[0].patient_id, "patient-1");
    }

    #[tokio::test]
    async fn test_second_trigger_rejected_while_active() {
        let (manager, _launcher, _dir) = manager(self_calm());
        let start = Instant::now();
        manager.trigger_at(sample(), None, start).unwrap();
        let err = manager
            .trigger_at(sample(), None, start + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, TriggerRejection::AlreadyActive);
        assert!(manager.get_history(10).is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_measured_from_alert_start() {
        let (manager, launcher, _dir) = manager(self_calm());
        let start = Instant::now();
        let first = manager.trigger_at(sample(), None, start).unwrap();

        tokio::task::yield_now().await;
        launcher.release.notify_one();
        wait_for_history(&manager, 1).await;
        assert!(manager.get_active().is_none());

        let err = manager
            .trigger_at(sample(), None, start + Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err, TriggerRejection::Cooldown { remaining_secs: 299 });

        let second = manager
            .trigger_at(sample(), None, start + Duration::from_secs(300))
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_completion_moves_alert_to_history() {
        let (manager, launcher, dir) = manager(self_calm());
        let id = manager.trigger(sample(), None).unwrap();
        tokio::task::yield_now().await;
        launcher.release.notify_one();
        wait_for_history(&manager, 1).await;

        let history = manager.get_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, id);
        assert_eq!(history[0].status, AlertStatus::Resolved);
        assert_eq!(
            history[0].patient_response.as_deref(),
            Some("NEITHER: Breathe slowly.")
        );
        assert!(manager.get_active().is_none());
        assert!(!manager.session_status().session_active);
        assert_eq!(manager.session_status().last_outcome, Some(self_calm()));
        assert!(dir.path().join("self_calm.jsonl").exists());
    }

    #[tokio::test]
    async fn test_failed_session_still_closes_alert() {
        let (manager, launcher, _dir) = manager(SessionOutcome::Failed {
            reason: "connection lost".to_string(),
        });
        manager.trigger(sample(), None).unwrap();
        tokio::task::yield_now().await;
        launcher.release.notify_one();
        wait_for_history(&manager, 1).await;

        let alert = &manager.get_history(1)[0];
        assert_eq!(alert.status, AlertStatus::Error);
        assert_eq!(alert.error.as_deref(), Some("connection lost"));
        assert!(manager.get_active().is_none());
    }

    #[tokio::test]
    async fn test_stop_ends_session_as_stopped() {
        let (manager, _launcher, _dir) = manager(self_calm());
        assert!(!manager.stop_active());
        manager.trigger(sample(), None).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            manager.session_status().conversation_state,
            Some(ConversationState::WaitingForChoice)
        );

        assert!(manager.stop_active());
        wait_for_history(&manager, 1).await;
        let alert = &manager.get_history(1)[0];
        assert_eq!(alert.patient_response.as_deref(), Some("STOPPED"));
        assert_eq!(manager.session_status().last_outcome, Some(SessionOutcome::Stopped));
    }

    #[tokio::test]
    async fn test_clear_active() {
        let (manager, _launcher, _dir) = manager(self_calm());
        assert!(manager.clear_active().is_none());
        let id = manager.trigger(sample(), None).unwrap();
        assert_eq!(manager.clear_active(), Some(id));
        assert!(manager.get_active().is_none());
        assert_eq!(manager.get_history(10).len(), 1);

        // The cancelled session finishing later does not duplicate history
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.get_history(10).len(), 1);
    }

    #[tokio::test]
    async fn test_history_is_newest_first_and_limited() {
        let (manager, launcher, _dir) = manager(self_calm());
        let start = Instant::now();
        let mut ids = Vec::new();
        for i in 0..3u64 {
            ids.push(
                manager
                    .trigger_at(sample(), None, start + Duration::from_secs(300 * i))
                    .unwrap(),
            );
            tokio::task::yield_now().await;
            launcher.release.notify_one();
            wait_for_history(&manager, i as usize + 1).await;
        }
        let history = manager.get_history(2);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }

    #[tokio::test]
    async fn test_at_most_one_active() {
        let (manager, _launcher, _dir) = manager(self_calm());
        let start = Instant::now();
        let accepted = (0..20)
            .filter(|i| {
                manager
                    .trigger_at(sample(), None, start + Duration::from_millis(*i * 10))
                    .is_ok()
            })
            .count();
        assert_eq!(accepted, 1);
    }
}
