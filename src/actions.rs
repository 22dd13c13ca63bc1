//! Action Resolution
//!
//! Turns the end of a conversation into its side effects: a severity-tagged
//! log line, an append-only JSON-lines ledger entry per action kind, and for
//! emergency/contact choices a telephony dispatch. Dispatch and resolution
//! each happen at most once per alert id.

use crate::activity_log;
use crate::config::DispatchConfig;
use crate::conversation::SessionOutcome;
use crate::services::{CallRequest, Dispatcher, ServiceOutcome, Severity};
use crate::vitals::MeasurementSample;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[serde(rename = "CALL_911")]
    CallEmergencyServices,
    #[serde(rename = "CALL_FAMILY")]
    CallContact,
    #[serde(rename = "NEITHER")]
    SelfCalm,
    Continue,
    Timeout,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::CallEmergencyServices => "CALL_911",
            Action::CallContact => "CALL_FAMILY",
            Action::SelfCalm => "NEITHER",
            Action::Continue => "CONTINUE",
            Action::Timeout => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Action::Continue)
    }
}

/// One ledger file per kind of ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    EmergencyCalls,
    ContactCalls,
    SelfCalm,
    Timeouts,
    SessionErrors,
    Stopped,
}

impl LedgerKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            LedgerKind::EmergencyCalls => "emergency_calls.jsonl",
            LedgerKind::ContactCalls => "contact_calls.jsonl",
            LedgerKind::SelfCalm => "self_calm.jsonl",
            LedgerKind::Timeouts => "timeouts.jsonl",
            LedgerKind::SessionErrors => "session_errors.jsonl",
            LedgerKind::Stopped => "stopped.jsonl",
        }
    }

    fn for_outcome(outcome: &SessionOutcome) -> Option<Self> {
        match outcome {
            SessionOutcome::Resolved { action, .. } => match action {
                Action::CallEmergencyServices => Some(LedgerKind::EmergencyCalls),
                Action::CallContact => Some(LedgerKind::ContactCalls),
                Action::SelfCalm => Some(LedgerKind::SelfCalm),
                Action::Timeout => Some(LedgerKind::Timeouts),
                Action::Continue => None,
            },
            SessionOutcome::Failed { .. } => Some(LedgerKind::SessionErrors),
            SessionOutcome::Stopped => Some(LedgerKind::Stopped),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub alert_id: u64,
    pub action: String,
    pub message: Option<String>,
    pub heart_rate: i32,
    pub breathing_rate: i32,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only JSON-lines files under one directory
#[derive(Debug, Clone)]
pub struct ActionLedger {
    dir: PathBuf,
}

impl ActionLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: LedgerKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    pub fn append(&self, kind: LedgerKind, entry: &LedgerEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create ledger dir {}", self.dir.display()))?;
        let path = self.path(kind);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open ledger {}", path.display()))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn read(&self, kind: LedgerKind) -> Result<Vec<LedgerEntry>> {
        read_entries(&self.path(kind))
    }
}

fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("Corrupt ledger line"))
        .collect()
}

/// Alert ids kept for the idempotency checks. Only one alert runs at a time,
/// so the window only has to outlive the alert in flight.
const RECENT_IDS: usize = 64;

/// Bounded set of recently seen alert ids; the oldest is evicted first
struct RecentIds {
    order: VecDeque<u64>,
    seen: HashSet<u64>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if `id` is already present
    fn insert(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, id: u64) -> bool {
        self.seen.contains(&id)
    }
}

pub struct ActionResolver {
    dispatcher: Arc<dyn Dispatcher>,
    recipients: DispatchConfig,
    ledger: ActionLedger,
    dispatched: Mutex<RecentIds>,
    resolved: Mutex<RecentIds>,
}

impl ActionResolver {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, recipients: DispatchConfig, ledger: ActionLedger) -> Self {
        Self {
            dispatcher,
            recipients,
            ledger,
            dispatched: Mutex::new(RecentIds::new(RECENT_IDS)),
            resolved: Mutex::new(RecentIds::new(RECENT_IDS)),
        }
    }

    pub fn ledger(&self) -> &ActionLedger {
        &self.ledger
    }

    /// Build the `make_call` body for actions that notify someone
    pub fn call_request(&self, action: Action, vitals: &MeasurementSample) -> Option<CallRequest> {
        let (to, incident, emotion, severity) = match action {
            Action::CallEmergencyServices => (
                &self.recipients.emergency_number,
                "Patient requested 911",
                "Distressed",
                Severity::High,
            ),
            Action::CallContact => (
                &self.recipients.contact_number,
                "Patient needs assistance",
                "Concerned",
                Severity::Low,
            ),
            _ => return None,
        };
        Some(CallRequest {
            to: to.clone(),
            name: self.recipients.patient_name.clone(),
            address: self.recipients.address.clone(),
            incident: incident.to_string(),
            heartrate: format!("{} bpm", vitals.heart_rate),
            breathing: format!("{} breaths/min", vitals.breathing_rate),
            emotion: emotion.to_string(),
            severity,
        })
    }

    /// Issue the dispatch for this alert unless one was already issued.
    ///
    /// Runs in the background; failures are logged and never reach the caller.
    pub fn dispatch_once(
        &self,
        alert_id: u64,
        action: Action,
        vitals: &MeasurementSample,
    ) -> Option<JoinHandle<()>> {
        let request = self.call_request(action, vitals)?;
        {
            let mut dispatched = self.dispatched.lock().unwrap_or_else(|e| e.into_inner());
            if !dispatched.insert(alert_id) {
                return None;
            }
        }
        if request.to.trim().is_empty() {
            activity_log::log_dispatch_failed(alert_id, "no recipient configured");
            return None;
        }

        activity_log::log_dispatch_issued(alert_id, request.severity.as_str());
        let dispatcher = self.dispatcher.clone();
        Some(tokio::spawn(async move {
            match dispatcher.make_call(&request).await {
                ServiceOutcome::Ok(_) => info!(alert_id, "Dispatch completed"),
                failed => activity_log::log_dispatch_failed(
                    alert_id,
                    &failed.failure_reason().unwrap_or_default(),
                ),
            }
        }))
    }

    pub fn was_dispatched(&self, alert_id: u64) -> bool {
        self.dispatched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(alert_id)
    }

    /// Record how the conversation for `alert_id` ended. Returns false if it
    /// was already resolved.
    pub fn resolve(&self, alert_id: u64, outcome: &SessionOutcome, vitals: &MeasurementSample) -> bool {
        {
            let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
            if !resolved.insert(alert_id) {
                return false;
            }
        }

        let (label, message) = match outcome {
            SessionOutcome::Resolved { action, message } => (action.as_str(), Some(message.clone())),
            SessionOutcome::Failed { reason } => ("ERROR", Some(reason.clone())),
            SessionOutcome::Stopped => ("STOPPED", None),
        };

        match outcome {
            SessionOutcome::Resolved { action: Action::CallEmergencyServices, .. } => {
                error!(alert_id, action = label, "Emergency services requested")
            }
            SessionOutcome::Resolved { action: Action::CallContact, .. } => {
                warn!(alert_id, action = label, "Emergency contact requested")
            }
            SessionOutcome::Resolved { action: Action::Timeout, .. } | SessionOutcome::Failed { .. } => {
                error!(alert_id, action = label, "Conversation ended without a choice")
            }
            _ => info!(alert_id, action = label, "Conversation resolved"),
        }
        activity_log::log_action_resolved(alert_id, label);

        if let SessionOutcome::Resolved { action, .. } = outcome {
            // No-op when the conversation already dispatched
            self.dispatch_once(alert_id, *action, vitals);
        }

        if let Some(kind) = LedgerKind::for_outcome(outcome) {
            let entry = LedgerEntry {
                alert_id,
                action: label.to_string(),
                message,
                heart_rate: vitals.heart_rate,
                breathing_rate: vitals.breathing_rate,
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.ledger.append(kind, &entry) {
                error!(alert_id, "Failed to write action ledger: {:#}", e);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        last: Mutex<Option<CallRequest>>,
    }

    #[async_trait]
    impl Dispatcher for CountingDispatcher {
        async fn make_call(&self, request: &CallRequest) -> ServiceOutcome<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(request.clone());
            ServiceOutcome::Ok(serde_json::json!({"success": true}))
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl Dispatcher for FailingDispatcher {
        async fn make_call(&self, _request: &CallRequest) -> ServiceOutcome<serde_json::Value> {
            ServiceOutcome::TimedOut
        }
    }

    fn recipients() -> DispatchConfig {
        DispatchConfig {
            emergency_number: "+15550911".to_string(),
            contact_number: "+15550100".to_string(),
            ..Default::default()
        }
    }

    fn vitals() -> MeasurementSample {
        MeasurementSample::new(140, 22, 0.9)
    }

    #[test]
    fn test_action_labels() {
        assert_eq!(Action::CallEmergencyServices.as_str(), "CALL_911");
        assert_eq!(
            serde_json::to_string(&Action::SelfCalm).unwrap(),
            "\"NEITHER\""
        );
        assert_eq!(serde_json::to_string(&Action::Timeout).unwrap(), "\"TIMEOUT\"");
        assert!(!Action::Continue.is_terminal());
    }

    #[test]
    fn test_call_request_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ActionResolver::new(
            Arc::new(CountingDispatcher::default()),
            recipients(),
            ActionLedger::new(dir.path()),
        );
        let emergency = resolver
            .call_request(Action::CallEmergencyServices, &vitals())
            .unwrap();
        assert_eq!(emergency.to, "+15550911");
        assert_eq!(emergency.severity, Severity::High);
        assert_eq!(emergency.incident, "Patient requested 911");
        assert_eq!(emergency.emotion, "Distressed");
        assert_eq!(emergency.heartrate, "140 bpm");

        let contact = resolver.call_request(Action::CallContact, &vitals()).unwrap();
        assert_eq!(contact.to, "+15550100");
        assert_eq!(contact.severity, Severity::Low);
        assert_eq!(contact.emotion, "Concerned");

        assert!(resolver.call_request(Action::SelfCalm, &vitals()).is_none());
    }

    #[tokio::test]
    async fn test_dispatch_is_idempotent_per_alert() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let resolver = ActionResolver::new(dispatcher.clone(), recipients(), ActionLedger::new(dir.path()));

        let handle = resolver
            .dispatch_once(7, Action::CallEmergencyServices, &vitals())
            .unwrap();
        handle.await.unwrap();
        assert!(resolver
            .dispatch_once(7, Action::CallEmergencyServices, &vitals())
            .is_none());

        // Resolution after the conversation dispatched does not call again
        let outcome = SessionOutcome::Resolved {
            action: Action::CallEmergencyServices,
            message: "Calling 911 now.".to_string(),
        };
        assert!(resolver.resolve(7, &outcome, &vitals()));
        assert!(!resolver.resolve(7, &outcome, &vitals()));
        tokio::task::yield_now().await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(resolver.was_dispatched(7));

        let entries = resolver.ledger().read(LedgerKind::EmergencyCalls).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].alert_id, 7);
        assert_eq!(entries[0].action, "CALL_911");
        assert_eq!(entries[0].heart_rate, 140);
    }

    #[test]
    fn test_recent_ids_evict_oldest() {
        let mut ids = RecentIds::new(3);
        for id in 1..=3 {
            assert!(ids.insert(id));
        }
        assert!(!ids.insert(2));
        assert!(ids.insert(4));
        assert!(!ids.contains(1));
        assert!(ids.contains(4));
        assert_eq!(ids.order.len(), 3);
        assert_eq!(ids.seen.len(), 3);
    }

    #[tokio::test]
    async fn test_idempotency_memory_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ActionResolver::new(
            Arc::new(CountingDispatcher::default()),
            recipients(),
            ActionLedger::new(dir.path()),
        );
        let outcome = SessionOutcome::Stopped;
        for id in 0..(RECENT_IDS as u64 * 3) {
            assert!(resolver.resolve(id, &outcome, &vitals()));
        }
        let resolved = resolver.resolved.lock().unwrap();
        assert_eq!(resolved.order.len(), RECENT_IDS);
        assert!(resolved.contains(RECENT_IDS as u64 * 3 - 1));
        assert!(!resolved.contains(0));
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ActionResolver::new(Arc::new(FailingDispatcher), recipients(), ActionLedger::new(dir.path()));
        let handle = resolver.dispatch_once(1, Action::CallContact, &vitals()).unwrap();
        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_recipient_skips_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let resolver = ActionResolver::new(
            dispatcher.clone(),
            DispatchConfig::default(),
            ActionLedger::new(dir.path()),
        );
        assert!(resolver.dispatch_once(2, Action::CallContact, &vitals()).is_none());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_call_outcomes_are_ledgered() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Arc::new(CountingDispatcher::default());
        let resolver = ActionResolver::new(dispatcher.clone(), recipients(), ActionLedger::new(dir.path()));

        resolver.resolve(
            1,
            &SessionOutcome::Resolved {
                action: Action::SelfCalm,
                message: "Breathe slowly.".to_string(),
            },
            &vitals(),
        );
        resolver.resolve(
            2,
            &SessionOutcome::Failed {
                reason: "connection lost".to_string(),
            },
            &vitals(),
        );
        resolver.resolve(3, &SessionOutcome::Stopped, &vitals());
        resolver.resolve(
            4,
            &SessionOutcome::Resolved {
                action: Action::Timeout,
                message: "no answer".to_string(),
            },
            &vitals(),
        );

        let ledger = resolver.ledger();
        assert_eq!(ledger.read(LedgerKind::SelfCalm).unwrap()[0].message.as_deref(), Some("Breathe slowly."));
        assert_eq!(ledger.read(LedgerKind::SessionErrors).unwrap()[0].action, "ERROR");
        assert_eq!(ledger.read(LedgerKind::Stopped).unwrap()[0].alert_id, 3);
        assert_eq!(ledger.read(LedgerKind::Timeouts).unwrap().len(), 1);
        assert!(ledger.read(LedgerKind::EmergencyCalls).unwrap().is_empty());
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }
}
