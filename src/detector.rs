//! Abnormality Detector
//!
//! Evaluates every ingested sample against the configured vital-sign ranges and
//! escalates once a high-confidence abnormal episode has lasted long enough.
//!
//! Architecture:
//!   evaluate(sample) (under the detector lock)
//!       → confidence check (unusable samples reset the episode)
//!       → range check → episode timing
//!       → escalation channel (try_send, never blocks the caller)

use crate::activity_log;
use crate::config::Thresholds;
use crate::vitals::MeasurementSample;
use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Rolling abnormal-episode state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorState {
    pub is_abnormal: bool,
    pub abnormal_since: Option<Instant>,
}

impl DetectorState {
    fn reset(&mut self) {
        self.is_abnormal = false;
        self.abnormal_since = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub is_abnormal: bool,
    pub abnormal_duration_secs: f64,
    pub threshold_secs: f64,
    pub last_sample: Option<MeasurementSample>,
}

struct Inner {
    state: DetectorState,
    last_sample: Option<MeasurementSample>,
}

pub struct AbnormalityDetector {
    thresholds: Thresholds,
    inner: Mutex<Inner>,
    escalations: mpsc::Sender<MeasurementSample>,
}

impl AbnormalityDetector {
    pub fn new(thresholds: Thresholds, escalations: mpsc::Sender<MeasurementSample>) -> Self {
        Self {
            thresholds,
            inner: Mutex::new(Inner {
                state: DetectorState::default(),
                last_sample: None,
            }),
            escalations,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    fn is_usable(&self, sample: &MeasurementSample) -> bool {
        let min = self.thresholds.confidence_threshold;
        sample.heart_confidence >= min && sample.breathing_confidence >= min
    }

    /// Inclusive bounds are normal
    pub fn is_out_of_range(&self, sample: &MeasurementSample) -> bool {
        let t = &self.thresholds;
        sample.heart_rate < t.pulse_min
            || sample.heart_rate > t.pulse_max
            || sample.breathing_rate < t.breathing_min
            || sample.breathing_rate > t.breathing_max
    }

    /// Evaluate a sample now; returns whether the detector is currently abnormal
    pub fn evaluate(&self, sample: &MeasurementSample) -> bool {
        self.evaluate_at(sample, Instant::now())
    }

    pub fn evaluate_at(&self, sample: &MeasurementSample, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_sample = Some(sample.clone());

        if !self.is_usable(sample) {
            if inner.state.is_abnormal {
                debug!("Low-confidence sample, abandoning abnormal episode");
            }
            inner.state.reset();
            return false;
        }

        if !self.is_out_of_range(sample) {
            if let Some(since) = inner.state.abnormal_since {
                activity_log::log_vitals_normalized(
                    now.saturating_duration_since(since).as_millis() as u64,
                );
            }
            inner.state.reset();
            return false;
        }

        let since = match inner.state.abnormal_since {
            Some(since) if inner.state.is_abnormal => since,
            _ => {
                inner.state.is_abnormal = true;
                inner.state.abnormal_since = Some(now);
                activity_log::log_abnormal_episode_started(sample.heart_rate, sample.breathing_rate);
                now
            }
        };

        let duration = now.saturating_duration_since(since);
        if duration >= self.thresholds.abnormal_duration() {
            activity_log::log_escalation_fired(
                sample.heart_rate,
                sample.breathing_rate,
                duration.as_millis() as u64,
            );
            if let Err(e) = self.escalations.try_send(sample.clone()) {
                warn!("Escalation not delivered: {}", e);
            }
            // A fresh sustained episode is required before the next escalation
            inner.state.reset();
        }

        inner.state.is_abnormal
    }

    pub fn state(&self) -> DetectorState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn status(&self) -> DetectorStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> DetectorStatus {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = inner
            .state
            .abnormal_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO);
        DetectorStatus {
            is_abnormal: inner.state.is_abnormal,
            abnormal_duration_secs: elapsed.as_secs_f64(),
            threshold_secs: self.thresholds.abnormal_duration_secs,
            last_sample: inner.last_sample.clone(),
        }
    }
}
