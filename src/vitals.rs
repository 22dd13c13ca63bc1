//! Measurement samples and the ingestion record format.
//!
//! Records arrive as newline-delimited JSON objects. Each one is parsed into
//! a [`MeasurementSample`], range-checked, and stored as the latest snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

pub const PULSE_RANGE: (f64, f64) = (0.0, 300.0);
pub const BREATHING_RANGE: (f64, f64) = (0.0, 100.0);
pub const CONFIDENCE_RANGE: (f64, f64) = (-3.0, 3.0);

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("invalid JSON: {0}")]
    BadJson(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// One physiological reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub heart_rate: i32,
    pub breathing_rate: i32,
    pub heart_confidence: f32,
    pub breathing_confidence: f32,
    pub is_talking: bool,
    pub timestamp: DateTime<Utc>,
}

impl MeasurementSample {
    pub fn new(heart_rate: i32, breathing_rate: i32, confidence: f32) -> Self {
        Self {
            heart_rate,
            breathing_rate,
            heart_confidence: confidence,
            breathing_confidence: confidence,
            is_talking: false,
            timestamp: Utc::now(),
        }
    }
}

/// Wire shape of one ingestion line. Numbers may arrive as floats.
#[derive(Debug, Deserialize)]
struct RawRecord {
    pulse_rate: Option<f64>,
    breathing_rate: Option<f64>,
    pulse_confidence: Option<f64>,
    breathing_confidence: Option<f64>,
    #[serde(default)]
    talking: Option<bool>,
}

fn required(value: Option<f64>, field: &'static str) -> Result<f64, IngestError> {
    value.ok_or(IngestError::MissingField(field))
}

fn in_range(value: f64, field: &'static str, (lo, hi): (f64, f64)) -> Result<f64, IngestError> {
    if value.is_finite() && value >= lo && value <= hi {
        Ok(value)
    } else {
        Err(IngestError::OutOfRange { field, value })
    }
}

/// Parse and validate one ingestion line
pub fn parse_record(line: &str) -> Result<MeasurementSample, IngestError> {
    let raw: RawRecord =
        serde_json::from_str(line).map_err(|e| IngestError::BadJson(e.to_string()))?;

    let pulse = in_range(required(raw.pulse_rate, "pulse_rate")?, "pulse_rate", PULSE_RANGE)?;
    let breathing = in_range(
        required(raw.breathing_rate, "breathing_rate")?,
        "breathing_rate",
        BREATHING_RANGE,
    )?;
    let pulse_conf = in_range(
        required(raw.pulse_confidence, "pulse_confidence")?,
        "pulse_confidence",
        CONFIDENCE_RANGE,
    )?;
    let breathing_conf = in_range(
        required(raw.breathing_confidence, "breathing_confidence")?,
        "breathing_confidence",
        CONFIDENCE_RANGE,
    )?;

    Ok(MeasurementSample {
        heart_rate: pulse as i32,
        breathing_rate: breathing as i32,
        heart_confidence: pulse_conf as f32,
        breathing_confidence: breathing_conf as f32,
        is_talking: raw.talking.unwrap_or(false),
        timestamp: Utc::now(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Waiting,
    Active,
}

#[derive(Debug, Clone, Serialize)]
pub struct VitalsSnapshot {
    pub status: FeedStatus,
    pub sample: Option<MeasurementSample>,
    pub received: u64,
}

/// Most recent accepted sample
#[derive(Debug, Default)]
pub struct LatestVitals {
    inner: Mutex<Option<(MeasurementSample, u64)>>,
}

impl LatestVitals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, sample: MeasurementSample) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let count = guard.as_ref().map(|(_, n)| *n).unwrap_or(0) + 1;
        *guard = Some((sample, count));
    }

    pub fn latest(&self) -> Option<MeasurementSample> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(|(s, _)| s.clone())
    }

    pub fn snapshot(&self) -> VitalsSnapshot {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((sample, count)) => VitalsSnapshot {
                status: FeedStatus::Active,
                sample: Some(sample.clone()),
                received: *count,
            },
            None => VitalsSnapshot {
                status: FeedStatus::Waiting,
                sample: None,
                received: 0,
            },
        }
    }
}
