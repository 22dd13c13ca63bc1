//! Tagged results for calls to external services.
//!
//! Callers decide the fallback explicitly with [`ServiceOutcome::unwrap_or_fallback`]
//! instead of catching errors.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceOutcome<T> {
    Ok(T),
    Unavailable(String),
    TimedOut,
}

impl<T> ServiceOutcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, ServiceOutcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            ServiceOutcome::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Human-readable reason for a non-Ok outcome
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ServiceOutcome::Ok(_) => None,
            ServiceOutcome::Unavailable(reason) => Some(reason.clone()),
            ServiceOutcome::TimedOut => Some("timed out".to_string()),
        }
    }

    pub fn unwrap_or_fallback(self, service: &str, fallback: impl FnOnce() -> T) -> T {
        match self {
            ServiceOutcome::Ok(v) => v,
            other => {
                let reason = other.failure_reason().unwrap_or_default();
                crate::activity_log::log_service_fallback(service, &reason);
                fallback()
            }
        }
    }
}

impl<T, E: std::fmt::Display> From<Result<T, E>> for ServiceOutcome<T> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(v) => ServiceOutcome::Ok(v),
            Err(e) => ServiceOutcome::Unavailable(e.to_string()),
        }
    }
}

/// Run a fallible call under a deadline
pub async fn with_timeout<T, E, F>(limit: Duration, fut: F) -> ServiceOutcome<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.into(),
        Err(_) => ServiceOutcome::TimedOut,
    }
}
