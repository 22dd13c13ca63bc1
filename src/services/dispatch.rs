//! Telephony dispatch client (`POST /make_call`).

use super::outcome::{with_timeout, ServiceOutcome};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    High,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "High",
            Severity::Low => "Low",
        }
    }
}

/// Body of a `make_call` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub to: String,
    pub name: String,
    pub address: String,
    pub incident: String,
    pub heartrate: String,
    pub breathing: String,
    pub emotion: String,
    pub severity: Severity,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn make_call(&self, request: &CallRequest) -> ServiceOutcome<serde_json::Value>;
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(config: &ServicesConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: config.dispatch_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.dispatch_timeout_secs),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/make_call", self.base_url)
    }

    async fn post(&self, request: &CallRequest) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|e| format!("Dispatch request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let truncated: String = error_body.chars().take(200).collect();
            return Err(format!("Dispatch error {}: {}", status, truncated));
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| format!("Failed to parse dispatch response: {}", e))?;
        info!("Dispatch accepted: call_sid={}", body["call_sid"]);
        Ok(body)
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn make_call(&self, request: &CallRequest) -> ServiceOutcome<serde_json::Value> {
        with_timeout(self.timeout, self.post(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let config = ServicesConfig {
            dispatch_url: "http://dispatch.local:8080/".to_string(),
            ..Default::default()
        };
        let d = HttpDispatcher::new(&config).unwrap();
        assert_eq!(d.endpoint(), "http://dispatch.local:8080/make_call");
    }

    #[test]
    fn test_call_request_wire_shape() {
        let req = CallRequest {
            to: "+15550100".to_string(),
            name: "Emergency Alert".to_string(),
            address: "Patient's home".to_string(),
            incident: "Patient requested 911".to_string(),
            heartrate: "140 bpm".to_string(),
            breathing: "22 breaths/min".to_string(),
            emotion: "Distressed".to_string(),
            severity: Severity::High,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["severity"], "High");
        assert_eq!(json["to"], "+15550100");
        assert_eq!(json["heartrate"], "140 bpm");
    }
}
