//! ElevenLabs text-to-speech client.

use super::outcome::{with_timeout, ServiceOutcome};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Text in, encoded audio out
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> ServiceOutcome<Vec<u8>>;
}

pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice_id: String,
    model_id: String,
    output_format: String,
    timeout: Duration,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: &ServicesConfig) -> Result<Self, String> {
        if config.elevenlabs_api_key.trim().is_empty() {
            return Err("ElevenLabs API key is required".to_string());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_key: config.elevenlabs_api_key.clone(),
            base_url: config.synthesis_url.trim_end_matches('/').to_string(),
            voice_id: config.synthesis_voice_id.clone(),
            model_id: config.synthesis_model.clone(),
            output_format: config.synthesis_output_format.clone(),
            timeout: Duration::from_secs(config.synthesis_timeout_secs),
        })
    }

    pub fn request_url(&self) -> String {
        format!(
            "{}/{}?output_format={}",
            self.base_url, self.voice_id, self.output_format
        )
    }

    pub fn build_request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "text": text,
            "model_id": self.model_id,
        })
    }

    async fn request(&self, text: &str) -> Result<Vec<u8>, String> {
        let response = self
            .client
            .post(self.request_url())
            .header("xi-api-key", &self.api_key)
            .json(&self.build_request_body(text))
            .send()
            .await
            .map_err(|e| format!("Synthesis request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let truncated: String = error_body.chars().take(200).collect();
            return Err(format!("Synthesis API error {}: {}", status, truncated));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| format!("Failed to read synthesized audio: {}", e))?;
        debug!("Synthesized {} chars into {} bytes", text.len(), bytes.len());
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> ServiceOutcome<Vec<u8>> {
        with_timeout(self.timeout, self.request(text)).await
    }
}

/// Used when no API key is configured; every prompt is skipped
pub struct UnconfiguredSynthesizer;

#[async_trait]
impl SpeechSynthesizer for UnconfiguredSynthesizer {
    async fn synthesize(&self, _text: &str) -> ServiceOutcome<Vec<u8>> {
        ServiceOutcome::Unavailable("ElevenLabs API key not configured".to_string())
    }
}
