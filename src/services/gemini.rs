//! Google Gemini API client for calming suggestions
//!
//! Thin wrapper around the Gemini generateContent endpoint. Only used to phrase
//! a short breathing exercise when the patient declines both calls.

use super::outcome::{with_timeout, ServiceOutcome};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

pub const CALMING_SYSTEM_PROMPT: &str = "You are a calming medical assistant. The patient has elevated vitals but doesn't want to call anyone.

YOUR TASK: Provide ONE simple breathing exercise or calming technique (2-3 sentences max) to help lower their heart rate and blood pressure.

Example:
\"Try taking slow, deep breaths. Breathe in slowly through your nose for 4 counts, hold for 4 counts, then exhale through your mouth for 6 counts. Repeat this for a few minutes.\"

Keep it simple, calm, and actionable. Maximum 3 sentences.";

pub const CALMING_USER_PROMPT: &str = "Give me a breathing exercise to calm down.";

/// Produces a short calming suggestion
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn calming_suggestion(&self) -> ServiceOutcome<String>;
}

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    timeout: Duration,
}

// -- Response types --

#[derive(Debug, Deserialize)]
pub struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiResponseContent,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

impl GeminiClient {
    pub fn new(config: &ServicesConfig) -> Result<Self, String> {
        if config.gemini_api_key.trim().is_empty() {
            return Err("Gemini API key is required".to_string());
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_key: config.gemini_api_key.clone(),
            endpoint: config.gemini_endpoint.trim_end_matches('/').to_string(),
            model: config.gemini_model.clone(),
            timeout: Duration::from_secs(config.generation_timeout_secs),
        })
    }

    pub fn build_request_body(system_prompt: &str, user_prompt: &str) -> serde_json::Value {
        serde_json::json!({
            "system_instruction": {
                "parts": [{"text": system_prompt}]
            },
            "contents": [{
                "role": "user",
                "parts": [{"text": user_prompt}]
            }]
        })
    }

    pub fn extract_text(response: &GeminiResponse) -> Option<String> {
        response
            .candidates
            .first()
            .and_then(|c| c.content.parts.iter().find_map(|p| p.text.as_ref()))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }

    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String> {
        let url = format!("{}/{}:generateContent", self.endpoint, self.model);
        let body = Self::build_request_body(system_prompt, user_prompt);

        info!("Gemini generation: model={}", self.model);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(
                "x-goog-api-key",
                HeaderValue::from_str(&self.api_key)
                    .map_err(|e| format!("Invalid API key header: {}", e))?,
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Gemini API request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let truncated: String = error_body.chars().take(200).collect();
            return Err(format!("Gemini API error {}: {}", status, truncated));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse Gemini response: {}", e))?;

        Self::extract_text(&gemini_response)
            .ok_or_else(|| "Gemini response contained no text".to_string())
    }
}

#[async_trait]
impl SuggestionGenerator for GeminiClient {
    async fn calming_suggestion(&self) -> ServiceOutcome<String> {
        with_timeout(
            self.timeout,
            self.generate(CALMING_SYSTEM_PROMPT, CALMING_USER_PROMPT),
        )
        .await
    }
}

/// Used when no API key is configured
pub struct UnconfiguredGenerator;

#[async_trait]
impl SuggestionGenerator for UnconfiguredGenerator {
    async fn calming_suggestion(&self) -> ServiceOutcome<String> {
        ServiceOutcome::Unavailable("Gemini API key not configured".to_string())
    }
}
