//! Gemini API client
//!
//! Thin generateContent wrapper used by the LLM question generator.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::InvestigationError;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_ENDPOINT.to_string(),
        })
    }

    /// Point the client at a different generateContent URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Single-turn generation with a system instruction
    pub async fn generate(&self, prompt: &str, system_prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(InvestigationError::ConfigError(
                "GEMINI_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}?key={}", self.base_url, self.api_key);
        let request = build_request(prompt, system_prompt);

        info!("Calling Gemini API");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                InvestigationError::CollaboratorError(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Gemini API error response: {}", error_text);
            return Err(InvestigationError::CollaboratorError(format!(
                "Gemini API error: {}",
                error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Gemini response: {}", e);
            InvestigationError::CollaboratorError(format!("Gemini parse error: {}", e))
        })?;

        first_text(&gemini_response)
    }
}

/// Investigator persona shared by every Gemini call
pub const AML_SYSTEM_PROMPT: &str = r#"You are an anti-money-laundering investigator assisting a compliance analyst.

Guidelines:
- Focus on structuring, layering, shell entities, offshore routing and crypto exposure
- Be concise and factual
- Never speculate about individuals beyond the supplied facts
- Follow the requested output format exactly"#;

fn build_request(prompt: &str, system_prompt: &str) -> GeminiRequest {
    GeminiRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: prompt.to_string(),
            }],
        }],
        generation_config: GenerationConfig {
            temperature: 0.2,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1024,
        },
        system_instruction: SystemInstruction {
            parts: vec![Part {
                text: system_prompt.to_string(),
            }],
        },
    }
}

fn first_text(response: &GeminiResponse) -> Result<String> {
    response
        .candidates
        .first()
        .and_then(|c| c.content.parts.first())
        .map(|p| p.text.clone())
        .ok_or_else(|| {
            InvestigationError::CollaboratorError("Empty response from Gemini".to_string())
        })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    system_instruction: SystemInstruction,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let json = serde_json::to_value(build_request("Wire to Cyprus", AML_SYSTEM_PROMPT)).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Wire to Cyprus");
        assert!(json["generationConfig"]["maxOutputTokens"].is_number());
        assert!(json["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("anti-money-laundering"));
    }

    #[test]
    fn test_first_text_handles_empty_candidates() {
        let empty: GeminiResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(first_text(&empty).is_err());

        let full: GeminiResponse = serde_json::from_str(
            r#"{"candidates": [{"content": {"parts": [{"text": "hello"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(first_text(&full).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_missing_key_is_config_error() {
        let client = GeminiClient::new(String::new()).unwrap();
        let err = client.generate("q", AML_SYSTEM_PROMPT).await.unwrap_err();
        assert!(matches!(err, InvestigationError::ConfigError(_)));
    }
}
