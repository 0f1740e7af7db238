use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM is not configured")]
    NotConfigured,
    #[error("LLM request failed: {0}")]
    Request(String),
    #[error("LLM returned unusable output: {0}")]
    BadOutput(String),
}

/// Structured extraction over cleaned page text: prompt in, JSON out.
#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    async fn extract_structured(
        &self,
        markdown: &str,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<Value, LlmError>;
}

/// Gemini `generateContent` client. JSON output is requested through the
/// response MIME type so no fencing or preamble needs stripping.
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiClient {
    pub fn from_config(config: &Config) -> Option<Self> {
        let api_key = config.gemini_api_key.clone()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .ok()?;
        Some(GeminiClient {
            http,
            api_key,
            model: config.gemini_model.clone(),
        })
    }

    fn build_prompt(markdown: &str, prompt: &str, schema: Option<&Value>) -> String {
        let mut system = String::from(
            "You are an expert data extractor. You will be provided with webpage \
             content in Markdown format. Extract the information the user asks for \
             and return it as a valid JSON object with no preamble or explanation.",
        );
        if let Some(schema) = schema {
            system.push_str("\n\nThe extracted data MUST strictly follow this JSON schema: ");
            system.push_str(&schema.to_string());
        }
        format!("{system}\n\nUser Request: {prompt}\n\nWebpage Content:\n{markdown}")
    }
}

#[async_trait]
impl StructuredExtractor for GeminiClient {
    async fn extract_structured(
        &self,
        markdown: &str,
        prompt: &str,
        schema: Option<&Value>,
    ) -> Result<Value, LlmError> {
        let url = format!(
            "{GEMINI_API_BASE}/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let body = json!({
            "contents": [{
                "parts": [{ "text": Self::build_prompt(markdown, prompt, schema) }]
            }],
            "generationConfig": { "responseMimeType": "application/json" }
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Request(format!(
                "status {}",
                response.status().as_u16()
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::BadOutput(e.to_string()))?;

        let text = payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(|t| t.as_str())
            .ok_or_else(|| LlmError::BadOutput("empty response".to_string()))?;

        serde_json::from_str(text).map_err(|e| LlmError::BadOutput(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_includes_schema_and_content() {
        let schema = json!({"type": "object", "properties": {"price": {"type": "number"}}});
        let prompt =
            GeminiClient::build_prompt("# Page\nbody text", "find the price", Some(&schema));
        assert!(prompt.contains("JSON schema"));
        assert!(prompt.contains(r#""price""#));
        assert!(prompt.contains("find the price"));
        assert!(prompt.contains("body text"));
    }

    #[test]
    fn test_prompt_without_schema() {
        let prompt = GeminiClient::build_prompt("content", "extract titles", None);
        assert!(!prompt.contains("JSON schema"));
        assert!(prompt.contains("extract titles"));
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = Config::for_tests();
        assert!(GeminiClient::from_config(&config).is_none());
    }
}
