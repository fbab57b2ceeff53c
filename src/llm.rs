//! Gemini API client
//!
//! Shared by the LLM planner and the prose composer. The model name can be
//! switched at runtime through the admin surface.

use crate::config::ResearchConfig;
use crate::error::ResearchError;
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, error};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Text-completion seam; the planner and composer depend on this, not on Gemini.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn model(&self) -> String;

    fn set_model(&self, model: &str);

    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String>;
}

/// Reusable Gemini client (connection-pooled)
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: RwLock<String>,
    max_output_tokens: i32,
}

impl GeminiClient {
    pub fn new(api_key: String, model: &str) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ResearchError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            model: RwLock::new(model.to_string()),
            max_output_tokens: 2048,
        })
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &ResearchConfig) -> Result<Option<Self>> {
        match &config.gemini_api_key {
            Some(key) => Ok(Some(Self::new(key.clone(), &config.gemini_model)?)),
            None => Ok(None),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model())
    }
}

#[async_trait::async_trait]
impl LanguageModel for GeminiClient {
    fn model(&self) -> String {
        self.model
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|p| p.into_inner().clone())
    }

    fn set_model(&self, model: &str) {
        let mut current = self.model.write().unwrap_or_else(|p| p.into_inner());
        *current = model.to_string();
    }

    async fn complete(&self, system_prompt: &str, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(ResearchError::Llm("GEMINI_API_KEY not configured".to_string()));
        }

        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.9,
                top_k: 40,
                max_output_tokens: self.max_output_tokens,
            },
            system_instruction: SystemInstruction {
                parts: vec![Part {
                    text: system_prompt.to_string(),
                }],
            },
        };

        debug!(model = %self.model(), "calling Gemini API");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Gemini API request failed: {}", e);
                ResearchError::Llm(format!("Gemini API error: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(status = %status, "Gemini API error response: {}", error_text);
            return Err(ResearchError::Llm(format!(
                "Gemini API returned {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ResearchError::Llm(format!("Gemini parse error: {}", e)))?;

        extract_text(&gemini_response)
    }
}

fn extract_text(response: &GeminiResponse) -> Result<String> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ResearchError::Llm("No response from Gemini API".to_string()))?;

    let text: String = candidate
        .content
        .parts
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(ResearchError::Llm("Empty response from Gemini".to_string()));
    }
    Ok(text)
}

/// Strips a ```json fence (or surrounding prose) and returns the outermost JSON value text.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }

    let open = text.find(['{', '['])?;
    let close = match text.as_bytes()[open] {
        b'{' => text.rfind('}')?,
        _ => text.rfind(']')?,
    };
    if close < open {
        return None;
    }
    Some(&text[open..=close])
}

#[derive(Debug, Serialize)]
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
        let request = GeminiRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: "Apple Q4 revenue".to_string(),
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
                    text: "plan".to_string(),
                }],
            },
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("Apple Q4 revenue"));
        assert!(json.contains("max_output_tokens"));
    }

    #[test]
    fn test_extract_text_joins_parts() {
        let response: GeminiResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(&response).unwrap(), "ab");

        let empty: GeminiResponse = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(extract_text(&empty).is_err());
    }

    #[test]
    fn test_extract_json_block() {
        assert_eq!(
            extract_json_block("Here:\n```json\n{\"tasks\": []}\n```"),
            Some("{\"tasks\": []}")
        );
        assert_eq!(extract_json_block("plan: [1, 2] done"), Some("[1, 2]"));
        assert_eq!(extract_json_block("no json"), None);
    }

    #[test]
    fn test_model_switch() {
        let client = GeminiClient::new("k".to_string(), "gemini-2.0-flash").unwrap();
        client.set_model("gemini-2.5-pro");
        assert_eq!(client.model(), "gemini-2.5-pro");
        assert!(client.endpoint().ends_with("gemini-2.5-pro:generateContent"));
    }
}
