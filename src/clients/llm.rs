use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{build_http, check_status, upstream_err};
use crate::error::AppError;

/// A single-turn completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for a JSON object response.
    pub json: bool,
    pub timeout: Duration,
}

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    /// Returns the assistant message text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, AppError>;
}

/// Strip a surrounding Markdown code fence (```json ... ```) if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. `json`, `sql`) on the opening line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// ============================================================================
// OpenAI-compatible chat completions
// ============================================================================

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, AppError> {
        Ok(Self {
            http: build_http()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, AppError> {
        let body = ChatBody {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: vec![
                ChatMessage { role: "system", content: &request.system },
                ChatMessage { role: "user", content: &request.user },
            ],
            response_format: request.json.then_some(ResponseFormat { kind: "json_object" }),
        };

        let res = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;
        let parsed: ChatResponse = check_status("completion", res)
            .await?
            .json()
            .await
            .map_err(upstream_err)?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::Upstream("completion returned no content".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\nSELECT 1\n```  "), "SELECT 1");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }
}
