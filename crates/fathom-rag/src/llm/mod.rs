//! Chat completion client for answer generation and query transformation.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire shape, which covers
//! DeepSeek, Ollama, and most hosted gateways.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str, opts: GenerationOptions)
        -> Result<String>;
}

pub struct ChatClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

impl ChatClient {
    pub fn new(api_base: &str, api_key: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RagError::Init(format!("chat client build failed: {e}")))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Parse a response body as JSON, surfacing a clear error when the
    /// gateway returns an HTML error page instead.
    async fn parse_json_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagError::MalformedResponse(format!("chat body read failed: {e}")))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(RagError::BackendUnavailable(format!(
                "chat endpoint returned HTML (HTTP {status}): {preview}"
            )));
        }
        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            RagError::MalformedResponse(format!("chat JSON (HTTP {status}): {e}. Body: {preview}"))
        })
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    async fn complete(
        &self,
        system: &str,
        user: &str,
        opts: GenerationOptions,
    ) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::from_http(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RagError::LlmFailure(format!(
                "chat endpoint returned HTTP {status}"
            )));
        }

        let parsed: ChatResponse = Self::parse_json_response(response).await?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RagError::MalformedResponse("chat response had no choices".into()))?;
        Ok(answer.trim().to_string())
    }
}
