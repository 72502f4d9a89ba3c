//! LLM provider abstraction and the OpenAI-compatible HTTP implementation.
//!
//! Every configured provider (primary, fast, local) speaks the same
//! chat-completions protocol; they differ only in base URL, model, and
//! credentials. Sampling settings are fixed at construction so identical
//! prompts are reproducible up to provider nondeterminism.

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ProviderConfig;

#[derive(Error, Debug)]
pub enum ProviderError {
    /// Timeout, connection failure, or 5xx. The next provider is tried.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// 429 from the provider. Treated as transient for ordering purposes.
    #[error("provider rate limited")]
    RateLimited,
    /// Unusable output or a 4xx. The provider is skipped for this call.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

/// A single LLM provider able to complete an analysis prompt.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Label used in logs and on stored analyses.
    fn name(&self) -> &str;

    /// Complete the prompt, returning the raw model reply.
    async fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Chat-completions provider for any OpenAI-compatible server.
pub struct OpenAiProvider {
    name: String,
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl OpenAiProvider {
    pub fn new(
        config: &ProviderConfig,
        api_key: Option<String>,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            name: config.name.clone(),
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl AnalysisProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            max_tokens: 1500,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited);
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Permanent(format!("HTTP {status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("unparseable response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::Permanent("empty completion".to_string()))?;

        debug!(provider = %self.name, chars = content.len(), "completion received");
        Ok(content)
    }
}
