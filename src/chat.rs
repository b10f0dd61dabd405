//! Chat-completion provider abstraction and HTTP implementation.
//!
//! The corrective pipeline and the contextualization step talk to an
//! OpenAI-compatible `POST {endpoint}/chat/completions` API. [`ChatProvider`]
//! is the seam: production uses [`HttpChat`]; tests script responses with a
//! fake.
//!
//! Providers are constructed once, hold a shared [`reqwest::Client`], and are
//! safe for concurrent use. No retries are performed here; callers decide how
//! a failed call degrades.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::ChatConfig;
use crate::error::{Error, Result};

/// One message in a chat request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatMessage {
    /// `"system"` or `"user"`.
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send `messages` and return the first choice's content.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// [`ChatProvider`] backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpChat {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    api_key: String,
}

impl HttpChat {
    /// Build the client from configuration. The API key is read from the
    /// environment variable named in `config.api_key_env`.
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| Error::upstream(format!("{} not set", config.api_key_env)))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key,
        })
    }
}

#[async_trait]
impl ChatProvider for HttpChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::upstream(format!(
                "chat endpoint returned {status}: {body_text}"
            )));
        }

        let json: serde_json::Value = response.json().await?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content` from a chat-completions response.
fn parse_chat_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::upstream("chat response missing choices[0].message.content"))
}
