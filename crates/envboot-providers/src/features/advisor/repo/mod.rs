use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.forge.tensorblock.co/v1";
pub const DEFAULT_MODEL: &str = "OpenAI/gpt-4o";

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor is not configured: {0}")]
    Config(String),
    #[error("advisor endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("advisor request failed: {0}")]
    Transport(String),
    #[error("unusable advisor reply: {0}")]
    Decode(String),
}

/// OpenAI-compatible chat endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisorConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl AdvisorConfig {
    /// `None` when no API key is set; the advisor is optional.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Some(Self {
            api_key: get("OPENAI_API_KEY")?,
            base_url: get("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        })
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AdvisorRepository: Send + Sync {
    /// One system + user exchange; returns the assistant's text.
    fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, AdvisorError>;
}

pub struct OpenAiAdvisorRepository {
    http: Client,
    config: AdvisorConfig,
}

impl OpenAiAdvisorRepository {
    pub fn new(config: AdvisorConfig, timeout: Duration) -> Result<Self, AdvisorError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisorError::Config(e.to_string()))?;
        Ok(Self { http, config })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

impl AdvisorRepository for OpenAiAdvisorRepository {
    fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, AdvisorError> {
        let body = json!({
            "model": self.config.model,
            "temperature": temperature,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });
        let response = self
            .http
            .post(self.url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .map_err(|e| AdvisorError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| AdvisorError::Transport(e.to_string()))?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(ToString::to_string))
                .unwrap_or(text);
            return Err(AdvisorError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let reply: Value = serde_json::from_str(&text).map_err(|e| AdvisorError::Decode(e.to_string()))?;
        reply
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| AdvisorError::Decode("reply has no message content".to_string()))
    }
}

/// Extracts a JSON object from a model reply, tolerating Markdown code fences.
pub fn parse_json_reply(reply: &str) -> Result<Value, AdvisorError> {
    if let Ok(value) = serde_json::from_str(reply.trim()) {
        return Ok(value);
    }
    let fenced = ["```json", "```"].iter().find_map(|fence| {
        let start = reply.find(fence)? + fence.len();
        let end = reply[start..].find("```")? + start;
        Some(reply[start..end].trim())
    });
    match fenced {
        Some(body) => serde_json::from_str(body).map_err(|e| AdvisorError::Decode(e.to_string())),
        None => Err(AdvisorError::Decode(format!(
            "no JSON found in reply: {}",
            reply.chars().take(120).collect::<String>()
        ))),
    }
}
