//! Scoring oracle client. The oracle is an opaque text-completion service;
//! this module only knows how to ask it one question and classify failures.

use crate::config::OracleSection;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub trial_index: u32,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct OracleResponse {
    pub text: String,
    /// Complete response body, kept for audit.
    pub raw: Value,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("authentication rejected (HTTP {status}): {body}")]
    Unauthorized { status: u16, body: String },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),
}

impl OracleError {
    /// Failures that will repeat for every remaining unit, such as a rejected
    /// API key. These feed the dispatch circuit breaker.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            OracleError::Unauthorized { .. } | OracleError::MissingCredentials(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OracleError::Timeout(_) => "timeout",
            OracleError::Unauthorized { .. } => "unauthorized",
            OracleError::Http { .. } => "http_error",
            OracleError::Transport(_) => "transport",
            OracleError::MalformedBody(_) => "malformed_body",
            OracleError::MissingCredentials(_) => "missing_credentials",
        }
    }
}

pub trait ScoringOracle: Send + Sync {
    fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError>;
}

/// OpenAI-compatible chat-completions client.
pub struct HttpOracle {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: Option<String>,
    api_key_env: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    timeout: Duration,
}

impl HttpOracle {
    pub fn from_config(section: &OracleSection) -> anyhow::Result<Self> {
        let api_key = std::env::var(&section.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self::new(section, api_key)
    }

    pub fn new(section: &OracleSection, api_key: Option<String>) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(section.timeout_seconds);
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("blindlab/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: section.endpoint.clone(),
            api_key,
            api_key_env: section.api_key_env.clone(),
            model: section.model.clone(),
            temperature: section.temperature,
            max_tokens: section.max_tokens,
            timeout,
        })
    }

    fn payload(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }
}

impl ScoringOracle for HttpOracle {
    fn complete(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| OracleError::MissingCredentials(self.api_key_env.clone()))?;
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&self.payload(&request.prompt))
            .send()
            .map_err(|e| classify_transport(e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| classify_transport(e, self.timeout))?;
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(OracleError::Unauthorized {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        if !status.is_success() {
            return Err(OracleError::Http {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }
        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| OracleError::MalformedBody(format!("invalid JSON: {}", e)))?;
        let text = extract_completion_text(&raw)?;
        Ok(OracleResponse { text, raw })
    }
}

fn classify_transport(err: reqwest::Error, timeout: Duration) -> OracleError {
    if err.is_timeout() {
        OracleError::Timeout(timeout)
    } else {
        OracleError::Transport(err.to_string())
    }
}

/// Pulls `choices[0].message.content` out of a chat-completions body. Providers
/// that report errors with a 200 status put them under `error`.
pub fn extract_completion_text(raw: &Value) -> Result<String, OracleError> {
    if let Some(err) = raw.get("error") {
        let message = err
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string());
        return Err(OracleError::MalformedBody(format!(
            "provider error: {}",
            message
        )));
    }
    let content = raw
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            OracleError::MalformedBody("missing choices[0].message.content".to_string())
        })?;
    if content.trim().is_empty() {
        return Err(OracleError::MalformedBody("empty completion".to_string()));
    }
    Ok(content.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}
