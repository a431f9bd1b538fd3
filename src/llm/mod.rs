//! Language-model client abstraction
//!
//! The agent talks to a [`LanguageModel`] only through [`structured_call`],
//! which layers transient-failure retry and JSON repair over a plain
//! completion call:
//!
//! ```text
//! structured_call
//!   → complete_with_retry (backoff on transient errors)
//!   → json::parse_json_reply (direct → fenced block → repair passes)
//!   → one re-ask with a "not valid JSON" instruction
//!   → ChatError::Parse
//! ```

pub mod json;
pub mod ollama;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics::{LLM_CALL_DURATION, LLM_CALL_ERRORS};

pub use json::parse_json_reply;
pub use ollama::OllamaClient;

/// A message in a chat conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant"
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call generation options
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Ask the model for a JSON object
    pub json_mode: bool,
    /// Overrides the client's temperature
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Token accounting reported by a model client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    pub call_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageStats {
    /// Usage accrued since `earlier`
    pub fn since(&self, earlier: &UsageStats) -> UsageStats {
        UsageStats {
            call_count: self.call_count.saturating_sub(earlier.call_count),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
        }
    }
}

/// Error type for model calls
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("empty response from model")]
    EmptyResponse,
    #[error("could not parse model reply: {0}")]
    Parse(String),
}

impl ChatError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ChatError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ChatError::Status { status, .. } => *status == 429 || *status >= 500,
            ChatError::Timeout(_) | ChatError::EmptyResponse => true,
            ChatError::Parse(_) => false,
        }
    }

    /// Metric label
    fn kind(&self) -> &'static str {
        match self {
            ChatError::Timeout(_) => "timeout",
            ChatError::Parse(_) => "parse",
            e if e.is_transient() => "transient",
            _ => "permanent",
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Parse(e.to_string())
    }
}

/// A chat-completion capable model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// One completion call returning the raw reply text
    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String, ChatError>;

    /// Cumulative usage for this client
    fn usage(&self) -> UsageStats {
        UsageStats::default()
    }
}

/// Exponential backoff for transient model failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Completion call with retry on transient errors
pub async fn complete_with_retry(
    model: &dyn LanguageModel,
    messages: &[ChatMessage],
    options: &CompletionOptions,
    policy: &RetryPolicy,
) -> Result<String, ChatError> {
    let mut attempt = 1;
    loop {
        let start = Instant::now();
        let result = model.complete(messages, options).await;
        LLM_CALL_DURATION
            .with_label_values(&[model.model_name()])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(text) => return Ok(text),
            Err(e) => {
                LLM_CALL_ERRORS.with_label_values(&[e.kind()]).inc();
                if !e.is_transient() || attempt >= policy.max_attempts {
                    return Err(e);
                }
                let delay = policy.delay(attempt);
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Model call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Instruction appended when a reply could not be parsed as JSON
pub const JSON_RETRY_INSTRUCTION: &str =
    "Your previous response was not valid JSON. Please respond with ONLY a valid JSON object, no other text.";

/// JSON-mode call that always yields a parsed JSON value or an error
pub async fn structured_call(
    model: &dyn LanguageModel,
    messages: &[ChatMessage],
    policy: &RetryPolicy,
) -> Result<serde_json::Value, ChatError> {
    let options = CompletionOptions {
        json_mode: true,
        ..CompletionOptions::default()
    };
    let text = complete_with_retry(model, messages, &options, policy).await?;
    if let Some(value) = parse_json_reply(&text) {
        return Ok(value);
    }

    debug!(reply_len = text.len(), "Reply was not valid JSON, asking again");
    let mut retry_messages = messages.to_vec();
    retry_messages.push(ChatMessage::assistant(text));
    retry_messages.push(ChatMessage::user(JSON_RETRY_INSTRUCTION));

    let strict = CompletionOptions {
        json_mode: true,
        temperature: Some(0.0),
        ..CompletionOptions::default()
    };
    let text = complete_with_retry(model, &retry_messages, &strict, policy).await?;
    parse_json_reply(&text).ok_or_else(|| {
        let preview: String = text.chars().take(200).collect();
        ChatError::Parse(format!("no JSON object in reply: {}", preview))
    })
}
