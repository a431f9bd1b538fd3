//! Ollama chat client
//!
//! Talks to Ollama's `/api/chat` endpoint with streaming disabled. JSON mode
//! maps to Ollama's `"format": "json"` request field.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ChatError, ChatMessage, CompletionOptions, LanguageModel, UsageStats};
use crate::config::Settings;

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub eval_count: u64,
}

/// Client for Ollama's /api/chat endpoint
pub struct OllamaClient {
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
    calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl OllamaClient {
    /// Create a new chat client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the Ollama server (e.g., "http://localhost:11434")
    /// * `model` - The model name (e.g., "qwen3")
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: 0.1,
            max_tokens: 4096,
            client: reqwest::Client::new(),
            calls: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    /// Build a client from settings, with the request timeout applied
    pub fn from_settings(settings: &Settings) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(settings.llm_timeout())
            .build()?;
        Ok(Self {
            client,
            ..Self::new(settings.ollama_url.clone(), settings.model.clone())
                .with_generation(settings.temperature, settings.max_tokens)
        })
    }

    pub fn with_generation(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    /// Send a chat request and return the full response
    pub async fn chat(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<ChatResponse, ChatError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": options.temperature.unwrap_or(self.temperature),
                "num_predict": options.max_tokens.unwrap_or(self.max_tokens),
            }
        });
        if options.json_mode {
            body["format"] = serde_json::Value::String("json".to_string());
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(ChatError::Status {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }
        if text.is_empty() {
            return Err(ChatError::EmptyResponse);
        }

        let chat_response: ChatResponse = serde_json::from_str(&text)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(chat_response.prompt_eval_count, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(chat_response.eval_count, Ordering::Relaxed);

        debug!(
            model = %self.model,
            prompt_tokens = chat_response.prompt_eval_count,
            completion_tokens = chat_response.eval_count,
            "Chat completion received"
        );
        Ok(chat_response)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Result<String, ChatError> {
        let response = self.chat(messages, options).await?;
        if response.message.content.trim().is_empty() {
            return Err(ChatError::EmptyResponse);
        }
        Ok(response.message.content)
    }

    fn usage(&self) -> UsageStats {
        UsageStats {
            call_count: self.calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let raw = r#"{
            "model": "qwen3",
            "message": {"role": "assistant", "content": "{\"final_answer\": true}"},
            "done": true,
            "prompt_eval_count": 120,
            "eval_count": 14
        }"#;
        let response: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(response.message.role, "assistant");
        assert_eq!(response.prompt_eval_count, 120);
        assert_eq!(response.eval_count, 14);
    }

    #[test]
    fn test_usage_starts_at_zero() {
        let client = OllamaClient::new("http://localhost:11434/", "qwen3");
        assert_eq!(client.usage(), UsageStats::default());
        assert_eq!(client.base_url, "http://localhost:11434");
        assert_eq!(client.model_name(), "qwen3");
    }

    #[tokio::test]
    #[ignore] // Requires a running Ollama server
    async fn test_live_json_completion() {
        let client = OllamaClient::new("http://localhost:11434", "qwen3");
        let options = CompletionOptions {
            json_mode: true,
            ..CompletionOptions::default()
        };
        let reply = client
            .complete(&[ChatMessage::user("Reply with {\"ok\": true}")], &options)
            .await
            .unwrap();
        assert!(reply.contains("ok"));
        assert_eq!(client.usage().call_count, 1);
    }
}
