//! Scripted test doubles for the model and the execution backend

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tabula::executor::{CodeExecutor, ExecutionRequest, ExecutionResult, ExecutorKind};
use tabula::llm::{ChatError, ChatMessage, CompletionOptions, LanguageModel, UsageStats};
use tabula::output::Value;

/// Replies from a fixed script and records every conversation it saw
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, ChatError>>>,
    pub conversations: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, ChatError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            conversations: Mutex::new(Vec::new()),
        }
    }

    /// Every call answers with one of these JSON replies, in order
    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn calls(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }

    /// Last message of the `n`-th call (0-based)
    pub fn last_message(&self, n: usize) -> ChatMessage {
        self.conversations.lock().unwrap()[n]
            .last()
            .cloned()
            .expect("conversation has messages")
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, messages: &[ChatMessage], _options: &CompletionOptions) -> Result<String, ChatError> {
        self.conversations.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ChatError::Status { status: 400, body: "script exhausted".into() }))
    }

    fn usage(&self) -> UsageStats {
        UsageStats {
            call_count: self.calls() as u64,
            input_tokens: 10 * self.calls() as u64,
            output_tokens: 5 * self.calls() as u64,
        }
    }
}

/// Answers executions from a fixed script
pub struct ScriptedExecutor {
    results: Mutex<VecDeque<ExecutionResult>>,
    pub codes: Mutex<Vec<String>>,
    /// Cancelled after the first execution, when set
    cancel_after_first: Option<CancellationToken>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            codes: Mutex::new(Vec::new()),
            cancel_after_first: None,
            delay: Duration::ZERO,
        }
    }

    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_after_first = Some(token);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn executions(&self) -> usize {
        self.codes.lock().unwrap().len()
    }
}

#[async_trait]
impl CodeExecutor for ScriptedExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Interpreter
    }

    fn language(&self) -> &str {
        "rhai"
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.codes.lock().unwrap().push(request.code);
        if let Some(token) = &self.cancel_after_first {
            token.cancel();
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::failure("no scripted result", Vec::new(), Duration::ZERO))
    }
}

pub fn ok(output: Value) -> ExecutionResult {
    ExecutionResult::success(output, Vec::new(), Duration::from_millis(1))
}

pub fn failed(error: &str) -> ExecutionResult {
    ExecutionResult::failure(error, Vec::new(), Duration::from_millis(1))
}

/// JSON reply with code
pub fn code_reply(thoughts: &str, code: &str, final_answer: bool) -> String {
    serde_json::json!({"thoughts": thoughts, "code": code, "final_answer": final_answer}).to_string()
}
