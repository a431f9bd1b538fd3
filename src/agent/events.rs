//! Progress events streamed by a run
//!
//! One JSON object per event on the wire:
//!
//! ```json
//! {"type": "iteration_complete", "iteration": 2, "total_iterations": 5,
//!  "message": "Iteration 2: Code executed successfully",
//!  "data": {"success": true, "final_answer": true, "output": {"kind": "text", "data": "4"}},
//!  "timestamp": "2026-01-01T12:00:00Z"}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::UsageStats;
use crate::output::{TypedOutput, Value};

/// Stage of a run an event reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Thinking,
    GeneratingCode,
    Executing,
    IterationComplete,
    Error,
    Completed,
}

/// One step of progress
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub iteration: usize,
    pub total_iterations: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EventPayload>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(event_type: EventType, iteration: usize, total_iterations: usize, message: impl Into<String>) -> Self {
        Self {
            event_type,
            iteration,
            total_iterations,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: EventPayload) -> Self {
        self.data = Some(data);
        self
    }

    /// Final outcome carried by a `Completed` event
    pub fn outcome(&self) -> Option<&RunOutcome> {
        match &self.data {
            Some(EventPayload::Outcome(outcome)) => Some(outcome),
            _ => None,
        }
    }

    /// Error text carried by an `Error` event
    pub fn error(&self) -> Option<&str> {
        match &self.data {
            Some(EventPayload::Failure { error, .. }) => Some(error),
            _ => None,
        }
    }

    /// Whether this is the last event of its run
    ///
    /// `Completed` always is. An `Error` is only terminal when fatal: the
    /// error raised on an exhausted budget is followed by `Completed`.
    pub fn is_terminal(&self) -> bool {
        match self.event_type {
            EventType::Completed => true,
            EventType::Error => matches!(self.data, Some(EventPayload::Failure { fatal: true, .. })),
            _ => false,
        }
    }
}

/// Payload attached to an event
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// Model reasoning and the code about to run
    Code { thoughts: String, code: String },
    /// Result of one execution
    Iteration(IterationSummary),
    /// `fatal` is false when a `Completed` event still follows
    Failure { error: String, fatal: bool },
    Outcome(RunOutcome),
}

/// `IterationComplete` payload
#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    pub success: bool,
    pub final_answer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<TypedOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    /// First 200 characters of the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// One pass through the loop that executed code
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationRecord {
    /// 1-based
    pub iteration: usize,
    pub thoughts: String,
    pub code: String,
    pub success: bool,
    pub output: Value,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub final_answer: bool,
}

/// Everything a finished run produced, carried by `Completed`
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub result: Option<TypedOutput>,
    pub records: Vec<IterationRecord>,
    pub observations: Vec<String>,
    /// Loop iterations consumed, including ones that produced no code
    pub iterations: usize,
    pub is_complete: bool,
    pub cancelled: bool,
    pub usage: UsageStats,
}
