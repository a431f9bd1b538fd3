//! Agent loop for LLM-driven code execution
//!
//! # Architecture
//!
//! ```text
//! RunRequest → ReactAgent::run ──► ReceiverStream<ProgressEvent>
//!                  │
//!           LanguageModel (JSON reply: thoughts / code / final_answer)
//!                  ↓
//!           CodeExecutor.execute(code, bindings)
//!                  ↓
//!           output::normalize → IterationComplete
//!                  ↓
//!           observation fed back → loop or Completed
//! ```

pub mod events;
pub mod prompt;
pub mod react;

pub use events::{EventPayload, EventType, IterationRecord, IterationSummary, ProgressEvent, RunOutcome};
pub use prompt::ModelReply;
pub use react::{AgentConfig, AgentError, ReactAgent, RunRequest};
