//! Tabula - iterative code-generating data agent
//!
//! A language model answers questions about tabular data by writing code,
//! running it in a sandboxed backend and reading the result back, streaming
//! progress events the whole way.
//!
//! # Modules
//!
//! - `agent` - ReAct loop and progress events
//! - `executor` - Execution backends (embedded interpreter, remote sandbox)
//! - `output` - Runtime values and the typed output normalizer
//! - `llm` - Language-model client, retry and JSON repair
//! - `cache` - Key-value substrate, JSON cache and `get_or_compute`
//! - `session` - Per-session lock, console buffer and lock-wrapped runs
//! - `config` - Settings from the environment
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - Logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tabula::{AgentConfig, Interpreter, OllamaClient, ReactAgent, RunRequest};
//!
//! let model = Arc::new(OllamaClient::new("http://localhost:11434", "qwen3"));
//! let agent = ReactAgent::new(model, Arc::new(Interpreter::default()), AgentConfig::default());
//! let outcome = agent.run_to_completion(RunRequest::new("compute 2+2")).await?;
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod executor;
pub mod llm;
pub mod metrics;
pub mod output;
pub mod session;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use agent::{AgentConfig, AgentError, EventType, ProgressEvent, ReactAgent, RunOutcome, RunRequest};
pub use cache::{CacheClient, CacheError, CacheStore, MemoryStore};
pub use config::Settings;
pub use executor::{CodeExecutor, ExecutorFactory, ExecutorKind, Interpreter, RemoteSandbox};
pub use llm::{LanguageModel, OllamaClient};
pub use output::{normalize, TypedOutput, Value};
pub use session::{SessionCoordinator, SessionOrchestrator};
