//! Execution backends
//!
//! A [`CodeExecutor`] runs a code string against variable bindings and
//! always answers with an [`ExecutionResult`]: syntax errors, runtime errors
//! and timeouts are reported as `success = false`, never as `Err`.
//!
//! ```text
//! ReactAgent ─► Arc<dyn CodeExecutor>
//!                  ├── Interpreter    (in-process, embedded script engine)
//!                  └── RemoteSandbox  (HTTP sandbox service)
//! ```
//!
//! [`ExecutorFactory`] is built once at the composition root and hands out
//! one shared instance per [`ExecutorKind`].

pub mod bindings;
pub mod interpreter;
pub mod remote;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::metrics::{CODE_EXECUTIONS, CODE_EXECUTION_DURATION};
use crate::output::{Bindings, Value};

pub use interpreter::{Interpreter, InterpreterConfig};
pub use remote::{RemoteSandbox, RemoteSandboxConfig};

/// Which backend runs generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Interpreter,
    Remote,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Interpreter => "interpreter",
            ExecutorKind::Remote => "remote",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpreter" | "local" => Ok(ExecutorKind::Interpreter),
            "remote" | "sandbox" => Ok(ExecutorKind::Remote),
            other => Err(ExecutorError::UnknownKind(other.to_string())),
        }
    }
}

/// Error type for backend selection
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown executor kind: {0}")]
    UnknownKind(String),
    #[error("executor {0} is not available")]
    Unavailable(ExecutorKind),
}

/// Wire input of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default)]
    pub bindings: Bindings,
    pub timeout_seconds: u64,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, bindings: Bindings, timeout: Duration) -> Self {
        Self {
            code: code.into(),
            bindings,
            timeout_seconds: (timeout.as_secs_f64().ceil() as u64).max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Wire output of an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Value of the last evaluated expression
    #[serde(default)]
    pub output: Value,
    /// Captured printed lines
    #[serde(default)]
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Top-level variables the snippet defined, merged into later iterations
    #[serde(skip)]
    pub variables: Bindings,
}

impl ExecutionResult {
    pub fn success(output: Value, logs: Vec<String>, duration: Duration) -> Self {
        Self {
            success: true,
            output,
            logs,
            error: None,
            duration_ms: duration.as_millis() as u64,
            variables: Bindings::new(),
        }
    }

    pub fn failure(error: impl Into<String>, logs: Vec<String>, duration: Duration) -> Self {
        Self {
            success: false,
            output: Value::Null,
            logs,
            error: Some(error.into()),
            duration_ms: duration.as_millis() as u64,
            variables: Bindings::new(),
        }
    }

    pub fn with_variables(mut self, variables: Bindings) -> Self {
        self.variables = variables;
        self
    }
}

/// Capability interface every backend implements
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Language label used in prompts and code fences
    fn language(&self) -> &str;

    /// Short description of what scripts can use, for the system prompt
    fn capabilities(&self) -> String {
        String::new()
    }

    /// Whether the backend can run code at all
    fn is_available(&self) -> bool;

    /// Run code; never fails, failures are `success = false`
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}

/// Run `request` with an outer deadline and record metrics
///
/// Backends enforce the timeout themselves; this bound catches a backend
/// that does not.
pub async fn execute_guarded(executor: &dyn CodeExecutor, request: ExecutionRequest) -> ExecutionResult {
    let backend = executor.kind().as_str();
    let deadline = request.timeout() + Duration::from_secs(1);
    let start = Instant::now();

    let result = match tokio::time::timeout(deadline, executor.execute(request)).await {
        Ok(result) => result,
        Err(_) => ExecutionResult::failure(
            format!("Execution timed out after {}s", deadline.as_secs()),
            Vec::new(),
            start.elapsed(),
        ),
    };

    let status = match (&result.success, &result.error) {
        (true, _) => "success",
        (false, Some(e)) if e.contains("timed out") => "timeout",
        (false, _) => "error",
    };
    CODE_EXECUTIONS.with_label_values(&[backend, status]).inc();
    CODE_EXECUTION_DURATION
        .with_label_values(&[backend])
        .observe(start.elapsed().as_secs_f64());

    result
}

/// Builds backends from settings and caches one instance per kind
pub struct ExecutorFactory {
    settings: Settings,
    instances: Mutex<HashMap<ExecutorKind, Arc<dyn CodeExecutor>>>,
}

impl ExecutorFactory {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Backend selected by the settings
    pub async fn default_executor(&self) -> Result<Arc<dyn CodeExecutor>, ExecutorError> {
        self.get(self.settings.executor).await
    }

    /// Shared instance for `kind`, created and availability-checked on first use
    pub async fn get(&self, kind: ExecutorKind) -> Result<Arc<dyn CodeExecutor>, ExecutorError> {
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&kind) {
            return Ok(existing.clone());
        }

        let executor = self.build(kind);
        if !executor.is_available() {
            warn!(executor = %kind, "Executor is not available");
            return Err(ExecutorError::Unavailable(kind));
        }

        info!(executor = %kind, language = executor.language(), "Executor created");
        instances.insert(kind, executor.clone());
        Ok(executor)
    }

    fn build(&self, kind: ExecutorKind) -> Arc<dyn CodeExecutor> {
        match kind {
            ExecutorKind::Interpreter => Arc::new(Interpreter::new(InterpreterConfig {
                authorized_modules: self.settings.authorized_modules.clone(),
                ..InterpreterConfig::default()
            })),
            ExecutorKind::Remote => Arc::new(RemoteSandbox::new(RemoteSandboxConfig {
                endpoint: self.settings.sandbox_url.clone(),
                api_key: self.settings.sandbox_api_key.clone(),
                ..RemoteSandboxConfig::default()
            })),
        }
    }
}
