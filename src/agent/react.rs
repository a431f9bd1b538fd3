//! The ReAct loop
//!
//! A run is a spawned task writing [`ProgressEvent`]s into a bounded channel;
//! the caller reads them from a [`ReceiverStream`]. Each `send` is a
//! suspension point, so a slow reader paces the run. The task always writes
//! exactly one terminal event (`Completed`, or `Error` for a fatal model
//! failure) and then drops its sender, closing the stream.
//!
//! ```text
//! Started
//!   ┌─ cancelled? ─────────────────────────────────────────┐
//!   │  Thinking → model call ── Err ──→ Error (terminal)   │
//!   │    no code, final   → converge                       │
//!   │    no code, !final  → corrective turn, next          │
//!   │    code → GeneratingCode → Executing → execute       │
//!   │      → IterationComplete{success}                    │
//!   │        success && final → converge                   │
//!   │        otherwise        → observation turn, next     │
//!   └──────────────────────────────────────────────────────┘
//! [Error: no result]  (budget exhausted without a result)
//! Completed
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::events::{EventPayload, EventType, IterationRecord, IterationSummary, ProgressEvent, RunOutcome};
use super::prompt::{self, truncate_chars, ModelReply};
use crate::config::Settings;
use crate::executor::{execute_guarded, CodeExecutor, ExecutionRequest, ExecutionResult};
use crate::llm::{structured_call, ChatError, ChatMessage, LanguageModel, RetryPolicy, UsageStats};
use crate::metrics::{AGENT_ACTIVE_RUNS, AGENT_ITERATIONS, AGENT_RUNS};
use crate::output::{normalize, Bindings, Value};

/// Events buffered between the run task and its reader
const EVENT_BUFFER: usize = 16;

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Name used in event messages
    pub name: String,
    /// Iteration budget when a request does not set one
    pub max_iterations: usize,
    pub execution_timeout: Duration,
    /// Bound on one model call, retries included
    pub llm_timeout: Duration,
    pub retry: RetryPolicy,
    /// Custom system prompt (built from the backend if None)
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "DataAgent".to_string(),
            max_iterations: 5,
            execution_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            execution_timeout: settings.execution_timeout(),
            llm_timeout: settings.llm_timeout(),
            ..Self::default()
        }
    }
}

/// Error type for agent operations
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Model(#[from] ChatError),
    #[error("model call timed out after {0:?}")]
    ModelTimeout(Duration),
    /// A run ended with a terminal `Error` event
    #[error("run failed: {0}")]
    Failed(String),
    #[error("event stream ended without a terminal event")]
    Incomplete,
}

/// Input to one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub prompt: String,
    /// Variables visible to generated code
    pub bindings: Bindings,
    /// Prior conversation placed ahead of the prompt
    pub history: Vec<ChatMessage>,
    pub max_iterations: Option<usize>,
    pub cancel: CancellationToken,
    pub session_id: Option<String>,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// The reader went away; the run stops at its next event
struct StreamClosed;

/// Writes events for one run
struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    async fn emit(&self, event: ProgressEvent) -> Result<(), StreamClosed> {
        debug!(event = ?event.event_type, iteration = event.iteration, "{}", event.message);
        self.tx.send(event).await.map_err(|_| StreamClosed)
    }
}

/// Keeps the active-runs gauge honest on every exit path
struct ActiveRun;

impl ActiveRun {
    fn start() -> Self {
        AGENT_ACTIVE_RUNS.inc();
        ActiveRun
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        AGENT_ACTIVE_RUNS.dec();
    }
}

/// Transient state of one run
#[derive(Default)]
struct RunState {
    records: Vec<IterationRecord>,
    observations: Vec<String>,
    final_result: Option<Value>,
    converged: bool,
    cancelled: bool,
    consumed: usize,
}

/// Agent driving the generate → execute → observe loop
#[derive(Clone)]
pub struct ReactAgent {
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn CodeExecutor>,
    config: AgentConfig,
}

impl ReactAgent {
    /// Create a new agent
    ///
    /// # Arguments
    /// * `model` - Language model producing thoughts and code
    /// * `executor` - Backend that runs the generated code
    /// * `config` - Agent configuration
    pub fn new(model: Arc<dyn LanguageModel>, executor: Arc<dyn CodeExecutor>, config: AgentConfig) -> Self {
        Self { model, executor, config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<dyn CodeExecutor> {
        &self.executor
    }

    /// Start a run and return its event stream
    ///
    /// Must be called inside a Tokio runtime. Dropping the stream stops the
    /// run at its next event.
    pub fn run(&self, request: RunRequest) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let agent = self.clone();
        tokio::spawn(async move {
            if agent.drive(request, EventSink { tx }).await.is_err() {
                debug!("Event reader dropped, run stopped");
            }
        });
        ReceiverStream::new(rx)
    }

    /// Run to the end and return the outcome carried by `Completed`
    pub async fn run_to_completion(&self, request: RunRequest) -> Result<RunOutcome, AgentError> {
        let mut events = self.run(request);
        let mut last = None;
        while let Some(event) = events.next().await {
            last = Some(event);
        }

        match last {
            Some(event) if event.event_type == EventType::Completed => {
                event.outcome().cloned().ok_or(AgentError::Incomplete)
            }
            Some(event) if event.event_type == EventType::Error => {
                Err(AgentError::Failed(event.error().unwrap_or(&event.message).to_string()))
            }
            _ => Err(AgentError::Incomplete),
        }
    }

    async fn drive(&self, request: RunRequest, sink: EventSink) -> Result<(), StreamClosed> {
        let trace_id = Uuid::now_v7().to_string();
        let total = request.max_iterations.unwrap_or(self.config.max_iterations);
        let session_id = request.session_id.clone().unwrap_or_default();

        let root_span = info_span!(
            "agent_run",
            trace_id = %trace_id,
            session_id = %session_id,
            max_iterations = total,
            backend = %self.executor.kind(),
            otel.name = "agent_run"
        );

        self.drive_inner(request, total, sink).instrument(root_span).await
    }

    async fn drive_inner(&self, request: RunRequest, total: usize, sink: EventSink) -> Result<(), StreamClosed> {
        let _active = ActiveRun::start();
        let usage_before = self.model.usage();
        let name = self.config.name.as_str();
        info!(prompt = %truncate_chars(&request.prompt, 100), "Starting agent run");

        sink.emit(ProgressEvent::new(
            EventType::Started,
            0,
            total,
            format!("Starting {}", name),
        ))
        .await?;

        let language = self.executor.language().to_string();
        let system = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| prompt::system_prompt(&language, &self.executor.capabilities()));

        let mut messages = vec![ChatMessage::system(system)];
        let has_history = !request.history.is_empty();
        messages.extend(request.history);
        messages.push(ChatMessage::user(prompt::initial_prompt(
            &request.prompt,
            &request.bindings,
            has_history,
        )));

        let mut bindings = request.bindings;
        let mut state = RunState::default();

        for iteration in 1..=total {
            if request.cancel.is_cancelled() {
                info!(iteration, "Run cancelled");
                state.cancelled = true;
                break;
            }
            state.consumed = iteration;

            sink.emit(ProgressEvent::new(
                EventType::Thinking,
                iteration,
                total,
                format!("Iteration {}: Reasoning about the problem", iteration),
            ))
            .await?;

            let reply = match self.think(&messages, iteration).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(iteration, error = %e, "Model call failed, ending run");
                    AGENT_RUNS.with_label_values(&["error"]).inc();
                    AGENT_ITERATIONS.observe(iteration as f64);
                    let text = e.to_string();
                    sink.emit(
                        ProgressEvent::new(
                            EventType::Error,
                            iteration,
                            total,
                            format!("Iteration {}: Error - {}", iteration, truncate_chars(&text, 100)),
                        )
                        .with_data(EventPayload::Failure { error: text, fatal: true }),
                    )
                    .await?;
                    return Ok(());
                }
            };

            if !reply.has_code() {
                if reply.final_answer {
                    info!(iteration, "Model signalled completion without code");
                    state
                        .observations
                        .push(format!("Agent response (no code): {}", reply.thoughts));
                    state.final_result = Some(Value::Text(reply.thoughts));
                    state.converged = true;
                    break;
                }
                debug!(iteration, "No code and not final, asking again");
                messages.push(ChatMessage::assistant(prompt::assistant_turn(
                    &reply.thoughts,
                    &language,
                    "",
                    Some(false),
                )));
                messages.push(ChatMessage::user(prompt::NO_CODE_INSTRUCTION));
                continue;
            }

            sink.emit(
                ProgressEvent::new(
                    EventType::GeneratingCode,
                    iteration,
                    total,
                    format!("Iteration {}: Generated code", iteration),
                )
                .with_data(EventPayload::Code {
                    thoughts: reply.thoughts.clone(),
                    code: reply.code.clone(),
                }),
            )
            .await?;
            sink.emit(ProgressEvent::new(
                EventType::Executing,
                iteration,
                total,
                format!("Iteration {}: Executing code", iteration),
            ))
            .await?;

            let result = self.execute(&reply.code, &bindings, iteration).await;
            bindings.extend(result.variables.clone());

            if result.success {
                let observation = prompt::success_observation(&result.logs, &result.output);
                let output = (!result.output.is_null()).then(|| normalize(&result.output));
                state.observations.push(observation.clone());
                state.final_result = (!result.output.is_null()).then(|| result.output.clone());
                state.records.push(record(iteration, &reply, &result));

                sink.emit(
                    ProgressEvent::new(
                        EventType::IterationComplete,
                        iteration,
                        total,
                        format!("Iteration {}: Code executed successfully", iteration),
                    )
                    .with_data(EventPayload::Iteration(IterationSummary {
                        success: true,
                        final_answer: reply.final_answer,
                        output,
                        logs: result.logs.clone(),
                        error: None,
                        duration_ms: result.duration_ms,
                    })),
                )
                .await?;

                if reply.final_answer {
                    info!(iteration, "Model signalled completion");
                    state.converged = true;
                    break;
                }
                messages.push(ChatMessage::assistant(prompt::assistant_turn(
                    &reply.thoughts,
                    &language,
                    &reply.code,
                    Some(false),
                )));
                messages.push(ChatMessage::user(prompt::success_followup(&observation)));
            } else {
                let error = result.error.clone().unwrap_or_default();
                warn!(iteration, error = %truncate_chars(&error, 200), "Generated code failed, retrying");
                let observation = prompt::failure_observation(&result.logs, &error);
                state.observations.push(observation.clone());
                state.records.push(record(iteration, &reply, &result));

                sink.emit(
                    ProgressEvent::new(
                        EventType::IterationComplete,
                        iteration,
                        total,
                        format!("Iteration {}: Execution failed, will retry", iteration),
                    )
                    .with_data(EventPayload::Iteration(IterationSummary {
                        success: false,
                        final_answer: reply.final_answer,
                        output: None,
                        logs: result.logs.clone(),
                        error: Some(error.chars().take(200).collect()),
                        duration_ms: result.duration_ms,
                    })),
                )
                .await?;

                messages.push(ChatMessage::assistant(prompt::assistant_turn(
                    &reply.thoughts,
                    &language,
                    &reply.code,
                    None,
                )));
                messages.push(ChatMessage::user(prompt::failure_followup(&observation)));
            }
        }

        self.finish(state, total, usage_before, &sink).await
    }

    /// Emit the closing events for a run that was not aborted
    async fn finish(
        &self,
        state: RunState,
        total: usize,
        usage_before: UsageStats,
        sink: &EventSink,
    ) -> Result<(), StreamClosed> {
        let name = self.config.name.as_str();
        let success = !state.cancelled && (state.converged || state.final_result.is_some());
        let consumed = state.consumed;

        let outcome_label = if success {
            "success"
        } else if state.cancelled {
            "cancelled"
        } else {
            "max_iterations"
        };
        AGENT_RUNS.with_label_values(&[outcome_label]).inc();
        AGENT_ITERATIONS.observe(consumed as f64);
        info!(
            iterations = consumed,
            records = state.records.len(),
            success,
            is_complete = state.converged,
            "Agent run finished"
        );

        // Exhausted budget: both counts report what was consumed
        let (iteration, reported_total) = if success || state.cancelled {
            (consumed, total)
        } else {
            (consumed, consumed)
        };

        if !success && !state.cancelled && consumed > 0 {
            sink.emit(
                ProgressEvent::new(
                    EventType::Error,
                    iteration,
                    reported_total,
                    format!("{}: Max iterations reached without success", name),
                )
                .with_data(EventPayload::Failure {
                    error: "No valid result produced after max iterations".to_string(),
                    fatal: false,
                }),
            )
            .await?;
        }

        let message = if state.cancelled {
            format!("{} cancelled after {} iterations", name, consumed)
        } else {
            format!("{} completed", name)
        };
        let outcome = RunOutcome {
            success,
            result: state.final_result.as_ref().map(normalize),
            records: state.records,
            observations: state.observations,
            iterations: consumed,
            is_complete: state.converged,
            cancelled: state.cancelled,
            usage: self.model.usage().since(&usage_before),
        };
        sink.emit(
            ProgressEvent::new(EventType::Completed, iteration, reported_total, message)
                .with_data(EventPayload::Outcome(outcome)),
        )
        .await
    }

    /// One bounded structured model call
    async fn think(&self, messages: &[ChatMessage], iteration: usize) -> Result<ModelReply, AgentError> {
        let span = info_span!(
            "llm_call",
            iteration,
            model = %self.model.model_name(),
            otel.name = "llm_call"
        );
        let call = structured_call(self.model.as_ref(), messages, &self.config.retry);
        let value = tokio::time::timeout(self.config.llm_timeout, call)
            .instrument(span)
            .await
            .map_err(|_| AgentError::ModelTimeout(self.config.llm_timeout))??;
        Ok(ModelReply::from_json(&value))
    }

    async fn execute(&self, code: &str, bindings: &Bindings, iteration: usize) -> ExecutionResult {
        let span = info_span!(
            "code_execution",
            iteration,
            backend = %self.executor.kind(),
            code_len = code.len(),
            otel.name = "code_execution"
        );
        let request = ExecutionRequest::new(code, bindings.clone(), self.config.execution_timeout);
        execute_guarded(self.executor.as_ref(), request).instrument(span).await
    }
}

fn record(iteration: usize, reply: &ModelReply, result: &ExecutionResult) -> IterationRecord {
    IterationRecord {
        iteration,
        thoughts: reply.thoughts.clone(),
        code: reply.code.clone(),
        success: result.success,
        output: result.output.clone(),
        logs: result.logs.clone(),
        error: result.error.clone(),
        final_answer: reply.final_answer,
    }
}
