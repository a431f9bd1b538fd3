//! Integration tests for the agent loop
//!
//! These tests drive `ReactAgent` with a scripted model and either a scripted
//! or the embedded interpreter backend, checking the event protocol end to end.
//! Tests that need a running Ollama server are marked #[ignore].

mod support;

use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use support::{code_reply, failed, ok, ScriptedExecutor, ScriptedModel};
use tabula::agent::prompt::NO_CODE_INSTRUCTION;
use tabula::agent::{AgentConfig, AgentError, EventPayload, EventType, ProgressEvent, ReactAgent, RunRequest};
use tabula::executor::remote::NOT_CONFIGURED;
use tabula::executor::{Interpreter, RemoteSandbox, RemoteSandboxConfig};
use tabula::llm::{ChatError, RetryPolicy};
use tabula::output::{TypedOutput, Value};

fn config(max_iterations: usize) -> AgentConfig {
    AgentConfig {
        max_iterations,
        retry: RetryPolicy::none(),
        ..AgentConfig::default()
    }
}

fn agent(model: &Arc<ScriptedModel>, executor: &Arc<ScriptedExecutor>, max_iterations: usize) -> ReactAgent {
    ReactAgent::new(model.clone(), executor.clone(), config(max_iterations))
}

async fn collect(agent: &ReactAgent, request: RunRequest) -> Vec<ProgressEvent> {
    agent.run(request).collect().await
}

fn types(events: &[ProgressEvent]) -> Vec<EventType> {
    events.iter().map(|e| e.event_type).collect()
}

/// A zero budget yields Started then Completed without calling the model
#[tokio::test]
async fn test_zero_iterations() {
    let model = Arc::new(ScriptedModel::replying(&[]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let events = collect(&agent(&model, &executor, 0), RunRequest::new("anything")).await;

    assert_eq!(types(&events), vec![EventType::Started, EventType::Completed]);
    let outcome = events[1].outcome().expect("completed carries outcome");
    assert!(!outcome.success);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(model.calls(), 0);
    assert_eq!(executor.executions(), 0);
}

/// Every step failing exhausts the budget with Error then Completed
#[tokio::test]
async fn test_exhausted_budget() {
    let reply = code_reply("try", "undefined_var + 1", false);
    let model = Arc::new(ScriptedModel::replying(&[&reply, &reply, &reply]));
    let executor = Arc::new(ScriptedExecutor::new(vec![
        failed("Variable not found: undefined_var"),
        failed("Variable not found: undefined_var"),
        failed("Variable not found: undefined_var"),
    ]));
    let events = collect(&agent(&model, &executor, 3), RunRequest::new("sum it")).await;

    let n = events.len();
    assert_eq!(events[n - 2].event_type, EventType::Error);
    assert_eq!(events[n - 2].iteration, 3);
    assert_eq!(events[n - 2].total_iterations, 3);
    assert_eq!(events[n - 2].message, "DataAgent: Max iterations reached without success");
    assert!(!events[n - 2].is_terminal());
    assert_eq!(events[n - 1].event_type, EventType::Completed);
    assert!(events[n - 1].is_terminal());

    let outcome = events[n - 1].outcome().expect("outcome");
    assert!(!outcome.success);
    assert!(!outcome.is_complete);
    assert_eq!(outcome.records.len(), 3);
    assert!(outcome.records.iter().all(|r| !r.success));
    assert_eq!(outcome.result, None);
}

/// A success on the second of five iterations stops the loop there
#[tokio::test]
async fn test_success_on_second_iteration() {
    let first = code_reply("look first", "df.len()", false);
    let second = code_reply("now answer", "42", true);
    let model = Arc::new(ScriptedModel::replying(&[&first, &second]));
    let executor = Arc::new(ScriptedExecutor::new(vec![ok(Value::Int(6)), ok(Value::Int(42))]));
    let outcome = agent(&model, &executor, 5)
        .run_to_completion(RunRequest::new("answer"))
        .await
        .expect("run succeeds");

    assert!(outcome.success);
    assert!(outcome.is_complete);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.result, Some(TypedOutput::text("42")));
    assert_eq!(executor.executions(), 2);
    assert_eq!(model.calls(), 2);
    assert!(model.last_message(1).content.contains("The code executed successfully"));
}

/// An earlier unfinished success still counts once the budget runs out
#[tokio::test]
async fn test_exhausted_after_nonfinal_success() {
    let first = code_reply("partial", "5", false);
    let second = code_reply("refine", "broken(", false);
    let model = Arc::new(ScriptedModel::replying(&[&first, &second]));
    let executor = Arc::new(ScriptedExecutor::new(vec![ok(Value::Int(5)), failed("boom")]));
    let events = collect(&agent(&model, &executor, 2), RunRequest::new("q")).await;

    assert!(!events.iter().any(|e| e.event_type == EventType::Error));
    let last = events.last().expect("events");
    assert_eq!(last.event_type, EventType::Completed);
    assert_eq!(last.iteration, 2);

    let outcome = last.outcome().expect("outcome");
    assert!(outcome.success);
    assert!(!outcome.is_complete);
    assert_eq!(outcome.records.len(), 2);
    assert_eq!(outcome.result, Some(TypedOutput::text("5")));
}

/// An unconfigured remote sandbox fails every step like any other error
#[tokio::test]
async fn test_unconfigured_remote_exhausts_budget() {
    let reply = code_reply("query", "df.head()", false);
    let model = Arc::new(ScriptedModel::replying(&[&reply, &reply, &reply]));
    let sandbox = Arc::new(RemoteSandbox::new(RemoteSandboxConfig::default()));
    let agent = ReactAgent::new(model.clone(), sandbox, config(3));
    let events = collect(&agent, RunRequest::new("q")).await;

    let failures: Vec<(usize, Option<String>)> = events
        .iter()
        .filter_map(|e| match &e.data {
            Some(EventPayload::Iteration(summary)) => Some((e.iteration, summary.error.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        failures,
        (1..=3).map(|i| (i, Some(NOT_CONFIGURED.to_string()))).collect::<Vec<_>>()
    );
    assert!(events
        .iter()
        .filter(|e| e.event_type == EventType::IterationComplete)
        .all(|e| matches!(&e.data, Some(EventPayload::Iteration(s)) if !s.success)));

    let n = events.len();
    assert_eq!(events[n - 2].event_type, EventType::Error);
    assert_eq!(events[n - 2].iteration, 3);
    let outcome = events[n - 1].outcome().expect("outcome");
    assert!(!outcome.success);
    assert_eq!(model.calls(), 3);
}

/// The embedded interpreter computes a scalar answer
#[tokio::test]
async fn test_compute_with_interpreter() {
    let reply = code_reply("add the numbers", "2 + 2", true);
    let model = Arc::new(ScriptedModel::replying(&[&reply]));
    let agent = ReactAgent::new(model.clone(), Arc::new(Interpreter::default()), config(5));

    let outcome = agent
        .run_to_completion(RunRequest::new("compute 2+2"))
        .await
        .expect("run succeeds");

    assert!(outcome.success);
    assert_eq!(outcome.records.len(), 1);
    let result = outcome.result.expect("result");
    assert_eq!(result.kind(), "text");
    assert_eq!(result, TypedOutput::text("4"));
}

/// A reply with no code and no final flag gets the no-code instruction
#[tokio::test]
async fn test_no_code_asks_again() {
    let empty = serde_json::json!({"thoughts": "thinking out loud", "code": "", "final_answer": false}).to_string();
    let code = code_reply("now with code", "1", true);
    let model = Arc::new(ScriptedModel::replying(&[&empty, &code]));
    let executor = Arc::new(ScriptedExecutor::new(vec![ok(Value::Int(1))]));
    let outcome = agent(&model, &executor, 5)
        .run_to_completion(RunRequest::new("q"))
        .await
        .expect("run succeeds");

    assert_eq!(model.last_message(1).content, NO_CODE_INSTRUCTION);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(executor.executions(), 1);
}

/// A final answer without code completes with the thoughts as text
#[tokio::test]
async fn test_final_answer_without_code() {
    let reply = serde_json::json!({"thoughts": "The table is empty.", "final_answer": true}).to_string();
    let model = Arc::new(ScriptedModel::replying(&[&reply]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let events = collect(&agent(&model, &executor, 5), RunRequest::new("q")).await;

    assert_eq!(
        types(&events),
        vec![EventType::Started, EventType::Thinking, EventType::Completed]
    );
    let outcome = events[2].outcome().expect("outcome");
    assert!(outcome.success);
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.result, Some(TypedOutput::text("The table is empty.")));
    assert_eq!(executor.executions(), 0);
}

/// A fatal model error ends the run with a single Error event
#[tokio::test]
async fn test_model_error_is_terminal() {
    let model = Arc::new(ScriptedModel::new(vec![Err(ChatError::Status {
        status: 401,
        body: "unauthorized".into(),
    })]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let agent = agent(&model, &executor, 5);

    let events = collect(&agent, RunRequest::new("q")).await;
    let last = events.last().expect("events");
    assert_eq!(last.event_type, EventType::Error);
    assert!(last.is_terminal());
    assert!(last.message.starts_with("Iteration 1: Error - "));
    assert!(!events.iter().any(|e| e.event_type == EventType::Completed));

    let model = Arc::new(ScriptedModel::new(vec![Err(ChatError::Status {
        status: 401,
        body: "unauthorized".into(),
    })]));
    let agent = ReactAgent::new(model, executor, config(5));
    let err = agent.run_to_completion(RunRequest::new("q")).await.unwrap_err();
    assert!(matches!(err, AgentError::Failed(_)));
}

/// A token cancelled before the run stops it at the first iteration
#[tokio::test]
async fn test_cancelled_before_start() {
    let model = Arc::new(ScriptedModel::replying(&[]));
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events = collect(&agent(&model, &executor, 5), RunRequest::new("q").with_cancel(cancel)).await;
    assert_eq!(types(&events), vec![EventType::Started, EventType::Completed]);
    let outcome = events[1].outcome().expect("outcome");
    assert!(outcome.cancelled);
    assert!(!outcome.success);
    assert_eq!(model.calls(), 0);
}

/// Cancelling mid-run stops before the next iteration
#[tokio::test]
async fn test_cancelled_after_first_iteration() {
    let reply = code_reply("step", "1", false);
    let model = Arc::new(ScriptedModel::replying(&[&reply, &reply]));
    let cancel = CancellationToken::new();
    let executor = Arc::new(ScriptedExecutor::new(vec![ok(Value::Int(1))]).cancelling(cancel.clone()));

    let events = collect(&agent(&model, &executor, 5), RunRequest::new("q").with_cancel(cancel)).await;
    let last = events.last().expect("events");
    assert_eq!(last.event_type, EventType::Completed);
    assert_eq!(last.message, "DataAgent cancelled after 1 iterations");

    let outcome = last.outcome().expect("outcome");
    assert!(outcome.cancelled);
    assert!(!outcome.success);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(model.calls(), 1);
}

/// A failed step feeds the error back and the model recovers
#[tokio::test]
async fn test_self_healing() {
    let broken = code_reply("first try", "df.colum(\"sales\")", false);
    let fixed = code_reply("fixed the typo", "df.column(\"sales\")", true);
    let model = Arc::new(ScriptedModel::replying(&[&broken, &fixed]));
    let executor = Arc::new(ScriptedExecutor::new(vec![
        failed("Function not found: colum"),
        ok(Value::List(vec![Value::Int(1), Value::Int(2)])),
    ]));
    let events = collect(&agent(&model, &executor, 5), RunRequest::new("q")).await;

    let followup = model.last_message(1).content;
    assert!(followup.contains("Please fix the error"));
    assert!(followup.contains("Function not found: colum"));

    let summaries: Vec<bool> = events
        .iter()
        .filter_map(|e| match &e.data {
            Some(EventPayload::Iteration(summary)) => Some(summary.success),
            _ => None,
        })
        .collect();
    assert_eq!(summaries, vec![false, true]);

    let outcome = events.last().and_then(|e| e.outcome()).expect("outcome");
    assert!(outcome.success);
    assert_eq!(outcome.records[0].error.as_deref(), Some("Function not found: colum"));
}

/// Exactly one terminal event, last, with iterations that never go back
#[tokio::test]
async fn test_event_ordering() {
    let a = code_reply("a", "1", false);
    let b = code_reply("b", "bad", false);
    let c = code_reply("c", "3", true);
    let model = Arc::new(ScriptedModel::replying(&[&a, &b, &c]));
    let executor = Arc::new(ScriptedExecutor::new(vec![ok(Value::Int(1)), failed("boom"), ok(Value::Int(3))]));
    let events = collect(&agent(&model, &executor, 5), RunRequest::new("q")).await;

    assert_eq!(events[0].event_type, EventType::Started);
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().expect("events").is_terminal());
    assert!(events.windows(2).all(|w| w[0].iteration <= w[1].iteration));
    assert!(events.iter().all(|e| e.total_iterations == 5));

    let per_iteration: Vec<EventType> = events
        .iter()
        .filter(|e| e.iteration == 1)
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        per_iteration,
        vec![
            EventType::Thinking,
            EventType::GeneratingCode,
            EventType::Executing,
            EventType::IterationComplete
        ]
    );
}

/// Full loop against a live model
#[tokio::test]
#[ignore = "Requires Ollama running on localhost:11434"]
async fn test_live_ollama_run() {
    use tabula::llm::OllamaClient;

    let model = Arc::new(OllamaClient::new("http://localhost:11434", "qwen3"));
    let agent = ReactAgent::new(model, Arc::new(Interpreter::default()), AgentConfig::default());
    let outcome = agent
        .run_to_completion(RunRequest::new("compute 2+2 and return the number"))
        .await
        .expect("run completes");

    assert!(outcome.success);
}
