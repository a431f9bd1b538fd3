//! Integration tests for session coordination
//!
//! Covers the stampede-safe memoized compute and the lock-wrapped query flow
//! of `SessionOrchestrator`, all against the in-memory cache substrate.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use pretty_assertions::assert_eq;
use tokio_stream::StreamExt;

use support::{code_reply, ScriptedExecutor, ScriptedModel};
use tabula::agent::{AgentConfig, EventType, ProgressEvent, ReactAgent, RunRequest};
use tabula::cache::{CacheClient, CacheError};
use tabula::executor::ExecutionResult;
use tabula::llm::RetryPolicy;
use tabula::output::{TypedOutput, Value};
use tabula::session::{SessionCoordinator, SessionOrchestrator, BUSY_MESSAGE};

fn orchestrator(model: ScriptedModel, executor: ScriptedExecutor) -> SessionOrchestrator {
    let agent = ReactAgent::new(
        Arc::new(model),
        Arc::new(executor),
        AgentConfig {
            retry: RetryPolicy::none(),
            ..AgentConfig::default()
        },
    );
    SessionOrchestrator::new(SessionCoordinator::new(CacheClient::in_memory()), agent)
}

fn answering_orchestrator() -> SessionOrchestrator {
    let model = ScriptedModel::replying(&[&code_reply("answer directly", "print(\"hello\"); 42", true)]);
    let executor = ScriptedExecutor::new(vec![ExecutionResult::success(
        Value::Int(42),
        vec!["hello".to_string()],
        Duration::from_millis(3),
    )]);
    orchestrator(model, executor)
}

/// Concurrent callers for one uncached key share a single computation
#[tokio::test]
async fn test_get_or_compute_runs_factory_once() {
    let cache = CacheClient::in_memory().with_compute_timing(Duration::from_secs(5), Duration::from_millis(10));
    let sessions = SessionCoordinator::new(cache);
    let calls = Arc::new(AtomicUsize::new(0));

    let callers = (0..8).map(|_| {
        let sessions = sessions.clone();
        let calls = calls.clone();
        async move {
            sessions
                .get_or_compute("report:q1", Some(Duration::from_secs(60)), || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, CacheError>(vec![1u64, 2, 3])
                    }
                })
                .await
        }
    });
    let results = join_all(callers).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.expect("computed"), vec![1, 2, 3]);
    }
}

/// A failed computation is not cached
#[tokio::test]
async fn test_get_or_compute_does_not_cache_errors() {
    let sessions = SessionCoordinator::new(CacheClient::in_memory());

    let first: Result<u64, CacheError> = sessions
        .get_or_compute("k", None, || async { Err(CacheError::Backend("down".into())) })
        .await;
    assert!(first.is_err());

    let second: Result<u64, CacheError> = sessions.get_or_compute("k", None, || async { Ok(7) }).await;
    assert_eq!(second.expect("computed"), 7);
}

/// A query against a locked session is rejected with one Error event
#[tokio::test]
async fn test_busy_session_rejected() {
    let orchestrator = answering_orchestrator();
    assert!(orchestrator.coordinator().acquire("busy").await.expect("lock"));

    let events: Vec<ProgressEvent> = orchestrator
        .process_query("busy", RunRequest::new("q"))
        .collect()
        .await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::Error);
    assert_eq!(events[0].message, BUSY_MESSAGE);
    assert!(orchestrator.coordinator().is_busy("busy").await);
}

/// The lock is released once the stream ends
#[tokio::test]
async fn test_lock_released_after_run() {
    let orchestrator = answering_orchestrator();

    let events: Vec<ProgressEvent> = orchestrator
        .process_query("s1", RunRequest::new("q"))
        .collect()
        .await;

    assert_eq!(events.last().map(|e| e.event_type), Some(EventType::Completed));
    assert!(!orchestrator.coordinator().is_busy("s1").await);
}

/// A finished run leaves its logs and summary in the session
#[tokio::test]
async fn test_run_records_console_and_state() {
    let orchestrator = answering_orchestrator();
    let _: Vec<ProgressEvent> = orchestrator
        .process_query("s2", RunRequest::new("q"))
        .collect()
        .await;

    let coordinator = orchestrator.coordinator();
    let console = coordinator.get_console_output("s2", 0, -1).await.expect("console");
    assert_eq!(console, vec!["hello".to_string()]);

    let state = coordinator.get_state("s2").await.expect("state");
    assert_eq!(state.last_code.as_deref(), Some("print(\"hello\"); 42"));
    assert_eq!(state.last_result, Some(TypedOutput::text("42")));
    assert!(state.last_success);
    assert_eq!(state.iterations, 1);
}
