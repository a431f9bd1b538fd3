//! Prometheus metrics for the agent engine
//!
//! All metrics live in the default registry and are exposed through
//! [`gather`] in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Runs
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished agent runs by outcome.
    ///
    /// Labels:
    /// - outcome: "success", "max_iterations", "cancelled" or "error"
    pub static ref AGENT_RUNS: CounterVec = register_counter_vec!(
        "tabula_agent_runs_total",
        "Agent runs by outcome",
        &["outcome"]
    ).expect("failed to register AGENT_RUNS metric");

    /// Iterations consumed per finished run.
    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "tabula_agent_iterations",
        "Iterations consumed per agent run",
        vec![0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 20.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    /// Runs currently producing events.
    pub static ref AGENT_ACTIVE_RUNS: Gauge = register_gauge!(
        "tabula_agent_active_runs",
        "Agent runs currently in progress"
    ).expect("failed to register AGENT_ACTIVE_RUNS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Code Execution
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions by backend and status.
    ///
    /// Labels:
    /// - backend: "interpreter" or "remote"
    /// - status: "success", "error" or "timeout"
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "tabula_code_executions_total",
        "Code executions by backend and status",
        &["backend", "status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "tabula_code_execution_duration_seconds",
        "Wall-clock duration of code executions",
        &["backend"],
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Language Model
    // ─────────────────────────────────────────────────────────────────────────────

    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "tabula_llm_call_duration_seconds",
        "Duration of language-model calls",
        &["model"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Model call failures.
    ///
    /// Labels:
    /// - kind: "transient", "permanent", "parse" or "timeout"
    pub static ref LLM_CALL_ERRORS: CounterVec = register_counter_vec!(
        "tabula_llm_call_errors_total",
        "Language-model call failures by kind",
        &["kind"]
    ).expect("failed to register LLM_CALL_ERRORS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Session Coordination
    // ─────────────────────────────────────────────────────────────────────────────

    /// Session lock attempts.
    ///
    /// Labels:
    /// - result: "acquired" or "busy"
    pub static ref SESSION_LOCK_ATTEMPTS: CounterVec = register_counter_vec!(
        "tabula_session_lock_attempts_total",
        "Session lock acquisition attempts by result",
        &["result"]
    ).expect("failed to register SESSION_LOCK_ATTEMPTS metric");

    /// Cache lookups.
    ///
    /// Labels:
    /// - result: "hit" or "miss"
    pub static ref CACHE_LOOKUPS: CounterVec = register_counter_vec!(
        "tabula_cache_lookups_total",
        "Cache lookups by result",
        &["result"]
    ).expect("failed to register CACHE_LOOKUPS metric");

    /// Factory invocations inside get_or_compute.
    pub static ref CACHE_COMPUTES: Counter = register_counter!(
        "tabula_cache_compute_total",
        "Values computed after a cache miss"
    ).expect("failed to register CACHE_COMPUTES metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metrics() {
        AGENT_RUNS.with_label_values(&["success"]).inc();
        CACHE_LOOKUPS.with_label_values(&["miss"]).inc();

        let text = gather();
        assert!(text.contains("tabula_agent_runs_total"));
        assert!(text.contains("tabula_cache_lookups_total"));
    }
}
