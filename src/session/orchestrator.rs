//! Lock-wrapped agent runs
//!
//! ```text
//! process_query(session, request)
//!   lease(session) ── busy ──► Error "Session is currently busy. Please wait."
//!        │
//!   agent.run ─► forward events ─► console buffer (logs) ─► session state
//!        │
//!   lease.release   (also on reader drop, panic or abort)
//! ```

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{SessionCoordinator, SessionLease, SessionState};
use crate::agent::{EventPayload, EventType, ProgressEvent, ReactAgent, RunRequest};

/// Message of the terminal event sent when a session already has a run
pub const BUSY_MESSAGE: &str = "Session is currently busy. Please wait.";

const EVENT_BUFFER: usize = 16;

/// Runs agent queries one at a time per session
#[derive(Clone)]
pub struct SessionOrchestrator {
    coordinator: SessionCoordinator,
    agent: ReactAgent,
}

impl SessionOrchestrator {
    pub fn new(coordinator: SessionCoordinator, agent: ReactAgent) -> Self {
        Self { coordinator, agent }
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Run `request` under the session lock, streaming the agent's events
    ///
    /// A busy session yields a single terminal `Error` event. Dropping the
    /// returned stream cancels the run and releases the lock.
    pub fn process_query(&self, session_id: &str, request: RunRequest) -> ReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = self.clone();
        let session_id = session_id.to_string();
        let span = info_span!("process_query", session_id = %session_id, otel.name = "process_query");

        tokio::spawn(
            async move {
                let lease = match this.coordinator.lease(&session_id).await {
                    Ok(Some(lease)) => lease,
                    Ok(None) => {
                        info!("Session busy, rejecting query");
                        let _ = tx.send(rejection(BUSY_MESSAGE.to_string())).await;
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "Session lock unavailable");
                        let _ = tx.send(rejection(format!("Session lock unavailable: {}", e))).await;
                        return;
                    }
                };
                this.forward(lease, request, tx).await;
            }
            .instrument(span),
        );

        ReceiverStream::new(rx)
    }

    async fn forward(&self, lease: SessionLease, request: RunRequest, tx: mpsc::Sender<ProgressEvent>) {
        let session_id = lease.session_id().to_string();
        let cancel = request.cancel.clone();
        let mut events = self.agent.run(request.with_session(session_id.clone()));

        let mut last_code = None;
        let mut final_state = None;

        while let Some(event) = events.next().await {
            match &event.data {
                Some(EventPayload::Code { code, .. }) => last_code = Some(code.clone()),
                Some(EventPayload::Iteration(summary)) => {
                    for line in &summary.logs {
                        if let Err(e) = self.coordinator.append_console_output(&session_id, line).await {
                            warn!(error = %e, "Failed to append console output");
                            break;
                        }
                    }
                }
                Some(EventPayload::Outcome(outcome)) => {
                    final_state = Some(SessionState {
                        last_code: last_code.clone(),
                        last_result: outcome.result.clone(),
                        last_success: outcome.success,
                        iterations: outcome.iterations,
                        updated_at: event.timestamp,
                    });
                }
                _ => {}
            }

            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() {
                debug!("Query reader dropped, cancelling run");
                cancel.cancel();
                break;
            }
            if terminal {
                break;
            }
        }

        if let Some(state) = final_state {
            self.coordinator.set_state(&session_id, &state).await;
        }
        lease.release().await;
    }
}

fn rejection(message: String) -> ProgressEvent {
    ProgressEvent::new(EventType::Error, 0, 0, message.clone())
        .with_data(EventPayload::Failure { error: message, fatal: true })
}
