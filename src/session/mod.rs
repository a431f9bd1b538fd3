//! Session coordination
//!
//! Per-session state kept in the cache substrate:
//!
//! ```text
//! session:busy:{id}     "1" with lock TTL      one active run per session
//! session:console:{id}  list of log lines      console buffer
//! session:state:{id}    JSON SessionState      last code and result
//! ```
//!
//! The busy lock is a plain set-if-absent with TTL. It never blocks and has
//! no fencing token: a holder that stalls past the TTL can lose the lock to
//! a second caller.

pub mod orchestrator;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheClient, CacheError, LOCK_SENTINEL};
use crate::config::Settings;
use crate::metrics::SESSION_LOCK_ATTEMPTS;
use crate::output::TypedOutput;

pub use orchestrator::{SessionOrchestrator, BUSY_MESSAGE};

pub const BUSY_KEY_PREFIX: &str = "session:busy:";
pub const CONSOLE_KEY_PREFIX: &str = "session:console:";
pub const STATE_KEY_PREFIX: &str = "session:state:";

/// Last known state of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub last_code: Option<String>,
    pub last_result: Option<TypedOutput>,
    pub last_success: bool,
    pub iterations: usize,
    pub updated_at: DateTime<Utc>,
}

/// Lock, console buffer, state and memoization for sessions
#[derive(Clone)]
pub struct SessionCoordinator {
    cache: CacheClient,
    lock_ttl: Duration,
    console_ttl: Duration,
    state_ttl: Duration,
}

impl SessionCoordinator {
    pub fn new(cache: CacheClient) -> Self {
        Self {
            cache,
            lock_ttl: Duration::from_secs(300),
            console_ttl: Duration::from_secs(3600),
            state_ttl: Duration::from_secs(3600),
        }
    }

    pub fn from_settings(cache: CacheClient, settings: &Settings) -> Self {
        Self {
            lock_ttl: settings.lock_ttl(),
            console_ttl: settings.console_ttl(),
            state_ttl: settings.cache_default_ttl(),
            ..Self::new(cache)
        }
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn cache(&self) -> &CacheClient {
        &self.cache
    }

    /// Try to mark the session busy; false means another run holds it
    pub async fn acquire(&self, session_id: &str) -> Result<bool, CacheError> {
        let key = busy_key(session_id);
        match self.cache.set_nx(&key, LOCK_SENTINEL, self.lock_ttl).await {
            Ok(true) => {
                SESSION_LOCK_ATTEMPTS.with_label_values(&["acquired"]).inc();
                debug!(session_id, "Session lock acquired");
                Ok(true)
            }
            Ok(false) => {
                SESSION_LOCK_ATTEMPTS.with_label_values(&["busy"]).inc();
                debug!(session_id, "Session already busy");
                Ok(false)
            }
            Err(e) => {
                SESSION_LOCK_ATTEMPTS.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }

    /// Drop the busy lock; safe when no lock is held
    pub async fn release(&self, session_id: &str) {
        match self.cache.delete(&busy_key(session_id)).await {
            Ok(_) => debug!(session_id, "Session lock released"),
            Err(e) => warn!(session_id, error = %e, "Failed to release session lock"),
        }
    }

    /// Acquire the lock as a lease that is released when dropped
    pub async fn lease(&self, session_id: &str) -> Result<Option<SessionLease>, CacheError> {
        if !self.acquire(session_id).await? {
            return Ok(None);
        }
        Ok(Some(SessionLease {
            coordinator: Arc::new(self.clone()),
            session_id: session_id.to_string(),
            armed: true,
        }))
    }

    pub async fn is_busy(&self, session_id: &str) -> bool {
        self.cache.exists(&busy_key(session_id)).await
    }

    /// Memoized computation; concurrent callers for one key run `factory` once
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: &str, ttl: Option<Duration>, factory: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<CacheError>,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cache.get_or_compute(key, ttl, factory).await
    }

    /// Append one line to the console buffer and refresh its TTL
    pub async fn append_console_output(&self, session_id: &str, line: &str) -> Result<(), CacheError> {
        let key = console_key(session_id);
        let store = self.cache.store();
        store.rpush(&key, line).await?;
        store.expire(&key, self.console_ttl).await?;
        Ok(())
    }

    /// Console lines in `[start, end]`, negative indexes counting from the end
    pub async fn get_console_output(&self, session_id: &str, start: i64, end: i64) -> Result<Vec<String>, CacheError> {
        self.cache.store().lrange(&console_key(session_id), start, end).await
    }

    pub async fn clear_console_output(&self, session_id: &str) -> Result<(), CacheError> {
        self.cache.delete(&console_key(session_id)).await.map(|_| ())
    }

    pub async fn set_state(&self, session_id: &str, state: &SessionState) -> bool {
        self.cache
            .set_json(&state_key(session_id), state, Some(self.state_ttl))
            .await
    }

    pub async fn get_state(&self, session_id: &str) -> Option<SessionState> {
        self.cache.get_json(&state_key(session_id)).await
    }
}

/// Held busy lock for one session
///
/// `release` deletes the lock inline. A lease dropped without `release`
/// (panic, aborted task) spawns the delete onto the runtime.
pub struct SessionLease {
    coordinator: Arc<SessionCoordinator>,
    session_id: String,
    armed: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn release(mut self) {
        self.armed = false;
        self.coordinator.release(&self.session_id).await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let coordinator = self.coordinator.clone();
        let session_id = std::mem::take(&mut self.session_id);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                coordinator.release(&session_id).await;
            });
        }
    }
}

fn busy_key(session_id: &str) -> String {
    format!("{}{}", BUSY_KEY_PREFIX, session_id)
}

fn console_key(session_id: &str) -> String {
    format!("{}{}", CONSOLE_KEY_PREFIX, session_id)
}

fn state_key(session_id: &str) -> String {
    format!("{}{}", STATE_KEY_PREFIX, session_id)
}
