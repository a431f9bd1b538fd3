//! Remote sandbox backend
//!
//! Submits code to an HTTP sandbox service. Bindings cannot cross the wire as
//! live objects, so they are rendered as source-level assignments and
//! prepended to the code body.
//!
//! Wire protocol:
//!
//! ```text
//! POST {endpoint}/execute
//! Authorization: Bearer {api_key}
//! {"code": "...", "language": "python", "timeout_seconds": 30}
//!
//! 200 {"output": <json>, "stdout": "...", "stderr": "...", "error": null, "exit_code": 0}
//! ```

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::bindings::prepend_assignments;
use super::{CodeExecutor, ExecutionRequest, ExecutionResult, ExecutorKind};
use crate::output::Value;

/// Error text reported when no endpoint or key is configured
pub const NOT_CONFIGURED: &str = "Remote sandbox not configured (missing endpoint or API key)";

/// Configuration for the remote sandbox backend
#[derive(Debug, Clone)]
pub struct RemoteSandboxConfig {
    /// Base URL of the sandbox service
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    /// Language the sandbox runs
    pub language: String,
    /// Added to the execution timeout for the HTTP round trip
    pub network_grace: Duration,
}

impl Default for RemoteSandboxConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            language: "python".to_string(),
            network_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Serialize)]
struct SandboxRequest<'a> {
    code: &'a str,
    language: &'a str,
    timeout_seconds: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SandboxResponse {
    output: serde_json::Value,
    stdout: String,
    stderr: String,
    error: Option<String>,
    exit_code: i32,
}

/// HTTP client for a remote code sandbox
pub struct RemoteSandbox {
    config: RemoteSandboxConfig,
    client: reqwest::Client,
}

impl RemoteSandbox {
    pub fn new(config: RemoteSandboxConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        let endpoint = self.config.endpoint.as_deref().filter(|e| !e.is_empty())?;
        let key = self.config.api_key.as_deref().filter(|k| !k.is_empty())?;
        Some((endpoint.trim_end_matches('/'), key))
    }

    async fn submit(&self, endpoint: &str, api_key: &str, request: &ExecutionRequest) -> Result<SandboxResponse, String> {
        let code = prepend_assignments(&request.bindings, &request.code);
        let body = SandboxRequest {
            code: &code,
            language: &self.config.language,
            timeout_seconds: request.timeout_seconds,
        };

        let response = self
            .client
            .post(format!("{}/execute", endpoint))
            .bearer_auth(api_key)
            .timeout(request.timeout() + self.config.network_grace)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("Execution timed out after {}s", request.timeout_seconds)
                } else {
                    format!("Remote sandbox request failed: {}", e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(format!("Remote sandbox returned {}: {}", status, snippet));
        }

        response
            .json::<SandboxResponse>()
            .await
            .map_err(|e| format!("Invalid sandbox response: {}", e))
    }
}

/// Map a sandbox reply onto the shared result shape
fn into_result(reply: SandboxResponse, duration: Duration) -> ExecutionResult {
    let logs: Vec<String> = reply
        .stdout
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    let error = reply
        .error
        .filter(|e| !e.is_empty())
        .or_else(|| (reply.exit_code != 0).then(|| {
            if reply.stderr.trim().is_empty() {
                format!("Process exited with code {}", reply.exit_code)
            } else {
                reply.stderr.trim().to_string()
            }
        }));

    match error {
        Some(error) => ExecutionResult::failure(error, logs, duration),
        None => ExecutionResult::success(Value::from_json(&reply.output), logs, duration),
    }
}

#[async_trait]
impl CodeExecutor for RemoteSandbox {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Remote
    }

    fn language(&self) -> &str {
        &self.config.language
    }

    fn capabilities(&self) -> String {
        "A remote Python sandbox with the scientific stack (pandas, numpy, plotly). \
         The value of the last expression is returned as the result."
            .to_string()
    }

    fn is_available(&self) -> bool {
        self.credentials().is_some()
    }

    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();
        let Some((endpoint, api_key)) = self.credentials() else {
            return ExecutionResult::failure(NOT_CONFIGURED, Vec::new(), start.elapsed());
        };

        debug!(endpoint, code_len = request.code.len(), "Submitting code to remote sandbox");
        match self.submit(endpoint, api_key, &request).await {
            Ok(reply) => into_result(reply, start.elapsed()),
            Err(e) => {
                warn!(error = %e, "Remote sandbox execution failed");
                ExecutionResult::failure(e, Vec::new(), start.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Bindings;

    #[tokio::test]
    async fn test_unconfigured_fails_without_network() {
        let sandbox = RemoteSandbox::new(RemoteSandboxConfig::default());
        assert!(!sandbox.is_available());

        let request = ExecutionRequest::new("1 + 1", Bindings::new(), Duration::from_secs(5));
        let result = sandbox.execute(request).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some(NOT_CONFIGURED));
    }

    #[test]
    fn test_endpoint_without_key_is_unavailable() {
        let sandbox = RemoteSandbox::new(RemoteSandboxConfig {
            endpoint: Some("https://sandbox.internal".into()),
            api_key: Some(String::new()),
            ..RemoteSandboxConfig::default()
        });
        assert!(!sandbox.is_available());
    }

    #[test]
    fn test_reply_mapping() {
        let ok = into_result(
            SandboxResponse {
                output: serde_json::json!(4),
                stdout: "a\n\nb\n".into(),
                ..SandboxResponse::default()
            },
            Duration::from_millis(5),
        );
        assert!(ok.success);
        assert_eq!(ok.output, Value::Int(4));
        assert_eq!(ok.logs, vec!["a", "b"]);

        let failed = into_result(
            SandboxResponse {
                stderr: "NameError: name 'x' is not defined\n".into(),
                exit_code: 1,
                ..SandboxResponse::default()
            },
            Duration::ZERO,
        );
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("NameError: name 'x' is not defined"));
    }
}
