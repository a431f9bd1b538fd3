//! Runtime settings
//!
//! Every knob the engine consumes is a plain scalar. `Settings::default()` is
//! usable as-is for local development; `Settings::from_env()` overlays
//! `TABULA_*` environment variables on top of the defaults.

use std::time::Duration;

use thiserror::Error;

use crate::executor::ExecutorKind;

/// Error type for settings loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Scalar settings for the engine, the backends and the cache layer
#[derive(Debug, Clone)]
pub struct Settings {
    /// Execution backend used by every agent built from these settings
    pub executor: ExecutorKind,
    /// Per-call execution timeout in seconds
    pub execution_timeout_secs: u64,
    /// Per-call model timeout in seconds
    pub llm_timeout_secs: u64,
    /// Iteration budget when the caller does not pass one
    pub max_iterations: usize,
    /// Session lock TTL in seconds
    pub lock_ttl_secs: u64,
    /// Default TTL for cache writes in seconds
    pub cache_default_ttl_secs: u64,
    /// TTL of the per-session console buffer in seconds
    pub console_ttl_secs: u64,
    /// JSON cache payloads larger than this many bytes are compressed
    pub compression_threshold: usize,
    /// Ollama base URL
    pub ollama_url: String,
    /// Model name passed to Ollama
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Remote sandbox endpoint (remote backend is unavailable without it)
    pub sandbox_url: Option<String>,
    pub sandbox_api_key: Option<String>,
    /// Modules scripts may `import` in the interpreter backend
    pub authorized_modules: Vec<String>,
    /// Redis URL for the cache substrate (in-memory when unset)
    pub redis_url: Option<String>,
    /// OTLP collector endpoint; spans are only exported when set
    pub otlp_endpoint: Option<String>,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executor: ExecutorKind::Interpreter,
            execution_timeout_secs: 30,
            llm_timeout_secs: 120,
            max_iterations: 5,
            lock_ttl_secs: 300,
            cache_default_ttl_secs: 3600,
            console_ttl_secs: 3600,
            compression_threshold: 16 * 1024,
            ollama_url: "http://localhost:11434".to_string(),
            model: "qwen3".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
            sandbox_url: None,
            sandbox_api_key: None,
            authorized_modules: ["table", "chart", "image", "stats"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            redis_url: None,
            otlp_endpoint: None,
            log_json: false,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `TABULA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Settings::from_env`] with an explicit variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(v) = lookup("TABULA_EXECUTOR") {
            settings.executor = v.parse().map_err(|_| ConfigError::Invalid {
                key: "TABULA_EXECUTOR",
                value: v.clone(),
            })?;
        }
        parse_into(&lookup, "TABULA_EXECUTION_TIMEOUT_SECS", &mut settings.execution_timeout_secs)?;
        parse_into(&lookup, "TABULA_LLM_TIMEOUT_SECS", &mut settings.llm_timeout_secs)?;
        parse_into(&lookup, "TABULA_MAX_ITERATIONS", &mut settings.max_iterations)?;
        parse_into(&lookup, "TABULA_LOCK_TTL_SECS", &mut settings.lock_ttl_secs)?;
        parse_into(&lookup, "TABULA_CACHE_TTL_SECS", &mut settings.cache_default_ttl_secs)?;
        parse_into(&lookup, "TABULA_CONSOLE_TTL_SECS", &mut settings.console_ttl_secs)?;
        parse_into(&lookup, "TABULA_COMPRESSION_THRESHOLD", &mut settings.compression_threshold)?;
        parse_into(&lookup, "TABULA_TEMPERATURE", &mut settings.temperature)?;
        parse_into(&lookup, "TABULA_MAX_TOKENS", &mut settings.max_tokens)?;
        parse_into(&lookup, "TABULA_LOG_JSON", &mut settings.log_json)?;

        if let Some(v) = lookup("TABULA_OLLAMA_URL") {
            settings.ollama_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = lookup("TABULA_MODEL") {
            settings.model = v;
        }
        if let Some(v) = lookup("TABULA_AUTHORIZED_MODULES") {
            settings.authorized_modules = v
                .split(',')
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }
        settings.sandbox_url = lookup("TABULA_SANDBOX_URL").filter(|v| !v.is_empty());
        settings.sandbox_api_key = lookup("TABULA_SANDBOX_API_KEY").filter(|v| !v.is_empty());
        settings.redis_url = lookup("TABULA_REDIS_URL").filter(|v| !v.is_empty());
        settings.otlp_endpoint = lookup("TABULA_OTLP_ENDPOINT").filter(|v| !v.is_empty());

        Ok(settings)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }

    pub fn console_ttl(&self) -> Duration {
        Duration::from_secs(self.console_ttl_secs)
    }
}

fn parse_into<F, T>(lookup: &F, key: &'static str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw.clone() })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.executor, ExecutorKind::Interpreter);
        assert_eq!(settings.execution_timeout_secs, 30);
        assert_eq!(settings.lock_ttl_secs, 300);
        assert_eq!(settings.cache_default_ttl_secs, 3600);
        assert!(settings.authorized_modules.contains(&"table".to_string()));
    }

    #[test]
    fn test_env_overlay() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("TABULA_EXECUTOR", "remote"),
            ("TABULA_MAX_ITERATIONS", "8"),
            ("TABULA_OLLAMA_URL", "http://gpu-box:11434/"),
            ("TABULA_AUTHORIZED_MODULES", "table, stats,"),
            ("TABULA_SANDBOX_API_KEY", ""),
        ]))
        .unwrap();

        assert_eq!(settings.executor, ExecutorKind::Remote);
        assert_eq!(settings.max_iterations, 8);
        assert_eq!(settings.ollama_url, "http://gpu-box:11434");
        assert_eq!(settings.authorized_modules, vec!["table", "stats"]);
        assert!(settings.sandbox_api_key.is_none());
    }

    #[test]
    fn test_invalid_value_is_reported() {
        let err = Settings::from_lookup(lookup_from(&[("TABULA_LOCK_TTL_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("TABULA_LOCK_TTL_SECS"));
    }
}
