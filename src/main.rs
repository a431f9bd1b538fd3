//! Tabula command-line runner
//!
//! Builds every component once from `TABULA_*` settings, runs one query
//! against a small sample table and prints each progress event as a JSON line.
//!
//! Run with: cargo run -- "Which region sold the most?"
//! (Requires Ollama running on localhost:11434)

use std::sync::Arc;

use tokio_stream::StreamExt;
use tracing::{error, info};

use tabula::agent::{AgentConfig, ReactAgent, RunRequest};
use tabula::cache::CacheClient;
use tabula::config::Settings;
use tabula::executor::ExecutorFactory;
use tabula::llm::OllamaClient;
use tabula::output::{Bindings, Column, DataTable, Value};
use tabula::session::{SessionCoordinator, SessionOrchestrator};
use tabula::tracing::{init_tracing, shutdown_tracing};

const DEFAULT_QUERY: &str = "Which region has the highest total sales? Return a table sorted by total.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let settings = Settings::from_env()?;
    init_tracing("tabula", settings.otlp_endpoint.as_deref(), settings.log_json)?;

    let query = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let query = if query.trim().is_empty() { DEFAULT_QUERY.to_string() } else { query };

    let cache = build_cache(&settings).await?;
    let executors = ExecutorFactory::new(settings.clone());
    let executor = executors.default_executor().await?;
    let model = Arc::new(OllamaClient::from_settings(&settings)?);

    let agent = ReactAgent::new(model, executor, AgentConfig::from_settings(&settings));
    let coordinator = SessionCoordinator::from_settings(cache, &settings);
    let orchestrator = SessionOrchestrator::new(coordinator, agent);

    let session_id = uuid::Uuid::now_v7().to_string();
    info!(session_id = %session_id, executor = %settings.executor, "Processing query");

    let request = RunRequest::new(query).with_bindings(sample_bindings());
    let mut events = orchestrator.process_query(&session_id, request);
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => error!(error = %e, "Failed to serialize event"),
        }
    }

    shutdown_tracing();
    Ok(())
}

#[cfg(feature = "redis")]
async fn build_cache(settings: &Settings) -> Result<CacheClient, Box<dyn std::error::Error + Send + Sync>> {
    use tabula::cache::redis::RedisStore;

    let Some(url) = settings.redis_url.as_deref() else {
        return Ok(in_memory_cache(settings));
    };
    let store = RedisStore::connect(url).await?;
    info!(url, "Using Redis cache substrate");
    Ok(CacheClient::new(
        Arc::new(store),
        settings.cache_default_ttl(),
        settings.compression_threshold,
    ))
}

#[cfg(not(feature = "redis"))]
async fn build_cache(settings: &Settings) -> Result<CacheClient, Box<dyn std::error::Error + Send + Sync>> {
    if settings.redis_url.is_some() {
        tracing::warn!("TABULA_REDIS_URL is set but the redis feature is disabled; using in-memory cache");
    }
    Ok(in_memory_cache(settings))
}

fn in_memory_cache(settings: &Settings) -> CacheClient {
    CacheClient::new(
        Arc::new(tabula::cache::MemoryStore::new()),
        settings.cache_default_ttl(),
        settings.compression_threshold,
    )
}

fn sample_bindings() -> Bindings {
    let sales = DataTable::from_columns(vec![
        Column::new(
            "region",
            ["north", "south", "east", "west", "north", "east"]
                .into_iter()
                .map(Value::from)
                .collect(),
        ),
        Column::new(
            "sales",
            [120.0, 80.5, 150.25, 99.0, 60.0, 40.75]
                .into_iter()
                .map(Value::Float)
                .collect(),
        ),
    ]);

    let mut bindings = Bindings::new();
    bindings.insert("df".to_string(), Value::Table(sales));
    bindings
}
