use std::sync::Arc;

use anyhow::{Context, Result};
use everruns_matching::{
    DomainEntry, DynamicRateLimiter, FacadeMetrics, Handler, InMemoryDomainCache,
    InMemoryTaskStore, MatchingConfig, MatchingEngine, MetricsClient, TaskListRegistry,
    TaskStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "everruns_matching=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("everruns-matching starting...");

    let config = MatchingConfig::from_env();
    config.validate().context("invalid matching configuration")?;
    tracing::info!(
        rps = config.rps,
        sync_match_wait_ms = config.sync_match_wait.as_millis() as u64,
        "Matching configured"
    );

    // Single-process deployment: backlog and domains live in memory
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let domains = InMemoryDomainCache::new();
    if let Ok(domain) = std::env::var("MATCHING_DOMAIN") {
        domains.register(DomainEntry::active(domain.clone(), domain));
    }
    let metrics: Arc<dyn MetricsClient> = Arc::new(FacadeMetrics);
    let limiter = Arc::new(DynamicRateLimiter::fixed(config.rps));

    let engine = Arc::new(MatchingEngine::new(
        config,
        Arc::new(TaskListRegistry::new()),
        Arc::clone(&store),
        Arc::new(domains),
        Arc::clone(&metrics),
    ));
    let handler = Handler::new(engine, store, limiter, metrics);
    handler.start();

    tracing::info!("Matching ready, waiting for shutdown signal...");
    tokio::signal::ctrl_c().await?;

    handler.stop().await;
    tracing::info!("Matching shutdown complete");
    Ok(())
}
