//! muninnd: Muninn cache daemon.
//!
//! Connects the cache store and resource pool, warms the caches, and keeps
//! them warm until interrupted.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use muninn::cache::CacheStore;
use muninn::config::Config;
use muninn::pool::ResourcePool;
use muninn::services::{CachedOperations, HttpRetrievalService, PatternClassifier, PgQueryExecutor};
use muninn::warming::{CacheWarmer, WarmingCorpus, load_query_patterns};

/// Muninn daemon: cache warming and resource pooling.
#[derive(Parser)]
#[command(name = "muninnd")]
#[command(version)]
#[command(about = "Muninn cache and resource pool daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "MUNINN_CONFIG")]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: info; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?.with_env_overrides();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.runtime.max_blocking_threads.max(1))
        .build()?;
    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.runtime.environment,
        "muninnd starting"
    );

    // Probing Redis blocks for up to the connect timeout.
    let cache_config = config.cache.clone();
    let store = Arc::new(
        tokio::task::spawn_blocking(move || CacheStore::connect(cache_config)).await?,
    );
    let pool = Arc::new(ResourcePool::connect(&config).await);
    info!(backend = store.backend().as_str(), pool = ?pool.state(), "components ready");

    let knowledge_base_id = config.api.knowledge_base_id.clone().unwrap_or_default();
    let retrieval = HttpRetrievalService::new(
        Arc::clone(&pool),
        knowledge_base_id.clone(),
        config.api.model_id.clone(),
    );
    let ops = Arc::new(
        CachedOperations::new(
            Arc::clone(&store),
            Arc::new(PatternClassifier::new()),
            Arc::new(PgQueryExecutor::new(Arc::clone(&pool))),
            Arc::new(retrieval),
        )
        .knowledge_base_id(knowledge_base_id),
    );

    let mut corpus = WarmingCorpus::default();
    if let Some(path) = &config.warming.query_log {
        match load_query_patterns(path) {
            Ok(queries) => {
                let added = corpus.extend_queries(queries);
                info!(added, path = %path.display(), "loaded query patterns");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load query patterns"),
        }
    }

    let warmer = Arc::new(CacheWarmer::new(ops, corpus, config.warming.clone()));
    warmer.warm_on_startup().await;
    let handle = warmer.start(config.periodic_warming());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    handle.shutdown().await;
    pool.close_all().await;
    info!("muninnd stopped");
    Ok(())
}
