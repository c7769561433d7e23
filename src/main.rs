// binsandbox - binary-analysis orchestration sandbox
//
// Accepts analysis requests for executables identified by SHA-256, resolves
// their bytes through the Unified Binary Store, fans each binary out to the
// configured connectors on shared worker pools, and dispatches scored
// findings (with IOCs) to downstream feeds.
//
// Architecture:
// - Front-end (axum): validates requests and enqueues work
// - Queue substrate: four named FIFO queues with dependency chaining
// - Pipeline workers: retrieval -> download -> fan-out -> analysis -> dispatch
// - Binary cache (Redis): bytes + refcount per hash
// - Store (SQLite): binaries, analysis results, IOCs
// - Scheduler: cron-driven ingestion of saved queries

mod api;
mod cache;
mod config;
mod connector;
mod model;
mod pipeline;
mod queue;
mod sched;
mod sink;
mod store;
mod ubs;

use anyhow::{Context, Result};
use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "binsandbox", version = config::VERSION)]
struct Cli {
    /// Path to the YAML config file (default: ./config.yml)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref());

    // Precedence: RUST_LOG env var > config loglevel
    let default_filter = format!("binsandbox={}", cfg.loglevel);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        version = config::VERSION,
        environment = %cfg.environment,
        "starting binsandbox"
    );

    let store = store::Store::open(&cfg.database_path())
        .with_context(|| format!("failed to open database at {}", cfg.database_url))?;

    let cache: Arc<dyn cache::BinaryCache> = Arc::new(
        cache::RedisCache::connect(&cfg.redis_url)
            .await
            .context("failed to connect to the binary cache")?,
    );

    let registry = Arc::new(connector::Registry::load(
        connector::builtin_factories(),
        &cfg.connector_dirs,
    )?);
    if registry.is_empty() {
        tracing::warn!("no connectors available; analyses will produce nothing");
    }
    for name in cfg.sinks.keys() {
        if registry.get(name).is_none() {
            tracing::warn!(connector = %name, "sink configured for an unknown connector");
        }
    }

    let queues = Arc::new(queue::Queues::new());
    let ubs: Arc<dyn ubs::Ubs> =
        Arc::new(ubs::UbsClient::new(cfg.ubs.clone(), cfg.binary_timeout()));
    let sink: Arc<dyn sink::ResultSink> = Arc::new(sink::FeedClient::new(&cfg.ubs));

    let engine = Arc::new(pipeline::Engine {
        config: cfg.clone(),
        store,
        cache,
        ubs,
        sink,
        registry,
        queues: queues.clone(),
    });
    let worker_handles = engine.spawn_workers();
    tracing::info!(
        workers = worker_handles.len(),
        per_queue = cfg.workers_per_queue,
        "worker pool running"
    );

    let scheduler = Arc::new(sched::Scheduler::new(queues));
    tokio::spawn(scheduler.clone().run());

    let state = api::ApiState {
        engine,
        scheduler,
    };
    let addr = cfg.bind_addr()?;
    tokio::spawn(async move {
        if let Err(e) = api::serve(state, addr).await {
            tracing::error!("front-end failed: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
