use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oracle_engine::aggregator::Aggregator;
use oracle_engine::api::{self, ApiState, PriceStreamer};
use oracle_engine::config::AppConfig;
use oracle_engine::consensus::Consensus;
use oracle_engine::dispatcher::Dispatcher;
use oracle_engine::feeds::{BinanceFeed, CoingeckoFeed, ExchangeRateFeed, PythFeed};
use oracle_engine::pool::{DeadLetterQueue, PricePool, RedisStaging, StagingStore};
use oracle_engine::scheduler::Scheduler;
use oracle_engine::storage::{PostgresStorage, Storage};

const DLQ_JOURNAL_PATH: &str = "dlq_journal.csv";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::load()?;
    cfg.validate()?;
    info!(config = %cfg.digest(), "Starting oracle engine");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    // Shared collaborators
    let storage: Arc<dyn Storage> = Arc::new(
        PostgresStorage::connect(&cfg.db_url)
            .await
            .context("Failed to connect to the price store")?,
    );
    let staging: Arc<dyn StagingStore> = Arc::new(
        RedisStaging::connect(&cfg.redis_url())
            .await
            .context("Failed to connect to the staging store")?,
    );
    let dlq = Arc::new(match DeadLetterQueue::with_journal(Path::new(DLQ_JOURNAL_PATH)) {
        Ok(dlq) => dlq,
        Err(e) => {
            warn!(error = %e, "DLQ journal unavailable, keeping rejections in memory only");
            DeadLetterQueue::new()
        }
    });

    // Stage-to-stage channels
    let (raw_tx, raw_rx) = mpsc::channel(100);
    let (unified_tx, unified_rx) = mpsc::channel(100);
    let (aggregate_tx, aggregate_rx) = mpsc::channel(20);
    let (fanout_tx, fanout_rx) = mpsc::channel(10);

    // Scheduler with its feed registry
    let mut scheduler = Scheduler::new(Arc::clone(&storage), raw_tx);
    scheduler.register_feed(Arc::new(PythFeed::new()?));
    scheduler.register_feed(Arc::new(BinanceFeed::new()?));
    scheduler.register_feed(Arc::new(CoingeckoFeed::new()?));
    scheduler.register_feed(Arc::new(ExchangeRateFeed::new(
        cfg.api_keys.get("exchangerate").cloned().unwrap_or_default(),
    )?));
    handles.extend(scheduler.start(&cfg, shutdown_rx.clone()));

    // Pool: intake plus the periodic outlier sweep
    let pool = Arc::new(PricePool::new(&cfg, staging, dlq));
    handles.push(tokio::spawn(Arc::clone(&pool).run(
        raw_rx,
        unified_tx,
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(pool.run_cleanup(shutdown_rx.clone())));

    // Aggregator workers and router
    let (aggregator, worker_handles) =
        Aggregator::spawn(&cfg, aggregate_tx, shutdown_rx.clone());
    handles.extend(worker_handles);
    {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            aggregator.route(unified_rx, shutdown).await;
        }));
    }

    // Dispatcher and consensus, wired through the issuance sink
    let (dispatcher, dispatch_handles) = Dispatcher::spawn(&cfg, shutdown_rx.clone());
    handles.extend(dispatch_handles);
    let consensus = Consensus::new(Arc::clone(&storage), dispatcher, fanout_tx);
    handles.push(tokio::spawn(
        consensus.run(aggregate_rx, shutdown_rx.clone()),
    ));

    // Read surface: SSE fan-out and HTTP server
    let streamer = Arc::new(PriceStreamer::new());
    handles.push(tokio::spawn(Arc::clone(&streamer).run(
        fanout_rx,
        shutdown_rx.clone(),
    )));
    let api_state = ApiState::new(&cfg, Arc::clone(&storage), streamer);
    let server_port = cfg.server_port;
    {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = api::serve(server_port, api_state, shutdown).await {
                warn!(error = %e, "HTTP server exited with error");
            }
        }));
    }

    // Graceful shutdown
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");

    Ok(())
}
