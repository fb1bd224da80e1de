//! Sharded aggregation stage
//!
//! One worker per configured asset, all pre-created at startup. A router
//! task reads the pool's output and dispatches each price to its asset's
//! worker by key; prices for unknown keys are dropped with a warning. The
//! workers share a single cloned sender into the consensus stage, so the
//! aggregator's output is a plain fan-in.

mod worker;

pub use worker::{compute_batch_average, BUFFER_MAX_SIZE, ENGINE_SOURCE};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::types::{AssetKey, UnifiedPrice};
use worker::AggregatorWorker;

/// Capacity of each per-asset worker inbox.
const WORKER_QUEUE_SIZE: usize = 10;

pub struct Aggregator {
    routes: Arc<HashMap<AssetKey, mpsc::Sender<UnifiedPrice>>>,
}

impl Aggregator {
    /// Pre-create one worker per configured asset. `out` feeds consensus;
    /// each worker holds a clone.
    pub fn spawn(
        cfg: &AppConfig,
        out: mpsc::Sender<UnifiedPrice>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut routes = HashMap::new();
        let mut handles = Vec::new();

        for asset in &cfg.assets {
            let asset_key = AssetKey::from_identity(&asset.internal_identity);
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_SIZE);
            routes.insert(asset_key, tx);

            let worker = AggregatorWorker::new(cfg.aggr_dev_perc, out.clone());
            handles.push(tokio::spawn(worker.run(rx, shutdown.clone())));
            info!(asset = %asset.name, key = %asset_key, "Aggregator worker started");
        }

        (
            Self {
                routes: Arc::new(routes),
            },
            handles,
        )
    }

    /// Route pool output to per-asset workers until shutdown.
    pub async fn route(
        &self,
        mut incoming: mpsc::Receiver<UnifiedPrice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                price = incoming.recv() => {
                    let Some(price) = price else { return };
                    self.dispatch(price).await;
                }
            }
        }
    }

    async fn dispatch(&self, price: UnifiedPrice) {
        match self.routes.get(&price.asset_key) {
            Some(worker) => {
                if worker.send(price).await.is_err() {
                    warn!("Aggregator worker exited, dropping price");
                }
            }
            None => {
                warn!(key = %price.asset_key, asset = %price.asset,
                    "No aggregator worker for asset key, dropping price");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetConfig, FeedConfig};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> AppConfig {
        AppConfig {
            price_pool_ttl: 10,
            aggregator_nodes: 3,
            aggr_dev_perc: 0.1,
            consensus_threshold: 0.01,
            relay_time_threshold: 30,
            assets: vec![AssetConfig {
                name: "BTC/USD".to_string(),
                internal_identity: "BTC/USD".to_string(),
                feeds: vec![FeedConfig {
                    name: "pyth".to_string(),
                    interval: 5,
                    feed_asset_id: "0xdead".to_string(),
                }],
            }],
            contracts: Vec::new(),
            api_keys: std::collections::HashMap::new(),
            private_key: String::new(),
            db_url: String::new(),
            server_port: 8000,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            fallback_rpc_url: String::new(),
        }
    }

    fn unified(asset_key: AssetKey, value: f64) -> UnifiedPrice {
        UnifiedPrice {
            id: Uuid::new_v4(),
            source: "pyth".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key,
            value,
            expo: -18,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
            is_aggregate: false,
            contributing_raw_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn routed_batch_reaches_consensus_channel() {
        let cfg = config();
        let (out_tx, mut out_rx) = mpsc::channel(20);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (aggregator, _handles) = Aggregator::spawn(&cfg, out_tx, shutdown_rx);

        let key = AssetKey::from_identity("BTC/USD");
        for _ in 0..BUFFER_MAX_SIZE {
            aggregator.dispatch(unified(key, 100.0)).await;
        }

        let aggregate = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .expect("aggregate should be emitted")
            .expect("channel open");
        assert_eq!(aggregate.asset_key, key);
        assert_eq!(aggregate.source, ENGINE_SOURCE);
    }

    #[tokio::test]
    async fn unknown_asset_key_is_dropped_silently() {
        let cfg = config();
        let (out_tx, mut out_rx) = mpsc::channel(20);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (aggregator, _handles) = Aggregator::spawn(&cfg, out_tx, shutdown_rx);

        let stray = AssetKey::from_identity("UNKNOWN/PAIR");
        for _ in 0..BUFFER_MAX_SIZE {
            aggregator.dispatch(unified(stray, 100.0)).await;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(out_rx.try_recv().is_err());
    }
}
