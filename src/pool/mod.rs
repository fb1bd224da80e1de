//! Price pool - validation, staging and normalization
//!
//! Sits between the scheduler and the aggregators: rejects invalid
//! observations into the DLQ, stages accepted ones in the key-value store,
//! and forwards them normalized to the shared target exponent. A periodic
//! sweep prunes staged outliers as a second line of defense; the aggregator
//! filters again on its own.

pub mod dlq;
pub mod outlier;
pub mod staging;

pub use dlq::DeadLetterQueue;
pub use staging::{MemoryStaging, RedisStaging, StagingStore};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::types::{RawPrice, UnifiedPrice, TARGET_EXPO};

/// How often staged lists are swept for outliers.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid price: non-positive value or missing asset")]
    Invalid,

    #[error("staging failed: {0}")]
    Staging(String),
}

pub struct PricePool {
    staging: Arc<dyn StagingStore>,
    dlq: Arc<DeadLetterQueue>,
    ttl: Duration,
    assets: Vec<String>,
}

impl PricePool {
    pub fn new(
        cfg: &AppConfig,
        staging: Arc<dyn StagingStore>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            staging,
            dlq,
            ttl: Duration::from_secs(cfg.price_pool_ttl * 60),
            assets: cfg.assets.iter().map(|a| a.name.clone()).collect(),
        }
    }

    /// Drain the scheduler channel until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut incoming: mpsc::Receiver<RawPrice>,
        out: mpsc::Sender<UnifiedPrice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                price = incoming.recv() => {
                    let Some(price) = price else { return };
                    self.process(price, &out).await;
                }
            }
        }
    }

    async fn process(&self, price: RawPrice, out: &mpsc::Sender<UnifiedPrice>) {
        if let Err(e) = self.validate_and_stage(&price).await {
            self.dlq.enqueue(price, &e.to_string());
            return;
        }

        let unified = price.to_unified().normalize_to(TARGET_EXPO);
        debug!(asset = %unified.asset, value = unified.scaled(), "Price staged");
        if out.send(unified).await.is_err() {
            error!("Aggregator channel closed, dropping price");
        }
    }

    async fn validate_and_stage(&self, price: &RawPrice) -> Result<(), PoolError> {
        if price.value <= 0.0 || price.asset.is_empty() {
            return Err(PoolError::Invalid);
        }
        self.staging
            .append(&price.asset, price, self.ttl)
            .await
            .map_err(|e| PoolError::Staging(e.to_string()))
    }

    /// Periodic outlier sweep over every configured asset's staged list.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        for asset in &self.assets {
            let staged = match self.staging.read_all(asset).await {
                Ok(staged) => staged,
                Err(e) => {
                    error!(asset = %asset, error = %e, "Failed to read staged prices");
                    continue;
                }
            };

            let filtered = outlier::filter_outliers(&staged);
            if filtered.len() < staged.len() {
                info!(
                    asset = %asset,
                    removed = staged.len() - filtered.len(),
                    "Outliers removed"
                );
                if let Err(e) = self.staging.replace(asset, &filtered, self.ttl).await {
                    error!(asset = %asset, error = %e, "Failed to rewrite staged prices");
                }
            }
        }
    }
}
