//! Ingestion scheduler
//!
//! Runs one periodic task per configured (asset, feed) pair. Each tick
//! fetches an observation with a deadline equal to the tick interval,
//! persists it, then hands it to the price pool. Transient feed errors are
//! normal and simply wait for the next tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::feeds::PriceFeed;
use crate::storage::Storage;
use crate::types::{AssetKey, RawPrice};

pub struct Scheduler {
    feeds: HashMap<String, Arc<dyn PriceFeed>>,
    storage: Arc<dyn Storage>,
    out: mpsc::Sender<RawPrice>,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn Storage>, out: mpsc::Sender<RawPrice>) -> Self {
        Self {
            feeds: HashMap::new(),
            storage,
            out,
        }
    }

    pub fn register_feed(&mut self, feed: Arc<dyn PriceFeed>) {
        self.feeds.insert(feed.name().to_string(), feed);
    }

    /// Spawn one tick task per (asset, feed) pair. Pairs referencing an
    /// unregistered feed are skipped: the asset simply does not support it.
    pub fn start(&self, cfg: &AppConfig, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for asset in &cfg.assets {
            let asset_key = AssetKey::from_identity(&asset.internal_identity);
            for feed_cfg in &asset.feeds {
                let Some(feed) = self.feeds.get(&feed_cfg.name) else {
                    warn!(feed = %feed_cfg.name, asset = %asset.name, "Unknown feed, skipping");
                    continue;
                };

                let task = FeedTask {
                    feed: Arc::clone(feed),
                    storage: Arc::clone(&self.storage),
                    out: self.out.clone(),
                    asset_name: asset.name.clone(),
                    asset_key,
                    internal_identity: asset.internal_identity.clone(),
                    feed_asset_id: feed_cfg.feed_asset_id.clone(),
                    interval: Duration::from_secs(feed_cfg.interval.max(1)),
                };
                handles.push(tokio::spawn(task.run(shutdown.clone())));
            }
        }
        info!(tasks = handles.len(), "Scheduler started");
        handles
    }
}

struct FeedTask {
    feed: Arc<dyn PriceFeed>,
    storage: Arc<dyn Storage>,
    out: mpsc::Sender<RawPrice>,
    asset_name: String,
    asset_key: AssetKey,
    internal_identity: String,
    feed_asset_id: String,
    interval: Duration,
}

impl FeedTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so feeds are not
        // hammered in a burst at startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let fetched = tokio::time::timeout(
            self.interval,
            self.feed
                .fetch_price(&self.feed_asset_id, &self.internal_identity),
        )
        .await;

        let mut price = match fetched {
            Ok(Ok(price)) => price,
            Ok(Err(e)) => {
                warn!(feed = %self.feed.name(), asset = %self.asset_name, error = %e,
                    "Fetch failed");
                return;
            }
            Err(_) => {
                warn!(feed = %self.feed.name(), asset = %self.asset_name,
                    "Fetch timed out");
                return;
            }
        };

        if price.asset_key.is_zero() {
            warn!(feed = %self.feed.name(), asset = %self.asset_name,
                "Fetched price carries no asset key, discarding");
            return;
        }

        if price.id.is_nil() {
            price.id = Uuid::new_v4();
        }
        price.source = self.feed.name().to_string();
        price.asset = self.asset_name.clone();
        price.asset_key = self.asset_key;
        price.request_fingerprint = format!("{}@{}", price.source, price.timestamp);

        // An unpersisted observation must never flow downstream: it could
        // end up referenced by a link row that resolves to nothing.
        if let Err(e) = self.storage.save_raw_price(&price).await {
            error!(feed = %self.feed.name(), asset = %self.asset_name, error = %e,
                "Failed to save raw price, dropping observation");
            return;
        }

        debug!(asset = %price.asset, value = price.value, source = %price.source,
            "Price fetched");
        if self.out.send(price).await.is_err() {
            warn!(feed = %self.feed.name(), "Pool channel closed, dropping observation");
        }
    }
}
