//! Key-value staging store for recently observed raw prices
//!
//! Prices are staged per asset under `pricepool:<asset-name>` with a TTL, so
//! the periodic outlier sweep always works on a bounded, recent window.

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::types::RawPrice;

fn staging_key(asset: &str) -> String {
    format!("pricepool:{}", asset)
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Append one price to the asset's staged list, refreshing the TTL.
    async fn append(&self, asset: &str, price: &RawPrice, ttl: Duration) -> Result<()>;

    /// Read the asset's staged list; malformed entries are skipped.
    async fn read_all(&self, asset: &str) -> Result<Vec<RawPrice>>;

    /// Replace the asset's staged list wholesale, refreshing the TTL.
    async fn replace(&self, asset: &str, prices: &[RawPrice], ttl: Duration) -> Result<()>;
}

/// Redis-backed staging store.
pub struct RedisStaging {
    conn: redis::aio::ConnectionManager,
}

impl RedisStaging {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StagingStore for RedisStaging {
    async fn append(&self, asset: &str, price: &RawPrice, ttl: Duration) -> Result<()> {
        let key = staging_key(asset);
        let payload = serde_json::to_string(price).context("Failed to serialize price")?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&key, payload).await?;
        let _: () = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn read_all(&self, asset: &str) -> Result<Vec<RawPrice>> {
        let key = staging_key(asset);
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(&key, 0, -1).await?;
        Ok(entries
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn replace(&self, asset: &str, prices: &[RawPrice], ttl: Duration) -> Result<()> {
        let key = staging_key(asset);
        let mut conn = self.conn.clone();
        let _: () = conn.del(&key).await?;
        for price in prices {
            let payload = serde_json::to_string(price).context("Failed to serialize price")?;
            let _: () = conn.rpush(&key, payload).await?;
        }
        let _: () = conn.expire(&key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}

/// In-memory staging store for tests and local runs. TTLs are ignored.
#[derive(Default)]
pub struct MemoryStaging {
    lists: Mutex<HashMap<String, Vec<RawPrice>>>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for MemoryStaging {
    async fn append(&self, asset: &str, price: &RawPrice, _ttl: Duration) -> Result<()> {
        self.lists
            .lock()
            .await
            .entry(staging_key(asset))
            .or_default()
            .push(price.clone());
        Ok(())
    }

    async fn read_all(&self, asset: &str) -> Result<Vec<RawPrice>> {
        Ok(self
            .lists
            .lock()
            .await
            .get(&staging_key(asset))
            .cloned()
            .unwrap_or_default())
    }

    async fn replace(&self, asset: &str, prices: &[RawPrice], _ttl: Duration) -> Result<()> {
        self.lists
            .lock()
            .await
            .insert(staging_key(asset), prices.to_vec());
        Ok(())
    }
}
