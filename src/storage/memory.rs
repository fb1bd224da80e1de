//! In-memory storage backend
//!
//! Mirrors the Postgres contract (upsert semantics, link idempotence,
//! composite price addressing) without a database. Used by the test suite
//! and handy for local pipeline runs.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

use super::{Storage, StorageError, StorageResult};
use crate::types::{
    AssetKey, Issuance, IssuanceId, IssuanceState, PriceAudit, PriceId, RawPrice, UnifiedPrice,
};

#[derive(Default)]
struct Tables {
    raw_prices: HashMap<PriceId, RawPrice>,
    prices: Vec<UnifiedPrice>,
    issuances: HashMap<IssuanceId, Issuance>,
    links: BTreeSet<(PriceId, PriceId)>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of link rows, for assertions on idempotence.
    pub async fn link_count(&self) -> usize {
        self.tables.lock().await.links.len()
    }

    /// Number of persisted aggregate rows.
    pub async fn price_count(&self) -> usize {
        self.tables.lock().await.prices.len()
    }

    /// Number of persisted raw rows.
    pub async fn raw_price_count(&self) -> usize {
        self.tables.lock().await.raw_prices.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_raw_price(&self, price: &RawPrice) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        if tables.raw_prices.contains_key(&price.id) {
            return Err(StorageError::Corrupt(format!(
                "duplicate raw price id {}",
                price.id
            )));
        }
        tables.raw_prices.insert(price.id, price.clone());
        Ok(())
    }

    async fn save_price(&self, price: &UnifiedPrice) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        // Same conflict rule as the prices table's composite primary key.
        if tables
            .prices
            .iter()
            .any(|p| p.id == price.id && p.timestamp == price.timestamp)
        {
            return Ok(());
        }
        tables.prices.push(price.clone());
        Ok(())
    }

    async fn save_issuance(&self, issuance: &Issuance) -> StorageResult<()> {
        if issuance.state == IssuanceState::Approved {
            self.save_price(&issuance.price).await?;
        }
        let mut tables = self.tables.lock().await;
        match tables.issuances.get_mut(&issuance.id) {
            Some(existing) => {
                existing.state = issuance.state;
                existing.updated_at = issuance.updated_at;
                existing.metadata = issuance.metadata.clone();
            }
            None => {
                tables.issuances.insert(issuance.id, issuance.clone());
            }
        }
        Ok(())
    }

    async fn get_issuance(&self, id: IssuanceId) -> StorageResult<Issuance> {
        self.tables
            .lock()
            .await
            .issuances
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn link_raw_to_aggregated(
        &self,
        price_id: PriceId,
        _price_timestamp: DateTime<Utc>,
        raw_price_ids: &[PriceId],
    ) -> StorageResult<()> {
        let mut tables = self.tables.lock().await;
        for raw_id in raw_price_ids.iter().filter(|id| !id.is_nil()) {
            tables.links.insert((price_id, *raw_id));
        }
        Ok(())
    }

    async fn get_last_price(&self, asset_key: &AssetKey) -> StorageResult<UnifiedPrice> {
        self.tables
            .lock()
            .await
            .prices
            .iter()
            .filter(|p| p.asset_key == *asset_key)
            .max_by_key(|p| p.timestamp)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_historical_price(
        &self,
        asset_key: &AssetKey,
        lookback: Duration,
    ) -> StorageResult<UnifiedPrice> {
        let cutoff = Utc::now() - lookback;
        self.tables
            .lock()
            .await
            .prices
            .iter()
            .filter(|p| p.asset_key == *asset_key && p.timestamp <= cutoff)
            .max_by_key(|p| p.timestamp)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn audit_price(&self, price_id: PriceId) -> StorageResult<PriceAudit> {
        let tables = self.tables.lock().await;
        let aggregated = tables
            .prices
            .iter()
            .filter(|p| p.id == price_id)
            .max_by_key(|p| p.timestamp)
            .cloned()
            .ok_or(StorageError::NotFound)?;

        let mut raw_prices: Vec<RawPrice> = tables
            .links
            .iter()
            .filter(|(pid, _)| *pid == price_id)
            .filter_map(|(_, rid)| tables.raw_prices.get(rid).cloned())
            .collect();
        raw_prices.sort_by_key(|r| r.timestamp);

        Ok(PriceAudit {
            price_id: aggregated.id,
            asset_key: aggregated.asset_key,
            created_at: aggregated.timestamp,
            updated_at: aggregated.timestamp,
            aggregated_price: aggregated,
            raw_prices,
        })
    }
}
