//! Persistent storage for the price time-series and the audit trail

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::types::{AssetKey, Issuance, IssuanceId, PriceAudit, PriceId, RawPrice, UnifiedPrice};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Contract every storage backend implements.
///
/// The prices table is time-partitioned, so aggregated prices are addressed
/// by the composite `(id, timestamp)` pair wherever a single partition must
/// be resolved (the link table's foreign key depends on this).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a raw observation. Ids are globally unique; replaying an id
    /// is rejected by the primary key.
    async fn save_raw_price(&self, price: &RawPrice) -> StorageResult<()>;

    /// Persist an aggregated price row. Used for approved aggregates only.
    async fn save_price(&self, price: &UnifiedPrice) -> StorageResult<()>;

    /// Persist an issuance. Idempotent by id: conflicts update state,
    /// updated_at and metadata, preserving created_at. Approved issuances
    /// also persist their aggregate row.
    async fn save_issuance(&self, issuance: &Issuance) -> StorageResult<()>;

    async fn get_issuance(&self, id: IssuanceId) -> StorageResult<Issuance>;

    /// Record raw -> aggregated links. Empty raw ids are skipped; replays
    /// of the same tuple are no-ops.
    async fn link_raw_to_aggregated(
        &self,
        price_id: PriceId,
        price_timestamp: DateTime<Utc>,
        raw_price_ids: &[PriceId],
    ) -> StorageResult<()>;

    async fn get_last_price(&self, asset_key: &AssetKey) -> StorageResult<UnifiedPrice>;

    /// Latest price at least `lookback` old.
    async fn get_historical_price(
        &self,
        asset_key: &AssetKey,
        lookback: Duration,
    ) -> StorageResult<UnifiedPrice>;

    /// Read an emitted price back together with every linked raw observation.
    async fn audit_price(&self, price_id: PriceId) -> StorageResult<PriceAudit>;
}
