//! Postgres/TimescaleDB storage backend
//!
//! The prices table is a hypertable partitioned on `timestamp`, which is why
//! its primary key is the composite `(id, timestamp)` and why the link table
//! carries the timestamp alongside the price id.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use super::{Storage, StorageError, StorageResult};
use crate::types::{
    AssetKey, Issuance, IssuanceId, IssuanceState, PriceAudit, PriceId, RawPrice, UnifiedPrice,
};

const SCHEMA: &[&str] = &[
    r#"CREATE EXTENSION IF NOT EXISTS "uuid-ossp""#,
    r#"CREATE TABLE IF NOT EXISTS prices (
        id UUID DEFAULT uuid_generate_v4(),
        asset TEXT NOT NULL DEFAULT '',
        asset_id TEXT NOT NULL,
        value FLOAT8 NOT NULL,
        expo SMALLINT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        source TEXT NOT NULL,
        req_hash TEXT,
        PRIMARY KEY (id, timestamp)
    )"#,
    r#"SELECT create_hypertable('prices', 'timestamp', if_not_exists => true, create_default_indexes => false)"#,
    r#"CREATE INDEX IF NOT EXISTS prices_id_idx ON prices(id)"#,
    r#"CREATE INDEX IF NOT EXISTS prices_asset_ts_idx ON prices(asset_id, timestamp DESC)"#,
    r#"CREATE TABLE IF NOT EXISTS raw_prices (
        id UUID PRIMARY KEY,
        source TEXT NOT NULL,
        req_url TEXT,
        asset TEXT NOT NULL DEFAULT '',
        asset_id TEXT NOT NULL,
        value FLOAT8 NOT NULL,
        expo SMALLINT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS price_raw_price_links (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        price_id UUID NOT NULL,
        price_timestamp TIMESTAMPTZ NOT NULL,
        raw_price_id UUID NOT NULL,
        UNIQUE (price_id, raw_price_id),
        FOREIGN KEY (price_id, price_timestamp) REFERENCES prices(id, timestamp) ON DELETE CASCADE,
        FOREIGN KEY (raw_price_id) REFERENCES raw_prices(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS issuances (
        id UUID PRIMARY KEY,
        state SMALLINT NOT NULL,
        issuer_address TEXT NOT NULL,
        round_id BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        price_id UUID NOT NULL,
        price_value FLOAT8 NOT NULL,
        price_asset_id TEXT NOT NULL,
        price_source TEXT NOT NULL,
        price_timestamp TIMESTAMPTZ NOT NULL,
        metadata JSONB
    )"#,
];

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect and ensure the schema exists.
    pub async fn connect(db_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await?;
        let storage = Self { pool };
        storage.initialize().await?;
        Ok(storage)
    }

    async fn initialize(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Database tables initialized");
        Ok(())
    }

    fn unified_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<UnifiedPrice> {
        let asset_id: String = row.try_get("asset_id")?;
        let asset_key =
            AssetKey::from_hex(&asset_id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let timestamp: DateTime<Utc> = row.try_get("timestamp")?;
        Ok(UnifiedPrice {
            id: row.try_get("id")?,
            source: row.try_get("source")?,
            req_url: String::new(),
            asset: row.try_get("asset")?,
            asset_key,
            value: row.try_get("value")?,
            expo: row.try_get::<i16, _>("expo")? as i8,
            timestamp,
            request_fingerprint: row.try_get::<Option<String>, _>("req_hash")?.unwrap_or_default(),
            is_aggregate: true,
            contributing_raw_ids: Vec::new(),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn save_raw_price(&self, price: &RawPrice) -> StorageResult<()> {
        sqlx::query(
            r#"INSERT INTO raw_prices (id, source, req_url, asset, asset_id, value, expo, timestamp)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(price.id)
        .bind(&price.source)
        .bind(&price.req_url)
        .bind(&price.asset)
        .bind(price.asset_key.to_hex())
        .bind(price.value)
        .bind(price.expo as i16)
        .bind(price.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_price(&self, price: &UnifiedPrice) -> StorageResult<()> {
        // Replayed issuance saves re-send the same aggregate row; the
        // composite key makes that a no-op instead of a PK violation.
        sqlx::query(
            r#"INSERT INTO prices (id, asset, asset_id, value, expo, timestamp, source, req_hash)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               ON CONFLICT (id, timestamp) DO NOTHING"#,
        )
        .bind(price.id)
        .bind(&price.asset)
        .bind(price.asset_key.to_hex())
        .bind(price.value)
        .bind(price.expo as i16)
        .bind(price.timestamp)
        .bind(&price.source)
        .bind(&price.request_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_issuance(&self, issuance: &Issuance) -> StorageResult<()> {
        if issuance.state == IssuanceState::Approved {
            self.save_price(&issuance.price).await?;
        }

        let metadata = serde_json::to_value(&issuance.metadata)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO issuances (
                   id, state, issuer_address, round_id, created_at, updated_at,
                   price_id, price_value, price_asset_id, price_source, price_timestamp,
                   metadata
               ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (id) DO UPDATE SET
                   state = EXCLUDED.state,
                   updated_at = EXCLUDED.updated_at,
                   metadata = EXCLUDED.metadata"#,
        )
        .bind(issuance.id)
        .bind(issuance.state.as_i16())
        .bind(&issuance.issuer_address)
        .bind(issuance.round_id as i64)
        .bind(issuance.created_at)
        .bind(issuance.updated_at)
        .bind(issuance.price.id)
        .bind(issuance.price.scaled())
        .bind(issuance.price.asset_key.to_hex())
        .bind(&issuance.price.source)
        .bind(issuance.price.timestamp)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_issuance(&self, id: IssuanceId) -> StorageResult<Issuance> {
        let row = sqlx::query(
            r#"SELECT id, state, issuer_address, round_id, created_at, updated_at,
                      price_id, price_value, price_asset_id, price_source, price_timestamp,
                      metadata
               FROM issuances WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        let state = IssuanceState::from_i16(row.try_get("state")?)
            .ok_or_else(|| StorageError::Corrupt("unknown issuance state".to_string()))?;
        let asset_id: String = row.try_get("price_asset_id")?;
        let asset_key =
            AssetKey::from_hex(&asset_id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let metadata: Vec<PriceId> = row
            .try_get::<Option<serde_json::Value>, _>("metadata")?
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StorageError::Corrupt(e.to_string()))?
            .unwrap_or_default();

        // The issuance row is denormalized; the reconstructed price carries
        // the scaled value with a zero exponent.
        let price = UnifiedPrice {
            id: row.try_get("price_id")?,
            source: row.try_get("price_source")?,
            req_url: String::new(),
            asset: String::new(),
            asset_key,
            value: row.try_get("price_value")?,
            expo: 0,
            timestamp: row.try_get("price_timestamp")?,
            request_fingerprint: String::new(),
            is_aggregate: true,
            contributing_raw_ids: metadata.clone(),
        };

        Ok(Issuance {
            id: row.try_get("id")?,
            state,
            price,
            round_id: row.try_get::<i64, _>("round_id")? as u64,
            issuer_address: row.try_get("issuer_address")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            metadata,
        })
    }

    async fn link_raw_to_aggregated(
        &self,
        price_id: PriceId,
        price_timestamp: DateTime<Utc>,
        raw_price_ids: &[PriceId],
    ) -> StorageResult<()> {
        let exists = sqlx::query(r#"SELECT 1 FROM prices WHERE id = $1 AND timestamp = $2"#)
            .bind(price_id)
            .bind(price_timestamp)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            warn!(price_id = %price_id, "Linking against a price row that is not persisted");
        }

        for raw_id in raw_price_ids.iter().filter(|id| !id.is_nil()) {
            sqlx::query(
                r#"INSERT INTO price_raw_price_links (price_id, price_timestamp, raw_price_id)
                   VALUES ($1, $2, $3)
                   ON CONFLICT (price_id, raw_price_id) DO NOTHING"#,
            )
            .bind(price_id)
            .bind(price_timestamp)
            .bind(raw_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn get_last_price(&self, asset_key: &AssetKey) -> StorageResult<UnifiedPrice> {
        let row = sqlx::query(
            r#"SELECT id, asset, asset_id, value, expo, timestamp, source, req_hash
               FROM prices
               WHERE asset_id = $1
               ORDER BY timestamp DESC
               LIMIT 1"#,
        )
        .bind(asset_key.to_hex())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        Self::unified_from_row(&row)
    }

    async fn get_historical_price(
        &self,
        asset_key: &AssetKey,
        lookback: Duration,
    ) -> StorageResult<UnifiedPrice> {
        let cutoff = Utc::now() - lookback;
        let row = sqlx::query(
            r#"SELECT id, asset, asset_id, value, expo, timestamp, source, req_hash
               FROM prices
               WHERE asset_id = $1 AND timestamp <= $2
               ORDER BY timestamp DESC
               LIMIT 1"#,
        )
        .bind(asset_key.to_hex())
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        Self::unified_from_row(&row)
    }

    async fn audit_price(&self, price_id: PriceId) -> StorageResult<PriceAudit> {
        let row = sqlx::query(
            r#"SELECT id, asset, asset_id, value, expo, timestamp, source, req_hash
               FROM prices
               WHERE id = $1
               ORDER BY timestamp DESC
               LIMIT 1"#,
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StorageError::NotFound)?;

        let aggregated = Self::unified_from_row(&row)?;

        let raw_rows = sqlx::query(
            r#"SELECT r.id, r.source, r.req_url, r.asset, r.asset_id, r.value, r.expo, r.timestamp
               FROM price_raw_price_links l
               INNER JOIN raw_prices r ON r.id = l.raw_price_id
               WHERE l.price_id = $1
               ORDER BY r.timestamp"#,
        )
        .bind(price_id)
        .fetch_all(&self.pool)
        .await?;

        let mut raw_prices = Vec::with_capacity(raw_rows.len());
        for raw in &raw_rows {
            let asset_id: String = raw.try_get("asset_id")?;
            let asset_key =
                AssetKey::from_hex(&asset_id).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let source: String = raw.try_get("source")?;
            let timestamp: DateTime<Utc> = raw.try_get("timestamp")?;
            raw_prices.push(RawPrice {
                id: raw.try_get("id")?,
                source: source.clone(),
                req_url: raw.try_get::<Option<String>, _>("req_url")?.unwrap_or_default(),
                asset: raw.try_get("asset")?,
                asset_key,
                value: raw.try_get("value")?,
                expo: raw.try_get::<i16, _>("expo")? as i8,
                timestamp,
                request_fingerprint: format!("{}@{}", source, timestamp),
            });
        }

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
