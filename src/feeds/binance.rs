//! Binance spot ticker feed

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{http_client, PriceFeed};
use crate::types::{AssetKey, RawPrice};

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3/ticker/price";

pub struct BinanceFeed {
    client: reqwest::Client,
}

impl BinanceFeed {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TickerResponse {
    #[allow(dead_code)]
    symbol: String,
    price: String,
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn name(&self) -> &'static str {
        "binance"
    }

    async fn fetch_price(
        &self,
        feed_asset_id: &str,
        internal_identity: &str,
    ) -> Result<RawPrice> {
        let symbol = feed_asset_id.to_uppercase();
        let url = format!("{}?symbol={}", BINANCE_REST_URL, symbol);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch ticker from Binance")?;

        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        let ticker: TickerResponse = response
            .json()
            .await
            .context("Failed to parse Binance ticker response")?;

        let value: f64 = ticker
            .price
            .parse()
            .context("Failed to parse Binance price value")?;

        Ok(RawPrice {
            id: Uuid::new_v4(),
            source: self.name().to_string(),
            req_url: url,
            asset: feed_asset_id.to_string(),
            asset_key: AssetKey::from_identity(internal_identity),
            value,
            expo: 0,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        })
    }
}
