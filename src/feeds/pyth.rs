//! Pyth Hermes price feed
//!
//! Pulls the latest published price for a feed id from the Hermes REST API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{http_client, PriceFeed};
use crate::types::{AssetKey, RawPrice};

const HERMES_URL: &str = "https://hermes.pyth.network/v2/updates/price/latest";

pub struct PythFeed {
    client: reqwest::Client,
}

impl PythFeed {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PythResponse {
    parsed: Vec<PythEntry>,
}

#[derive(Debug, Deserialize)]
struct PythEntry {
    price: PythPrice,
}

#[derive(Debug, Deserialize)]
struct PythPrice {
    price: String,
    expo: i32,
    #[allow(dead_code)]
    publish_time: i64,
}

#[async_trait]
impl PriceFeed for PythFeed {
    fn name(&self) -> &'static str {
        "pyth"
    }

    async fn fetch_price(
        &self,
        feed_asset_id: &str,
        internal_identity: &str,
    ) -> Result<RawPrice> {
        let url = format!("{}?ids[]={}", HERMES_URL, feed_asset_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch from Hermes")?;

        if !response.status().is_success() {
            bail!("Hermes returned error: {}", response.status());
        }

        let parsed: PythResponse = response
            .json()
            .await
            .context("Failed to parse Hermes response")?;

        let entry = parsed
            .parsed
            .first()
            .context("Hermes response contained no parsed prices")?;

        let value: f64 = entry
            .price
            .price
            .parse()
            .context("Failed to parse Pyth price value")?;
        let expo = i8::try_from(entry.price.expo).context("Pyth exponent out of range")?;

        Ok(RawPrice {
            id: Uuid::new_v4(),
            source: self.name().to_string(),
            req_url: url,
            asset: feed_asset_id.to_string(),
            asset_key: AssetKey::from_identity(internal_identity),
            value,
            expo,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        })
    }
}
