//! CoinGecko simple-price feed

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::{http_client, PriceFeed};
use crate::types::{AssetKey, RawPrice};

const COINGECKO_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

pub struct CoingeckoFeed {
    client: reqwest::Client,
}

impl CoingeckoFeed {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: http_client()?,
        })
    }
}

#[async_trait]
impl PriceFeed for CoingeckoFeed {
    fn name(&self) -> &'static str {
        "coingecko"
    }

    async fn fetch_price(
        &self,
        feed_asset_id: &str,
        internal_identity: &str,
    ) -> Result<RawPrice> {
        let coin_id = feed_asset_id.to_lowercase();
        let url = format!("{}?ids={}&vs_currencies=usd", COINGECKO_URL, coin_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch from CoinGecko")?;

        if !response.status().is_success() {
            bail!("CoinGecko API returned error: {}", response.status());
        }

        let body: HashMap<String, HashMap<String, Value>> = response
            .json()
            .await
            .context("Failed to parse CoinGecko response")?;

        let value = body
            .get(&coin_id)
            .and_then(|quotes| quotes.get("usd"))
            .and_then(Value::as_f64)
            .with_context(|| format!("No USD quote for {} in CoinGecko response", coin_id))?;

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
