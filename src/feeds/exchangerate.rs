//! ExchangeRate-API pair feed for fiat rates
//!
//! Quotes `<currency>/USD` through the keyed v6 pair endpoint.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use super::{http_client, PriceFeed};
use crate::types::{AssetKey, RawPrice};

pub struct ExchangeRateFeed {
    client: reqwest::Client,
    api_key: String,
}

impl ExchangeRateFeed {
    pub fn new(api_key: String) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            api_key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    result: String,
    #[serde(default)]
    conversion_rate: f64,
}

#[async_trait]
impl PriceFeed for ExchangeRateFeed {
    fn name(&self) -> &'static str {
        "exchangerate"
    }

    async fn fetch_price(
        &self,
        feed_asset_id: &str,
        internal_identity: &str,
    ) -> Result<RawPrice> {
        if self.api_key.is_empty() {
            bail!("No API key configured for exchangerate");
        }

        let url = format!(
            "https://v6.exchangerate-api.com/v6/{}/pair/{}/USD",
            self.api_key, feed_asset_id
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch from ExchangeRate-API")?;

        if !response.status().is_success() {
            bail!("ExchangeRate-API returned error: {}", response.status());
        }

        let pair: PairResponse = response
            .json()
            .await
            .context("Failed to parse ExchangeRate-API response")?;

        if pair.result != "success" {
            bail!("ExchangeRate-API returned result: {}", pair.result);
        }

        Ok(RawPrice {
            id: Uuid::new_v4(),
            source: self.name().to_string(),
            req_url: url,
            asset: feed_asset_id.to_string(),
            asset_key: AssetKey::from_identity(internal_identity),
            value: pair.conversion_rate,
            expo: 0,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        })
    }
}
