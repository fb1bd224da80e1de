//! Feed adapter implementations (Pyth, Binance, CoinGecko, ExchangeRate)

mod binance;
mod coingecko;
mod exchangerate;
mod pyth;

pub use binance::BinanceFeed;
pub use coingecko::CoingeckoFeed;
pub use exchangerate::ExchangeRateFeed;
pub use pyth::PythFeed;

use crate::types::RawPrice;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Trait every external price feed implements.
///
/// `feed_asset_id` is the asset's id in the feed's own namespace (exchange
/// symbol, Pyth feed id, currency code); `internal_identity` is the string
/// the stable asset key is derived from. Adapters return the observation as
/// fetched; the scheduler stamps source name, display name and id.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Get the feed name
    fn name(&self) -> &'static str;

    /// Fetch a single observation for the given feed-local asset id
    async fn fetch_price(&self, feed_asset_id: &str, internal_identity: &str)
        -> Result<RawPrice>;
}

/// Shared HTTP client with the timeout all adapters use.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create HTTP client")
}
