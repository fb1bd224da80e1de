//! Dispatcher - relays approved issuances to configured ledgers
//!
//! One worker per configured asset drains an unbuffered handoff channel and
//! fans each approved issuance out to every ledger target concurrently.
//! Per-target failures are logged and never halt the worker; submission is
//! fire-and-forget with no on-chain confirmation tracking.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ethers::prelude::*;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{AppConfig, ContractConfig};
use crate::types::{AssetKey, Issuance, IssuanceState};

abigen!(
    PriceFeedVerifier,
    r#"[
        struct PriceFeed { int256 price; int8 decimal; uint64 lastUpdateTime; }
        function submitPriceFeed(bytes32[] _assetindex, PriceFeed[] _prices)
    ]"#
);

/// Gas limit for a single-entry price feed submission.
const SUBMIT_GAS_LIMIT: u64 = 300_000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no dispatch worker for asset key {0}")]
    NoRoute(AssetKey),

    #[error("dispatch worker for asset key {0} has exited")]
    WorkerGone(AssetKey),
}

/// Capability consensus uses to hand issuances over without importing the
/// dispatcher itself.
#[async_trait]
pub trait IssuanceSink: Send + Sync {
    async fn accept_issuance(&self, issuance: Issuance) -> Result<(), DispatchError>;
}

struct DispatchContext {
    contracts: Vec<ContractConfig>,
    private_key: String,
    fallback_rpc_url: String,
}

pub struct Dispatcher {
    routes: HashMap<AssetKey, mpsc::Sender<Issuance>>,
}

impl Dispatcher {
    /// Spawn one worker per configured asset. The routing map is written
    /// here once and read-only afterwards.
    pub fn spawn(
        cfg: &AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let ctx = Arc::new(DispatchContext {
            contracts: cfg.contracts.clone(),
            private_key: cfg.private_key.clone(),
            fallback_rpc_url: cfg.fallback_rpc_url.clone(),
        });

        let mut routes = HashMap::new();
        let mut handles = Vec::new();
        for asset in &cfg.assets {
            let asset_key = AssetKey::from_identity(&asset.internal_identity);
            let (tx, rx) = mpsc::channel(1);
            routes.insert(asset_key, tx);
            handles.push(tokio::spawn(run_worker(
                asset_key,
                Arc::clone(&ctx),
                rx,
                shutdown.clone(),
            )));
        }
        info!(workers = handles.len(), "Dispatcher started");

        (Arc::new(Self { routes }), handles)
    }
}

#[async_trait]
impl IssuanceSink for Dispatcher {
    async fn accept_issuance(&self, issuance: Issuance) -> Result<(), DispatchError> {
        let key = issuance.asset_key();
        let worker = self.routes.get(&key).ok_or(DispatchError::NoRoute(key))?;
        worker
            .send(issuance)
            .await
            .map_err(|_| DispatchError::WorkerGone(key))
    }
}

async fn run_worker(
    asset_key: AssetKey,
    ctx: Arc<DispatchContext>,
    mut incoming: mpsc::Receiver<Issuance>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let issuance = tokio::select! {
            _ = shutdown.changed() => return,
            issuance = incoming.recv() => {
                let Some(issuance) = issuance else { return };
                issuance
            }
        };

        if issuance.state != IssuanceState::Approved {
            debug!(key = %asset_key, state = %issuance.state, "Skipping non-approved issuance");
            continue;
        }

        let submissions = ctx
            .contracts
            .iter()
            .map(|target| convey_to_target(&issuance, target, &ctx));
        for (target, result) in ctx.contracts.iter().zip(futures::future::join_all(submissions).await)
        {
            if let Err(e) = result {
                error!(
                    key = %asset_key,
                    chain = %target.chain_name,
                    contract = %target.address,
                    error = %e,
                    "Dispatch failed"
                );
            }
        }
    }
}

/// Submit one issuance to one ledger target as a single-entry batch.
async fn convey_to_target(
    issuance: &Issuance,
    target: &ContractConfig,
    ctx: &DispatchContext,
) -> Result<()> {
    let rpc_url = if target.rpc_url.is_empty() {
        ctx.fallback_rpc_url.as_str()
    } else {
        target.rpc_url.as_str()
    };
    if rpc_url.is_empty() {
        bail!("No RPC endpoint configured for {}", target.chain_name);
    }

    let provider =
        Provider::<Http>::try_from(rpc_url).context("Failed to create RPC provider")?;
    let wallet: LocalWallet = ctx
        .private_key
        .trim_start_matches("0x")
        .parse()
        .context("Failed to load signing key")?;
    let wallet = wallet.with_chain_id(target.chain_id);
    let sender = wallet.address();

    // Nonce is re-read per submission; concurrent targets tolerate this,
    // concurrent issuances for the same sender and target may misorder.
    let nonce = provider
        .get_transaction_count(sender, Some(BlockNumber::Pending.into()))
        .await
        .context("Failed to get pending nonce")?;
    let gas_price = provider
        .get_gas_price()
        .await
        .context("Failed to get gas price")?;

    let address: Address = target
        .address
        .parse()
        .with_context(|| format!("Invalid contract address {}", target.address))?;
    let client = Arc::new(SignerMiddleware::new(provider, wallet));
    let contract = PriceFeedVerifier::new(address, client);

    let feed = PriceFeed {
        price: price_to_int(issuance.price.value)?,
        decimal: issuance.price.expo,
        last_update_time: issuance.price.timestamp.timestamp() as u64,
    };

    let call = contract
        .submit_price_feed(vec![issuance.asset_key().as_bytes()], vec![feed])
        .nonce(nonce)
        .gas_price(gas_price)
        .gas(SUBMIT_GAS_LIMIT);
    let pending = call.send().await.context("Failed to submit price feed")?;

    info!(
        tx = %pending.tx_hash(),
        chain = %target.chain_name,
        key = %issuance.asset_key(),
        "Submitted price feed"
    );
    Ok(())
}

/// Truncate the stored float toward zero to the integer the contract
/// expects.
fn price_to_int(value: f64) -> Result<I256> {
    if !value.is_finite() {
        bail!("Price value is not finite");
    }
    I256::from_dec_str(&format!("{:.0}", value.trunc()))
        .context("Price value out of int256 range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssetConfig, FeedConfig};
    use crate::types::{UnifiedPrice, TARGET_EXPO};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> AppConfig {
        AppConfig {
            price_pool_ttl: 10,
            aggregator_nodes: 3,
            aggr_dev_perc: 0.1,
            consensus_threshold: 0.01,
            relay_time_threshold: 30,
            assets: vec![AssetConfig {
                name: "BTC/USD".to_string(),
                internal_identity: "BTC/USD".to_string(),
                feeds: vec![FeedConfig {
                    name: "pyth".to_string(),
                    interval: 5,
                    feed_asset_id: "0xdead".to_string(),
                }],
            }],
            contracts: Vec::new(),
            api_keys: std::collections::HashMap::new(),
            private_key: String::new(),
            db_url: String::new(),
            server_port: 8000,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            fallback_rpc_url: String::new(),
        }
    }

    fn issuance(asset_key: AssetKey) -> Issuance {
        let price = UnifiedPrice {
            id: Uuid::new_v4(),
            source: "engine".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key,
            value: 100.0,
            expo: TARGET_EXPO,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
            is_aggregate: true,
            contributing_raw_ids: Vec::new(),
        };
        Issuance {
            id: Uuid::new_v4(),
            state: IssuanceState::Approved,
            round_id: 0,
            issuer_address: String::new(),
            created_at: price.timestamp,
            updated_at: price.timestamp,
            metadata: Vec::new(),
            price,
        }
    }

    #[tokio::test]
    async fn known_asset_key_is_accepted() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, _handles) = Dispatcher::spawn(&config(), shutdown_rx);

        let key = AssetKey::from_identity("BTC/USD");
        assert!(dispatcher.accept_issuance(issuance(key)).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_asset_key_is_a_route_miss() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, _handles) = Dispatcher::spawn(&config(), shutdown_rx);

        let stray = AssetKey::from_identity("UNKNOWN/PAIR");
        let err = dispatcher
            .accept_issuance(issuance(stray))
            .await
            .expect_err("route miss expected");
        assert!(matches!(err, DispatchError::NoRoute(k) if k == stray));
    }

    #[test]
    fn price_to_int_truncates_large_scaled_values() {
        // 100 at expo -18 is stored as 1e20
        let value = 100.0 * 1e18;
        let int = price_to_int(value).unwrap();
        assert_eq!(int.to_string(), "100000000000000000000");
        assert!(price_to_int(f64::NAN).is_err());
    }

    #[test]
    fn price_to_int_drops_the_fractional_part_instead_of_rounding() {
        assert_eq!(price_to_int(123.7).unwrap().to_string(), "123");
        assert_eq!(price_to_int(0.9).unwrap().to_string(), "0");
    }
}
