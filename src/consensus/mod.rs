//! Consensus stage - validates aggregates against recent history
//!
//! For each incoming aggregate, recent history is fetched and a weighted
//! vote classifies the price as approved or denied. The resulting issuance
//! is persisted together with its raw->aggregate links, then published to
//! the read-side fan-out and handed to the dispatcher. The dispatcher is
//! reached through an injected sink so the two stages stay decoupled.

pub mod weighted;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::IssuanceSink;
use crate::storage::{Storage, StorageError};
use crate::types::{Issuance, IssuanceState, UnifiedPrice};

pub struct Consensus {
    storage: Arc<dyn Storage>,
    sink: Arc<dyn IssuanceSink>,
    fanout: mpsc::Sender<Issuance>,
}

impl Consensus {
    pub fn new(
        storage: Arc<dyn Storage>,
        sink: Arc<dyn IssuanceSink>,
        fanout: mpsc::Sender<Issuance>,
    ) -> Self {
        Self {
            storage,
            sink,
            fanout,
        }
    }

    /// Drain the aggregator fan-in until shutdown.
    pub async fn run(
        self,
        mut incoming: mpsc::Receiver<UnifiedPrice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                price = incoming.recv() => {
                    let Some(price) = price else { return };
                    self.process(price).await;
                }
            }
        }
    }

    pub async fn process(&self, price: UnifiedPrice) {
        if price.asset_key.is_zero() {
            return;
        }

        // History window is currently the single last price. A missing or
        // unreadable history must not stall the pipeline: the incoming
        // aggregate then serves as its own history.
        let history = match self.storage.get_last_price(&price.asset_key).await {
            Ok(last) => vec![last],
            Err(StorageError::NotFound) => vec![price.clone()],
            Err(e) => {
                warn!(key = %price.asset_key, error = %e,
                    "History fetch failed, using the aggregate as its own history");
                vec![price.clone()]
            }
        };

        let issuance = weighted::calculate_weighted_average_price(
            Uuid::new_v4(),
            price,
            history,
            Utc::now(),
        );
        info!(
            key = %issuance.price.asset_key,
            state = %issuance.state,
            value = issuance.price.scaled(),
            "Issuance decided"
        );

        if let Err(e) = self.storage.save_issuance(&issuance).await {
            // Best effort: the issuance still flows downstream so the
            // pipeline keeps moving, at the cost of a gap in history.
            error!(issuance = %issuance.id, error = %e, "Failed to persist issuance");
        } else if issuance.state == IssuanceState::Approved {
            if let Err(e) = self
                .storage
                .link_raw_to_aggregated(
                    issuance.price.id,
                    issuance.price.timestamp,
                    &issuance.price.contributing_raw_ids,
                )
                .await
            {
                error!(issuance = %issuance.id, error = %e, "Failed to link raw prices");
            }
        }

        // SSE readers may be slow; dropping the newest update is preferable
        // to blocking consensus.
        if self.fanout.try_send(issuance.clone()).is_err() {
            debug!("Stream fan-out full, skipping update");
        }

        if let Err(e) = self.sink.accept_issuance(issuance).await {
            warn!(error = %e, "Dispatcher rejected issuance");
        }
    }
}
