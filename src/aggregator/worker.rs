//! Per-asset aggregation worker
//!
//! Each worker owns a sliding buffer of unified prices. Once the buffer
//! fills, a snapshot is handed to a spawned batch computation while the
//! worker keeps receiving, so intake order per asset is preserved even
//! though batch results may complete out of order.

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

use crate::types::{PriceId, UnifiedPrice};

/// Batch size that triggers aggregation.
pub const BUFFER_MAX_SIZE: usize = 10;

/// Source name stamped onto engine-produced aggregates.
pub const ENGINE_SOURCE: &str = "engine";

pub(super) struct AggregatorWorker {
    dev_perc: f64,
    buffer: Vec<UnifiedPrice>,
    out: mpsc::Sender<UnifiedPrice>,
}

impl AggregatorWorker {
    pub(super) fn new(dev_perc: f64, out: mpsc::Sender<UnifiedPrice>) -> Self {
        Self {
            dev_perc,
            buffer: Vec::with_capacity(BUFFER_MAX_SIZE),
            out,
        }
    }

    pub(super) async fn run(
        mut self,
        mut incoming: mpsc::Receiver<UnifiedPrice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batches = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                price = incoming.recv() => {
                    let Some(price) = price else { break };
                    self.ingest(price, &mut batches);
                }
            }
        }

        // In-flight batches still emit their aggregate before the worker
        // exits, so shutdown never truncates a full buffer mid-computation.
        while batches.join_next().await.is_some() {}
    }

    fn ingest(&mut self, price: UnifiedPrice, batches: &mut JoinSet<()>) {
        self.buffer.push(price);
        if self.buffer.len() < BUFFER_MAX_SIZE {
            return;
        }

        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(BUFFER_MAX_SIZE));
        let out = self.out.clone();
        let dev_perc = self.dev_perc;
        batches.spawn(async move {
            let aggregate = compute_batch_average(&batch, dev_perc);
            debug!(
                asset = %aggregate.asset,
                value = aggregate.scaled(),
                contributing = aggregate.contributing_raw_ids.len(),
                "Batch aggregated"
            );
            let _ = out.send(aggregate).await;
        });
    }
}

/// Reduce a full batch into one aggregate.
///
/// The preliminary average is the midpoint of the first and last values;
/// prices deviating from it by more than `dev_perc` are excluded from the
/// sum and from the contributing ids. The divisor stays the full batch size
/// regardless of how many survive the filter.
pub fn compute_batch_average(batch: &[UnifiedPrice], dev_perc: f64) -> UnifiedPrice {
    let first = batch.first().expect("batch is never empty");
    let last = batch.last().expect("batch is never empty");
    let preliminary = (first.value + last.value) / 2.0;

    let mut sum = 0.0;
    let mut contributing: Vec<PriceId> = Vec::new();
    for price in batch {
        if ((price.value - preliminary) / preliminary).abs() <= dev_perc && !price.id.is_nil() {
            sum += price.value;
            contributing.push(price.id);
        }
    }

    let average = sum / batch.len() as f64;

    UnifiedPrice {
        id: Uuid::new_v4(),
        source: ENGINE_SOURCE.to_string(),
        req_url: String::new(),
        asset: first.asset.clone(),
        asset_key: first.asset_key,
        value: average,
        expo: first.expo,
        timestamp: Utc::now(),
        request_fingerprint: format!("{}@{}", ENGINE_SOURCE, Utc::now()),
        is_aggregate: true,
        contributing_raw_ids: contributing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetKey, TARGET_EXPO};

    fn unified(value: f64) -> UnifiedPrice {
        UnifiedPrice {
            id: Uuid::new_v4(),
            source: "pyth".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key: AssetKey::from_identity("BTC/USD"),
            value,
            expo: TARGET_EXPO,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
            is_aggregate: false,
            contributing_raw_ids: Vec::new(),
        }
    }

    #[test]
    fn uniform_batch_averages_to_itself() {
        let batch: Vec<_> = (0..BUFFER_MAX_SIZE).map(|_| unified(100.0)).collect();
        let aggregate = compute_batch_average(&batch, 0.1);

        assert_eq!(aggregate.value, 100.0);
        assert_eq!(aggregate.source, ENGINE_SOURCE);
        assert!(aggregate.is_aggregate);
        assert_eq!(aggregate.contributing_raw_ids.len(), BUFFER_MAX_SIZE);
    }

    #[test]
    fn split_batch_filters_against_the_midpoint() {
        // Midpoint of first=100 and last=200 is 150; both halves deviate by
        // a third, so every price is filtered and the sum stays zero.
        let mut values = vec![100.0; 5];
        values.extend(vec![200.0; 5]);
        let batch: Vec<_> = values.into_iter().map(unified).collect();

        let aggregate = compute_batch_average(&batch, 0.1);
        assert_eq!(aggregate.value, 0.0);
        assert!(aggregate.contributing_raw_ids.is_empty());
    }

    #[test]
    fn survivors_divide_by_the_full_batch_size() {
        // first=100, last=100 -> midpoint 100. The two 150s fall outside
        // the 10% band; the eight survivors sum to 800 but divide by 10.
        let values = [100.0, 100.0, 150.0, 100.0, 100.0, 100.0, 150.0, 100.0, 100.0, 100.0];
        let batch: Vec<_> = values.into_iter().map(unified).collect();

        let aggregate = compute_batch_average(&batch, 0.1);
        assert_eq!(aggregate.contributing_raw_ids.len(), 8);
        assert_eq!(aggregate.value, 800.0 / 10.0);
    }

    #[test]
    fn aggregate_value_stays_within_batch_bounds_for_surviving_inputs() {
        let values = [100.0, 101.0, 99.0, 100.5, 99.5, 100.2, 99.8, 101.0, 99.0, 100.0];
        let batch: Vec<_> = values.iter().copied().map(unified).collect();

        let aggregate = compute_batch_average(&batch, 0.1);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(aggregate.contributing_raw_ids.len(), values.len());
        assert!(aggregate.value >= min && aggregate.value <= max);
    }

    #[test]
    fn nil_ids_are_excluded_from_contributions() {
        let mut batch: Vec<_> = (0..BUFFER_MAX_SIZE).map(|_| unified(100.0)).collect();
        batch[3].id = Uuid::nil();

        let aggregate = compute_batch_average(&batch, 0.1);
        assert_eq!(aggregate.contributing_raw_ids.len(), BUFFER_MAX_SIZE - 1);
    }

    #[tokio::test]
    async fn nine_prices_do_not_emit_ten_do() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = AggregatorWorker::new(0.1, out_tx);
        let handle = tokio::spawn(worker.run(in_rx, shutdown_rx));

        for _ in 0..9 {
            in_tx.send(unified(100.0)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(out_rx.try_recv().is_err());

        in_tx.send(unified(100.0)).await.unwrap();
        let aggregate = tokio::time::timeout(std::time::Duration::from_secs(1), out_rx.recv())
            .await
            .expect("aggregate should be emitted")
            .expect("channel open");
        assert_eq!(aggregate.value, 100.0);

        drop(in_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_batches() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let (in_tx, in_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = AggregatorWorker::new(0.1, out_tx);
        let handle = tokio::spawn(worker.run(in_rx, shutdown_rx));

        for _ in 0..BUFFER_MAX_SIZE {
            in_tx.send(unified(100.0)).await.unwrap();
        }
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let aggregate = out_rx.recv().await.expect("batch completed before exit");
        assert_eq!(aggregate.value, 100.0);
    }
}
