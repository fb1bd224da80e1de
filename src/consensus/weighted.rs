//! Weighted-average vote over an aggregate and its recent history
//!
//! The incoming price gets the highest weight, with linearly decreasing
//! weights for older history. The verdict compares the weighted average
//! against the plain mean: a gap above 40 % of the mean denies the price,
//! a stale incoming price is always approved, and an upward movement above
//! 5 % of the mean approves it. A small movement leaves the deviation
//! verdict untouched.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Issuance, IssuanceId, IssuanceState, UnifiedPrice};

/// Gap between weighted average and mean that denies, as a fraction of mean.
const DEVIATION_FACTOR: f64 = 0.4;

/// Upward movement that forces approval, as a fraction of mean.
const MOVEMENT_FACTOR: f64 = 0.05;

/// Incoming prices older than this are approved regardless of deviation.
const STALENESS_SECS: i64 = 30;

pub fn calculate_weighted_average_price(
    id: IssuanceId,
    current: UnifiedPrice,
    mut past: Vec<UnifiedPrice>,
    now: DateTime<Utc>,
) -> Issuance {
    // Latest history first; weights decrease with age.
    past.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let n = past.len();
    let mut total_weight = (n + 1) as f64;
    let mut weighted_sum = current.value * (n + 1) as f64;
    for (i, price) in past.iter().enumerate() {
        let weight = (n - i) as f64;
        total_weight += weight;
        weighted_sum += price.value * weight;
    }
    let weighted_avg = weighted_sum / total_weight;

    let mean =
        (current.value + past.iter().map(|p| p.value).sum::<f64>()) / (n + 1) as f64;

    let mut state = if (weighted_avg - mean).abs() > DEVIATION_FACTOR * mean {
        IssuanceState::Denied
    } else {
        IssuanceState::Approved
    };

    let age = now - current.timestamp;
    if age > Duration::seconds(STALENESS_SECS) {
        state = IssuanceState::Approved;
    } else if weighted_avg - mean > MOVEMENT_FACTOR * mean {
        state = IssuanceState::Approved;
    }

    let mut price = current;
    price.value = weighted_avg;

    Issuance {
        id,
        state,
        round_id: 0,
        issuer_address: String::new(),
        created_at: price.timestamp,
        updated_at: price.timestamp,
        metadata: price.contributing_raw_ids.clone(),
        price,
    }
}
