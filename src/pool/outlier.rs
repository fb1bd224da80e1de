//! Median-based outlier rejection over staged prices

use crate::types::RawPrice;

/// Minimum staged entries before filtering makes sense.
const MIN_SAMPLES: usize = 3;

/// Maximum fractional deviation from the median.
const MAX_DEVIATION: f64 = 0.1;

/// Keep prices within 10 % of the staged median. Below three samples the
/// median is meaningless, so the input is returned untouched.
pub fn filter_outliers(prices: &[RawPrice]) -> Vec<RawPrice> {
    if prices.len() < MIN_SAMPLES {
        return prices.to_vec();
    }

    let mut values: Vec<f64> = prices.iter().map(|p| p.value).collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = values[values.len() / 2];

    prices
        .iter()
        .filter(|p| ((p.value - median) / median).abs() <= MAX_DEVIATION)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetKey;
    use chrono::Utc;
    use uuid::Uuid;

    fn price(value: f64) -> RawPrice {
        RawPrice {
            id: Uuid::new_v4(),
            source: "test".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key: AssetKey::from_identity("BTC/USD"),
            value,
            expo: 0,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        }
    }

    #[test]
    fn fewer_than_three_samples_is_a_no_op() {
        let prices = vec![price(100.0), price(500.0)];
        assert_eq!(filter_outliers(&prices).len(), 2);
    }

    #[test]
    fn drops_prices_beyond_ten_percent_of_median() {
        let prices = vec![price(100.0), price(101.0), price(99.0), price(150.0)];
        let filtered = filter_outliers(&prices);
        assert_eq!(filtered.len(), 3);
        assert!(filtered.iter().all(|p| p.value < 110.0));
    }

    #[test]
    fn keeps_everything_when_spread_is_tight() {
        let prices = vec![price(100.0), price(100.5), price(99.5)];
        assert_eq!(filter_outliers(&prices).len(), 3);
    }
}
