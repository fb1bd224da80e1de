//! Core types used throughout the oracle engine
//!
//! Defines the shared data model for raw observations, unified prices,
//! issuances and the audit trail that links them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Target decimal exponent every in-flight price is normalized to.
pub const TARGET_EXPO: i8 = -18;

/// Opaque identifier of a single raw observation.
pub type PriceId = Uuid;

/// Opaque identifier of a consensus issuance.
pub type IssuanceId = Uuid;

/// Stable 32-byte asset identifier, shared by every pipeline stage and used
/// as the on-chain asset index.
///
/// Derived as `SHA-256("oracle.asset:" + uppercased, trimmed internal
/// identity)`, so the same internal identity always maps to the same key
/// across restarts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetKey([u8; 32]);

impl AssetKey {
    /// Sentinel for "no key"; routing stages drop records carrying it.
    pub const ZERO: AssetKey = AssetKey([0u8; 32]);

    const NAMESPACE: &'static str = "oracle.asset:";

    pub fn from_identity(internal_identity: &str) -> Self {
        let normalized = internal_identity.trim().to_uppercase();
        let mut hasher = Sha256::new();
        hasher.update(Self::NAMESPACE.as_bytes());
        hasher.update(normalized.as_bytes());
        AssetKey(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(AssetKey(key))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetKey({})", self.to_hex())
    }
}

impl Serialize for AssetKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AssetKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AssetKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A single observation from one feed at one instant.
///
/// Created by the scheduler, persisted immediately, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPrice {
    pub id: PriceId,
    /// Feed name, stamped by the scheduler.
    pub source: String,
    /// URL the observation was fetched from, when the adapter recorded it.
    pub req_url: String,
    /// Human-readable asset name from configuration.
    pub asset: String,
    pub asset_key: AssetKey,
    pub value: f64,
    /// Decimal exponent; the actual price is `value * 10^expo`.
    pub expo: i8,
    pub timestamp: DateTime<Utc>,
    pub request_fingerprint: String,
}

impl RawPrice {
    /// Lift into the in-flight shape, stamping the `source@timestamp`
    /// fingerprint used for traceability.
    pub fn to_unified(&self) -> UnifiedPrice {
        UnifiedPrice {
            id: self.id,
            source: self.source.clone(),
            req_url: self.req_url.clone(),
            asset: self.asset.clone(),
            asset_key: self.asset_key,
            value: self.value,
            expo: self.expo,
            timestamp: self.timestamp,
            request_fingerprint: format!("{}@{}", self.source, self.timestamp),
            is_aggregate: false,
            contributing_raw_ids: Vec::new(),
        }
    }
}

/// A normalized in-flight price; also the shape of aggregated prices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedPrice {
    pub id: PriceId,
    pub source: String,
    pub req_url: String,
    pub asset: String,
    pub asset_key: AssetKey,
    pub value: f64,
    pub expo: i8,
    pub timestamp: DateTime<Utc>,
    pub request_fingerprint: String,
    pub is_aggregate: bool,
    /// Raw price ids that survived deviation filtering; empty until the
    /// price has been through the aggregator.
    #[serde(default)]
    pub contributing_raw_ids: Vec<PriceId>,
}

impl UnifiedPrice {
    /// The price in natural units: `value * 10^expo`.
    pub fn scaled(&self) -> f64 {
        self.value * 10f64.powi(self.expo as i32)
    }

    /// Rescale so that `scaled()` is unchanged but `expo == target`.
    pub fn normalize_to(mut self, target: i8) -> Self {
        let shift = self.expo as i32 - target as i32;
        self.value *= 10f64.powi(shift);
        self.expo = target;
        self
    }
}

/// Lifecycle of a consensus decision. Denied is terminal; Approved may
/// advance to Confirmed once a ledger acknowledges the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuanceState {
    Denied,
    Approved,
    Confirmed,
}

impl IssuanceState {
    pub fn as_i16(self) -> i16 {
        match self {
            IssuanceState::Denied => 0,
            IssuanceState::Approved => 1,
            IssuanceState::Confirmed => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(IssuanceState::Denied),
            1 => Some(IssuanceState::Approved),
            2 => Some(IssuanceState::Confirmed),
            _ => None,
        }
    }
}

impl fmt::Display for IssuanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceState::Denied => write!(f, "DENIED"),
            IssuanceState::Approved => write!(f, "APPROVED"),
            IssuanceState::Confirmed => write!(f, "CONFIRMED"),
        }
    }
}

/// The consensus-layer decision record wrapping an aggregated price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issuance {
    pub id: IssuanceId,
    pub state: IssuanceState,
    /// The consensus-modified aggregate (value replaced by the weighted
    /// average; exponent and timestamp carried from the incoming price).
    pub price: UnifiedPrice,
    pub round_id: u64,
    pub issuer_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Contributing raw price ids, kept for the audit trail.
    #[serde(default)]
    pub metadata: Vec<PriceId>,
}

impl Issuance {
    pub fn asset_key(&self) -> AssetKey {
        self.price.asset_key
    }
}

/// An emitted price together with every raw observation it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAudit {
    pub price_id: PriceId,
    pub asset_key: AssetKey,
    pub aggregated_price: UnifiedPrice,
    pub raw_prices: Vec<RawPrice>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Asset listing entry for the read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetData {
    pub asset_key: AssetKey,
    pub asset: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_key_is_deterministic() {
        let a = AssetKey::from_identity("0xUSDT");
        let b = AssetKey::from_identity("0xUSDT");
        assert_eq!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn asset_key_normalizes_case_and_whitespace() {
        let a = AssetKey::from_identity("  0xusdt ");
        let b = AssetKey::from_identity("0XUSDT");
        assert_eq!(a, b);
    }

    #[test]
    fn asset_key_matches_namespaced_sha256() {
        let key = AssetKey::from_identity("btc/usd");
        let mut hasher = Sha256::new();
        hasher.update(b"oracle.asset:BTC/USD");
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(key.as_bytes(), expected);
    }

    #[test]
    fn asset_key_hex_round_trip() {
        let key = AssetKey::from_identity("ETH/USD");
        let parsed = AssetKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
        assert!(AssetKey::from_hex("abcd").is_err());
    }

    #[test]
    fn normalize_preserves_scaled_value() {
        let raw = RawPrice {
            id: Uuid::new_v4(),
            source: "pyth".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key: AssetKey::from_identity("BTC/USD"),
            value: 50_000.0,
            expo: 0,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        };
        let unified = raw.to_unified().normalize_to(TARGET_EXPO);
        assert_eq!(unified.expo, TARGET_EXPO);
        let rel_err = (unified.scaled() - 50_000.0).abs() / 50_000.0;
        assert!(rel_err < 1e-9);
    }

    #[test]
    fn issuance_state_round_trips_through_i16() {
        for state in [
            IssuanceState::Denied,
            IssuanceState::Approved,
            IssuanceState::Confirmed,
        ] {
            assert_eq!(IssuanceState::from_i16(state.as_i16()), Some(state));
        }
        assert_eq!(IssuanceState::from_i16(9), None);
    }
}
