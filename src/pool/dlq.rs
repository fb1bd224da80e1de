//! Dead-letter queue for rejected observations
//!
//! Keeps an in-memory journal of `{price, error}` pairs and, when a journal
//! path is configured, appends each entry to a CSV file so rejections
//! survive restarts.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::types::RawPrice;

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub price: RawPrice,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct JournalRecord<'a> {
    timestamp: i64,
    source: &'a str,
    asset: &'a str,
    value: f64,
    error: &'a str,
}

#[derive(Default)]
pub struct DeadLetterQueue {
    entries: Mutex<Vec<DlqEntry>>,
    journal: Option<Mutex<csv::Writer<std::fs::File>>>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an append-only CSV journal at `path`.
    pub fn with_journal(path: &Path) -> Result<Self> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open DLQ journal at {}", path.display()))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);
        Ok(Self {
            entries: Mutex::new(Vec::new()),
            journal: Some(Mutex::new(writer)),
        })
    }

    pub fn enqueue(&self, price: RawPrice, error: &str) {
        let entry = DlqEntry {
            price,
            error: error.to_string(),
            at: Utc::now(),
        };

        warn!(
            asset = %entry.price.asset,
            source = %entry.price.source,
            value = entry.price.value,
            error = %entry.error,
            "DLQ entry"
        );

        if let Some(journal) = &self.journal {
            let record = JournalRecord {
                timestamp: entry.at.timestamp_millis(),
                source: &entry.price.source,
                asset: &entry.price.asset,
                value: entry.price.value,
                error: &entry.error,
            };
            if let Ok(mut writer) = journal.lock() {
                if let Err(e) = writer.serialize(&record) {
                    warn!(error = %e, "Failed to journal DLQ entry");
                } else if let Err(e) = writer.flush() {
                    warn!(error = %e, "Failed to flush DLQ journal");
                }
            }
        }

        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AssetKey;
    use uuid::Uuid;

    fn rejected_price() -> RawPrice {
        RawPrice {
            id: Uuid::new_v4(),
            source: "binance".to_string(),
            req_url: String::new(),
            asset: "BTC/USD".to_string(),
            asset_key: AssetKey::from_identity("BTC/USD"),
            value: -1.0,
            expo: 0,
            timestamp: Utc::now(),
            request_fingerprint: String::new(),
        }
    }

    #[test]
    fn enqueue_records_the_entry() {
        let dlq = DeadLetterQueue::new();
        assert!(dlq.is_empty());
        dlq.enqueue(rejected_price(), "invalid price");
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn journal_appends_a_csv_row_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dlq.csv");

        let dlq = DeadLetterQueue::with_journal(&path).unwrap();
        dlq.enqueue(rejected_price(), "invalid price");
        dlq.enqueue(rejected_price(), "invalid price");

        let contents = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = contents.lines().collect();
        // header + two entries
        assert_eq!(rows.len(), 3);
        assert!(rows[1].contains("invalid price"));
    }
}
