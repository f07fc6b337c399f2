//! Durable ledger of processed webhook event ids
//!
//! Uses redb to record which provider events have already been handled.
//! Claiming an id is an insert-if-absent inside a single write transaction,
//! which makes it the serialization point for concurrent redeliveries.

use anyhow::Result;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Table of processed events
/// Key: provider event id
/// Value: serialized EventRecord JSON
const PROCESSED_EVENTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("processed_events");

/// Outcome recorded for one processed event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub processed_at: i64,
}

impl EventRecord {
    fn claimed(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            success: false,
            message: Some("claimed".to_string()),
            processed_at: unix_now(),
        }
    }
}

/// Database wrapper for the processed-event ledger
#[derive(Clone)]
pub struct EventLedger {
    db: Arc<Database>,
}

impl EventLedger {
    /// Create a new ledger or open an existing one
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Create tables if they don't exist
        let write_txn = db.begin_write()?;
        {
            let _table = write_txn.open_table(PROCESSED_EVENTS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::info!("Event ledger initialized with processed_events table");

        Ok(Self { db: Arc::new(db) })
    }

    /// Claim an event id for processing. Returns false when the id was
    /// already claimed by an earlier delivery, in which case the handler
    /// must not run again.
    pub fn try_claim(&self, event_id: &str, event_type: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut table = write_txn.open_table(PROCESSED_EVENTS_TABLE)?;
            if table.get(event_id)?.is_some() {
                false
            } else {
                let value = serde_json::to_vec(&EventRecord::claimed(event_type))?;
                table.insert(event_id, value.as_slice())?;
                true
            }
        };
        write_txn.commit()?;

        tracing::debug!(event_id = %event_id, claimed = claimed, "event claim attempt");
        Ok(claimed)
    }

    /// Overwrite the claim marker with the handler's final outcome
    pub fn record_outcome(&self, event_id: &str, record: &EventRecord) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROCESSED_EVENTS_TABLE)?;
            let value = serde_json::to_vec(record)?;
            table.insert(event_id, value.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get the recorded outcome for an event id
    pub fn get(&self, event_id: &str) -> Result<Option<EventRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROCESSED_EVENTS_TABLE)?;

        let result = table.get(event_id)?;
        match result {
            Some(curr) => {
                let record: EventRecord = serde_json::from_slice(curr.value())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
