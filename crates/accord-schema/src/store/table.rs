//! Transactional table client

use crate::error::SchemaError;
use crate::fingerprint::SchemaFingerprint;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;
use tracing::debug;

/// One durable registry row
///
/// All rows share one fixed partition key; `sequence` is the sort key and
/// `fingerprint` carries a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub sequence: u64,
    pub fingerprint: SchemaFingerprint,
    pub schema: String,
    /// Set when the schema lost a conflict and was removed; the sequence slot stays taken
    #[serde(default)]
    pub deleted: bool,
}

impl TableRow {
    pub fn new(sequence: u64, fingerprint: SchemaFingerprint, schema: impl Into<String>) -> Self {
        Self {
            sequence,
            fingerprint,
            schema: schema.into(),
            deleted: false,
        }
    }
}

/// Why one item of a cancelled transaction failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    /// The item did not cause the cancellation
    None,
    /// The "row absent" precondition no longer held
    ConditionalCheckFailed,
    /// Another transaction touched the item concurrently
    TransactionConflict,
    ValidationError(String),
    Other(String),
}

/// Table client errors
#[derive(Debug, Error)]
pub enum TableError {
    #[error("Transaction cancelled: {reasons:?}")]
    TransactionCanceled { reasons: Vec<CancellationReason> },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Row not found: sequence {0}")]
    RowNotFound(u64),

    #[error("Table request failed: {0}")]
    Request(String),
}

impl TableError {
    /// True when every causal reason is a failed "row absent" precondition
    ///
    /// Only these cancellations mean another writer claimed the sequence range
    /// first; anything else is a real failure.
    pub fn is_optimistic_conflict(&self) -> bool {
        match self {
            TableError::TransactionCanceled { reasons } => {
                reasons
                    .iter()
                    .any(|r| *r == CancellationReason::ConditionalCheckFailed)
                    && reasons.iter().all(|r| {
                        matches!(
                            r,
                            CancellationReason::ConditionalCheckFailed | CancellationReason::None
                        )
                    })
            }
            _ => false,
        }
    }
}

impl From<TableError> for SchemaError {
    fn from(e: TableError) -> Self {
        match e {
            TableError::Request(msg) => SchemaError::Transport(msg),
            other => SchemaError::Storage(other.to_string()),
        }
    }
}

/// Strongly consistent table holding registry rows
#[async_trait]
pub trait SchemaTable: Send + Sync {
    /// Table name, for diagnostics
    fn name(&self) -> &str;

    /// Put every row in one transaction, each conditional on its sequence being absent
    async fn transact_put_if_absent(&self, rows: Vec<TableRow>) -> Result<(), TableError>;

    /// Rows with `sequence > after`, ascending, at most `limit`
    async fn query_after(&self, after: u64, limit: usize) -> Result<Vec<TableRow>, TableError>;

    /// Look a row up through the fingerprint index
    async fn find_by_fingerprint(
        &self,
        fingerprint: SchemaFingerprint,
    ) -> Result<Option<TableRow>, TableError>;

    /// Mark the row at `sequence` deleted
    async fn mark_deleted(&self, sequence: u64) -> Result<(), TableError>;
}

/// In-memory [`SchemaTable`]
///
/// Transactions are atomic under one lock; a put whose sequence already
/// exists cancels the whole transaction with per-item reasons.
pub struct MemoryTable {
    name: String,
    data: Mutex<TableData>,
}

#[derive(Default)]
struct TableData {
    rows: BTreeMap<u64, TableRow>,
    by_fingerprint: HashMap<SchemaFingerprint, u64>,
    injected: VecDeque<TableError>,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(TableData::default()),
        }
    }

    /// Fail the next transaction with `error` instead of applying it
    pub fn fail_next_transaction(&self, error: TableError) {
        self.data.lock().injected.push_back(error);
    }

    /// Write a row unconditionally, bypassing the transaction path
    pub fn put_raw(&self, row: TableRow) {
        let mut data = self.data.lock();
        data.by_fingerprint.insert(row.fingerprint, row.sequence);
        data.rows.insert(row.sequence, row);
    }

    pub fn len(&self) -> usize {
        self.data.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row, ascending
    pub fn rows(&self) -> Vec<TableRow> {
        self.data.lock().rows.values().cloned().collect()
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new("schema_registry")
    }
}

#[async_trait]
impl SchemaTable for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transact_put_if_absent(&self, rows: Vec<TableRow>) -> Result<(), TableError> {
        let mut data = self.data.lock();

        if let Some(error) = data.injected.pop_front() {
            return Err(error);
        }

        let mut seen = Vec::with_capacity(rows.len());
        let reasons: Vec<CancellationReason> = rows
            .iter()
            .map(|row| {
                if seen.contains(&row.sequence) {
                    CancellationReason::ValidationError(format!(
                        "duplicate sequence {} in transaction",
                        row.sequence
                    ))
                } else if data.rows.contains_key(&row.sequence) {
                    seen.push(row.sequence);
                    CancellationReason::ConditionalCheckFailed
                } else {
                    seen.push(row.sequence);
                    CancellationReason::None
                }
            })
            .collect();

        if reasons.iter().any(|r| *r != CancellationReason::None) {
            debug!(table = %self.name, ?reasons, "Transaction cancelled");
            return Err(TableError::TransactionCanceled { reasons });
        }

        for row in rows {
            data.by_fingerprint.insert(row.fingerprint, row.sequence);
            data.rows.insert(row.sequence, row);
        }

        Ok(())
    }

    async fn query_after(&self, after: u64, limit: usize) -> Result<Vec<TableRow>, TableError> {
        let data = self.data.lock();
        Ok(data
            .rows
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: SchemaFingerprint,
    ) -> Result<Option<TableRow>, TableError> {
        let data = self.data.lock();
        Ok(data
            .by_fingerprint
            .get(&fingerprint)
            .and_then(|seq| data.rows.get(seq))
            .cloned())
    }

    async fn mark_deleted(&self, sequence: u64) -> Result<(), TableError> {
        let mut data = self.data.lock();
        match data.rows.get_mut(&sequence) {
            Some(row) => {
                row.deleted = true;
                Ok(())
            }
            None => Err(TableError::RowNotFound(sequence)),
        }
    }
}
