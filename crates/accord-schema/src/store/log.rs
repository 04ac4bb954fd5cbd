//! Compacted log client

use crate::error::SchemaError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// One record read from the schema topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    /// Empty value = tombstone
    pub value: Bytes,
}

impl LogRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

/// Log client errors
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    #[error("Invalid partition: {0}")]
    InvalidPartition(u32),

    #[error("Log client closed")]
    Closed,

    #[error("Log request failed: {0}")]
    Request(String),
}

impl From<LogError> for SchemaError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::Request(msg) => SchemaError::Transport(msg),
            other => SchemaError::Storage(other.to_string()),
        }
    }
}

/// Append-only, key-compacted topic holding registry records
///
/// A client is bound to one topic. Producers are expected to run with full
/// acknowledgement and one in-flight request per connection so that per-key
/// order survives retries.
#[async_trait]
pub trait SchemaLog: Send + Sync {
    /// Topic this client reads and writes
    fn topic(&self) -> &str;

    /// Create the topic as a compacted topic
    async fn create_topic(&self, partitions: u32, replication_factor: u16) -> Result<(), LogError>;

    async fn partitions(&self) -> Result<u32, LogError>;

    /// Append a record, returning its offset
    async fn produce(&self, partition: u32, key: Bytes, value: Bytes) -> Result<u64, LogError>;

    /// Read up to `max` records of `partition` starting at `offset`
    async fn consume(
        &self,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError>;

    /// Next offset to be written, per partition
    async fn end_offsets(&self) -> Result<HashMap<u32, u64>, LogError>;

    /// Block until every produced record is acknowledged
    async fn flush(&self) -> Result<(), LogError>;
}

/// In-memory [`SchemaLog`]
///
/// Offsets are dense per partition until [`MemoryLog::compact`] drops
/// superseded records; offsets of the survivors never change.
pub struct MemoryLog {
    topic: String,
    partitions: RwLock<Option<Vec<PartitionLog>>>,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<LogRecord>,
    next_offset: u64,
}

impl MemoryLog {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partitions: RwLock::new(None),
        }
    }

    /// Keep only the latest record per key in every partition
    pub fn compact(&self) {
        let mut guard = self.partitions.write();
        if let Some(partitions) = guard.as_mut() {
            for partition in partitions.iter_mut() {
                let mut latest: HashMap<Bytes, u64> = HashMap::new();
                for record in &partition.records {
                    latest.insert(record.key.clone(), record.offset);
                }
                let before = partition.records.len();
                partition
                    .records
                    .retain(|r| latest.get(&r.key) == Some(&r.offset));
                debug!(
                    topic = %self.topic,
                    removed = before - partition.records.len(),
                    "Compacted partition"
                );
            }
        }
    }

    /// Number of records currently retained across all partitions
    pub fn len(&self) -> usize {
        self.partitions
            .read()
            .as_ref()
            .map(|ps| ps.iter().map(|p| p.records.len()).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new("_schemas")
    }
}

#[async_trait]
impl SchemaLog for MemoryLog {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn create_topic(&self, partitions: u32, _replication_factor: u16) -> Result<(), LogError> {
        let mut guard = self.partitions.write();
        if guard.is_some() {
            return Err(LogError::TopicAlreadyExists(self.topic.clone()));
        }
        *guard = Some((0..partitions.max(1)).map(|_| PartitionLog::default()).collect());
        Ok(())
    }

    async fn partitions(&self) -> Result<u32, LogError> {
        self.partitions
            .read()
            .as_ref()
            .map(|ps| ps.len() as u32)
            .ok_or_else(|| LogError::TopicNotFound(self.topic.clone()))
    }

    async fn produce(&self, partition: u32, key: Bytes, value: Bytes) -> Result<u64, LogError> {
        let mut guard = self.partitions.write();
        let partitions = guard
            .as_mut()
            .ok_or_else(|| LogError::TopicNotFound(self.topic.clone()))?;
        let log = partitions
            .get_mut(partition as usize)
            .ok_or(LogError::InvalidPartition(partition))?;

        let offset = log.next_offset;
        log.next_offset += 1;
        log.records.push(LogRecord {
            partition,
            offset,
            key,
            value,
        });
        Ok(offset)
    }

    async fn consume(
        &self,
        partition: u32,
        offset: u64,
        max: usize,
    ) -> Result<Vec<LogRecord>, LogError> {
        let guard = self.partitions.read();
        let partitions = guard
            .as_ref()
            .ok_or_else(|| LogError::TopicNotFound(self.topic.clone()))?;
        let log = partitions
            .get(partition as usize)
            .ok_or(LogError::InvalidPartition(partition))?;

        let start = log.records.partition_point(|r| r.offset < offset);
        Ok(log.records[start..].iter().take(max).cloned().collect())
    }

    async fn end_offsets(&self) -> Result<HashMap<u32, u64>, LogError> {
        let guard = self.partitions.read();
        let partitions = guard
            .as_ref()
            .ok_or_else(|| LogError::TopicNotFound(self.topic.clone()))?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p.next_offset))
            .collect())
    }

    async fn flush(&self) -> Result<(), LogError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_produce_and_consume() {
        let log = MemoryLog::default();
        log.create_topic(2, 1).await.unwrap();

        assert_eq!(log.produce(0, Bytes::from("a"), Bytes::from("1")).await.unwrap(), 0);
        assert_eq!(log.produce(0, Bytes::from("b"), Bytes::from("2")).await.unwrap(), 1);
        assert_eq!(log.produce(1, Bytes::from("c"), Bytes::from("3")).await.unwrap(), 0);

        let records = log.consume(0, 1, 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, Bytes::from("b"));

        let ends = log.end_offsets().await.unwrap();
        assert_eq!(ends.get(&0), Some(&2));
        assert_eq!(ends.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn test_topic_lifecycle_errors() {
        let log = MemoryLog::new("schemas");
        assert!(matches!(
            log.produce(0, Bytes::new(), Bytes::new()).await,
            Err(LogError::TopicNotFound(_))
        ));

        log.create_topic(1, 3).await.unwrap();
        assert!(matches!(
            log.create_topic(1, 3).await,
            Err(LogError::TopicAlreadyExists(_))
        ));
        assert!(matches!(
            log.consume(4, 0, 1).await,
            Err(LogError::InvalidPartition(4))
        ));
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_per_key() {
        let log = MemoryLog::default();
        log.create_topic(1, 1).await.unwrap();

        log.produce(0, Bytes::from("k1"), Bytes::from("v1")).await.unwrap();
        log.produce(0, Bytes::from("k2"), Bytes::from("v2")).await.unwrap();
        log.produce(0, Bytes::from("k1"), Bytes::new()).await.unwrap();

        log.compact();

        let records = log.consume(0, 0, 10).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 1);
        assert!(records[1].is_tombstone());
        assert_eq!(records[1].offset, 2);

        // Offsets keep growing after compaction
        assert_eq!(log.end_offsets().await.unwrap().get(&0), Some(&3));
    }
}
