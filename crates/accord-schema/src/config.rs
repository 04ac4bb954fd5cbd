//! Catalog configuration
//!
//! Configuration values are built once at process wiring time and passed to
//! constructors explicitly. Loading them from files is left to the embedding
//! application; every struct here derives `serde` so any format works.

use crate::error::{SchemaError, SchemaResult};
use crate::types::SchemaPackage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for an [`AvroCodec`](crate::codec::AvroCodec)
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Packages registered while the codec starts
    pub packages: Vec<SchemaPackage>,

    /// Issue a registry delete for schemas that lose a conflict
    pub cleanup_losers: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            packages: Vec::new(),
            cleanup_losers: true,
        }
    }
}

impl CodecConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `package` during startup
    pub fn with_package(mut self, package: SchemaPackage) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_cleanup_losers(mut self, cleanup: bool) -> Self {
        self.cleanup_losers = cleanup;
        self
    }
}

/// Registry backend configuration
///
/// - **Memory**: single-process registry for development and testing
/// - **Table**: transactional table with optimistic concurrency
/// - **Log**: compacted, key-ordered topic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    #[default]
    Memory,

    Table(TableRegistryConfig),

    Log(LogRegistryConfig),
}

/// Configuration for the transactional-table registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRegistryConfig {
    /// Rows read per catch-up page (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Bound on queued insert/delete/refresh requests (default: 16)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Attempts before an insert that keeps losing sequence races gives up (default: 16)
    #[serde(default = "default_max_insert_attempts")]
    pub max_insert_attempts: u32,
}

fn default_page_size() -> usize {
    100
}

fn default_queue_depth() -> usize {
    16
}

fn default_max_insert_attempts() -> u32 {
    16
}

impl Default for TableRegistryConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            queue_depth: default_queue_depth(),
            max_insert_attempts: default_max_insert_attempts(),
        }
    }
}

impl TableRegistryConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_max_insert_attempts(mut self, attempts: u32) -> Self {
        self.max_insert_attempts = attempts;
        self
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.page_size == 0 {
            return Err(SchemaError::Config("page_size must be positive".into()));
        }
        if self.queue_depth == 0 {
            return Err(SchemaError::Config("queue_depth must be positive".into()));
        }
        if self.max_insert_attempts == 0 {
            return Err(SchemaError::Config(
                "max_insert_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the compacted-log registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRegistryConfig {
    /// Topic name for storing schemas (default: "_schemas")
    #[serde(default = "default_schema_topic")]
    pub topic: String,

    /// Number of partitions for the schema topic (default: 1)
    /// Note: records of one family always share a partition
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Replication factor for the schema topic (default: 3)
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u16,

    /// How long the tailer sleeps when it has caught up (default: 50)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Records fetched per consume call (default: 500)
    #[serde(default = "default_consume_batch")]
    pub consume_batch_size: usize,

    /// Producer / consumer settings required by the registry
    #[serde(default)]
    pub client: LogClientConfig,
}

fn default_schema_topic() -> String {
    "_schemas".to_string()
}

fn default_partitions() -> u32 {
    1
}

fn default_replication_factor() -> u16 {
    3
}

fn default_poll_interval() -> u64 {
    50
}

fn default_consume_batch() -> usize {
    500
}

impl Default for LogRegistryConfig {
    fn default() -> Self {
        Self {
            topic: default_schema_topic(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
            poll_interval_ms: default_poll_interval(),
            consume_batch_size: default_consume_batch(),
            client: LogClientConfig::default(),
        }
    }
}

impl LogRegistryConfig {
    /// Set custom topic name
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, factor: u16) -> Self {
        self.replication_factor = factor;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> SchemaResult<()> {
        if self.topic.is_empty() {
            return Err(SchemaError::Config("topic must not be empty".into()));
        }
        if self.partitions == 0 {
            return Err(SchemaError::Config("partitions must be positive".into()));
        }
        if self.consume_batch_size == 0 {
            return Err(SchemaError::Config(
                "consume_batch_size must be positive".into(),
            ));
        }
        self.client.validate()
    }
}

/// Producer acknowledgement level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Acks {
    None,
    Leader,
    #[default]
    All,
}

/// Where a consumer without a committed offset starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

/// Log client settings
///
/// The registry replays the topic from the beginning on every start and relies
/// on per-key ordering surviving producer retries, so only one combination is
/// accepted: full acks, one in-flight request, no auto-commit, earliest reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogClientConfig {
    #[serde(default)]
    pub acks: Acks,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests_per_connection: u32,

    #[serde(default)]
    pub enable_auto_commit: bool,

    #[serde(default)]
    pub auto_offset_reset: OffsetReset,
}

fn default_max_in_flight() -> u32 {
    1
}

impl Default for LogClientConfig {
    fn default() -> Self {
        Self {
            acks: Acks::All,
            max_in_flight_requests_per_connection: default_max_in_flight(),
            enable_auto_commit: false,
            auto_offset_reset: OffsetReset::Earliest,
        }
    }
}

impl LogClientConfig {
    pub fn validate(&self) -> SchemaResult<()> {
        if self.acks != Acks::All {
            return Err(SchemaError::Config(format!(
                "schema log producer requires acks=all, got {:?}",
                self.acks
            )));
        }
        if self.max_in_flight_requests_per_connection != 1 {
            return Err(SchemaError::Config(format!(
                "schema log producer requires one in-flight request, got {}",
                self.max_in_flight_requests_per_connection
            )));
        }
        if self.enable_auto_commit {
            return Err(SchemaError::Config(
                "schema log consumer must not auto-commit offsets".into(),
            ));
        }
        if self.auto_offset_reset != OffsetReset::Earliest {
            return Err(SchemaError::Config(
                "schema log consumer must replay from the earliest offset".into(),
            ));
        }
        Ok(())
    }
}

/// Defaults stamped into envelopes built by [`EnvelopeCodec`](crate::envelope::EnvelopeCodec)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeConfig {
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub deployment_stage: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl EnvelopeConfig {
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn with_deployment_stage(mut self, stage: impl Into<String>) -> Self {
        self.deployment_stage = Some(stage.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
