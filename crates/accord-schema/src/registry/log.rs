//! Compacted-log registry
//!
//! Schemas live in a compacted topic, similar to the `_schemas` topic of a
//! Kafka schema registry:
//!
//! - Key: 8-byte big-endian fingerprint
//! - Value: UTF-8 schema text as written; the fingerprint is taken over its
//!   Parsing Canonical Form
//! - Empty value: tombstone, the schema was removed
//!
//! A tailer task consumes every partition from offset 0 for the lifetime of
//! the registry and drives the listener. Writes are plain appends; an insert
//! returns only after the tailer has read past it, so the listener has decided
//! any race before the caller sees success.
//!
//! All records of one record type family land in the same partition, which
//! gives every reader the same order for competing registrations.

use super::{RunState, SchemaListener, SchemaRegistry};
use crate::config::LogRegistryConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::store::{LogError, LogRecord, SchemaLog};
use crate::types::SchemaDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::SharedMetrics;

/// Registry backed by a [`SchemaLog`]
pub struct LogRegistry {
    config: LogRegistryConfig,
    log: Arc<dyn SchemaLog>,
    state: Mutex<RunState>,
    partitions: AtomicU32,
    shared: Arc<TailShared>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tailer: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "metrics")]
    metrics: Option<SharedMetrics>,
}

/// State shared between request paths and the tailer
struct TailShared {
    tail: Mutex<TailState>,
    /// Fingerprints currently live in the topic
    live: DashSet<SchemaFingerprint>,
}

#[derive(Default)]
struct TailState {
    /// Next offset to read, per partition
    positions: HashMap<u32, u64>,
    waiters: Vec<RefreshWaiter>,
    next_ticket: u64,
    closed: bool,
}

struct RefreshWaiter {
    ticket: u64,
    targets: HashMap<u32, u64>,
    reply: oneshot::Sender<SchemaResult<()>>,
}

impl TailState {
    fn reached(&self, targets: &HashMap<u32, u64>) -> bool {
        targets
            .iter()
            .all(|(p, target)| self.positions.get(p).copied().unwrap_or(0) >= *target)
    }
}

impl LogRegistry {
    pub fn new(config: LogRegistryConfig, log: Arc<dyn SchemaLog>) -> SchemaResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            log,
            state: Mutex::new(RunState::New),
            partitions: AtomicU32::new(0),
            shared: Arc::new(TailShared {
                tail: Mutex::new(TailState::default()),
                live: DashSet::new(),
            }),
            shutdown: Mutex::new(None),
            tailer: Mutex::new(None),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Record refreshes into `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Number of schemas the tailer currently considers live
    pub fn live_count(&self) -> usize {
        self.shared.live.len()
    }

    async fn ensure_topic(&self) -> SchemaResult<u32> {
        match self.log.partitions().await {
            Ok(partitions) => return Ok(partitions),
            Err(LogError::TopicNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            topic = %self.log.topic(),
            partitions = self.config.partitions,
            replication_factor = self.config.replication_factor,
            "Creating schema topic"
        );
        match self
            .log
            .create_topic(self.config.partitions, self.config.replication_factor)
            .await
        {
            // Another instance created it first
            Ok(()) | Err(LogError::TopicAlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.log.partitions().await?)
    }

    fn partition_for(&self, schema: &SchemaDescriptor) -> u32 {
        partition_for(schema, self.partitions.load(Ordering::Acquire))
    }

    /// Wait until the tailer has read everything committed before this call
    async fn catch_up(&self) -> SchemaResult<()> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh("log");
        }

        let targets = self.log.end_offsets().await?;
        let rx = {
            let mut tail = self.shared.tail.lock();
            if tail.closed {
                return Err(SchemaError::ShuttingDown);
            }
            if tail.reached(&targets) {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            let ticket = tail.next_ticket;
            tail.next_ticket += 1;
            tail.waiters.push(RefreshWaiter {
                ticket,
                targets,
                reply: tx,
            });
            rx
        };
        rx.await.map_err(|_| SchemaError::ShuttingDown)?
    }
}

#[async_trait]
impl SchemaRegistry for LogRegistry {
    async fn start_up(&self, listener: Arc<dyn SchemaListener>) -> SchemaResult<()> {
        self.state.lock().ensure_new()?;

        let partitions = self.ensure_topic().await?;
        self.partitions.store(partitions, Ordering::Release);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tailer = Tailer {
            log: self.log.clone(),
            shared: self.shared.clone(),
            listener,
            partitions,
            batch_size: self.config.consume_batch_size,
            poll_interval: self.config.poll_interval(),
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(tailer.run());

        *self.shutdown.lock() = Some(shutdown_tx);
        *self.tailer.lock() = Some(handle);
        *self.state.lock() = RunState::Running;

        self.catch_up().await?;
        info!(
            topic = %self.log.topic(),
            partitions,
            schemas = self.live_count(),
            "Log registry started"
        );
        Ok(())
    }

    async fn insert(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
        self.state.lock().ensure_running()?;

        let mut produced = HashSet::new();
        for schema in &schemas {
            let fingerprint = schema.fingerprint();
            if self.shared.live.contains(&fingerprint) || !produced.insert(fingerprint) {
                continue;
            }
            let partition = self.partition_for(schema);
            let offset = self
                .log
                .produce(
                    partition,
                    Bytes::copy_from_slice(&fingerprint.to_bytes()),
                    Bytes::copy_from_slice(schema.text().as_bytes()),
                )
                .await?;
            debug!(fingerprint = %fingerprint, partition, offset, "Produced schema");
        }

        if produced.is_empty() {
            return Ok(());
        }
        self.log.flush().await?;
        self.catch_up().await
    }

    async fn delete(&self, schema: &SchemaDescriptor) -> SchemaResult<()> {
        self.state.lock().ensure_running()?;

        let fingerprint = schema.fingerprint();
        if !self.shared.live.contains(&fingerprint) {
            warn!(fingerprint = %fingerprint, "Delete of unknown schema ignored");
            return Ok(());
        }

        let partition = self.partition_for(schema);
        self.log
            .produce(
                partition,
                Bytes::copy_from_slice(&fingerprint.to_bytes()),
                Bytes::new(),
            )
            .await?;
        self.log.flush().await?;
        info!(fingerprint = %fingerprint, partition, "Produced schema tombstone");
        Ok(())
    }

    async fn refresh(&self) -> SchemaResult<()> {
        self.state.lock().ensure_running()?;
        self.catch_up().await
    }

    async fn shut_down(&self) -> SchemaResult<()> {
        {
            let mut state = self.state.lock();
            state.ensure_running()?;
            *state = RunState::Stopped;
        }

        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(true);
        }
        let handle = self.tailer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Schema log tailer ended abnormally");
            }
        }

        if let Err(e) = self.log.flush().await {
            warn!(error = %e, "Failed to flush schema log on shutdown");
        }

        let waiters = {
            let mut tail = self.shared.tail.lock();
            tail.closed = true;
            std::mem::take(&mut tail.waiters)
        };
        for waiter in waiters {
            let _ = waiter.reply.send(Err(SchemaError::ShuttingDown));
        }

        info!(topic = %self.log.topic(), "Log registry stopped");
        Ok(())
    }
}

/// Background consumer of the schema topic
struct Tailer {
    log: Arc<dyn SchemaLog>,
    shared: Arc<TailShared>,
    listener: Arc<dyn SchemaListener>,
    partitions: u32,
    batch_size: usize,
    poll_interval: std::time::Duration,
    shutdown: watch::Receiver<bool>,
}

impl Tailer {
    async fn run(mut self) {
        debug!(partitions = self.partitions, "Schema log tailer started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            // Waiters registered before this round are satisfied by any
            // partition this round drains
            let round = self.shared.tail.lock().next_ticket;
            let mut drained = HashSet::new();
            let mut progressed = false;

            for partition in 0..self.partitions {
                let offset = self
                    .shared
                    .tail
                    .lock()
                    .positions
                    .get(&partition)
                    .copied()
                    .unwrap_or(0);

                match self.log.consume(partition, offset, self.batch_size).await {
                    Ok(records) => {
                        if records.len() < self.batch_size {
                            drained.insert(partition);
                        }
                        if let Some(last) = records.last() {
                            let next = last.offset + 1;
                            progressed = true;
                            for record in &records {
                                self.apply(record);
                            }
                            self.shared.tail.lock().positions.insert(partition, next);
                        }
                    }
                    Err(e) => {
                        warn!(partition, offset, error = %e, "Failed to consume schema log");
                    }
                }
            }

            self.complete_waiters(round, &drained);

            if !progressed {
                tokio::select! {
                    changed = self.shutdown.changed() => {
                        // Registry dropped without shutting down
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        debug!("Schema log tailer stopped");
    }

    fn apply(&self, record: &LogRecord) {
        let Some(fingerprint) = SchemaFingerprint::from_bytes(&record.key) else {
            error!(
                partition = record.partition,
                offset = record.offset,
                "Corrupt schema record: key is not a fingerprint"
            );
            return;
        };

        if record.is_tombstone() {
            if self.shared.live.remove(&fingerprint).is_some() {
                debug!(fingerprint = %fingerprint, "Schema removed");
                self.listener.on_schema_removed(fingerprint);
            }
            return;
        }

        let descriptor = match parse_record(fingerprint, record) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Corrupt schema record skipped"
                );
                return;
            }
        };

        if self.shared.live.insert(fingerprint) {
            debug!(fingerprint = %fingerprint, offset = record.offset, "Schema added");
            self.listener.on_schema_added(&descriptor);
        }
    }

    fn complete_waiters(&self, round: u64, drained: &HashSet<u32>) {
        let ready = {
            let mut tail = self.shared.tail.lock();
            let waiters = std::mem::take(&mut tail.waiters);
            let (ready, pending): (Vec<_>, Vec<_>) = waiters.into_iter().partition(|w| {
                w.targets.iter().all(|(p, target)| {
                    tail.positions.get(p).copied().unwrap_or(0) >= *target
                        || (w.ticket < round && drained.contains(p))
                })
            });
            tail.waiters = pending;
            ready
        };
        for waiter in ready {
            let _ = waiter.reply.send(Ok(()));
        }
    }
}

fn parse_record(fingerprint: SchemaFingerprint, record: &LogRecord) -> SchemaResult<SchemaDescriptor> {
    let text = std::str::from_utf8(&record.value)
        .map_err(|e| SchemaError::Corrupt(format!("schema text is not UTF-8: {}", e)))?;
    let descriptor = SchemaDescriptor::parse(text)
        .map_err(|e| SchemaError::Corrupt(format!("unparsable schema: {}", e)))?;
    if descriptor.fingerprint() != fingerprint {
        return Err(SchemaError::Corrupt(format!(
            "keyed by {} but hashes to {}",
            fingerprint,
            descriptor.fingerprint()
        )));
    }
    Ok(descriptor)
}

/// Partition holding every record of the schema's family
///
/// Unnamed schemas have no family and are spread by fingerprint.
fn partition_for(schema: &SchemaDescriptor, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let mut hasher = Sha256::new();
    match schema.family() {
        Some(family) => hasher.update(family.as_str().as_bytes()),
        None => hasher.update(schema.fingerprint().to_bytes()),
    }
    let digest = hasher.finalize();
    let bucket = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    bucket % partitions
}
