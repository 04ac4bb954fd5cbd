//! Transactional-table registry
//!
//! Every schema occupies one row keyed by a global sequence number. Writers
//! claim `last_observed + 1 ..` with conditional puts in a single transaction;
//! a writer that loses the race catches up and retries on fresh numbers.
//! Readers page through rows in sequence order, so every instance observes
//! schemas in the same global order.
//!
//! All mutations run on one worker task fed by a bounded queue. The worker
//! owns the bookkeeping and calls the listener; request methods only enqueue
//! commands and await the reply.

use super::{RunState, SchemaListener, SchemaRegistry};
use crate::config::TableRegistryConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::store::{SchemaTable, TableRow};
use crate::types::{RecordTypeFamily, SchemaDescriptor};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::SharedMetrics;

enum Command {
    Insert {
        schemas: Vec<SchemaDescriptor>,
        reply: oneshot::Sender<SchemaResult<()>>,
    },
    Delete {
        schema: SchemaDescriptor,
        reply: oneshot::Sender<SchemaResult<()>>,
    },
    Refresh {
        reply: oneshot::Sender<SchemaResult<()>>,
    },
}

/// Registry backed by a [`SchemaTable`]
pub struct TableRegistry {
    config: TableRegistryConfig,
    table: Arc<dyn SchemaTable>,
    state: Mutex<RunState>,
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    last_sequence: Arc<AtomicU64>,
    #[cfg(feature = "metrics")]
    metrics: Option<SharedMetrics>,
}

impl TableRegistry {
    pub fn new(config: TableRegistryConfig, table: Arc<dyn SchemaTable>) -> SchemaResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            table,
            state: Mutex::new(RunState::New),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            last_sequence: Arc::new(AtomicU64::new(0)),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Record retries and refreshes into `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Highest sequence number this instance has observed
    pub fn last_observed_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    async fn submit<F>(&self, command: F) -> SchemaResult<()>
    where
        F: FnOnce(oneshot::Sender<SchemaResult<()>>) -> Command,
    {
        self.state.lock().ensure_running()?;
        let sender = self.sender.lock().clone().ok_or(SchemaError::NotRunning)?;

        let (tx, rx) = oneshot::channel();
        sender
            .send(command(tx))
            .await
            .map_err(|_| SchemaError::ShuttingDown)?;
        rx.await.map_err(|_| SchemaError::ShuttingDown)?
    }
}

#[async_trait]
impl SchemaRegistry for TableRegistry {
    async fn start_up(&self, listener: Arc<dyn SchemaListener>) -> SchemaResult<()> {
        self.state.lock().ensure_new()?;

        let mut worker = TableWorker {
            table: self.table.clone(),
            page_size: self.config.page_size,
            max_insert_attempts: self.config.max_insert_attempts,
            listener,
            last_sequence: self.last_sequence.clone(),
            known: HashMap::new(),
            families: HashMap::new(),
            own_rows: HashMap::new(),
            #[cfg(feature = "metrics")]
            metrics: self.metrics.clone(),
        };

        // Replay before accepting commands so start-up failures surface here
        worker.refresh().await?;

        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let closing = self.closing.clone();
        let handle = tokio::spawn(worker.run(rx, closing));

        *self.sender.lock() = Some(tx);
        *self.worker.lock() = Some(handle);
        *self.state.lock() = RunState::Running;

        info!(
            table = %self.table.name(),
            last_sequence = self.last_observed_sequence(),
            "Table registry started"
        );
        Ok(())
    }

    async fn insert(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
        if schemas.is_empty() {
            return self.state.lock().ensure_running();
        }
        self.submit(|reply| Command::Insert { schemas, reply }).await
    }

    async fn delete(&self, schema: &SchemaDescriptor) -> SchemaResult<()> {
        let schema = schema.clone();
        self.submit(|reply| Command::Delete { schema, reply }).await
    }

    async fn refresh(&self) -> SchemaResult<()> {
        self.submit(|reply| Command::Refresh { reply }).await
    }

    async fn shut_down(&self) -> SchemaResult<()> {
        {
            let mut state = self.state.lock();
            state.ensure_running()?;
            *state = RunState::Stopped;
        }

        self.closing.store(true, Ordering::Release);
        // Dropping the sender ends the worker once the queue drains
        self.sender.lock().take();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Table registry worker ended abnormally");
            }
        }

        info!(table = %self.table.name(), "Table registry stopped");
        Ok(())
    }
}

/// Single writer owning the registry bookkeeping
struct TableWorker {
    table: Arc<dyn SchemaTable>,
    page_size: usize,
    max_insert_attempts: u32,
    listener: Arc<dyn SchemaListener>,
    last_sequence: Arc<AtomicU64>,
    /// Live schemas observed in the table
    known: HashMap<SchemaFingerprint, SchemaDescriptor>,
    /// First durable fingerprint seen per family
    families: HashMap<RecordTypeFamily, SchemaFingerprint>,
    /// Rows this writer committed: fingerprint -> sequence
    own_rows: HashMap<SchemaFingerprint, u64>,
    #[cfg(feature = "metrics")]
    metrics: Option<SharedMetrics>,
}

impl TableWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, closing: Arc<AtomicBool>) {
        while let Some(command) = rx.recv().await {
            if closing.load(Ordering::Acquire) {
                let reply = match command {
                    Command::Insert { reply, .. }
                    | Command::Delete { reply, .. }
                    | Command::Refresh { reply } => reply,
                };
                let _ = reply.send(Err(SchemaError::ShuttingDown));
                continue;
            }

            match command {
                Command::Insert { schemas, reply } => {
                    let _ = reply.send(self.insert(schemas).await);
                }
                Command::Delete { schema, reply } => {
                    let _ = reply.send(self.delete(&schema).await);
                }
                Command::Refresh { reply } => {
                    let _ = reply.send(self.refresh().await);
                }
            }
        }
        debug!("Table registry worker exited");
    }

    fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    /// Schemas of `schemas` that still need a row
    ///
    /// Fails with a conflict when a family already has another durable
    /// fingerprint, or when the batch itself names one family twice.
    fn unregistered(&self, schemas: &[SchemaDescriptor]) -> SchemaResult<Vec<SchemaDescriptor>> {
        let mut pending: Vec<SchemaDescriptor> = Vec::new();
        let mut seen = HashSet::new();
        let mut batch_families: HashMap<&RecordTypeFamily, SchemaFingerprint> = HashMap::new();

        for schema in schemas {
            let fingerprint = schema.fingerprint();
            if self.known.contains_key(&fingerprint) || !seen.insert(fingerprint) {
                continue;
            }
            if let Some(family) = schema.family() {
                let winner = self
                    .families
                    .get(family)
                    .copied()
                    .or_else(|| batch_families.get(family).copied());
                if let Some(winner) = winner {
                    if winner != fingerprint {
                        return Err(SchemaError::conflict(family.clone(), winner, fingerprint));
                    }
                }
                batch_families.insert(family, fingerprint);
            }
            pending.push(schema.clone());
        }
        Ok(pending)
    }

    async fn insert(&mut self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let pending = self.unregistered(&schemas)?;
            if pending.is_empty() {
                return Ok(());
            }

            let base = self.last_sequence();
            let rows: Vec<TableRow> = pending
                .iter()
                .enumerate()
                .map(|(i, schema)| {
                    TableRow::new(
                        base + 1 + i as u64,
                        schema.fingerprint(),
                        schema.text(),
                    )
                })
                .collect();

            match self.table.transact_put_if_absent(rows).await {
                Ok(()) => {
                    for (i, schema) in pending.into_iter().enumerate() {
                        let sequence = base + 1 + i as u64;
                        self.own_rows.insert(schema.fingerprint(), sequence);
                        self.observe(sequence, schema);
                    }
                    return Ok(());
                }
                Err(e) if e.is_optimistic_conflict() => {
                    if attempt >= self.max_insert_attempts {
                        return Err(SchemaError::Storage(format!(
                            "insert gave up after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    debug!(attempt, base, "Lost sequence race, catching up");
                    #[cfg(feature = "metrics")]
                    if let Some(metrics) = &self.metrics {
                        metrics.record_insert_retry();
                    }
                    self.refresh().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&mut self, schema: &SchemaDescriptor) -> SchemaResult<()> {
        let fingerprint = schema.fingerprint();
        if !self.own_rows.contains_key(&fingerprint) {
            warn!(
                fingerprint = %fingerprint,
                "Delete ignored, schema was not committed by this writer"
            );
            return Ok(());
        }

        match self.table.find_by_fingerprint(fingerprint).await? {
            Some(row) if !row.deleted => {
                self.table.mark_deleted(row.sequence).await?;
                self.own_rows.remove(&fingerprint);
                self.forget(fingerprint);
                info!(fingerprint = %fingerprint, sequence = row.sequence, "Deleted schema row");
            }
            _ => {
                self.own_rows.remove(&fingerprint);
                warn!(fingerprint = %fingerprint, "Delete ignored, row already gone");
            }
        }
        Ok(())
    }

    /// Read every row committed after the last observed sequence
    async fn refresh(&mut self) -> SchemaResult<()> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_refresh("table");
        }

        loop {
            let rows = self
                .table
                .query_after(self.last_sequence(), self.page_size)
                .await?;
            let page_len = rows.len();

            for row in rows {
                let sequence = row.sequence;
                let descriptor = match verify_row(&row) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        error!(sequence, fingerprint = %row.fingerprint, error = %e, "Corrupt schema row");
                        // Skip past it so later refreshes are not stuck
                        self.advance(sequence);
                        return Err(e);
                    }
                };

                if row.deleted {
                    self.advance(sequence);
                    self.forget(row.fingerprint);
                } else {
                    self.observe(sequence, descriptor);
                }
            }

            if page_len < self.page_size {
                return Ok(());
            }
        }
    }

    fn advance(&self, sequence: u64) {
        self.last_sequence.fetch_max(sequence, Ordering::AcqRel);
    }

    fn observe(&mut self, sequence: u64, descriptor: SchemaDescriptor) {
        self.advance(sequence);

        let fingerprint = descriptor.fingerprint();
        if self.known.contains_key(&fingerprint) {
            return;
        }
        if let Some(family) = descriptor.family() {
            self.families.entry(family.clone()).or_insert(fingerprint);
        }
        debug!(sequence, fingerprint = %fingerprint, "Observed schema");
        self.listener.on_schema_added(&descriptor);
        self.known.insert(fingerprint, descriptor);
    }

    fn forget(&mut self, fingerprint: SchemaFingerprint) {
        if let Some(descriptor) = self.known.remove(&fingerprint) {
            if let Some(family) = descriptor.family() {
                if self.families.get(family) == Some(&fingerprint) {
                    self.families.remove(family);
                }
            }
            self.listener.on_schema_removed(fingerprint);
        }
    }
}

fn verify_row(row: &TableRow) -> SchemaResult<SchemaDescriptor> {
    let descriptor = SchemaDescriptor::parse(&row.schema).map_err(|e| {
        SchemaError::Corrupt(format!("row {} holds an unparsable schema: {}", row.sequence, e))
    })?;
    if descriptor.fingerprint() != row.fingerprint {
        return Err(SchemaError::Corrupt(format!(
            "row {} stored under {} but hashes to {}",
            row.sequence,
            row.fingerprint,
            descriptor.fingerprint()
        )));
    }
    Ok(descriptor)
}
