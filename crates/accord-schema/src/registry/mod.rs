//! Schema registry backends
//!
//! A registry durably stores schemas and tells one listener about every schema
//! it observes, in commit order. Three backends are provided:
//!
//! - **Memory**: single-process registry for development and testing
//! - **Table**: transactional table with optimistic concurrency on a global
//!   sequence number
//! - **Log**: compacted topic keyed by fingerprint
//!
//! The memory and table backends refuse an insert whose family already has
//! another fingerprint in their own durable view, and fail it with
//! [`SchemaError::Conflict`]. The log backend stores every write. Either way
//! the [`AvroCodec`](crate::codec::AvroCodec) listening to them picks the
//! winner of each record type family from delivery order, and also records
//! losers reported by a refused insert.

mod log;
mod memory;
mod table;

pub use log::LogRegistry;
pub use memory::MemoryRegistry;
pub use table::TableRegistry;

use crate::config::RegistryConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::store::{MemoryLog, MemoryTable, SchemaLog, SchemaTable};
use crate::types::SchemaDescriptor;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives registry change notifications
///
/// Callbacks run on the registry's own task and must not block.
pub trait SchemaListener: Send + Sync {
    /// A schema became durable (or was found durable during start-up)
    fn on_schema_added(&self, schema: &SchemaDescriptor);

    /// A schema was removed from the registry
    fn on_schema_removed(&self, fingerprint: SchemaFingerprint);
}

/// Durable, replicated schema store
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Replay every durable schema to `listener`, then keep it informed
    async fn start_up(&self, listener: Arc<dyn SchemaListener>) -> SchemaResult<()>;

    /// Durably register `schemas`; schemas already present are skipped
    async fn insert(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()>;

    /// Remove a schema that lost a conflict; absent schemas are ignored
    async fn delete(&self, schema: &SchemaDescriptor) -> SchemaResult<()>;

    /// Catch up with everything committed before this call
    async fn refresh(&self) -> SchemaResult<()>;

    /// Stop background work and fail pending waiters
    async fn shut_down(&self) -> SchemaResult<()>;
}

/// Shared registry handle
pub type Registry = Arc<dyn SchemaRegistry>;

/// Registry lifecycle shared by all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunState {
    New,
    Running,
    Stopped,
}

impl RunState {
    pub(crate) fn ensure_running(self) -> SchemaResult<()> {
        match self {
            RunState::Running => Ok(()),
            _ => Err(SchemaError::NotRunning),
        }
    }

    pub(crate) fn ensure_new(self) -> SchemaResult<()> {
        match self {
            RunState::New => Ok(()),
            RunState::Running => Err(SchemaError::IllegalState(
                "registry already started".to_string(),
            )),
            RunState::Stopped => Err(SchemaError::NotRunning),
        }
    }
}

/// Store clients handed to [`create_registry_with`]
#[derive(Clone, Default)]
pub struct StoreClients {
    pub table: Option<Arc<dyn SchemaTable>>,
    pub log: Option<Arc<dyn SchemaLog>>,
}

impl StoreClients {
    pub fn with_table(mut self, table: Arc<dyn SchemaTable>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn with_log(mut self, log: Arc<dyn SchemaLog>) -> Self {
        self.log = Some(log);
        self
    }
}

/// Create a registry from configuration, backed by fresh in-memory stores
pub fn create_registry(config: &RegistryConfig) -> SchemaResult<Registry> {
    let clients = match config {
        RegistryConfig::Memory => StoreClients::default(),
        RegistryConfig::Table(_) => {
            StoreClients::default().with_table(Arc::new(MemoryTable::default()))
        }
        RegistryConfig::Log(log) => {
            StoreClients::default().with_log(Arc::new(MemoryLog::new(log.topic.clone())))
        }
    };
    create_registry_with(config, clients)
}

/// Create a registry from configuration over the given store clients
pub fn create_registry_with(
    config: &RegistryConfig,
    clients: StoreClients,
) -> SchemaResult<Registry> {
    match config {
        RegistryConfig::Memory => Ok(Arc::new(MemoryRegistry::new())),
        RegistryConfig::Table(table_config) => {
            let table = clients.table.ok_or_else(|| {
                SchemaError::Config("table registry requires a table client".to_string())
            })?;
            Ok(Arc::new(TableRegistry::new(table_config.clone(), table)?))
        }
        RegistryConfig::Log(log_config) => {
            let log = clients.log.ok_or_else(|| {
                SchemaError::Config("log registry requires a log client".to_string())
            })?;
            Ok(Arc::new(LogRegistry::new(log_config.clone(), log)?))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::SchemaListener;
    use crate::fingerprint::SchemaFingerprint;
    use crate::types::SchemaDescriptor;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Event {
        Added(SchemaFingerprint),
        Removed(SchemaFingerprint),
    }

    /// Listener that records every notification in order
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingListener {
        pub(crate) fn events(&self) -> Vec<Event> {
            self.events.lock().clone()
        }

        pub(crate) fn added(&self) -> Vec<SchemaFingerprint> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    Event::Added(fp) => Some(*fp),
                    Event::Removed(_) => None,
                })
                .collect()
        }
    }

    impl SchemaListener for RecordingListener {
        fn on_schema_added(&self, schema: &SchemaDescriptor) {
            self.events.lock().push(Event::Added(schema.fingerprint()));
        }

        fn on_schema_removed(&self, fingerprint: SchemaFingerprint) {
            self.events.lock().push(Event::Removed(fingerprint));
        }
    }

    pub(crate) fn record(name: &str, field_type: &str) -> SchemaDescriptor {
        SchemaDescriptor::parse(&format!(
            r#"{{"type": "record", "name": "{}", "namespace": "test", "fields": [{{"name": "value", "type": "{}"}}]}}"#,
            name, field_type
        ))
        .unwrap()
    }
}
