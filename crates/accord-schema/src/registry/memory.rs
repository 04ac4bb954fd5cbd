//! In-memory registry for testing and development

use super::{RunState, SchemaListener, SchemaRegistry};
use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::types::{RecordTypeFamily, SchemaDescriptor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// In-memory registry
///
/// Notifications are delivered synchronously from the calling task while the
/// registry lock is held, so they are totally ordered. A family that already
/// holds a different fingerprint rejects the insert with a conflict.
pub struct MemoryRegistry {
    inner: Mutex<MemoryState>,
}

struct MemoryState {
    state: RunState,
    listener: Option<Arc<dyn SchemaListener>>,
    /// Insertion order, used for the start-up replay
    order: Vec<SchemaFingerprint>,
    schemas: HashMap<SchemaFingerprint, SchemaDescriptor>,
    families: HashMap<RecordTypeFamily, SchemaFingerprint>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryState {
                state: RunState::New,
                listener: None,
                order: Vec::new(),
                schemas: HashMap::new(),
                families: HashMap::new(),
            }),
        }
    }

    /// Number of schemas currently stored
    pub async fn len(&self) -> usize {
        self.inner.lock().await.schemas.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaRegistry for MemoryRegistry {
    async fn start_up(&self, listener: Arc<dyn SchemaListener>) -> SchemaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.state.ensure_new()?;

        for fingerprint in &inner.order {
            if let Some(schema) = inner.schemas.get(fingerprint) {
                listener.on_schema_added(schema);
            }
        }

        info!(schemas = inner.schemas.len(), "Memory registry started");
        inner.listener = Some(listener);
        inner.state = RunState::Running;
        Ok(())
    }

    async fn insert(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.state.ensure_running()?;

        // Validate the whole batch before applying any of it
        let mut batch: Vec<SchemaDescriptor> = Vec::new();
        let mut batch_families: HashMap<RecordTypeFamily, SchemaFingerprint> = HashMap::new();
        for schema in schemas {
            let fingerprint = schema.fingerprint();
            if inner.schemas.contains_key(&fingerprint)
                || batch.iter().any(|s| s.fingerprint() == fingerprint)
            {
                continue;
            }
            if let Some(family) = schema.family() {
                let existing = inner
                    .families
                    .get(family)
                    .or_else(|| batch_families.get(family));
                if let Some(&winner) = existing {
                    return Err(SchemaError::conflict(family.clone(), winner, fingerprint));
                }
                batch_families.insert(family.clone(), fingerprint);
            }
            batch.push(schema);
        }

        for schema in batch {
            let fingerprint = schema.fingerprint();
            debug!(fingerprint = %fingerprint, "Registered schema");
            if let Some(family) = schema.family() {
                inner.families.insert(family.clone(), fingerprint);
            }
            inner.order.push(fingerprint);
            inner.schemas.insert(fingerprint, schema.clone());
            if let Some(listener) = &inner.listener {
                listener.on_schema_added(&schema);
            }
        }

        Ok(())
    }

    async fn delete(&self, schema: &SchemaDescriptor) -> SchemaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.state.ensure_running()?;

        let fingerprint = schema.fingerprint();
        if inner.schemas.remove(&fingerprint).is_none() {
            warn!(fingerprint = %fingerprint, "Delete of unknown schema ignored");
            return Ok(());
        }

        inner.order.retain(|fp| *fp != fingerprint);
        if let Some(family) = schema.family() {
            if inner.families.get(family) == Some(&fingerprint) {
                inner.families.remove(family);
            }
        }
        if let Some(listener) = &inner.listener {
            listener.on_schema_removed(fingerprint);
        }
        Ok(())
    }

    async fn refresh(&self) -> SchemaResult<()> {
        self.inner.lock().await.state.ensure_running()
    }

    async fn shut_down(&self) -> SchemaResult<()> {
        let mut inner = self.inner.lock().await;
        inner.state.ensure_running()?;
        inner.state = RunState::Stopped;
        inner.listener = None;
        info!("Memory registry stopped");
        Ok(())
    }
}
