//! Avro codec backed by a schema registry
//!
//! The codec keeps a local cache of every schema its registry has delivered and
//! runs the conflict protocol on top of it:
//!
//! 1. A proposal whose family already has another winner fails immediately.
//! 2. Otherwise the schemas are inserted into the registry.
//! 3. The registry's notifications decide the outcome: the first fingerprint
//!    delivered for a family wins, later ones lose and their waiters fail with
//!    [`SchemaError::Conflict`], even when the storage write itself succeeded.
//! 4. A loser is deleted from the registry, best effort.
//!
//! Lookups for fingerprints that are not cached yet park until the registry
//! delivers them. They never time out on their own; callers that need a
//! deadline wrap them in `tokio::time::timeout`.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = create_registry(&RegistryConfig::Memory)?;
//! let codec = AvroCodec::new(
//!     CodecConfig::new().with_package(SchemaPackage::new("shop").with_record::<Order>()?),
//!     registry,
//! );
//! codec.start().await?;
//!
//! let bytes = codec.packer_for::<Order>()?.pack(&order)?.into_bytes()?;
//! let order: Order = codec.to_unpackable(bytes).await?.read()?;
//! ```

mod catalog;

use crate::config::CodecConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::packer::{Packer, UnpackableRecord, Unpacker};
use crate::registry::{Registry, SchemaListener};
use crate::types::{AvroRecord, RecordTypeFamily, SchemaDescriptor, SchemaPackage};
use bytes::Bytes;
use catalog::{Catalog, Decision};
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::SharedMetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

/// Codec lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    New,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl CodecState {
    fn accepts_lookups(self) -> bool {
        matches!(
            self,
            CodecState::New | CodecState::Starting | CodecState::Running
        )
    }
}

/// Registry-backed Avro codec
///
/// Cheap to clone; clones share one cache and one registry.
#[derive(Clone)]
pub struct AvroCodec {
    inner: Arc<CodecInner>,
}

struct CodecInner {
    config: CodecConfig,
    registry: Registry,
    state: Mutex<CodecState>,
    catalog: RwLock<Catalog>,
    /// Type name -> fingerprint of every registered package entry
    registered_types: DashMap<String, SchemaFingerprint>,
    #[cfg(feature = "metrics")]
    metrics: OnceLock<SharedMetrics>,
}

/// Registry listener; holds the codec weakly so the registry does not keep it alive
struct CodecListener(Weak<CodecInner>);

impl SchemaListener for CodecListener {
    fn on_schema_added(&self, schema: &SchemaDescriptor) {
        if let Some(inner) = self.0.upgrade() {
            inner.schema_added(schema);
        }
    }

    fn on_schema_removed(&self, fingerprint: SchemaFingerprint) {
        if let Some(inner) = self.0.upgrade() {
            inner.schema_removed(fingerprint);
        }
    }
}

impl CodecInner {
    fn state(&self) -> CodecState {
        *self.state.lock()
    }

    fn transition(&self, from: CodecState, to: CodecState) -> SchemaResult<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SchemaError::IllegalState(format!(
                "cannot move codec from {:?} to {:?}",
                *state, to
            )));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: CodecState) {
        *self.state.lock() = to;
    }

    fn schema_added(&self, schema: &SchemaDescriptor) {
        let fingerprint = schema.fingerprint();
        let decision = self.catalog.write().admit(schema);

        match decision {
            Decision::Duplicate => {}
            Decision::Accepted(waiters) => {
                debug!(
                    fingerprint = %fingerprint,
                    waiters = waiters.len(),
                    "Schema added to codec cache"
                );
                for waiter in waiters {
                    let _ = waiter.send(Ok(schema.clone()));
                }
                #[cfg(feature = "metrics")]
                if let Some(metrics) = self.metrics.get() {
                    metrics.record_added();
                }
            }
            Decision::Rejected {
                family,
                winner,
                waiters,
            } => {
                warn!(
                    family = %family,
                    winner = %winner,
                    loser = %fingerprint,
                    "Schema lost its record type family"
                );
                for waiter in waiters {
                    let _ = waiter.send(Err(SchemaError::conflict(
                        family.clone(),
                        winner,
                        fingerprint,
                    )));
                }
                #[cfg(feature = "metrics")]
                if let Some(metrics) = self.metrics.get() {
                    metrics.record_conflict();
                }
            }
        }
        self.update_gauges();
    }

    fn schema_removed(&self, fingerprint: SchemaFingerprint) {
        let catalog = self.catalog.read();
        if catalog.is_loser(fingerprint) {
            debug!(fingerprint = %fingerprint, "Losing schema removed from registry");
        } else if catalog.get(fingerprint).is_some() {
            // The family stays bound to its first winner for this codec
            warn!(fingerprint = %fingerprint, "Registry removed a cached schema, keeping it");
        }
        #[cfg(feature = "metrics")]
        if let Some(metrics) = self.metrics.get() {
            metrics.record_removed();
        }
    }

    /// Remember a conflict reported outside the listener path
    ///
    /// Backends that reject a losing insert never deliver the loser, so the
    /// conflict they return is the only place this codec learns of it.
    fn schema_rejected(&self, error: &SchemaError) {
        let SchemaError::Conflict {
            family,
            winner,
            loser,
        } = error
        else {
            return;
        };

        let waiters = self.catalog.write().mark_loser(family, *winner, *loser);
        debug!(
            family = %family,
            winner = %winner,
            loser = %loser,
            waiters = waiters.len(),
            "Registry rejected losing schema"
        );
        for waiter in waiters {
            let _ = waiter.send(Err(SchemaError::conflict(family.clone(), *winner, *loser)));
        }
        self.update_gauges();
    }

    /// Resolve `fingerprint`, parking until the registry delivers it
    fn lookup(&self, fingerprint: SchemaFingerprint) -> BoxFuture<'static, SchemaResult<SchemaDescriptor>> {
        if let Some(schema) = self.catalog.read().get(fingerprint) {
            return future::ready(Ok(schema.clone())).boxed();
        }

        let rx = {
            let mut catalog = self.catalog.write();
            if let Some(schema) = catalog.get(fingerprint) {
                return future::ready(Ok(schema.clone())).boxed();
            }
            if let Some(conflict) = catalog.conflict_for(fingerprint) {
                return future::ready(Err(conflict)).boxed();
            }
            if !self.state().accepts_lookups() {
                return future::ready(Err(SchemaError::ShuttingDown)).boxed();
            }

            let (tx, rx) = oneshot::channel();
            catalog.park(fingerprint, tx);
            debug!(fingerprint = %fingerprint, "Waiting for schema");
            rx
        };
        self.update_gauges();

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(SchemaError::ShuttingDown),
            }
        }
        .boxed()
    }

    fn fail_waiters(&self) {
        let waiters = self.catalog.write().drain_waiters();
        if !waiters.is_empty() {
            info!(waiters = waiters.len(), "Failing pending schema lookups");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(SchemaError::ShuttingDown));
        }
        self.update_gauges();
    }

    #[cfg(feature = "metrics")]
    fn update_gauges(&self) {
        if let Some(metrics) = self.metrics.get() {
            let catalog = self.catalog.read();
            metrics.set_known_schemas(catalog.len());
            metrics.set_pending_lookups(catalog.pending());
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn update_gauges(&self) {}
}

impl AvroCodec {
    pub fn new(config: CodecConfig, registry: Registry) -> Self {
        Self {
            inner: Arc::new(CodecInner {
                config,
                registry,
                state: Mutex::new(CodecState::New),
                catalog: RwLock::new(Catalog::default()),
                registered_types: DashMap::new(),
                #[cfg(feature = "metrics")]
                metrics: OnceLock::new(),
            }),
        }
    }

    /// Record cache and conflict metrics into `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(self, metrics: SharedMetrics) -> Self {
        if self.inner.metrics.set(metrics).is_err() {
            warn!("Codec metrics already configured");
        }
        self
    }

    pub fn state(&self) -> CodecState {
        self.inner.state()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Start the registry and register the configured packages
    ///
    /// Any failure, including a conflict in a configured package, leaves the
    /// codec [`CodecState::Failed`].
    pub async fn start(&self) -> SchemaResult<()> {
        self.inner
            .transition(CodecState::New, CodecState::Starting)?;

        let listener = Arc::new(CodecListener(Arc::downgrade(&self.inner)));
        if let Err(e) = self.inner.registry.start_up(listener).await {
            error!(error = %e, "Schema registry failed to start");
            self.inner.set_state(CodecState::Failed);
            self.inner.fail_waiters();
            return Err(e);
        }

        for package in &self.inner.config.packages {
            if let Err(e) = self.register_package(package).await {
                error!(package = package.key(), error = %e, "Failed to register schema package");
                self.inner.set_state(CodecState::Failed);
                self.inner.fail_waiters();
                if let Err(shutdown_err) = self.inner.registry.shut_down().await {
                    warn!(error = %shutdown_err, "Failed to shut down schema registry");
                }
                return Err(e);
            }
        }

        self.inner
            .transition(CodecState::Starting, CodecState::Running)?;
        info!(
            packages = self.inner.config.packages.len(),
            schemas = self.inner.catalog.read().len(),
            "Avro codec started"
        );
        Ok(())
    }

    /// Shut the registry down and fail every pending lookup
    pub async fn stop(&self) -> SchemaResult<()> {
        self.inner
            .transition(CodecState::Running, CodecState::Stopping)?;

        let result = self.inner.registry.shut_down().await;
        self.inner.fail_waiters();
        self.inner.set_state(CodecState::Terminated);

        info!("Avro codec stopped");
        result
    }

    /// Force the registry to catch up
    pub async fn refresh(&self) -> SchemaResult<()> {
        self.inner.registry.refresh().await
    }

    fn ensure_registering(&self) -> SchemaResult<()> {
        match self.inner.state() {
            CodecState::Starting | CodecState::Running => Ok(()),
            state => Err(SchemaError::IllegalState(format!(
                "cannot register schemas while codec is {:?}",
                state
            ))),
        }
    }

    /// Register every record type of `package`
    ///
    /// On success the package's typed packers resolve through
    /// [`packer_for`](Self::packer_for) and [`packer_for_type`](Self::packer_for_type).
    pub async fn register_package(&self, package: &SchemaPackage) -> SchemaResult<()> {
        self.ensure_registered(package.descriptors()).await?;
        for entry in package.entries() {
            self.inner
                .registered_types
                .insert(entry.type_name.clone(), entry.descriptor.fingerprint());
        }
        info!(
            package = package.key(),
            schemas = package.entries().len(),
            "Registered schema package"
        );
        Ok(())
    }

    /// Register `schemas`, completing once every one of them has won its family
    pub async fn ensure_registered(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
        self.ensure_registering()?;

        let mut pending: Vec<SchemaDescriptor> = Vec::new();
        let proposed = {
            let catalog = self.inner.catalog.read();
            schemas.into_iter().try_for_each(|schema| -> SchemaResult<()> {
                catalog.check_proposed(&schema)?;
                let fingerprint = schema.fingerprint();
                if catalog.get(fingerprint).is_none()
                    && !pending.iter().any(|s| s.fingerprint() == fingerprint)
                {
                    pending.push(schema);
                }
                Ok(())
            })
        };
        if let Err(e) = proposed {
            self.inner.schema_rejected(&e);
            return Err(e);
        }
        if pending.is_empty() {
            return Ok(());
        }

        // Park before inserting so no notification can slip past
        let lookups: Vec<_> = pending
            .iter()
            .map(|schema| self.inner.lookup(schema.fingerprint()))
            .collect();

        debug!(schemas = pending.len(), "Inserting schemas into registry");
        if let Err(e) = self.inner.registry.insert(pending.clone()).await {
            drop(lookups);
            self.inner.schema_rejected(&e);
            self.inner.catalog.write().prune_abandoned();
            self.inner.update_gauges();
            return Err(e);
        }

        match future::try_join_all(lookups).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if let SchemaError::Conflict { loser, .. } = &e {
                    if let Some(schema) = pending.iter().find(|s| s.fingerprint() == *loser) {
                        self.clean_up_loser(schema).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn clean_up_loser(&self, schema: &SchemaDescriptor) {
        if !self.inner.config.cleanup_losers {
            return;
        }
        match self.inner.registry.delete(schema).await {
            Ok(()) => debug!(fingerprint = %schema.fingerprint(), "Deleted losing schema"),
            Err(e) => warn!(
                fingerprint = %schema.fingerprint(),
                error = %e,
                "Failed to delete losing schema"
            ),
        }
    }

    /// Packer for a record type registered through a package
    pub fn packer_for<T: AvroRecord>(&self) -> SchemaResult<Packer> {
        self.packer_for_type(T::type_name())
    }

    pub fn packer_for_type(&self, type_name: &str) -> SchemaResult<Packer> {
        let fingerprint = self
            .inner
            .registered_types
            .get(type_name)
            .map(|entry| *entry.value())
            .ok_or_else(|| SchemaError::NotRegistered(type_name.to_string()))?;

        self.inner
            .catalog
            .read()
            .get(fingerprint)
            .map(|schema| Packer::new(schema.clone()))
            .ok_or_else(|| SchemaError::NotRegistered(type_name.to_string()))
    }

    /// Packer for a schema that has already won its family
    pub fn packer_for_schema(&self, schema: &SchemaDescriptor) -> SchemaResult<Packer> {
        let fingerprint = schema.fingerprint();
        let catalog = self.inner.catalog.read();
        if let Some(known) = catalog.get(fingerprint) {
            return Ok(Packer::new(known.clone()));
        }
        Err(catalog
            .conflict_for(fingerprint)
            .unwrap_or_else(|| SchemaError::NotRegistered(fingerprint.to_string())))
    }

    /// Packer for `fingerprint`, waiting until the registry delivers it
    pub async fn find_registered_packer(&self, fingerprint: SchemaFingerprint) -> SchemaResult<Packer> {
        Ok(Packer::new(self.inner.lookup(fingerprint).await?))
    }

    /// Resolve the writer schema of a packed record
    pub async fn to_unpackable(&self, bytes: Bytes) -> SchemaResult<UnpackableRecord> {
        let (fingerprint, payload) = Unpacker::split(&bytes)?;
        let writer = self.inner.lookup(fingerprint).await?;
        Ok(UnpackableRecord::new(writer, payload))
    }

    /// Every cached fingerprint, sorted
    pub fn known_fingerprints(&self) -> Vec<SchemaFingerprint> {
        self.inner.catalog.read().fingerprints()
    }

    /// Fingerprint that won `family`, if decided
    pub fn winner_for(&self, family: &RecordTypeFamily) -> Option<SchemaFingerprint> {
        self.inner.catalog.read().winner_for(family)
    }

    /// Number of lookups parked on unknown fingerprints
    pub fn pending_lookups(&self) -> usize {
        self.inner.catalog.read().pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::record;
    use crate::registry::{MemoryRegistry, SchemaRegistry};
    use apache_avro::types::Value;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        value: i64,
    }

    impl AvroRecord for Order {
        fn schema_text() -> &'static str {
            r#"{"type": "record", "name": "Order", "namespace": "test", "fields": [{"name": "value", "type": "long"}]}"#
        }
    }

    /// Registry whose notifications are driven by the test
    #[derive(Default)]
    struct ManualRegistry {
        listener: Mutex<Option<Arc<dyn SchemaListener>>>,
        preloaded: Vec<SchemaDescriptor>,
        /// Delivered ahead of every insert, as if a peer committed first
        racers: Mutex<Vec<SchemaDescriptor>>,
        deleted: Mutex<Vec<SchemaFingerprint>>,
    }

    impl ManualRegistry {
        fn listener(&self) -> Arc<dyn SchemaListener> {
            self.listener.lock().clone().unwrap()
        }
    }

    #[async_trait]
    impl SchemaRegistry for ManualRegistry {
        async fn start_up(&self, listener: Arc<dyn SchemaListener>) -> SchemaResult<()> {
            for schema in &self.preloaded {
                listener.on_schema_added(schema);
            }
            *self.listener.lock() = Some(listener);
            Ok(())
        }

        async fn insert(&self, schemas: Vec<SchemaDescriptor>) -> SchemaResult<()> {
            let listener = self.listener();
            let racers: Vec<_> = self.racers.lock().drain(..).collect();
            for schema in racers.iter().chain(schemas.iter()) {
                listener.on_schema_added(schema);
            }
            Ok(())
        }

        async fn delete(&self, schema: &SchemaDescriptor) -> SchemaResult<()> {
            self.deleted.lock().push(schema.fingerprint());
            self.listener().on_schema_removed(schema.fingerprint());
            Ok(())
        }

        async fn refresh(&self) -> SchemaResult<()> {
            Ok(())
        }

        async fn shut_down(&self) -> SchemaResult<()> {
            Ok(())
        }
    }

    fn order_package() -> SchemaPackage {
        SchemaPackage::new("test").with_record::<Order>().unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_configured_packages() {
        let registry = Arc::new(MemoryRegistry::new());
        let codec = AvroCodec::new(
            CodecConfig::new().with_package(order_package()),
            registry.clone(),
        );
        codec.start().await.unwrap();
        assert_eq!(codec.state(), CodecState::Running);
        assert_eq!(registry.len().await, 1);

        let packer = codec.packer_for::<Order>().unwrap();
        let bytes = packer
            .pack(&Order { value: 42 })
            .unwrap()
            .into_bytes()
            .unwrap();
        let order: Order = codec.to_unpackable(bytes).await.unwrap().read().unwrap();
        assert_eq!(order, Order { value: 42 });

        codec.stop().await.unwrap();
        assert_eq!(codec.state(), CodecState::Terminated);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_reported() {
        let codec = AvroCodec::new(CodecConfig::new(), Arc::new(MemoryRegistry::new()));
        codec.start().await.unwrap();

        assert!(matches!(
            codec.packer_for::<Order>(),
            Err(SchemaError::NotRegistered(_))
        ));
        assert!(matches!(
            codec.packer_for_schema(&record("Order", "long")),
            Err(SchemaError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_illegal_transitions() {
        let codec = AvroCodec::new(CodecConfig::new(), Arc::new(MemoryRegistry::new()));
        assert!(matches!(codec.stop().await, Err(SchemaError::IllegalState(_))));
        assert!(matches!(
            codec.ensure_registered(vec![record("A", "long")]).await,
            Err(SchemaError::IllegalState(_))
        ));

        codec.start().await.unwrap();
        assert!(matches!(codec.start().await, Err(SchemaError::IllegalState(_))));

        codec.stop().await.unwrap();
        assert!(matches!(codec.stop().await, Err(SchemaError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_lookup_waits_for_registry() {
        let registry = Arc::new(ManualRegistry::default());
        let codec = AvroCodec::new(CodecConfig::new(), registry.clone());
        codec.start().await.unwrap();

        let order = record("Order", "long");
        let bytes = Packer::new(order.clone())
            .pack(&Order { value: 1 })
            .unwrap()
            .into_bytes()
            .unwrap();

        let pending = tokio::spawn({
            let codec = codec.clone();
            async move { codec.to_unpackable(bytes).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(codec.pending_lookups(), 1);

        registry.listener().on_schema_added(&order);
        let record = pending.await.unwrap().unwrap();
        assert_eq!(record.fingerprint(), order.fingerprint());
        assert_eq!(codec.pending_lookups(), 0);
    }

    #[tokio::test]
    async fn test_lost_race_fails_and_cleans_up() {
        let registry = Arc::new(ManualRegistry::default());
        let codec = AvroCodec::new(CodecConfig::new(), registry.clone());
        codec.start().await.unwrap();

        let winner = record("Order", "long");
        let loser = record("Order", "string");
        registry.racers.lock().push(winner.clone());

        let err = codec.ensure_registered(vec![loser.clone()]).await.unwrap_err();
        match &err {
            SchemaError::Conflict {
                winner: w, loser: l, ..
            } => {
                assert_eq!(*w, winner.fingerprint());
                assert_eq!(*l, loser.fingerprint());
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(*registry.deleted.lock(), vec![loser.fingerprint()]);
        assert_eq!(
            codec.winner_for(winner.family().unwrap()),
            Some(winner.fingerprint())
        );

        // The loser stays a loser after its removal
        assert!(codec
            .find_registered_packer(loser.fingerprint())
            .await
            .unwrap_err()
            .is_conflict());
        // And a new proposal fails without a registry round-trip
        assert!(codec
            .ensure_registered(vec![loser.clone()])
            .await
            .unwrap_err()
            .is_conflict());
        assert_eq!(registry.deleted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_schema_keeps_failing_lookups() {
        let codec = AvroCodec::new(CodecConfig::new(), Arc::new(MemoryRegistry::new()));
        codec.start().await.unwrap();

        let winner = record("Order", "long");
        let loser = record("Order", "string");
        codec.ensure_registered(vec![winner.clone()]).await.unwrap();
        assert!(codec
            .ensure_registered(vec![loser.clone()])
            .await
            .unwrap_err()
            .is_conflict());

        let lookup = tokio::time::timeout(
            Duration::from_secs(1),
            codec.find_registered_packer(loser.fingerprint()),
        )
        .await
        .expect("lookup for a rejected schema must not wait");
        match lookup {
            Err(SchemaError::Conflict { winner: w, .. }) => assert_eq!(w, winner.fingerprint()),
            other => panic!("expected conflict, got {:?}", other.map(|p| p.fingerprint())),
        }

        let bytes = Packer::new(loser.clone())
            .pack_value(Value::Record(vec![(
                "value".to_string(),
                Value::String("x".to_string()),
            )]))
            .unwrap()
            .into_bytes()
            .unwrap();
        assert!(codec.to_unpackable(bytes).await.unwrap_err().is_conflict());
        assert!(matches!(
            codec.packer_for_schema(&loser),
            Err(SchemaError::Conflict { .. })
        ));
        assert_eq!(codec.pending_lookups(), 0);
    }

    #[tokio::test]
    async fn test_batch_naming_family_twice_marks_no_loser() {
        let codec = AvroCodec::new(CodecConfig::new(), Arc::new(MemoryRegistry::new()));
        codec.start().await.unwrap();

        let long = record("Order", "long");
        let string = record("Order", "string");
        assert!(codec
            .ensure_registered(vec![long.clone(), string.clone()])
            .await
            .unwrap_err()
            .is_conflict());
        assert!(codec.winner_for(long.family().unwrap()).is_none());
        // Parked lookups of the failed batch were abandoned and pruned
        assert_eq!(codec.pending_lookups(), 0);

        codec.ensure_registered(vec![string.clone()]).await.unwrap();
        assert_eq!(
            codec.winner_for(string.family().unwrap()),
            Some(string.fingerprint())
        );
    }

    #[tokio::test]
    async fn test_cleanup_can_be_disabled() {
        let registry = Arc::new(ManualRegistry::default());
        let codec = AvroCodec::new(
            CodecConfig::new().with_cleanup_losers(false),
            registry.clone(),
        );
        codec.start().await.unwrap();

        registry.racers.lock().push(record("Order", "long"));
        assert!(codec
            .ensure_registered(vec![record("Order", "string")])
            .await
            .is_err());
        assert!(registry.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_package_fails_start() {
        let registry = Arc::new(ManualRegistry {
            preloaded: vec![record("Order", "string")],
            ..Default::default()
        });
        let codec = AvroCodec::new(
            CodecConfig::new().with_package(order_package()),
            registry,
        );

        assert!(codec.start().await.unwrap_err().is_conflict());
        assert_eq!(codec.state(), CodecState::Failed);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_lookups() {
        let registry = Arc::new(ManualRegistry::default());
        let codec = AvroCodec::new(CodecConfig::new(), registry);
        codec.start().await.unwrap();

        let pending = tokio::spawn({
            let codec = codec.clone();
            async move { codec.find_registered_packer(SchemaFingerprint(99)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        codec.stop().await.unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(SchemaError::ShuttingDown)
        ));
        assert!(matches!(
            codec.find_registered_packer(SchemaFingerprint(99)).await,
            Err(SchemaError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_removed_winner_stays_cached() {
        let order = record("Order", "long");
        let registry = Arc::new(ManualRegistry {
            preloaded: vec![order.clone()],
            ..Default::default()
        });
        let codec = AvroCodec::new(CodecConfig::new(), registry.clone());
        codec.start().await.unwrap();

        registry.listener().on_schema_removed(order.fingerprint());
        assert_eq!(codec.known_fingerprints(), vec![order.fingerprint()]);
        assert!(codec.packer_for_schema(&order).is_ok());
    }
}
