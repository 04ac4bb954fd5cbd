//! Prometheus metrics for the schema catalog
//!
//! # Metrics Overview
//!
//! ## Counters
//! - `accord_schema_schemas_added_total` - Schemas observed by a codec
//! - `accord_schema_schemas_removed_total` - Schema removals observed by a codec
//! - `accord_schema_conflicts_total` - Fingerprints that lost their family
//! - `accord_schema_insert_retries_total` - Table inserts retried after losing a sequence race
//! - `accord_schema_refreshes_total` - Registry catch-up reads, by backend
//!
//! ## Gauges
//! - `accord_schema_known_schemas` - Schemas in the codec cache
//! - `accord_schema_pending_lookups` - Lookups waiting for a fingerprint
//!
//! # Example
//!
//! ```rust,ignore
//! let metrics = CatalogMetrics::new(MetricsConfig::new().with_prefix("billing_schema"))?;
//! let codec = AvroCodec::new(config, registry).with_metrics(Arc::new(metrics));
//! ```

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics configuration
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Prefix for all metric names (default: "accord_schema")
    pub prefix: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prefix: "accord_schema".to_string(),
        }
    }
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the metric prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Prometheus metrics for codecs and registries
pub struct CatalogMetrics {
    registry: Registry,

    schemas_added: Counter,
    schemas_removed: Counter,
    conflicts: Counter,
    insert_retries: Counter,
    refreshes: CounterVec,

    known_schemas: Gauge,
    pending_lookups: Gauge,
}

impl CatalogMetrics {
    pub fn new(config: MetricsConfig) -> Result<Self, prometheus::Error> {
        Self::with_registry(config, Registry::new())
    }

    /// Create metrics registered into an existing prometheus registry
    pub fn with_registry(
        config: MetricsConfig,
        registry: Registry,
    ) -> Result<Self, prometheus::Error> {
        let prefix = &config.prefix;

        let schemas_added = Counter::new(
            format!("{}_schemas_added_total", prefix),
            "Total number of schemas observed",
        )?;
        let schemas_removed = Counter::new(
            format!("{}_schemas_removed_total", prefix),
            "Total number of schema removals observed",
        )?;
        let conflicts = Counter::new(
            format!("{}_conflicts_total", prefix),
            "Total number of fingerprints that lost their record type family",
        )?;
        let insert_retries = Counter::new(
            format!("{}_insert_retries_total", prefix),
            "Total number of table inserts retried after a sequence race",
        )?;
        let refreshes = CounterVec::new(
            Opts::new(
                format!("{}_refreshes_total", prefix),
                "Total number of registry catch-up reads",
            ),
            &["backend"],
        )?;

        let known_schemas = Gauge::new(
            format!("{}_known_schemas", prefix),
            "Current number of schemas in the codec cache",
        )?;
        let pending_lookups = Gauge::new(
            format!("{}_pending_lookups", prefix),
            "Current number of lookups waiting for a fingerprint",
        )?;

        registry.register(Box::new(schemas_added.clone()))?;
        registry.register(Box::new(schemas_removed.clone()))?;
        registry.register(Box::new(conflicts.clone()))?;
        registry.register(Box::new(insert_retries.clone()))?;
        registry.register(Box::new(refreshes.clone()))?;
        registry.register(Box::new(known_schemas.clone()))?;
        registry.register(Box::new(pending_lookups.clone()))?;

        Ok(Self {
            registry,
            schemas_added,
            schemas_removed,
            conflicts,
            insert_retries,
            refreshes,
            known_schemas,
            pending_lookups,
        })
    }

    pub fn record_added(&self) {
        self.schemas_added.inc();
    }

    pub fn record_removed(&self) {
        self.schemas_removed.inc();
    }

    pub fn record_conflict(&self) {
        self.conflicts.inc();
    }

    pub fn record_insert_retry(&self) {
        self.insert_retries.inc();
    }

    pub fn record_refresh(&self, backend: &str) {
        self.refreshes.with_label_values(&[backend]).inc();
    }

    pub fn set_known_schemas(&self, count: usize) {
        self.known_schemas.set(count as f64);
    }

    pub fn set_pending_lookups(&self, count: usize) {
        self.pending_lookups.set(count as f64);
    }

    /// Render all metrics in Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Shared handle used by codecs and registries
pub type SharedMetrics = Arc<CatalogMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_prefixed_metrics() {
        let metrics = CatalogMetrics::new(MetricsConfig::new().with_prefix("test_catalog")).unwrap();
        metrics.record_added();
        metrics.record_conflict();
        metrics.record_refresh("table");
        metrics.set_pending_lookups(3);

        let output = metrics.render().unwrap();
        assert!(output.contains("test_catalog_schemas_added_total 1"));
        assert!(output.contains("test_catalog_conflicts_total 1"));
        assert!(output.contains("test_catalog_refreshes_total{backend=\"table\"} 1"));
        assert!(output.contains("test_catalog_pending_lookups 3"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        CatalogMetrics::with_registry(MetricsConfig::new(), registry.clone()).unwrap();
        assert!(CatalogMetrics::with_registry(MetricsConfig::new(), registry).is_err());
    }
}
