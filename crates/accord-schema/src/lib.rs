//! # Accord Schema
//!
//! A replicated Avro schema catalog for services that exchange self-describing
//! records. Every process keeps a local cache of schemas keyed by fingerprint
//! and agrees with its peers on exactly one schema per record type family.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  EnvelopeCodec                                              │
//! │  └── primary record + metadata + annotations                │
//! ├─────────────────────────────────────────────────────────────┤
//! │  AvroCodec                                                  │
//! │  ├── Packers / Unpackers  [fingerprint][avro datum]         │
//! │  ├── Catalog: fingerprint -> schema, family -> winner       │
//! │  └── Lookups that wait for schemas registered by peers      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SchemaRegistry (one listener, commit order)                │
//! │  ├── Memory (single process)                                │
//! │  ├── Table  (optimistic sequence numbers)                   │
//! │  └── Log    (compacted topic, tailed)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Conflict Resolution
//!
//! The codec decides winners: the first fingerprint of a family delivered by
//! its registry wins, and every later fingerprint of the same family is a
//! loser. Because registries deliver in the same durable order to every
//! process, all codecs reach the same decision without coordinating.
//!
//! The memory and table registries also refuse to store a second fingerprint
//! for a family they already hold, so a losing insert fails with
//! [`SchemaError::Conflict`] and the codec marks the loser right away. The log
//! registry stores every write; a codec whose registration lost there removes
//! its own schema from the registry again.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use accord_schema::{AvroCodec, CodecConfig, MemoryRegistry};
//! use std::sync::Arc;
//!
//! let codec = AvroCodec::new(CodecConfig::new(), Arc::new(MemoryRegistry::new()));
//! codec.start().await?;
//!
//! codec.ensure_registered(vec![SchemaDescriptor::of::<Order>()?]).await?;
//! let bytes = codec.packer_for::<Order>()?.pack(&order)?.into_bytes()?;
//!
//! let order: Order = codec.to_unpackable(bytes).await?.read()?;
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! [fingerprint: 8 bytes big-endian][avro_binary_data]
//! ```
//!
//! The fingerprint is the 64-bit Rabin fingerprint of the schema's Parsing
//! Canonical Form.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod error;
pub mod fingerprint;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod packer;
pub mod registry;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use codec::{AvroCodec, CodecState};
pub use config::{
    Acks, CodecConfig, EnvelopeConfig, LogClientConfig, LogRegistryConfig, OffsetReset,
    RegistryConfig, TableRegistryConfig,
};
pub use envelope::{
    Clock, EnvelopeCodec, EnvelopeMetadata, MessageEnvelope, SystemClock,
    UnpackableMessageEnvelope,
};
pub use error::{SchemaError, SchemaResult};
pub use fingerprint::SchemaFingerprint;
#[cfg(feature = "metrics")]
pub use metrics::{CatalogMetrics, MetricsConfig, SharedMetrics};
pub use packer::{PackableRecord, Packer, UnpackableRecord, Unpacker};
pub use registry::{
    create_registry, create_registry_with, LogRegistry, MemoryRegistry, Registry, SchemaListener,
    SchemaRegistry, StoreClients, TableRegistry,
};
pub use store::{MemoryLog, MemoryTable, SchemaLog, SchemaTable};
pub use types::{AvroRecord, PackageEntry, RecordTypeFamily, SchemaDescriptor, SchemaPackage};
