//! Message envelopes
//!
//! An envelope wraps one primary record with metadata and any number of
//! annotation records. It is itself a packed record of a built-in schema:
//!
//! ```text
//! accord.envelope.MessageEnvelope {
//!     timestamp:   long                  (epoch millis)
//!     unique_id:   ["null", "bytes"]     (16-byte UUID)
//!     metadata:    Metadata { tags: map<string>, application, owner,
//!                             environment, deployment_stage: ["null", "string"] }
//!     primary:     bytes                 (packed record)
//!     annotations: array<bytes>          (packed records)
//! }
//! ```
//!
//! Annotations are keyed by record type family; an envelope carries at most
//! one annotation per family.

use crate::codec::AvroCodec;
use crate::config::EnvelopeConfig;
use crate::error::{SchemaError, SchemaResult};
use crate::packer::{PackableRecord, Packer, UnpackableRecord, Unpacker};
use crate::types::{RecordTypeFamily, SchemaDescriptor};
use apache_avro::types::Value;
use apache_avro::from_avro_datum;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const ENVELOPE_SCHEMA: &str = r#"{
    "type": "record",
    "name": "MessageEnvelope",
    "namespace": "accord.envelope",
    "fields": [
        {"name": "timestamp", "type": "long"},
        {"name": "unique_id", "type": ["null", "bytes"], "default": null},
        {"name": "metadata", "type": {
            "type": "record",
            "name": "Metadata",
            "fields": [
                {"name": "tags", "type": {"type": "map", "values": "string"}},
                {"name": "application", "type": ["null", "string"], "default": null},
                {"name": "owner", "type": ["null", "string"], "default": null},
                {"name": "environment", "type": ["null", "string"], "default": null},
                {"name": "deployment_stage", "type": ["null", "string"], "default": null}
            ]
        }},
        {"name": "primary", "type": "bytes"},
        {"name": "annotations", "type": {"type": "array", "items": "bytes"}}
    ]
}"#;

/// Source of envelope timestamps
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Descriptive metadata carried by every envelope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub tags: BTreeMap<String, String>,
    pub application: Option<String>,
    pub owner: Option<String>,
    pub environment: Option<String>,
    pub deployment_stage: Option<String>,
}

impl From<&EnvelopeConfig> for EnvelopeMetadata {
    fn from(config: &EnvelopeConfig) -> Self {
        Self {
            tags: config.tags.clone(),
            application: config.application.clone(),
            owner: config.owner.clone(),
            environment: config.environment.clone(),
            deployment_stage: config.deployment_stage.clone(),
        }
    }
}

impl EnvelopeMetadata {
    fn to_value(&self) -> Value {
        let tags = self
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Record(vec![
            ("tags".to_string(), Value::Map(tags)),
            ("application".to_string(), optional_string(&self.application)),
            ("owner".to_string(), optional_string(&self.owner)),
            ("environment".to_string(), optional_string(&self.environment)),
            (
                "deployment_stage".to_string(),
                optional_string(&self.deployment_stage),
            ),
        ])
    }

    fn from_value(value: Value) -> SchemaResult<Self> {
        let mut fields = record_fields(value, "metadata")?;
        let tags = match fields.remove("tags") {
            Some(Value::Map(map)) => map
                .into_iter()
                .map(|(k, v)| match v {
                    Value::String(s) => Ok((k, s)),
                    other => Err(malformed(&format!("tag {} is {:?}", k, other))),
                })
                .collect::<SchemaResult<BTreeMap<_, _>>>()?,
            other => return Err(malformed(&format!("tags is {:?}", other))),
        };
        Ok(Self {
            tags,
            application: take_optional_string(&mut fields, "application")?,
            owner: take_optional_string(&mut fields, "owner")?,
            environment: take_optional_string(&mut fields, "environment")?,
            deployment_stage: take_optional_string(&mut fields, "deployment_stage")?,
        })
    }
}

/// An envelope ready to be serialized
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    timestamp: i64,
    unique_id: Option<Uuid>,
    metadata: EnvelopeMetadata,
    primary: Bytes,
    annotations: Vec<(RecordTypeFamily, Bytes)>,
    packer: Packer,
}

impl MessageEnvelope {
    /// Epoch millis
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn unique_id(&self) -> Option<Uuid> {
        self.unique_id
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    /// Packed primary record
    pub fn primary(&self) -> &Bytes {
        &self.primary
    }

    pub fn annotation_families(&self) -> impl Iterator<Item = &RecordTypeFamily> {
        self.annotations.iter().map(|(family, _)| family)
    }

    pub fn serialize(&self) -> SchemaResult<Bytes> {
        let unique_id = match self.unique_id {
            Some(id) => Value::Union(1, Box::new(Value::Bytes(id.as_bytes().to_vec()))),
            None => Value::Union(0, Box::new(Value::Null)),
        };
        let annotations = self
            .annotations
            .iter()
            .map(|(_, bytes)| Value::Bytes(bytes.to_vec()))
            .collect();

        let value = Value::Record(vec![
            ("timestamp".to_string(), Value::Long(self.timestamp)),
            ("unique_id".to_string(), unique_id),
            ("metadata".to_string(), self.metadata.to_value()),
            ("primary".to_string(), Value::Bytes(self.primary.to_vec())),
            ("annotations".to_string(), Value::Array(annotations)),
        ]);
        self.packer.pack_value(value)?.into_bytes()
    }
}

/// An envelope whose embedded schemas have all been resolved
#[derive(Debug, Clone)]
pub struct UnpackableMessageEnvelope {
    timestamp: i64,
    unique_id: Option<Uuid>,
    metadata: EnvelopeMetadata,
    primary: UnpackableRecord,
    annotations: HashMap<RecordTypeFamily, UnpackableRecord>,
}

impl UnpackableMessageEnvelope {
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Timestamp as a UTC date-time; `None` if out of range
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    pub fn unique_id(&self) -> Option<Uuid> {
        self.unique_id
    }

    pub fn metadata(&self) -> &EnvelopeMetadata {
        &self.metadata
    }

    pub fn primary(&self) -> &UnpackableRecord {
        &self.primary
    }

    pub fn annotation(&self, family: &RecordTypeFamily) -> Option<&UnpackableRecord> {
        self.annotations.get(family)
    }

    pub fn annotations(&self) -> &HashMap<RecordTypeFamily, UnpackableRecord> {
        &self.annotations
    }
}

/// Builds and loads [`MessageEnvelope`]s
#[derive(Clone)]
pub struct EnvelopeCodec {
    codec: AvroCodec,
    config: EnvelopeConfig,
    clock: Arc<dyn Clock>,
    packer: Packer,
}

impl EnvelopeCodec {
    pub fn new(codec: AvroCodec, config: EnvelopeConfig) -> SchemaResult<Self> {
        let descriptor = SchemaDescriptor::parse(ENVELOPE_SCHEMA)?;
        Ok(Self {
            codec,
            config,
            clock: Arc::new(SystemClock),
            packer: Packer::new(descriptor),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Schema every serialized envelope is packed with
    pub fn envelope_schema(&self) -> &SchemaDescriptor {
        self.packer.descriptor()
    }

    /// Assemble an envelope from already packed parts
    pub fn build_message_envelope(
        &self,
        timestamp: i64,
        unique_id: Option<Uuid>,
        primary: PackableRecord,
        metadata: EnvelopeMetadata,
        annotations: Vec<PackableRecord>,
    ) -> SchemaResult<MessageEnvelope> {
        let mut packed: Vec<(RecordTypeFamily, Bytes)> = Vec::with_capacity(annotations.len());
        for annotation in annotations {
            let family = annotation_family(annotation.descriptor())?;
            if packed.iter().any(|(f, _)| *f == family) {
                return Err(SchemaError::DuplicateAnnotation(family));
            }
            packed.push((family, annotation.into_bytes()?));
        }

        Ok(MessageEnvelope {
            timestamp,
            unique_id,
            metadata,
            primary: primary.into_bytes()?,
            annotations: packed,
            packer: self.packer.clone(),
        })
    }

    /// Envelope stamped with the clock, a random id and the configured metadata
    pub fn new_envelope(
        &self,
        primary: PackableRecord,
        annotations: Vec<PackableRecord>,
    ) -> SchemaResult<MessageEnvelope> {
        self.build_message_envelope(
            self.clock.now_millis(),
            Some(Uuid::new_v4()),
            primary,
            EnvelopeMetadata::from(&self.config),
            annotations,
        )
    }

    /// Parse an envelope and resolve every embedded schema
    ///
    /// The outer framing is decoded immediately; the primary record and the
    /// annotations are then resolved concurrently and the call completes once
    /// all of them are known.
    pub async fn load_envelope(&self, bytes: Bytes) -> SchemaResult<UnpackableMessageEnvelope> {
        let raw = self.parse(&bytes)?;

        let (primary, annotations) = futures::try_join!(
            self.codec.to_unpackable(raw.primary),
            try_join_all(
                raw.annotations
                    .into_iter()
                    .map(|annotation| self.codec.to_unpackable(annotation))
            ),
        )?;

        let mut keyed = HashMap::with_capacity(annotations.len());
        for annotation in annotations {
            let family = annotation_family(annotation.writer())?;
            if keyed.contains_key(&family) {
                return Err(SchemaError::DuplicateAnnotation(family));
            }
            keyed.insert(family, annotation);
        }

        debug!(
            primary = %primary.fingerprint(),
            annotations = keyed.len(),
            "Loaded message envelope"
        );
        Ok(UnpackableMessageEnvelope {
            timestamp: raw.timestamp,
            unique_id: raw.unique_id,
            metadata: raw.metadata,
            primary,
            annotations: keyed,
        })
    }

    fn parse(&self, bytes: &Bytes) -> SchemaResult<RawEnvelope> {
        let (fingerprint, payload) = Unpacker::split(bytes)?;
        if fingerprint != self.packer.fingerprint() {
            return Err(SchemaError::InvalidWireFormat(format!(
                "not a message envelope: schema {}",
                fingerprint
            )));
        }

        let mut cursor = Cursor::new(payload.as_ref());
        let value = from_avro_datum(self.packer.descriptor().schema(), &mut cursor, None)?;
        RawEnvelope::from_value(value)
    }
}

/// Envelope framing before embedded schemas are resolved
struct RawEnvelope {
    timestamp: i64,
    unique_id: Option<Uuid>,
    metadata: EnvelopeMetadata,
    primary: Bytes,
    annotations: Vec<Bytes>,
}

impl RawEnvelope {
    fn from_value(value: Value) -> SchemaResult<Self> {
        let mut fields = record_fields(value, "envelope")?;

        let timestamp = match fields.remove("timestamp") {
            Some(Value::Long(ts)) => ts,
            other => return Err(malformed(&format!("timestamp is {:?}", other))),
        };
        let unique_id = match fields.remove("unique_id").map(unwrap_union) {
            Some(Value::Bytes(bytes)) => Some(
                Uuid::from_slice(&bytes)
                    .map_err(|e| malformed(&format!("unique_id: {}", e)))?,
            ),
            Some(Value::Null) | None => None,
            Some(other) => return Err(malformed(&format!("unique_id is {:?}", other))),
        };
        let metadata = match fields.remove("metadata") {
            Some(value) => EnvelopeMetadata::from_value(value)?,
            None => return Err(malformed("metadata missing")),
        };
        let primary = match fields.remove("primary") {
            Some(Value::Bytes(bytes)) => Bytes::from(bytes),
            other => return Err(malformed(&format!("primary is {:?}", other))),
        };
        let annotations = match fields.remove("annotations") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::Bytes(bytes) => Ok(Bytes::from(bytes)),
                    other => Err(malformed(&format!("annotation is {:?}", other))),
                })
                .collect::<SchemaResult<Vec<_>>>()?,
            other => return Err(malformed(&format!("annotations is {:?}", other))),
        };

        Ok(Self {
            timestamp,
            unique_id,
            metadata,
            primary,
            annotations,
        })
    }
}

fn annotation_family(descriptor: &SchemaDescriptor) -> SchemaResult<RecordTypeFamily> {
    descriptor.family().cloned().ok_or_else(|| {
        SchemaError::InvalidSchema(format!(
            "annotation schema {} is not a named type",
            descriptor.fingerprint()
        ))
    })
}

fn record_fields(value: Value, what: &str) -> SchemaResult<HashMap<String, Value>> {
    match value {
        Value::Record(fields) => Ok(fields.into_iter().collect()),
        other => Err(malformed(&format!("{} is {:?}", what, other))),
    }
}

fn unwrap_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn optional_string(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Union(1, Box::new(Value::String(s.clone()))),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

fn take_optional_string(
    fields: &mut HashMap<String, Value>,
    name: &str,
) -> SchemaResult<Option<String>> {
    match fields.remove(name).map(unwrap_union) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(malformed(&format!("{} is {:?}", name, other))),
    }
}

fn malformed(detail: &str) -> SchemaError {
    SchemaError::InvalidWireFormat(format!("malformed envelope: {}", detail))
}
