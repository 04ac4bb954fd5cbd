//! Packed record framing
//!
//! A packed record is self-describing:
//!
//! ```text
//! [fingerprint: 8 bytes big-endian][avro binary datum]
//! ```
//!
//! The fingerprint names the writer schema. Readers resolve it through the
//! codec, which may have to wait until the schema is registered by a peer.

use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::types::SchemaDescriptor;
use apache_avro::types::Value;
use apache_avro::{from_avro_datum, from_value, to_avro_datum, to_value};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;

/// Writes records of one registered schema
#[derive(Debug, Clone)]
pub struct Packer {
    descriptor: SchemaDescriptor,
}

impl Packer {
    pub fn new(descriptor: SchemaDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &SchemaDescriptor {
        &self.descriptor
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.descriptor.fingerprint()
    }

    /// Bind an Avro value to this packer's schema
    ///
    /// The value is resolved against the schema, so union branches and field
    /// order are normalized here rather than at encode time.
    pub fn pack_value(&self, value: Value) -> SchemaResult<PackableRecord> {
        let value = value.resolve(self.descriptor.schema())?;
        Ok(PackableRecord {
            packer: self.clone(),
            value,
        })
    }

    /// Serialize a typed record and bind it to this packer's schema
    pub fn pack<T: Serialize>(&self, record: &T) -> SchemaResult<PackableRecord> {
        self.pack_value(to_value(record)?)
    }
}

/// A value ready to be written with its writer schema
#[derive(Debug, Clone)]
pub struct PackableRecord {
    packer: Packer,
    value: Value,
}

impl PackableRecord {
    pub fn descriptor(&self) -> &SchemaDescriptor {
        self.packer.descriptor()
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.packer.fingerprint()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Encode as `[fingerprint][datum]`
    pub fn into_bytes(self) -> SchemaResult<Bytes> {
        let datum = to_avro_datum(self.packer.descriptor.schema(), self.value)?;
        let mut buf = BytesMut::with_capacity(SchemaFingerprint::SIZE + datum.len());
        buf.put_slice(&self.packer.fingerprint().to_bytes());
        buf.put_slice(&datum);
        Ok(buf.freeze())
    }
}

/// Splits packed records into fingerprint and payload
pub struct Unpacker;

impl Unpacker {
    pub fn split(bytes: &Bytes) -> SchemaResult<(SchemaFingerprint, Bytes)> {
        let fingerprint = SchemaFingerprint::from_bytes(bytes).ok_or_else(|| {
            SchemaError::InvalidWireFormat(format!(
                "packed record needs at least {} bytes, got {}",
                SchemaFingerprint::SIZE,
                bytes.len()
            ))
        })?;
        Ok((fingerprint, bytes.slice(SchemaFingerprint::SIZE..)))
    }
}

/// A packed payload with its resolved writer schema
///
/// Can be read any number of times, optionally projected onto a compatible
/// reader schema.
#[derive(Debug, Clone)]
pub struct UnpackableRecord {
    writer: SchemaDescriptor,
    payload: Bytes,
}

impl UnpackableRecord {
    pub fn new(writer: SchemaDescriptor, payload: Bytes) -> Self {
        Self { writer, payload }
    }

    pub fn writer(&self) -> &SchemaDescriptor {
        &self.writer
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.writer.fingerprint()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode with the writer schema
    pub fn read_value(&self) -> SchemaResult<Value> {
        let mut cursor = Cursor::new(self.payload.as_ref());
        Ok(from_avro_datum(self.writer.schema(), &mut cursor, None)?)
    }

    /// Decode and resolve onto `reader`
    pub fn read_value_as(&self, reader: &SchemaDescriptor) -> SchemaResult<Value> {
        let mut cursor = Cursor::new(self.payload.as_ref());
        Ok(from_avro_datum(
            self.writer.schema(),
            &mut cursor,
            Some(reader.schema()),
        )?)
    }

    pub fn read<T: DeserializeOwned>(&self) -> SchemaResult<T> {
        Ok(from_value::<T>(&self.read_value()?)?)
    }

    pub fn read_as<T: DeserializeOwned>(&self, reader: &SchemaDescriptor) -> SchemaResult<T> {
        Ok(from_value::<T>(&self.read_value_as(reader)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const ORDER_V1: &str = r#"{
        "type": "record", "name": "Order", "namespace": "shop",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "sku", "type": "string"}
        ]
    }"#;

    const ORDER_V2: &str = r#"{
        "type": "record", "name": "Order", "namespace": "shop",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "sku", "type": "string"},
            {"name": "note", "type": ["null", "string"], "default": null}
        ]
    }"#;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderV1 {
        id: i64,
        sku: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderV2 {
        id: i64,
        sku: String,
        note: Option<String>,
    }

    fn order() -> OrderV1 {
        OrderV1 {
            id: 7,
            sku: "A-100".to_string(),
        }
    }

    #[test]
    fn test_packed_layout() {
        let descriptor = SchemaDescriptor::parse(ORDER_V1).unwrap();
        let packer = Packer::new(descriptor.clone());
        let bytes = packer.pack(&order()).unwrap().into_bytes().unwrap();

        assert_eq!(&bytes[..8], &descriptor.fingerprint().to_bytes());
        // zigzag(7) = 14, then length-prefixed "A-100"
        assert_eq!(&bytes[8..], &[14, 10, b'A', b'-', b'1', b'0', b'0']);
    }

    #[test]
    fn test_pack_and_read_back() {
        let descriptor = SchemaDescriptor::parse(ORDER_V1).unwrap();
        let bytes = Packer::new(descriptor.clone())
            .pack(&order())
            .unwrap()
            .into_bytes()
            .unwrap();

        let (fingerprint, payload) = Unpacker::split(&bytes).unwrap();
        assert_eq!(fingerprint, descriptor.fingerprint());

        let record = UnpackableRecord::new(descriptor, payload);
        assert_eq!(record.read::<OrderV1>().unwrap(), order());
        // Readable more than once
        assert!(record.read_value().is_ok());
    }

    #[test]
    fn test_read_with_newer_reader_schema() {
        let writer = SchemaDescriptor::parse(ORDER_V1).unwrap();
        let reader = SchemaDescriptor::parse(ORDER_V2).unwrap();
        let bytes = Packer::new(writer.clone())
            .pack(&order())
            .unwrap()
            .into_bytes()
            .unwrap();
        let (_, payload) = Unpacker::split(&bytes).unwrap();

        let upgraded: OrderV2 = UnpackableRecord::new(writer, payload)
            .read_as(&reader)
            .unwrap();
        assert_eq!(
            upgraded,
            OrderV2 {
                id: 7,
                sku: "A-100".to_string(),
                note: None
            }
        );
    }

    #[test]
    fn test_pack_rejects_mismatched_value() {
        let packer = Packer::new(SchemaDescriptor::parse(ORDER_V1).unwrap());
        assert!(packer.pack_value(Value::Long(3)).is_err());
    }

    #[test]
    fn test_split_rejects_short_input() {
        let err = Unpacker::split(&Bytes::from_static(&[1, 2, 3])).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidWireFormat(_)));
    }
}
