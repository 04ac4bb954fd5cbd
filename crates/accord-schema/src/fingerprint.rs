//! 64-bit schema fingerprints
//!
//! Fingerprints are the CRC-64-AVRO (Rabin) hash of a schema's Parsing
//! Canonical Form, so two schemas that differ only in whitespace, docs or
//! attribute order share a fingerprint. On the wire a fingerprint is always
//! 8 bytes, big-endian.

use crate::error::{SchemaError, SchemaResult};
use apache_avro::rabin::Rabin;
use apache_avro::Schema;
use serde::{Deserialize, Serialize};

/// Content hash identifying a schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaFingerprint(pub u64);

impl SchemaFingerprint {
    /// Width of a fingerprint on the wire
    pub const SIZE: usize = 8;

    /// Fingerprint an already parsed schema
    pub fn of(schema: &Schema) -> Self {
        let digest = schema.fingerprint::<Rabin>();
        let mut bytes = [0u8; Self::SIZE];
        for (dst, src) in bytes.iter_mut().zip(digest.bytes.iter()) {
            *dst = *src;
        }
        Self(u64::from_le_bytes(bytes))
    }

    /// Parse schema text and fingerprint it
    pub fn compute(schema: &str) -> SchemaResult<Self> {
        let parsed = Schema::parse_str(schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self::of(&parsed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian wire representation
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_be_bytes()
    }

    /// Read a fingerprint from the first 8 bytes of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let prefix: [u8; Self::SIZE] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(prefix)))
    }

    /// Get fingerprint as hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Create from a hex-encoded fingerprint
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() != Self::SIZE {
            return None;
        }
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for SchemaFingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_compute() {
        let schema = r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "long"}]}"#;
        let fp = SchemaFingerprint::compute(schema).unwrap();

        // Should produce consistent fingerprints
        let fp2 = SchemaFingerprint::compute(schema).unwrap();
        assert_eq!(fp, fp2);
    }

    #[test]
    fn test_fingerprint_matches_avro_reference_value() {
        // Reference fingerprint for the "null" schema from the Avro specification test suite
        let fp = SchemaFingerprint::compute(r#""null""#).unwrap();
        assert_eq!(fp.0 as i64, 7195948357588979594);
    }

    #[test]
    fn test_fingerprint_normalization() {
        // Canonical form drops whitespace and doc attributes
        let schema1 = r#"{"type":"record","name":"User","fields":[{"name":"id","type":"long"}]}"#;
        let schema2 = r#"{
            "type" : "record",
            "name" : "User",
            "doc"  : "A user",
            "fields" : [ {"name": "id", "type": "long", "doc": "identifier"} ]
        }"#;

        let fp1 = SchemaFingerprint::compute(schema1).unwrap();
        let fp2 = SchemaFingerprint::compute(schema2).unwrap();
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn test_different_schemas_differ() {
        let fp1 = SchemaFingerprint::compute(r#""int""#).unwrap();
        let fp2 = SchemaFingerprint::compute(r#""string""#).unwrap();
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn test_wire_bytes_are_big_endian() {
        let fp = SchemaFingerprint(0x0102_0304_0506_0708);
        assert_eq!(fp.to_bytes(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(SchemaFingerprint::from_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 99]), Some(fp));
        assert_eq!(SchemaFingerprint::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn test_hex() {
        let fp = SchemaFingerprint::compute(r#""string""#).unwrap();
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 16); // 8 bytes = 16 hex chars
        assert_eq!(hex, fp.to_string());
        assert_eq!(SchemaFingerprint::from_hex(&hex), Some(fp));
        assert_eq!(SchemaFingerprint::from_hex("abcd"), None);
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let err = SchemaFingerprint::compute("{not avro").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidSchema(_)));
    }
}
