//! Fingerprint Hashing
//!
//! Serializes a canonical feature set into a fixed-layout byte sequence
//! and digests it with SHA-256. The layout is hand-rolled on purpose:
//! language-native serialization could vary across versions or runs,
//! and the digest must reproduce byte-for-byte forever.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::features::{CanonicalFeatureSet, FieldValue};
use crate::models::ProtocolFamily;

/// Digest width in bytes
pub const DIGEST_LEN: usize = 32;

/// Error parsing a fingerprint digest from hex text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("expected {expected} hex characters, got {got}")]
    BadLength { expected: usize, got: usize },
    #[error("invalid hex: {0}")]
    BadHex(String),
}

/// 256-bit fingerprint digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FingerprintDigest([u8; DIGEST_LEN]);

impl FingerprintDigest {
    pub fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Display for FingerprintDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FingerprintDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FingerprintDigest({})", hex::encode(self.0))
    }
}

impl FromStr for FingerprintDigest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != DIGEST_LEN * 2 {
            return Err(DigestParseError::BadLength {
                expected: DIGEST_LEN * 2,
                got: s.len(),
            });
        }
        let decoded = hex::decode(s).map_err(|e| DigestParseError::BadHex(e.to_string()))?;
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }
}

impl Serialize for FingerprintDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FingerprintDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A device fingerprint: the digest plus discovery metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub digest: FingerprintDigest,
    pub proto: ProtocolFamily,
    pub discovered_at: DateTime<Utc>,
}

impl Fingerprint {
    pub fn new(
        features: &CanonicalFeatureSet,
        proto: ProtocolFamily,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            digest: digest_features(features),
            proto,
            discovered_at,
        }
    }
}

// Value-kind bytes in the canonical layout
const KIND_ABSENT: u8 = 0x00;
const KIND_BOOL: u8 = 0x01;
const KIND_BYTE: u8 = 0x02;
const KIND_U16: u8 = 0x03;
const KIND_U32: u8 = 0x04;
const KIND_I8: u8 = 0x05;
const KIND_BYTE_LIST: u8 = 0x06;
const KIND_OUI_LIST: u8 = 0x07;
const KIND_STRING_LIST: u8 = 0x08;

/// Serialize a feature set into its canonical byte sequence.
///
/// Per field: tag byte, kind byte, big-endian u32 payload length,
/// payload. Fields appear in the extractor's fixed canonical order.
pub fn canonical_bytes(features: &CanonicalFeatureSet) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);

    for (tag, value) in features.fields() {
        out.push(*tag as u8);
        let (kind, payload) = encode_value(value);
        out.push(kind);
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&payload);
    }

    out
}

fn encode_value(value: &FieldValue) -> (u8, Vec<u8>) {
    match value {
        FieldValue::Absent => (KIND_ABSENT, Vec::new()),
        FieldValue::Bool(b) => (KIND_BOOL, vec![*b as u8]),
        FieldValue::Byte(b) => (KIND_BYTE, vec![*b]),
        FieldValue::U16(v) => (KIND_U16, v.to_be_bytes().to_vec()),
        FieldValue::U32(v) => (KIND_U32, v.to_be_bytes().to_vec()),
        FieldValue::I8(v) => (KIND_I8, vec![*v as u8]),
        FieldValue::ByteList(bytes) => (KIND_BYTE_LIST, bytes.clone()),
        FieldValue::OuiList(ouis) => {
            let mut payload = Vec::with_capacity(ouis.len() * 3);
            for oui in ouis {
                payload.extend_from_slice(oui.as_bytes());
            }
            (KIND_OUI_LIST, payload)
        }
        FieldValue::StringList(strings) => {
            let mut payload = Vec::new();
            for s in strings {
                payload.extend_from_slice(&(s.len() as u32).to_be_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
            (KIND_STRING_LIST, payload)
        }
    }
}

/// Digest a feature set
pub fn digest_features(features: &CanonicalFeatureSet) -> FingerprintDigest {
    digest_bytes(&canonical_bytes(features))
}

/// Digest an already-serialized canonical byte sequence
pub fn digest_bytes(bytes: &[u8]) -> FingerprintDigest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    FingerprintDigest(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract;
    use crate::models::{CaptureRecord, ProtocolFamily, WifiObservation};

    fn record(wifi: WifiObservation) -> CaptureRecord {
        CaptureRecord {
            mac: "aa:bb:cc:01:02:03".parse().unwrap(),
            proto: ProtocolFamily::WifiClient,
            signal_dbm: Some(-50),
            timestamp: Utc::now(),
            location: None,
            wifi: Some(wifi),
            bt: None,
        }
    }

    #[test]
    fn test_digest_is_deterministic() {
        let features = extract(&record(WifiObservation {
            supported_rates: vec![2, 4, 11, 22],
            ht_capabilities: Some(0x1234),
            ..Default::default()
        }));
        assert_eq!(digest_features(&features), digest_features(&features));
    }

    #[test]
    fn test_rate_shuffle_preserves_digest() {
        let a = extract(&record(WifiObservation {
            supported_rates: vec![22, 11, 4, 2],
            ..Default::default()
        }));
        let b = extract(&record(WifiObservation {
            supported_rates: vec![2, 4, 11, 22],
            ..Default::default()
        }));
        assert_eq!(digest_features(&a), digest_features(&b));
    }

    #[test]
    fn test_probe_history_order_changes_digest() {
        let a = extract(&record(WifiObservation {
            probed_ssids: vec!["Home".into(), "Work".into()],
            ..Default::default()
        }));
        let b = extract(&record(WifiObservation {
            probed_ssids: vec!["Work".into(), "Home".into()],
            ..Default::default()
        }));
        assert_ne!(digest_features(&a), digest_features(&b));
    }

    #[test]
    fn test_different_capabilities_different_digest() {
        let a = extract(&record(WifiObservation {
            supported_rates: vec![2, 4, 11],
            ..Default::default()
        }));
        let b = extract(&record(WifiObservation {
            supported_rates: vec![2, 4, 11, 22],
            ..Default::default()
        }));
        assert_ne!(digest_features(&a), digest_features(&b));
    }

    #[test]
    fn test_string_list_framing_is_unambiguous() {
        // ["ab", "c"] and ["a", "bc"] must not collide in the canonical
        // layout; both would concatenate to "abc" without framing.
        let a = extract(&record(WifiObservation {
            probed_ssids: vec!["ab".into(), "c".into()],
            ..Default::default()
        }));
        let b = extract(&record(WifiObservation {
            probed_ssids: vec!["a".into(), "bc".into()],
            ..Default::default()
        }));
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn test_digest_hex_roundtrip() {
        let features = extract(&record(WifiObservation::default()));
        let digest = digest_features(&features);
        let parsed: FingerprintDigest = digest.to_string().parse().unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(digest.to_string().len(), 64);
    }
}
