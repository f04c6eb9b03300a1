//! Signature Store
//!
//! Persists fingerprint → identity mappings and serves the Matcher's
//! exact and partial tiers. The store is an injected handle, never a
//! process-wide singleton, so independent pipelines can run with
//! isolated or shared stores by explicit choice.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::features::{CanonicalFeatureSet, FieldTag, FieldValue};
use crate::hasher::FingerprintDigest;
use crate::mac::Oui;
use crate::models::ProtocolFamily;

/// Store failure taxonomy. `Unavailable` is the degraded-mode signal:
/// the Matcher keeps operating on whitelist tiers alone.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("signature store unavailable: {0}")]
    Unavailable(String),
    #[error("suspected digest collision for {digest}: canonical bytes differ from stored signature")]
    CollisionSuspected { digest: FingerprintDigest },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Identifying-field subset of a signature, used by the partial-match
/// tier when the full digest differs (firmware drift between revisions
/// of the same model)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifyingFields {
    pub vendor_ouis: Vec<Oui>,
    pub ht_capabilities: Option<u16>,
    pub vht_capabilities: Option<u32>,
    pub rate_set: Vec<u8>,
    pub bt_device_class: Option<u32>,
}

impl IdentifyingFields {
    pub fn from_features(features: &CanonicalFeatureSet) -> Self {
        let mut out = Self::default();
        for (tag, value) in features.fields() {
            match (tag, value) {
                (FieldTag::VendorOuis, FieldValue::OuiList(ouis)) => {
                    out.vendor_ouis = ouis.clone();
                }
                (FieldTag::HtCapabilities, FieldValue::U16(v)) => {
                    out.ht_capabilities = Some(*v);
                }
                (FieldTag::VhtCapabilities, FieldValue::U32(v)) => {
                    out.vht_capabilities = Some(*v);
                }
                (FieldTag::RateSet, FieldValue::ByteList(rates)) => {
                    out.rate_set = rates.clone();
                }
                (FieldTag::BtDeviceClass, FieldValue::U32(v)) => {
                    out.bt_device_class = Some(*v);
                }
                _ => {}
            }
        }
        out
    }
}

/// Persisted fingerprint → identity mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub digest: FingerprintDigest,
    pub proto: ProtocolFamily,
    pub device_type: Option<String>,
    pub model_hint: Option<String>,
    /// Externally curated quality signal, 0.0–1.0. Never raised or
    /// lowered by observation counts alone.
    pub confidence: f64,
    pub identifying: IdentifyingFields,
    pub first_seen: DateTime<Utc>,
    pub times_seen: u64,
}

/// Candidate for a new or repeated observation
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub digest: FingerprintDigest,
    pub proto: ProtocolFamily,
    pub device_type: Option<String>,
    pub model_hint: Option<String>,
    pub identifying: IdentifyingFields,
    /// Canonical feature bytes, kept so a digest collision between
    /// semantically different feature sets is detectable
    pub canonical: Vec<u8>,
    pub observed_at: DateTime<Utc>,
}

/// Storage seam for signature persistence
pub trait SignatureStore: Send + Sync {
    /// Exact-key retrieval
    fn lookup(&self, digest: &FingerprintDigest) -> Result<Option<SignatureRecord>, StoreError>;

    /// Create on first sighting (confidence seeded from the learning
    /// policy) or increment `times_seen` on a repeat sighting, leaving
    /// confidence untouched. A repeat sighting whose canonical bytes
    /// differ from the stored ones is a suspected digest collision.
    fn upsert_observation(
        &self,
        candidate: &NewSignature,
        seed_confidence: f64,
    ) -> Result<SignatureRecord, StoreError>;

    /// Signatures indexed by vendor-IE OUI, backing the partial tier
    fn find_by_vendor_oui(&self, oui: &Oui) -> Result<Vec<SignatureRecord>, StoreError>;

    /// Barrier for shutdown: all accepted writes are durable on return
    fn flush(&self) -> Result<(), StoreError>;
}

/// SQLite-backed signature store
#[derive(Clone)]
pub struct SqliteSignatureStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSignatureStore {
    /// Open or create the store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }

        let conn = Connection::open(&path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        info!("Opened signature store at {}", path.as_ref().display());
        Ok(store)
    }

    /// Open an in-memory store (for testing and ephemeral runs)
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signatures (
                digest TEXT PRIMARY KEY,
                proto TEXT NOT NULL,
                device_type TEXT,
                model_hint TEXT,
                confidence REAL NOT NULL,
                identifying TEXT NOT NULL,
                canonical BLOB NOT NULL,
                first_seen TEXT NOT NULL,
                times_seen INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS signature_ouis (
                digest TEXT NOT NULL,
                oui TEXT NOT NULL,
                PRIMARY KEY (digest, oui)
            );
            CREATE INDEX IF NOT EXISTS idx_signature_ouis_oui ON signature_ouis(oui);
            "#,
        )?;

        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignatureRecord> {
        let digest: String = row.get(0)?;
        let proto: String = row.get(1)?;
        let identifying: String = row.get(5)?;
        let first_seen: String = row.get(6)?;

        Ok(SignatureRecord {
            digest: digest.parse().map_err(|e| conversion_err(0, e))?,
            proto: proto.parse().map_err(|e: String| conversion_str_err(1, e))?,
            device_type: row.get(2)?,
            model_hint: row.get(3)?,
            confidence: row.get(4)?,
            identifying: serde_json::from_str(&identifying)
                .map_err(|e| conversion_err(5, e))?,
            first_seen: DateTime::parse_from_rfc3339(&first_seen)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| conversion_err(6, e))?,
            times_seen: row.get::<_, i64>(7)? as u64,
        })
    }
}

fn conversion_err<E: std::error::Error + Send + Sync + 'static>(
    col: usize,
    e: E,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, rusqlite::types::Type::Text, Box::new(e))
}

fn conversion_str_err(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

const SELECT_COLUMNS: &str =
    "digest, proto, device_type, model_hint, confidence, identifying, first_seen, times_seen";

impl SignatureStore for SqliteSignatureStore {
    fn lookup(&self, digest: &FingerprintDigest) -> Result<Option<SignatureRecord>, StoreError> {
        let conn = self.lock()?;

        let record = conn
            .query_row(
                &format!("SELECT {} FROM signatures WHERE digest = ?", SELECT_COLUMNS),
                [digest.to_string()],
                Self::row_to_record,
            )
            .optional()?;

        Ok(record)
    }

    fn upsert_observation(
        &self,
        candidate: &NewSignature,
        seed_confidence: f64,
    ) -> Result<SignatureRecord, StoreError> {
        let conn = self.lock()?;
        let key = candidate.digest.to_string();

        let existing: Option<Vec<u8>> = conn
            .query_row(
                "SELECT canonical FROM signatures WHERE digest = ?",
                [&key],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(stored) = existing {
            if stored != candidate.canonical {
                // Effectively unreachable with a 256-bit digest; its
                // occurrence means the canonicalization is broken.
                error!(
                    digest = %candidate.digest,
                    "suspected fingerprint digest collision: stored canonical bytes differ"
                );
                return Err(StoreError::CollisionSuspected {
                    digest: candidate.digest,
                });
            }

            conn.execute(
                "UPDATE signatures SET times_seen = times_seen + 1 WHERE digest = ?",
                [&key],
            )?;
        } else {
            conn.execute(
                "INSERT INTO signatures
                 (digest, proto, device_type, model_hint, confidence, identifying, canonical, first_seen, times_seen)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1)",
                params![
                    key,
                    candidate.proto.to_string(),
                    candidate.device_type,
                    candidate.model_hint,
                    seed_confidence,
                    serde_json::to_string(&candidate.identifying)
                        .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                    candidate.canonical,
                    candidate.observed_at.to_rfc3339(),
                ],
            )?;

            for oui in &candidate.identifying.vendor_ouis {
                conn.execute(
                    "INSERT OR IGNORE INTO signature_ouis (digest, oui) VALUES (?, ?)",
                    params![key, oui.to_string()],
                )?;
            }
        }

        let record = conn.query_row(
            &format!("SELECT {} FROM signatures WHERE digest = ?", SELECT_COLUMNS),
            [&key],
            Self::row_to_record,
        )?;

        Ok(record)
    }

    fn find_by_vendor_oui(&self, oui: &Oui) -> Result<Vec<SignatureRecord>, StoreError> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT s.digest, proto, device_type, model_hint, confidence, identifying, first_seen, times_seen
             FROM signatures s
             JOIN signature_ouis o ON o.digest = s.digest
             WHERE o.oui = ?"
        ))?;

        let rows = stmt.query_map([oui.to_string()], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    fn flush(&self) -> Result<(), StoreError> {
        // The connection runs in autocommit mode; every accepted write
        // is already durable. Taking the lock still serializes behind
        // any in-flight statement.
        let _conn = self.lock()?;
        Ok(())
    }
}

/// In-memory signature store for tests and ephemeral pipelines
#[derive(Default)]
pub struct MemorySignatureStore {
    inner: parking_lot::RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<FingerprintDigest, (SignatureRecord, Vec<u8>)>,
    by_oui: HashMap<Oui, HashSet<FingerprintDigest>>,
}

impl MemorySignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a curated record directly, bypassing the learning path
    pub fn insert(&self, record: SignatureRecord, canonical: Vec<u8>) {
        let mut inner = self.inner.write();
        for oui in &record.identifying.vendor_ouis {
            inner.by_oui.entry(*oui).or_default().insert(record.digest);
        }
        inner.records.insert(record.digest, (record, canonical));
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl SignatureStore for MemorySignatureStore {
    fn lookup(&self, digest: &FingerprintDigest) -> Result<Option<SignatureRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .records
            .get(digest)
            .map(|(rec, _)| rec.clone()))
    }

    fn upsert_observation(
        &self,
        candidate: &NewSignature,
        seed_confidence: f64,
    ) -> Result<SignatureRecord, StoreError> {
        let mut inner = self.inner.write();

        if let Some((record, canonical)) = inner.records.get_mut(&candidate.digest) {
            if *canonical != candidate.canonical {
                error!(
                    digest = %candidate.digest,
                    "suspected fingerprint digest collision: stored canonical bytes differ"
                );
                return Err(StoreError::CollisionSuspected {
                    digest: candidate.digest,
                });
            }
            record.times_seen += 1;
            return Ok(record.clone());
        }

        let record = SignatureRecord {
            digest: candidate.digest,
            proto: candidate.proto,
            device_type: candidate.device_type.clone(),
            model_hint: candidate.model_hint.clone(),
            confidence: seed_confidence,
            identifying: candidate.identifying.clone(),
            first_seen: candidate.observed_at,
            times_seen: 1,
        };
        for oui in &record.identifying.vendor_ouis {
            inner.by_oui.entry(*oui).or_default().insert(record.digest);
        }
        inner
            .records
            .insert(record.digest, (record.clone(), candidate.canonical.clone()));
        Ok(record)
    }

    fn find_by_vendor_oui(&self, oui: &Oui) -> Result<Vec<SignatureRecord>, StoreError> {
        let inner = self.inner.read();
        let Some(digests) = inner.by_oui.get(oui) else {
            return Ok(Vec::new());
        };
        Ok(digests
            .iter()
            .filter_map(|d| inner.records.get(d).map(|(rec, _)| rec.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract;
    use crate::hasher::{canonical_bytes, digest_features};
    use crate::models::{CaptureRecord, VendorIe, WifiObservation};

    fn candidate(rates: Vec<u8>, oui: Option<&str>) -> NewSignature {
        let wifi = WifiObservation {
            supported_rates: rates,
            vendor_ies: oui
                .map(|o| {
                    vec![VendorIe {
                        oui: o.parse().unwrap(),
                        data: vec![0x04],
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        };
        let record = CaptureRecord {
            mac: "aa:bb:cc:01:02:03".parse().unwrap(),
            proto: ProtocolFamily::WifiClient,
            signal_dbm: Some(-50),
            timestamp: Utc::now(),
            location: None,
            wifi: Some(wifi),
            bt: None,
        };
        let features = extract(&record);
        NewSignature {
            digest: digest_features(&features),
            proto: record.proto,
            device_type: Some("iot".into()),
            model_hint: None,
            identifying: IdentifyingFields::from_features(&features),
            canonical: canonical_bytes(&features),
            observed_at: Utc::now(),
        }
    }

    fn stores() -> Vec<Box<dyn SignatureStore>> {
        vec![
            Box::new(SqliteSignatureStore::open_memory().unwrap()),
            Box::new(MemorySignatureStore::new()),
        ]
    }

    #[test]
    fn test_lookup_absent() {
        for store in stores() {
            let sig = candidate(vec![2, 4], None);
            assert!(store.lookup(&sig.digest).unwrap().is_none());
        }
    }

    #[test]
    fn test_upsert_creates_then_increments() {
        for store in stores() {
            let sig = candidate(vec![2, 4, 11, 22], Some("00:50:f2"));

            let created = store.upsert_observation(&sig, 0.5).unwrap();
            assert_eq!(created.times_seen, 1);
            assert_eq!(created.confidence, 0.5);
            assert_eq!(created.device_type.as_deref(), Some("iot"));

            let repeated = store.upsert_observation(&sig, 0.9).unwrap();
            assert_eq!(repeated.times_seen, 2);
            // Confidence is curated, not a frequency proxy
            assert_eq!(repeated.confidence, 0.5);
        }
    }

    #[test]
    fn test_find_by_vendor_oui() {
        for store in stores() {
            let sig = candidate(vec![2, 4], Some("00:50:f2"));
            store.upsert_observation(&sig, 0.5).unwrap();

            let oui: Oui = "00:50:f2".parse().unwrap();
            let found = store.find_by_vendor_oui(&oui).unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].digest, sig.digest);

            let other: Oui = "00:1a:2b".parse().unwrap();
            assert!(store.find_by_vendor_oui(&other).unwrap().is_empty());
        }
    }

    #[test]
    fn test_collision_detection() {
        for store in stores() {
            let sig = candidate(vec![2, 4], None);
            store.upsert_observation(&sig, 0.5).unwrap();

            let mut forged = candidate(vec![2, 4, 11], None);
            forged.digest = sig.digest;

            let err = store.upsert_observation(&forged, 0.5).unwrap_err();
            assert!(matches!(err, StoreError::CollisionSuspected { .. }));
        }
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signatures.db");

        let sig = candidate(vec![2, 4, 11, 22], Some("00:50:f2"));
        {
            let store = SqliteSignatureStore::open(&path).unwrap();
            store.upsert_observation(&sig, 0.5).unwrap();
        }

        let store = SqliteSignatureStore::open(&path).unwrap();
        let found = store.lookup(&sig.digest).unwrap().unwrap();
        assert_eq!(found.times_seen, 1);
        assert_eq!(found.identifying, sig.identifying);
    }
}
