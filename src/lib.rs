//! rfscout: passive wireless reconnaissance core
//!
//! Turns raw WiFi/Bluetooth observation records into stable device
//! fingerprints and classifies each against an operator whitelist and
//! a learned signature database:
//!
//! - Feature extraction into a canonical, order-independent set
//! - Deterministic SHA-256 fingerprint hashing
//! - Multi-tier matching (whitelist exact/pattern, signature
//!   exact/partial) with confidence scoring
//! - MAC-randomization compensation through identity clusters
//! - Incremental learning of previously unseen signatures
//!
//! Capture backends, GPS sources and report rendering are external
//! collaborators; this crate only consumes their records and produces
//! classification results.

pub mod config;
pub mod continuity;
pub mod engine;
pub mod features;
pub mod hasher;
pub mod mac;
pub mod matcher;
pub mod models;
pub mod store;
pub mod whitelist;

pub use config::Config;
pub use continuity::{ClusterId, ContinuityResolver, IdentityCluster};
pub use engine::{ClassifyError, FingerprintEngine, StatsSnapshot};
pub use features::{extract, CanonicalFeatureSet, FieldTag, FieldValue};
pub use hasher::{digest_features, Fingerprint, FingerprintDigest};
pub use mac::{MacAddr, Oui};
pub use matcher::{Matcher, PartialField};
pub use models::{
    BtObservation, CaptureRecord, ClassificationResult, DeviceType, GeoTag, MatchTier,
    ProtocolFamily, RecordError, WifiObservation,
};
pub use store::{
    MemorySignatureStore, SignatureRecord, SignatureStore, SqliteSignatureStore, StoreError,
};
pub use whitelist::{Whitelist, WhitelistEntry, WhitelistIdent};
