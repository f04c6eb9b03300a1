//! Fingerprint Engine
//!
//! Orchestrates the full pipeline per incoming capture record:
//! validate, fold the per-MAC probe history, extract, hash, resolve
//! MAC continuity, match. `classify` is synchronous and safe to call
//! from many tasks; `run` wraps it in a channel-driven loop with
//! graceful drain-and-stop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::continuity::{ContinuityResolver, IdentityCluster};
use crate::features::{describe_bt, extract, infer_device_type};
use crate::hasher::Fingerprint;
use crate::mac::MacAddr;
use crate::matcher::Matcher;
use crate::models::{CaptureRecord, ClassificationResult, RecordError};
use crate::store::{MemorySignatureStore, SignatureStore, SqliteSignatureStore};
use crate::whitelist::Whitelist;

/// Why a record was refused
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("engine is draining; record refused")]
    Draining,
}

/// Per-MAC probe accumulation. The capture backend reports single
/// observations; the probed-SSID history that feeds the fingerprint
/// builds up here across sightings.
#[derive(Debug, Clone, Default)]
pub struct ProbeProfile {
    pub probed_ssids: Vec<String>,
    pub probe_count: u64,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl ProbeProfile {
    fn fold(&mut self, ssid: Option<&str>, probed: &[String], at: DateTime<Utc>) {
        let incoming = ssid.into_iter().chain(probed.iter().map(|s| s.as_str()));
        for name in incoming {
            if !name.is_empty() && !self.probed_ssids.iter().any(|s| s == name) {
                self.probed_ssids.push(name.to_string());
            }
        }
        self.probe_count += 1;
        if self.first_seen.is_none() {
            self.first_seen = Some(at);
        }
        self.last_seen = Some(at);
    }
}

#[derive(Debug, Default)]
struct EngineStats {
    processed: AtomicU64,
    rejected: AtomicU64,
    wifi_fingerprints: AtomicU64,
    bt_fingerprints: AtomicU64,
    randomized_macs: AtomicU64,
    learned_signatures: AtomicU64,
    degraded_results: AtomicU64,
    collisions_suspected: AtomicU64,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub rejected: u64,
    pub wifi_fingerprints: u64,
    pub bt_fingerprints: u64,
    pub randomized_macs: u64,
    pub learned_signatures: u64,
    pub degraded_results: u64,
    pub collisions_suspected: u64,
    pub tracked_devices: u64,
}

/// Coordinates extraction, hashing, continuity and matching behind a
/// single `classify` call
pub struct FingerprintEngine {
    matcher: Matcher,
    whitelist: RwLock<Whitelist>,
    store: Arc<dyn SignatureStore>,
    continuity: ContinuityResolver,
    profiles: DashMap<MacAddr, ProbeProfile>,
    stats: EngineStats,
    draining: AtomicBool,
}

impl FingerprintEngine {
    pub fn new(config: &Config, store: Arc<dyn SignatureStore>, whitelist: Whitelist) -> Self {
        Self {
            matcher: Matcher::new(config.matcher.clone(), config.learning.clone()),
            whitelist: RwLock::new(whitelist),
            store,
            continuity: ContinuityResolver::new(Duration::seconds(
                config.continuity.window_secs as i64,
            )),
            profiles: DashMap::new(),
            stats: EngineStats::default(),
            draining: AtomicBool::new(false),
        }
    }

    /// Build an engine from configuration: open the signature store
    /// and load the whitelist file if one is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store: Arc<dyn SignatureStore> = if config.store.in_memory {
            Arc::new(MemorySignatureStore::new())
        } else {
            Arc::new(
                SqliteSignatureStore::open(&config.store.db_path)
                    .context("failed to open signature store")?,
            )
        };

        let whitelist = match &config.whitelist.path {
            Some(path) => {
                let (whitelist, report) = Whitelist::load_file(path)
                    .with_context(|| format!("failed to load whitelist: {}", path.display()))?;
                if !report.rejected.is_empty() {
                    warn!(
                        "whitelist loaded with {} rejected entries",
                        report.rejected.len()
                    );
                }
                whitelist
            }
            None => Whitelist::new(),
        };

        Ok(Self::new(config, store, whitelist))
    }

    /// Replace the active whitelist (e.g. after an operator edit)
    pub fn set_whitelist(&self, whitelist: Whitelist) {
        *self.whitelist.write() = whitelist;
    }

    /// Classify one capture record
    pub fn classify(&self, record: &CaptureRecord) -> Result<ClassificationResult, ClassifyError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(ClassifyError::Draining);
        }
        self.classify_inner(record)
    }

    fn classify_inner(&self, record: &CaptureRecord) -> Result<ClassificationResult, ClassifyError> {
        if let Err(e) = record.validate() {
            // Audit trail: every rejected record leaves a log entry
            // and a counter bump, never a silent drop.
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(mac = %record.mac, error = %e, "rejected malformed capture record");
            return Err(e.into());
        }

        let effective = self.fold_probe_history(record);

        if effective.mac.is_locally_administered() {
            self.stats.randomized_macs.fetch_add(1, Ordering::Relaxed);
        }

        let features = extract(&effective);
        let fingerprint = Fingerprint::new(&features, effective.proto, effective.timestamp);

        let cluster = self
            .continuity
            .observe(effective.mac, &fingerprint, &features, effective.timestamp);

        let whitelist = self.whitelist.read();
        let decision =
            self.matcher
                .classify(&effective, &fingerprint, &features, &whitelist, self.store.as_ref());
        drop(whitelist);

        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        if effective.proto.is_wifi() {
            self.stats.wifi_fingerprints.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.bt_fingerprints.fetch_add(1, Ordering::Relaxed);
        }
        if decision.learned {
            self.stats.learned_signatures.fetch_add(1, Ordering::Relaxed);
        }
        if decision.degraded {
            self.stats.degraded_results.fetch_add(1, Ordering::Relaxed);
        }
        if decision.collision_suspected {
            self.stats
                .collisions_suspected
                .fetch_add(1, Ordering::Relaxed);
        }

        Ok(ClassificationResult {
            mac: effective.mac,
            proto: effective.proto,
            fingerprint,
            tier: decision.tier,
            confidence: decision.confidence,
            whitelist: decision.whitelist,
            signature: decision.signature,
            suspicious: decision.suspicious,
            suspicious_reasons: decision.suspicious_reasons,
            degraded: decision.degraded,
            cluster,
            device_type: infer_device_type(&effective),
            device_label: effective.bt.as_ref().and_then(describe_bt),
            location: effective.location,
            timestamp: effective.timestamp,
        })
    }

    /// Merge the accumulated per-MAC probe history into a WiFi client
    /// record before extraction, the way the capture layer would see
    /// it with perfect memory
    fn fold_probe_history(&self, record: &CaptureRecord) -> CaptureRecord {
        if record.proto != crate::models::ProtocolFamily::WifiClient {
            return record.clone();
        }
        let Some(wifi) = &record.wifi else {
            return record.clone();
        };

        let mut profile = self.profiles.entry(record.mac).or_default();
        profile.fold(wifi.ssid.as_deref(), &wifi.probed_ssids, record.timestamp);

        let mut effective = record.clone();
        if let Some(w) = effective.wifi.as_mut() {
            w.probed_ssids = profile.probed_ssids.clone();
        }
        effective
    }

    /// Probe profile for a MAC, if one has accumulated
    pub fn probe_profile(&self, mac: &MacAddr) -> Option<ProbeProfile> {
        self.profiles.get(mac).map(|p| p.value().clone())
    }

    /// Snapshot of the identity-cluster table for device-count
    /// deduplication
    pub fn clusters(&self) -> Vec<IdentityCluster> {
        self.continuity.clusters()
    }

    /// Logical device count after MAC-continuity deduplication
    pub fn device_count(&self) -> usize {
        self.continuity.device_count()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            wifi_fingerprints: self.stats.wifi_fingerprints.load(Ordering::Relaxed),
            bt_fingerprints: self.stats.bt_fingerprints.load(Ordering::Relaxed),
            randomized_macs: self.stats.randomized_macs.load(Ordering::Relaxed),
            learned_signatures: self.stats.learned_signatures.load(Ordering::Relaxed),
            degraded_results: self.stats.degraded_results.load(Ordering::Relaxed),
            collisions_suspected: self.stats.collisions_suspected.load(Ordering::Relaxed),
            tracked_devices: self.continuity.device_count() as u64,
        }
    }

    /// Run the engine over a record stream until the stream ends or a
    /// shutdown signal arrives. Drain-and-stop semantics: in-flight
    /// records complete, new records are refused, pending store writes
    /// are flushed before this returns.
    pub async fn run(
        self: Arc<Self>,
        mut records: mpsc::Receiver<CaptureRecord>,
        results: mpsc::Sender<ClassificationResult>,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("fingerprint engine started");

        loop {
            tokio::select! {
                maybe_record = records.recv() => {
                    match maybe_record {
                        Some(record) => self.process(record, &results).await,
                        None => {
                            info!("record stream closed");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received, draining");
                    break;
                }
            }
        }

        // Refuse new work, then finish whatever is already queued
        self.draining.store(true, Ordering::SeqCst);
        records.close();
        while let Ok(record) = records.try_recv() {
            self.process(record, &results).await;
        }

        self.store
            .flush()
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("failed to flush signature store during shutdown")?;

        info!("fingerprint engine stopped, {} records processed", self.stats().processed);
        Ok(())
    }

    async fn process(&self, record: CaptureRecord, results: &mpsc::Sender<ClassificationResult>) {
        match self.classify_inner(&record) {
            Ok(result) => {
                if results.send(result).await.is_err() {
                    warn!("result consumer dropped, discarding classification");
                }
            }
            Err(_) => {
                // Already logged with the audit trail entry
            }
        }
    }
}
