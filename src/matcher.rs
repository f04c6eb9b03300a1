//! Classification Matcher
//!
//! Evaluates a computed fingerprint against the whitelist and the
//! signature store in strict tier order, short-circuiting on the first
//! positive tier. The operator whitelist always outranks the learned
//! database; store failures degrade the result instead of failing it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{LearningConfig, MatcherConfig};
use crate::features::{describe_bt, infer_device_type, CanonicalFeatureSet};
use crate::hasher::{canonical_bytes, Fingerprint};
use crate::models::{CaptureRecord, MatchTier, SignatureMatch, WhitelistMatch};
use crate::store::{IdentifyingFields, NewSignature, SignatureStore, StoreError};
use crate::whitelist::{Whitelist, WhitelistEntry};

/// Identifying fields the partial-signature tier compares on top of
/// the vendor-OUI index seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialField {
    HtCapabilities,
    VhtCapabilities,
    RateSet,
    BtDeviceClass,
}

/// Outcome of one matcher invocation, folded into the final
/// `ClassificationResult` by the engine
#[derive(Debug, Clone)]
pub struct MatchDecision {
    pub tier: MatchTier,
    pub confidence: f64,
    pub whitelist: Option<WhitelistMatch>,
    pub signature: Option<SignatureMatch>,
    pub suspicious: bool,
    pub suspicious_reasons: Vec<String>,
    pub degraded: bool,
    pub learned: bool,
    pub collision_suspected: bool,
}

/// The pipeline's decision core
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatcherConfig,
    learning: LearningConfig,
}

impl Matcher {
    pub fn new(config: MatcherConfig, learning: LearningConfig) -> Self {
        Self { config, learning }
    }

    /// Classify one fingerprint. Never fails: store errors degrade the
    /// result to whitelist tiers, malformed matches cannot occur by
    /// construction.
    pub fn classify(
        &self,
        record: &CaptureRecord,
        fingerprint: &Fingerprint,
        features: &CanonicalFeatureSet,
        whitelist: &Whitelist,
        store: &dyn SignatureStore,
    ) -> MatchDecision {
        let mut decision = MatchDecision {
            tier: MatchTier::None,
            confidence: 0.0,
            whitelist: None,
            signature: None,
            suspicious: false,
            suspicious_reasons: Vec::new(),
            degraded: false,
            learned: false,
            collision_suspected: false,
        };

        let identifying = IdentifyingFields::from_features(features);
        let candidate = NewSignature {
            digest: fingerprint.digest,
            proto: record.proto,
            device_type: Some(infer_device_type(record).to_string()),
            model_hint: record
                .wifi
                .as_ref()
                .and_then(|w| w.wps.as_ref())
                .filter(|wps| !wps.model.is_empty())
                .map(|wps| wps.model.clone())
                .or_else(|| record.bt.as_ref().and_then(describe_bt)),
            identifying: identifying.clone(),
            canonical: canonical_bytes(features),
            observed_at: record.timestamp,
        };

        // Tier 1: exact whitelist. Operator ground truth outranks the
        // learned database, so the signature lookup below only fills
        // the secondary reference.
        if let Some(entry) = whitelist.match_exact(&record.mac, &fingerprint.digest) {
            decision.tier = MatchTier::Exact;
            decision.confidence = 1.0;
            decision.whitelist = Some(whitelist_ref(entry));
            if let Ok(Some(sig)) = store.lookup(&fingerprint.digest) {
                decision.signature = Some(signature_ref(&sig));
            }
            return decision;
        }

        // Tier 2: pattern whitelist (OUI prefix or SSID/name glob).
        // A whitelist match is a match: the suspicious flag never fires
        // for operator-whitelisted devices. Reasons stay advisory.
        if let Some(entry) = whitelist.match_pattern(&record.mac, advertised_name(record)) {
            decision.tier = MatchTier::Partial;
            decision.confidence = 0.9;
            decision.whitelist = Some(whitelist_ref(entry));
            decision.suspicious_reasons = suspicious_reasons(record);
            return decision;
        }

        // Tier 3: exact signature
        let mut below_threshold = None;
        match store.lookup(&fingerprint.digest) {
            Ok(Some(sig)) => {
                // Repeat sighting: bump the observation counter
                match store.upsert_observation(&candidate, self.learning.seed_confidence) {
                    Ok(_) => {}
                    Err(StoreError::CollisionSuspected { .. }) => {
                        decision.collision_suspected = true;
                    }
                    Err(StoreError::Unavailable(e)) => {
                        warn!("signature store degraded during increment: {}", e);
                        decision.degraded = true;
                    }
                }

                if sig.confidence >= self.config.min_signature_confidence {
                    decision.tier = MatchTier::Exact;
                    decision.confidence = sig.confidence;
                    decision.signature = Some(signature_ref(&sig));
                    return decision;
                }
                debug!(
                    digest = %sig.digest,
                    confidence = sig.confidence,
                    "stored signature below confidence threshold"
                );
                below_threshold = Some(sig.digest);
            }
            Ok(None) => {}
            Err(StoreError::Unavailable(e)) => {
                warn!("signature store unavailable, degrading to whitelist tiers: {}", e);
                decision.degraded = true;
            }
            Err(StoreError::CollisionSuspected { .. }) => {
                decision.collision_suspected = true;
            }
        }

        // Tier 4: partial signature on the configured identifying
        // subset, found through the vendor-OUI index
        if !decision.degraded {
            match self.partial_match(&identifying, fingerprint, store) {
                Ok(Some(sig)) => {
                    decision.tier = MatchTier::Partial;
                    decision.confidence = sig.confidence * self.config.partial_penalty;
                    decision.signature = Some(SignatureMatch {
                        confidence: decision.confidence,
                        ..signature_ref(&sig)
                    });
                    self.finish_unverified(record, &mut decision);
                    return decision;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("partial-match tier degraded: {}", e);
                    decision.degraded = true;
                }
            }
        }

        // Tier 5: no match. Learn the fingerprint for future
        // recognition unless the policy or a degraded store says no.
        // A below-threshold tier-3 hit was already counted above.
        if self.learning.enabled && !decision.degraded && below_threshold.is_none() {
            match store.upsert_observation(&candidate, self.learning.seed_confidence) {
                Ok(rec) => {
                    decision.learned = rec.times_seen == 1;
                    if decision.learned {
                        debug!(digest = %rec.digest, "learned new signature");
                    }
                }
                Err(StoreError::CollisionSuspected { .. }) => {
                    decision.collision_suspected = true;
                }
                Err(StoreError::Unavailable(e)) => {
                    warn!("failed to learn new signature: {}", e);
                    decision.degraded = true;
                }
            }
        }

        self.finish_unverified(record, &mut decision);
        decision
    }

    /// Suspicion applies to unmatched and signature-partial results;
    /// whitelist tiers never reach this evaluation
    fn finish_unverified(&self, record: &CaptureRecord, decision: &mut MatchDecision) {
        let near = record
            .signal_dbm
            .map(|s| s >= self.config.proximity_threshold_dbm)
            .unwrap_or(false);
        decision.suspicious = matches!(decision.tier, MatchTier::None | MatchTier::Partial) && near;
        decision.suspicious_reasons = suspicious_reasons(record);
    }

    fn partial_match(
        &self,
        identifying: &IdentifyingFields,
        fingerprint: &Fingerprint,
        store: &dyn SignatureStore,
    ) -> Result<Option<crate::store::SignatureRecord>, StoreError> {
        let mut best: Option<crate::store::SignatureRecord> = None;

        for oui in &identifying.vendor_ouis {
            for candidate in store.find_by_vendor_oui(oui)? {
                if candidate.digest == fingerprint.digest || candidate.proto != fingerprint.proto {
                    continue;
                }
                if !self.partial_fields_match(&candidate.identifying, identifying) {
                    continue;
                }
                if best
                    .as_ref()
                    .map(|b| candidate.confidence > b.confidence)
                    .unwrap_or(true)
                {
                    best = Some(candidate);
                }
            }
        }

        Ok(best)
    }

    fn partial_fields_match(&self, stored: &IdentifyingFields, new: &IdentifyingFields) -> bool {
        self.config.partial_fields.iter().all(|field| match field {
            PartialField::HtCapabilities => stored.ht_capabilities == new.ht_capabilities,
            PartialField::VhtCapabilities => stored.vht_capabilities == new.vht_capabilities,
            PartialField::RateSet => stored.rate_set == new.rate_set,
            PartialField::BtDeviceClass => stored.bt_device_class == new.bt_device_class,
        })
    }
}

fn advertised_name(record: &CaptureRecord) -> Option<&str> {
    if let Some(wifi) = &record.wifi {
        if let Some(ssid) = &wifi.ssid {
            return Some(ssid);
        }
    }
    record.bt.as_ref().and_then(|b| b.name.as_deref())
}

fn whitelist_ref(entry: &WhitelistEntry) -> WhitelistMatch {
    WhitelistMatch {
        label: entry.label.clone(),
        identifier: entry.ident.to_string(),
    }
}

fn signature_ref(sig: &crate::store::SignatureRecord) -> SignatureMatch {
    SignatureMatch {
        digest: sig.digest,
        device_type: sig.device_type.clone(),
        confidence: sig.confidence,
    }
}

/// Advisory indicators carried next to the suspicious flag
fn suspicious_reasons(record: &CaptureRecord) -> Vec<String> {
    const TRACKER_NAMES: [&str; 4] = ["tile", "airtag", "smarttag", "chipolo"];

    let mut reasons = Vec::new();

    if let Some(wifi) = &record.wifi {
        if wifi.probed_ssids.len() > 10 {
            reasons.push(format!("probing many SSIDs ({})", wifi.probed_ssids.len()));
        }
        if let Some(rssi) = record.signal_dbm {
            if rssi > -20 {
                reasons.push(format!("unusually strong signal ({} dBm)", rssi));
            }
        }
    }

    if let Some(bt) = &record.bt {
        if let Some(name) = &bt.name {
            let lower = name.to_lowercase();
            if TRACKER_NAMES.iter().any(|p| lower.contains(p)) {
                reasons.push(format!("potential tracking device: {}", name));
            }
        } else if record.proto == crate::models::ProtocolFamily::BtLe {
            reasons.push("unnamed BLE device (potential tracker)".to_string());
        }
        if let Some(rssi) = record.signal_dbm {
            if rssi > -30 {
                reasons.push(format!("very close proximity ({} dBm)", rssi));
            }
        }
    }

    reasons
}
