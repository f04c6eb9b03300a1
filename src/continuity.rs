//! MAC Continuity Resolution
//!
//! Correlates fingerprints across MAC-address randomization so one
//! physical device keeps one logical identity. Best-effort heuristic:
//! it never touches classification confidence, only deduplicates
//! device counts. Clusters grow by merging and never split; a false
//! merge is corrected by external intervention only.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::features::CanonicalFeatureSet;
use crate::hasher::{canonical_bytes, digest_bytes, Fingerprint, FingerprintDigest};
use crate::mac::MacAddr;

/// Stable identifier of an identity cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterId(Uuid);

impl ClusterId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One (fingerprint, MAC) membership in a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMember {
    pub digest: FingerprintDigest,
    pub mac: MacAddr,
    pub last_seen: DateTime<Utc>,
}

/// Fingerprints/MACs believed to be one physical device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityCluster {
    pub id: ClusterId,
    /// Digest of the randomization-stable feature subset shared by the
    /// members
    pub stable_key: FingerprintDigest,
    pub members: Vec<ClusterMember>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl IdentityCluster {
    fn new(
        stable_key: FingerprintDigest,
        digest: FingerprintDigest,
        mac: MacAddr,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ClusterId::generate(),
            stable_key,
            members: vec![ClusterMember {
                digest,
                mac,
                last_seen: at,
            }],
            created_at: at,
            last_seen: at,
        }
    }

    fn touch(&mut self, digest: FingerprintDigest, mac: MacAddr, at: DateTime<Utc>) {
        match self
            .members
            .iter_mut()
            .find(|m| m.digest == digest && m.mac == mac)
        {
            Some(member) => member.last_seen = at,
            None => self.members.push(ClusterMember {
                digest,
                mac,
                last_seen: at,
            }),
        }
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Distinct MACs observed for this cluster
    pub fn macs(&self) -> Vec<MacAddr> {
        let mut macs: Vec<MacAddr> = self.members.iter().map(|m| m.mac).collect();
        macs.sort();
        macs.dedup();
        macs
    }

    pub fn contains_digest(&self, digest: &FingerprintDigest) -> bool {
        self.members.iter().any(|m| m.digest == *digest)
    }
}

#[derive(Default)]
struct ResolverState {
    clusters: HashMap<ClusterId, IdentityCluster>,
    by_digest: HashMap<FingerprintDigest, ClusterId>,
    by_stable: HashMap<FingerprintDigest, ClusterId>,
}

/// Tracks identity clusters across MAC changes.
///
/// Writes are serialized on the table; reads proceed concurrently.
pub struct ContinuityResolver {
    window: Duration,
    state: RwLock<ResolverState>,
}

impl ContinuityResolver {
    /// `window` bounds how old a stable-feature match may be and still
    /// merge; it should track the typical randomized-MAC rotation
    /// interval.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: RwLock::new(ResolverState::default()),
        }
    }

    /// Attach the observation to its cluster, creating or merging as
    /// the evidence requires, and return the cluster id.
    pub fn observe(
        &self,
        mac: MacAddr,
        fingerprint: &Fingerprint,
        features: &CanonicalFeatureSet,
        at: DateTime<Utc>,
    ) -> ClusterId {
        let stable_key = digest_bytes(&canonical_bytes(&features.stable_subset()));
        let digest = fingerprint.digest;

        let mut state = self.state.write();

        let by_digest = state.by_digest.get(&digest).copied();
        let by_stable = state.by_stable.get(&stable_key).copied();

        let id = match (by_digest, by_stable) {
            (Some(a), Some(b)) if a != b => {
                // New evidence links two clusters; merge, never split
                merge_clusters(&mut state, a, b)
            }
            (Some(id), _) => id,
            (None, Some(id)) => {
                let active = state
                    .clusters
                    .get(&id)
                    .map(|c| at - c.last_seen <= self.window)
                    .unwrap_or(false);
                if active {
                    debug!(cluster = %id, mac = %mac, "stable-feature match within window, joining cluster");
                    id
                } else {
                    // Stale evidence; a fresh cluster takes over the
                    // stable-key slot
                    let cluster = IdentityCluster::new(stable_key, digest, mac, at);
                    let id = cluster.id;
                    state.clusters.insert(id, cluster);
                    id
                }
            }
            (None, None) => {
                let cluster = IdentityCluster::new(stable_key, digest, mac, at);
                let id = cluster.id;
                state.clusters.insert(id, cluster);
                id
            }
        };

        if let Some(cluster) = state.clusters.get_mut(&id) {
            cluster.touch(digest, mac, at);
        }
        state.by_digest.insert(digest, id);
        state.by_stable.insert(stable_key, id);

        id
    }

    /// Snapshot of one cluster
    pub fn cluster(&self, id: &ClusterId) -> Option<IdentityCluster> {
        self.state.read().clusters.get(id).cloned()
    }

    /// Snapshot of the full cluster table, for device-count
    /// deduplication by the reporting layer
    pub fn clusters(&self) -> Vec<IdentityCluster> {
        self.state.read().clusters.values().cloned().collect()
    }

    /// Number of logical devices currently tracked
    pub fn device_count(&self) -> usize {
        self.state.read().clusters.len()
    }
}

/// Merge cluster `b` into whichever of the pair was created first;
/// returns the surviving id.
fn merge_clusters(state: &mut ResolverState, a: ClusterId, b: ClusterId) -> ClusterId {
    let (keep, drop) = match (state.clusters.get(&a), state.clusters.get(&b)) {
        (Some(ca), Some(cb)) => {
            if ca.created_at <= cb.created_at {
                (a, b)
            } else {
                (b, a)
            }
        }
        _ => return a,
    };

    if let Some(dropped) = state.clusters.remove(&drop) {
        debug!(keep = %keep, dropped = %drop, "merging identity clusters");
        for key in state
            .by_digest
            .iter()
            .filter(|(_, v)| **v == drop)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
        {
            state.by_digest.insert(key, keep);
        }
        for key in state
            .by_stable
            .iter()
            .filter(|(_, v)| **v == drop)
            .map(|(k, _)| *k)
            .collect::<Vec<_>>()
        {
            state.by_stable.insert(key, keep);
        }

        if let Some(kept) = state.clusters.get_mut(&keep) {
            for member in dropped.members {
                kept.touch(member.digest, member.mac, member.last_seen);
            }
            if dropped.created_at < kept.created_at {
                kept.created_at = dropped.created_at;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::extract;
    use crate::models::{CaptureRecord, ProtocolFamily, WifiObservation};

    fn record(mac: &str, seq: Option<u16>, at: DateTime<Utc>) -> CaptureRecord {
        CaptureRecord {
            mac: mac.parse().unwrap(),
            proto: ProtocolFamily::WifiClient,
            signal_dbm: Some(-55),
            timestamp: at,
            location: None,
            wifi: Some(WifiObservation {
                supported_rates: vec![12, 24, 48, 108],
                ht_capabilities: Some(0x01ef),
                probed_ssids: vec!["Home".into(), "Work".into()],
                sequence_number: seq,
                ..Default::default()
            }),
            bt: None,
        }
    }

    fn observe(resolver: &ContinuityResolver, rec: &CaptureRecord) -> ClusterId {
        let features = extract(rec);
        let fp = Fingerprint::new(&features, rec.proto, rec.timestamp);
        resolver.observe(rec.mac, &fp, &features, rec.timestamp)
    }

    #[test]
    fn test_randomized_macs_share_cluster_within_window() {
        let resolver = ContinuityResolver::new(Duration::seconds(300));
        let t0 = Utc::now();

        // Same stable capabilities under two randomized MACs, digests
        // differ through the rotating sequence counter
        let a = observe(&resolver, &record("02:aa:bb:cc:dd:01", Some(100), t0));
        let b = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:02", Some(3000), t0 + Duration::seconds(60)),
        );

        assert_eq!(a, b);
        assert_eq!(resolver.device_count(), 1);

        let cluster = resolver.cluster(&a).unwrap();
        assert_eq!(cluster.macs().len(), 2);
    }

    #[test]
    fn test_expired_window_starts_new_cluster() {
        let resolver = ContinuityResolver::new(Duration::seconds(300));
        let t0 = Utc::now();

        let a = observe(&resolver, &record("02:aa:bb:cc:dd:01", Some(100), t0));
        let b = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:02", Some(3000), t0 + Duration::seconds(3600)),
        );

        assert_ne!(a, b);
        assert_eq!(resolver.device_count(), 2);
    }

    #[test]
    fn test_same_fingerprint_ignores_window() {
        let resolver = ContinuityResolver::new(Duration::seconds(300));
        let t0 = Utc::now();

        // Identical digest is identity, however much time passed
        let a = observe(&resolver, &record("02:aa:bb:cc:dd:01", Some(100), t0));
        let b = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:01", Some(100), t0 + Duration::seconds(7200)),
        );

        assert_eq!(a, b);
    }

    #[test]
    fn test_cluster_monotonicity() {
        let resolver = ContinuityResolver::new(Duration::seconds(300));
        let t0 = Utc::now();

        let a = observe(&resolver, &record("02:aa:bb:cc:dd:01", Some(1), t0));
        let b = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:02", Some(2), t0 + Duration::seconds(10)),
        );
        assert_eq!(a, b);

        // Re-observing either member never un-merges
        for seq in [1u16, 2] {
            let mac = if seq == 1 {
                "02:aa:bb:cc:dd:01"
            } else {
                "02:aa:bb:cc:dd:02"
            };
            let id = observe(
                &resolver,
                &record(mac, Some(seq), t0 + Duration::seconds(20)),
            );
            assert_eq!(id, a);
        }
        assert_eq!(resolver.device_count(), 1);
    }

    #[test]
    fn test_linking_evidence_merges_clusters() {
        let resolver = ContinuityResolver::new(Duration::seconds(60));
        let t0 = Utc::now();

        // Two sightings far apart in time form separate clusters
        let a = observe(&resolver, &record("02:aa:bb:cc:dd:01", Some(1), t0));
        let b = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:02", Some(2), t0 + Duration::seconds(600)),
        );
        assert_ne!(a, b);

        // A sighting carrying cluster-a's digest while the stable slot
        // points at cluster b links the two; they merge
        let c = observe(
            &resolver,
            &record("02:aa:bb:cc:dd:01", Some(1), t0 + Duration::seconds(610)),
        );
        assert_eq!(resolver.device_count(), 1);
        let cluster = resolver.cluster(&c).unwrap();
        assert_eq!(cluster.macs().len(), 2);
    }
}
