//! End-to-end pipeline tests: capture record in, classification out.

use std::sync::Arc;

use chrono::Utc;
use rfscout::config::Config;
use rfscout::engine::FingerprintEngine;
use rfscout::models::{
    BtObservation, CaptureRecord, GeoTag, MatchTier, ProtocolFamily, WifiObservation,
};
use rfscout::store::{MemorySignatureStore, SignatureStore, SqliteSignatureStore};
use rfscout::whitelist::Whitelist;

fn wifi_probe(mac: &str, ssid: &str) -> CaptureRecord {
    CaptureRecord {
        mac: mac.parse().unwrap(),
        proto: ProtocolFamily::WifiClient,
        signal_dbm: Some(-48),
        timestamp: Utc::now(),
        location: None,
        wifi: Some(WifiObservation {
            ssid: Some(ssid.to_string()),
            supported_rates: vec![2, 4, 11, 22],
            ..Default::default()
        }),
        bt: None,
    }
}

fn engine_with(whitelist_json: &str) -> FingerprintEngine {
    let (whitelist, report) = Whitelist::load_str(whitelist_json).unwrap();
    assert!(report.rejected.is_empty());
    FingerprintEngine::new(
        &Config::default(),
        Arc::new(MemorySignatureStore::new()),
        whitelist,
    )
}

#[test]
fn unknown_strong_device_is_suspicious() {
    // Scenario: no whitelist, no signatures, rates {1, 2, 5.5, 11}
    let engine = engine_with("{}");
    let result = engine.classify(&wifi_probe("aa:bb:cc:01:02:03", "")).unwrap();

    assert_eq!(result.tier, MatchTier::None);
    assert_eq!(result.confidence, 0.0);
    assert!(result.suspicious); // -48 dBm is above the proximity threshold
}

#[test]
fn whitelisted_mac_is_exact_regardless_of_capabilities() {
    let engine = engine_with(
        r#"{"wifi_devices": [{"mac": "AA:BB:CC:DD:EE:FF", "name": "Field tablet"}]}"#,
    );

    for rates in [vec![2u8, 4], vec![12, 24, 48, 108]] {
        let mut record = wifi_probe("aa:bb:cc:dd:ee:ff", "anything");
        record.wifi.as_mut().unwrap().supported_rates = rates;

        let result = engine.classify(&record).unwrap();
        assert_eq!(result.tier, MatchTier::Exact);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.label(), Some("Field tablet"));
        assert!(!result.suspicious);
    }
}

#[test]
fn whitelisted_oui_is_partial_at_point_nine() {
    let engine = engine_with(
        r#"{"oui_whitelist": [{"oui": "00:1A:2B", "name": "Cisco Systems"}]}"#,
    );

    let result = engine
        .classify(&wifi_probe("00:1a:2b:11:22:33", "lab-net"))
        .unwrap();

    assert_eq!(result.tier, MatchTier::Partial);
    assert_eq!(result.confidence, 0.9);
    assert_eq!(result.label(), Some("Cisco Systems"));
    // -48 dBm is above the proximity threshold, but a whitelist match
    // is a match
    assert!(!result.suspicious);
}

#[test]
fn randomized_macs_count_as_one_device() {
    let engine = engine_with("{}");

    let base = |mac: &str, seq: u16| {
        let mut record = wifi_probe(mac, "");
        {
            let wifi = record.wifi.as_mut().unwrap();
            wifi.supported_rates = vec![12, 24, 48, 108];
            wifi.ht_capabilities = Some(0x01ef);
            wifi.sequence_number = Some(seq);
        }
        record
    };

    let a = engine.classify(&base("02:11:22:33:44:01", 10)).unwrap();
    let b = engine.classify(&base("02:11:22:33:44:02", 900)).unwrap();

    assert_eq!(a.cluster, b.cluster);
    assert_eq!(engine.device_count(), 1);

    let clusters = engine.clusters();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].macs().len(), 2);
}

#[test]
fn whitelist_beats_conflicting_signature() {
    // Learn the signature first under a permissive engine
    let store = Arc::new(MemorySignatureStore::new());
    let learning_engine =
        FingerprintEngine::new(&Config::default(), store.clone(), Whitelist::new());
    let record = wifi_probe("aa:bb:cc:dd:ee:ff", "net");
    let learned = learning_engine.classify(&record).unwrap();
    assert_eq!(learned.tier, MatchTier::None);
    assert_eq!(store.len(), 1);

    // Same store, now with the digest whitelisted under a different label
    let digest = learned.fingerprint.digest.to_string();
    let json = format!(
        r#"{{"fingerprint_whitelist": [{{"digest": "{}", "name": "Ops beacon"}}]}}"#,
        digest
    );
    let (whitelist, _) = Whitelist::load_str(&json).unwrap();
    let engine = FingerprintEngine::new(&Config::default(), store, whitelist);

    let result = engine.classify(&record).unwrap();
    assert_eq!(result.tier, MatchTier::Exact);
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.label(), Some("Ops beacon"));
    // The signature reference rides along, but the whitelist won
    assert!(result.signature.is_some());
}

#[test]
fn degraded_store_still_classifies_from_whitelist() {
    struct DownStore;
    impl SignatureStore for DownStore {
        fn lookup(
            &self,
            _: &rfscout::hasher::FingerprintDigest,
        ) -> Result<Option<rfscout::store::SignatureRecord>, rfscout::store::StoreError> {
            Err(rfscout::store::StoreError::Unavailable("backend down".into()))
        }
        fn upsert_observation(
            &self,
            _: &rfscout::store::NewSignature,
            _: f64,
        ) -> Result<rfscout::store::SignatureRecord, rfscout::store::StoreError> {
            Err(rfscout::store::StoreError::Unavailable("backend down".into()))
        }
        fn find_by_vendor_oui(
            &self,
            _: &rfscout::mac::Oui,
        ) -> Result<Vec<rfscout::store::SignatureRecord>, rfscout::store::StoreError> {
            Err(rfscout::store::StoreError::Unavailable("backend down".into()))
        }
        fn flush(&self) -> Result<(), rfscout::store::StoreError> {
            Ok(())
        }
    }

    let (whitelist, _) = Whitelist::load_str(
        r#"{"wifi_devices": [{"mac": "AA:BB:CC:DD:EE:FF", "name": "Field tablet"}]}"#,
    )
    .unwrap();
    let engine = FingerprintEngine::new(&Config::default(), Arc::new(DownStore), whitelist);

    // Whitelisted device: clean exact match
    let known = engine.classify(&wifi_probe("aa:bb:cc:dd:ee:ff", "x")).unwrap();
    assert_eq!(known.tier, MatchTier::Exact);

    // Unknown device: non-error result, flagged degraded
    let unknown = engine.classify(&wifi_probe("aa:bb:cc:00:00:01", "y")).unwrap();
    assert_eq!(unknown.tier, MatchTier::None);
    assert!(unknown.degraded);
    assert_eq!(engine.stats().degraded_results, 1);
}

#[test]
fn location_tag_is_carried_through_opaquely() {
    let engine = engine_with("{}");
    let mut record = wifi_probe("aa:bb:cc:01:02:03", "net");
    record.location = Some(GeoTag {
        latitude: 51.5074,
        longitude: -0.1278,
        altitude: Some(30.0),
    });

    let result = engine.classify(&record).unwrap();
    let tag = result.location.unwrap();
    assert_eq!(tag.latitude, 51.5074);
    assert_eq!(tag.longitude, -0.1278);
}

#[test]
fn wifi_and_bt_observations_fingerprint_independently() {
    let engine = engine_with("{}");

    let wifi = engine.classify(&wifi_probe("aa:bb:cc:01:02:03", "net")).unwrap();

    let bt_record = CaptureRecord {
        mac: "aa:bb:cc:01:02:03".parse().unwrap(),
        proto: ProtocolFamily::BtClassic,
        signal_dbm: Some(-60),
        timestamp: Utc::now(),
        location: None,
        wifi: None,
        bt: Some(BtObservation {
            name: Some("Speaker".into()),
            device_class: Some(0x000414),
            ..Default::default()
        }),
    };
    let bt = engine.classify(&bt_record).unwrap();

    assert_ne!(wifi.fingerprint.digest, bt.fingerprint.digest);
    assert_eq!(bt.device_label.as_deref(), Some("Audio/Video - Loudspeaker"));
    assert!(wifi.device_label.is_none());
    let stats = engine.stats();
    assert_eq!(stats.wifi_fingerprints, 1);
    assert_eq!(stats.bt_fingerprints, 1);
}

#[test]
fn learned_signatures_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("signatures.db");
    let record = wifi_probe("aa:bb:cc:01:02:03", "net");

    let digest = {
        let store = Arc::new(SqliteSignatureStore::open(&path).unwrap());
        let engine = FingerprintEngine::new(&Config::default(), store, Whitelist::new());
        engine.classify(&record).unwrap().fingerprint.digest
    };

    // Fresh engine over the same database file remembers the digest
    let store = Arc::new(SqliteSignatureStore::open(&path).unwrap());
    let stored = store.lookup(&digest).unwrap().unwrap();
    assert_eq!(stored.times_seen, 1);

    let engine = FingerprintEngine::new(&Config::default(), store.clone(), Whitelist::new());
    engine.classify(&record).unwrap();
    assert_eq!(store.lookup(&digest).unwrap().unwrap().times_seen, 2);
}
