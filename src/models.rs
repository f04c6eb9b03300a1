use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::continuity::ClusterId;
use crate::hasher::{Fingerprint, FingerprintDigest};
use crate::mac::{MacAddr, Oui};

/// Protocol family of an observed device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolFamily {
    WifiAp,
    WifiClient,
    BtClassic,
    BtLe,
}

impl ProtocolFamily {
    pub fn is_wifi(&self) -> bool {
        matches!(self, ProtocolFamily::WifiAp | ProtocolFamily::WifiClient)
    }

    pub fn is_bluetooth(&self) -> bool {
        matches!(self, ProtocolFamily::BtClassic | ProtocolFamily::BtLe)
    }

    /// Stable wire code used in canonical serialization
    pub fn code(&self) -> u8 {
        match self {
            ProtocolFamily::WifiAp => 1,
            ProtocolFamily::WifiClient => 2,
            ProtocolFamily::BtClassic => 3,
            ProtocolFamily::BtLe => 4,
        }
    }
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFamily::WifiAp => write!(f, "wifi-ap"),
            ProtocolFamily::WifiClient => write!(f, "wifi-client"),
            ProtocolFamily::BtClassic => write!(f, "bt-classic"),
            ProtocolFamily::BtLe => write!(f, "bt-le"),
        }
    }
}

impl std::str::FromStr for ProtocolFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wifi-ap" => Ok(ProtocolFamily::WifiAp),
            "wifi-client" => Ok(ProtocolFamily::WifiClient),
            "bt-classic" => Ok(ProtocolFamily::BtClassic),
            "bt-le" => Ok(ProtocolFamily::BtLe),
            _ => Err(format!("Unknown protocol family: {}", s)),
        }
    }
}

/// Coarse position tag attached by the capture layer. Carried through
/// classification untouched; this core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTag {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
}

/// RSN (WPA2/WPA3) security summary as raw suite selector codes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsnSummary {
    pub group_cipher: u8,
    pub pairwise_ciphers: Vec<u8>,
    pub akm_suites: Vec<u8>,
}

/// Vendor-specific information element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorIe {
    pub oui: Oui,
    pub data: Vec<u8>,
}

/// WPS attributes advertised in the Microsoft vendor IE
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WpsInfo {
    pub manufacturer: String,
    pub model: String,
    pub device_name: String,
}

/// Capability fields observed on a WiFi device.
///
/// Rates are raw 802.11 rate bytes in 500 kb/s units, possibly with the
/// basic-rate flag still attached (it is masked off during
/// canonicalization): 1 Mb/s = 2, 5.5 Mb/s = 11, 54 Mb/s = 108.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiObservation {
    pub ssid: Option<String>,
    pub supported_rates: Vec<u8>,
    pub extended_rates: Vec<u8>,
    pub ht_capabilities: Option<u16>,
    pub vht_capabilities: Option<u32>,
    pub he_supported: bool,
    pub rsn: Option<RsnSummary>,
    pub vendor_ies: Vec<VendorIe>,
    /// SSIDs this device has probed for, in the order first observed.
    /// Order is preserved through canonicalization; the probe sequence
    /// is itself a behavioral signal.
    pub probed_ssids: Vec<String>,
    pub wps: Option<WpsInfo>,
    /// Last observed 802.11 sequence counter. Rotates with the MAC on
    /// randomizing devices, so it is excluded from the stable subset.
    pub sequence_number: Option<u16>,
}

/// Capability fields observed on a Bluetooth device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BtObservation {
    pub name: Option<String>,
    pub device_class: Option<u32>,
    pub service_uuids: Vec<String>,
    pub manufacturer_id: Option<u16>,
    /// Raw manufacturer advertisement payload. Rotates on modern BLE
    /// devices, so it is excluded from the stable subset.
    pub manufacturer_data: Vec<u8>,
    pub tx_power: Option<i8>,
}

/// Malformed capture record: rejected per record, never fatal
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("capture record has a zero MAC address")]
    MissingMac,
    #[error("record for {proto} carries no matching observation")]
    MissingObservation { proto: ProtocolFamily },
}

/// One observed device/frame at one instant, as supplied by the
/// capture backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub mac: MacAddr,
    pub proto: ProtocolFamily,
    pub signal_dbm: Option<i8>,
    pub timestamp: DateTime<Utc>,
    pub location: Option<GeoTag>,
    pub wifi: Option<WifiObservation>,
    pub bt: Option<BtObservation>,
}

impl CaptureRecord {
    /// Check mandatory fields. A record failing validation is rejected
    /// with an audit trail entry and never enters the pipeline.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.mac.is_zero() {
            return Err(RecordError::MissingMac);
        }
        if self.proto.is_wifi() && self.wifi.is_none() {
            return Err(RecordError::MissingObservation { proto: self.proto });
        }
        if self.proto.is_bluetooth() && self.bt.is_none() {
            return Err(RecordError::MissingObservation { proto: self.proto });
        }
        Ok(())
    }
}

/// Heuristic device category, used as the candidate label when an
/// unknown signature is learned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Smartphone,
    Laptop,
    Iot,
    LegacyWifiG,
    LegacyWifiB,
    AudioDevice,
    Wearable,
    Peripheral,
    Unknown,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Smartphone => write!(f, "smartphone"),
            DeviceType::Laptop => write!(f, "laptop"),
            DeviceType::Iot => write!(f, "iot"),
            DeviceType::LegacyWifiG => write!(f, "legacy_wifi_g"),
            DeviceType::LegacyWifiB => write!(f, "legacy_wifi_b"),
            DeviceType::AudioDevice => write!(f, "audio_device"),
            DeviceType::Wearable => write!(f, "wearable"),
            DeviceType::Peripheral => write!(f, "peripheral"),
            DeviceType::Unknown => write!(f, "unknown"),
        }
    }
}

/// Match tier of a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTier {
    Exact,
    Partial,
    None,
}

impl std::fmt::Display for MatchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchTier::Exact => write!(f, "exact"),
            MatchTier::Partial => write!(f, "partial"),
            MatchTier::None => write!(f, "none"),
        }
    }
}

/// Reference to the whitelist entry a classification matched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistMatch {
    pub label: String,
    /// Display form of the identifier that matched (MAC, OUI, pattern
    /// or digest)
    pub identifier: String,
}

/// Reference to the stored signature a classification matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureMatch {
    pub digest: FingerprintDigest,
    pub device_type: Option<String>,
    pub confidence: f64,
}

/// Output of one classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub mac: MacAddr,
    pub proto: ProtocolFamily,
    pub fingerprint: Fingerprint,
    pub tier: MatchTier,
    pub confidence: f64,
    /// Whitelist reference, if any tier-1/2 entry matched. When both a
    /// whitelist and a signature reference are present the whitelist
    /// label and confidence have already won the tie-break.
    pub whitelist: Option<WhitelistMatch>,
    pub signature: Option<SignatureMatch>,
    pub suspicious: bool,
    /// Advisory detail behind the suspicious flag
    pub suspicious_reasons: Vec<String>,
    /// Set when the signature store was unavailable and only whitelist
    /// tiers were evaluated
    pub degraded: bool,
    pub cluster: ClusterId,
    pub device_type: DeviceType,
    /// Human-readable device description (Bluetooth device class or
    /// known service names), when one can be derived
    pub device_label: Option<String>,
    pub location: Option<GeoTag>,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationResult {
    /// True when the device matched the whitelist or a stored
    /// signature at any tier
    pub fn is_known(&self) -> bool {
        self.tier != MatchTier::None
    }

    pub fn label(&self) -> Option<&str> {
        if let Some(wl) = &self.whitelist {
            return Some(&wl.label);
        }
        self.signature
            .as_ref()
            .and_then(|s| s.device_type.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wifi_record() -> CaptureRecord {
        CaptureRecord {
            mac: "aa:bb:cc:01:02:03".parse().unwrap(),
            proto: ProtocolFamily::WifiClient,
            signal_dbm: Some(-50),
            timestamp: Utc::now(),
            location: None,
            wifi: Some(WifiObservation::default()),
            bt: None,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(wifi_record().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_mac() {
        let mut rec = wifi_record();
        rec.mac = MacAddr::ZERO;
        assert_eq!(rec.validate(), Err(RecordError::MissingMac));
    }

    #[test]
    fn test_validate_observation_mismatch() {
        let mut rec = wifi_record();
        rec.wifi = None;
        assert!(matches!(
            rec.validate(),
            Err(RecordError::MissingObservation { .. })
        ));
    }

    #[test]
    fn test_protocol_family_roundtrip() {
        for proto in [
            ProtocolFamily::WifiAp,
            ProtocolFamily::WifiClient,
            ProtocolFamily::BtClassic,
            ProtocolFamily::BtLe,
        ] {
            let parsed: ProtocolFamily = proto.to_string().parse().unwrap();
            assert_eq!(parsed, proto);
        }
    }
}
