//! Feature Extraction
//!
//! Normalizes raw capture records into canonical, order-independent
//! feature sets, the only input to fingerprint hashing. Also hosts the
//! device-type heuristics used to label newly learned signatures.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::mac::Oui;
use crate::models::{BtObservation, CaptureRecord, DeviceType, WifiObservation};

/// Canonical field tags, in canonical serialization order.
///
/// The discriminant is the wire tag; never renumber an existing tag or
/// stored digests stop reproducing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldTag {
    Protocol = 0x01,
    RateSet = 0x02,
    HtCapabilities = 0x03,
    VhtCapabilities = 0x04,
    HeSupport = 0x05,
    RsnGroupCipher = 0x06,
    RsnPairwiseCiphers = 0x07,
    RsnAkmSuites = 0x08,
    VendorOuis = 0x09,
    WpsPresent = 0x0a,
    ProbedSsids = 0x0b,
    WifiSeqCounter = 0x0c,
    BtDeviceClass = 0x0d,
    BtServiceUuids = 0x0e,
    BtManufacturerId = 0x0f,
    BtManufacturerData = 0x10,
    BtTxPower = 0x11,
}

/// Every tag, in canonical order
pub const CANONICAL_ORDER: [FieldTag; 17] = [
    FieldTag::Protocol,
    FieldTag::RateSet,
    FieldTag::HtCapabilities,
    FieldTag::VhtCapabilities,
    FieldTag::HeSupport,
    FieldTag::RsnGroupCipher,
    FieldTag::RsnPairwiseCiphers,
    FieldTag::RsnAkmSuites,
    FieldTag::VendorOuis,
    FieldTag::WpsPresent,
    FieldTag::ProbedSsids,
    FieldTag::WifiSeqCounter,
    FieldTag::BtDeviceClass,
    FieldTag::BtServiceUuids,
    FieldTag::BtManufacturerId,
    FieldTag::BtManufacturerData,
    FieldTag::BtTxPower,
];

impl FieldTag {
    /// Whether this field survives MAC randomization. Volatile fields
    /// (rotating counters and payloads) change together with the MAC,
    /// so the continuity resolver ignores them when correlating
    /// identities across address changes.
    pub fn is_randomization_stable(&self) -> bool {
        !matches!(
            self,
            FieldTag::WifiSeqCounter | FieldTag::BtManufacturerData
        )
    }
}

/// Canonical value of one feature field.
///
/// Absent inputs become an explicit marker so that two devices lacking
/// a field match each other on it, rather than matching anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Absent,
    Bool(bool),
    Byte(u8),
    U16(u16),
    U32(u32),
    I8(i8),
    ByteList(Vec<u8>),
    OuiList(Vec<Oui>),
    StringList(Vec<String>),
}

/// Ordered, deduplicated, type-normalized projection of a capture
/// record's capability fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFeatureSet {
    fields: Vec<(FieldTag, FieldValue)>,
}

impl CanonicalFeatureSet {
    pub fn fields(&self) -> &[(FieldTag, FieldValue)] {
        &self.fields
    }

    pub fn get(&self, tag: FieldTag) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v)
    }

    /// Projection onto randomization-stable fields only
    pub fn stable_subset(&self) -> CanonicalFeatureSet {
        CanonicalFeatureSet {
            fields: self
                .fields
                .iter()
                .filter(|(t, _)| t.is_randomization_stable())
                .cloned()
                .collect(),
        }
    }

    /// True when the two sets agree on every stable field
    pub fn stable_eq(&self, other: &CanonicalFeatureSet) -> bool {
        self.stable_subset() == other.stable_subset()
    }
}

/// Extract the canonical feature set from a capture record.
///
/// Total and pure: never fails, touches nothing outside the record.
/// Identical records (modulo list order of order-insensitive fields and
/// identifier casing) yield identical feature sets.
pub fn extract(record: &CaptureRecord) -> CanonicalFeatureSet {
    let mut fields = Vec::with_capacity(CANONICAL_ORDER.len());

    for tag in CANONICAL_ORDER {
        let value = match tag {
            FieldTag::Protocol => FieldValue::Byte(record.proto.code()),
            FieldTag::RateSet => record
                .wifi
                .as_ref()
                .map(|w| FieldValue::ByteList(canonical_rates(w)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::HtCapabilities => opt_u16(record.wifi.as_ref().and_then(|w| w.ht_capabilities)),
            FieldTag::VhtCapabilities => record
                .wifi
                .as_ref()
                .and_then(|w| w.vht_capabilities)
                .map(FieldValue::U32)
                .unwrap_or(FieldValue::Absent),
            FieldTag::HeSupport => record
                .wifi
                .as_ref()
                .map(|w| FieldValue::Bool(w.he_supported))
                .unwrap_or(FieldValue::Absent),
            FieldTag::RsnGroupCipher => record
                .wifi
                .as_ref()
                .and_then(|w| w.rsn.as_ref())
                .map(|r| FieldValue::Byte(r.group_cipher))
                .unwrap_or(FieldValue::Absent),
            FieldTag::RsnPairwiseCiphers => record
                .wifi
                .as_ref()
                .and_then(|w| w.rsn.as_ref())
                .map(|r| FieldValue::ByteList(sorted_dedup(&r.pairwise_ciphers)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::RsnAkmSuites => record
                .wifi
                .as_ref()
                .and_then(|w| w.rsn.as_ref())
                .map(|r| FieldValue::ByteList(sorted_dedup(&r.akm_suites)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::VendorOuis => record
                .wifi
                .as_ref()
                .filter(|w| !w.vendor_ies.is_empty())
                .map(|w| FieldValue::OuiList(vendor_ouis(w)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::WpsPresent => record
                .wifi
                .as_ref()
                .map(|w| FieldValue::Bool(w.wps.is_some()))
                .unwrap_or(FieldValue::Absent),
            FieldTag::ProbedSsids => record
                .wifi
                .as_ref()
                .filter(|w| !w.probed_ssids.is_empty())
                .map(|w| FieldValue::StringList(dedup_preserving_order(&w.probed_ssids)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::WifiSeqCounter => {
                opt_u16(record.wifi.as_ref().and_then(|w| w.sequence_number))
            }
            FieldTag::BtDeviceClass => record
                .bt
                .as_ref()
                .and_then(|b| b.device_class)
                .map(FieldValue::U32)
                .unwrap_or(FieldValue::Absent),
            FieldTag::BtServiceUuids => record
                .bt
                .as_ref()
                .filter(|b| !b.service_uuids.is_empty())
                .map(|b| FieldValue::StringList(canonical_service_uuids(&b.service_uuids)))
                .unwrap_or(FieldValue::Absent),
            FieldTag::BtManufacturerId => opt_u16(record.bt.as_ref().and_then(|b| b.manufacturer_id)),
            FieldTag::BtManufacturerData => record
                .bt
                .as_ref()
                .filter(|b| !b.manufacturer_data.is_empty())
                .map(|b| FieldValue::ByteList(b.manufacturer_data.clone()))
                .unwrap_or(FieldValue::Absent),
            FieldTag::BtTxPower => record
                .bt
                .as_ref()
                .and_then(|b| b.tx_power)
                .map(FieldValue::I8)
                .unwrap_or(FieldValue::Absent),
        };
        fields.push((tag, value));
    }

    CanonicalFeatureSet { fields }
}

fn opt_u16(v: Option<u16>) -> FieldValue {
    v.map(FieldValue::U16).unwrap_or(FieldValue::Absent)
}

/// Supported + extended rates, basic-rate flag masked off, sorted and
/// deduplicated
fn canonical_rates(wifi: &WifiObservation) -> Vec<u8> {
    let rates: BTreeSet<u8> = wifi
        .supported_rates
        .iter()
        .chain(wifi.extended_rates.iter())
        .map(|r| r & 0x7f)
        .filter(|r| *r != 0)
        .collect();
    rates.into_iter().collect()
}

fn sorted_dedup(values: &[u8]) -> Vec<u8> {
    let set: BTreeSet<u8> = values.iter().copied().collect();
    set.into_iter().collect()
}

fn vendor_ouis(wifi: &WifiObservation) -> Vec<Oui> {
    let set: BTreeSet<Oui> = wifi.vendor_ies.iter().map(|ie| ie.oui).collect();
    set.into_iter().collect()
}

/// First occurrence wins; temporal order is preserved because the
/// probe sequence is a behavioral signal in its own right.
fn dedup_preserving_order(ssids: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for ssid in ssids {
        if !ssid.is_empty() && seen.insert(ssid.clone()) {
            out.push(ssid.clone());
        }
    }
    out
}

/// Normalize service UUIDs to their uppercase short form where the
/// UUID sits on the Bluetooth base, then sort and deduplicate.
fn canonical_service_uuids(uuids: &[String]) -> Vec<String> {
    const BASE_UUID_SUFFIX: &str = "00001000800000805F9B34FB";

    let set: BTreeSet<String> = uuids
        .iter()
        .filter(|u| !u.is_empty())
        .map(|u| {
            let cleaned: String = u
                .chars()
                .filter(|c| *c != '-')
                .collect::<String>()
                .to_ascii_uppercase();
            if cleaned.len() == 32 && cleaned.ends_with(BASE_UUID_SUFFIX) {
                cleaned[..8].trim_start_matches('0').to_string()
            } else {
                cleaned
            }
        })
        .collect();
    set.into_iter().collect()
}

// ==================== Device-Type Heuristics ====================

/// Best-effort device category from the observed capabilities
pub fn infer_device_type(record: &CaptureRecord) -> DeviceType {
    if let Some(wifi) = &record.wifi {
        return infer_wifi(wifi);
    }
    if let Some(bt) = &record.bt {
        return infer_bt(bt);
    }
    DeviceType::Unknown
}

fn infer_wifi(wifi: &WifiObservation) -> DeviceType {
    let rates = canonical_rates(wifi);
    let ht = wifi.ht_capabilities.is_some();
    let vht = wifi.vht_capabilities.is_some();

    // Modern smartphones carry HT+VHT and a full rate set
    if vht && ht && rates.len() >= 8 {
        return DeviceType::Smartphone;
    }
    // Laptops tend to advertise many vendor IEs
    if vht && wifi.vendor_ies.len() > 3 {
        return DeviceType::Laptop;
    }
    if !ht && rates.len() <= 4 && !rates.is_empty() {
        return DeviceType::Iot;
    }
    if !ht && rates.contains(&108) {
        return DeviceType::LegacyWifiG;
    }
    if !ht && rates.iter().max().map(|r| *r <= 22).unwrap_or(false) {
        return DeviceType::LegacyWifiB;
    }
    DeviceType::Unknown
}

fn infer_bt(bt: &BtObservation) -> DeviceType {
    if let Some(class) = bt.device_class {
        // Major device class, bits 8..12
        return match (class >> 8) & 0x1f {
            0x01 => DeviceType::Laptop,
            0x02 => DeviceType::Smartphone,
            0x04 => DeviceType::AudioDevice,
            0x05 => DeviceType::Peripheral,
            0x07 => DeviceType::Wearable,
            _ => DeviceType::Unknown,
        };
    }
    DeviceType::Unknown
}

/// Human-readable Bluetooth description: the decoded device class when
/// present, otherwise the recognized service names. Carried as the
/// device label on classification results and as the model hint on
/// learned Bluetooth signatures.
pub fn describe_bt(bt: &BtObservation) -> Option<String> {
    if let Some(class) = bt.device_class {
        return Some(device_class_name(class).to_string());
    }
    let short = canonical_service_uuids(&bt.service_uuids);
    let names: Vec<&str> = short.iter().filter_map(|u| service_uuid_name(u)).collect();
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// Human-readable Bluetooth device class, keyed on the major/minor
/// class bits
pub fn device_class_name(class: u32) -> &'static str {
    let major_minor = (class & 0x001f00) | (class & 0x0000fc);
    match major_minor {
        0x000100 => "Computer - Uncategorized",
        0x000104 => "Computer - Desktop",
        0x00010c => "Computer - Laptop",
        0x000118 => "Computer - Wearable",
        0x000200 => "Phone - Uncategorized",
        0x000204 => "Phone - Cellular",
        0x00020c => "Phone - Smartphone",
        0x000404 => "Audio/Video - Headset",
        0x000418 => "Audio/Video - Headphones",
        0x000414 => "Audio/Video - Loudspeaker",
        0x000540 => "Peripheral - Keyboard",
        0x000580 => "Peripheral - Mouse",
        0x000704 => "Wearable - Watch",
        0x000918 => "Health - Heart Rate Monitor",
        _ => match class & 0x001f00 {
            0x000100 => "Computer",
            0x000200 => "Phone",
            0x000300 => "LAN/Network Access",
            0x000400 => "Audio/Video",
            0x000500 => "Peripheral",
            0x000600 => "Imaging",
            0x000700 => "Wearable",
            0x000900 => "Health",
            _ => "Unknown",
        },
    }
}

/// Well-known BLE service name for a normalized short UUID
pub fn service_uuid_name(short: &str) -> Option<&'static str> {
    Some(match short {
        "1800" => "Generic Access",
        "1801" => "Generic Attribute",
        "1805" => "Current Time",
        "180A" => "Device Information",
        "180D" => "Heart Rate",
        "180F" => "Battery",
        "1812" => "Human Interface Device",
        "181A" => "Environmental Sensing",
        "FD6F" => "Apple Exposure Notification",
        "FEAA" => "Google Eddystone",
        _ => return None,
    })
}
