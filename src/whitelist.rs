//! Operator Whitelist
//!
//! Loads and indexes the operator-authored list of known devices.
//! Entries identify a device by exact MAC, OUI prefix, SSID/name glob,
//! or fingerprint digest. A malformed entry is rejected individually
//! with a reported error; it never aborts loading the rest.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::hasher::FingerprintDigest;
use crate::mac::{MacAddr, Oui};

/// File-level whitelist load failure
#[derive(Debug, Error)]
pub enum WhitelistError {
    #[error("failed to read whitelist file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse whitelist file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Compiled SSID/name glob. `*` matches any run of characters at the
/// position given; everything else is literal.
#[derive(Debug, Clone)]
pub struct SsidPattern {
    raw: String,
    regex: Regex,
}

impl SsidPattern {
    pub fn compile(raw: &str) -> Result<Self, regex::Error> {
        let mut pattern = String::from("^");
        for (i, chunk) in raw.split('*').enumerate() {
            if i > 0 {
                pattern.push_str(".*");
            }
            pattern.push_str(&regex::escape(chunk));
        }
        pattern.push('$');

        Ok(Self {
            raw: raw.to_string(),
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Closed identifier variants; each carries its own comparison data
#[derive(Debug, Clone)]
pub enum WhitelistIdent {
    Mac(MacAddr),
    Oui(Oui),
    SsidPattern(SsidPattern),
    Fingerprint(FingerprintDigest),
}

impl std::fmt::Display for WhitelistIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WhitelistIdent::Mac(mac) => write!(f, "{}", mac),
            WhitelistIdent::Oui(oui) => write!(f, "{}", oui),
            WhitelistIdent::SsidPattern(p) => write!(f, "{}", p.raw()),
            WhitelistIdent::Fingerprint(d) => write!(f, "{}", d),
        }
    }
}

/// One operator-authored whitelist entry
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pub ident: WhitelistIdent,
    pub label: String,
    pub notes: Option<String>,
}

/// Indexed whitelist, immutable for the duration of one analysis run
#[derive(Debug, Default)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
    by_mac: HashMap<MacAddr, usize>,
    by_oui: HashMap<Oui, usize>,
    by_digest: HashMap<FingerprintDigest, usize>,
    patterns: Vec<usize>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: WhitelistEntry) {
        let idx = self.entries.len();
        match &entry.ident {
            WhitelistIdent::Mac(mac) => {
                self.by_mac.insert(*mac, idx);
            }
            WhitelistIdent::Oui(oui) => {
                self.by_oui.insert(*oui, idx);
            }
            WhitelistIdent::Fingerprint(digest) => {
                self.by_digest.insert(*digest, idx);
            }
            WhitelistIdent::SsidPattern(_) => {
                self.patterns.push(idx);
            }
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }

    /// Tier-1 lookup: exact fingerprint digest or exact MAC
    pub fn match_exact(
        &self,
        mac: &MacAddr,
        digest: &FingerprintDigest,
    ) -> Option<&WhitelistEntry> {
        if let Some(idx) = self.by_digest.get(digest) {
            return Some(&self.entries[*idx]);
        }
        self.by_mac.get(mac).map(|idx| &self.entries[*idx])
    }

    /// Tier-2 lookup: OUI prefix, then SSID/name glob
    pub fn match_pattern(&self, mac: &MacAddr, name: Option<&str>) -> Option<&WhitelistEntry> {
        if let Some(idx) = self.by_oui.get(&mac.oui()) {
            return Some(&self.entries[*idx]);
        }
        if let Some(name) = name {
            for idx in &self.patterns {
                if let WhitelistIdent::SsidPattern(pattern) = &self.entries[*idx].ident {
                    if pattern.matches(name) {
                        return Some(&self.entries[*idx]);
                    }
                }
            }
        }
        None
    }

    /// Load from the operator's JSON file. Entry-level failures are
    /// collected in the report and logged; they never abort the load.
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<(Self, LoadReport), WhitelistError> {
        let content = std::fs::read_to_string(&path)?;
        let parsed = Self::load_str(&content)?;
        info!(
            "Loaded whitelist from {}: {} entries, {} rejected",
            path.as_ref().display(),
            parsed.0.len(),
            parsed.1.rejected.len()
        );
        Ok(parsed)
    }

    /// Parse whitelist JSON. Expected layout:
    ///
    /// ```json
    /// {
    ///   "wifi_devices": [{"mac": "...", "name": "...", "notes": "..."}],
    ///   "bluetooth_devices": [{"mac": "...", "name": "..."}],
    ///   "oui_whitelist": [{"oui": "00:1a:2b", "name": "Cisco Systems"}],
    ///   "fingerprint_whitelist": [{"digest": "...", "name": "..."}],
    ///   "ssid_whitelist": [{"pattern": "corp-*", "name": "Corp APs"}]
    /// }
    /// ```
    ///
    /// The last three sections also accept bare strings
    /// (`"oui_whitelist": ["00:1a:2b"]`); such entries carry an empty
    /// label.
    pub fn load_str(content: &str) -> Result<(Self, LoadReport), WhitelistError> {
        let file: WhitelistFile = serde_json::from_str(content)?;
        let mut whitelist = Whitelist::new();
        let mut report = LoadReport::default();

        let sections: [(&str, &[serde_json::Value]); 5] = [
            ("wifi_devices", &file.wifi_devices),
            ("bluetooth_devices", &file.bluetooth_devices),
            ("oui_whitelist", &file.oui_whitelist),
            ("fingerprint_whitelist", &file.fingerprint_whitelist),
            ("ssid_whitelist", &file.ssid_whitelist),
        ];

        for (section, values) in sections {
            for value in values {
                match parse_entry(section, value) {
                    Ok(entry) => {
                        whitelist.insert(entry);
                        report.loaded += 1;
                    }
                    Err(reason) => {
                        warn!(
                            section,
                            value = %value,
                            reason,
                            "rejected malformed whitelist entry"
                        );
                        report.rejected.push(RejectedEntry {
                            section: section.to_string(),
                            value: value.to_string(),
                            reason,
                        });
                    }
                }
            }
        }

        Ok((whitelist, report))
    }
}

/// Outcome of a whitelist load
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    pub rejected: Vec<RejectedEntry>,
}

/// A single rejected entry with the reason it was refused
#[derive(Debug, Clone)]
pub struct RejectedEntry {
    pub section: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
struct WhitelistFile {
    #[serde(default)]
    wifi_devices: Vec<serde_json::Value>,
    #[serde(default)]
    bluetooth_devices: Vec<serde_json::Value>,
    #[serde(default)]
    oui_whitelist: Vec<serde_json::Value>,
    #[serde(default)]
    fingerprint_whitelist: Vec<serde_json::Value>,
    #[serde(default)]
    ssid_whitelist: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MacEntry {
    mac: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OuiEntry {
    oui: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FingerprintEntry {
    digest: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SsidEntry {
    pattern: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    notes: Option<String>,
}

fn parse_entry(section: &str, value: &serde_json::Value) -> Result<WhitelistEntry, String> {
    match section {
        "wifi_devices" | "bluetooth_devices" => {
            let entry: MacEntry =
                serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
            let mac: MacAddr = entry.mac.parse().map_err(|e: crate::mac::MacParseError| {
                format!("bad MAC '{}': {}", entry.mac, e)
            })?;
            Ok(WhitelistEntry {
                ident: WhitelistIdent::Mac(mac),
                label: entry.name,
                notes: entry.notes,
            })
        }
        "oui_whitelist" => {
            let (raw, name, notes) = string_or(value, |e: OuiEntry| (e.oui, e.name, e.notes))?;
            let oui: Oui = raw
                .parse()
                .map_err(|e: crate::mac::MacParseError| format!("bad OUI '{}': {}", raw, e))?;
            Ok(WhitelistEntry {
                ident: WhitelistIdent::Oui(oui),
                label: name,
                notes,
            })
        }
        "fingerprint_whitelist" => {
            let (raw, name, notes) =
                string_or(value, |e: FingerprintEntry| (e.digest, e.name, e.notes))?;
            let digest: FingerprintDigest =
                raw.parse().map_err(|e: crate::hasher::DigestParseError| {
                    format!("bad digest '{}': {}", raw, e)
                })?;
            Ok(WhitelistEntry {
                ident: WhitelistIdent::Fingerprint(digest),
                label: name,
                notes,
            })
        }
        "ssid_whitelist" => {
            let (raw, name, notes) =
                string_or(value, |e: SsidEntry| (e.pattern, e.name, e.notes))?;
            let pattern = SsidPattern::compile(&raw)
                .map_err(|e| format!("bad pattern '{}': {}", raw, e))?;
            Ok(WhitelistEntry {
                ident: WhitelistIdent::SsidPattern(pattern),
                label: name,
                notes,
            })
        }
        _ => Err(format!("unknown section: {}", section)),
    }
}

/// Accept either a bare identifier string or the full object form
fn string_or<E: serde::de::DeserializeOwned>(
    value: &serde_json::Value,
    split: impl FnOnce(E) -> (String, String, Option<String>),
) -> Result<(String, String, Option<String>), String> {
    if let Some(s) = value.as_str() {
        return Ok((s.to_string(), String::new(), None));
    }
    let entry: E = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    Ok(split(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_semantics() {
        let p = SsidPattern::compile("corp-*").unwrap();
        assert!(p.matches("corp-guest"));
        assert!(p.matches("corp-"));
        assert!(!p.matches("guest-corp-x"));

        let p = SsidPattern::compile("*phone*").unwrap();
        assert!(p.matches("my phone net"));
        assert!(p.matches("phone"));
        assert!(!p.matches("tablet"));

        // Literal patterns stay literal
        let p = SsidPattern::compile("net.1").unwrap();
        assert!(p.matches("net.1"));
        assert!(!p.matches("netx1"));
    }

    #[test]
    fn test_exact_and_pattern_lookup() {
        let mut wl = Whitelist::new();
        wl.insert(WhitelistEntry {
            ident: WhitelistIdent::Mac("aa:bb:cc:dd:ee:ff".parse().unwrap()),
            label: "Office printer".into(),
            notes: None,
        });
        wl.insert(WhitelistEntry {
            ident: WhitelistIdent::Oui("00:1a:2b".parse().unwrap()),
            label: "Cisco Systems".into(),
            notes: None,
        });

        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let digest = crate::hasher::digest_bytes(b"x");
        assert_eq!(
            wl.match_exact(&mac, &digest).map(|e| e.label.as_str()),
            Some("Office printer")
        );

        let cisco: MacAddr = "00:1a:2b:11:22:33".parse().unwrap();
        assert!(wl.match_exact(&cisco, &digest).is_none());
        assert_eq!(
            wl.match_pattern(&cisco, None).map(|e| e.label.as_str()),
            Some("Cisco Systems")
        );
    }

    #[test]
    fn test_load_rejects_bad_entries_individually() {
        let json = r#"{
            "wifi_devices": [
                {"mac": "aa:bb:cc:dd:ee:ff", "name": "Laptop"},
                {"mac": "not-a-mac", "name": "Broken"},
                {"name": "No MAC at all"}
            ],
            "oui_whitelist": [
                {"oui": "00:1a:2b", "name": "Cisco Systems"}
            ]
        }"#;

        let (wl, report) = Whitelist::load_str(json).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(wl.len(), 2);
    }

    #[test]
    fn test_load_bare_string_entries() {
        let json = r#"{
            "oui_whitelist": ["00:1a:2b"],
            "ssid_whitelist": ["corp-*"]
        }"#;

        let (wl, report) = Whitelist::load_str(json).unwrap();
        assert_eq!(report.loaded, 2);
        assert!(report.rejected.is_empty());

        let mac: MacAddr = "00:1a:2b:11:22:33".parse().unwrap();
        let entry = wl.match_pattern(&mac, None).unwrap();
        assert_eq!(entry.label, "");
    }

    #[test]
    fn test_load_empty_sections() {
        let (wl, report) = Whitelist::load_str("{}").unwrap();
        assert!(wl.is_empty());
        assert_eq!(report.loaded, 0);
    }
}
