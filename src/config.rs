use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::matcher::PartialField;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub matcher: MatcherConfig,

    #[serde(default)]
    pub learning: LearningConfig,

    #[serde(default)]
    pub continuity: ContinuityConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/rfscout/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

/// Matcher tier tunables.
///
/// The partial-field subset, thresholds and penalty are calibration
/// parameters, deliberately configuration rather than constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum stored confidence for an exact signature match
    #[serde(default = "default_min_signature_confidence")]
    pub min_signature_confidence: f64,

    /// Multiplier applied to stored confidence on a partial match
    #[serde(default = "default_partial_penalty")]
    pub partial_penalty: f64,

    /// Identifying fields the partial tier must see equal, on top of a
    /// shared vendor OUI
    #[serde(default = "default_partial_fields")]
    pub partial_fields: Vec<PartialField>,

    /// Signal strength at or above which an unmatched or partially
    /// matched device is flagged suspicious
    #[serde(default = "default_proximity_threshold")]
    pub proximity_threshold_dbm: i8,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            min_signature_confidence: default_min_signature_confidence(),
            partial_penalty: default_partial_penalty(),
            partial_fields: default_partial_fields(),
            proximity_threshold_dbm: default_proximity_threshold(),
        }
    }
}

/// Incremental-learning policy, explicit so tests can disable it
/// deterministically
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Confidence seeded into newly learned, unlabeled signatures
    #[serde(default = "default_seed_confidence")]
    pub seed_confidence: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            seed_confidence: default_seed_confidence(),
        }
    }
}

/// MAC-continuity tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityConfig {
    /// How recently a cluster must have been seen for a stable-feature
    /// match to merge into it. Tracks the typical randomized-MAC
    /// rotation interval.
    #[serde(default = "default_continuity_window")]
    pub window_secs: u64,
}

impl Default for ContinuityConfig {
    fn default() -> Self {
        Self {
            window_secs: default_continuity_window(),
        }
    }
}

/// Signature store backing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite signature database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Run with an in-memory store instead of the database file
    #[serde(default)]
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            in_memory: false,
        }
    }
}

/// Whitelist source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Path to the operator whitelist JSON; absent means an empty
    /// whitelist
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Engine runner tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the record/result channels
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_min_signature_confidence() -> f64 {
    0.7
}

fn default_partial_penalty() -> f64 {
    0.6
}

fn default_partial_fields() -> Vec<PartialField> {
    vec![PartialField::HtCapabilities, PartialField::RateSet]
}

fn default_proximity_threshold() -> i8 {
    -60
}

fn default_true() -> bool {
    true
}

fn default_seed_confidence() -> f64 {
    0.5
}

fn default_continuity_window() -> u64 {
    300
}

fn default_db_path() -> String {
    "/var/lib/rfscout/signatures.db".to_string()
}

fn default_queue_depth() -> usize {
    256
}
