//! Configuration management for a scan run.
//!
//! Raw options (from the CLI) are validated once into an immutable
//! [`ScanConfig`]. Provider tuning can additionally be loaded from a TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage slots inspected per contract unless overridden.
pub const DEFAULT_CONTRACT_POSITIONS: u32 = 16;

/// Ignored type substrings used when none are given.
pub const DEFAULT_IGNORED_FORMATS: &[&str] = &["Non-ISO", "ISO-8859 text"];

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("ending block ID/timestamp should not be lower than the starting one")]
    ReversedRange,

    #[error("can't save transactions without transaction extracting mode")]
    SaveWithoutTransactions,

    #[error("only one of --unicode, --encrypted and --custom-entropy may be set")]
    ConflictingEntropy,

    #[error("entropy limits should be between 0.0 and 8.0 with min <= max (got {min}, {max})")]
    EntropyOutOfBounds { min: f64, max: f64 },

    #[error("'--contract-position' is only valid together with '--contracts'")]
    ContractPositionWithoutContracts,

    #[error("contract position should be positive (got {0})")]
    NonPositiveContractPosition(i64),
}

/// Ledger provider connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the Etherscan-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chain queried through the multichain endpoint
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Maximum requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chain_id: default_chain_id(),
            requests_per_second: default_rps(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.etherscan.io/v2/api".to_string()
}

fn default_chain_id() -> u64 {
    1
}

fn default_rps() -> u32 {
    5 // Free tier
}

fn default_timeout_secs() -> u64 {
    30
}

impl ProviderConfig {
    /// Load from a TOML file
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = ::toml::from_str(&contents)?;
        Ok(config)
    }
}

/// Which payload sources are inspected for every block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceModes {
    pub transactions: bool,
    pub blocks: bool,
    pub addresses: bool,
    pub contracts: bool,
}

impl SourceModes {
    /// Transaction inputs are the default source when nothing else is chosen.
    fn with_default(mut self) -> Self {
        if !self.transactions && !self.blocks && !self.addresses && !self.contracts {
            self.transactions = true;
        }
        self
    }

    /// Whether the run walks individual transactions.
    pub fn counts_transactions(&self) -> bool {
        self.transactions || self.addresses
    }
}

/// Inclusive entropy range with the label given to matching blobs
#[derive(Debug, Clone, PartialEq)]
pub struct EntropyWindow {
    pub min: f64,
    pub max: f64,
    pub label: String,
}

impl EntropyWindow {
    pub fn unicode() -> Self {
        Self {
            min: 3.5,
            max: 5.0,
            label: "possible UTF-8 text".to_string(),
        }
    }

    pub fn encrypted() -> Self {
        Self {
            min: 7.0,
            max: 8.0,
            label: "possible encrypted/compressed data".to_string(),
        }
    }

    pub fn custom(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            label: "from custom entropy".to_string(),
        }
    }

    pub fn contains(&self, entropy: f64) -> bool {
        entropy >= self.min && entropy <= self.max
    }
}

/// Enabled detection methods, consulted in cascade order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionConfig {
    /// Carve embedded files; replaces header detection when set.
    pub embedded: bool,
    pub strings: bool,
    pub entropy: Option<EntropyWindow>,
}

impl DetectionConfig {
    pub fn header(&self) -> bool {
        !self.embedded
    }
}

/// Detected-type labels that must not be extracted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreList {
    /// Wildcard: nothing is ever extracted.
    Everything,
    /// Lowercased substrings matched against the lowercased label.
    Substrings(Vec<String>),
}

impl IgnoreList {
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Self {
        if patterns.iter().any(|p| p.as_ref().trim() == "*") {
            return Self::Everything;
        }
        Self::Substrings(
            patterns
                .iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        )
    }

    pub fn defaults() -> Self {
        Self::from_patterns(DEFAULT_IGNORED_FORMATS)
    }

    pub fn ignores_everything(&self) -> bool {
        matches!(self, Self::Everything)
    }

    /// The bare `data` label (nothing recognized) is always ignored.
    pub fn is_ignored(&self, detected_type: &str) -> bool {
        let label = detected_type.trim().to_lowercase();
        if label == crate::identify::UNKNOWN_LABEL {
            return true;
        }
        match self {
            Self::Everything => true,
            Self::Substrings(patterns) => patterns.iter().any(|p| label.contains(p.as_str())),
        }
    }
}

/// Raw, unvalidated run options
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub start: u64,
    pub end: u64,
    pub timestamps: bool,
    pub modes: SourceModes,
    pub embedded: bool,
    pub strings: bool,
    pub unicode: bool,
    pub encrypted: bool,
    pub custom_entropy: Option<(f64, f64)>,
    pub contract_position: Option<i64>,
    pub save_transactions: bool,
    pub ignored_formats: Option<Vec<String>>,
    pub output_dir: Option<PathBuf>,
}

/// Validated, immutable run configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Block ids, or UNIX timestamps when `timestamps` is set
    pub start: u64,
    pub end: u64,
    pub timestamps: bool,
    pub modes: SourceModes,
    pub detection: DetectionConfig,
    pub ignore: IgnoreList,
    pub contract_positions: u32,
    pub save_transactions: bool,
    pub output_dir: Option<PathBuf>,
}

impl ScanOptions {
    /// Reject invalid combinations before anything touches the filesystem.
    pub fn validate(self) -> Result<ScanConfig, ConfigError> {
        if self.end < self.start {
            return Err(ConfigError::ReversedRange);
        }

        let modes = self.modes.with_default();
        if self.save_transactions && !modes.transactions {
            return Err(ConfigError::SaveWithoutTransactions);
        }

        let selected = [self.unicode, self.encrypted, self.custom_entropy.is_some()]
            .iter()
            .filter(|s| **s)
            .count();
        if selected > 1 {
            return Err(ConfigError::ConflictingEntropy);
        }

        let entropy = match self.custom_entropy {
            Some((min, max)) => {
                let in_bounds = |v: f64| (0.0..=8.0).contains(&v);
                if !in_bounds(min) || !in_bounds(max) || min > max {
                    return Err(ConfigError::EntropyOutOfBounds { min, max });
                }
                Some(EntropyWindow::custom(min, max))
            }
            None if self.unicode => Some(EntropyWindow::unicode()),
            None if self.encrypted => Some(EntropyWindow::encrypted()),
            None => None,
        };

        let contract_positions = match self.contract_position {
            Some(_) if !modes.contracts => {
                return Err(ConfigError::ContractPositionWithoutContracts)
            }
            Some(pos) if pos <= 0 => return Err(ConfigError::NonPositiveContractPosition(pos)),
            Some(pos) => u32::try_from(pos).unwrap_or(u32::MAX),
            None => DEFAULT_CONTRACT_POSITIONS,
        };

        let ignore = match &self.ignored_formats {
            Some(patterns) => IgnoreList::from_patterns(patterns.as_slice()),
            None => IgnoreList::defaults(),
        };

        Ok(ScanConfig {
            start: self.start,
            end: self.end,
            timestamps: self.timestamps,
            modes,
            detection: DetectionConfig {
                embedded: self.embedded,
                strings: self.strings,
                entropy,
            },
            ignore,
            contract_positions,
            save_transactions: self.save_transactions,
            output_dir: self.output_dir,
        })
    }
}

/// Resolve the provider API key: explicit value, then `ETHERSCAN_API_KEY`
/// (optionally from `.env`), then the key file.
pub fn resolve_api_key(explicit: Option<&str>, key_path: &Path) -> anyhow::Result<String> {
    if let Some(key) = explicit.filter(|k| !k.trim().is_empty()) {
        return Ok(key.trim().to_string());
    }

    dotenvy::dotenv().ok();
    if let Ok(key) = std::env::var("ETHERSCAN_API_KEY") {
        if !key.trim().is_empty() {
            return Ok(key.trim().to_string());
        }
    }

    let key = std::fs::read_to_string(key_path)
        .map_err(|_| anyhow::anyhow!("API key not found on {:?}", key_path))?;
    let key = key.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("API key file {:?} is empty", key_path);
    }
    Ok(key)
}
