//! Heir claim configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use bitcoin::Network;
use nostring_chain::Backend;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::error::ClaimError;
use crate::status::ChainSettings;

/// Networks an endpoint may be configured for, by config key.
const NETWORK_KEYS: &[(&str, Network)] = &[
    ("bitcoin", Network::Bitcoin),
    ("testnet", Network::Testnet),
    ("signet", Network::Signet),
    ("regtest", Network::Regtest),
];

/// Alternate spellings accepted wherever a network name is parsed.
const NETWORK_ALIASES: &[&str] = &["mainnet", "testnet3"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeirConfig {
    #[serde(default)]
    pub general: GeneralSection,

    /// Chain data service settings
    #[serde(default)]
    pub chain: ChainSection,

    #[serde(default)]
    pub claim: ClaimSection,

    /// Per-network base endpoint overrides (network name -> URL)
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralSection {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSection {
    /// "esplora" or "electrum"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts per status read before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Base delay between attempts (grows linearly)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ChainSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            timeout_secs: default_timeout_secs(),
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimSection {
    /// Highest fee rate (sat/vB) a claim may be built with
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate: u64,
}

impl Default for ClaimSection {
    fn default() -> Self {
        Self {
            max_fee_rate: default_max_fee_rate(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backend() -> String {
    "esplora".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_max_fee_rate() -> u64 {
    nostring_vault_core::MAX_FEE_RATE_SAT_VB
}

/// Validated network -> endpoint mapping for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTable {
    backend: Backend,
    endpoints: HashMap<Network, String>,
}

impl EndpointTable {
    /// Defaults for every network.
    pub fn defaults(backend: Backend) -> Self {
        let endpoints = NETWORK_KEYS
            .iter()
            .map(|(_, n)| (*n, nostring_chain::default_endpoint(backend, *n).to_string()))
            .collect();
        Self { backend, endpoints }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Endpoint for `network`.
    pub fn endpoint(&self, network: Network) -> Result<&str, ClaimError> {
        self.endpoints
            .get(&network)
            .map(String::as_str)
            .ok_or_else(|| {
                ClaimError::ConfigurationError(format!("no endpoint configured for {}", network))
            })
    }
}

fn network_for_key(key: &str) -> Option<Network> {
    nostring_vault_core::parse_network(key).ok()
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl HeirConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: HeirConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `NOSTRING_HEIR_LOG_LEVEL`
    /// - `NOSTRING_HEIR_BACKEND`
    /// - `NOSTRING_HEIR_TIMEOUT_SECS`
    /// - `NOSTRING_HEIR_ATTEMPTS`
    /// - `NOSTRING_HEIR_MAX_FEE_RATE`
    /// - `NOSTRING_HEIR_ENDPOINT_<NETWORK>` (e.g. `NOSTRING_HEIR_ENDPOINT_SIGNET`,
    ///   or an alias such as `NOSTRING_HEIR_ENDPOINT_MAINNET`)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NOSTRING_HEIR_LOG_LEVEL") {
            self.general.log_level = v;
        }
        if let Ok(v) = std::env::var("NOSTRING_HEIR_BACKEND") {
            self.chain.backend = v;
        }
        if let Ok(v) = std::env::var("NOSTRING_HEIR_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                self.chain.timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("NOSTRING_HEIR_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.chain.attempts = n;
            }
        }
        if let Ok(v) = std::env::var("NOSTRING_HEIR_MAX_FEE_RATE") {
            if let Ok(rate) = v.parse::<u64>() {
                self.claim.max_fee_rate = rate;
            }
        }
        let keys = NETWORK_KEYS.iter().map(|(k, _)| *k);
        for key in keys.chain(NETWORK_ALIASES.iter().copied()) {
            let var = format!("NOSTRING_HEIR_ENDPOINT_{}", key.to_ascii_uppercase());
            if let Ok(v) = std::env::var(&var) {
                self.endpoints.insert(key.to_string(), v);
            }
        }
    }

    pub fn backend(&self) -> Result<Backend, ClaimError> {
        self.chain
            .backend
            .parse()
            .map_err(ClaimError::ConfigurationError)
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            timeout: Duration::from_secs(self.chain.timeout_secs),
            attempts: self.chain.attempts,
            backoff: Duration::from_millis(self.chain.backoff_ms),
        }
    }

    /// Validate the configuration and build the endpoint table.
    pub fn validate(&self) -> Result<EndpointTable, ClaimError> {
        let backend = self.backend()?;

        if self.chain.timeout_secs == 0 {
            return Err(ClaimError::ConfigurationError(
                "chain.timeout_secs must be > 0".into(),
            ));
        }
        if self.chain.attempts == 0 {
            return Err(ClaimError::ConfigurationError(
                "chain.attempts must be > 0".into(),
            ));
        }
        if self.claim.max_fee_rate == 0 {
            return Err(ClaimError::ConfigurationError(
                "claim.max_fee_rate must be > 0".into(),
            ));
        }
        if self.claim.max_fee_rate > nostring_vault_core::MAX_FEE_RATE_SAT_VB {
            return Err(ClaimError::ConfigurationError(format!(
                "claim.max_fee_rate must be <= {}",
                nostring_vault_core::MAX_FEE_RATE_SAT_VB
            )));
        }

        let mut table = EndpointTable::defaults(backend);
        let mut seen: HashMap<Network, &str> = HashMap::new();
        for (key, url) in &self.endpoints {
            let network = network_for_key(key).ok_or_else(|| {
                ClaimError::ConfigurationError(format!("unknown network in [endpoints]: {}", key))
            })?;
            if let Some(first) = seen.insert(network, key) {
                return Err(ClaimError::ConfigurationError(format!(
                    "[endpoints] sets {} twice ({} and {})",
                    network, first, key
                )));
            }
            let url = url.trim();
            if url.is_empty() {
                return Err(ClaimError::ConfigurationError(format!(
                    "endpoint for {} must not be empty",
                    key
                )));
            }
            if !url.contains("://") {
                return Err(ClaimError::ConfigurationError(format!(
                    "endpoint for {} has no scheme: {}",
                    key, url
                )));
            }
            table.endpoints.insert(network, url.to_string());
        }

        Ok(table)
    }
}

// ============================================================================
// Tests
// ============================================================================
