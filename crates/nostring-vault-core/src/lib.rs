//! NoString Vault Core
//!
//! Everything that needs script or key knowledge for an heir claim, kept
//! behind a text boundary so the claim orchestrator never shares memory
//! with it:
//!
//! - **Backup verification**: the key material in a [`backup::VaultBackup`]
//!   must produce the internal key, and its recovery leaves (precompiled or
//!   recompiled) must commit to the vault's Taproot output key
//! - **Claim construction**: an unsigned script-path PSBT spending the vault
//!   to the heir's destination
//! - **Finalization**: turn a PSBT signed on the heir's device into a
//!   broadcastable transaction
//!
//! # Security
//!
//! - Holds no private keys and never signs
//! - Verifies the backup from public data only (owner and co-signer keys,
//!   chain code, leaf scripts, control blocks); a tampered address, key or
//!   leaf fails verification
//!
//! # Example
//!
//! ```ignore
//! use nostring_vault_core::api;
//!
//! let response = api::import_vault_backup(&backup_json);
//! // {"success":true,"data":{"network":"testnet",...},"error":null}
//! ```

pub mod api;
pub mod backup;
pub mod ccd;
pub mod claim;
pub mod finalize;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Only backup schema version this core understands.
pub const SUPPORTED_BACKUP_VERSION: u32 = 1;

/// Highest fee rate (sat/vB) a claim may be built with.
pub const MAX_FEE_RATE_SAT_VB: u64 = 500;

/// Smallest claim output we are willing to create.
pub const DUST_LIMIT_SAT: u64 = 546;

/// Machine-readable failure category, carried across the text boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreErrorKind {
    /// Backup JSON does not match the schema
    InvalidBackup,
    /// Backup declares a version we do not understand
    UnsupportedVersion,
    /// Backup parsed but its key material does not produce the vault address
    VerificationFailed,
    /// Address unparseable or for the wrong network
    InvalidAddress,
    /// Network name not recognised
    UnknownNetwork,
    /// Inputs cannot cover the fee plus a non-dust output
    InsufficientFunds,
    /// Bad heir index, fee rate or UTXO list
    InvalidRequest,
    /// Payload is not a PSBT or transaction
    MalformedPsbt,
    /// PSBT is missing signatures
    IncompleteSignatures,
}

impl fmt::Display for CoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CoreErrorKind::InvalidBackup => "invalid backup",
            CoreErrorKind::UnsupportedVersion => "unsupported version",
            CoreErrorKind::VerificationFailed => "verification failed",
            CoreErrorKind::InvalidAddress => "invalid address",
            CoreErrorKind::UnknownNetwork => "unknown network",
            CoreErrorKind::InsufficientFunds => "insufficient funds",
            CoreErrorKind::InvalidRequest => "invalid request",
            CoreErrorKind::MalformedPsbt => "malformed PSBT",
            CoreErrorKind::IncompleteSignatures => "incomplete signatures",
        };
        f.write_str(s)
    }
}

/// Error returned by every Vault Core operation.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub reason: String,
}

impl CoreError {
    pub fn new(kind: CoreErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    pub(crate) fn verification(reason: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::VerificationFailed, reason)
    }
}

/// Parse a backup/config network name.
pub fn parse_network(network: &str) -> Result<Network, CoreError> {
    match network {
        "mainnet" | "bitcoin" => Ok(Network::Bitcoin),
        "testnet" | "testnet3" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => Err(CoreError::new(
            CoreErrorKind::UnknownNetwork,
            format!("unknown network: {}", other),
        )),
    }
}

/// Canonical name for a network, as written into backups.
pub fn network_name(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "bitcoin",
        Network::Testnet => "testnet",
        Network::Signet => "signet",
        Network::Regtest => "regtest",
        _ => "testnet4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("bitcoin").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("mainnet").unwrap(), Network::Bitcoin);
        assert_eq!(parse_network("testnet").unwrap(), Network::Testnet);
        assert_eq!(parse_network("signet").unwrap(), Network::Signet);
        assert_eq!(parse_network("regtest").unwrap(), Network::Regtest);

        let err = parse_network("litecoin").unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::UnknownNetwork);
        assert!(err.reason.contains("litecoin"));
    }

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&CoreErrorKind::IncompleteSignatures).unwrap();
        assert_eq!(json, "\"incomplete_signatures\"");
    }
}
