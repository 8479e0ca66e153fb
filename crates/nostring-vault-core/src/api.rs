//! Text boundary of the Vault Core.
//!
//! Every function takes strings and plain integers and returns a JSON
//! envelope `{"success": bool, "data": T | null, "error": {kind, reason} | null}`.
//! Hosts never see Rust types from this crate, only their serialized form.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backup::{parse_address, VaultBackup};
use crate::claim::{self, ClaimInput};
use crate::finalize::{self, FinalizedTx, PreparedBroadcast};
use crate::{network_name, parse_network, CoreError, CoreErrorKind};

/// Envelope wrapping every response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<CoreError>,
}

impl<T: Serialize> CoreResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: CoreError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // Only reachable if T's Serialize impl fails
            format!(
                r#"{{"success":false,"data":null,"error":{{"kind":"invalid_request","reason":"response serialization failed: {}"}}}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }
}

impl<T: Serialize> From<Result<T, CoreError>> for CoreResponse<T> {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::err(e),
        }
    }
}

impl<T: DeserializeOwned> CoreResponse<T> {
    /// Decode a response produced by one of the functions below.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl<T> CoreResponse<T> {
    /// Collapse the envelope, treating a contradictory envelope as an error.
    pub fn into_result(self) -> Result<T, CoreError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), None) => Ok(data),
            (false, None, Some(error)) => Err(error),
            (success, data, error) => Err(CoreError::new(
                CoreErrorKind::InvalidRequest,
                format!(
                    "inconsistent response envelope (success={}, data={}, error={})",
                    success,
                    data.is_some(),
                    error.is_some()
                ),
            )),
        }
    }
}

fn respond<T: Serialize>(result: Result<T, CoreError>) -> String {
    CoreResponse::from(result).to_json()
}

/// Vault summary returned after parsing and verifying a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultInfo {
    pub network: String,
    pub vault_address: String,
    pub timelock_blocks: u16,
    pub threshold: usize,
    pub heir_count: usize,
    pub heir_labels: Vec<String>,
    pub has_recovery_leaves: bool,
    pub address_verified: bool,
}

/// Claim eligibility for explicit heights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimEligibility {
    pub eligible: bool,
    pub blocks_remaining: u64,
    pub time_remaining: String,
    pub current_height: u64,
    pub confirmation_height: u64,
    pub unlock_height: u64,
}

/// Built unsigned claim PSBT ready for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimPsbt {
    pub psbt_base64: String,
    pub total_input_sat: u64,
    pub fee_sat: u64,
    pub output_sat: u64,
    pub destination: String,
    pub num_inputs: usize,
    pub fee_rate: u64,
    pub vsize: u64,
}

/// Parse, validate, and verify a VaultBackup JSON string.
///
/// Fails if the key material or recovery leaves do not produce the vault
/// address; the backup may be corrupt or tampered.
pub fn import_vault_backup(json: &str) -> String {
    respond(import_inner(json))
}

fn import_inner(json: &str) -> Result<VaultInfo, CoreError> {
    let backup = VaultBackup::from_json(json)?;
    let vault = backup.verify()?;
    log::debug!(
        "verified vault {} ({} leaves, {} heirs)",
        vault.address,
        vault.leaves.len(),
        vault.heirs.len()
    );

    Ok(VaultInfo {
        network: network_name(vault.network).to_string(),
        vault_address: vault.address.to_string(),
        timelock_blocks: vault.timelock_blocks,
        threshold: vault.threshold,
        heir_count: vault.heirs.len(),
        heir_labels: vault.heirs.iter().map(|h| h.label.clone()).collect(),
        has_recovery_leaves: !backup.recovery_leaves.is_empty(),
        address_verified: true,
    })
}

/// Validate a Bitcoin address string for the given network.
///
/// An unparseable address is an error; a well-formed address for another
/// network is `false`.
pub fn validate_address(address: &str, network: &str) -> String {
    respond(validate_address_inner(address, network))
}

fn validate_address_inner(address: &str, network: &str) -> Result<bool, CoreError> {
    let network = parse_network(network)?;
    let unchecked: Address<NetworkUnchecked> = address.trim().parse().map_err(|e| {
        CoreError::new(
            CoreErrorKind::InvalidAddress,
            format!("Invalid address: {}", e),
        )
    })?;
    Ok(unchecked.is_valid_for_network(network))
}

/// Check whether an heir may claim at `current_height`.
pub fn check_eligibility(vault_json: &str, current_height: u64, confirmation_height: u64) -> String {
    respond(check_eligibility_inner(
        vault_json,
        current_height,
        confirmation_height,
    ))
}

fn check_eligibility_inner(
    vault_json: &str,
    current_height: u64,
    confirmation_height: u64,
) -> Result<ClaimEligibility, CoreError> {
    let backup = VaultBackup::from_json(vault_json)?;
    let unlock_height = confirmation_height.saturating_add(u64::from(backup.timelock_blocks));
    let blocks_remaining = unlock_height.saturating_sub(current_height);

    Ok(ClaimEligibility {
        eligible: blocks_remaining == 0,
        blocks_remaining,
        time_remaining: describe_blocks(blocks_remaining),
        current_height,
        confirmation_height,
        unlock_height,
    })
}

fn describe_blocks(blocks: u64) -> String {
    let minutes = blocks.saturating_mul(10);
    match minutes {
        0 => "ready now".to_string(),
        m if m > 1440 => format!("~{} days", m / 1440),
        m if m > 60 => format!("~{} hours", m / 60),
        m => format!("~{} minutes", m),
    }
}

/// Build an unsigned claim PSBT for the heir's recovery path.
///
/// `utxos_json` is a JSON array of `{"txid", "vout", "value_sat"}`. The heir
/// signs the PSBT externally, then passes it to [`finalize_psbt`].
pub fn build_claim_psbt(
    vault_json: &str,
    utxos_json: &str,
    destination: &str,
    heir_index: usize,
    fee_rate: u64,
) -> String {
    respond(build_claim_inner(
        vault_json,
        utxos_json,
        destination,
        heir_index,
        fee_rate,
    ))
}

fn build_claim_inner(
    vault_json: &str,
    utxos_json: &str,
    destination: &str,
    heir_index: usize,
    fee_rate: u64,
) -> Result<ClaimPsbt, CoreError> {
    let vault = VaultBackup::from_json(vault_json)?.verify()?;
    let inputs: Vec<ClaimInput> = serde_json::from_str(utxos_json).map_err(|e| {
        CoreError::new(
            CoreErrorKind::InvalidRequest,
            format!("Invalid UTXO list: {}", e),
        )
    })?;
    let destination = parse_address(destination, vault.network)?;

    let built = claim::build_claim_psbt(&vault, heir_index, &inputs, &destination, fee_rate)?;

    Ok(ClaimPsbt {
        psbt_base64: BASE64.encode(built.psbt.serialize()),
        total_input_sat: built.total_input_sat,
        fee_sat: built.fee_sat,
        output_sat: built.output_sat,
        destination: destination.to_string(),
        num_inputs: inputs.len(),
        fee_rate,
        vsize: built.vsize,
    })
}

/// Validate a signed PSBT and extract the finalized transaction.
pub fn finalize_psbt(psbt_base64: &str) -> String {
    respond::<FinalizedTx>(finalize::finalize_psbt(psbt_base64))
}

/// Decode a finalized transaction and report the txid it must broadcast as.
pub fn prepare_broadcast(tx_hex: &str, network: &str) -> String {
    respond::<PreparedBroadcast>(finalize::prepare_broadcast(tx_hex, network))
}
