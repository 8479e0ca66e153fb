//! Seam to the Vault Core.
//!
//! The orchestrator only talks to Vault Core through its text boundary:
//! JSON strings in, `{success, data, error}` envelopes out. The trait lets
//! tests substitute a misbehaving core.

use nostring_vault_core::api::{self, CoreResponse};
use nostring_vault_core::CoreError;
use serde::de::DeserializeOwned;

/// Vault Core function set, as text.
pub trait VaultCore: Send + Sync {
    fn import_vault_backup(&self, json: &str) -> String;

    fn validate_address(&self, address: &str, network: &str) -> String;

    fn check_eligibility(&self, vault_json: &str, current_height: u64, confirmation_height: u64)
        -> String;

    fn build_claim_psbt(
        &self,
        vault_json: &str,
        utxos_json: &str,
        destination: &str,
        heir_index: usize,
        fee_rate: u64,
    ) -> String;

    fn finalize_psbt(&self, psbt_base64: &str) -> String;

    fn prepare_broadcast(&self, tx_hex: &str, network: &str) -> String;
}

/// The in-process Vault Core from `nostring-vault-core`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeVaultCore;

impl VaultCore for NativeVaultCore {
    fn import_vault_backup(&self, json: &str) -> String {
        api::import_vault_backup(json)
    }

    fn validate_address(&self, address: &str, network: &str) -> String {
        api::validate_address(address, network)
    }

    fn check_eligibility(
        &self,
        vault_json: &str,
        current_height: u64,
        confirmation_height: u64,
    ) -> String {
        api::check_eligibility(vault_json, current_height, confirmation_height)
    }

    fn build_claim_psbt(
        &self,
        vault_json: &str,
        utxos_json: &str,
        destination: &str,
        heir_index: usize,
        fee_rate: u64,
    ) -> String {
        api::build_claim_psbt(vault_json, utxos_json, destination, heir_index, fee_rate)
    }

    fn finalize_psbt(&self, psbt_base64: &str) -> String {
        api::finalize_psbt(psbt_base64)
    }

    fn prepare_broadcast(&self, tx_hex: &str, network: &str) -> String {
        api::prepare_broadcast(tx_hex, network)
    }
}

/// Decode a Vault Core response.
///
/// The outer `Err` means the response itself was unreadable; the inner
/// result is what Vault Core reported.
pub(crate) fn decode<T: DeserializeOwned>(response: &str) -> Result<Result<T, CoreError>, String> {
    let envelope = CoreResponse::<T>::from_json(response)
        .map_err(|e| format!("unreadable Vault Core response: {}", e))?;
    Ok(envelope.into_result())
}
