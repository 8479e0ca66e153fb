//! Claim transaction builder.
//!
//! Vault Core assembles the PSBT; this module checks the request before the
//! call and the accounting after it. A result that does not add up is never
//! handed to the heir for signing.

use bitcoin::address::NetworkUnchecked;
use bitcoin::Address;
use nostring_vault_core::api::ClaimPsbt;
use nostring_vault_core::claim::ClaimInput;
use nostring_vault_core::{CoreError, CoreErrorKind};
use serde::{Deserialize, Serialize};

use crate::aggregate::SpendableSet;
use crate::descriptor::VaultDescriptor;
use crate::error::ClaimError;
use crate::vault_core::{decode, VaultCore};

/// A caller's intent to build a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub destination: String,
    pub heir_index: usize,
    /// sat/vB
    pub fee_rate: u64,
}

/// A built claim awaiting the heir's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsignedClaim {
    pub num_inputs: usize,
    pub total_input_sat: u64,
    pub fee_sat: u64,
    pub output_sat: u64,
    pub destination: String,
    /// Base64 PSBT, opaque to the orchestrator
    pub psbt_base64: String,
    pub fee_rate: u64,
    pub vsize: u64,
}

/// Build an unsigned claim spending all of `spendable`.
pub fn build(
    core: &dyn VaultCore,
    descriptor: &VaultDescriptor,
    spendable: &SpendableSet,
    request: &ClaimRequest,
    max_fee_rate: u64,
) -> Result<UnsignedClaim, ClaimError> {
    if request.fee_rate == 0 || request.fee_rate > max_fee_rate {
        return Err(ClaimError::InvalidClaimRequest(format!(
            "fee rate {} sat/vB is outside 1..={} sat/vB",
            request.fee_rate, max_fee_rate
        )));
    }
    if request.heir_index >= descriptor.heir_count {
        return Err(ClaimError::InvalidClaimRequest(format!(
            "heir index {} out of range ({} heirs)",
            request.heir_index, descriptor.heir_count
        )));
    }

    let destination = check_destination(core, descriptor, &request.destination)?;

    if spendable.is_empty() {
        return Err(ClaimError::NoSpendableFunds);
    }

    let inputs: Vec<ClaimInput> = spendable
        .utxos
        .iter()
        .map(|u| ClaimInput {
            txid: u.outpoint.txid,
            vout: u.outpoint.vout,
            value_sat: u.value.to_sat(),
        })
        .collect();
    let utxos_json = serde_json::to_string(&inputs)
        .map_err(|e| ClaimError::InvalidClaimRequest(format!("cannot encode inputs: {}", e)))?;

    let response = core.build_claim_psbt(
        descriptor.raw_payload(),
        &utxos_json,
        &request.destination,
        request.heir_index,
        request.fee_rate,
    );
    let built: ClaimPsbt = decode(&response)
        .map_err(mismatch)?
        .map_err(map_build_error)?;

    verify_accounting(&built, spendable, &destination)?;

    log::info!(
        "built claim: {} inputs, {} sat in, {} sat fee, {} sat to {}",
        built.num_inputs,
        built.total_input_sat,
        built.fee_sat,
        built.output_sat,
        built.destination
    );

    Ok(UnsignedClaim {
        num_inputs: built.num_inputs,
        total_input_sat: built.total_input_sat,
        fee_sat: built.fee_sat,
        output_sat: built.output_sat,
        destination: built.destination,
        psbt_base64: built.psbt_base64,
        fee_rate: built.fee_rate,
        vsize: built.vsize,
    })
}

fn check_destination(
    core: &dyn VaultCore,
    descriptor: &VaultDescriptor,
    destination: &str,
) -> Result<Address<NetworkUnchecked>, ClaimError> {
    let valid: bool = decode(&core.validate_address(destination, descriptor.network_name()))
        .map_err(ClaimError::InvalidDestinationAddress)?
        .map_err(|e| ClaimError::InvalidDestinationAddress(e.reason))?;
    if !valid {
        return Err(ClaimError::InvalidDestinationAddress(format!(
            "{} is not a {} address",
            destination, descriptor.network
        )));
    }
    destination
        .trim()
        .parse()
        .map_err(|e| ClaimError::InvalidDestinationAddress(format!("{}: {}", destination, e)))
}

fn map_build_error(e: CoreError) -> ClaimError {
    match e.kind {
        CoreErrorKind::InsufficientFunds => ClaimError::InsufficientFunds(e.reason),
        CoreErrorKind::InvalidAddress => ClaimError::InvalidDestinationAddress(e.reason),
        CoreErrorKind::InvalidRequest => ClaimError::InvalidClaimRequest(e.reason),
        CoreErrorKind::InvalidBackup
        | CoreErrorKind::UnsupportedVersion
        | CoreErrorKind::VerificationFailed
        | CoreErrorKind::UnknownNetwork => ClaimError::DescriptorValidationFailed { reason: e.reason },
        CoreErrorKind::MalformedPsbt | CoreErrorKind::IncompleteSignatures => {
            mismatch(format!("unexpected Vault Core error: {}", e))
        }
    }
}

fn mismatch(reason: String) -> ClaimError {
    log::error!("claim accounting invariant violated: {}", reason);
    ClaimError::AccountingMismatch(reason)
}

/// Conservation checks on what Vault Core built.
fn verify_accounting(
    built: &ClaimPsbt,
    spendable: &SpendableSet,
    destination: &Address<NetworkUnchecked>,
) -> Result<(), ClaimError> {
    let paid = built.output_sat.checked_add(built.fee_sat);
    if paid != Some(built.total_input_sat) {
        return Err(mismatch(format!(
            "inputs {} sat != output {} sat + fee {} sat",
            built.total_input_sat, built.output_sat, built.fee_sat
        )));
    }
    if built.total_input_sat != spendable.total.to_sat() {
        return Err(mismatch(format!(
            "claim spends {} sat but {} sat are spendable",
            built.total_input_sat,
            spendable.total.to_sat()
        )));
    }
    if built.num_inputs != spendable.len() {
        return Err(mismatch(format!(
            "claim has {} inputs for {} spendable outputs",
            built.num_inputs,
            spendable.len()
        )));
    }
    let paid_to: Option<Address<NetworkUnchecked>> = built.destination.parse().ok();
    if paid_to.as_ref() != Some(destination) {
        return Err(mismatch(format!(
            "claim pays {} instead of the requested destination",
            built.destination
        )));
    }
    Ok(())
}
