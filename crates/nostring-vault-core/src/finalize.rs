//! Finalization of externally signed claim PSBTs.
//!
//! Signing happens on the heir's own device. This module only assembles the
//! witnesses from the signatures it finds and extracts the transaction.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::consensus::encode;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Transaction, Txid};
use miniscript::psbt::PsbtExt;
use serde::{Deserialize, Serialize};

use crate::{network_name, parse_network, CoreError, CoreErrorKind};

/// A fully signed transaction ready to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalizedTx {
    pub tx_hex: String,
    pub txid: Txid,
    pub total_output_sat: u64,
    pub num_inputs: usize,
    pub num_outputs: usize,
}

/// A decoded transaction checked for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreparedBroadcast {
    /// The txid the network must report back on acceptance
    pub txid: Txid,
    pub network: String,
    pub vsize: u64,
    pub num_inputs: usize,
}

fn has_signatures(input: &Input) -> bool {
    input.final_script_witness.is_some()
        || input.final_script_sig.is_some()
        || input.tap_key_sig.is_some()
        || !input.tap_script_sigs.is_empty()
        || !input.partial_sigs.is_empty()
}

fn is_finalized(input: &Input) -> bool {
    input.final_script_witness.is_some() || input.final_script_sig.is_some()
}

/// Validate a signed PSBT and extract the finalized transaction.
///
/// Inputs that are already finalized are kept as they are; the rest are
/// finalized from their signatures.
pub fn finalize_psbt(psbt_base64: &str) -> Result<FinalizedTx, CoreError> {
    let bytes = BASE64.decode(psbt_base64.trim()).map_err(|e| {
        CoreError::new(CoreErrorKind::MalformedPsbt, format!("Invalid base64: {}", e))
    })?;
    let mut psbt = Psbt::deserialize(&bytes).map_err(|e| {
        CoreError::new(CoreErrorKind::MalformedPsbt, format!("Invalid PSBT: {}", e))
    })?;

    let total_inputs = psbt.inputs.len();
    if total_inputs == 0 {
        return Err(CoreError::new(
            CoreErrorKind::MalformedPsbt,
            "PSBT has no inputs",
        ));
    }

    let signed_count = psbt.inputs.iter().filter(|i| has_signatures(i)).count();
    if signed_count == 0 {
        return Err(CoreError::new(
            CoreErrorKind::IncompleteSignatures,
            format!(
                "This PSBT has not been signed yet. \
                 Please sign it with your wallet before importing it here. \
                 ({} input(s) need signing.)",
                total_inputs
            ),
        ));
    }
    if signed_count < total_inputs {
        return Err(CoreError::new(
            CoreErrorKind::IncompleteSignatures,
            format!(
                "This PSBT is only partially signed: {} of {} inputs have signatures. \
                 All inputs must be signed before broadcasting.",
                signed_count, total_inputs
            ),
        ));
    }

    let secp = Secp256k1::verification_only();
    for index in 0..total_inputs {
        if is_finalized(&psbt.inputs[index]) {
            continue;
        }
        psbt.finalize_inp_mut(&secp, index).map_err(|e| {
            CoreError::new(
                CoreErrorKind::IncompleteSignatures,
                format!("input {} cannot be finalized: {}", index, e),
            )
        })?;
    }

    let tx = psbt.extract_tx().map_err(|e| {
        CoreError::new(
            CoreErrorKind::MalformedPsbt,
            format!("could not extract transaction: {}", e),
        )
    })?;

    let total_output_sat = tx
        .output
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
        .ok_or_else(|| CoreError::new(CoreErrorKind::MalformedPsbt, "output total overflows"))?;

    Ok(FinalizedTx {
        tx_hex: encode::serialize_hex(&tx),
        txid: tx.compute_txid(),
        total_output_sat,
        num_inputs: tx.input.len(),
        num_outputs: tx.output.len(),
    })
}

/// Decode a finalized transaction and check it is ready for `network`.
pub fn prepare_broadcast(tx_hex: &str, network: &str) -> Result<PreparedBroadcast, CoreError> {
    let network = parse_network(network)?;
    let bytes = hex::decode(tx_hex.trim()).map_err(|e| {
        CoreError::new(CoreErrorKind::MalformedPsbt, format!("Invalid hex: {}", e))
    })?;
    let tx: Transaction = encode::deserialize(&bytes).map_err(|e| {
        CoreError::new(
            CoreErrorKind::MalformedPsbt,
            format!("Invalid transaction: {}", e),
        )
    })?;

    if let Some(index) = tx.input.iter().position(|i| i.witness.is_empty()) {
        return Err(CoreError::new(
            CoreErrorKind::IncompleteSignatures,
            format!("input {} has no witness", index),
        ));
    }

    Ok(PreparedBroadcast {
        txid: tx.compute_txid(),
        network: network_name(network).to_string(),
        vsize: tx.vsize() as u64,
        num_inputs: tx.input.len(),
    })
}
