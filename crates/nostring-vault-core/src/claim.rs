//! Heir claim PSBT construction.
//!
//! The claim spends every provided vault output through the heir's recovery
//! leaf to a single destination. Inputs carry everything a signing device
//! needs to produce a script-path signature without seeing the backup.

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::taproot::LeafVersion;
use bitcoin::transaction::{Transaction, TxIn, TxOut, Version};
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Txid, Witness};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::backup::{VerifiedLeaf, VerifiedVault};
use crate::{CoreError, CoreErrorKind, DUST_LIMIT_SAT, MAX_FEE_RATE_SAT_VB};

/// A vault output the heir wants to spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimInput {
    pub txid: Txid,
    pub vout: u32,
    pub value_sat: u64,
}

impl ClaimInput {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// An unsigned claim and its accounting.
#[derive(Debug, Clone)]
pub struct BuiltClaim {
    pub psbt: Psbt,
    pub total_input_sat: u64,
    pub fee_sat: u64,
    pub output_sat: u64,
    pub vsize: u64,
}

/// Build an unsigned claim PSBT for `heir_index`.
///
/// Fee is `estimate_claim_vbytes(..) * fee_rate`; everything else goes to
/// `destination`.
pub fn build_claim_psbt(
    vault: &VerifiedVault,
    heir_index: usize,
    inputs: &[ClaimInput],
    destination: &Address,
    fee_rate: u64,
) -> Result<BuiltClaim, CoreError> {
    if fee_rate == 0 || fee_rate > MAX_FEE_RATE_SAT_VB {
        return Err(CoreError::new(
            CoreErrorKind::InvalidRequest,
            format!(
                "fee rate {} sat/vB is outside 1..={} sat/vB",
                fee_rate, MAX_FEE_RATE_SAT_VB
            ),
        ));
    }
    if inputs.is_empty() {
        return Err(CoreError::new(
            CoreErrorKind::InvalidRequest,
            "no UTXOs provided",
        ));
    }

    let heir = vault.heirs.get(heir_index).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::InvalidRequest,
            format!(
                "heir index {} out of bounds ({} heirs)",
                heir_index,
                vault.heirs.len()
            ),
        )
    })?;
    let leaf = vault.leaves.get(heir.recovery_index).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::InvalidRequest,
            format!("recovery index {} out of bounds", heir.recovery_index),
        )
    })?;

    let mut seen = HashSet::new();
    for input in inputs {
        if !seen.insert(input.outpoint()) {
            return Err(CoreError::new(
                CoreErrorKind::InvalidRequest,
                format!("duplicate input {}", input.outpoint()),
            ));
        }
    }

    let total_in = inputs
        .iter()
        .try_fold(0u64, |acc, i| acc.checked_add(i.value_sat))
        .ok_or_else(|| CoreError::new(CoreErrorKind::InvalidRequest, "input total overflows"))?;

    let destination_spk = destination.script_pubkey();
    let signatures = vault.threshold.min(leaf.keys.len()).max(1);
    let vsize = estimate_claim_vbytes(inputs.len(), leaf, signatures, destination_spk.len());
    let fee = vsize
        .checked_mul(fee_rate)
        .ok_or_else(|| CoreError::new(CoreErrorKind::InvalidRequest, "fee overflows"))?;

    let output = total_in.checked_sub(fee).filter(|v| *v > 0).ok_or_else(|| {
        CoreError::new(
            CoreErrorKind::InsufficientFunds,
            format!("fee {} sat exceeds total input value {} sat", fee, total_in),
        )
    })?;
    if output < DUST_LIMIT_SAT {
        return Err(CoreError::new(
            CoreErrorKind::InsufficientFunds,
            format!(
                "output {} sat is below dust limit ({} sat)",
                output, DUST_LIMIT_SAT
            ),
        ));
    }

    // CSV on every input; nLockTime stays zero
    let tx_inputs: Vec<TxIn> = inputs
        .iter()
        .map(|i| TxIn {
            previous_output: i.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(leaf.timelock_blocks),
            witness: Witness::new(),
        })
        .collect();

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: tx_inputs,
        output: vec![TxOut {
            value: Amount::from_sat(output),
            script_pubkey: destination_spk,
        }],
    };

    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| {
        CoreError::new(
            CoreErrorKind::InvalidRequest,
            format!("PSBT creation failed: {}", e),
        )
    })?;

    let vault_spk = vault.address.script_pubkey();
    let leaf_hash = leaf.leaf_hash();
    for (psbt_input, input) in psbt.inputs.iter_mut().zip(inputs) {
        psbt_input.witness_utxo = Some(TxOut {
            value: Amount::from_sat(input.value_sat),
            script_pubkey: vault_spk.clone(),
        });
        psbt_input.tap_scripts.insert(
            leaf.control_block.clone(),
            (leaf.script.clone(), LeafVersion::TapScript),
        );
        psbt_input.tap_internal_key = Some(vault.internal_key);
        psbt_input.tap_merkle_root = Some(leaf.merkle_root);

        // Key origins let hardware signers recognise their key in the leaf
        for h in vault.heirs.iter().filter(|h| leaf.keys.contains(&h.key)) {
            if let Some(origin) = &h.origin {
                psbt_input
                    .tap_key_origins
                    .insert(h.key, (vec![leaf_hash], origin.clone()));
            }
        }
    }

    log::debug!(
        "built claim: {} inputs, {} sat in, fee {} sat ({} vB @ {} sat/vB)",
        inputs.len(),
        total_in,
        fee,
        vsize,
        fee_rate
    );

    Ok(BuiltClaim {
        psbt,
        total_input_sat: total_in,
        fee_sat: fee,
        output_sat: output,
        vsize,
    })
}

/// Estimate vbytes for a script-path claim through `leaf`.
///
/// `signatures` is how many signature slots the satisfaction fills; the
/// remaining keys of a `multi_a` leaf contribute an empty push each.
pub fn estimate_claim_vbytes(
    num_inputs: usize,
    leaf: &VerifiedLeaf,
    signatures: usize,
    destination_script_len: usize,
) -> u64 {
    // Weight units per input (script-path):
    //   Base: (36+1+4)*4 = 164 WU
    //   Witness: items_count + sigs + script + control_block(33+32*depth)
    let key_slots = leaf.keys.len().max(signatures);
    let script_len = leaf.script.len();
    let control_block_len = 33 + 32 * leaf.depth();
    let witness_items = key_slots + 2;

    let witness_wu = varint_len(witness_items)
        + signatures * 65
        + (key_slots - signatures)
        + varint_len(script_len)
        + script_len
        + varint_len(control_block_len)
        + control_block_len;

    let overhead_wu = 42;
    let input_wu = 164 + witness_wu;
    let output_wu = 4 * (8 + varint_len(destination_script_len) + destination_script_len);
    let total_wu = overhead_wu + num_inputs * input_wu + output_wu;
    (total_wu.div_ceil(4) + 1) as u64
}

fn varint_len(n: usize) -> usize {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        _ => 5,
    }
}
