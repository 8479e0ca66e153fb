//! Finalize & broadcast coordinator.
//!
//! Finalization is Vault Core's job; this module checks that the signed
//! transaction is the claim that was built, then submits it. Submitting the
//! same transaction twice is one logical operation: receipts are cached per
//! txid and "already known" answers from the network count as acceptance.

use bitcoin::{Network, Txid};
use nostring_chain::ChainSource;
use nostring_vault_core::finalize::{FinalizedTx, PreparedBroadcast};
use nostring_vault_core::{network_name, CoreErrorKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::builder::UnsignedClaim;
use crate::error::ClaimError;
use crate::vault_core::{decode, VaultCore};

/// A claim after external signing and finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizedClaim {
    pub txid: Txid,
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub tx_hex: String,
    pub total_output_sat: u64,
}

/// Result of network submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReceipt {
    pub txid: Txid,
    pub success: bool,
    /// The network already had this transaction
    pub already_known: bool,
}

/// Rejection texts that mean the network already has the transaction.
const ALREADY_KNOWN: &[&str] = &[
    "txn-already-in-mempool",
    "txn-already-known",
    "already in block chain",
    "transaction already in block chain",
];

fn is_already_known(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ALREADY_KNOWN.iter().any(|m| lower.contains(m))
}

/// Finalize a signed PSBT and check it against the claim that was built.
pub fn finalize(
    core: &dyn VaultCore,
    signed_payload: &str,
    unsigned: &UnsignedClaim,
) -> Result<FinalizedClaim, ClaimError> {
    let tx: FinalizedTx = decode(&core.finalize_psbt(signed_payload))
        .map_err(ClaimError::MalformedSignedPayload)?
        .map_err(|e| match e.kind {
            CoreErrorKind::IncompleteSignatures => ClaimError::IncompleteSignatures(e.reason),
            _ => ClaimError::MalformedSignedPayload(e.reason),
        })?;

    if tx.num_inputs != unsigned.num_inputs {
        return Err(ClaimError::MalformedSignedPayload(format!(
            "signed transaction has {} inputs, claim has {}",
            tx.num_inputs, unsigned.num_inputs
        )));
    }
    if tx.total_output_sat != unsigned.output_sat {
        return Err(ClaimError::MalformedSignedPayload(format!(
            "signed transaction pays {} sat, claim pays {} sat",
            tx.total_output_sat, unsigned.output_sat
        )));
    }

    log::info!("finalized claim {}", tx.txid);
    Ok(FinalizedClaim {
        txid: tx.txid,
        num_inputs: tx.num_inputs,
        num_outputs: tx.num_outputs,
        tx_hex: tx.tx_hex,
        total_output_sat: tx.total_output_sat,
    })
}

/// Submits finalized claims, at most once per txid.
#[derive(Clone)]
pub struct BroadcastCoordinator {
    source: Arc<dyn ChainSource>,
    timeout: Duration,
    receipts: Arc<Mutex<HashMap<Txid, BroadcastReceipt>>>,
}

impl BroadcastCoordinator {
    pub fn new(source: Arc<dyn ChainSource>, timeout: Duration) -> Self {
        Self {
            source,
            timeout,
            receipts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Receipt from an earlier accepted broadcast of `txid`.
    pub fn receipt(&self, txid: &Txid) -> Option<BroadcastReceipt> {
        self.receipts().get(txid).cloned()
    }

    /// The receipt cache. Entries are inserted whole, so a poisoned lock
    /// still guards a consistent map.
    fn receipts(&self) -> MutexGuard<'_, HashMap<Txid, BroadcastReceipt>> {
        self.receipts.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            log::warn!("receipt cache lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Submit `claim` to `network`.
    pub async fn broadcast(
        &self,
        core: &dyn VaultCore,
        network: Network,
        claim: &FinalizedClaim,
    ) -> Result<BroadcastReceipt, ClaimError> {
        if let Some(receipt) = self.receipt(&claim.txid) {
            log::debug!("{} already broadcast, returning cached receipt", claim.txid);
            return Ok(receipt);
        }

        if self.source.network() != network {
            return Err(ClaimError::ConfigurationError(format!(
                "chain source serves {}, claim is for {}",
                self.source.network(),
                network
            )));
        }

        let prepared: PreparedBroadcast =
            decode(&core.prepare_broadcast(&claim.tx_hex, network_name(network)))
                .map_err(ClaimError::MalformedSignedPayload)?
                .map_err(|e| match e.kind {
                    CoreErrorKind::IncompleteSignatures => {
                        ClaimError::IncompleteSignatures(e.reason)
                    }
                    _ => ClaimError::MalformedSignedPayload(e.reason),
                })?;
        if prepared.txid != claim.txid {
            return Err(ClaimError::MalformedSignedPayload(format!(
                "transaction hex decodes to {}, expected {}",
                prepared.txid, claim.txid
            )));
        }

        let submitted = tokio::time::timeout(self.timeout, self.source.broadcast(&claim.tx_hex))
            .await
            .map_err(|_| ClaimError::BroadcastRejected {
                reason: format!("no answer from chain service within {:?}", self.timeout),
            })?;

        let receipt = match submitted {
            Ok(txid) if txid == claim.txid => BroadcastReceipt {
                txid,
                success: true,
                already_known: false,
            },
            Ok(txid) => {
                return Err(ClaimError::BroadcastRejected {
                    reason: format!("network reported txid {}, expected {}", txid, claim.txid),
                });
            }
            Err(e) => self.reconcile(claim.txid, e.to_string()).await?,
        };

        log::info!(
            "broadcast {} accepted{} ({} vB)",
            receipt.txid,
            if receipt.already_known { " (already known)" } else { "" },
            prepared.vsize
        );
        self.receipts().insert(receipt.txid, receipt.clone());
        Ok(receipt)
    }

    /// Decide whether a failed submission actually left the tx on the network.
    async fn reconcile(&self, txid: Txid, message: String) -> Result<BroadcastReceipt, ClaimError> {
        let known = BroadcastReceipt {
            txid,
            success: true,
            already_known: true,
        };
        if is_already_known(&message) {
            return Ok(known);
        }

        match tokio::time::timeout(self.timeout, self.source.tx_status(&txid)).await {
            Ok(Ok(status)) if status.is_known() => {
                log::warn!("broadcast of {} reported '{}' but the tx is known", txid, message);
                Ok(known)
            }
            _ => Err(ClaimError::BroadcastRejected { reason: message }),
        }
    }
}
