//! End-to-end heir claim tests
//!
//! Drives the full workflow against the real Vault Core and an in-memory
//! chain source:
//!
//!   import backup → status (locked / eligible) → build claim PSBT
//!   → sign on the "device" → finalize → broadcast
//!
//! and verifies every input of the resulting transaction with
//! libbitcoinconsensus, so the claim is known to be spendable on-chain.

use async_trait::async_trait;
use bitcoin::consensus::encode::{deserialize_hex, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Network, OutPoint, Sequence, Transaction, TxOut, Txid};
use nostring_chain::{ChainSource, Error, TxStatus, Utxo};
use nostring_heir::{
    ChainSettings, ChainStatusProvider, ClaimError, ClaimRequest, ClaimState, ClaimWorkflow,
    NativeVaultCore, Stage, WorkflowError,
};
use nostring_vault_core::test_utils::{
    make_cascade_vault, make_test_vault, make_threshold_vault, sign_claim_psbt, TestVault,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEST: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

// ============================================================================
// In-memory chain
// ============================================================================

struct Chain {
    height: Mutex<u32>,
    utxos: Mutex<Vec<Utxo>>,
    reject_with: Mutex<Option<String>>,
    accepted: Mutex<Vec<Transaction>>,
    known: Mutex<HashSet<Txid>>,
}

impl Chain {
    fn new(height: u32, utxos: Vec<Utxo>) -> Arc<Self> {
        Arc::new(Self {
            height: Mutex::new(height),
            utxos: Mutex::new(utxos),
            reject_with: Mutex::new(None),
            accepted: Mutex::new(Vec::new()),
            known: Mutex::new(HashSet::new()),
        })
    }

    fn provider(self: &Arc<Self>) -> ChainStatusProvider {
        ChainStatusProvider::new(
            self.clone(),
            ChainSettings {
                timeout: Duration::from_secs(5),
                attempts: 1,
                backoff: Duration::from_millis(1),
            },
        )
    }
}

#[async_trait]
impl ChainSource for Chain {
    fn network(&self) -> Network {
        Network::Testnet
    }

    async fn tip_height(&self) -> Result<u32, Error> {
        Ok(*self.height.lock().unwrap())
    }

    async fn utxos(&self, _address: &Address) -> Result<Vec<Utxo>, Error> {
        Ok(self.utxos.lock().unwrap().clone())
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<Txid, Error> {
        let tx: Transaction = deserialize_hex(tx_hex)
            .map_err(|e| Error::Rejected(format!("TX decode failed: {}", e)))?;
        if let Some(reason) = self.reject_with.lock().unwrap().clone() {
            return Err(Error::Rejected(reason));
        }
        let txid = tx.compute_txid();
        self.known.lock().unwrap().insert(txid);
        self.accepted.lock().unwrap().push(tx);
        Ok(txid)
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus, Error> {
        Ok(if self.known.lock().unwrap().contains(txid) {
            TxStatus::Mempool
        } else {
            TxStatus::Unknown
        })
    }
}

fn utxo(n: u8, sats: u64, height: Option<u32>) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(Txid::from_byte_array([n; 32]), n as u32),
        value: Amount::from_sat(sats),
        confirmed: height.is_some(),
        height,
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Consensus-verify a transaction against its inputs using libbitcoinconsensus.
fn consensus_verify(tx_bytes: &[u8], spent_outputs: &[TxOut], input_index: usize) {
    let txout = &spent_outputs[input_index];

    let all_utxos: Vec<bitcoinconsensus::Utxo> = spent_outputs
        .iter()
        .map(|o| {
            let sb = o.script_pubkey.as_bytes();
            bitcoinconsensus::Utxo {
                script_pubkey: sb.as_ptr(),
                script_pubkey_len: sb.len() as u32,
                value: o.value.to_sat() as i64,
            }
        })
        .collect();

    let result = bitcoinconsensus::verify(
        txout.script_pubkey.as_bytes(),
        txout.value.to_sat(),
        tx_bytes,
        Some(&all_utxos),
        input_index,
    );

    assert!(
        result.is_ok(),
        "consensus verification failed for input {}: {:?}",
        input_index,
        result.err()
    );
}

fn workflow(chain: &Arc<Chain>) -> ClaimWorkflow {
    ClaimWorkflow::new(Arc::new(NativeVaultCore), chain.provider(), 500)
}

fn request(heir_index: usize, fee_rate: u64) -> ClaimRequest {
    ClaimRequest {
        destination: DEST.to_string(),
        heir_index,
        fee_rate,
    }
}

/// Import, check status and build; returns the unsigned PSBT.
async fn build_to_signature(
    wf: &mut ClaimWorkflow,
    vault: &TestVault,
    claim: ClaimRequest,
) -> String {
    wf.import(&vault.backup_json()).unwrap();
    assert!(wf.check_status().await.unwrap().eligible);
    wf.build_claim(claim).unwrap().psbt_base64.clone()
}

fn verify_accepted(chain: &Chain, vault: &TestVault) -> Transaction {
    let accepted = chain.accepted.lock().unwrap();
    assert_eq!(accepted.len(), 1);
    let tx = accepted[0].clone();

    let spent: Vec<TxOut> = tx
        .input
        .iter()
        .map(|input| {
            let u = chain
                .utxos
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.outpoint == input.previous_output)
                .cloned()
                .unwrap();
            TxOut {
                value: u.value,
                script_pubkey: vault.script_pubkey(),
            }
        })
        .collect();

    let bytes = serialize(&tx);
    for i in 0..tx.input.len() {
        consensus_verify(&bytes, &spent, i);
    }
    tx
}

// ============================================================================
// Full flows
// ============================================================================

#[tokio::test]
async fn test_single_heir_claim_is_consensus_valid() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(
        800_200,
        vec![
            utxo(1, 60_000, Some(800_000)),
            utxo(2, 40_000, Some(800_050)),
            utxo(3, 1_000_000, None),
        ],
    );
    let mut wf = workflow(&chain);

    let psbt = build_to_signature(&mut wf, &vault, request(0, 3)).await;
    let unsigned = wf.session().unsigned.clone().unwrap();
    assert_eq!(unsigned.num_inputs, 2);
    assert_eq!(unsigned.total_input_sat, 100_000);
    assert_eq!(unsigned.total_input_sat, unsigned.output_sat + unsigned.fee_sat);

    let signed = sign_claim_psbt(&psbt, &[&vault.heirs[0]]);
    wf.finalize(&signed).unwrap();
    let receipt = wf.broadcast().await.unwrap();
    assert!(receipt.success);
    assert_eq!(wf.state(), &ClaimState::Complete);

    let tx = verify_accepted(&chain, &vault);
    assert_eq!(tx.compute_txid(), receipt.txid);
    assert_eq!(tx.output.len(), 1);
    assert_eq!(tx.output[0].value.to_sat(), unsigned.output_sat);
    assert!(tx.input.iter().all(|i| i.sequence == Sequence::from_height(144)));

    // Fee estimate never undershoots the real size
    assert!(tx.vsize() as u64 <= unsigned.vsize);
}

#[tokio::test]
async fn test_threshold_claim_needs_two_signatures() {
    let vault = make_threshold_vault(Network::Testnet, 1_000, 2, 3);
    let chain = Chain::new(801_000, vec![utxo(1, 250_000, Some(800_000))]);

    // One signature is not enough
    let mut wf = workflow(&chain);
    let psbt = build_to_signature(&mut wf, &vault, request(1, 2)).await;
    let signed = sign_claim_psbt(&psbt, &[&vault.heirs[1]]);
    let err = wf.finalize(&signed).unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::Claim {
            stage: Stage::Finalize,
            source: ClaimError::IncompleteSignatures(_)
        }
    ));

    // Two of three is
    let mut wf = workflow(&chain);
    let psbt = build_to_signature(&mut wf, &vault, request(1, 2)).await;
    let signed = sign_claim_psbt(&psbt, &[&vault.heirs[0], &vault.heirs[2]]);
    wf.finalize(&signed).unwrap();
    wf.broadcast().await.unwrap();

    verify_accepted(&chain, &vault);
}

#[tokio::test]
async fn test_cascade_second_heir_claims_own_leaf() {
    let vault = make_cascade_vault(Network::Testnet, 100, 200);
    let chain = Chain::new(800_200, vec![utxo(1, 90_000, Some(800_000))]);
    let mut wf = workflow(&chain);

    // Eligibility follows the vault's earliest timelock; Bob's leaf has its own CSV
    let psbt = build_to_signature(&mut wf, &vault, request(1, 2)).await;
    let signed = sign_claim_psbt(&psbt, &[&vault.heirs[1]]);
    wf.finalize(&signed).unwrap();
    wf.broadcast().await.unwrap();

    let tx = verify_accepted(&chain, &vault);
    assert_eq!(tx.input[0].sequence, Sequence::from_height(200));
}

// ============================================================================
// Eligibility
// ============================================================================

#[tokio::test]
async fn test_locked_then_eligible() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_143, vec![utxo(1, 50_000, Some(800_000))]);
    let mut wf = workflow(&chain);
    wf.import(&vault.backup_json()).unwrap();

    let result = wf.check_status().await.unwrap();
    assert!(!result.eligible);
    assert_eq!(result.blocks_remaining, 1);
    assert_eq!(result.time_estimate.to_string(), "~10 minutes");
    assert!(wf.build_claim(request(0, 2)).is_err());
    assert_eq!(wf.state(), &ClaimState::Locked);

    *chain.height.lock().unwrap() = 800_144;
    assert!(wf.check_status().await.unwrap().eligible);
    assert_eq!(wf.state(), &ClaimState::Eligible);
}

#[tokio::test]
async fn test_unfunded_vault() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![]);
    let mut wf = workflow(&chain);
    wf.import(&vault.backup_json()).unwrap();

    let err = wf.check_status().await.unwrap_err();
    assert_eq!(err.claim_error(), Some(&ClaimError::VaultNotFunded));
}

#[test]
fn test_missing_timelock_is_malformed() {
    let vault = make_test_vault(Network::Testnet, 144);
    let mut value: serde_json::Value = serde_json::from_str(&vault.backup_json()).unwrap();
    value.as_object_mut().unwrap().remove("timelock_blocks");

    let chain = Chain::new(800_200, vec![]);
    let mut wf = workflow(&chain);
    let err = wf.import(&value.to_string()).unwrap_err();
    assert!(matches!(
        err.claim_error(),
        Some(ClaimError::MalformedDescriptor(_))
    ));
}

// ============================================================================
// Broadcast
// ============================================================================

#[tokio::test]
async fn test_rebroadcast_is_idempotent() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![utxo(1, 50_000, Some(800_000))]);
    let mut wf = workflow(&chain);

    let psbt = build_to_signature(&mut wf, &vault, request(0, 2)).await;
    wf.finalize(&sign_claim_psbt(&psbt, &[&vault.heirs[0]]))
        .unwrap();

    let first = wf.broadcast().await.unwrap();
    let second = wf.broadcast().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(chain.accepted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_already_in_mempool_counts_as_success() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![utxo(1, 50_000, Some(800_000))]);
    *chain.reject_with.lock().unwrap() = Some("txn-already-in-mempool".to_string());
    let mut wf = workflow(&chain);

    let psbt = build_to_signature(&mut wf, &vault, request(0, 2)).await;
    wf.finalize(&sign_claim_psbt(&psbt, &[&vault.heirs[0]]))
        .unwrap();

    let receipt = wf.broadcast().await.unwrap();
    assert!(receipt.success);
    assert!(receipt.already_known);
    assert_eq!(wf.state(), &ClaimState::Complete);
}

#[tokio::test]
async fn test_rejection_surfaced_verbatim() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![utxo(1, 50_000, Some(800_000))]);
    let reason = "sendrawtransaction RPC error: {\"code\":-26,\"message\":\"non-BIP68-final\"}";
    *chain.reject_with.lock().unwrap() = Some(reason.to_string());
    let mut wf = workflow(&chain);

    let psbt = build_to_signature(&mut wf, &vault, request(0, 2)).await;
    wf.finalize(&sign_claim_psbt(&psbt, &[&vault.heirs[0]]))
        .unwrap();

    let err = wf.broadcast().await.unwrap_err();
    assert_eq!(
        err.claim_error(),
        Some(&ClaimError::BroadcastRejected {
            reason: reason.to_string()
        })
    );
    assert!(matches!(
        wf.state(),
        ClaimState::Failed {
            stage: Stage::Broadcast,
            ..
        }
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn test_stale_status_after_reset() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![utxo(1, 50_000, Some(800_000))]);
    let provider = chain.provider();
    let mut wf = workflow(&chain);
    wf.import(&vault.backup_json()).unwrap();

    let ticket = wf.begin_status_check().unwrap();
    assert_eq!(
        wf.begin_status_check().unwrap_err(),
        WorkflowError::StageInFlight(Stage::Status)
    );

    let snapshot = provider.fetch(Network::Testnet, &vault.address).await;
    wf.reset();

    assert_eq!(
        wf.complete_status_check(ticket, snapshot).unwrap_err(),
        WorkflowError::Superseded
    );
    assert_eq!(wf.state(), &ClaimState::Importing);
    assert!(wf.session().snapshot.is_none());
}

#[tokio::test]
async fn test_dropped_status_check_leaves_session_untouched() {
    let vault = make_test_vault(Network::Testnet, 144);
    let chain = Chain::new(800_200, vec![utxo(1, 50_000, Some(800_000))]);
    let mut wf = workflow(&chain);
    wf.import(&vault.backup_json()).unwrap();
    let before = wf.session().clone();

    {
        let check = wf.check_status();
        // Dropped before it is ever polled
        drop(check);
    }

    assert_eq!(wf.session(), &before);
    assert!(wf.check_status().await.unwrap().eligible);
}
