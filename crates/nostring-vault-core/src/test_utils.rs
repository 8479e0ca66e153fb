//! Shared test utilities for nostring-vault-core and its dependents.
//!
//! Builds deterministic vaults with real recovery leaves, and signs claim
//! PSBTs the way an external signing device would.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{self, LeafVersion, TapLeafHash, TaprootBuilder};
use bitcoin::{Address, Network, ScriptBuf, TxOut, Txid};
use miniscript::{Miniscript, Tap};
use std::str::FromStr;

use crate::backup::{recovery_script, HeirBackupEntry, RecoveryLeaf, VaultBackup};
use crate::ccd::KeyMaterial;
use crate::claim::ClaimInput;
use crate::network_name;

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// An heir with its private key, for signing in tests.
#[derive(Debug, Clone)]
pub struct TestHeir {
    pub label: String,
    pub xpriv: Xpriv,
    pub xpub: Xpub,
}

impl TestHeir {
    pub fn new(label: &str, seed_byte: u8, network: Network) -> Self {
        let secp = Secp256k1::new();
        let xpriv = Xpriv::new_master(network, &[seed_byte; 32]).unwrap();
        let xpub = Xpub::from_priv(&secp, &xpriv);
        Self {
            label: label.to_string(),
            xpriv,
            xpub,
        }
    }

    pub fn xonly(&self) -> XOnlyPublicKey {
        self.xpub.public_key.x_only_public_key().0
    }

    pub fn keypair(&self) -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_secret_key(&secp, &self.xpriv.private_key)
    }

    fn backup_entry(&self, recovery_index: usize) -> HeirBackupEntry {
        HeirBackupEntry {
            label: self.label.clone(),
            xpub: self.xpub.to_string(),
            fingerprint: self.xpub.fingerprint().to_string(),
            derivation_path: "m/86'/1'/0'".to_string(),
            recovery_index,
            npub: None,
        }
    }
}

/// A vault backup together with the heirs that can claim it.
#[derive(Debug, Clone)]
pub struct TestVault {
    pub backup: VaultBackup,
    pub heirs: Vec<TestHeir>,
    pub address: Address,
}

impl TestVault {
    pub fn backup_json(&self) -> String {
        serde_json::to_string(&self.backup).unwrap()
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }
}

/// Single heir ("Alice") with one recovery leaf `and_v(v:pk(A),older(t))`.
pub fn make_test_vault(network: Network, timelock_blocks: u16) -> TestVault {
    let alice = TestHeir::new("Alice", 3, network);
    let policy = format!("and_v(v:pk({}),older({}))", alice.xonly(), timelock_blocks);
    build_vault(network, vec![(timelock_blocks, compile(&policy))], vec![(alice, 0)], 1)
}

/// Single heir vault exported the way older owner apps did: no internal key
/// and no precompiled leaves, only key material.
pub fn make_leafless_vault(network: Network, timelock_blocks: u16) -> TestVault {
    let alice = TestHeir::new("Alice", 4, network);
    let script = recovery_script(&[alice.xonly()], 1, timelock_blocks).unwrap();
    let mut vault = build_vault(network, vec![(timelock_blocks, script)], vec![(alice, 0)], 1);
    vault.backup.taproot_internal_key = None;
    vault.backup.recovery_leaves.clear();
    vault
}

/// `threshold`-of-`heir_count` heirs sharing one `multi_a` recovery leaf.
pub fn make_threshold_vault(
    network: Network,
    timelock_blocks: u16,
    threshold: usize,
    heir_count: usize,
) -> TestVault {
    let names = ["Alice", "Bob", "Carol", "Dave", "Erin"];
    let heirs: Vec<TestHeir> = (0..heir_count)
        .map(|i| TestHeir::new(names[i % names.len()], 10 + i as u8, network))
        .collect();
    let keys: Vec<String> = heirs.iter().map(|h| h.xonly().to_string()).collect();
    let policy = format!(
        "and_v(v:multi_a({},{}),older({}))",
        threshold,
        keys.join(","),
        timelock_blocks
    );
    let heirs = heirs.into_iter().map(|h| (h, 0)).collect();
    build_vault(network, vec![(timelock_blocks, compile(&policy))], heirs, threshold)
}

/// Two heirs on separate leaves: Alice after `first`, Bob after `second`.
pub fn make_cascade_vault(network: Network, first: u16, second: u16) -> TestVault {
    let alice = TestHeir::new("Alice", 20, network);
    let bob = TestHeir::new("Bob", 21, network);
    let leaves = vec![
        (first, compile(&format!("and_v(v:pk({}),older({}))", alice.xonly(), first))),
        (second, compile(&format!("and_v(v:pk({}),older({}))", bob.xonly(), second))),
    ];
    build_vault(network, leaves, vec![(alice, 0), (bob, 1)], 1)
}

fn compile(miniscript: &str) -> ScriptBuf {
    Miniscript::<XOnlyPublicKey, Tap>::from_str(miniscript)
        .unwrap()
        .encode()
}

fn build_vault(
    network: Network,
    scripts: Vec<(u16, ScriptBuf)>,
    heirs: Vec<(TestHeir, usize)>,
    threshold: usize,
) -> TestVault {
    let secp = Secp256k1::new();
    let (_owner_sk, owner_pk) = test_keypair(1);
    let (_cosigner_sk, cosigner_pk) = test_keypair(2);
    let chain_code = [0xAB; 32];
    let internal_key = KeyMaterial {
        owner_pubkey: owner_pk,
        cosigner_pubkey: cosigner_pk,
        chain_code,
        address_index: 0,
    }
    .internal_key()
    .unwrap();

    let depth = if scripts.len() > 1 { 1 } else { 0 };
    let mut builder = TaprootBuilder::new();
    for (_, script) in &scripts {
        builder = builder.add_leaf(depth, script.clone()).unwrap();
    }
    let spend_info = builder.finalize(&secp, internal_key).unwrap();
    let address = Address::p2tr_tweaked(spend_info.output_key(), network);

    let recovery_leaves = scripts
        .iter()
        .enumerate()
        .map(|(i, (blocks, script))| {
            let cb = spend_info
                .control_block(&(script.clone(), LeafVersion::TapScript))
                .unwrap();
            RecoveryLeaf {
                leaf_index: i,
                script_hex: hex::encode(script.as_bytes()),
                control_block_hex: hex::encode(cb.serialize()),
                timelock_blocks: *blocks,
                leaf_version: LeafVersion::TapScript.to_consensus(),
            }
        })
        .collect();

    let timelock_blocks = scripts.iter().map(|(b, _)| *b).min().unwrap();
    let heir_entries = heirs.iter().map(|(h, i)| h.backup_entry(*i)).collect();

    let backup = VaultBackup {
        version: 1,
        network: network_name(network).to_string(),
        owner_pubkey: owner_pk.to_string(),
        cosigner_pubkey: cosigner_pk.to_string(),
        chain_code: hex::encode(chain_code),
        address_index: 0,
        timelock_blocks,
        threshold,
        heirs: heir_entries,
        vault_address: address.to_string(),
        taproot_internal_key: Some(internal_key.to_string()),
        recovery_leaves,
        created_at: Some("2026-01-01T00:00:00Z".to_string()),
    };

    TestVault {
        backup,
        heirs: heirs.into_iter().map(|(h, _)| h).collect(),
        address,
    }
}

/// Deterministic txid for the n-th fake funding transaction.
pub fn test_txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

/// One claim input per value, each from its own fake funding transaction.
pub fn test_inputs(values: &[u64]) -> Vec<ClaimInput> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| ClaimInput {
            txid: test_txid(i as u8 + 1),
            vout: 0,
            value_sat: *value,
        })
        .collect()
}

/// Add script-path signatures from `signers` to every input of a claim PSBT.
///
/// Only leaves that actually contain a signer's key get a signature from it.
pub fn sign_claim_psbt(psbt_base64: &str, signers: &[&TestHeir]) -> String {
    let secp = Secp256k1::new();
    let mut psbt = Psbt::deserialize(&BASE64.decode(psbt_base64).unwrap()).unwrap();
    let unsigned_tx = psbt.unsigned_tx.clone();
    let prevouts: Vec<TxOut> = psbt
        .inputs
        .iter()
        .map(|input| input.witness_utxo.clone().unwrap())
        .collect();
    let mut cache = SighashCache::new(&unsigned_tx);

    for (index, input) in psbt.inputs.iter_mut().enumerate() {
        let leaves: Vec<(ScriptBuf, TapLeafHash)> = input
            .tap_scripts
            .values()
            .map(|(script, version)| (script.clone(), TapLeafHash::from_script(script, *version)))
            .collect();

        for (script, leaf_hash) in leaves {
            let sighash = cache
                .taproot_script_spend_signature_hash(
                    index,
                    &Prevouts::All(&prevouts),
                    leaf_hash,
                    TapSighashType::Default,
                )
                .unwrap();
            let msg = Message::from_digest(sighash.to_byte_array());

            for heir in signers {
                let xonly = heir.xonly();
                let ms = Miniscript::<XOnlyPublicKey, Tap>::decode(&script).unwrap();
                if !ms.iter_pk().any(|pk| pk == xonly) {
                    continue;
                }
                let signature = secp.sign_schnorr_no_aux_rand(&msg, &heir.keypair());
                input.tap_script_sigs.insert(
                    (xonly, leaf_hash),
                    taproot::Signature {
                        signature,
                        sighash_type: TapSighashType::Default,
                    },
                );
            }
        }
    }

    BASE64.encode(psbt.serialize())
}
