//! VaultBackup: serializable descriptor format shared between owner and heir apps.
//!
//! Contains everything an heir needs to reconstruct the vault, find it
//! on-chain and build a claim transaction. Verification works from public
//! data only: the internal key is recomputed from the owner and co-signer
//! keys, and every recovery leaf must commit to the vault's output key.
//! Backups exported without precompiled leaves get their single leaf
//! recompiled from the heirs and timelock.

use bitcoin::address::NetworkUnchecked;
use bitcoin::bip32::{DerivationPath, Fingerprint, Xpub};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::relative;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash, TaprootBuilder};
use bitcoin::{Address, Network, Script, ScriptBuf};
use miniscript::policy::Concrete;
use miniscript::{Miniscript, RelLockTime, Tap, Terminal, Threshold};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::ccd::KeyMaterial;
use crate::{parse_network, CoreError, CoreErrorKind, SUPPORTED_BACKUP_VERSION};

/// Serializable vault descriptor backup.
///
/// Delivered via NIP-17 encrypted DM or physical backup. Unknown fields are
/// rejected so a newer or hand-edited backup never half-parses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultBackup {
    /// Format version (for future compatibility)
    pub version: u32,
    /// Bitcoin network
    pub network: String,
    /// Owner's compressed public key (hex)
    pub owner_pubkey: String,
    /// Co-signer's compressed public key (hex)
    pub cosigner_pubkey: String,
    /// CCD chain code (hex, 32 bytes)
    pub chain_code: String,
    /// BIP-32 derivation index for this vault
    pub address_index: u32,
    /// Timelock in blocks
    pub timelock_blocks: u16,
    /// Threshold required for multi-heir claim (e.g., 2 of 3).
    pub threshold: usize,
    /// Heir information
    pub heirs: Vec<HeirBackupEntry>,
    /// The vault's P2TR address
    pub vault_address: String,
    /// Taproot internal key (hex, x-only aggregate pubkey before taptweak)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taproot_internal_key: Option<String>,
    /// Precompiled recovery scripts with control blocks (one per Tapscript leaf)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_leaves: Vec<RecoveryLeaf>,
    /// ISO-8601 creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Precompiled Tapscript leaf with everything the heir needs to build a script-path spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecoveryLeaf {
    /// Index into this vec (matches heir's recovery_index)
    pub leaf_index: usize,
    /// Compiled miniscript as hex (the actual Script bytes)
    pub script_hex: String,
    /// Taproot control block for this leaf (hex)
    pub control_block_hex: String,
    /// CSV timelock value for this spending path
    pub timelock_blocks: u16,
    /// Tapscript leaf version (0xc0)
    pub leaf_version: u8,
}

/// Per-heir entry in the backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeirBackupEntry {
    pub label: String,
    pub xpub: String,
    pub fingerprint: String,
    pub derivation_path: String,
    /// Which recovery script leaf this heir uses
    pub recovery_index: usize,
    /// Nostr npub for DM delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npub: Option<String>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: Option<u32>,
}

impl VaultBackup {
    /// Parse a backup, checking the declared version before the full schema.
    ///
    /// A payload that declares another version is reported as
    /// [`CoreErrorKind::UnsupportedVersion`] even if its shape differs;
    /// everything else that does not match the schema is
    /// [`CoreErrorKind::InvalidBackup`].
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let header: VersionHeader = serde_json::from_str(json).map_err(|e| {
            CoreError::new(CoreErrorKind::InvalidBackup, format!("Invalid JSON: {}", e))
        })?;

        match header.version {
            None => {
                return Err(CoreError::new(
                    CoreErrorKind::InvalidBackup,
                    "missing 'version' field",
                ))
            }
            Some(v) if v != SUPPORTED_BACKUP_VERSION => {
                return Err(CoreError::new(
                    CoreErrorKind::UnsupportedVersion,
                    format!(
                        "backup version {} is not supported (expected {})",
                        v, SUPPORTED_BACKUP_VERSION
                    ),
                ))
            }
            Some(_) => {}
        }

        serde_json::from_str(json).map_err(|e| {
            CoreError::new(CoreErrorKind::InvalidBackup, format!("Invalid backup: {}", e))
        })
    }

    /// Verify the backup against its own vault address.
    ///
    /// The owner and co-signer keys must produce the internal key, every
    /// recovery leaf must be committed to by the address's output key, and
    /// every heir's key must appear in the leaf it claims to use.
    pub fn verify(&self) -> Result<VerifiedVault, CoreError> {
        if self.version != SUPPORTED_BACKUP_VERSION {
            return Err(CoreError::new(
                CoreErrorKind::UnsupportedVersion,
                format!("backup version {} is not supported", self.version),
            ));
        }

        let network = parse_network(&self.network)?;
        let address = parse_address(&self.vault_address, network)
            .map_err(|e| CoreError::verification(format!("vault address: {}", e.reason)))?;
        let output_key = p2tr_output_key(&address)?;

        let internal_key = KeyMaterial::from_backup(self)?.internal_key()?;
        if let Some(declared) = self.taproot_internal_key.as_deref() {
            let declared = XOnlyPublicKey::from_str(declared).map_err(|e| {
                CoreError::verification(format!("invalid taproot_internal_key: {}", e))
            })?;
            if declared != internal_key {
                return Err(CoreError::verification(
                    "taproot_internal_key does not match the owner and co-signer keys",
                ));
            }
        }

        if self.timelock_blocks == 0 {
            return Err(CoreError::verification("timelock_blocks must be positive"));
        }
        if self.heirs.is_empty() {
            return Err(CoreError::verification("backup contains no heirs"));
        }
        if self.threshold == 0 || self.threshold > self.heirs.len() {
            return Err(CoreError::verification(format!(
                "invalid threshold: {} of {} heirs",
                self.threshold,
                self.heirs.len()
            )));
        }

        let secp = Secp256k1::verification_only();
        let leaves = if self.recovery_leaves.is_empty() {
            vec![self.reconstruct_leaf(&secp, internal_key, output_key)?]
        } else {
            let leaves = self
                .recovery_leaves
                .iter()
                .enumerate()
                .map(|(i, leaf)| verify_leaf(&secp, i, leaf, internal_key, output_key))
                .collect::<Result<Vec<_>, _>>()?;
            let earliest = leaves.iter().map(|l| l.timelock_blocks).min().unwrap_or(0);
            if earliest != self.timelock_blocks {
                return Err(CoreError::verification(format!(
                    "timelock_blocks is {} but the earliest recovery leaf unlocks after {}",
                    self.timelock_blocks, earliest
                )));
            }
            leaves
        };

        let heirs = self
            .heirs
            .iter()
            .map(|h| verify_heir(h, &leaves))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(VerifiedVault {
            network,
            address,
            internal_key,
            timelock_blocks: self.timelock_blocks,
            threshold: self.threshold,
            leaves,
            heirs,
        })
    }

    /// Recompile the single recovery leaf of a backup exported without
    /// precompiled leaves, and check it produces the vault address.
    fn reconstruct_leaf<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        internal_key: XOnlyPublicKey,
        output_key: XOnlyPublicKey,
    ) -> Result<VerifiedLeaf, CoreError> {
        let heir_keys = self
            .heirs
            .iter()
            .map(|h| {
                Xpub::from_str(&h.xpub)
                    .map(|xpub| xpub.public_key.x_only_public_key().0)
                    .map_err(|e| {
                        CoreError::verification(format!("invalid heir xpub '{}': {}", h.label, e))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let script = recovery_script(&heir_keys, self.threshold, self.timelock_blocks)?;

        let spend_info = TaprootBuilder::new()
            .add_leaf(0, script.clone())
            .map_err(|e| CoreError::verification(format!("taproot builder error: {}", e)))?
            .finalize(secp, internal_key)
            .map_err(|_| CoreError::verification("taproot finalize failed"))?;

        if spend_info.output_key().to_inner() != output_key {
            let network = parse_network(&self.network)?;
            return Err(CoreError::verification(format!(
                "address mismatch: computed {} but backup says {}. \
                 Backup may be corrupt or tampered.",
                Address::p2tr_tweaked(spend_info.output_key(), network),
                self.vault_address
            )));
        }

        let control_block = spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .ok_or_else(|| CoreError::verification("reconstructed leaf has no control block"))?;
        inspect_leaf(0, script, control_block, self.timelock_blocks)
    }
}

/// Compile the recovery leaf for `heirs` after `timelock_blocks`:
/// `and(pk(H), older(t))` for one heir, `and(thresh(k, pk(H1), ...), older(t))`
/// for several.
pub fn recovery_script(
    heirs: &[XOnlyPublicKey],
    threshold: usize,
    timelock_blocks: u16,
) -> Result<ScriptBuf, CoreError> {
    let heir_policy = match heirs {
        [] => return Err(CoreError::verification("backup contains no heirs")),
        [key] => Concrete::Key(*key),
        keys => {
            let key_policies = keys.iter().map(|k| Arc::new(Concrete::Key(*k))).collect();
            Concrete::Thresh(
                Threshold::new(threshold, key_policies)
                    .map_err(|e| CoreError::verification(format!("invalid threshold: {}", e)))?,
            )
        }
    };
    let recovery_policy = Concrete::And(vec![
        Arc::new(heir_policy),
        Arc::new(Concrete::Older(RelLockTime::from_height(timelock_blocks))),
    ]);

    let ms: Miniscript<XOnlyPublicKey, Tap> = recovery_policy
        .compile()
        .map_err(|e| CoreError::verification(format!("tapscript compilation failed: {}", e)))?;
    Ok(ms.encode())
}

/// A backup whose leaves and heirs were checked against the vault address.
#[derive(Debug, Clone)]
pub struct VerifiedVault {
    pub network: Network,
    pub address: Address,
    pub internal_key: XOnlyPublicKey,
    /// The primary (earliest) timelock
    pub timelock_blocks: u16,
    pub threshold: usize,
    pub leaves: Vec<VerifiedLeaf>,
    pub heirs: Vec<VerifiedHeir>,
}

/// A recovery leaf proven to be part of the vault's script tree.
#[derive(Debug, Clone)]
pub struct VerifiedLeaf {
    pub leaf_index: usize,
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
    pub timelock_blocks: u16,
    /// Keys referenced by the leaf script, in script order
    pub keys: Vec<XOnlyPublicKey>,
    pub merkle_root: TapNodeHash,
}

impl VerifiedLeaf {
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(&self.script, LeafVersion::TapScript)
    }

    /// Number of hashes in the control block's Merkle path.
    pub fn depth(&self) -> usize {
        self.control_block.merkle_branch.len()
    }
}

/// An heir whose key was found in its recovery leaf.
#[derive(Debug, Clone)]
pub struct VerifiedHeir {
    pub label: String,
    pub key: XOnlyPublicKey,
    pub recovery_index: usize,
    /// Key origin for signing devices, when the backup's metadata parses
    pub origin: Option<(Fingerprint, DerivationPath)>,
}

/// Parse an address and require it to belong to `network`.
pub fn parse_address(address: &str, network: Network) -> Result<Address, CoreError> {
    let unchecked: Address<NetworkUnchecked> = address.trim().parse().map_err(|e| {
        CoreError::new(
            CoreErrorKind::InvalidAddress,
            format!("invalid address '{}': {}", address, e),
        )
    })?;
    unchecked.require_network(network).map_err(|_| {
        CoreError::new(
            CoreErrorKind::InvalidAddress,
            format!("address '{}' is not valid for {}", address, network),
        )
    })
}

fn p2tr_output_key(address: &Address) -> Result<XOnlyPublicKey, CoreError> {
    let spk = address.script_pubkey();
    if !spk.is_p2tr() {
        return Err(CoreError::verification(
            "vault address is not a Taproot (P2TR) address",
        ));
    }
    // OP_1 <32-byte key>
    XOnlyPublicKey::from_slice(&spk.as_bytes()[2..34])
        .map_err(|e| CoreError::verification(format!("invalid output key: {}", e)))
}

fn verify_leaf<C: Verification>(
    secp: &Secp256k1<C>,
    position: usize,
    leaf: &RecoveryLeaf,
    internal_key: XOnlyPublicKey,
    output_key: XOnlyPublicKey,
) -> Result<VerifiedLeaf, CoreError> {
    if leaf.leaf_index != position {
        return Err(CoreError::verification(format!(
            "recovery leaf at position {} claims index {}",
            position, leaf.leaf_index
        )));
    }
    if leaf.leaf_version != LeafVersion::TapScript.to_consensus() {
        return Err(CoreError::verification(format!(
            "leaf {}: unsupported leaf version {:#04x}",
            position, leaf.leaf_version
        )));
    }

    let script_bytes = hex::decode(&leaf.script_hex).map_err(|e| {
        CoreError::verification(format!("leaf {}: invalid script hex: {}", position, e))
    })?;
    let script = ScriptBuf::from_bytes(script_bytes);

    let cb_bytes = hex::decode(&leaf.control_block_hex).map_err(|e| {
        CoreError::verification(format!("leaf {}: invalid control block hex: {}", position, e))
    })?;
    let control_block = ControlBlock::decode(&cb_bytes).map_err(|e| {
        CoreError::verification(format!("leaf {}: invalid control block: {}", position, e))
    })?;

    if control_block.internal_key != internal_key {
        return Err(CoreError::verification(format!(
            "leaf {}: control block internal key does not match taproot_internal_key",
            position
        )));
    }
    if control_block.leaf_version != LeafVersion::TapScript {
        return Err(CoreError::verification(format!(
            "leaf {}: control block is not for a tapscript leaf",
            position
        )));
    }
    if !control_block.verify_taproot_commitment(secp, output_key, &script) {
        return Err(CoreError::verification(format!(
            "leaf {} is not committed to by the vault address. \
             Backup may be corrupt or tampered.",
            position
        )));
    }

    inspect_leaf(position, script, control_block, leaf.timelock_blocks)
}

/// Decode a committed leaf and check every `older()` in it enforces
/// `timelock_blocks`.
fn inspect_leaf(
    position: usize,
    script: ScriptBuf,
    control_block: ControlBlock,
    timelock_blocks: u16,
) -> Result<VerifiedLeaf, CoreError> {
    let ms = Miniscript::<XOnlyPublicKey, Tap>::decode(&script).map_err(|e| {
        CoreError::verification(format!("leaf {}: not a tapscript miniscript: {}", position, e))
    })?;
    let keys: Vec<XOnlyPublicKey> = ms.iter_pk().collect();

    let mut enforced = false;
    for node in ms.iter() {
        let Terminal::Older(lock) = &node.node else {
            continue;
        };
        match relative::LockTime::from(*lock) {
            relative::LockTime::Blocks(height) if height.value() == timelock_blocks => {
                enforced = true
            }
            relative::LockTime::Blocks(height) => {
                return Err(CoreError::verification(format!(
                    "leaf {}: script enforces {} blocks but backup says {}",
                    position,
                    height.value(),
                    timelock_blocks
                )))
            }
            relative::LockTime::Time(_) => {
                return Err(CoreError::verification(format!(
                    "leaf {}: time-based relative lock is not supported",
                    position
                )))
            }
        }
    }
    if !enforced {
        return Err(CoreError::verification(format!(
            "leaf {}: script has no relative timelock",
            position
        )));
    }

    let merkle_root = merkle_root(&script, &control_block);

    Ok(VerifiedLeaf {
        leaf_index: position,
        script,
        control_block,
        timelock_blocks,
        keys,
        merkle_root,
    })
}

fn verify_heir(entry: &HeirBackupEntry, leaves: &[VerifiedLeaf]) -> Result<VerifiedHeir, CoreError> {
    let xpub = Xpub::from_str(&entry.xpub).map_err(|e| {
        CoreError::verification(format!("invalid heir xpub '{}': {}", entry.label, e))
    })?;
    let key = xpub.public_key.x_only_public_key().0;

    let leaf = leaves.get(entry.recovery_index).ok_or_else(|| {
        CoreError::verification(format!(
            "heir '{}' uses recovery leaf {} but the backup has {}",
            entry.label,
            entry.recovery_index,
            leaves.len()
        ))
    })?;
    if !leaf.keys.contains(&key) {
        return Err(CoreError::verification(format!(
            "heir '{}' key is not part of recovery leaf {}",
            entry.label, entry.recovery_index
        )));
    }

    let origin = match (
        Fingerprint::from_str(&entry.fingerprint),
        DerivationPath::from_str(&entry.derivation_path),
    ) {
        (Ok(fp), Ok(path)) => Some((fp, path)),
        _ => {
            log::debug!("heir '{}' has no usable key origin", entry.label);
            None
        }
    };

    Ok(VerifiedHeir {
        label: entry.label.clone(),
        key,
        recovery_index: entry.recovery_index,
        origin,
    })
}

fn merkle_root(script: &Script, control_block: &ControlBlock) -> TapNodeHash {
    let leaf_hash = TapLeafHash::from_script(script, LeafVersion::TapScript);
    control_block
        .merkle_branch
        .iter()
        .fold(TapNodeHash::from(leaf_hash), |node, sibling| {
            TapNodeHash::from_node_hashes(node, *sibling)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        make_cascade_vault, make_leafless_vault, make_test_vault, make_threshold_vault,
    };

    #[test]
    fn test_backup_roundtrip() {
        let vault = make_test_vault(Network::Testnet, 144);
        let json = serde_json::to_string_pretty(&vault.backup).unwrap();
        let restored = VaultBackup::from_json(&json).unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(restored.network, "testnet");
        assert_eq!(restored.heirs.len(), 1);
        assert_eq!(restored.heirs[0].label, "Alice");
        assert_eq!(restored.recovery_leaves.len(), 1);
    }

    #[test]
    fn test_optional_fields_default() {
        let old_json = serde_json::json!({
            "version": 1,
            "network": "bitcoin",
            "owner_pubkey": "02a1633cafcc01ebfb6d78e39f687a1f0995c62fc95f51ead10a02ee0be551b5dc",
            "cosigner_pubkey": "03a1633cafcc01ebfb6d78e39f687a1f0995c62fc95f51ead10a02ee0be551b5dc",
            "chain_code": "abababababababababababababababababababababababababababababababab",
            "address_index": 0,
            "timelock_blocks": 26280,
            "threshold": 1,
            "heirs": [{
                "label": "Alice",
                "xpub": "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8",
                "fingerprint": "00000000",
                "derivation_path": "m/84'/1'/0'",
                "recovery_index": 0
            }],
            "vault_address": "tb1ptest"
        })
        .to_string();
        let restored = VaultBackup::from_json(&old_json).unwrap();
        assert!(restored.taproot_internal_key.is_none());
        assert!(restored.recovery_leaves.is_empty());
        assert!(restored.heirs[0].npub.is_none());

        // Parses, but the placeholder address cannot be verified
        let err = restored.verify().unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::VerificationFailed);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let vault = make_test_vault(Network::Testnet, 144);
        let mut value = serde_json::to_value(&vault.backup).unwrap();
        value["surprise"] = serde_json::json!(true);
        let err = VaultBackup::from_json(&value.to_string()).unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::InvalidBackup);
    }

    #[test]
    fn test_mistyped_field_rejected() {
        let vault = make_test_vault(Network::Testnet, 144);
        let mut value = serde_json::to_value(&vault.backup).unwrap();
        value["timelock_blocks"] = serde_json::json!("144");
        let err = VaultBackup::from_json(&value.to_string()).unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::InvalidBackup);
    }

    #[test]
    fn test_version_checked_first() {
        let err = VaultBackup::from_json(r#"{"version": 2, "whatever": []}"#).unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::UnsupportedVersion);

        let err = VaultBackup::from_json(r#"{"network": "testnet"}"#).unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::InvalidBackup);
        assert!(err.reason.contains("version"));
    }

    #[test]
    fn test_verify_single_heir() {
        let vault = make_test_vault(Network::Testnet, 144);
        let verified = vault.backup.verify().unwrap();
        assert_eq!(verified.network, Network::Testnet);
        assert_eq!(verified.address, vault.address);
        assert_eq!(verified.timelock_blocks, 144);
        assert_eq!(verified.leaves.len(), 1);
        assert_eq!(verified.leaves[0].depth(), 0);
        assert_eq!(verified.heirs[0].key, vault.heirs[0].xonly());
        assert!(verified.heirs[0].origin.is_some());
    }

    #[test]
    fn test_verify_threshold_vault() {
        let vault = make_threshold_vault(Network::Testnet, 1000, 2, 3);
        let verified = vault.backup.verify().unwrap();
        assert_eq!(verified.threshold, 2);
        assert_eq!(verified.leaves[0].keys.len(), 3);
        assert_eq!(verified.heirs.len(), 3);
    }

    #[test]
    fn test_verify_cascade_vault() {
        let vault = make_cascade_vault(Network::Signet, 100, 200);
        let verified = vault.backup.verify().unwrap();
        assert_eq!(verified.leaves.len(), 2);
        assert_eq!(verified.leaves[0].depth(), 1);
        assert_eq!(verified.leaves[1].timelock_blocks, 200);
        assert_eq!(verified.timelock_blocks, 100);
    }

    #[test]
    fn test_verify_tampered_address() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        let other = make_cascade_vault(Network::Testnet, 100, 200);
        vault.backup.vault_address = other.backup.vault_address.clone();
        let err = vault.backup.verify().unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::VerificationFailed);
        assert!(err.reason.contains("not committed"), "got: {}", err.reason);
    }

    #[test]
    fn test_verify_wrong_network_address() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.network = "bitcoin".into();
        let err = vault.backup.verify().unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::VerificationFailed);
        assert!(err.reason.contains("vault address"));
    }

    #[test]
    fn test_verify_timelock_mismatch() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.timelock_blocks = 100;
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("earliest recovery leaf"));

        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.recovery_leaves[0].timelock_blocks = 145;
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("enforces 144 blocks"));
    }

    #[test]
    fn test_verify_heir_not_in_leaf() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        let stranger = make_threshold_vault(Network::Testnet, 144, 1, 2);
        vault.backup.heirs[0].xpub = stranger.backup.heirs[1].xpub.clone();
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("not part of recovery leaf"));
    }

    #[test]
    fn test_verify_bad_threshold() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.threshold = 2;
        assert!(vault.backup.verify().is_err());
        vault.backup.threshold = 0;
        assert!(vault.backup.verify().is_err());
    }

    #[test]
    fn test_verify_leafless_backup() {
        let vault = make_leafless_vault(Network::Testnet, 144);
        let verified = vault.backup.verify().unwrap();
        assert_eq!(verified.address, vault.address);
        assert_eq!(verified.leaves.len(), 1);
        assert_eq!(verified.leaves[0].depth(), 0);
        assert_eq!(verified.leaves[0].timelock_blocks, 144);
        assert_eq!(
            verified.leaves[0].script,
            recovery_script(&[vault.heirs[0].xonly()], 1, 144).unwrap()
        );
        assert_eq!(verified.heirs[0].key, vault.heirs[0].xonly());
    }

    #[test]
    fn test_leafless_backup_checked_against_key_material() {
        let mut vault = make_leafless_vault(Network::Testnet, 144);
        vault.backup.address_index = 1;
        let err = vault.backup.verify().unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::VerificationFailed);
        assert!(err.reason.contains("address mismatch"), "got: {}", err.reason);

        let mut vault = make_leafless_vault(Network::Testnet, 144);
        vault.backup.timelock_blocks = 145;
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("address mismatch"), "got: {}", err.reason);
    }

    #[test]
    fn test_internal_key_must_match_key_material() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.chain_code = "cd".repeat(32);
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("does not match the owner"), "got: {}", err.reason);

        // Without a declared internal key, the leaves no longer commit to the address
        vault.backup.taproot_internal_key = None;
        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("control block internal key"), "got: {}", err.reason);
    }

    #[test]
    fn test_garbage_key_material_rejected() {
        let mut vault = make_test_vault(Network::Testnet, 144);
        vault.backup.owner_pubkey = "zz-not-hex".into();
        let err = vault.backup.verify().unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::VerificationFailed);
        assert!(err.reason.contains("owner_pubkey"));
    }

    #[test]
    fn test_every_older_must_match() {
        // Two relative locks in one leaf: the second disagrees with the backup
        let mut vault = make_test_vault(Network::Testnet, 144);
        let alice = vault.heirs[0].xonly();
        let script = Miniscript::<XOnlyPublicKey, Tap>::from_str(&format!(
            "and_v(v:and_v(v:pk({}),older(144)),older(200))",
            alice
        ))
        .unwrap()
        .encode();
        let internal_key = vault.backup.verify().unwrap().internal_key;
        let spend_info = TaprootBuilder::new()
            .add_leaf(0, script.clone())
            .unwrap()
            .finalize(&Secp256k1::new(), internal_key)
            .unwrap();
        let cb = spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .unwrap();
        vault.backup.vault_address =
            Address::p2tr_tweaked(spend_info.output_key(), Network::Testnet).to_string();
        vault.backup.recovery_leaves[0].script_hex = hex::encode(script.as_bytes());
        vault.backup.recovery_leaves[0].control_block_hex = hex::encode(cb.serialize());

        let err = vault.backup.verify().unwrap_err();
        assert!(err.reason.contains("enforces 200 blocks"), "got: {}", err.reason);
    }

    #[test]
    fn test_parse_address() {
        let addr = parse_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", Network::Bitcoin);
        assert!(addr.is_ok());

        let err = parse_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", Network::Testnet)
            .unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::InvalidAddress);

        let err = parse_address("notanaddress", Network::Testnet).unwrap_err();
        assert_eq!(err.kind, CoreErrorKind::InvalidAddress);
    }
}
