//! Chain Code Delegation, public side.
//!
//! The vault's Taproot internal key is the aggregate of the owner's key and
//! the co-signer's key derived at `address_index` with the delegated chain
//! code. An heir can recompute it from the backup alone:
//!
//! ```text
//! I        = HMAC-SHA512(key = chain_code, data = ser_P(cosigner) || ser_32(index))
//! child    = cosigner + parse_256(I_L) * G
//! internal = x_only(owner + child)
//! ```

use bitcoin::hashes::{sha512, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, Verification};
use std::str::FromStr;

use crate::backup::VaultBackup;
use crate::CoreError;

/// Key material a backup carries for reconstructing the internal key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub owner_pubkey: PublicKey,
    pub cosigner_pubkey: PublicKey,
    pub chain_code: [u8; 32],
    pub address_index: u32,
}

impl KeyMaterial {
    /// Parse the owner key, co-signer key and chain code out of a backup.
    pub fn from_backup(backup: &VaultBackup) -> Result<Self, CoreError> {
        let owner_pubkey = PublicKey::from_str(&backup.owner_pubkey)
            .map_err(|e| CoreError::verification(format!("invalid owner_pubkey: {}", e)))?;
        let cosigner_pubkey = PublicKey::from_str(&backup.cosigner_pubkey)
            .map_err(|e| CoreError::verification(format!("invalid cosigner_pubkey: {}", e)))?;

        let chain_code_bytes = hex::decode(&backup.chain_code)
            .map_err(|e| CoreError::verification(format!("invalid chain_code hex: {}", e)))?;
        let chain_code: [u8; 32] = chain_code_bytes.as_slice().try_into().map_err(|_| {
            CoreError::verification(format!(
                "chain_code must be 32 bytes, got {}",
                chain_code_bytes.len()
            ))
        })?;

        if backup.address_index >= 0x8000_0000 {
            return Err(CoreError::verification(format!(
                "address_index {} is hardened; co-signer keys derive publicly",
                backup.address_index
            )));
        }

        Ok(Self {
            owner_pubkey,
            cosigner_pubkey,
            chain_code,
            address_index: backup.address_index,
        })
    }

    /// Co-signer's child key at `address_index` (BIP-32 CKDpub, one step).
    pub fn cosigner_child<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
    ) -> Result<PublicKey, CoreError> {
        let mut engine = HmacEngine::<sha512::Hash>::new(&self.chain_code);
        engine.input(&self.cosigner_pubkey.serialize());
        engine.input(&self.address_index.to_be_bytes());
        let hmac_result = Hmac::<sha512::Hash>::from_engine(engine);

        let mut il = [0u8; 32];
        il.copy_from_slice(&hmac_result[..32]);
        let tweak = Scalar::from_be_bytes(il)
            .map_err(|_| CoreError::verification("co-signer tweak out of range"))?;

        self.cosigner_pubkey
            .add_exp_tweak(secp, &tweak)
            .map_err(|e| CoreError::verification(format!("co-signer derivation failed: {}", e)))
    }

    /// Aggregate x-only internal key: `owner + cosigner_child`.
    pub fn internal_key(&self) -> Result<XOnlyPublicKey, CoreError> {
        let secp = Secp256k1::verification_only();
        let child = self.cosigner_child(&secp)?;
        let combined = self
            .owner_pubkey
            .combine(&child)
            .map_err(|e| CoreError::verification(format!("key aggregation failed: {}", e)))?;
        Ok(combined.x_only_public_key().0)
    }
}
