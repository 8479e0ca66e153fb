//! Vault descriptor import.
//!
//! Turns a backup payload into an immutable [`VaultDescriptor`]. Parsing and
//! the cheap invariants happen here; whether the key material actually
//! produces the vault address is Vault Core's call.

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};
use nostring_vault_core::api::VaultInfo;
use nostring_vault_core::backup::VaultBackup;
use nostring_vault_core::{network_name, parse_network, CoreErrorKind};
use serde::Serialize;

use crate::error::ClaimError;
use crate::vault_core::{decode, VaultCore};

/// A claimable vault, as described by its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultDescriptor {
    pub network: Network,
    pub vault_address: String,
    pub timelock_blocks: u16,
    pub heir_count: usize,
    pub threshold: usize,
    pub heir_labels: Vec<String>,
    #[serde(skip)]
    address: Address,
    #[serde(skip)]
    raw_payload: String,
}

impl VaultDescriptor {
    /// The vault address, checked against [`Self::network`].
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The backup exactly as imported.
    pub fn raw_payload(&self) -> &str {
        &self.raw_payload
    }

    /// Network name as Vault Core expects it.
    pub fn network_name(&self) -> &'static str {
        network_name(self.network)
    }
}

/// Parse and validate a vault backup.
pub fn import(payload: &str, core: &dyn VaultCore) -> Result<VaultDescriptor, ClaimError> {
    let backup = VaultBackup::from_json(payload).map_err(|e| match e.kind {
        CoreErrorKind::UnsupportedVersion => ClaimError::UnsupportedVersion(e.reason),
        _ => ClaimError::MalformedDescriptor(e.reason),
    })?;

    check_invariants(&backup)?;

    let network = parse_network(&backup.network)
        .map_err(|e| ClaimError::MalformedDescriptor(e.reason))?;

    let info: VaultInfo = decode(&core.import_vault_backup(payload))
        .map_err(|reason| ClaimError::DescriptorValidationFailed { reason })?
        .map_err(|e| ClaimError::DescriptorValidationFailed { reason: e.reason })?;

    let valid: bool = decode(&core.validate_address(&backup.vault_address, network_name(network)))
        .map_err(|reason| ClaimError::DescriptorValidationFailed { reason })?
        .map_err(|e| ClaimError::DescriptorValidationFailed { reason: e.reason })?;
    if !valid {
        return Err(ClaimError::DescriptorValidationFailed {
            reason: format!(
                "vault address {} is not valid for {}",
                backup.vault_address, network
            ),
        });
    }

    cross_check(&backup, &info)?;

    let address = backup
        .vault_address
        .parse::<Address<NetworkUnchecked>>()
        .ok()
        .and_then(|a| a.require_network(network).ok())
        .ok_or_else(|| ClaimError::DescriptorValidationFailed {
            reason: format!("vault address {} does not parse", backup.vault_address),
        })?;

    log::info!(
        "imported {} vault {} ({}-of-{} heirs, timelock {} blocks)",
        network,
        address,
        backup.threshold,
        backup.heirs.len(),
        backup.timelock_blocks
    );

    Ok(VaultDescriptor {
        network,
        vault_address: address.to_string(),
        timelock_blocks: backup.timelock_blocks,
        heir_count: backup.heirs.len(),
        threshold: backup.threshold,
        heir_labels: backup.heirs.iter().map(|h| h.label.clone()).collect(),
        address,
        raw_payload: payload.to_string(),
    })
}

fn check_invariants(backup: &VaultBackup) -> Result<(), ClaimError> {
    if backup.timelock_blocks == 0 {
        return Err(ClaimError::MalformedDescriptor(
            "timelock_blocks must be > 0".into(),
        ));
    }
    if backup.heirs.is_empty() {
        return Err(ClaimError::MalformedDescriptor(
            "backup has no heirs".into(),
        ));
    }
    if backup.threshold == 0 || backup.threshold > backup.heirs.len() {
        return Err(ClaimError::MalformedDescriptor(format!(
            "threshold {} out of range for {} heirs",
            backup.threshold,
            backup.heirs.len()
        )));
    }
    Ok(())
}

/// Vault Core must describe the same vault the backup does.
fn cross_check(backup: &VaultBackup, info: &VaultInfo) -> Result<(), ClaimError> {
    let mismatch = if info.vault_address != backup.vault_address {
        Some(format!("address {}", info.vault_address))
    } else if info.timelock_blocks != backup.timelock_blocks {
        Some(format!("timelock {}", info.timelock_blocks))
    } else if info.threshold != backup.threshold {
        Some(format!("threshold {}", info.threshold))
    } else if info.heir_count != backup.heirs.len() {
        Some(format!("heir count {}", info.heir_count))
    } else if !info.address_verified {
        Some("unverified address".to_string())
    } else {
        None
    };

    match mismatch {
        Some(what) => Err(ClaimError::DescriptorValidationFailed {
            reason: format!("Vault Core reported {} for this backup", what),
        }),
        None => Ok(()),
    }
}
