//! Eligibility engine: has the vault's timelock expired?
//!
//! Pure arithmetic over a [`ChainSnapshot`]. The lock is anchored to the
//! earliest confirmed deposit, so later top-ups never push the unlock height
//! back.

use serde::Serialize;
use std::fmt;

use crate::descriptor::VaultDescriptor;
use crate::error::ClaimError;
use crate::status::ChainSnapshot;

/// Average block interval used for estimates.
pub const BLOCK_INTERVAL_MINUTES: u64 = 10;

/// Rough wall-clock time until a block height is reached.
///
/// Blocks do not arrive on a schedule; this is an estimate at
/// [`BLOCK_INTERVAL_MINUTES`] per block, never a guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeEstimate {
    pub minutes: u64,
}

impl TimeEstimate {
    pub fn from_blocks(blocks: u64) -> Self {
        Self {
            minutes: blocks.saturating_mul(BLOCK_INTERVAL_MINUTES),
        }
    }
}

impl fmt::Display for TimeEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minutes {
            0 => write!(f, "ready now"),
            m if m > 1440 => write!(f, "~{} days", m / 1440),
            m if m > 60 => write!(f, "~{} hours", m / 60),
            m => write!(f, "~{} minutes", m),
        }
    }
}

/// Outcome of comparing the timelock to chain state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityResult {
    pub eligible: bool,
    pub blocks_remaining: u64,
    pub time_estimate: TimeEstimate,
    pub current_height: u64,
    pub confirmation_height: u64,
    pub unlock_height: u64,
}

/// Compute claim eligibility.
pub fn evaluate(
    descriptor: &VaultDescriptor,
    snapshot: &ChainSnapshot,
) -> Result<EligibilityResult, ClaimError> {
    if snapshot.utxos.is_empty() {
        return Err(ClaimError::VaultNotFunded);
    }

    let confirmation_height = snapshot
        .utxos
        .iter()
        .filter(|u| u.confirmed)
        .filter_map(|u| u.height)
        .min()
        .ok_or(ClaimError::VaultFundsUnconfirmed)?;

    let confirmation_height = u64::from(confirmation_height);
    let current_height = u64::from(snapshot.current_height);
    let unlock_height = confirmation_height + u64::from(descriptor.timelock_blocks);
    let blocks_remaining = unlock_height.saturating_sub(current_height);

    Ok(EligibilityResult {
        eligible: blocks_remaining == 0,
        blocks_remaining,
        time_estimate: TimeEstimate::from_blocks(blocks_remaining),
        current_height,
        confirmation_height,
        unlock_height,
    })
}
