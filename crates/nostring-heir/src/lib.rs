//! NoString Heir Claim
//!
//! Orchestrates an heir's claim on a time-locked inheritance vault:
//! 1. Import the vault backup ([`descriptor`])
//! 2. Read chain state at the vault address ([`status`])
//! 3. Decide whether the timelock has expired ([`eligibility`])
//! 4. Build an unsigned claim over the confirmed outputs ([`aggregate`], [`builder`])
//! 5. Finalize the heir's signed PSBT and broadcast it ([`broadcast`])
//!
//! [`workflow::ClaimWorkflow`] sequences these stages for one in-memory
//! session.
//!
//! # Security
//!
//! - No private keys ever pass through this crate. The heir signs the claim
//!   PSBT on their own device.
//! - All script and signature work is done by `nostring-vault-core`,
//!   reached only through its JSON text boundary ([`vault_core::VaultCore`]).
//!
//! # Example
//!
//! ```ignore
//! use nostring_heir::{ClaimRequest, ClaimWorkflow, ChainStatusProvider, NativeVaultCore};
//! use std::sync::Arc;
//!
//! let mut workflow = ClaimWorkflow::new(Arc::new(NativeVaultCore), provider, 500);
//! workflow.import(&backup_json)?;
//! if workflow.check_status().await?.eligible {
//!     let claim = workflow.build_claim(ClaimRequest {
//!         destination: "tb1q...".into(),
//!         heir_index: 0,
//!         fee_rate: 5,
//!     })?;
//!     // sign claim.psbt_base64 externally, then:
//!     workflow.finalize(&signed_psbt)?;
//!     let receipt = workflow.broadcast().await?;
//! }
//! ```

pub mod aggregate;
pub mod broadcast;
pub mod builder;
pub mod config;
pub mod descriptor;
pub mod eligibility;
pub mod error;
pub mod status;
pub mod vault_core;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use aggregate::SpendableSet;
pub use broadcast::{BroadcastCoordinator, BroadcastReceipt, FinalizedClaim};
pub use builder::{ClaimRequest, UnsignedClaim};
pub use config::HeirConfig;
pub use descriptor::VaultDescriptor;
pub use eligibility::{EligibilityResult, TimeEstimate};
pub use error::{ClaimError, Stage, WorkflowError};
pub use status::{ChainSettings, ChainSnapshot, ChainStatusProvider};
pub use vault_core::{NativeVaultCore, VaultCore};
pub use workflow::{ClaimState, ClaimWorkflow, Session, SessionView, StatusTicket};
