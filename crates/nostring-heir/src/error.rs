//! Error taxonomy for the claim workflow.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Everything that can go wrong in a claim stage.
///
/// Reasons coming from Vault Core or the chain service are carried verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ClaimError {
    #[error("Malformed vault descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Unsupported backup version: {0}")]
    UnsupportedVersion(String),

    #[error("Vault descriptor failed validation: {reason}")]
    DescriptorValidationFailed { reason: String },

    #[error("Chain query failed: {cause}")]
    ChainQueryFailed { cause: String },

    #[error("Vault has no funds at its address")]
    VaultNotFunded,

    #[error("Vault funds are not confirmed yet")]
    VaultFundsUnconfirmed,

    #[error("No confirmed funds to spend")]
    NoSpendableFunds,

    #[error("Invalid destination address: {0}")]
    InvalidDestinationAddress(String),

    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("Claim accounting mismatch: {0}")]
    AccountingMismatch(String),

    #[error("Incomplete signatures: {0}")]
    IncompleteSignatures(String),

    #[error("Malformed signed payload: {0}")]
    MalformedSignedPayload(String),

    #[error("Broadcast rejected: {reason}")]
    BroadcastRejected { reason: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid claim request: {0}")]
    InvalidClaimRequest(String),
}

impl ClaimError {
    /// Stable snake_case name of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimError::MalformedDescriptor(_) => "malformed_descriptor",
            ClaimError::UnsupportedVersion(_) => "unsupported_version",
            ClaimError::DescriptorValidationFailed { .. } => "descriptor_validation_failed",
            ClaimError::ChainQueryFailed { .. } => "chain_query_failed",
            ClaimError::VaultNotFunded => "vault_not_funded",
            ClaimError::VaultFundsUnconfirmed => "vault_funds_unconfirmed",
            ClaimError::NoSpendableFunds => "no_spendable_funds",
            ClaimError::InvalidDestinationAddress(_) => "invalid_destination_address",
            ClaimError::InsufficientFunds(_) => "insufficient_funds",
            ClaimError::AccountingMismatch(_) => "accounting_mismatch",
            ClaimError::IncompleteSignatures(_) => "incomplete_signatures",
            ClaimError::MalformedSignedPayload(_) => "malformed_signed_payload",
            ClaimError::BroadcastRejected { .. } => "broadcast_rejected",
            ClaimError::ConfigurationError(_) => "configuration_error",
            ClaimError::InvalidClaimRequest(_) => "invalid_claim_request",
        }
    }
}

/// Workflow stage an error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Import,
    Status,
    Build,
    Finalize,
    Broadcast,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Import => "import",
            Stage::Status => "status check",
            Stage::Build => "claim build",
            Stage::Finalize => "finalize",
            Stage::Broadcast => "broadcast",
        };
        f.write_str(s)
    }
}

/// Errors returned by [`crate::workflow::ClaimWorkflow`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// The stage ran and failed; the workflow is now in `Failed`
    #[error("{stage} failed: {source}")]
    Claim {
        stage: Stage,
        #[source]
        source: ClaimError,
    },

    /// The call is not allowed in the current state; nothing changed
    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: Stage },

    #[error("a {0} is already in flight")]
    StageInFlight(Stage),

    /// A status result arrived for a cancelled or outdated check and was dropped
    #[error("status result superseded by a newer session state")]
    Superseded,
}

impl WorkflowError {
    /// The underlying claim error, if the stage itself failed.
    pub fn claim_error(&self) -> Option<&ClaimError> {
        match self {
            WorkflowError::Claim { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_serialized_tag() {
        let errors = vec![
            ClaimError::MalformedDescriptor("x".into()),
            ClaimError::DescriptorValidationFailed { reason: "x".into() },
            ClaimError::VaultNotFunded,
            ClaimError::BroadcastRejected { reason: "x".into() },
            ClaimError::InvalidClaimRequest("x".into()),
        ];
        for e in errors {
            let value = serde_json::to_value(&e).unwrap();
            assert_eq!(value["kind"], e.kind());
        }
    }

    #[test]
    fn test_rejection_reason_verbatim() {
        let e = ClaimError::BroadcastRejected {
            reason: "bad-txns-inputs-missingorspent".into(),
        };
        assert_eq!(
            e.to_string(),
            "Broadcast rejected: bad-txns-inputs-missingorspent"
        );
    }

    #[test]
    fn test_workflow_error_source() {
        let e = WorkflowError::Claim {
            stage: Stage::Status,
            source: ClaimError::VaultFundsUnconfirmed,
        };
        assert_eq!(e.claim_error(), Some(&ClaimError::VaultFundsUnconfirmed));
        assert!(e.to_string().starts_with("status check failed"));
        assert!(WorkflowError::Superseded.claim_error().is_none());
    }
}
