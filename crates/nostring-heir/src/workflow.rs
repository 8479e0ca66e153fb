//! Claim workflow state machine.
//!
//! ```text
//! Importing -> StatusChecking -> Eligible | Locked -> Building
//!           -> AwaitingSignature -> Broadcasting -> Complete
//! ```
//!
//! Any stage failure moves to `Failed{stage, error}`; `reset` always returns
//! to `Importing`. Two edges go backwards, both caller-initiated: a status
//! refresh from `Eligible`/`Locked`, and a rebuild from `AwaitingSignature`.
//!
//! The workflow owns the current instance of every entity. Producing a new
//! upstream entity drops everything derived from the old one.

use bitcoin::Txid;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use crate::aggregate::{aggregate, SpendableSet};
use crate::broadcast::{self, BroadcastCoordinator, BroadcastReceipt, FinalizedClaim};
use crate::builder::{self, ClaimRequest, UnsignedClaim};
use crate::descriptor::{self, VaultDescriptor};
use crate::eligibility::{evaluate, EligibilityResult};
use crate::error::{ClaimError, Stage, WorkflowError};
use crate::status::{ChainSnapshot, ChainStatusProvider};
use crate::vault_core::VaultCore;

/// Where the claim currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ClaimState {
    /// Waiting for a vault backup
    Importing,
    /// Vault imported; chain status requested or in flight
    StatusChecking,
    Eligible,
    /// Timelock has not expired yet
    Locked,
    Building,
    /// Unsigned claim handed out for signing
    AwaitingSignature,
    /// Signed and finalized; ready to submit
    Broadcasting,
    Complete,
    Failed { stage: Stage, error: ClaimError },
}

impl ClaimState {
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimState::Importing => "importing",
            ClaimState::StatusChecking => "status_checking",
            ClaimState::Eligible => "eligible",
            ClaimState::Locked => "locked",
            ClaimState::Building => "building",
            ClaimState::AwaitingSignature => "awaiting_signature",
            ClaimState::Broadcasting => "broadcasting",
            ClaimState::Complete => "complete",
            ClaimState::Failed { .. } => "failed",
        }
    }

    /// Short human-readable description.
    pub fn label(&self) -> String {
        match self {
            ClaimState::Importing => "waiting for vault backup".to_string(),
            ClaimState::StatusChecking => "checking chain status".to_string(),
            ClaimState::Eligible => "eligible to claim".to_string(),
            ClaimState::Locked => "timelock active".to_string(),
            ClaimState::Building => "building claim".to_string(),
            ClaimState::AwaitingSignature => "awaiting signature".to_string(),
            ClaimState::Broadcasting => "ready to broadcast".to_string(),
            ClaimState::Complete => "claim broadcast".to_string(),
            ClaimState::Failed { stage, error } => format!("{} failed: {}", stage, error),
        }
    }
}

/// Everything the workflow knows about the current claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub state: ClaimState,
    pub descriptor: Option<VaultDescriptor>,
    pub snapshot: Option<ChainSnapshot>,
    pub eligibility: Option<EligibilityResult>,
    pub spendable: Option<SpendableSet>,
    pub request: Option<ClaimRequest>,
    pub unsigned: Option<UnsignedClaim>,
    pub finalized: Option<FinalizedClaim>,
    pub receipt: Option<BroadcastReceipt>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ClaimState::Importing,
            descriptor: None,
            snapshot: None,
            eligibility: None,
            spendable: None,
            request: None,
            unsigned: None,
            finalized: None,
            receipt: None,
        }
    }

    /// Drop everything derived from chain status.
    fn clear_after_status(&mut self) {
        self.spendable = None;
        self.request = None;
        self.unsigned = None;
        self.clear_after_build();
    }

    fn clear_after_build(&mut self) {
        self.finalized = None;
        self.receipt = None;
    }
}

/// Flat read-only projection of a [`Session`] for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub state: &'static str,
    pub label: String,
    pub vault_address: Option<String>,
    pub timelock_blocks: Option<u16>,
    pub current_height: Option<u64>,
    pub unlock_height: Option<u64>,
    pub blocks_remaining: Option<u64>,
    pub time_estimate: Option<String>,
    pub spendable_sat: Option<u64>,
    pub fee_sat: Option<u64>,
    pub output_sat: Option<u64>,
    pub txid: Option<Txid>,
    pub error: Option<String>,
}

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        let error = match &s.state {
            ClaimState::Failed { error, .. } => Some(error.to_string()),
            _ => None,
        };
        Self {
            state: s.state.kind(),
            label: s.state.label(),
            vault_address: s.descriptor.as_ref().map(|d| d.vault_address.clone()),
            timelock_blocks: s.descriptor.as_ref().map(|d| d.timelock_blocks),
            current_height: s.eligibility.as_ref().map(|e| e.current_height),
            unlock_height: s.eligibility.as_ref().map(|e| e.unlock_height),
            blocks_remaining: s.eligibility.as_ref().map(|e| e.blocks_remaining),
            time_estimate: s.eligibility.as_ref().map(|e| e.time_estimate.to_string()),
            spendable_sat: s.spendable.as_ref().map(|set| set.total.to_sat()),
            fee_sat: s.unsigned.as_ref().map(|u| u.fee_sat),
            output_sat: s.unsigned.as_ref().map(|u| u.output_sat),
            txid: s.finalized.as_ref().map(|f| f.txid),
            error,
        }
    }
}

/// Identifies one status check. Results carrying an outdated ticket are
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTicket {
    epoch: u64,
    seq: u64,
}

struct InFlight {
    ticket: StatusTicket,
    prior: ClaimState,
}

/// One heir claim, from backup import to broadcast.
pub struct ClaimWorkflow {
    core: Arc<dyn VaultCore>,
    provider: ChainStatusProvider,
    coordinator: BroadcastCoordinator,
    max_fee_rate: u64,
    session: Session,
    epoch: u64,
    seq: u64,
    in_flight: Option<InFlight>,
    updates: watch::Sender<SessionView>,
}

impl ClaimWorkflow {
    pub fn new(core: Arc<dyn VaultCore>, provider: ChainStatusProvider, max_fee_rate: u64) -> Self {
        let coordinator =
            BroadcastCoordinator::new(Arc::clone(provider.source()), provider.settings().timeout);
        let session = Session::new();
        let (updates, _) = watch::channel(SessionView::from(&session));
        Self {
            core,
            provider,
            coordinator,
            max_fee_rate,
            session,
            epoch: 0,
            seq: 0,
            in_flight: None,
            updates,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> &ClaimState {
        &self.session.state
    }

    pub fn view(&self) -> SessionView {
        SessionView::from(&self.session)
    }

    /// Receive a fresh [`SessionView`] on every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.updates.subscribe()
    }

    fn publish(&self) {
        self.updates.send_replace(SessionView::from(&self.session));
    }

    fn enter(&mut self, state: ClaimState) {
        log::info!("claim workflow: {} -> {}", self.session.state.kind(), state.kind());
        self.session.state = state;
        self.publish();
    }

    fn fail(&mut self, stage: Stage, error: ClaimError) -> WorkflowError {
        log::error!("{} failed: {}", stage, error);
        self.enter(ClaimState::Failed {
            stage,
            error: error.clone(),
        });
        WorkflowError::Claim {
            stage,
            source: error,
        }
    }

    fn invalid(&self, action: Stage) -> WorkflowError {
        WorkflowError::InvalidTransition {
            state: self.session.state.kind().to_string(),
            action,
        }
    }

    /// Import a vault backup.
    pub fn import(&mut self, payload: &str) -> Result<&VaultDescriptor, WorkflowError> {
        if self.session.state != ClaimState::Importing {
            return Err(self.invalid(Stage::Import));
        }
        match descriptor::import(payload, self.core.as_ref()) {
            Ok(d) => {
                self.session.descriptor = Some(d);
                self.enter(ClaimState::StatusChecking);
                self.session
                    .descriptor
                    .as_ref()
                    .ok_or_else(|| self.invalid(Stage::Import))
            }
            Err(e) => Err(self.fail(Stage::Import, e)),
        }
    }

    fn status_allowed(&self) -> Result<(), WorkflowError> {
        if self.in_flight.is_some() {
            return Err(WorkflowError::StageInFlight(Stage::Status));
        }
        match self.session.state {
            ClaimState::StatusChecking | ClaimState::Eligible | ClaimState::Locked
                if self.session.descriptor.is_some() =>
            {
                Ok(())
            }
            _ => Err(self.invalid(Stage::Status)),
        }
    }

    /// Start a status check whose result will be delivered later through
    /// [`Self::complete_status_check`].
    pub fn begin_status_check(&mut self) -> Result<StatusTicket, WorkflowError> {
        self.status_allowed()?;
        self.seq += 1;
        let ticket = StatusTicket {
            epoch: self.epoch,
            seq: self.seq,
        };
        let prior = self.session.state.clone();
        self.in_flight = Some(InFlight { ticket, prior });
        self.enter(ClaimState::StatusChecking);
        Ok(ticket)
    }

    /// Apply the result of a status check.
    ///
    /// Returns [`WorkflowError::Superseded`] without touching the session if
    /// the check was cancelled or the workflow was reset since it began.
    pub fn complete_status_check(
        &mut self,
        ticket: StatusTicket,
        result: Result<ChainSnapshot, ClaimError>,
    ) -> Result<&EligibilityResult, WorkflowError> {
        match &self.in_flight {
            Some(f) if f.ticket == ticket => {}
            _ => {
                log::debug!("dropping stale status result {:?}", ticket);
                return Err(WorkflowError::Superseded);
            }
        }
        self.in_flight = None;

        let evaluated = result.and_then(|snapshot| match &self.session.descriptor {
            Some(d) => evaluate(d, &snapshot).map(|e| (snapshot, e)),
            None => Err(ClaimError::MalformedDescriptor("no vault imported".into())),
        });

        match evaluated {
            Ok((snapshot, eligibility)) => {
                let next = if eligibility.eligible {
                    ClaimState::Eligible
                } else {
                    ClaimState::Locked
                };
                self.session.snapshot = Some(snapshot);
                self.session.eligibility = Some(eligibility);
                self.session.clear_after_status();
                self.enter(next);
                self.session
                    .eligibility
                    .as_ref()
                    .ok_or(WorkflowError::Superseded)
            }
            Err(e) => Err(self.fail(Stage::Status, e)),
        }
    }

    /// Abandon the in-flight status check. Returns `false` if none was running.
    pub fn cancel_status_check(&mut self) -> bool {
        match self.in_flight.take() {
            Some(f) => {
                log::debug!("status check {:?} cancelled", f.ticket);
                self.enter(f.prior);
                true
            }
            None => false,
        }
    }

    /// Fetch chain status and evaluate eligibility.
    ///
    /// Nothing is applied until the fetch resolves, so dropping the future
    /// leaves the session as it was.
    pub async fn check_status(&mut self) -> Result<&EligibilityResult, WorkflowError> {
        self.status_allowed()?;
        let (network, address) = match &self.session.descriptor {
            Some(d) => (d.network, d.address().clone()),
            None => return Err(self.invalid(Stage::Status)),
        };
        let provider = self.provider.clone();

        let result = provider.fetch(network, &address).await;

        let ticket = self.begin_status_check()?;
        self.complete_status_check(ticket, result)
    }

    /// Build an unsigned claim. Allowed once eligible, and again while
    /// awaiting a signature to change the fee rate or destination.
    pub fn build_claim(&mut self, request: ClaimRequest) -> Result<&UnsignedClaim, WorkflowError> {
        if !matches!(
            self.session.state,
            ClaimState::Eligible | ClaimState::AwaitingSignature
        ) {
            return Err(self.invalid(Stage::Build));
        }
        let (descriptor, snapshot) = match (&self.session.descriptor, &self.session.snapshot) {
            (Some(d), Some(s)) => (d.clone(), s.clone()),
            _ => return Err(self.invalid(Stage::Build)),
        };

        self.session.unsigned = None;
        self.session.clear_after_build();
        self.enter(ClaimState::Building);

        let built = aggregate(&snapshot).and_then(|spendable| {
            builder::build(
                self.core.as_ref(),
                &descriptor,
                &spendable,
                &request,
                self.max_fee_rate,
            )
            .map(|claim| (spendable, claim))
        });

        match built {
            Ok((spendable, claim)) => {
                self.session.spendable = Some(spendable);
                self.session.request = Some(request);
                self.session.unsigned = Some(claim);
                self.enter(ClaimState::AwaitingSignature);
                self.session
                    .unsigned
                    .as_ref()
                    .ok_or_else(|| self.invalid(Stage::Build))
            }
            Err(e) => Err(self.fail(Stage::Build, e)),
        }
    }

    /// Finalize the heir's signed PSBT.
    pub fn finalize(&mut self, signed_payload: &str) -> Result<&FinalizedClaim, WorkflowError> {
        if self.session.state != ClaimState::AwaitingSignature {
            return Err(self.invalid(Stage::Finalize));
        }
        let unsigned = match &self.session.unsigned {
            Some(u) => u,
            None => return Err(self.invalid(Stage::Finalize)),
        };

        match broadcast::finalize(self.core.as_ref(), signed_payload, unsigned) {
            Ok(finalized) => {
                self.session.finalized = Some(finalized);
                self.enter(ClaimState::Broadcasting);
                self.session
                    .finalized
                    .as_ref()
                    .ok_or_else(|| self.invalid(Stage::Finalize))
            }
            Err(e) => Err(self.fail(Stage::Finalize, e)),
        }
    }

    /// Submit the finalized claim. Once complete, calling again returns the
    /// same receipt without resubmitting.
    pub async fn broadcast(&mut self) -> Result<BroadcastReceipt, WorkflowError> {
        if let (ClaimState::Complete, Some(receipt)) = (&self.session.state, &self.session.receipt)
        {
            return Ok(receipt.clone());
        }
        if self.session.state != ClaimState::Broadcasting {
            return Err(self.invalid(Stage::Broadcast));
        }
        let (network, finalized) = match (&self.session.descriptor, &self.session.finalized) {
            (Some(d), Some(f)) => (d.network, f.clone()),
            _ => return Err(self.invalid(Stage::Broadcast)),
        };
        let core = Arc::clone(&self.core);
        let coordinator = self.coordinator.clone();

        match coordinator.broadcast(core.as_ref(), network, &finalized).await {
            Ok(receipt) => {
                self.session.receipt = Some(receipt.clone());
                self.enter(ClaimState::Complete);
                Ok(receipt)
            }
            Err(e) => Err(self.fail(Stage::Broadcast, e)),
        }
    }

    /// Start over. Any status check still in flight is superseded.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.in_flight = None;
        self.session = Session::new();
        log::info!("claim workflow reset");
        self.publish();
    }
}
