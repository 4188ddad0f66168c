//! Deposit and withdraw sagas
//!
//! Each saga resolves the vault authority that signs for it, derives the
//! target address, builds the transfer and hands the rest to the
//! `CrossChainOrchestrator`. Outcomes are reported as a `SagaOutcome` rather
//! than an error so callers always get the request id and failed phase.

pub mod deposit;
pub mod monitor;
pub mod withdraw;

pub use deposit::DepositSaga;
pub use monitor::{wait_for_balance, MonitorSchedule};
pub use withdraw::WithdrawSaga;

use crate::chain::{SourceLedger, TargetLedger, TargetTxBuilder};
use crate::coordination::{
    CrossChainOrchestrator, FlowOutput, SagaKind, SagaPhase, SagaStatus, StatusReporter,
};
use crate::crypto::RequestId;
use crate::error::{ErrorKind, SagaError};

use ethers::core::rand::Rng;
use ethers::types::{Address, H256};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Static inputs shared by every saga run
#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// Uncompressed or compressed SEC1 hex of the signing network's root key
    pub base_public_key: String,
    /// Target-ledger vault that receives deposits
    pub vault_address: Address,
    /// Upper bound of the random reduction applied to transfer amounts (0 disables)
    pub perturbation_max: u128,
    /// Delay before deposit balance monitoring starts
    pub deposit_initial_delay: Duration,
    pub deposit_monitor: MonitorSchedule,
}

/// Collaborators the sagas run against
pub struct SagaContext {
    pub source: Arc<dyn SourceLedger>,
    pub target: Arc<dyn TargetLedger>,
    pub orchestrator: Arc<CrossChainOrchestrator>,
    pub tx_builder: TargetTxBuilder,
    pub settings: SagaSettings,
}

impl SagaContext {
    pub fn new(
        source: Arc<dyn SourceLedger>,
        target: Arc<dyn TargetLedger>,
        orchestrator: Arc<CrossChainOrchestrator>,
        gas_limit_buffer_percent: u64,
        settings: SagaSettings,
    ) -> Self {
        let tx_builder = TargetTxBuilder::new(target.clone(), gas_limit_buffer_percent);
        Self {
            source,
            target,
            orchestrator,
            tx_builder,
            settings,
        }
    }
}

/// Final result handed to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaOutcome {
    pub kind: SagaKind,
    pub success: bool,
    pub request_id: Option<RequestId>,
    pub target_tx_hash: Option<H256>,
    pub source_tx: Option<String>,
    /// Amount actually bridged, after perturbation
    pub amount: Option<u128>,
    /// Withdrawal whose debit was returned because the transfer failed
    pub refunded: bool,
    pub already_processed: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub failed_phase: Option<SagaPhase>,
}

impl SagaOutcome {
    fn completed(kind: SagaKind, amount: Option<u128>, flow: &FlowOutput) -> Self {
        Self {
            kind,
            success: true,
            request_id: Some(flow.request_id),
            target_tx_hash: flow.target_tx_hash,
            source_tx: flow.completion.source_tx().map(str::to_string),
            amount,
            refunded: false,
            already_processed: flow.completion.source_tx().is_none(),
            error: None,
            error_kind: None,
            failed_phase: None,
        }
    }

    fn already_processed(kind: SagaKind, request_id: RequestId) -> Self {
        Self {
            kind,
            success: true,
            request_id: Some(request_id),
            target_tx_hash: None,
            source_tx: None,
            amount: None,
            refunded: false,
            already_processed: true,
            error: None,
            error_kind: None,
            failed_phase: None,
        }
    }

    fn failed(
        kind: SagaKind,
        request_id: Option<RequestId>,
        amount: Option<u128>,
        error: &SagaError,
    ) -> Self {
        Self {
            kind,
            success: false,
            request_id,
            target_tx_hash: None,
            source_tx: None,
            amount,
            refunded: false,
            already_processed: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            failed_phase: Some(error.phase),
        }
    }
}

/// Reduce `amount` by a random 1..=max so repeated transfers of the same
/// amount produce distinct request ids. Small amounts draw from 1..amount so
/// at least one base unit is always bridged; an amount of 1 cannot move.
pub fn perturb_amount<R: Rng + ?Sized>(amount: u128, max: u128, rng: &mut R) -> u128 {
    if max == 0 || amount <= 1 {
        return amount;
    }
    amount - rng.gen_range(1..=max.min(amount - 1))
}

/// Log, count and report the end of a saga
pub(crate) fn conclude(outcome: SagaOutcome, status: &StatusReporter) -> SagaOutcome {
    let kind = outcome.kind;
    if outcome.success {
        info!(
            "[{}] {} completed (already processed: {}, refunded: {})",
            kind.tag(),
            outcome
                .request_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
            outcome.already_processed,
            outcome.refunded
        );
        crate::metrics::record_saga_completed(kind.label());
        status.emit(SagaStatus::Completed, outcome.request_id);
    } else {
        let error_kind = outcome.error_kind.unwrap_or(ErrorKind::Infrastructure);
        error!(
            "[{}] saga failed: {}",
            kind.tag(),
            outcome.error.as_deref().unwrap_or("unknown error")
        );
        crate::metrics::record_saga_failed(kind.label(), error_kind.as_str());
        status.emit_with(SagaStatus::Failed, outcome.request_id, outcome.error.clone());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use ethers::core::rand::rngs::StdRng;
    use ethers::core::rand::SeedableRng;

    #[test]
    fn test_perturbation_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let perturbed = perturb_amount(1_000_000, 100, &mut rng);
            assert!((999_900..1_000_000).contains(&perturbed));
        }
    }

    #[test]
    fn test_unit_amount_and_disabled_perturbation_are_untouched() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(perturb_amount(1, 100, &mut rng), 1);
        assert_eq!(perturb_amount(500, 0, &mut rng), 500);
    }

    #[test]
    fn test_amounts_below_max_are_still_perturbed() {
        let mut rng = StdRng::seed_from_u64(11);
        let seen: std::collections::HashSet<u128> =
            (0..100).map(|_| perturb_amount(50, 100, &mut rng)).collect();
        assert!(seen.iter().all(|amount| (1..50).contains(amount)));
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_failed_outcome_carries_phase_and_kind() {
        let error = SagaError::new(
            SagaPhase::AwaitingSignature,
            BridgeError::SignatureTimeout {
                request_id: "0x01".to_string(),
                timeout_ms: 10,
            },
        );
        let outcome = SagaOutcome::failed(SagaKind::Deposit, None, Some(5), &error);
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("SignatureTimeout"));
        assert_eq!(outcome.error_kind, Some(ErrorKind::SignatureTimeout));

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["failedPhase"], "awaiting_signature");
        assert_eq!(json["errorKind"], "signature_timeout");
    }
}
