//! Coordination of one cross-chain signature flow
//!
//! The orchestrator:
//! 1. Subscribes to the request's signer events before anything triggers them
//! 2. Runs the source-ledger instruction that asks for a signature
//! 3. Bridges the signature to the target ledger and waits for the receipt
//! 4. Hands the read response to the saga's completion instruction

pub mod orchestrator;

pub use orchestrator::{Completion, CrossChainOrchestrator, FlowOutput, OrchestratorConfig};

use crate::crypto::RequestId;
use crate::error::BridgeError;

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The two saga shapes the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaKind {
    Deposit,
    Withdraw,
}

impl SagaKind {
    /// Metrics label
    pub fn label(&self) -> &'static str {
        match self {
            SagaKind::Deposit => "deposit",
            SagaKind::Withdraw => "withdraw",
        }
    }

    /// Log prefix
    pub fn tag(&self) -> &'static str {
        match self {
            SagaKind::Deposit => "DEPOSIT",
            SagaKind::Withdraw => "WITHDRAW",
        }
    }
}

impl FromStr for SagaKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(SagaKind::Deposit),
            "withdraw" => Ok(SagaKind::Withdraw),
            other => Err(BridgeError::InputValidation(format!("Unknown saga kind: {}", other))),
        }
    }
}

/// Phase of the orchestration state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPhase {
    Init,
    Preparing,
    MonitoringBalance,
    AwaitingSourceInit,
    AwaitingSignature,
    SubmittingTarget,
    ConfirmingTarget,
    AwaitingReadResponse,
    CompletingSource,
    Completed,
    Failed,
}

impl SagaPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaPhase::Init => "init",
            SagaPhase::Preparing => "preparing",
            SagaPhase::MonitoringBalance => "monitoring_balance",
            SagaPhase::AwaitingSourceInit => "awaiting_source_init",
            SagaPhase::AwaitingSignature => "awaiting_signature",
            SagaPhase::SubmittingTarget => "submitting_target",
            SagaPhase::ConfirmingTarget => "confirming_target",
            SagaPhase::AwaitingReadResponse => "awaiting_read_response",
            SagaPhase::CompletingSource => "completing_source",
            SagaPhase::Completed => "completed",
            SagaPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for SagaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse status reported to callers at each phase transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Processing,
    WaitingSignature,
    SubmittingTarget,
    ConfirmingTarget,
    WaitingReadResponse,
    Completing,
    Completed,
    Failed,
    Interrupted,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Processing => "processing",
            SagaStatus::WaitingSignature => "waiting_signature",
            SagaStatus::SubmittingTarget => "submitting_target",
            SagaStatus::ConfirmingTarget => "confirming_target",
            SagaStatus::WaitingReadResponse => "waiting_read_response",
            SagaStatus::Completing => "completing",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: SagaStatus,
    pub request_id: Option<RequestId>,
    pub detail: Option<String>,
}

pub type StatusCallback = Arc<dyn Fn(StatusUpdate) + Send + Sync>;

/// Optional status callback, cheap to clone into guards and tasks
#[derive(Clone, Default)]
pub struct StatusReporter {
    callback: Option<StatusCallback>,
}

impl StatusReporter {
    pub fn new(callback: Option<StatusCallback>) -> Self {
        Self { callback }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, status: SagaStatus, request_id: Option<RequestId>) {
        self.emit_with(status, request_id, None);
    }

    pub fn emit_with(&self, status: SagaStatus, request_id: Option<RequestId>, detail: Option<String>) {
        if let Some(callback) = &self.callback {
            callback(StatusUpdate {
                status,
                request_id,
                detail,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_phase_display_is_snake_case() {
        assert_eq!(SagaPhase::AwaitingReadResponse.to_string(), "awaiting_read_response");
        assert_eq!(
            serde_json::to_string(&SagaStatus::WaitingSignature).unwrap(),
            "\"waiting_signature\""
        );
    }

    #[test]
    fn test_saga_kind_parsing() {
        assert_eq!("withdraw".parse::<SagaKind>().unwrap(), SagaKind::Withdraw);
        assert!("swap".parse::<SagaKind>().is_err());
        assert_eq!(SagaKind::Deposit.tag(), "DEPOSIT");
    }

    #[test]
    fn test_reporter_forwards_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = StatusReporter::new(Some(Arc::new(move |update: StatusUpdate| {
            sink.lock().unwrap().push(update.status);
        })));

        reporter.emit(SagaStatus::Processing, None);
        reporter.emit(SagaStatus::Completed, Some(RequestId([0u8; 32])));
        StatusReporter::silent().emit(SagaStatus::Failed, None);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![SagaStatus::Processing, SagaStatus::Completed]
        );
    }
}
