//! Error types for the bridge engine

use serde::Serialize;
use thiserror::Error;

use crate::coordination::SagaPhase;

/// Main error type for the bridge engine
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("InputValidation: {0}")]
    InputValidation(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Source ledger RPC error: {0}")]
    SourceRpc(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("SignatureTimeout: no signature event for {request_id} within {timeout_ms}ms")]
    SignatureTimeout { request_id: String, timeout_ms: u64 },

    #[error("ReadResponseTimeout: no read response for {request_id} within {timeout_ms}ms")]
    ReadResponseTimeout { request_id: String, timeout_ms: u64 },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("TargetTxReverted: transaction {tx_hash} finished with status {status}")]
    TargetTxReverted { tx_hash: String, status: u64 },

    #[error("Invalid read response signature: recovered {recovered}, expected {expected}")]
    InvalidResponseSignature { recovered: String, expected: String },

    #[error("SourceCompletionRejected: {0}")]
    SourceCompletionRejected(String),

    #[error("AlreadyProcessed: {0}")]
    AlreadyProcessed(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Subscription for {request_id} was closed before the event arrived")]
    SubscriptionClosed { request_id: String },

    #[error("No deposit observed at {address} within {deadline_ms}ms")]
    NoDepositObserved { address: String, deadline_ms: u64 },

    #[error("Pending record already exists for {0}")]
    PendingRecordExists(String),

    #[error("Pending record not found for {0}")]
    PendingRecordNotFound(String),

    #[error("Insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u128, need: u128 },

    #[error("Balance overflow")]
    Overflow,

    #[error("Balance underflow")]
    Underflow,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used for metrics labels and caller branching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputValidation,
    SignatureTimeout,
    TargetTxReverted,
    ReadResponseTimeout,
    SourceCompletionRejected,
    AlreadyProcessed,
    Interrupted,
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InputValidation => "input_validation",
            ErrorKind::SignatureTimeout => "signature_timeout",
            ErrorKind::TargetTxReverted => "target_tx_reverted",
            ErrorKind::ReadResponseTimeout => "read_response_timeout",
            ErrorKind::SourceCompletionRejected => "source_completion_rejected",
            ErrorKind::AlreadyProcessed => "already_processed",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

impl BridgeError {
    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::InputValidation(_) => ErrorKind::InputValidation,
            BridgeError::SignatureTimeout { .. } => ErrorKind::SignatureTimeout,
            BridgeError::ReadResponseTimeout { .. } => ErrorKind::ReadResponseTimeout,
            BridgeError::TargetTxReverted { .. } => ErrorKind::TargetTxReverted,
            BridgeError::SourceCompletionRejected(_)
            | BridgeError::InvalidResponseSignature { .. }
            | BridgeError::InsufficientBalance { .. }
            | BridgeError::Overflow
            | BridgeError::Underflow => ErrorKind::SourceCompletionRejected,
            BridgeError::AlreadyProcessed(_) | BridgeError::PendingRecordNotFound(_) => {
                ErrorKind::AlreadyProcessed
            }
            BridgeError::Interrupted(_) | BridgeError::SubscriptionClosed { .. } => {
                ErrorKind::Interrupted
            }
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Check if error is retryable by re-running the whole saga
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::ChainConnection { .. }
                | BridgeError::SourceRpc(_)
                | BridgeError::Timeout { .. }
                | BridgeError::SignatureTimeout { .. }
                | BridgeError::ReadResponseTimeout { .. }
                | BridgeError::Interrupted(_)
                | BridgeError::SubscriptionClosed { .. }
        )
    }

    /// Completion outcomes that mean another actor already finished the saga
    pub fn is_benign(&self) -> bool {
        self.kind() == ErrorKind::AlreadyProcessed
    }
}

/// A failure tagged with the saga phase it happened in
#[derive(Error, Debug, Clone)]
#[error("{phase} failed: {cause}")]
pub struct SagaError {
    pub phase: SagaPhase,
    #[source]
    pub cause: BridgeError,
}

impl SagaError {
    pub fn new(phase: SagaPhase, cause: BridgeError) -> Self {
        Self { phase, cause }
    }

    pub fn kind(&self) -> ErrorKind {
        self.cause.kind()
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_error_carries_phase_and_kind() {
        let err = SagaError::new(
            SagaPhase::AwaitingSignature,
            BridgeError::SignatureTimeout {
                request_id: "0xab".to_string(),
                timeout_ms: 50,
            },
        );
        assert_eq!(err.kind(), ErrorKind::SignatureTimeout);
        let rendered = err.to_string();
        assert!(rendered.starts_with("awaiting_signature failed"));
        assert!(rendered.contains("SignatureTimeout"));
    }

    #[test]
    fn test_missing_pending_record_is_benign() {
        assert!(BridgeError::PendingRecordNotFound("0x01".into()).is_benign());
        assert!(!BridgeError::SourceCompletionRejected("replay".into()).is_benign());
    }

    #[test]
    fn test_timeouts_are_retryable_but_reverts_are_not() {
        assert!(BridgeError::ReadResponseTimeout {
            request_id: "0x01".into(),
            timeout_ms: 1
        }
        .is_retryable());
        assert!(!BridgeError::TargetTxReverted {
            tx_hash: "0x02".into(),
            status: 0
        }
        .is_retryable());
    }
}
