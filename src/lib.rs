//! Cross-chain signature orchestration engine
//!
//! Bridges tokens between a source ledger and an EVM target ledger by routing
//! every transfer through a threshold-signing service. The engine derives the
//! request id and signing address, correlates the service's signature and
//! read-response events, broadcasts the signed transfer and completes the
//! pending record on the source ledger.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod crypto;
pub mod error;
pub mod events;
pub mod metrics;
pub mod saga;
pub mod state;

pub use coordination::{CrossChainOrchestrator, SagaKind, SagaPhase, SagaStatus, StatusReporter};
pub use crypto::{compute_request_id, derive_address, RequestId};
pub use error::{BridgeError, BridgeResult, SagaError};
pub use events::EventSubscriptionBroker;
pub use saga::{DepositSaga, SagaOutcome, WithdrawSaga};
