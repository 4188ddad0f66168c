//! Chain module - ledger collaborators the sagas talk to
//!
//! This module provides:
//! - `TargetLedger`: the account/receipt ledger tokens are bridged to, with an
//!   ethers-based implementation using multi-RPC failover
//! - `SourceLedger`: the bridge program's instructions and account reads
//! - `SignerLogSource`: historical signer-program events for backfill
//! - Target transaction construction (EIP-1559 ERC-20 transfers)

pub mod gateway;
pub mod target;
pub mod tx;

pub use gateway::RpcSourceGateway;
pub use target::EvmTargetLedger;
pub use tx::{erc20_transfer_tx, TargetTxBuilder, TargetTxParams, UnsignedTargetTx};

use crate::crypto::RequestId;
use crate::error::BridgeResult;
use crate::events::{ObservedEvent, ReadResponseEvent};
use crate::state::{
    Identity, InitiateDeposit, InitiateWithdraw, PendingDepositRecord, PendingWithdrawalRecord,
    UserBalanceRecord,
};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};

/// EIP-1559 fee pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Outcome of a mined target transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetReceipt {
    pub tx_hash: H256,
    /// 1 on success
    pub status: u64,
    pub block_number: u64,
}

impl TargetReceipt {
    pub fn succeeded(&self) -> bool {
        self.status == 1
    }
}

/// Ledger that receives the signed transfer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetLedger: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> BridgeResult<u64>;

    async fn transaction_count(&self, address: Address) -> BridgeResult<u64>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> BridgeResult<U256>;

    async fn fee_estimate(&self) -> BridgeResult<FeeEstimate>;

    async fn token_balance(&self, token: Address, owner: Address) -> BridgeResult<U256>;

    /// Submit a raw signed transaction and return its hash
    async fn broadcast(&self, raw_tx: Bytes) -> BridgeResult<H256>;

    /// Wait until the transaction is mined with `confirmations` blocks on top
    async fn wait_for_receipt(&self, tx_hash: H256, confirmations: u64) -> BridgeResult<TargetReceipt>;
}

/// Bridge program on the source ledger
#[async_trait]
pub trait SourceLedger: Send + Sync {
    /// Per-user vault authority that requests deposit signatures
    async fn vault_authority(&self, user: &Identity) -> BridgeResult<Identity>;

    /// Vault authority that requests withdrawal signatures
    async fn global_vault_authority(&self) -> BridgeResult<Identity>;

    /// Create the pending deposit record and request a signature
    async fn initiate_deposit(&self, args: &InitiateDeposit) -> BridgeResult<String>;

    /// Consume the pending deposit record and credit the user.
    /// Fails with `PendingRecordNotFound` if it was already claimed.
    async fn claim_deposit(&self, response: &ReadResponseEvent) -> BridgeResult<String>;

    /// Debit the user, create the pending withdrawal record and request a signature
    async fn initiate_withdraw(&self, args: &InitiateWithdraw) -> BridgeResult<String>;

    /// Consume the pending withdrawal record, refunding if the transfer failed
    async fn complete_withdraw(&self, response: &ReadResponseEvent) -> BridgeResult<String>;

    async fn user_balance(&self, user: &Identity, token: Address) -> BridgeResult<UserBalanceRecord>;

    async fn pending_deposit(&self, request_id: RequestId) -> BridgeResult<Option<PendingDepositRecord>>;

    async fn pending_withdrawal(
        &self,
        request_id: RequestId,
    ) -> BridgeResult<Option<PendingWithdrawalRecord>>;
}

/// Historical events of the signing program
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignerLogSource: Send + Sync {
    /// Events from the most recent `limit` signer-program transactions
    async fn recent_events(&self, limit: usize) -> BridgeResult<Vec<ObservedEvent>>;

    /// Events observed in slots strictly after `after_slot`, oldest first
    async fn events_since(&self, after_slot: u64, limit: usize) -> BridgeResult<Vec<ObservedEvent>>;

    async fn latest_slot(&self) -> BridgeResult<u64>;
}
