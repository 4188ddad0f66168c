//! Source-ledger account shapes

use crate::chain::TargetTxParams;
use crate::crypto::RequestId;
use crate::error::{BridgeError, BridgeResult};

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Textual (base58) identity of a source-ledger account
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-flight deposit marker, keyed by request id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDepositRecord {
    pub requester: Identity,
    pub amount: u128,
    pub token_address: Address,
    pub path: String,
    pub request_id: RequestId,
}

/// In-flight withdrawal marker; its existence implies the balance was already debited
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWithdrawalRecord {
    pub requester: Identity,
    pub amount: u128,
    pub token_address: Address,
    pub recipient_address: Address,
    pub request_id: RequestId,
}

/// Bridged balance of one user for one token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalanceRecord {
    pub amount: u128,
}

impl UserBalanceRecord {
    pub fn new(amount: u128) -> Self {
        Self { amount }
    }

    pub fn credit(&mut self, amount: u128) -> BridgeResult<()> {
        self.amount = self.amount.checked_add(amount).ok_or(BridgeError::Overflow)?;
        Ok(())
    }

    pub fn debit(&mut self, amount: u128) -> BridgeResult<()> {
        if amount > self.amount {
            return Err(BridgeError::InsufficientBalance {
                have: self.amount,
                need: amount,
            });
        }
        self.amount = self.amount.checked_sub(amount).ok_or(BridgeError::Underflow)?;
        Ok(())
    }
}

/// Arguments of the "initiate deposit" instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateDeposit {
    pub request_id: RequestId,
    pub requester: Identity,
    pub token_address: Address,
    pub amount: u128,
    /// Derivation path, which is the requester's identity for deposits
    pub path: String,
    pub tx_params: TargetTxParams,
}

/// Arguments of the "initiate withdraw" instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateWithdraw {
    pub request_id: RequestId,
    pub requester: Identity,
    pub token_address: Address,
    pub amount: u128,
    pub recipient_address: Address,
    pub tx_params: TargetTxParams,
}
