//! Target transaction construction
//!
//! Every bridged transfer is an EIP-1559 call to the token's ERC-20
//! `transfer(to, amount)`. The unsigned encoding feeds the request id, the
//! source program rebuilds it from `TargetTxParams`, and the signing service
//! signs its sighash, so all three must agree byte for byte.

use super::TargetLedger;
use crate::error::{BridgeError, BridgeResult};
use crate::events::MpcSignature;

use ethers::abi::AbiEncode;
use ethers::contract::abigen;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

abigen!(
    IERC20,
    r#"[
        function transfer(address to, uint256 amount) external returns (bool)
        function balanceOf(address account) external view returns (uint256)
    ]"#
);

/// Everything besides token, recipient and amount needed to rebuild the transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetTxParams {
    pub chain_id: u64,
    pub nonce: u64,
    pub gas_limit: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub value: U256,
}

pub fn transfer_calldata(recipient: Address, amount: U256) -> Bytes {
    TransferCall {
        to: recipient,
        amount,
    }
    .encode()
    .into()
}

/// Unsigned EIP-1559 `token.transfer(recipient, amount)`
pub fn erc20_transfer_tx(
    token: Address,
    recipient: Address,
    amount: U256,
    params: &TargetTxParams,
) -> TypedTransaction {
    Eip1559TransactionRequest::new()
        .to(token)
        .value(params.value)
        .data(transfer_calldata(recipient, amount))
        .nonce(params.nonce)
        .gas(params.gas_limit)
        .max_fee_per_gas(params.max_fee_per_gas)
        .max_priority_fee_per_gas(params.max_priority_fee_per_gas)
        .chain_id(params.chain_id)
        .into()
}

/// A transfer ready to be signed by the derived key of `from`
#[derive(Debug, Clone)]
pub struct UnsignedTargetTx {
    pub from: Address,
    pub token: Address,
    pub recipient: Address,
    pub amount: U256,
    pub params: TargetTxParams,
    tx: TypedTransaction,
}

impl UnsignedTargetTx {
    pub fn new(
        from: Address,
        token: Address,
        recipient: Address,
        amount: U256,
        params: TargetTxParams,
    ) -> Self {
        let tx = erc20_transfer_tx(token, recipient, amount, &params);
        Self {
            from,
            token,
            recipient,
            amount,
            params,
            tx,
        }
    }

    pub fn typed(&self) -> &TypedTransaction {
        &self.tx
    }

    /// Type-prefixed RLP of the unsigned transaction
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        self.tx.rlp().to_vec()
    }

    /// Digest the signing service signs
    pub fn sighash(&self) -> H256 {
        self.tx.sighash()
    }

    /// Attach the signature, checking it recovers to `from`
    pub fn signed_bytes(&self, signature: &MpcSignature) -> BridgeResult<Bytes> {
        let recovered = signature.recover(self.sighash())?;
        if recovered != self.from {
            return Err(BridgeError::Crypto(format!(
                "Signature recovers to {:?}, expected {:?}",
                recovered, self.from
            )));
        }
        Ok(self.tx.rlp_signed(&signature.to_ethers()))
    }
}

/// Fills nonce, gas and fees for a transfer from the target ledger
pub struct TargetTxBuilder {
    target: Arc<dyn TargetLedger>,
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
}

impl TargetTxBuilder {
    pub fn new(target: Arc<dyn TargetLedger>, gas_limit_buffer_percent: u64) -> Self {
        Self {
            target,
            gas_limit_buffer_percent,
        }
    }

    pub fn buffered_gas_limit(&self, estimate: U256) -> U256 {
        estimate * U256::from(100 + self.gas_limit_buffer_percent) / U256::from(100)
    }

    pub async fn transfer(
        &self,
        from: Address,
        token: Address,
        recipient: Address,
        amount: U256,
    ) -> BridgeResult<UnsignedTargetTx> {
        let nonce = self.target.transaction_count(from).await?;
        let fees = self.target.fee_estimate().await?;

        let probe: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(token)
            .data(transfer_calldata(recipient, amount))
            .into();
        let estimate = self.target.estimate_gas(&probe).await?;
        let gas_limit = self.buffered_gas_limit(estimate);

        let params = TargetTxParams {
            chain_id: self.target.chain_id(),
            nonce,
            gas_limit,
            max_fee_per_gas: fees.max_fee_per_gas,
            max_priority_fee_per_gas: fees.max_priority_fee_per_gas,
            value: U256::zero(),
        };
        debug!(
            "Prepared transfer from {:?}: nonce {}, gas {} (estimate {})",
            from, nonce, gas_limit, estimate
        );

        Ok(UnsignedTargetTx::new(from, token, recipient, amount, params))
    }
}
