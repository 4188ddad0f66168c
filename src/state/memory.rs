//! In-memory source ledger
//!
//! Applies the same account rules as the on-ledger bridge program: one pending
//! record per request id, request ids recomputed from the submitted target
//! transaction parameters, optimistic debit on withdraw and refund when the
//! read response reports a failed transfer. Used for local dry runs and tests.

use crate::chain::{erc20_transfer_tx, SourceLedger, TargetTxParams};
use crate::crypto::{RequestId, SignRequest, WITHDRAWAL_ROOT_PATH};
use crate::error::{BridgeError, BridgeResult};
use crate::events::ReadResponseEvent;

use super::{
    Identity, InitiateDeposit, InitiateWithdraw, PendingDepositRecord, PendingWithdrawalRecord,
    UserBalanceRecord,
};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Instruction log entry, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    InitiateDeposit(RequestId),
    ClaimDeposit(RequestId),
    InitiateWithdraw(RequestId),
    CompleteWithdraw(RequestId),
}

#[derive(Default)]
struct LedgerState {
    deposits: HashMap<RequestId, PendingDepositRecord>,
    withdrawals: HashMap<RequestId, PendingWithdrawalRecord>,
    balances: HashMap<(Identity, Address), UserBalanceRecord>,
    history: Vec<LedgerCall>,
    next_signature: u64,
}

impl LedgerState {
    fn signature(&mut self) -> String {
        self.next_signature += 1;
        format!("memtx{:08}", self.next_signature)
    }

    fn balance_mut(&mut self, user: &Identity, token: Address) -> &mut UserBalanceRecord {
        self.balances.entry((user.clone(), token)).or_default()
    }
}

pub struct MemorySourceLedger {
    global_vault: Identity,
    /// Target-ledger address that receives deposited tokens
    vault_address: Address,
    /// When set, read responses must be signed by this address
    responder: Option<Address>,
    state: RwLock<LedgerState>,
}

impl MemorySourceLedger {
    pub fn new(global_vault: Identity, vault_address: Address) -> Self {
        Self {
            global_vault,
            vault_address,
            responder: None,
            state: RwLock::new(LedgerState::default()),
        }
    }

    pub fn with_responder(mut self, responder: Address) -> Self {
        self.responder = Some(responder);
        self
    }

    /// Set a user's bridged balance directly
    pub async fn set_balance(&self, user: &Identity, token: Address, amount: u128) {
        let mut state = self.state.write().await;
        *state.balance_mut(user, token) = UserBalanceRecord::new(amount);
    }

    pub async fn history(&self) -> Vec<LedgerCall> {
        self.state.read().await.history.clone()
    }

    fn user_vault_authority(&self, user: &Identity) -> Identity {
        Identity::new(format!("vault-authority:{}", user))
    }

    fn expected_request_id(
        &self,
        sender: &Identity,
        token: Address,
        recipient: Address,
        amount: u128,
        params: &TargetTxParams,
        path: &str,
    ) -> BridgeResult<RequestId> {
        if params.chain_id == 0 {
            return Err(BridgeError::InputValidation(
                "Target transaction parameters carry no chain id".to_string(),
            ));
        }
        let tx = erc20_transfer_tx(token, recipient, U256::from(amount), params);
        SignRequest::ethereum(sender.clone(), tx.rlp().to_vec(), path).request_id()
    }

    fn verify_response(&self, response: &ReadResponseEvent) -> BridgeResult<()> {
        if let Some(expected) = self.responder {
            let recovered = response.recover_signer()?;
            if recovered != expected {
                return Err(BridgeError::InvalidResponseSignature {
                    recovered: format!("{:?}", recovered),
                    expected: format!("{:?}", expected),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceLedger for MemorySourceLedger {
    async fn vault_authority(&self, user: &Identity) -> BridgeResult<Identity> {
        Ok(self.user_vault_authority(user))
    }

    async fn global_vault_authority(&self) -> BridgeResult<Identity> {
        Ok(self.global_vault.clone())
    }

    async fn initiate_deposit(&self, args: &InitiateDeposit) -> BridgeResult<String> {
        let sender = self.user_vault_authority(&args.requester);
        let expected = self.expected_request_id(
            &sender,
            args.token_address,
            self.vault_address,
            args.amount,
            &args.tx_params,
            &args.path,
        )?;
        if expected != args.request_id {
            return Err(BridgeError::InputValidation(format!(
                "Request id {} does not match deposit parameters ({})",
                args.request_id, expected
            )));
        }

        let mut state = self.state.write().await;
        state.history.push(LedgerCall::InitiateDeposit(args.request_id));
        if state.deposits.contains_key(&args.request_id) {
            return Err(BridgeError::PendingRecordExists(args.request_id.to_hex()));
        }

        state.deposits.insert(
            args.request_id,
            PendingDepositRecord {
                requester: args.requester.clone(),
                amount: args.amount,
                token_address: args.token_address,
                path: args.path.clone(),
                request_id: args.request_id,
            },
        );
        debug!("Pending deposit {} created for {}", args.request_id, args.requester);
        Ok(state.signature())
    }

    async fn claim_deposit(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        let mut state = self.state.write().await;
        state.history.push(LedgerCall::ClaimDeposit(response.request_id));

        let record = state
            .deposits
            .get(&response.request_id)
            .cloned()
            .ok_or_else(|| BridgeError::PendingRecordNotFound(response.request_id.to_hex()))?;

        self.verify_response(response)?;
        if response.output().indicates_failure() {
            warn!("Deposit {} rejected: transfer reported failure", response.request_id);
            return Err(BridgeError::SourceCompletionRejected(format!(
                "Transfer for {} did not succeed on the target ledger",
                response.request_id
            )));
        }

        state
            .balance_mut(&record.requester, record.token_address)
            .credit(record.amount)?;
        state.deposits.remove(&response.request_id);

        info!(
            "Deposit {} claimed: {} credited to {}",
            response.request_id, record.amount, record.requester
        );
        Ok(state.signature())
    }

    async fn initiate_withdraw(&self, args: &InitiateWithdraw) -> BridgeResult<String> {
        let expected = self.expected_request_id(
            &self.global_vault,
            args.token_address,
            args.recipient_address,
            args.amount,
            &args.tx_params,
            WITHDRAWAL_ROOT_PATH,
        )?;
        if expected != args.request_id {
            return Err(BridgeError::InputValidation(format!(
                "Request id {} does not match withdrawal parameters ({})",
                args.request_id, expected
            )));
        }

        let mut state = self.state.write().await;
        state.history.push(LedgerCall::InitiateWithdraw(args.request_id));
        if state.withdrawals.contains_key(&args.request_id) {
            return Err(BridgeError::PendingRecordExists(args.request_id.to_hex()));
        }

        state
            .balance_mut(&args.requester, args.token_address)
            .debit(args.amount)?;
        state.withdrawals.insert(
            args.request_id,
            PendingWithdrawalRecord {
                requester: args.requester.clone(),
                amount: args.amount,
                token_address: args.token_address,
                recipient_address: args.recipient_address,
                request_id: args.request_id,
            },
        );
        debug!(
            "Pending withdrawal {} created, {} debited from {}",
            args.request_id, args.amount, args.requester
        );
        Ok(state.signature())
    }

    async fn complete_withdraw(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        let mut state = self.state.write().await;
        state.history.push(LedgerCall::CompleteWithdraw(response.request_id));

        let record = state
            .withdrawals
            .get(&response.request_id)
            .cloned()
            .ok_or_else(|| BridgeError::PendingRecordNotFound(response.request_id.to_hex()))?;

        self.verify_response(response)?;
        let output = response.output();
        if output.indicates_failure() {
            state
                .balance_mut(&record.requester, record.token_address)
                .credit(record.amount)?;
            info!(
                "Withdrawal {} refunded {} to {} ({:?})",
                response.request_id, record.amount, record.requester, output
            );
        } else {
            info!("Withdrawal {} finalized", response.request_id);
        }
        state.withdrawals.remove(&response.request_id);
        Ok(state.signature())
    }

    async fn user_balance(&self, user: &Identity, token: Address) -> BridgeResult<UserBalanceRecord> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .get(&(user.clone(), token))
            .copied()
            .unwrap_or_default())
    }

    async fn pending_deposit(&self, request_id: RequestId) -> BridgeResult<Option<PendingDepositRecord>> {
        Ok(self.state.read().await.deposits.get(&request_id).cloned())
    }

    async fn pending_withdrawal(
        &self,
        request_id: RequestId,
    ) -> BridgeResult<Option<PendingWithdrawalRecord>> {
        Ok(self.state.read().await.withdrawals.get(&request_id).cloned())
    }
}
