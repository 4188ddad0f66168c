//! Withdraw saga: debit on the source ledger first, transfer from the vault on
//! the target ledger, then finalize or refund from the read response.

use super::{conclude, perturb_amount, SagaContext, SagaOutcome};
use crate::chain::{TargetTxParams, UnsignedTargetTx};
use crate::coordination::{FlowOutput, SagaKind, SagaPhase, SagaStatus, StatusReporter};
use crate::crypto::{derive_address, RequestId, SignRequest, WITHDRAWAL_ROOT_PATH};
use crate::error::{BridgeError, BridgeResult, SagaError};
use crate::events::ReadResponseEvent;
use crate::state::{Identity, InitiateWithdraw};

use ethers::core::rand::thread_rng;
use ethers::types::{Address, U256};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

const KIND: SagaKind = SagaKind::Withdraw;

pub struct WithdrawSaga {
    ctx: Arc<SagaContext>,
}

impl WithdrawSaga {
    pub fn new(ctx: Arc<SagaContext>) -> Self {
        Self { ctx }
    }

    /// Target-ledger address withdrawals are paid from
    pub async fn vault_address(&self) -> BridgeResult<Address> {
        let authority = self.ctx.source.global_vault_authority().await?;
        derive_address(WITHDRAWAL_ROOT_PATH, &authority, &self.ctx.settings.base_public_key)
    }

    pub async fn run(
        &self,
        user: Identity,
        token: Address,
        amount: u128,
        recipient: Address,
        status: StatusReporter,
    ) -> SagaOutcome {
        crate::metrics::record_saga_started(KIND.label());
        status.emit(SagaStatus::Processing, None);
        info!(
            "[{}] starting for {}: {} of {:?} to {:?}",
            KIND.tag(),
            user,
            amount,
            token,
            recipient
        );

        let mut request_id = None;
        let mut bridged = None;
        let outcome = match self
            .bridge(&user, token, amount, recipient, &status, &mut request_id, &mut bridged)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => SagaOutcome::failed(KIND, request_id, bridged, &e),
        };
        conclude(outcome, &status)
    }

    #[allow(clippy::too_many_arguments)]
    async fn bridge(
        &self,
        user: &Identity,
        token: Address,
        amount: u128,
        recipient: Address,
        status: &StatusReporter,
        request_id_out: &mut Option<RequestId>,
        amount_out: &mut Option<u128>,
    ) -> Result<SagaOutcome, SagaError> {
        validate(amount, recipient).map_err(|e| SagaError::new(SagaPhase::Init, e))?;

        let authority = self
            .ctx
            .source
            .global_vault_authority()
            .await
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        let vault = derive_address(
            WITHDRAWAL_ROOT_PATH,
            &authority,
            &self.ctx.settings.base_public_key,
        )
        .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;

        let amount = perturb_amount(amount, self.ctx.settings.perturbation_max, &mut thread_rng());
        *amount_out = Some(amount);

        let tx = self
            .ctx
            .tx_builder
            .transfer(vault, token, recipient, U256::from(amount))
            .await
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        let request_id = SignRequest::ethereum(authority, tx.unsigned_bytes(), WITHDRAWAL_ROOT_PATH)
            .request_id()
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        *request_id_out = Some(request_id);
        info!("[{}] {} withdrawing {} as {}", KIND.tag(), user, amount, request_id);

        let args = InitiateWithdraw {
            request_id,
            requester: user.clone(),
            token_address: token,
            amount,
            recipient_address: recipient,
            tx_params: tx.params.clone(),
        };
        let source = self.ctx.source.clone();
        let initiate = async move { source.initiate_withdraw(&args).await };

        let flow = self
            .ctx
            .orchestrator
            .execute(KIND, request_id, &tx, Some(initiate), self.completer(), status)
            .await?;

        Ok(settled(Some(amount), &flow))
    }

    /// Carry a withdrawal the user initiated on the source ledger through the
    /// signature, target and completion phases.
    pub async fn process(
        &self,
        request_id: RequestId,
        token: Address,
        tx_params: TargetTxParams,
        status: StatusReporter,
    ) -> SagaOutcome {
        crate::metrics::record_saga_started(KIND.label());
        status.emit(SagaStatus::Processing, Some(request_id));
        info!("[{}] processing user-initiated {}", KIND.tag(), request_id);

        let mut amount = None;
        let outcome = match self
            .relay(request_id, token, tx_params, &status, &mut amount)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => SagaOutcome::failed(KIND, Some(request_id), amount, &e),
        };
        conclude(outcome, &status)
    }

    async fn relay(
        &self,
        request_id: RequestId,
        token: Address,
        tx_params: TargetTxParams,
        status: &StatusReporter,
        amount_out: &mut Option<u128>,
    ) -> Result<SagaOutcome, SagaError> {
        let preparing = |e| SagaError::new(SagaPhase::Preparing, e);

        let record = self
            .ctx
            .source
            .pending_withdrawal(request_id)
            .await
            .map_err(preparing)?
            .ok_or_else(|| {
                preparing(BridgeError::InputValidation(format!(
                    "No pending withdrawal for {}",
                    request_id
                )))
            })?;
        *amount_out = Some(record.amount);
        if record.token_address != token {
            return Err(preparing(BridgeError::InputValidation(format!(
                "Withdrawal {} is for token {:?}, not {:?}",
                request_id, record.token_address, token
            ))));
        }

        let authority = self
            .ctx
            .source
            .global_vault_authority()
            .await
            .map_err(preparing)?;
        let vault = derive_address(
            WITHDRAWAL_ROOT_PATH,
            &authority,
            &self.ctx.settings.base_public_key,
        )
        .map_err(preparing)?;

        let tx = UnsignedTargetTx::new(
            vault,
            token,
            record.recipient_address,
            U256::from(record.amount),
            tx_params,
        );
        let expected = SignRequest::ethereum(authority, tx.unsigned_bytes(), WITHDRAWAL_ROOT_PATH)
            .request_id()
            .map_err(preparing)?;
        if expected != request_id {
            return Err(preparing(BridgeError::InputValidation(format!(
                "Transaction parameters do not rebuild withdrawal {} ({})",
                request_id, expected
            ))));
        }

        let flow = self
            .ctx
            .orchestrator
            .execute(
                KIND,
                request_id,
                &tx,
                None::<BoxFuture<'static, BridgeResult<String>>>,
                self.completer(),
                status,
            )
            .await?;

        Ok(settled(Some(record.amount), &flow))
    }

    /// Re-drive only the completion of an interrupted withdrawal
    pub async fn complete(&self, request_id: RequestId, status: StatusReporter) -> SagaOutcome {
        crate::metrics::record_saga_started(KIND.label());
        status.emit(SagaStatus::Processing, Some(request_id));

        let record = match self.ctx.source.pending_withdrawal(request_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!("[{}] {} has no pending record", KIND.tag(), request_id);
                return conclude(SagaOutcome::already_processed(KIND, request_id), &status);
            }
            Err(e) => {
                let error = SagaError::new(SagaPhase::Preparing, e);
                return conclude(SagaOutcome::failed(KIND, Some(request_id), None, &error), &status);
            }
        };

        let outcome = match self
            .ctx
            .orchestrator
            .resume(KIND, request_id, self.completer(), &status)
            .await
        {
            Ok(flow) => settled(Some(record.amount), &flow),
            Err(e) => SagaOutcome::failed(KIND, Some(request_id), Some(record.amount), &e),
        };
        conclude(outcome, &status)
    }

    fn completer(&self) -> impl FnOnce(ReadResponseEvent) -> BoxFuture<'static, BridgeResult<String>> + Send {
        let source = self.ctx.source.clone();
        move |response: ReadResponseEvent| {
            Box::pin(async move { source.complete_withdraw(&response).await })
                as BoxFuture<'static, BridgeResult<String>>
        }
    }
}

fn validate(amount: u128, recipient: Address) -> BridgeResult<()> {
    if amount == 0 {
        return Err(BridgeError::InputValidation(
            "Withdrawal amount must be positive".to_string(),
        ));
    }
    if recipient.is_zero() {
        return Err(BridgeError::InputValidation(
            "Withdrawal recipient must not be the zero address".to_string(),
        ));
    }
    Ok(())
}

/// A failure payload means the source ledger refunded the debit
fn settled(amount: Option<u128>, flow: &FlowOutput) -> SagaOutcome {
    let mut outcome = SagaOutcome::completed(KIND, amount, flow);
    outcome.refunded = flow.read_response.output().indicates_failure();
    if outcome.refunded {
        info!("[{}] {} refunded after failed transfer", KIND.tag(), flow.request_id);
    }
    outcome
}
