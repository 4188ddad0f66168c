//! Deposit saga: target-ledger tokens sent to a user's derived address are
//! swept into the vault and credited on the source ledger.

use super::{conclude, perturb_amount, wait_for_balance, SagaContext, SagaOutcome};
use crate::coordination::{SagaKind, SagaPhase, SagaStatus, StatusReporter};
use crate::crypto::{derive_address, RequestId, SignRequest};
use crate::error::{BridgeError, BridgeResult, SagaError};
use crate::events::ReadResponseEvent;
use crate::state::{Identity, InitiateDeposit};

use ethers::core::rand::thread_rng;
use ethers::types::{Address, U256};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::info;

const KIND: SagaKind = SagaKind::Deposit;

pub struct DepositSaga {
    ctx: Arc<SagaContext>,
}

impl DepositSaga {
    pub fn new(ctx: Arc<SagaContext>) -> Self {
        Self { ctx }
    }

    /// Target-ledger address a user deposits to
    pub async fn deposit_address(&self, user: &Identity) -> BridgeResult<Address> {
        let authority = self.ctx.source.vault_authority(user).await?;
        derive_address(user.as_str(), &authority, &self.ctx.settings.base_public_key)
    }

    /// Wait for a deposit at the user's derived address and bridge it
    pub async fn run(&self, user: Identity, token: Address, status: StatusReporter) -> SagaOutcome {
        crate::metrics::record_saga_started(KIND.label());
        status.emit(SagaStatus::Processing, None);
        info!("[{}] starting for {} token {:?}", KIND.tag(), user, token);

        let mut request_id = None;
        let mut amount = None;
        let outcome = match self.bridge(&user, token, &status, &mut request_id, &mut amount).await {
            Ok(outcome) => outcome,
            Err(e) => SagaOutcome::failed(KIND, request_id, amount, &e),
        };
        conclude(outcome, &status)
    }

    async fn bridge(
        &self,
        user: &Identity,
        token: Address,
        status: &StatusReporter,
        request_id_out: &mut Option<RequestId>,
        amount_out: &mut Option<u128>,
    ) -> Result<SagaOutcome, SagaError> {
        let settings = &self.ctx.settings;
        let path = user.as_str().to_string();

        let authority = self
            .ctx
            .source
            .vault_authority(user)
            .await
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        let deposit_address = derive_address(&path, &authority, &settings.base_public_key)
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        info!("[{}] {} deposits at {:?}", KIND.tag(), user, deposit_address);

        if !settings.deposit_initial_delay.is_zero() {
            tokio::time::sleep(settings.deposit_initial_delay).await;
        }

        let balance = wait_for_balance(
            self.ctx.target.as_ref(),
            token,
            deposit_address,
            settings.deposit_monitor,
        )
        .await
        .map_err(|e| SagaError::new(SagaPhase::MonitoringBalance, e))?;
        let observed = to_u128(balance).map_err(|e| SagaError::new(SagaPhase::MonitoringBalance, e))?;

        let amount = perturb_amount(observed, settings.perturbation_max, &mut thread_rng());
        *amount_out = Some(amount);

        let tx = self
            .ctx
            .tx_builder
            .transfer(deposit_address, token, settings.vault_address, U256::from(amount))
            .await
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        let request_id = SignRequest::ethereum(authority, tx.unsigned_bytes(), path.clone())
            .request_id()
            .map_err(|e| SagaError::new(SagaPhase::Preparing, e))?;
        *request_id_out = Some(request_id);
        info!(
            "[{}] {} bridging {} (observed {}) as {}",
            KIND.tag(),
            user,
            amount,
            observed,
            request_id
        );

        let args = InitiateDeposit {
            request_id,
            requester: user.clone(),
            token_address: token,
            amount,
            path,
            tx_params: tx.params.clone(),
        };
        let source = self.ctx.source.clone();
        let initiate = async move { source.initiate_deposit(&args).await };

        let flow = self
            .ctx
            .orchestrator
            .execute(KIND, request_id, &tx, Some(initiate), self.claimer(), status)
            .await?;

        Ok(SagaOutcome::completed(KIND, Some(amount), &flow))
    }

    /// Re-drive only the claim of an interrupted deposit
    pub async fn claim(&self, request_id: RequestId, status: StatusReporter) -> SagaOutcome {
        crate::metrics::record_saga_started(KIND.label());
        status.emit(SagaStatus::Processing, Some(request_id));

        let record = match self.ctx.source.pending_deposit(request_id).await {
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
            .resume(KIND, request_id, self.claimer(), &status)
            .await
        {
            Ok(flow) => SagaOutcome::completed(KIND, Some(record.amount), &flow),
            Err(e) => SagaOutcome::failed(KIND, Some(request_id), Some(record.amount), &e),
        };
        conclude(outcome, &status)
    }

    fn claimer(&self) -> impl FnOnce(ReadResponseEvent) -> BoxFuture<'static, BridgeResult<String>> + Send {
        let source = self.ctx.source.clone();
        move |response: ReadResponseEvent| {
            Box::pin(async move { source.claim_deposit(&response).await })
                as BoxFuture<'static, BridgeResult<String>>
        }
    }
}

fn to_u128(balance: U256) -> BridgeResult<u128> {
    if balance > U256::from(u128::MAX) {
        return Err(BridgeError::InputValidation(format!(
            "Observed balance {} does not fit the source ledger's amount type",
            balance
        )));
    }
    Ok(balance.as_u128())
}
