mod common;

use chainsig_bridge::chain::SourceLedger;
use chainsig_bridge::crypto::SignRequest;
use chainsig_bridge::coordination::{SagaStatus, StatusReporter, StatusUpdate};
use chainsig_bridge::crypto::WITHDRAWAL_ROOT_PATH;
use chainsig_bridge::error::ErrorKind;
use chainsig_bridge::events::ERROR_OUTPUT_MAGIC;
use chainsig_bridge::saga::WithdrawSaga;
use chainsig_bridge::state::{Identity, InitiateWithdraw, LedgerCall};
use chainsig_bridge::SagaPhase;
use common::*;
use ethers::signers::Signer;
use ethers::types::{Address, U256};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FUNDED: u128 = 1_000_000;

async fn funded_harness(signer: SimulatedSigner, event_timeout: Duration) -> Harness {
    let harness = Harness::new(signer, event_timeout);
    harness
        .source
        .inner
        .set_balance(&Identity::new(USER), token(), FUNDED)
        .await;
    harness
}

fn recipient() -> Address {
    Address::repeat_byte(0x42)
}

#[tokio::test]
async fn test_withdraw_vault_is_root_derived() {
    let harness = Harness::new(SimulatedSigner::new(), Duration::from_secs(5));
    let saga = WithdrawSaga::new(harness.ctx.clone());

    let expected = derived_wallet(&Identity::new(GLOBAL_VAULT), WITHDRAWAL_ROOT_PATH).address();
    assert_eq!(saga.vault_address().await.unwrap(), expected);
}

#[tokio::test]
async fn test_successful_withdraw_keeps_debit() {
    let harness = funded_harness(SimulatedSigner::new(), Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let user = Identity::new(USER);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let status = StatusReporter::new(Some(Arc::new(move |update: StatusUpdate| {
        sink.lock().unwrap().push(update.status);
    })));

    let outcome = saga
        .run(user.clone(), token(), 400_000, recipient(), status)
        .await;
    assert!(outcome.success, "withdraw failed: {:?}", outcome.error);
    assert!(!outcome.refunded);

    let amount = outcome.amount.unwrap();
    assert!((399_900..400_000).contains(&amount));
    let balance = harness.source.user_balance(&user, token()).await.unwrap();
    assert_eq!(balance.amount, FUNDED - amount);

    let request_id = outcome.request_id.unwrap();
    assert_eq!(
        harness.source.inner.history().await,
        vec![
            LedgerCall::InitiateWithdraw(request_id),
            LedgerCall::CompleteWithdraw(request_id),
        ]
    );
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            SagaStatus::Processing,
            SagaStatus::WaitingSignature,
            SagaStatus::SubmittingTarget,
            SagaStatus::ConfirmingTarget,
            SagaStatus::WaitingReadResponse,
            SagaStatus::Completing,
            SagaStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_false_read_response_refunds_in_full() {
    let signer = SimulatedSigner::new();
    signer.set_output(vec![0x00]);
    let harness = funded_harness(signer, Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let user = Identity::new(USER);

    let outcome = saga
        .run(user.clone(), token(), 400_000, recipient(), StatusReporter::silent())
        .await;

    assert!(outcome.success, "withdraw failed: {:?}", outcome.error);
    assert!(outcome.refunded);
    let balance = harness.source.user_balance(&user, token()).await.unwrap();
    assert_eq!(balance.amount, FUNDED);
    assert!(harness
        .source
        .pending_withdrawal(outcome.request_id.unwrap())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_error_payload_refunds() {
    let signer = SimulatedSigner::new();
    let mut payload = ERROR_OUTPUT_MAGIC.to_vec();
    payload.extend_from_slice(b"ERC20: transfer amount exceeds balance");
    signer.set_output(payload);
    let harness = funded_harness(signer, Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let user = Identity::new(USER);

    let outcome = saga
        .run(user.clone(), token(), 10_000, recipient(), StatusReporter::silent())
        .await;

    assert!(outcome.refunded);
    assert_eq!(
        harness.source.user_balance(&user, token()).await.unwrap().amount,
        FUNDED
    );
}

#[tokio::test]
async fn test_withdraw_signature_timeout() {
    let harness = funded_harness(SimulatedSigner::silent(), Duration::from_millis(300)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let user = Identity::new(USER);

    let outcome = saga
        .run(user.clone(), token(), 400_000, recipient(), StatusReporter::silent())
        .await;

    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("SignatureTimeout"));
    assert_eq!(outcome.error_kind, Some(ErrorKind::SignatureTimeout));
    assert_eq!(harness.broker.active_subscription_count(), 0);

    // Debit stays with the pending record until it is completed
    let request_id = outcome.request_id.unwrap();
    let pending = harness.source.pending_withdrawal(request_id).await.unwrap().unwrap();
    assert_eq!(
        harness.source.user_balance(&user, token()).await.unwrap().amount,
        FUNDED - pending.amount
    );
}

#[tokio::test]
async fn test_overdrawn_withdraw_fails_at_initiation() {
    let harness = funded_harness(SimulatedSigner::new(), Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());

    let outcome = saga
        .run(
            Identity::new(USER),
            token(),
            FUNDED * 2,
            recipient(),
            StatusReporter::silent(),
        )
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.failed_phase, Some(SagaPhase::AwaitingSourceInit));
    assert_eq!(harness.broker.active_subscription_count(), 0);
    assert!(harness.target.broadcasts().is_empty());
}

#[tokio::test]
async fn test_zero_amount_rejected() {
    let harness = funded_harness(SimulatedSigner::new(), Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());

    let outcome = saga
        .run(Identity::new(USER), token(), 0, recipient(), StatusReporter::silent())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::InputValidation));
    assert!(harness.source.inner.history().await.is_empty());
}

/// Initiate a withdrawal the way a user's wallet would, bypassing the relayer
async fn initiate_from_wallet(harness: &Harness, saga: &WithdrawSaga, amount: u128) -> InitiateWithdraw {
    let vault = saga.vault_address().await.unwrap();
    let tx = harness
        .ctx
        .tx_builder
        .transfer(vault, token(), recipient(), U256::from(amount))
        .await
        .unwrap();
    let request_id = SignRequest::ethereum(
        Identity::new(GLOBAL_VAULT),
        tx.unsigned_bytes(),
        WITHDRAWAL_ROOT_PATH,
    )
    .request_id()
    .unwrap();
    let args = InitiateWithdraw {
        request_id,
        requester: Identity::new(USER),
        token_address: token(),
        amount,
        recipient_address: recipient(),
        tx_params: tx.params.clone(),
    };
    harness.source.initiate_withdraw(&args).await.unwrap();
    args
}

#[tokio::test]
async fn test_user_initiated_withdraw_is_relayed() {
    let harness = funded_harness(SimulatedSigner::new(), Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let args = initiate_from_wallet(&harness, &saga, 300_000).await;

    let outcome = saga
        .process(args.request_id, token(), args.tx_params.clone(), StatusReporter::silent())
        .await;

    assert!(outcome.success, "relay failed: {:?}", outcome.error);
    assert!(!outcome.refunded);
    assert!(outcome.target_tx_hash.is_some());
    assert_eq!(outcome.amount, Some(300_000));
    assert_eq!(harness.target.broadcasts().len(), 1);
    assert_eq!(
        harness.source.inner.history().await,
        vec![
            LedgerCall::InitiateWithdraw(args.request_id),
            LedgerCall::CompleteWithdraw(args.request_id),
        ]
    );
    assert_eq!(
        harness
            .source
            .user_balance(&Identity::new(USER), token())
            .await
            .unwrap()
            .amount,
        FUNDED - 300_000
    );
}

#[tokio::test]
async fn test_relay_rejects_params_that_do_not_rebuild_request() {
    let harness = funded_harness(SimulatedSigner::new(), Duration::from_secs(5)).await;
    let saga = WithdrawSaga::new(harness.ctx.clone());
    let args = initiate_from_wallet(&harness, &saga, 300_000).await;

    let mut params = args.tx_params.clone();
    params.nonce += 1;
    let outcome = saga
        .process(args.request_id, token(), params, StatusReporter::silent())
        .await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some(ErrorKind::InputValidation));
    assert_eq!(outcome.failed_phase, Some(SagaPhase::Preparing));
    assert!(harness.target.broadcasts().is_empty());
}

#[tokio::test]
async fn test_read_response_timeout_after_broadcast() {
    let harness = funded_harness(
        SimulatedSigner::without_read_responses(),
        Duration::from_millis(300),
    )
    .await;
    let saga = WithdrawSaga::new(harness.ctx.clone());

    let outcome = saga
        .run(Identity::new(USER), token(), 400_000, recipient(), StatusReporter::silent())
        .await;

    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("ReadResponseTimeout"));
    assert_eq!(outcome.error_kind, Some(ErrorKind::ReadResponseTimeout));
    assert_eq!(outcome.failed_phase, Some(SagaPhase::AwaitingReadResponse));
    assert_eq!(harness.target.broadcasts().len(), 1);
    assert_eq!(harness.broker.active_subscription_count(), 0);

    // Still pending, so a later recovery can complete it
    let request_id = outcome.request_id.unwrap();
    assert!(harness.source.pending_withdrawal(request_id).await.unwrap().is_some());
}
