//! Simulated collaborators for whole-saga tests
//!
//! - `SimulatedSigner` plays the threshold-signing service: it signs with the
//!   derived key whenever a pending record is created and answers with a read
//!   response once the signed transfer is broadcast. Its event log backs both
//!   the live listener and broker backfill.
//! - `SigningSourceLedger` is the in-memory source ledger with the signing
//!   service's trigger attached to the initiate instructions.
//! - `SimulatedTarget` is an EVM ledger that accepts every broadcast.

#![allow(dead_code)]

use async_trait::async_trait;
use chainsig_bridge::chain::{
    erc20_transfer_tx, FeeEstimate, SignerLogSource, SourceLedger, TargetLedger, TargetReceipt,
};
use chainsig_bridge::coordination::{CrossChainOrchestrator, OrchestratorConfig};
use chainsig_bridge::crypto::{derive_epsilon, keccak256, DerivationConfig, RequestId, SignRequest};
use chainsig_bridge::crypto::WITHDRAWAL_ROOT_PATH;
use chainsig_bridge::error::BridgeResult;
use chainsig_bridge::events::{
    BrokerConfig, EcPoint, EventSubscriptionBroker, MpcSignature, ObservedEvent, ReadResponseEvent,
    SignatureEvent, SignerEvent, SignerEventListener,
};
use chainsig_bridge::saga::{MonitorSchedule, SagaContext, SagaSettings};
use chainsig_bridge::state::{
    Identity, InitiateDeposit, InitiateWithdraw, MemorySourceLedger, PendingDepositRecord,
    PendingWithdrawalRecord, UserBalanceRecord,
};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::SecretKey;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const BASE_SECRET: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
pub const RESPONDER_SECRET: &str = "0202020202020202020202020202020202020202020202020202020202020202";
pub const GLOBAL_VAULT: &str = "GlobalVau1t1111111111111111111111111111111";
pub const USER: &str = "4Nd1mBQtrMJVYVfKf2PJy9NZUZdTAsp7D4xWLs4gDB4T";
pub const CHAIN_ID: u64 = 11155111;

pub fn token() -> Address {
    Address::repeat_byte(0xaa)
}

pub fn vault_address() -> Address {
    Address::repeat_byte(0x77)
}

fn hex_to_secret(hex_key: &str) -> SecretKey {
    SecretKey::from_slice(&hex::decode(hex_key).unwrap()).unwrap()
}

pub fn base_public_key() -> String {
    let point = hex_to_secret(BASE_SECRET).public_key().to_encoded_point(false);
    format!("0x{}", hex::encode(point.as_bytes()))
}

/// Wallet holding the derived key the signing network controls for `requester`/`path`
pub fn derived_wallet(requester: &Identity, path: &str) -> LocalWallet {
    let base = hex_to_secret(BASE_SECRET);
    let epsilon = derive_epsilon(&DerivationConfig::default(), requester, path);
    let derived = *base.to_nonzero_scalar() + epsilon;
    LocalWallet::from_bytes(&derived.to_bytes()).unwrap()
}

fn to_mpc(signature: ethers::types::Signature) -> MpcSignature {
    let mut r = [0u8; 32];
    signature.r.to_big_endian(&mut r);
    let mut s = [0u8; 32];
    signature.s.to_big_endian(&mut s);
    MpcSignature {
        big_r: EcPoint { x: r, y: [0u8; 32] },
        s,
        recovery_id: (signature.v - 27) as u8,
    }
}

#[derive(Default)]
struct SignerState {
    log: Vec<ObservedEvent>,
    awaiting_broadcast: VecDeque<RequestId>,
    next_slot: u64,
}

pub struct SimulatedSigner {
    responder: LocalWallet,
    state: Mutex<SignerState>,
    /// Payload reported in read responses
    output: Mutex<Vec<u8>>,
    silent: bool,
    /// Whether broadcasts are answered with a read response
    responds: bool,
}

impl SimulatedSigner {
    pub fn new() -> Self {
        Self {
            responder: RESPONDER_SECRET.parse().unwrap(),
            state: Mutex::new(SignerState::default()),
            output: Mutex::new(vec![0x01]),
            silent: false,
            responds: true,
        }
    }

    /// A signing service that never answers
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::new()
        }
    }

    /// Signs requests but never reports what the target ledger did
    pub fn without_read_responses() -> Self {
        Self {
            responds: false,
            ..Self::new()
        }
    }

    pub fn responder_address(&self) -> Address {
        self.responder.address()
    }

    pub fn set_output(&self, output: Vec<u8>) {
        *self.output.lock().unwrap() = output;
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.state.lock().unwrap().log.clone()
    }

    fn append(&self, state: &mut SignerState, event: SignerEvent) {
        state.next_slot += 1;
        let slot = state.next_slot;
        state.log.push(ObservedEvent {
            event,
            slot,
            source_tx: format!("signer-tx-{}", slot),
        });
    }

    /// Sign the transaction a pending record describes
    fn sign_request(&self, request: &SignRequest, tx: &TypedTransaction) {
        if self.silent {
            return;
        }
        let request_id = request.request_id().unwrap();
        let wallet = derived_wallet(&request.sender, &request.path);
        let signature = wallet.sign_hash(tx.sighash()).unwrap();

        let mut state = self.state.lock().unwrap();
        state.awaiting_broadcast.push_back(request_id);
        self.append(
            &mut state,
            SignerEvent::Signature(SignatureEvent {
                request_id,
                signature: to_mpc(signature),
            }),
        );
    }

    /// The signed transfer reached the target ledger
    fn observe_broadcast(&self) {
        if !self.responds {
            return;
        }
        let output = self.output.lock().unwrap().clone();
        let mut state = self.state.lock().unwrap();
        let Some(request_id) = state.awaiting_broadcast.pop_front() else {
            return;
        };
        let mut response = ReadResponseEvent {
            request_id,
            serialized_output: output,
            signature: MpcSignature::default(),
        };
        response.signature = to_mpc(self.responder.sign_hash(response.message_hash()).unwrap());
        self.append(&mut state, SignerEvent::ReadResponse(response));
    }
}

#[async_trait]
impl SignerLogSource for SimulatedSigner {
    async fn recent_events(&self, limit: usize) -> BridgeResult<Vec<ObservedEvent>> {
        let state = self.state.lock().unwrap();
        let skip = state.log.len().saturating_sub(limit);
        Ok(state.log[skip..].to_vec())
    }

    async fn events_since(&self, after_slot: u64, limit: usize) -> BridgeResult<Vec<ObservedEvent>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .log
            .iter()
            .filter(|e| e.slot > after_slot)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_slot(&self) -> BridgeResult<u64> {
        Ok(self.state.lock().unwrap().next_slot)
    }
}

pub struct SigningSourceLedger {
    pub inner: MemorySourceLedger,
    signer: Arc<SimulatedSigner>,
}

impl SigningSourceLedger {
    pub fn new(signer: Arc<SimulatedSigner>) -> Self {
        Self {
            inner: MemorySourceLedger::new(Identity::new(GLOBAL_VAULT), vault_address())
                .with_responder(signer.responder_address()),
            signer,
        }
    }
}

#[async_trait]
impl SourceLedger for SigningSourceLedger {
    async fn vault_authority(&self, user: &Identity) -> BridgeResult<Identity> {
        self.inner.vault_authority(user).await
    }

    async fn global_vault_authority(&self) -> BridgeResult<Identity> {
        self.inner.global_vault_authority().await
    }

    async fn initiate_deposit(&self, args: &InitiateDeposit) -> BridgeResult<String> {
        let signature = self.inner.initiate_deposit(args).await?;
        let sender = self.inner.vault_authority(&args.requester).await?;
        let tx = erc20_transfer_tx(
            args.token_address,
            vault_address(),
            U256::from(args.amount),
            &args.tx_params,
        );
        let request = SignRequest::ethereum(sender, tx.rlp().to_vec(), args.path.clone());
        self.signer.sign_request(&request, &tx);
        Ok(signature)
    }

    async fn claim_deposit(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        self.inner.claim_deposit(response).await
    }

    async fn initiate_withdraw(&self, args: &InitiateWithdraw) -> BridgeResult<String> {
        let signature = self.inner.initiate_withdraw(args).await?;
        let tx = erc20_transfer_tx(
            args.token_address,
            args.recipient_address,
            U256::from(args.amount),
            &args.tx_params,
        );
        let request = SignRequest::ethereum(
            Identity::new(GLOBAL_VAULT),
            tx.rlp().to_vec(),
            WITHDRAWAL_ROOT_PATH,
        );
        self.signer.sign_request(&request, &tx);
        Ok(signature)
    }

    async fn complete_withdraw(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        self.inner.complete_withdraw(response).await
    }

    async fn user_balance(&self, user: &Identity, token: Address) -> BridgeResult<UserBalanceRecord> {
        self.inner.user_balance(user, token).await
    }

    async fn pending_deposit(&self, request_id: RequestId) -> BridgeResult<Option<PendingDepositRecord>> {
        self.inner.pending_deposit(request_id).await
    }

    async fn pending_withdrawal(
        &self,
        request_id: RequestId,
    ) -> BridgeResult<Option<PendingWithdrawalRecord>> {
        self.inner.pending_withdrawal(request_id).await
    }
}

pub struct SimulatedTarget {
    signer: Arc<SimulatedSigner>,
    balances: Mutex<HashMap<Address, U256>>,
    broadcasts: Mutex<Vec<Bytes>>,
    receipt_status: u64,
}

impl SimulatedTarget {
    pub fn new(signer: Arc<SimulatedSigner>) -> Self {
        Self {
            signer,
            balances: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            receipt_status: 1,
        }
    }

    pub fn set_token_balance(&self, owner: Address, amount: U256) {
        self.balances.lock().unwrap().insert(owner, amount);
    }

    pub fn broadcasts(&self) -> Vec<Bytes> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetLedger for SimulatedTarget {
    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    async fn block_number(&self) -> BridgeResult<u64> {
        Ok(100)
    }

    async fn transaction_count(&self, _address: Address) -> BridgeResult<u64> {
        Ok(self.broadcasts.lock().unwrap().len() as u64)
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> BridgeResult<U256> {
        Ok(U256::from(50_000u64))
    }

    async fn fee_estimate(&self) -> BridgeResult<FeeEstimate> {
        Ok(FeeEstimate {
            max_fee_per_gas: U256::from(20_000_000_000u64),
            max_priority_fee_per_gas: U256::from(2_000_000_000u64),
        })
    }

    async fn token_balance(&self, _token: Address, owner: Address) -> BridgeResult<U256> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(&owner)
            .copied()
            .unwrap_or_default())
    }

    async fn broadcast(&self, raw_tx: Bytes) -> BridgeResult<H256> {
        let hash = H256(keccak256(&raw_tx));
        self.broadcasts.lock().unwrap().push(raw_tx);
        self.signer.observe_broadcast();
        Ok(hash)
    }

    async fn wait_for_receipt(&self, tx_hash: H256, _confirmations: u64) -> BridgeResult<TargetReceipt> {
        Ok(TargetReceipt {
            tx_hash,
            status: self.receipt_status,
            block_number: 100,
        })
    }
}

/// Everything a saga test needs, wired like the relayer binary
pub struct Harness {
    pub signer: Arc<SimulatedSigner>,
    pub source: Arc<SigningSourceLedger>,
    pub target: Arc<SimulatedTarget>,
    pub broker: Arc<EventSubscriptionBroker>,
    pub ctx: Arc<SagaContext>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    pub fn new(signer: SimulatedSigner, event_timeout: Duration) -> Self {
        let signer = Arc::new(signer);
        let source = Arc::new(SigningSourceLedger::new(signer.clone()));
        let target = Arc::new(SimulatedTarget::new(signer.clone()));
        let broker = Arc::new(
            EventSubscriptionBroker::new(BrokerConfig::default()).with_log_source(signer.clone()),
        );

        let (event_tx, _) = broadcast::channel(64);
        let listener = Arc::new(SignerEventListener::new(
            signer.clone(),
            event_tx,
            Duration::from_millis(10),
            50,
        ));
        let dispatcher = broker.spawn_dispatcher(listener.subscribe());
        let listening = tokio::spawn({
            let listener = listener.clone();
            async move {
                let _ = listener.listen().await;
            }
        });

        let orchestrator = Arc::new(CrossChainOrchestrator::new(
            broker.clone(),
            target.clone(),
            OrchestratorConfig {
                event_timeout,
                backfill_interval: Duration::from_millis(50),
                confirmations: 1,
                responder_address: Some(signer.responder_address()),
            },
        ));
        let ctx = Arc::new(SagaContext::new(
            source.clone(),
            target.clone(),
            orchestrator,
            20,
            SagaSettings {
                base_public_key: base_public_key(),
                vault_address: vault_address(),
                perturbation_max: 100,
                deposit_initial_delay: Duration::ZERO,
                deposit_monitor: MonitorSchedule {
                    deadline: Duration::from_secs(2),
                    poll_interval: Duration::from_millis(20),
                    max_poll_interval: Duration::from_millis(100),
                },
            },
        ));

        Self {
            signer,
            source,
            target,
            broker,
            ctx,
            tasks: vec![dispatcher, listening],
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
