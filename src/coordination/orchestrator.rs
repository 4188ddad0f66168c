//! Cross-chain orchestrator
//!
//! Drives one request id through signature, target broadcast, receipt and
//! read response. Sagas supply the source-ledger instructions; the
//! orchestrator owns the subscription for the whole flow and releases it on
//! every exit path, including cancellation.

use super::{SagaKind, SagaPhase, SagaStatus, StatusReporter};
use crate::chain::{TargetLedger, UnsignedTargetTx};
use crate::crypto::RequestId;
use crate::error::{BridgeError, BridgeResult, SagaError};
use crate::events::{
    EventFuture, EventPromises, EventSubscriptionBroker, MpcSignature, ReadResponseEvent,
};

use ethers::types::{Address, H256};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long to wait for each signer event
    pub event_timeout: Duration,
    /// Interval between backfill scans while an event is outstanding
    pub backfill_interval: Duration,
    /// Target confirmations before the receipt is trusted
    pub confirmations: u64,
    /// When set, read responses must be signed by this address
    pub responder_address: Option<Address>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            event_timeout: Duration::from_secs(300),
            backfill_interval: Duration::from_secs(10),
            confirmations: 1,
            responder_address: None,
        }
    }
}

/// Result of the saga's completion instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Completion {
    Applied { source_tx: String },
    /// The pending record was already consumed by another actor
    AlreadyProcessed,
}

impl Completion {
    pub fn source_tx(&self) -> Option<&str> {
        match self {
            Completion::Applied { source_tx } => Some(source_tx),
            Completion::AlreadyProcessed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowOutput {
    pub request_id: RequestId,
    /// None when the flow was resumed after the target leg
    pub target_tx_hash: Option<H256>,
    pub initial_source_tx: Option<String>,
    pub read_response: ReadResponseEvent,
    pub completion: Completion,
}

/// Releases the subscription when the flow ends, however it ends
struct SubscriptionGuard<'a> {
    broker: &'a EventSubscriptionBroker,
    request_id: RequestId,
    kind: SagaKind,
    status: &'a StatusReporter,
    finished: bool,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.broker.unsubscribe(self.request_id);
        if !self.finished {
            warn!("[{}] {} interrupted", self.kind.tag(), self.request_id);
            self.status
                .emit(SagaStatus::Interrupted, Some(self.request_id));
        }
    }
}

pub struct CrossChainOrchestrator {
    broker: Arc<EventSubscriptionBroker>,
    target: Arc<dyn TargetLedger>,
    config: OrchestratorConfig,
}

impl CrossChainOrchestrator {
    pub fn new(
        broker: Arc<EventSubscriptionBroker>,
        target: Arc<dyn TargetLedger>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            broker,
            target,
            config,
        }
    }

    pub fn broker(&self) -> &Arc<EventSubscriptionBroker> {
        &self.broker
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run the full flow for `request_id`.
    ///
    /// The subscription is registered before `initial` runs, so events the
    /// initiate instruction triggers cannot be missed.
    pub async fn execute<I, C, F>(
        &self,
        kind: SagaKind,
        request_id: RequestId,
        tx: &UnsignedTargetTx,
        initial: Option<I>,
        completion: C,
        status: &StatusReporter,
    ) -> Result<FlowOutput, SagaError>
    where
        I: Future<Output = BridgeResult<String>> + Send,
        C: FnOnce(ReadResponseEvent) -> F + Send,
        F: Future<Output = BridgeResult<String>> + Send,
    {
        let promises = self.broker.subscribe(request_id);
        let mut guard = SubscriptionGuard {
            broker: &self.broker,
            request_id,
            kind,
            status,
            finished: false,
        };

        let result = self
            .drive(kind, request_id, tx, promises, initial, completion, status)
            .await;
        guard.finished = true;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive<I, C, F>(
        &self,
        kind: SagaKind,
        request_id: RequestId,
        tx: &UnsignedTargetTx,
        promises: EventPromises,
        initial: Option<I>,
        completion: C,
        status: &StatusReporter,
    ) -> Result<FlowOutput, SagaError>
    where
        I: Future<Output = BridgeResult<String>> + Send,
        C: FnOnce(ReadResponseEvent) -> F + Send,
        F: Future<Output = BridgeResult<String>> + Send,
    {
        let initial_source_tx = match initial {
            Some(instruction) => {
                let started = self.enter(kind, request_id, SagaPhase::AwaitingSourceInit);
                let source_tx = instruction
                    .await
                    .map_err(|e| SagaError::new(SagaPhase::AwaitingSourceInit, e))?;
                info!("[{}] {} initiated on source: {}", kind.tag(), request_id, source_tx);
                self.exit(kind, SagaPhase::AwaitingSourceInit, started);
                Some(source_tx)
            }
            None => None,
        };

        status.emit(SagaStatus::WaitingSignature, Some(request_id));
        let started = self.enter(kind, request_id, SagaPhase::AwaitingSignature);
        let timeout_ms = self.config.event_timeout.as_millis() as u64;
        let signature = self
            .await_event(request_id, promises.signature, || BridgeError::SignatureTimeout {
                request_id: request_id.to_hex(),
                timeout_ms,
            })
            .await
            .map_err(|e| SagaError::new(SagaPhase::AwaitingSignature, e))?;
        self.exit(kind, SagaPhase::AwaitingSignature, started);

        status.emit(SagaStatus::SubmittingTarget, Some(request_id));
        let started = self.enter(kind, request_id, SagaPhase::SubmittingTarget);
        let tx_hash = self
            .submit(tx, &signature.signature)
            .await
            .map_err(|e| SagaError::new(SagaPhase::SubmittingTarget, e))?;
        info!(
            "[{}] {} broadcast target transaction {:?}",
            kind.tag(),
            request_id,
            tx_hash
        );
        self.exit(kind, SagaPhase::SubmittingTarget, started);

        status.emit(SagaStatus::ConfirmingTarget, Some(request_id));
        let started = self.enter(kind, request_id, SagaPhase::ConfirmingTarget);
        self.confirm(tx_hash)
            .await
            .map_err(|e| SagaError::new(SagaPhase::ConfirmingTarget, e))?;
        self.exit(kind, SagaPhase::ConfirmingTarget, started);

        let (read_response, completion) = self
            .finish_source(kind, request_id, promises.read_response, completion, status)
            .await?;

        Ok(FlowOutput {
            request_id,
            target_tx_hash: Some(tx_hash),
            initial_source_tx,
            read_response,
            completion,
        })
    }

    /// Pick up a flow whose target leg already happened: wait for (or backfill)
    /// the read response and run the completion instruction.
    pub async fn resume<C, F>(
        &self,
        kind: SagaKind,
        request_id: RequestId,
        completion: C,
        status: &StatusReporter,
    ) -> Result<FlowOutput, SagaError>
    where
        C: FnOnce(ReadResponseEvent) -> F + Send,
        F: Future<Output = BridgeResult<String>> + Send,
    {
        let promises = self.broker.subscribe(request_id);
        let mut guard = SubscriptionGuard {
            broker: &self.broker,
            request_id,
            kind,
            status,
            finished: false,
        };
        info!("[{}] {} resuming at read response", kind.tag(), request_id);

        let result = self
            .finish_source(kind, request_id, promises.read_response, completion, status)
            .await
            .map(|(read_response, completion)| FlowOutput {
                request_id,
                target_tx_hash: None,
                initial_source_tx: None,
                read_response,
                completion,
            });
        guard.finished = true;
        result
    }

    async fn finish_source<C, F>(
        &self,
        kind: SagaKind,
        request_id: RequestId,
        read_response: EventFuture<ReadResponseEvent>,
        completion: C,
        status: &StatusReporter,
    ) -> Result<(ReadResponseEvent, Completion), SagaError>
    where
        C: FnOnce(ReadResponseEvent) -> F + Send,
        F: Future<Output = BridgeResult<String>> + Send,
    {
        status.emit(SagaStatus::WaitingReadResponse, Some(request_id));
        let started = self.enter(kind, request_id, SagaPhase::AwaitingReadResponse);
        let timeout_ms = self.config.event_timeout.as_millis() as u64;
        let response = self
            .await_event(request_id, read_response, || BridgeError::ReadResponseTimeout {
                request_id: request_id.to_hex(),
                timeout_ms,
            })
            .await
            .and_then(|response| self.verify_responder(&response).map(|_| response))
            .map_err(|e| SagaError::new(SagaPhase::AwaitingReadResponse, e))?;
        debug!(
            "[{}] {} read response output {:?}",
            kind.tag(),
            request_id,
            response.output()
        );
        self.exit(kind, SagaPhase::AwaitingReadResponse, started);

        status.emit(SagaStatus::Completing, Some(request_id));
        let started = self.enter(kind, request_id, SagaPhase::CompletingSource);
        let outcome = match completion(response.clone()).await {
            Ok(source_tx) => {
                info!("[{}] {} completed on source: {}", kind.tag(), request_id, source_tx);
                Completion::Applied { source_tx }
            }
            Err(e) if e.is_benign() => {
                info!("[{}] {} already processed: {}", kind.tag(), request_id, e);
                Completion::AlreadyProcessed
            }
            Err(e) => return Err(SagaError::new(SagaPhase::CompletingSource, e)),
        };
        self.exit(kind, SagaPhase::CompletingSource, started);

        Ok((response, outcome))
    }

    /// Wait for one event, backfilling periodically, until the deadline
    async fn await_event<T, E>(
        &self,
        request_id: RequestId,
        event: EventFuture<T>,
        on_timeout: E,
    ) -> BridgeResult<T>
    where
        T: Clone,
        E: Fn() -> BridgeError,
    {
        let deadline = tokio::time::sleep(self.config.event_timeout);
        tokio::pin!(deadline);
        let mut event = event;
        let mut backfill = tokio::time::interval(self.config.backfill_interval);
        backfill.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                received = &mut event => {
                    return received.ok_or_else(|| BridgeError::SubscriptionClosed {
                        request_id: request_id.to_hex(),
                    });
                }
                _ = &mut deadline => return Err(on_timeout()),
                _ = backfill.tick() => {
                    if let Err(e) = self.broker.backfill(request_id).await {
                        warn!("Backfill for {} failed: {}", request_id, e);
                    }
                }
            }
        }
    }

    async fn submit(
        &self,
        tx: &UnsignedTargetTx,
        signature: &MpcSignature,
    ) -> BridgeResult<H256> {
        let raw = tx.signed_bytes(signature)?;
        self.target.broadcast(raw).await
    }

    async fn confirm(&self, tx_hash: H256) -> BridgeResult<()> {
        let receipt = tokio::time::timeout(
            self.config.event_timeout,
            self.target
                .wait_for_receipt(tx_hash, self.config.confirmations),
        )
        .await
        .map_err(|_| BridgeError::Timeout {
            operation: format!("receipt for {:?}", tx_hash),
        })??;

        if !receipt.succeeded() {
            crate::metrics::record_target_tx_reverted(self.target.chain_id());
            return Err(BridgeError::TargetTxReverted {
                tx_hash: format!("{:?}", tx_hash),
                status: receipt.status,
            });
        }
        debug!("Target transaction {:?} mined in block {}", tx_hash, receipt.block_number);
        Ok(())
    }

    fn verify_responder(&self, response: &ReadResponseEvent) -> BridgeResult<()> {
        let Some(expected) = self.config.responder_address else {
            return Ok(());
        };
        let recovered = response.recover_signer()?;
        if recovered != expected {
            return Err(BridgeError::InvalidResponseSignature {
                recovered: format!("{:?}", recovered),
                expected: format!("{:?}", expected),
            });
        }
        Ok(())
    }

    fn enter(&self, kind: SagaKind, request_id: RequestId, phase: SagaPhase) -> Instant {
        info!("[{}] {} entering {}", kind.tag(), request_id, phase);
        Instant::now()
    }

    fn exit(&self, kind: SagaKind, phase: SagaPhase, started: Instant) {
        let elapsed = started.elapsed();
        debug!("[{}] {} took {}ms", kind.tag(), phase, elapsed.as_millis());
        crate::metrics::record_phase_latency(kind.label(), phase.as_str(), elapsed.as_secs_f64());
    }
}
