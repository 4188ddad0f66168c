//! Target-ledger provider with multi-RPC support and automatic failover

use super::tx::IERC20;
use super::{FeeEstimate, TargetLedger, TargetReceipt};
use crate::config::TargetConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Fallback priority fee when the node cannot estimate (2 gwei)
const FALLBACK_PRIORITY_FEE: u64 = 2_000_000_000;
/// Fallback max fee when the node cannot estimate (20 gwei)
const FALLBACK_MAX_FEE: u64 = 20_000_000_000;

pub struct EvmTargetLedger {
    config: TargetConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Arc<Provider<Http>>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl EvmTargetLedger {
    pub fn new(config: TargetConfig) -> BridgeResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(config.receipt_poll_interval_ms));
                    http_providers.push(Arc::new(provider));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BridgeError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> Arc<Provider<Http>> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        self.http_providers[idx % self.http_providers.len()].clone()
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, message: impl ToString) -> BridgeError {
        BridgeError::ChainConnection {
            chain_id: self.config.chain_id,
            message: message.to_string(),
        }
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> BridgeResult<FeeEstimate> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| BridgeError::GasEstimation(e.to_string()))?
            .ok_or_else(|| BridgeError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| BridgeError::GasEstimation("No base fee in block".to_string()))?;

        let cap = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        Ok(capped_fees(base_fee, U256::from(FALLBACK_PRIORITY_FEE), cap))
    }
}

/// Max fee = 2 * base_fee + priority_fee, capped. The priority fee never
/// exceeds the max fee or nodes reject the transaction.
fn capped_fees(base_fee: U256, priority_fee: U256, cap: U256) -> FeeEstimate {
    let max_fee = std::cmp::min(base_fee * 2 + priority_fee, cap);
    FeeEstimate {
        max_fee_per_gas: max_fee,
        max_priority_fee_per_gas: std::cmp::min(priority_fee, max_fee),
    }
}

#[async_trait]
impl TargetLedger for EvmTargetLedger {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn block_number(&self) -> BridgeResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    async fn transaction_count(&self, address: Address) -> BridgeResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.connection_error(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> BridgeResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| BridgeError::GasEstimation(e.to_string()))
    }

    async fn fee_estimate(&self) -> BridgeResult<FeeEstimate> {
        match self.estimate_eip1559_fees().await {
            Ok(fees) => Ok(fees),
            Err(e) => {
                warn!("Fee estimation failed, using fallback fees: {}", e);
                Ok(FeeEstimate {
                    max_fee_per_gas: U256::from(FALLBACK_MAX_FEE),
                    max_priority_fee_per_gas: U256::from(FALLBACK_PRIORITY_FEE),
                })
            }
        }
    }

    async fn token_balance(&self, token: Address, owner: Address) -> BridgeResult<U256> {
        let contract = IERC20::new(token, self.http());
        contract
            .balance_of(owner)
            .call()
            .await
            .map_err(|e| self.connection_error(format!("balanceOf failed: {}", e)))
    }

    async fn broadcast(&self, raw_tx: Bytes) -> BridgeResult<H256> {
        let http = self.http();
        let pending = http
            .send_raw_transaction(raw_tx)
            .await
            .map_err(|e| BridgeError::Transaction(e.to_string()))?;
        let tx_hash = pending.tx_hash();
        crate::metrics::record_target_tx_broadcast(self.config.chain_id);
        Ok(tx_hash)
    }

    async fn wait_for_receipt(&self, tx_hash: H256, confirmations: u64) -> BridgeResult<TargetReceipt> {
        let poll_interval = Duration::from_millis(self.config.receipt_poll_interval_ms);

        // Only the orchestrator's deadline ends the wait; the transfer is already out
        loop {
            let receipt = match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(
                        "Receipt query for {:?} on chain {} failed: {}",
                        tx_hash, self.config.chain_id, e
                    );
                    self.failover();
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            if let Some(receipt) = receipt {
                if let Some(block) = receipt.block_number {
                    let block = block.as_u64();
                    match self.block_number().await {
                        Ok(current) => {
                            let depth = current.saturating_sub(block) + 1;
                            if depth >= confirmations {
                                return Ok(TargetReceipt {
                                    tx_hash,
                                    status: receipt.status.map(|s| s.as_u64()).unwrap_or(0),
                                    block_number: block,
                                });
                            }
                            debug!(
                                "Transaction {:?} has {} / {} confirmations on chain {}",
                                tx_hash, depth, confirmations, self.config.chain_id
                            );
                        }
                        Err(e) => warn!("Confirmation depth for {:?} unknown: {}", tx_hash, e),
                    }
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
