//! JSON-RPC gateway to the source-ledger bridge program and signer logs
//!
//! Instructions and account reads are exposed by the gateway as `bridge_*`
//! methods over the same HTTP JSON-RPC transport used for the target ledger.

use super::{SignerLogSource, SourceLedger};
use crate::config::SourceConfig;
use crate::crypto::RequestId;
use crate::error::{BridgeError, BridgeResult};
use crate::events::{ObservedEvent, ReadResponseEvent};
use crate::state::{
    Identity, InitiateDeposit, InitiateWithdraw, PendingDepositRecord, PendingWithdrawalRecord,
    UserBalanceRecord,
};

use async_trait::async_trait;
use ethers::providers::{Http, Provider, ProviderError, RpcError as _};
use ethers::types::Address;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

pub struct RpcSourceGateway {
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl RpcSourceGateway {
    pub fn new(config: &SourceConfig) -> BridgeResult<Self> {
        let mut providers = Vec::new();
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    debug!("Added source gateway endpoint {}", url);
                    providers.push(provider);
                }
                Err(e) => warn!("Failed to create source gateway client for {}: {}", url, e),
            }
        }

        if providers.is_empty() {
            return Err(BridgeError::SourceRpc("No valid gateway endpoints".to_string()));
        }

        Ok(Self {
            providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    fn provider(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        self.current_provider
            .store((current + 1) % self.providers.len(), Ordering::Relaxed);
    }

    /// Read-only call, retried across endpoints
    async fn query<P, R>(&self, method: &str, params: P) -> BridgeResult<R>
    where
        P: Debug + Serialize + Send + Sync + Clone,
        R: Serialize + DeserializeOwned + Debug + Send,
    {
        let mut last_error = None;
        for _ in 0..self.providers.len() {
            match self.provider().request(method, params.clone()).await {
                Ok(result) => return Ok(result),
                Err(ProviderError::JsonRpcClientError(e)) if e.as_error_response().is_some() => {
                    return Err(classify_rpc_error(method, &e.to_string()));
                }
                Err(e) => {
                    warn!("Gateway call {} failed: {}", method, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }
        Err(BridgeError::SourceRpc(format!(
            "{}: all endpoints failed ({})",
            method,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// State-changing instruction, sent once to the active endpoint
    async fn submit<P>(&self, method: &str, params: P) -> BridgeResult<String>
    where
        P: Debug + Serialize + Send + Sync,
    {
        self.provider()
            .request::<P, String>(method, params)
            .await
            .map_err(|e| classify_rpc_error(method, &e.to_string()))
    }
}

/// Map a gateway error message onto the engine's taxonomy
pub fn classify_rpc_error(method: &str, message: &str) -> BridgeError {
    let lower = message.to_lowercase();
    if lower.contains("account does not exist") || lower.contains("accountnotinitialized") {
        BridgeError::PendingRecordNotFound(format!("{}: {}", method, message))
    } else if lower.contains("already in use") {
        BridgeError::PendingRecordExists(format!("{}: {}", method, message))
    } else if lower.contains("insufficient")
        || lower.contains("custom program error")
        || lower.contains("constraint")
    {
        BridgeError::SourceCompletionRejected(format!("{}: {}", method, message))
    } else {
        BridgeError::SourceRpc(format!("{}: {}", method, message))
    }
}

#[async_trait]
impl SourceLedger for RpcSourceGateway {
    async fn vault_authority(&self, user: &Identity) -> BridgeResult<Identity> {
        self.query("bridge_vaultAuthority", [user.clone()]).await
    }

    async fn global_vault_authority(&self) -> BridgeResult<Identity> {
        self.query("bridge_globalVaultAuthority", ()).await
    }

    async fn initiate_deposit(&self, args: &InitiateDeposit) -> BridgeResult<String> {
        self.submit("bridge_initiateDeposit", [args]).await
    }

    async fn claim_deposit(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        self.submit("bridge_claimDeposit", [response]).await
    }

    async fn initiate_withdraw(&self, args: &InitiateWithdraw) -> BridgeResult<String> {
        self.submit("bridge_initiateWithdraw", [args]).await
    }

    async fn complete_withdraw(&self, response: &ReadResponseEvent) -> BridgeResult<String> {
        self.submit("bridge_completeWithdraw", [response]).await
    }

    async fn user_balance(&self, user: &Identity, token: Address) -> BridgeResult<UserBalanceRecord> {
        self.query("bridge_getUserBalance", (user.clone(), token)).await
    }

    async fn pending_deposit(&self, request_id: RequestId) -> BridgeResult<Option<PendingDepositRecord>> {
        self.query("bridge_getPendingDeposit", [request_id]).await
    }

    async fn pending_withdrawal(
        &self,
        request_id: RequestId,
    ) -> BridgeResult<Option<PendingWithdrawalRecord>> {
        self.query("bridge_getPendingWithdrawal", [request_id]).await
    }
}

#[async_trait]
impl SignerLogSource for RpcSourceGateway {
    async fn recent_events(&self, limit: usize) -> BridgeResult<Vec<ObservedEvent>> {
        self.query("bridge_getSignerEvents", [limit]).await
    }

    async fn events_since(&self, after_slot: u64, limit: usize) -> BridgeResult<Vec<ObservedEvent>> {
        self.query("bridge_getSignerEventsSince", (after_slot, limit)).await
    }

    async fn latest_slot(&self) -> BridgeResult<u64> {
        self.query("bridge_getSlot", ()).await
    }
}
