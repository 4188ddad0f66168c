//! HTTP API for health checks, status and relayer requests
//!
//! Saga requests are accepted and spawned; progress is reported through the
//! log and the final `SagaOutcome` is logged when the saga ends.

use crate::chain::{TargetLedger, TargetTxParams};
use crate::config::ApiConfig;
use crate::coordination::{SagaKind, StatusReporter, StatusUpdate};
use crate::crypto::RequestId;
use crate::error::{BridgeError, BridgeResult, ErrorKind};
use crate::events::EventSubscriptionBroker;
use crate::saga::{DepositSaga, SagaOutcome, WithdrawSaga};
use crate::state::Identity;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deposits: Arc<DepositSaga>,
    pub withdrawals: Arc<WithdrawSaga>,
    pub broker: Arc<EventSubscriptionBroker>,
    pub target: Arc<dyn TargetLedger>,
    pub started_at: DateTime<Utc>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/status", get(get_status))
        .route("/deposit-address/:user", get(deposit_address))
        .route("/relayer/notify-deposit", post(notify_deposit))
        .route("/relayer/withdraw", post(withdraw))
        .route("/relayer/notify-withdrawal", post(notify_withdrawal))
        .route("/relayer/recover/:kind/:request_id", post(recover))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> BridgeResult<()> {
    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| BridgeError::Internal(format!("Failed to bind API server on {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| BridgeError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Status callback that writes every transition to the log
pub fn status_logger(kind: SagaKind) -> StatusReporter {
    StatusReporter::new(Some(Arc::new(move |update: StatusUpdate| {
        let request_id = update
            .request_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        match update.detail {
            Some(detail) => info!("[{}] {} -> {} ({})", kind.tag(), request_id, update.status.as_str(), detail),
            None => info!("[{}] {} -> {}", kind.tag(), request_id, update.status.as_str()),
        }
    })))
}

fn log_outcome(outcome: &SagaOutcome) {
    match serde_json::to_string(outcome) {
        Ok(json) => info!("[{}] outcome {}", outcome.kind.tag(), json),
        Err(e) => warn!("[{}] outcome could not be serialized: {}", outcome.kind.tag(), e),
    }
}

/// Error body with a status derived from the error kind
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InputValidation => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, ApiError> {
    value.parse().map_err(|_| {
        ApiError(BridgeError::InputValidation(format!(
            "{} is not a valid address: {}",
            field, value
        )))
    })
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - target ledger reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let block = state.target.block_number().await.ok();
    let body = ReadinessResponse {
        ready: block.is_some(),
        chain_id: state.target.chain_id(),
        block_number: block,
    };
    let status = if body.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Get relayer status
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = Utc::now().signed_duration_since(state.started_at);
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds().max(0) as u64,
        active_subscriptions: state.broker.active_subscription_count(),
        target_chain_id: state.target.chain_id(),
    })
}

async fn deposit_address(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> Result<Json<DepositAddressResponse>, ApiError> {
    let user = Identity::new(user);
    let address = state.deposits.deposit_address(&user).await?;
    Ok(Json(DepositAddressResponse { user, address }))
}

async fn notify_deposit(
    State(state): State<AppState>,
    Json(request): Json<NotifyDepositRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let token = parse_address("erc20Address", &request.erc20_address)?;
    let user = Identity::new(request.user_address);

    let saga = state.deposits.clone();
    tokio::spawn(async move {
        let outcome = saga.run(user, token, status_logger(SagaKind::Deposit)).await;
        log_outcome(&outcome);
    });

    Ok(accepted(SagaKind::Deposit, None))
}

async fn withdraw(
    State(state): State<AppState>,
    Json(request): Json<WithdrawRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let token = parse_address("erc20Address", &request.erc20_address)?;
    let recipient = parse_address("recipientAddress", &request.recipient_address)?;
    let amount: u128 = request.amount.parse().map_err(|_| {
        ApiError(BridgeError::InputValidation(format!(
            "amount is not a base-unit integer: {}",
            request.amount
        )))
    })?;
    if amount == 0 {
        return Err(BridgeError::InputValidation("amount must be positive".to_string()).into());
    }
    let user = Identity::new(request.user_address);

    let saga = state.withdrawals.clone();
    tokio::spawn(async move {
        let outcome = saga
            .run(user, token, amount, recipient, status_logger(SagaKind::Withdraw))
            .await;
        log_outcome(&outcome);
    });

    Ok(accepted(SagaKind::Withdraw, None))
}

/// The user already initiated the withdrawal; relay it to the target ledger
async fn notify_withdrawal(
    State(state): State<AppState>,
    Json(request): Json<NotifyWithdrawalRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let request_id: RequestId = request.request_id.parse()?;
    let token = parse_address("erc20Address", &request.erc20_address)?;

    let saga = state.withdrawals.clone();
    tokio::spawn(async move {
        let outcome = saga
            .process(
                request_id,
                token,
                request.transaction_params,
                status_logger(SagaKind::Withdraw),
            )
            .await;
        log_outcome(&outcome);
    });

    Ok(accepted(SagaKind::Withdraw, Some(request_id)))
}

async fn recover(
    State(state): State<AppState>,
    Path((kind, request_id)): Path<(String, String)>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let kind: SagaKind = kind.parse()?;
    let request_id: RequestId = request_id.parse()?;

    match kind {
        SagaKind::Deposit => {
            let saga = state.deposits.clone();
            tokio::spawn(async move {
                let outcome = saga.claim(request_id, status_logger(kind)).await;
                log_outcome(&outcome);
            });
        }
        SagaKind::Withdraw => {
            let saga = state.withdrawals.clone();
            tokio::spawn(async move {
                let outcome = saga.complete(request_id, status_logger(kind)).await;
                log_outcome(&outcome);
            });
        }
    }

    Ok(accepted(kind, Some(request_id)))
}

fn accepted(kind: SagaKind, request_id: Option<RequestId>) -> (StatusCode, Json<AcceptedResponse>) {
    (
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            kind,
            request_id,
        }),
    )
}

// Request and response types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyDepositRequest {
    user_address: String,
    erc20_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WithdrawRequest {
    user_address: String,
    erc20_address: String,
    /// Base units as a decimal string; u128 does not survive JSON numbers
    amount: String,
    recipient_address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotifyWithdrawalRequest {
    request_id: String,
    erc20_address: String,
    transaction_params: TargetTxParams,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chain_id: u64,
    block_number: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    active_subscriptions: usize,
    target_chain_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DepositAddressResponse {
    user: Identity,
    address: Address,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcceptedResponse {
    accepted: bool,
    kind: SagaKind,
    request_id: Option<RequestId>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}
