//! HTTP API for health checks and transaction submission

use crate::config::ApiConfig;
use crate::error::{FailureReason, TxServiceError, TxServiceResult};
use crate::tx::{MinimalTransaction, ReceiptSummary, TransactionService};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TransactionService>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/chains", get(get_chains))
        .route("/transactions", post(submit_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, service: Arc<TransactionService>) -> TxServiceResult<()> {
    let app = router(AppState { service });

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxServiceError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxServiceError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - every chain has a reachable endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let chain_health = state.service.connections().health_check().await;
    let ready = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            details: chain_health
                .into_iter()
                .map(|(id, h)| ChainHealth {
                    chain_id: id,
                    healthy: h,
                })
                .collect(),
        }),
    )
}

/// Get connected chains
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    let chains = state.service.connections().connected_chains();
    Json(ChainsResponse { chains })
}

/// Submit a transaction and wait for its final outcome
async fn submit_transaction(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let tx = MinimalTransaction {
        chain_id: request.chain_id,
        to: request.to,
        from: request.from.unwrap_or_else(|| state.service.signer_address()),
        data: request.data.unwrap_or_default(),
        value: request.value.unwrap_or_default(),
    };

    match state
        .service
        .submit_and_confirm(request.chain_id, tx, request.gas_price)
        .await
    {
        Ok(receipt) => (
            StatusCode::OK,
            Json(SubmitResponse {
                receipt: receipt.summary(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: TxServiceError) -> Response {
    let reason = e.reason();
    let status = match reason {
        FailureReason::Configuration => StatusCode::BAD_REQUEST,
        FailureReason::ExecutionReverted => StatusCode::UNPROCESSABLE_ENTITY,
        FailureReason::NonceExpired | FailureReason::MaxGasPriceReached => StatusCode::CONFLICT,
        FailureReason::ConfirmationTimeout => StatusCode::GATEWAY_TIMEOUT,
        FailureReason::RpcFailure => StatusCode::BAD_GATEWAY,
        FailureReason::Signing | FailureReason::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            reason,
            message: e.to_string(),
            retryable: e.is_retryable(),
            receipt: e.receipt().map(|r| r.summary()),
        }),
    )
        .into_response()
}

// Request and response types

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    chain_id: u64,
    to: Address,
    /// Defaults to the service's signing address
    from: Option<Address>,
    data: Option<Bytes>,
    value: Option<U256>,
    /// Seed gas price; fetched from the chain when absent
    gas_price: Option<U256>,
}

#[derive(Serialize)]
struct SubmitResponse {
    receipt: ReceiptSummary,
}

#[derive(Serialize)]
struct ErrorResponse {
    reason: FailureReason,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    receipt: Option<ReceiptSummary>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: u64,
    healthy: bool,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<u64>,
}
