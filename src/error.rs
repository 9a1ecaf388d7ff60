//! Error types for the transaction service

use crate::tx::Receipt;

use ethers::types::{H256, U256};
use serde::Serialize;
use thiserror::Error;

/// Main error type for the transaction service
#[derive(Error, Debug)]
pub enum TxServiceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: u64 },

    #[error("Nonce {nonce:?} already consumed on chain {chain_id} (gas price {gas_price:?})")]
    NonceExpired {
        chain_id: u64,
        nonce: Option<u64>,
        gas_price: Option<U256>,
    },

    #[error("Timed out waiting for confirmation on chain {chain_id} (nonce {nonce:?}, gas price {gas_price:?})")]
    ConfirmationTimeout {
        chain_id: u64,
        nonce: Option<u64>,
        gas_price: Option<U256>,
    },

    #[error("Gas price {attempted} would exceed the maximum of {max} on chain {chain_id}")]
    MaxGasPriceReached {
        chain_id: u64,
        attempted: U256,
        max: U256,
    },

    #[error("RPC failure on chain {chain_id}: {message}")]
    Rpc { chain_id: u64, message: String },

    #[error("Transaction {tx_hash:?} reverted on chain {chain_id}")]
    ExecutionReverted {
        chain_id: u64,
        tx_hash: H256,
        receipt: Box<Receipt>,
    },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classification surfaced to callers, independent of error payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    NonceExpired,
    ConfirmationTimeout,
    MaxGasPriceReached,
    RpcFailure,
    ExecutionReverted,
    Configuration,
    Signing,
    Internal,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::NonceExpired => "nonce_expired",
            FailureReason::ConfirmationTimeout => "confirmation_timeout",
            FailureReason::MaxGasPriceReached => "max_gas_price_reached",
            FailureReason::RpcFailure => "rpc_failure",
            FailureReason::ExecutionReverted => "execution_reverted",
            FailureReason::Configuration => "configuration",
            FailureReason::Signing => "signing",
            FailureReason::Internal => "internal",
        }
    }
}

impl TxServiceError {
    /// Classify the error into its failure reason
    pub fn reason(&self) -> FailureReason {
        match self {
            TxServiceError::Config(_) | TxServiceError::ChainNotFound { .. } => {
                FailureReason::Configuration
            }
            TxServiceError::NonceExpired { .. } => FailureReason::NonceExpired,
            TxServiceError::ConfirmationTimeout { .. } => FailureReason::ConfirmationTimeout,
            TxServiceError::MaxGasPriceReached { .. } => FailureReason::MaxGasPriceReached,
            TxServiceError::Rpc { .. } => FailureReason::RpcFailure,
            TxServiceError::ExecutionReverted { .. } => FailureReason::ExecutionReverted,
            TxServiceError::Signer(_) => FailureReason::Signing,
            TxServiceError::Internal(_) => FailureReason::Internal,
        }
    }

    /// Check if the caller may retry the whole submission with a fresh attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TxServiceError::ConfirmationTimeout { .. } | TxServiceError::Rpc { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxServiceError::MaxGasPriceReached { .. } | TxServiceError::Signer(_)
        )
    }

    /// Receipt attached to a reverted execution, if any
    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            TxServiceError::ExecutionReverted { receipt, .. } => Some(receipt.as_ref()),
            _ => None,
        }
    }
}

/// Result type for transaction service operations
pub type TxServiceResult<T> = Result<T, TxServiceError>;
