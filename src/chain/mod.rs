//! Chain module - per-chain connections used by the submission engine
//!
//! This module provides:
//! - The `ChainConnection` contract the engine broadcasts and polls through
//! - Multi-RPC provider management with automatic failover
//! - Typed classification of provider send errors
//! - A registry of connections keyed by chain ID

pub mod classify;
pub mod nonce;
pub mod provider;

pub use provider::ChainProvider;

#[cfg(test)]
pub use classify::{classify_send_error, SendErrorKind};

use crate::config::Settings;
use crate::error::{TxServiceError, TxServiceResult};
use crate::tx::{FullTransaction, Receipt, SubmittedTransaction, TransactionSigner};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Capability for talking to one chain through one or more RPC endpoints.
///
/// Implementations handle endpoint rotation internally and must be safe for
/// concurrent use by many submissions.
#[async_trait]
pub trait ChainConnection: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Confirmation depth a receipt needs before it is final
    fn confirmations_required(&self) -> u64;

    /// Live gas price quote
    async fn gas_price(&self) -> TxServiceResult<U256>;

    /// Sign and broadcast a transaction.
    ///
    /// A nonce collision is reported as `TxServiceError::NonceExpired`; any
    /// other failure to get the transaction accepted is an error.
    async fn broadcast(
        &self,
        tx: &FullTransaction,
        signer: &dyn TransactionSigner,
    ) -> TxServiceResult<SubmittedTransaction>;

    /// Poll for a receipt until it reaches the required depth, reverts, or
    /// `timeout` elapses. On timeout the last observed receipt (possibly below
    /// the required depth) is returned, or `None` if the transaction was never
    /// seen mined.
    async fn poll_receipt(&self, tx_hash: H256, timeout: Duration)
        -> TxServiceResult<Option<Receipt>>;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Connections to all configured chains, built once at startup
pub struct ConnectionRegistry {
    connections: DashMap<u64, Arc<dyn ChainConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Create providers for every enabled chain
    pub async fn from_settings(settings: &Settings) -> TxServiceResult<Self> {
        let registry = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {}) with {} RPC endpoints",
                name,
                chain_config.chain_id,
                chain_config.rpc_urls.len()
            );

            let provider = ChainProvider::new(chain_config.clone()).await?;
            registry.insert(Arc::new(provider));
        }

        Ok(registry)
    }

    pub fn insert(&self, connection: Arc<dyn ChainConnection>) {
        self.connections.insert(connection.chain_id(), connection);
    }

    /// Get connection for a specific chain
    pub fn get(&self, chain_id: u64) -> TxServiceResult<Arc<dyn ChainConnection>> {
        self.connections
            .get(&chain_id)
            .map(|c| c.clone())
            .ok_or(TxServiceError::ChainNotFound { chain_id })
    }

    /// Get all connected chain IDs
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.connections.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut results = Vec::with_capacity(connections.len());
        for (chain_id, connection) in connections {
            let healthy = connection.health_check().await;
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results.sort_unstable_by_key(|(chain_id, _)| *chain_id);
        results
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
