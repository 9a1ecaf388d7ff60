//! Chain provider with multi-RPC support and automatic failover

use super::classify::{classify_send_error, SendErrorKind};
use super::nonce::NonceTracker;
use super::ChainConnection;
use crate::config::ChainConfig;
use crate::error::{TxServiceError, TxServiceResult};
use crate::tx::{FullTransaction, Receipt, SubmittedTransaction, TransactionSigner};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError};
use ethers::utils::keccak256;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Local nonce allocation for first broadcasts
    nonces: NonceTracker,
    confirmations_required: u64,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> TxServiceResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(config.poll_interval());
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TxServiceError::Rpc {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        // Endpoints pointing at the wrong network would sign replays for another chain
        match http_providers[0].get_chainid().await {
            Ok(reported) if reported != U256::from(config.chain_id) => {
                return Err(TxServiceError::Config(format!(
                    "RPC for chain {} reports chain ID {}",
                    config.chain_id, reported
                )));
            }
            Ok(_) => info!("Connected to chain {} ({})", config.chain_id, config.name),
            Err(e) => warn!(
                "Could not verify chain ID for chain {}: {}",
                config.chain_id, e
            ),
        }

        let confirmations_required = config.confirmations_required();
        let nonces = NonceTracker::new(config.chain_id);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            nonces,
            confirmations_required,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read operation against each endpoint until one succeeds
    async fn with_failover<T, F, Fut>(&self, operation: &str, f: F) -> TxServiceResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match f(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Failed to {} on chain {}: {}",
                        operation, self.config.chain_id, e
                    );
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(TxServiceError::Rpc {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to {}: {}", operation, last_error),
        })
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> TxServiceResult<u64> {
        self.with_failover("get block number", |p| async move {
            p.get_block_number().await
        })
        .await
        .map(|b| b.as_u64())
    }

    /// Get transaction receipt with failover
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> TxServiceResult<Option<TransactionReceipt>> {
        self.with_failover("get transaction receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Count of transactions sent by `sender`, including pending ones
    async fn pending_count(&self, sender: Address) -> TxServiceResult<u64> {
        self.with_failover("get transaction count", |p| async move {
            p.get_transaction_count(sender, Some(BlockNumber::Pending.into()))
                .await
        })
        .await
        .map(|n| n.as_u64())
    }

    /// Estimate gas for a transaction
    async fn estimate_gas(&self, tx: &FullTransaction) -> TxServiceResult<U256> {
        let typed = tx.to_typed_transaction();
        self.with_failover("estimate gas", |p| {
            let typed = typed.clone();
            async move { p.estimate_gas(&typed, None).await }
        })
        .await
    }

    async fn sign_and_send(
        &self,
        tx: &mut FullTransaction,
        signer: &dyn TransactionSigner,
    ) -> TxServiceResult<SubmittedTransaction> {
        let chain_id = self.config.chain_id;
        let nonce = tx.nonce.ok_or_else(|| {
            TxServiceError::Internal("Transaction nonce not resolved before send".to_string())
        })?;

        if tx.gas_limit.is_none() {
            tx.gas_limit = Some(self.estimate_gas(tx).await?);
        }

        let raw = signer.sign(tx).await?;
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match self.http().send_raw_transaction(raw.clone()).await {
                Ok(pending) => {
                    return Ok(SubmittedTransaction {
                        chain_id,
                        hash: pending.tx_hash(),
                        nonce,
                        gas_price: tx.gas_price,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    match classify_send_error(&message) {
                        // An earlier endpoint delivered it before the call failed
                        SendErrorKind::AlreadyKnown => {
                            let hash = H256::from(keccak256(&raw));
                            info!(
                                "Transaction {:?} already known on chain {}",
                                hash, chain_id
                            );
                            return Ok(SubmittedTransaction {
                                chain_id,
                                hash,
                                nonce,
                                gas_price: tx.gas_price,
                            });
                        }
                        SendErrorKind::NonceExpired => {
                            return Err(TxServiceError::NonceExpired {
                                chain_id,
                                nonce: Some(nonce),
                                gas_price: Some(tx.gas_price),
                            });
                        }
                        // The node evaluated and rejected the transaction; other
                        // endpoints see the same state
                        SendErrorKind::Underpriced | SendErrorKind::InsufficientFunds => {
                            return Err(TxServiceError::Rpc { chain_id, message });
                        }
                        SendErrorKind::Other => {
                            warn!(
                                "Failed to send transaction on chain {}: {}",
                                chain_id, message
                            );
                            last_error = message;
                            self.failover();
                        }
                    }
                }
            }
        }

        Err(TxServiceError::Rpc {
            chain_id,
            message: format!("All providers failed to send transaction: {}", last_error),
        })
    }
}

#[async_trait]
impl ChainConnection for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn confirmations_required(&self) -> u64 {
        self.confirmations_required
    }

    async fn gas_price(&self) -> TxServiceResult<U256> {
        self.with_failover("get gas price", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn broadcast(
        &self,
        tx: &FullTransaction,
        signer: &dyn TransactionSigner,
    ) -> TxServiceResult<SubmittedTransaction> {
        let mut tx = tx.clone();

        let allocated = match tx.nonce {
            Some(_) => None,
            None => {
                let pending = self.pending_count(tx.from).await?;
                let nonce = self.nonces.allocate(tx.from, pending).await;
                tx.nonce = Some(nonce);
                Some(nonce)
            }
        };

        let result = self.sign_and_send(&mut tx, signer).await;

        if let Some(nonce) = allocated {
            match &result {
                Ok(_) | Err(TxServiceError::NonceExpired { .. }) => {
                    self.nonces.settle(tx.from, nonce).await
                }
                Err(_) => self.nonces.release(tx.from, nonce).await,
            }
        }

        result
    }

    async fn poll_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> TxServiceResult<Option<Receipt>> {
        let deadline = Instant::now() + timeout;
        let interval = self.config.poll_interval();
        let mut latest: Option<Receipt> = None;

        loop {
            match self.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if let Some(block) = receipt.block_number {
                        match self.get_block_number().await {
                            Ok(current) => {
                                let confirmations =
                                    current.saturating_sub(block.as_u64()) + 1;
                                let receipt = Receipt::new(receipt, confirmations);
                                if receipt.is_reverted()
                                    || confirmations >= self.confirmations_required
                                {
                                    return Ok(Some(receipt));
                                }
                                debug!(
                                    "Transaction {:?} has {} / {} confirmations on chain {}",
                                    tx_hash,
                                    confirmations,
                                    self.confirmations_required,
                                    self.config.chain_id
                                );
                                latest = Some(receipt);
                            }
                            Err(e) => debug!("Block number unavailable: {}", e),
                        }
                    }
                }
                // Dropped or reorged out
                Ok(None) => latest = None,
                Err(e) => debug!("Receipt poll for {:?} failed: {}", tx_hash, e),
            }

            // Leave room to report a partial receipt before the caller's round ends
            if Instant::now() + interval >= deadline {
                return Ok(latest);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Health check failed for chain {}: {}",
                    self.config.chain_id, e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{minimal_tx, mock_signer, tx_hash, RpcReply, RpcStub, CHAIN_ID};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn chain_config(rpc_urls: Vec<String>, confirmations: u64) -> ChainConfig {
        ChainConfig {
            chain_id: CHAIN_ID,
            name: "Local".to_string(),
            rpc_urls,
            confirmations_required: Some(confirmations),
            initial_gas_price: None,
            poll_interval_ms: 10,
            enabled: true,
        }
    }

    fn quantity(n: u64) -> Value {
        json!(format!("{:#x}", n))
    }

    /// Reads every broadcast needs: chain id, pending count 5, gas estimate
    fn chain_reads(method: &str) -> RpcReply {
        match method {
            "eth_chainId" => RpcReply::Result(quantity(CHAIN_ID)),
            "eth_getTransactionCount" => RpcReply::Result(quantity(5)),
            "eth_estimateGas" => RpcReply::Result(quantity(21_000)),
            _ => RpcReply::Unavailable,
        }
    }

    fn receipt_json(hash: H256, block: u64, success: bool) -> Value {
        serde_json::to_value(TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(block.into()),
            status: Some((success as u64).into()),
            ..Default::default()
        })
        .unwrap()
    }

    fn full_tx() -> FullTransaction {
        minimal_tx().to_full(U256::from(10), None)
    }

    fn sender() -> Address {
        minimal_tx().from
    }

    #[tokio::test]
    async fn test_read_fails_over_to_next_endpoint() {
        let down = RpcStub::spawn(|_, _| RpcReply::Unavailable).await;
        let up = RpcStub::spawn(|method, _| match method {
            "eth_gasPrice" => RpcReply::Result(quantity(100)),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![down.url.clone(), up.url.clone()], 1))
            .await
            .unwrap();

        assert_eq!(provider.gas_price().await.unwrap(), U256::from(100));
        assert_eq!(provider.gas_price().await.unwrap(), U256::from(100));
        // The healthy endpoint stays active
        assert_eq!(down.calls("eth_gasPrice").len(), 1);
        assert_eq!(up.calls("eth_gasPrice").len(), 2);
    }

    #[tokio::test]
    async fn test_read_fails_when_every_endpoint_fails() {
        let a = RpcStub::spawn(|_, _| RpcReply::Unavailable).await;
        let b = RpcStub::spawn(|_, _| RpcReply::Unavailable).await;
        let provider = ChainProvider::new(chain_config(vec![a.url.clone(), b.url.clone()], 1))
            .await
            .unwrap();

        let err = provider.gas_price().await.unwrap_err();
        assert!(matches!(err, TxServiceError::Rpc { chain_id: CHAIN_ID, .. }));
        assert!(!provider.health_check().await);
    }

    #[tokio::test]
    async fn test_rejects_endpoint_for_another_chain() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_chainId" => RpcReply::Result(quantity(1)),
            _ => RpcReply::Unavailable,
        })
        .await;

        let err = ChainProvider::new(chain_config(vec![stub.url.clone()], 1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TxServiceError::Config(_)));
    }

    #[tokio::test]
    async fn test_broadcast_allocates_nonce_and_estimates_gas() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Result(json!(format!("{:?}", tx_hash(9)))),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 1))
            .await
            .unwrap();

        let submitted = provider.broadcast(&full_tx(), &mock_signer()).await.unwrap();
        assert_eq!(submitted.hash, tx_hash(9));
        assert_eq!(submitted.nonce, 5);
        assert_eq!(submitted.gas_price, U256::from(10));
        assert_eq!(stub.calls("eth_estimateGas").len(), 1);
        assert_eq!(stub.calls("eth_sendRawTransaction")[0], json!(["0x01"]));
        assert_eq!(provider.nonces.peek(sender()).await, 6);
    }

    #[tokio::test]
    async fn test_already_known_after_failover_is_accepted() {
        // First endpoint receives the raw transaction but the call fails
        let first = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Unavailable,
            _ => chain_reads(method),
        })
        .await;
        let second = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Error("already known"),
            _ => chain_reads(method),
        })
        .await;
        let provider =
            ChainProvider::new(chain_config(vec![first.url.clone(), second.url.clone()], 1))
                .await
                .unwrap();

        let submitted = provider.broadcast(&full_tx(), &mock_signer()).await.unwrap();

        assert_eq!(first.calls("eth_sendRawTransaction").len(), 1);
        assert_eq!(second.calls("eth_sendRawTransaction").len(), 1);
        assert_eq!(submitted.hash, H256::from(keccak256([0x01u8])));
        assert_eq!(submitted.nonce, 5);
        // The in-flight transaction keeps its nonce
        assert_eq!(provider.nonces.peek(sender()).await, 6);
    }

    #[tokio::test]
    async fn test_used_nonce_is_not_released() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Error("nonce too low"),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 1))
            .await
            .unwrap();

        let err = provider.broadcast(&full_tx(), &mock_signer()).await.unwrap_err();
        assert!(matches!(
            err,
            TxServiceError::NonceExpired { nonce: Some(5), .. }
        ));
        assert_eq!(provider.nonces.peek(sender()).await, 6);
    }

    #[tokio::test]
    async fn test_underpriced_is_not_retried_on_other_endpoints() {
        let first = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Error("replacement transaction underpriced"),
            _ => chain_reads(method),
        })
        .await;
        let second = RpcStub::spawn(chain_reads_with_hash).await;
        let provider =
            ChainProvider::new(chain_config(vec![first.url.clone(), second.url.clone()], 1))
                .await
                .unwrap();

        let err = provider.broadcast(&full_tx(), &mock_signer()).await.unwrap_err();
        assert!(matches!(err, TxServiceError::Rpc { .. }));
        assert!(second.calls("eth_sendRawTransaction").is_empty());
        // Never accepted, so the nonce goes back to the pool
        assert_eq!(provider.nonces.peek(sender()).await, 5);
    }

    #[tokio::test]
    async fn test_unknown_send_error_fails_over() {
        let first = RpcStub::spawn(|method, _| match method {
            "eth_sendRawTransaction" => RpcReply::Error("internal server error"),
            _ => chain_reads(method),
        })
        .await;
        let second = RpcStub::spawn(chain_reads_with_hash).await;
        let provider =
            ChainProvider::new(chain_config(vec![first.url.clone(), second.url.clone()], 1))
                .await
                .unwrap();

        let submitted = provider.broadcast(&full_tx(), &mock_signer()).await.unwrap();
        assert_eq!(submitted.hash, tx_hash(9));
        assert_eq!(second.calls("eth_sendRawTransaction").len(), 1);
    }

    fn chain_reads_with_hash(method: &str, _: &Value) -> RpcReply {
        match method {
            "eth_sendRawTransaction" => RpcReply::Result(json!(format!("{:?}", tx_hash(9)))),
            _ => chain_reads(method),
        }
    }

    #[tokio::test]
    async fn test_poll_waits_for_required_depth() {
        let head = Arc::new(AtomicU64::new(100));
        let stub = RpcStub::spawn(move |method, _| match method {
            "eth_blockNumber" => RpcReply::Result(quantity(head.fetch_add(1, Ordering::SeqCst))),
            "eth_getTransactionReceipt" => RpcReply::Result(receipt_json(tx_hash(1), 100, true)),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 3))
            .await
            .unwrap();

        let receipt = provider
            .poll_receipt(tx_hash(1), Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();

        // Head 102 over inclusion block 100
        assert_eq!(receipt.confirmations, 3);
        assert!(receipt.is_success());
        assert_eq!(stub.calls("eth_blockNumber").len(), 3);
    }

    #[tokio::test]
    async fn test_poll_returns_partial_receipt_at_deadline() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_blockNumber" => RpcReply::Result(quantity(100)),
            "eth_getTransactionReceipt" => RpcReply::Result(receipt_json(tx_hash(1), 100, true)),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 3))
            .await
            .unwrap();

        let receipt = provider
            .poll_receipt(tx_hash(1), Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(receipt.confirmations, 1);
        assert!(stub.calls("eth_getTransactionReceipt").len() > 1);
    }

    #[tokio::test]
    async fn test_poll_returns_revert_without_waiting_for_depth() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_blockNumber" => RpcReply::Result(quantity(100)),
            "eth_getTransactionReceipt" => RpcReply::Result(receipt_json(tx_hash(1), 100, false)),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 12))
            .await
            .unwrap();

        let receipt = provider
            .poll_receipt(tx_hash(1), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        assert!(receipt.is_reverted());
        assert_eq!(stub.calls("eth_getTransactionReceipt").len(), 1);
    }

    #[tokio::test]
    async fn test_poll_unmined_returns_none() {
        let stub = RpcStub::spawn(|method, _| match method {
            "eth_getTransactionReceipt" => RpcReply::Result(Value::Null),
            _ => chain_reads(method),
        })
        .await;
        let provider = ChainProvider::new(chain_config(vec![stub.url.clone()], 1))
            .await
            .unwrap();

        let receipt = provider
            .poll_receipt(tx_hash(1), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(receipt.is_none());
    }
}
