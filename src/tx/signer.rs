//! Signing capability used by chain connections to produce raw transactions

use super::types::FullTransaction;
use crate::error::{TxServiceError, TxServiceResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};
use tracing::debug;

/// Produces broadcast-ready signed payloads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Address transactions are signed for
    fn address(&self) -> Address;

    /// Sign a fully resolved transaction into its raw RLP encoding
    async fn sign(&self, tx: &FullTransaction) -> TxServiceResult<Bytes>;
}

/// Local private key signer
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load wallet from the named environment variable
    pub fn from_env(var: &str) -> TxServiceResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            TxServiceError::Signer(format!("No wallet configured. Set {}", var))
        })?;

        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| TxServiceError::Signer(format!("Invalid private key: {}", e)))?;

        Ok(Self::new(wallet))
    }
}

#[async_trait]
impl TransactionSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, tx: &FullTransaction) -> TxServiceResult<Bytes> {
        if tx.from != self.wallet.address() {
            return Err(TxServiceError::Signer(format!(
                "No key available for sender {:?}",
                tx.from
            )));
        }
        if tx.nonce.is_none() {
            return Err(TxServiceError::Signer(
                "Cannot sign transaction without a nonce".to_string(),
            ));
        }

        let wallet = self.wallet.clone().with_chain_id(tx.chain_id);
        let typed = tx.to_typed_transaction();
        let signature = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| TxServiceError::Signer(e.to_string()))?;

        debug!(
            "Signed transaction for chain {} with nonce {:?}",
            tx.chain_id, tx.nonce
        );
        Ok(typed.rlp_signed(&signature))
    }
}
