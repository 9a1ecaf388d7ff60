//! Transaction shapes flowing through the submission engine

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, H256, U256, U64};
use serde::{Deserialize, Serialize};

/// Caller-supplied transaction, never mutated by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimalTransaction {
    pub chain_id: u64,
    pub to: Address,
    pub from: Address,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub value: U256,
}

impl MinimalTransaction {
    /// Resolve into a broadcastable transaction at the given gas price
    pub fn to_full(&self, gas_price: U256, nonce: Option<u64>) -> FullTransaction {
        FullTransaction {
            chain_id: self.chain_id,
            to: self.to,
            from: self.from,
            data: self.data.clone(),
            value: self.value,
            gas_price,
            nonce,
            gas_limit: None,
        }
    }
}

/// Minimal transaction plus the parameters resolved just before broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTransaction {
    pub chain_id: u64,
    pub to: Address,
    pub from: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_price: U256,
    /// Unset on the first broadcast; the connection allocates one
    pub nonce: Option<u64>,
    /// Filled by the connection from an estimate when unset
    pub gas_limit: Option<U256>,
}

impl FullTransaction {
    /// Build the legacy (gas price) ethers request for signing
    pub fn to_typed_transaction(&self) -> TypedTransaction {
        let mut request = TransactionRequest::new()
            .chain_id(self.chain_id)
            .from(self.from)
            .to(self.to)
            .data(self.data.clone())
            .value(self.value)
            .gas_price(self.gas_price);

        if let Some(nonce) = self.nonce {
            request = request.nonce(nonce);
        }
        if let Some(gas_limit) = self.gas_limit {
            request = request.gas(gas_limit);
        }

        TypedTransaction::Legacy(request)
    }
}

/// Record of one successful broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransaction {
    pub chain_id: u64,
    pub hash: H256,
    pub nonce: u64,
    pub gas_price: U256,
}

/// Transaction receipt together with the confirmation depth observed for it
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub inner: TransactionReceipt,
    pub confirmations: u64,
}

impl Receipt {
    pub fn new(inner: TransactionReceipt, confirmations: u64) -> Self {
        Self {
            inner,
            confirmations,
        }
    }

    /// Status 0 marks a reverted execution; pre-byzantium receipts carry no status
    pub fn is_reverted(&self) -> bool {
        self.inner.status == Some(U64::zero())
    }

    pub fn is_success(&self) -> bool {
        !self.is_reverted()
    }

    pub fn transaction_hash(&self) -> H256 {
        self.inner.transaction_hash
    }

    pub fn block_number(&self) -> Option<u64> {
        self.inner.block_number.map(|b| b.as_u64())
    }

    pub fn summary(&self) -> ReceiptSummary {
        ReceiptSummary {
            transaction_hash: self.transaction_hash(),
            block_number: self.block_number(),
            status: self.inner.status.map(|s| s.as_u64()),
            confirmations: self.confirmations,
            gas_used: self.inner.gas_used,
            effective_gas_price: self.inner.effective_gas_price,
        }
    }
}

/// Serializable view of a receipt for API responses
#[derive(Debug, Clone, Serialize)]
pub struct ReceiptSummary {
    pub transaction_hash: H256,
    pub block_number: Option<u64>,
    pub status: Option<u64>,
    pub confirmations: u64,
    pub gas_used: Option<U256>,
    pub effective_gas_price: Option<U256>,
}
