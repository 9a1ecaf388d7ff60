//! Test doubles: an in-memory chain connection with scripted broadcast and
//! receipt behaviour, and a JSON-RPC endpoint stub for the ethers provider

use crate::chain::{classify_send_error, ChainConnection, SendErrorKind};
use crate::config::TxServiceConfig;
use crate::error::{TxServiceError, TxServiceResult};
use crate::tx::{
    FullTransaction, MinimalTransaction, MockTransactionSigner, Receipt, SubmittedTransaction,
    TransactionSigner,
};

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const CHAIN_ID: u64 = 1337;

/// Outcome of one `poll_receipt` call
#[derive(Debug, Clone)]
pub enum PollStep {
    /// Not mined within the timeout
    Missing,
    /// Mined with the given status and depth, reported after `delay`
    Mined {
        success: bool,
        confirmations: u64,
        delay: Duration,
    },
}

impl PollStep {
    pub fn confirmed(confirmations: u64) -> Self {
        PollStep::Mined {
            success: true,
            confirmations,
            delay: Duration::ZERO,
        }
    }

    pub fn reverted_after(delay: Duration) -> Self {
        PollStep::Mined {
            success: false,
            confirmations: 1,
            delay,
        }
    }
}

#[derive(Default)]
struct ScriptState {
    gas_price: Option<U256>,
    rejections: VecDeque<Option<String>>,
    sent: Vec<FullTransaction>,
    polls: HashMap<H256, VecDeque<PollStep>>,
    poll_calls: HashMap<H256, usize>,
    accepted: u64,
}

/// Chain connection whose behaviour is scripted per test
pub struct ScriptedConnection {
    confirmations_required: u64,
    base_nonce: u64,
    state: Mutex<ScriptState>,
}

/// Hash the scripted connection assigns to the `n`th accepted broadcast (1-based)
pub fn tx_hash(n: u64) -> H256 {
    H256::from_low_u64_be(n)
}

impl ScriptedConnection {
    pub fn new(confirmations_required: u64) -> Self {
        Self {
            confirmations_required,
            base_nonce: 7,
            state: Mutex::new(ScriptState {
                gas_price: Some(U256::from(100)),
                ..Default::default()
            }),
        }
    }

    pub fn with_gas_price(self, price: Option<U256>) -> Self {
        self.state.lock().unwrap().gas_price = price;
        self
    }

    /// Script the next broadcasts: `None` accepts, `Some(message)` rejects
    pub fn with_broadcasts(self, steps: Vec<Option<&str>>) -> Self {
        self.state.lock().unwrap().rejections =
            steps.into_iter().map(|s| s.map(str::to_string)).collect();
        self
    }

    /// Script successive polls of a hash; the last step repeats
    pub fn with_polls(self, hash: H256, steps: Vec<PollStep>) -> Self {
        self.state.lock().unwrap().polls.insert(hash, steps.into());
        self
    }

    pub fn sent(&self) -> Vec<FullTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn poll_calls(&self, hash: H256) -> usize {
        self.state
            .lock()
            .unwrap()
            .poll_calls
            .get(&hash)
            .copied()
            .unwrap_or(0)
    }

    fn next_poll_step(&self, hash: H256) -> PollStep {
        let mut state = self.state.lock().unwrap();
        *state.poll_calls.entry(hash).or_default() += 1;
        match state.polls.get_mut(&hash) {
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap_or(PollStep::Missing),
            Some(steps) => steps.front().cloned().unwrap_or(PollStep::Missing),
            None => PollStep::Missing,
        }
    }
}

#[async_trait]
impl ChainConnection for ScriptedConnection {
    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    fn confirmations_required(&self) -> u64 {
        self.confirmations_required
    }

    async fn gas_price(&self) -> TxServiceResult<U256> {
        self.state
            .lock()
            .unwrap()
            .gas_price
            .ok_or_else(|| TxServiceError::Rpc {
                chain_id: CHAIN_ID,
                message: "All providers failed to get gas price".to_string(),
            })
    }

    async fn broadcast(
        &self,
        tx: &FullTransaction,
        signer: &dyn TransactionSigner,
    ) -> TxServiceResult<SubmittedTransaction> {
        let mut signed = tx.clone();
        signed.nonce = Some(tx.nonce.unwrap_or(self.base_nonce));
        signer.sign(&signed).await?;

        let mut state = self.state.lock().unwrap();
        state.sent.push(tx.clone());

        if let Some(Some(message)) = state.rejections.pop_front() {
            return Err(match classify_send_error(&message) {
                SendErrorKind::NonceExpired => TxServiceError::NonceExpired {
                    chain_id: CHAIN_ID,
                    nonce: signed.nonce,
                    gas_price: Some(tx.gas_price),
                },
                _ => TxServiceError::Rpc {
                    chain_id: CHAIN_ID,
                    message,
                },
            });
        }

        state.accepted += 1;
        Ok(SubmittedTransaction {
            chain_id: CHAIN_ID,
            hash: tx_hash(state.accepted),
            nonce: signed.nonce.unwrap_or(self.base_nonce),
            gas_price: tx.gas_price,
        })
    }

    async fn poll_receipt(
        &self,
        tx_hash: H256,
        timeout: Duration,
    ) -> TxServiceResult<Option<Receipt>> {
        match self.next_poll_step(tx_hash) {
            PollStep::Missing => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
            PollStep::Mined {
                success,
                confirmations,
                delay,
            } => {
                tokio::time::sleep(delay).await;
                Ok(Some(receipt(tx_hash, success, confirmations)))
            }
        }
    }
}

pub fn receipt(hash: H256, success: bool, confirmations: u64) -> Receipt {
    Receipt::new(
        TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(100)),
            status: Some(U64::from(success as u64)),
            ..Default::default()
        },
        confirmations,
    )
}

pub fn minimal_tx() -> MinimalTransaction {
    MinimalTransaction {
        chain_id: CHAIN_ID,
        to: Address::repeat_byte(0xbb),
        from: Address::repeat_byte(0xaa),
        data: Bytes::from(vec![0xde, 0xad]),
        value: U256::zero(),
    }
}

pub fn test_config(bump_percent: u64, ceiling: u64) -> TxServiceConfig {
    TxServiceConfig {
        confirmation_timeout: Duration::from_secs(10),
        confirmation_timeout_extension_multiplier: 2,
        gas_replacement_bump_percent: bump_percent,
        gas_price_ceiling: U256::from(ceiling),
        chain_initial_gas_price: HashMap::new(),
    }
}

pub fn mock_signer() -> MockTransactionSigner {
    let mut signer = MockTransactionSigner::new();
    signer
        .expect_address()
        .return_const(Address::repeat_byte(0xaa));
    signer
        .expect_sign()
        .returning(|_| Ok(Bytes::from(vec![0x01])));
    signer
}

/// Reply of a stubbed JSON-RPC endpoint to one call
pub enum RpcReply {
    Result(Value),
    /// JSON-RPC error object with code -32000
    Error(&'static str),
    /// HTTP 502 with a non-JSON body
    Unavailable,
}

type RpcHandler = Arc<dyn Fn(&str, &Value) -> RpcReply + Send + Sync>;

#[derive(Clone)]
struct RpcStubState {
    handler: RpcHandler,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

/// Local HTTP JSON-RPC endpoint answering through a handler per method
pub struct RpcStub {
    pub url: String,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
    server: JoinHandle<()>,
}

impl RpcStub {
    pub async fn spawn<F>(handler: F) -> Self
    where
        F: Fn(&str, &Value) -> RpcReply + Send + Sync + 'static,
    {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let state = RpcStubState {
            handler: Arc::new(handler),
            calls: calls.clone(),
        };
        let app = Router::new().route("/", post(rpc_handler)).with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, calls, server }
    }

    /// Params of every call made to `method`, in arrival order
    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

impl Drop for RpcStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn rpc_handler(State(state): State<RpcStubState>, Json(request): Json<Value>) -> Response {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let params = request["params"].clone();
    let id = request["id"].clone();

    state
        .calls
        .lock()
        .unwrap()
        .push((method.clone(), params.clone()));

    match (state.handler)(&method, &params) {
        RpcReply::Result(result) => {
            Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })).into_response()
        }
        RpcReply::Error(message) => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32000, "message": message },
        }))
        .into_response(),
        RpcReply::Unavailable => (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response(),
    }
}
