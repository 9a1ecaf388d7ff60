//! Transaction service driving attempts from first send to a terminal outcome

use super::attempt::Attempt;
use super::signer::TransactionSigner;
use super::types::{MinimalTransaction, Receipt};
use crate::chain::ConnectionRegistry;
use crate::config::TxServiceConfig;
use crate::error::{TxServiceError, TxServiceResult};

use ethers::types::{Address, U256};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

/// Lifecycle of one logical submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    Created,
    Sending,
    Confirming,
    BumpingAndResending,
    Succeeded,
    FatallyFailed,
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionState::Created => "created",
            SubmissionState::Sending => "sending",
            SubmissionState::Confirming => "confirming",
            SubmissionState::BumpingAndResending => "bumping_and_resending",
            SubmissionState::Succeeded => "succeeded",
            SubmissionState::FatallyFailed => "fatally_failed",
        };
        f.write_str(name)
    }
}

/// Submits transactions and drives them to finality or a classified failure
pub struct TransactionService {
    /// Connections indexed by chain ID
    connections: Arc<ConnectionRegistry>,
    /// Signer shared by every chain
    signer: Arc<dyn TransactionSigner>,
    /// Engine tunables
    config: Arc<TxServiceConfig>,
}

impl TransactionService {
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        signer: Arc<dyn TransactionSigner>,
        config: TxServiceConfig,
    ) -> Self {
        Self {
            connections,
            signer,
            config: Arc::new(config),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Address the service signs for
    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    /// Send a transaction and wait until it is final.
    ///
    /// Stuck transactions are replaced at a higher gas price under the same
    /// nonce until one broadcast is confirmed, the execution reverts, or the
    /// gas price ceiling is reached.
    pub async fn submit_and_confirm(
        &self,
        chain_id: u64,
        tx: MinimalTransaction,
        initial_gas_price: Option<U256>,
    ) -> TxServiceResult<Receipt> {
        let span = info_span!("submission", id = %Uuid::new_v4(), chain_id);
        let started = Instant::now();

        crate::metrics::record_tx_submitted(chain_id);

        let result = self
            .run_submission(chain_id, tx, initial_gas_price)
            .instrument(span)
            .await;

        match &result {
            Ok(_) => {
                crate::metrics::record_tx_confirmed(chain_id);
                crate::metrics::record_tx_latency(chain_id, started.elapsed().as_secs_f64());
            }
            Err(e) => crate::metrics::record_tx_failed(chain_id, e.reason()),
        }

        result
    }

    async fn run_submission(
        &self,
        chain_id: u64,
        tx: MinimalTransaction,
        initial_gas_price: Option<U256>,
    ) -> TxServiceResult<Receipt> {
        let mut state = SubmissionState::Created;

        let connection = match self.connections.get(chain_id) {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = %e, "Transaction submission rejected");
                return Err(e);
            }
        };
        if tx.chain_id != chain_id {
            let e = TxServiceError::Config(format!(
                "Transaction targets chain {} but was submitted to chain {}",
                tx.chain_id, chain_id
            ));
            error!(error = %e, "Transaction submission rejected");
            return Err(e);
        }

        let mut attempt = Attempt::new(
            connection,
            self.signer.clone(),
            self.config.clone(),
            tx,
            initial_gas_price,
        );

        transition(&mut state, SubmissionState::Sending);
        if let Err(e) = attempt.send().await {
            return Err(fail(&mut state, &attempt, e));
        }

        // Nothing was broadcast under a live nonce, so there is nothing to replace
        if attempt.nonce_expired() && attempt.responses().is_empty() {
            let e = TxServiceError::NonceExpired {
                chain_id,
                nonce: attempt.nonce(),
                gas_price: attempt.current_gas_price(),
            };
            return Err(fail(&mut state, &attempt, e));
        }

        loop {
            transition(&mut state, SubmissionState::Confirming);

            match attempt.confirm().await {
                Ok(receipt) if receipt.is_success() => {
                    transition(&mut state, SubmissionState::Succeeded);
                    info!(
                        hash = ?receipt.transaction_hash(),
                        block = ?receipt.block_number(),
                        confirmations = receipt.confirmations,
                        broadcasts = attempt.responses().len(),
                        "Transaction confirmed"
                    );
                    return Ok(receipt);
                }
                Ok(receipt) => {
                    // Resending the same call would revert the same way
                    let e = TxServiceError::ExecutionReverted {
                        chain_id,
                        tx_hash: receipt.transaction_hash(),
                        receipt: Box::new(receipt),
                    };
                    return Err(fail(&mut state, &attempt, e));
                }
                Err(TxServiceError::ConfirmationTimeout { .. }) if attempt.nonce_expired() => {
                    // A previous broadcast took the nonce but never showed up as confirmed
                    let e = TxServiceError::NonceExpired {
                        chain_id,
                        nonce: attempt.nonce(),
                        gas_price: attempt.current_gas_price(),
                    };
                    return Err(fail(&mut state, &attempt, e));
                }
                Err(TxServiceError::ConfirmationTimeout { .. }) => {
                    transition(&mut state, SubmissionState::BumpingAndResending);

                    if let Err(e) = attempt.bump_gas_price().await {
                        return Err(fail(&mut state, &attempt, e));
                    }
                    if let Err(e) = attempt.send().await {
                        return Err(fail(&mut state, &attempt, e));
                    }
                    if attempt.nonce_expired() {
                        info!(
                            nonce = ?attempt.nonce(),
                            "Replacement rejected for a used nonce, waiting on earlier broadcasts"
                        );
                    }
                }
                Err(e) => return Err(fail(&mut state, &attempt, e)),
            }
        }
    }
}

fn transition(state: &mut SubmissionState, next: SubmissionState) {
    debug!(from = %state, to = %next, "Submission state transition");
    *state = next;
}

/// Move to the failed state and log the failure with its diagnostics
fn fail(state: &mut SubmissionState, attempt: &Attempt, e: TxServiceError) -> TxServiceError {
    let stage = *state;
    transition(state, SubmissionState::FatallyFailed);
    error!(
        stage = %stage,
        reason = e.reason().as_str(),
        nonce = ?attempt.nonce(),
        gas_price = ?attempt.current_gas_price(),
        broadcasts = attempt.responses().len(),
        alert = e.should_alert(),
        error = %e,
        "Transaction submission failed"
    );
    e
}
