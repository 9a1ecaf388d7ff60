//! A single logical transaction, resent under one nonce at rising gas prices

use super::gas::{bumped_gas_price, ensure_below_ceiling, resolve_gas_price};
use super::signer::TransactionSigner;
use super::types::{FullTransaction, MinimalTransaction, Receipt, SubmittedTransaction};
use crate::chain::ChainConnection;
use crate::config::TxServiceConfig;
use crate::error::{TxServiceError, TxServiceResult};

use ethers::types::{H256, U256};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Result of one confirmation poll round
enum RoundOutcome {
    Confirmed(Receipt),
    Reverted(Receipt),
    Pending,
}

/// One logical submission: a transaction plus every broadcast made for it.
///
/// `responses` only grows, in send order, and every entry carries the nonce
/// captured from the first successful broadcast.
pub struct Attempt {
    connection: Arc<dyn ChainConnection>,
    signer: Arc<dyn TransactionSigner>,
    config: Arc<TxServiceConfig>,
    tx: MinimalTransaction,
    responses: Vec<SubmittedTransaction>,
    receipt: Option<Receipt>,
    nonce: Option<u64>,
    nonce_expired: bool,
    gas_price: Option<U256>,
    /// A response was seen mined below the required depth during this confirm
    received_confirmation: bool,
}

impl Attempt {
    pub fn new(
        connection: Arc<dyn ChainConnection>,
        signer: Arc<dyn TransactionSigner>,
        config: Arc<TxServiceConfig>,
        tx: MinimalTransaction,
        initial_gas_price: Option<U256>,
    ) -> Self {
        Self {
            connection,
            signer,
            config,
            tx,
            responses: Vec::new(),
            receipt: None,
            nonce: None,
            nonce_expired: false,
            gas_price: initial_gas_price,
            received_confirmation: false,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.connection.chain_id()
    }

    pub fn responses(&self) -> &[SubmittedTransaction] {
        &self.responses
    }

    #[cfg(test)]
    pub fn receipt(&self) -> Option<&Receipt> {
        self.receipt.as_ref()
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn nonce_expired(&self) -> bool {
        self.nonce_expired
    }

    /// Gas price for the next broadcast, if it has been resolved
    pub fn current_gas_price(&self) -> Option<U256> {
        self.gas_price
    }

    /// Gas price for the next broadcast, querying the chain when unset
    pub async fn gas_price(&mut self) -> TxServiceResult<U256> {
        if let Some(price) = self.gas_price {
            return Ok(price);
        }

        let price = resolve_gas_price(self.connection.as_ref(), &self.config).await?;
        self.gas_price = Some(price);
        Ok(price)
    }

    async fn full_transaction(&mut self) -> TxServiceResult<FullTransaction> {
        let gas_price = self.gas_price().await?;
        Ok(self.tx.to_full(gas_price, self.nonce))
    }

    /// Broadcast the transaction at the current gas price.
    ///
    /// A nonce collision marks the attempt's nonce as expired and returns
    /// `Ok`: a previous broadcast of this attempt was most likely mined.
    pub async fn send(&mut self) -> TxServiceResult<()> {
        let chain_id = self.chain_id();

        if self.nonce_expired {
            return Err(TxServiceError::NonceExpired {
                chain_id,
                nonce: self.nonce,
                gas_price: self.gas_price,
            });
        }

        let full = self.full_transaction().await?;
        info!(
            chain_id,
            to = ?full.to,
            from = ?full.from,
            value = %full.value,
            nonce = ?full.nonce,
            gas_price = %full.gas_price,
            "Attempting to send transaction"
        );

        match self
            .connection
            .broadcast(&full, self.signer.as_ref())
            .await
        {
            Ok(response) => {
                match self.nonce {
                    None => self.nonce = Some(response.nonce),
                    Some(nonce) if nonce != response.nonce => {
                        error!(
                            chain_id,
                            expected = nonce,
                            actual = response.nonce,
                            hash = ?response.hash,
                            "Broadcast reported a different nonce"
                        );
                        return Err(TxServiceError::Internal(format!(
                            "Broadcast used nonce {} instead of {}",
                            response.nonce, nonce
                        )));
                    }
                    Some(_) => {}
                }

                info!(
                    chain_id,
                    hash = ?response.hash,
                    gas_price = %response.gas_price,
                    nonce = response.nonce,
                    "Transaction submitted"
                );
                crate::metrics::record_tx_broadcast(chain_id);
                self.responses.push(response);
                Ok(())
            }
            Err(TxServiceError::NonceExpired { nonce, .. }) => {
                self.nonce_expired = true;
                info!(
                    chain_id,
                    nonce = ?nonce.or(self.nonce),
                    gas_price = %full.gas_price,
                    responses = self.responses.len(),
                    "Nonce already used"
                );
                Ok(())
            }
            Err(e) => {
                error!(chain_id, error = %e, "Failed to send transaction");
                Err(e)
            }
        }
    }

    /// Wait for any broadcast of this attempt to reach the required depth.
    ///
    /// Returns the confirmed receipt, or a reverted receipt when every
    /// broadcast reverted. Fails with `ConfirmationTimeout` when no broadcast
    /// qualifies within the allotted rounds.
    pub async fn confirm(&mut self) -> TxServiceResult<Receipt> {
        if let Some(receipt) = &self.receipt {
            return Ok(receipt.clone());
        }
        if self.responses.is_empty() {
            return Err(TxServiceError::Internal(
                "No broadcast transactions to confirm".to_string(),
            ));
        }

        let multiplier = self.config.confirmation_timeout_extension_multiplier;
        self.received_confirmation = false;
        let mut rounds: u32 = 0;

        loop {
            rounds += 1;
            match self.poll_round().await {
                RoundOutcome::Confirmed(receipt) => {
                    self.receipt = Some(receipt.clone());
                    return Ok(receipt);
                }
                RoundOutcome::Reverted(receipt) => return Ok(receipt),
                RoundOutcome::Pending => {}
            }

            if !self.received_confirmation || rounds > multiplier {
                break;
            }
            debug!(
                chain_id = self.chain_id(),
                round = rounds,
                "Partial confirmation observed, extending wait"
            );
        }

        warn!(
            chain_id = self.chain_id(),
            nonce = ?self.nonce,
            gas_price = ?self.gas_price,
            rounds,
            "Confirmation timed out"
        );
        Err(TxServiceError::ConfirmationTimeout {
            chain_id: self.chain_id(),
            nonce: self.nonce,
            gas_price: self.gas_price,
        })
    }

    /// Race a receipt poll for every response against the round timer
    async fn poll_round(&mut self) -> RoundOutcome {
        let timeout = self.config.confirmation_timeout;
        let deadline = Instant::now() + timeout;
        let required = self.connection.confirmations_required();
        let chain_id = self.chain_id();

        let mut polls: FuturesUnordered<_> = self
            .responses
            .iter()
            .enumerate()
            .map(|(index, response)| {
                let connection = Arc::clone(&self.connection);
                let hash: H256 = response.hash;
                async move { (index, hash, connection.poll_receipt(hash, timeout).await) }
            })
            .collect();

        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);

        let mut reverted: Vec<(usize, Receipt)> = Vec::new();
        let mut all_polled = false;

        loop {
            tokio::select! {
                biased;
                next = polls.next(), if !all_polled => match next {
                    Some((index, hash, Ok(Some(receipt)))) => {
                        if receipt.is_reverted() {
                            warn!(chain_id, ?hash, "Transaction reverted");
                            reverted.push((index, receipt));
                        } else if receipt.confirmations >= required {
                            info!(
                                chain_id,
                                ?hash,
                                confirmations = receipt.confirmations,
                                "Transaction confirmed"
                            );
                            return RoundOutcome::Confirmed(receipt);
                        } else if receipt.confirmations >= 1 {
                            self.received_confirmation = true;
                        }
                    }
                    Some((_, hash, Ok(None))) => {
                        debug!(chain_id, ?hash, "No receipt within poll window");
                    }
                    Some((_, hash, Err(e))) => {
                        warn!(chain_id, ?hash, error = %e, "Receipt poll failed");
                    }
                    None => {
                        all_polled = true;
                        if !self.received_confirmation && reverted.len() == self.responses.len() {
                            break;
                        }
                    }
                },
                _ = &mut timer => break,
            }
        }

        if !self.received_confirmation && reverted.len() == self.responses.len() {
            // Earliest broadcast wins, not the most recent
            reverted.sort_by_key(|(index, _)| *index);
            if let Some((_, receipt)) = reverted.into_iter().next() {
                return RoundOutcome::Reverted(receipt);
            }
        }

        RoundOutcome::Pending
    }

    /// Raise the gas price for the next broadcast without sending anything.
    ///
    /// Fails with `MaxGasPriceReached`, leaving the price untouched, when the
    /// bumped price would exceed the configured ceiling.
    pub async fn bump_gas_price(&mut self) -> TxServiceResult<U256> {
        let chain_id = self.chain_id();
        let current = self.gas_price().await?;
        let bumped = bumped_gas_price(current, self.config.gas_replacement_bump_percent);

        if let Err(e) = ensure_below_ceiling(chain_id, bumped, self.config.gas_price_ceiling) {
            warn!(
                chain_id,
                previous_gas_price = %current,
                attempted_gas_price = %bumped,
                max_gas_price = %self.config.gas_price_ceiling,
                "Gas price ceiling reached"
            );
            return Err(e);
        }

        self.gas_price = Some(bumped);
        info!(
            chain_id,
            previous_gas_price = %current,
            new_gas_price = %bumped,
            "Bumping tx gas price for reattempt"
        );
        crate::metrics::record_gas_bump(chain_id);
        Ok(bumped)
    }
}
