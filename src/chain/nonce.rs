//! Nonce allocation for first broadcasts
//!
//! Handles:
//! - Local nonce tracking so concurrent submissions from one sender do not
//!   collide while their transactions are still outside the node's pending pool
//! - Reuse of nonces whose broadcast never reached the chain, lowest first
//! - Resync with the node's pending count once nothing is in flight

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-sender nonce state
#[derive(Debug, Default)]
struct SenderNonceState {
    /// Next fresh nonce to hand out (0 until the first allocation)
    next: u64,
    /// Allocated, broadcast not finished yet
    in_flight: BTreeSet<u64>,
    /// Below `next` and free again after a failed broadcast
    released: BTreeSet<u64>,
}

/// Tracks nonces for every sender on a single chain
pub struct NonceTracker {
    chain_id: u64,
    senders: DashMap<Address, Arc<Mutex<SenderNonceState>>>,
}

impl NonceTracker {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            senders: DashMap::new(),
        }
    }

    fn state(&self, sender: Address) -> Arc<Mutex<SenderNonceState>> {
        self.senders.entry(sender).or_default().clone()
    }

    /// Allocate a nonce given the node's pending transaction count.
    ///
    /// Released nonces are handed out before fresh ones so a failed
    /// broadcast never leaves a gap that later transactions queue behind.
    pub async fn allocate(&self, sender: Address, pending_count: u64) -> u64 {
        let entry = self.state(sender);
        let mut guard = entry.lock().await;
        let state = &mut *guard;

        // The node already holds these
        state.released.retain(|nonce| *nonce >= pending_count);

        if state.in_flight.is_empty() && pending_count < state.next {
            warn!(
                "Resyncing nonce for {:?} on chain {}: local {} ahead of pending count {}",
                sender, self.chain_id, state.next, pending_count
            );
            state.next = pending_count;
            state.released.clear();
        }

        let nonce = match state.released.pop_first() {
            Some(nonce) => nonce,
            None => {
                let nonce = state.next.max(pending_count);
                state.next = nonce + 1;
                nonce
            }
        };
        state.in_flight.insert(nonce);

        debug!(
            "Allocated nonce {} for {:?} on chain {} (pending count {})",
            nonce, sender, self.chain_id, pending_count
        );
        nonce
    }

    /// Mark a nonce as consumed: its broadcast was accepted, or the chain
    /// reported the nonce as already used
    pub async fn settle(&self, sender: Address, nonce: u64) {
        self.state(sender).lock().await.in_flight.remove(&nonce);
    }

    /// Release a nonce whose broadcast failed so it can be reused
    pub async fn release(&self, sender: Address, nonce: u64) {
        let entry = self.state(sender);
        let mut guard = entry.lock().await;
        let state = &mut *guard;

        state.in_flight.remove(&nonce);

        if nonce + 1 == state.next {
            state.next = nonce;
            while state.next > 0 && state.released.remove(&(state.next - 1)) {
                state.next -= 1;
            }
        } else if nonce < state.next {
            state.released.insert(nonce);
        }

        debug!(
            "Released nonce {} for {:?} on chain {}",
            nonce, sender, self.chain_id
        );
    }

    /// Next fresh nonce the tracker would hand out, ignoring the node
    #[cfg(test)]
    pub async fn peek(&self, sender: Address) -> u64 {
        self.state(sender).lock().await.next
    }
}
