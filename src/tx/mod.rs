//! Transaction submission: attempts, gas escalation, and the orchestration loop

mod attempt;
mod gas;
mod sender;
mod signer;
mod types;

pub use sender::TransactionService;
pub use signer::{TransactionSigner, WalletSigner};
pub use types::{FullTransaction, MinimalTransaction, Receipt, ReceiptSummary, SubmittedTransaction};

#[cfg(test)]
pub use signer::MockTransactionSigner;
