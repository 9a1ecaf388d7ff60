//! Classification of provider errors returned when sending a transaction
//!
//! Providers report rejections as free text and the wording differs between
//! node implementations. The patterns below cover geth, erigon, nethermind,
//! and ethers' own messages; other backends may need additions.

/// Typed reason for a rejected broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// The nonce was already mined or another transaction holds it
    NonceExpired,
    /// The node already holds this exact signed transaction
    AlreadyKnown,
    /// A pending transaction with the same nonce pays more
    Underpriced,
    InsufficientFunds,
    Other,
}

const NONCE_EXPIRED_PATTERNS: &[&str] = &[
    "nonce has already been used",
    "nonce is too low",
    "nonce too low",
    "another transaction with same nonce",
];

const ALREADY_KNOWN_PATTERNS: &[&str] = &["already known", "alreadyknown", "known transaction"];

const UNDERPRICED_PATTERNS: &[&str] = &[
    "replacement transaction underpriced",
    "transaction underpriced",
];

/// Map a provider error message to a typed send failure
pub fn classify_send_error(message: &str) -> SendErrorKind {
    let message = message.to_lowercase();

    if ALREADY_KNOWN_PATTERNS.iter().any(|p| message.contains(p)) {
        SendErrorKind::AlreadyKnown
    } else if NONCE_EXPIRED_PATTERNS.iter().any(|p| message.contains(p)) {
        SendErrorKind::NonceExpired
    } else if UNDERPRICED_PATTERNS.iter().any(|p| message.contains(p)) {
        SendErrorKind::Underpriced
    } else if message.contains("insufficient funds") {
        SendErrorKind::InsufficientFunds
    } else {
        SendErrorKind::Other
    }
}
