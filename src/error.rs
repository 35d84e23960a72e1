//! Error types for PIV card and sealed-box operations

use thiserror::Error;

/// Errors surfaced by card operations and the sealed-box envelope.
///
/// Status words returned by the card are folded into these categories;
/// the raw SW is logged at debug level at the point of failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Reader I/O failed. The card itself never saw (or never finished)
    /// the command; the caller may retry.
    #[error("reader I/O failed: {0}")]
    Transport(#[from] pcsc::Error),

    /// Applet, data object or key slot is absent.
    #[error("{0}")]
    NotFound(&'static str),

    /// The card refused the operation for lack of authentication.
    #[error("{0}")]
    Permission(&'static str),

    /// PIN rejected by the card.
    #[error("PIN incorrect, {retries} attempts remaining")]
    IncorrectPin { retries: u8 },

    /// Preflight refused to submit the PIN because too few attempts remain.
    #[error("refusing to try PIN with only {retries} attempts remaining")]
    RetriesTooLow { retries: u8 },

    /// The card has no room left for the object being written.
    #[error("card storage exhausted")]
    NoSpace,

    /// Malformed data, unexpected status word, or bad caller input.
    #[error("{0}")]
    Invalid(String),

    /// The card answered with something valid but outside what this
    /// library implements (unknown tag, compressed certificate, ...).
    #[error("{0}")]
    Unsupported(String),

    /// Sealed-box decryption failed: wrong key, wrong card, or a
    /// tampered envelope.
    #[error("decryption failed: wrong key or corrupt box")]
    BadMessage,
}

/// Result type for card and sealed-box operations
pub type Result<T> = std::result::Result<T, Error>;
