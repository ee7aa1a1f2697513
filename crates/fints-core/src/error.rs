//! Errors raised by the banking client

use thiserror::Error;

use crate::models::NeedTanResponse;

/// Result type for banking operations
pub type BankResult<T> = Result<T, BankError>;

/// Errors that can occur while talking to the bank
#[derive(Debug, Clone, Error)]
pub enum BankError {
    /// The bank requires a TAN before the operation can complete
    #[error("NeedTANResponse: {}", .0.challenge)]
    NeedTan(NeedTanResponse),

    /// Could not reach the bank or the connection dropped
    #[error("connection to bank failed: {0}")]
    Connection(String),

    /// The bank answered with an error message
    #[error("bank returned an error: {0}")]
    Protocol(String),

    /// The bank does not support the requested business transaction
    #[error("operation not supported by bank: {0}")]
    Unsupported(String),
}

impl BankError {
    /// Whether this error asks for a TAN confirmation
    pub fn is_need_tan(&self) -> bool {
        matches!(self, BankError::NeedTan(_))
    }

    /// Take the pending TAN challenge out of the error, if any
    pub fn into_tan_challenge(self) -> Option<NeedTanResponse> {
        match self {
            BankError::NeedTan(challenge) => Some(challenge),
            _ => None,
        }
    }
}
