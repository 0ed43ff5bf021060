//! Protocol error types.
//!
//! The `Display` strings are matched by retry policies, so keep them stable.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position {0} is not owned by caller")]
    NotOwned(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Slippage tolerance exceeded: {0}")]
    SlippageExceeded(String),

    #[error("Account info not yet available: {0}")]
    AccountNotReady(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("Transaction rejected: {0}")]
    Rejected(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_stable() {
        assert_eq!(
            ProtocolError::PositionNotFound("abc".into()).to_string(),
            "Position not found: abc"
        );
        assert_eq!(
            ProtocolError::NotOwned("abc".into()).to_string(),
            "Position abc is not owned by caller"
        );
        assert!(
            ProtocolError::SlippageExceeded("x".into())
                .to_string()
                .starts_with("Slippage tolerance exceeded")
        );
    }
}
