//! Domain error types.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid range: lower {lower} is above upper {upper}")]
    InvalidRange { lower: i32, upper: i32 },

    #[error("Invalid config field `{field}`: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Amount {0} cannot be represented in atomic units")]
    AmountOverflow(String),

    #[error("Negative amount: {0}")]
    NegativeAmount(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
