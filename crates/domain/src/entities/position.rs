use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally allocated identifier of an on-chain position account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionAddress(pub String);

impl PositionAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PositionAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
