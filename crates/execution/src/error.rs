//! Execution error types.

use lp_keeper_domain::{DomainError, InstanceId, Phase, PositionAddress};
use lp_keeper_protocols::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Instance {0} is not stopped")]
    NotStopped(InstanceId),

    #[error("Instance {instance} is in phase {phase}, expected {expected}")]
    InvalidPhase {
        instance: InstanceId,
        phase: Phase,
        expected: Phase,
    },

    #[error("Instance {instance} holds {count} position(s) without a known range")]
    UntrackedPositions { instance: InstanceId, count: usize },

    #[error("{lock} lock for instance {instance} is held")]
    LockContention {
        instance: InstanceId,
        lock: &'static str,
    },

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: ProtocolError,
    },

    #[error("Creation failed: {0}")]
    CreationFailed(String),

    /// Some positions were opened before creation failed; they must be closed.
    #[error("Creation partially succeeded, {} position(s) left open: {reason}", opened.len())]
    PartiallyCreated {
        opened: Vec<PositionAddress>,
        reason: String,
    },

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Instance {0} is busy")]
    Busy(InstanceId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let id = InstanceId::from("i-1");
        assert_eq!(
            ExecutionError::NotStopped(id.clone()).to_string(),
            "Instance i-1 is not stopped"
        );

        let err = ExecutionError::PartiallyCreated {
            opened: vec![PositionAddress::from("p-1")],
            reason: "RPC error: timeout".to_string(),
        };
        assert!(err.to_string().contains("1 position(s) left open"));

        let err = ExecutionError::LockContention {
            instance: id,
            lock: "recreation",
        };
        assert_eq!(err.to_string(), "recreation lock for instance i-1 is held");
    }
}
