use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle phase of a strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Created,
    Creating,
    Monitoring,
    Analyzing,
    Stopping,
    Stopped,
    Error,
    Cleaning,
}

impl Phase {
    /// Phases the instance never leaves without an external command.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Stopped | Phase::Error)
    }

    /// Phases that are expected to be short-lived; lingering in one of these
    /// is what the watchdog treats as "stuck".
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Phase::Creating | Phase::Analyzing | Phase::Stopping | Phase::Cleaning
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Created => "CREATED",
            Phase::Creating => "CREATING",
            Phase::Monitoring => "MONITORING",
            Phase::Analyzing => "ANALYZING",
            Phase::Stopping => "STOPPING",
            Phase::Stopped => "STOPPED",
            Phase::Error => "ERROR",
            Phase::Cleaning => "CLEANING",
        };
        f.write_str(s)
    }
}

/// Why an instance entered STOPPING / STOPPED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoppingReason {
    StopLoss,
    PositionRecreation,
    ManualStop,
    UserStop,
}

impl fmt::Display for StoppingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StoppingReason::StopLoss => "STOP_LOSS",
            StoppingReason::PositionRecreation => "POSITION_RECREATION",
            StoppingReason::ManualStop => "MANUAL_STOP",
            StoppingReason::UserStop => "USER_STOP",
        };
        f.write_str(s)
    }
}

/// Side of the range the active index escaped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

/// Operation classes handed to the gas optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationClass {
    OpenPosition,
    ClosePosition,
    Swap,
    /// Stop-loss exit; priority scales with urgency.
    StopLoss(Urgency),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_classification() {
        assert!(Phase::Stopped.is_terminal());
        assert!(Phase::Error.is_terminal());
        assert!(!Phase::Monitoring.is_terminal());
        assert!(Phase::Cleaning.is_transient());
        assert!(!Phase::Created.is_transient());
    }

    #[test]
    fn test_reason_serializes_screaming_case() {
        let json = serde_json::to_string(&StoppingReason::PositionRecreation).unwrap();
        assert_eq!(json, "\"POSITION_RECREATION\"");
        assert_eq!(StoppingReason::ManualStop.to_string(), "MANUAL_STOP");
    }
}
