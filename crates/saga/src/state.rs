//! Saga lifecycle states.

use serde::{Deserialize, Serialize};

/// The status of a saga instance.
///
/// Status transitions:
/// ```text
/// NotStarted -> Running -> Completed
///                  |
///                  v
///            Compensating -> Compensated   (all compensations ran)
///                  |
///                  v
///                Failed                    (a compensation gave up)
/// ```
///
/// Cancellation goes through `Compensating` too: committed effects are
/// unwound, never abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// No events exist for this saga yet.
    #[default]
    NotStarted,

    /// Forward steps are being executed.
    Running,

    /// A step failed or the saga was cancelled; compensations are running
    /// in reverse completion order.
    Compensating,

    /// All steps completed successfully (terminal).
    Completed,

    /// Compensation finished cleanly after a failure or cancellation
    /// (terminal).
    Compensated,

    /// A compensation exhausted its retries; manual intervention is needed
    /// (terminal).
    Failed,
}

impl SagaStatus {
    /// Returns true if the saga may enter compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::NotStarted => "NotStarted",
            SagaStatus::Running => "Running",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
