//! Error taxonomy for the labeling core
//!
//! Data and algorithmic failures are recovered locally and surfaced as a
//! single status line; none of them is fatal to the process. Corrupt or
//! missing persisted files never reach this type, they degrade to a fresh
//! state at the point of reading.
//!
//! Copyright (c) 2025 Mohammad Atashi <mohammadaliatashi@icloud.com>

use thiserror::Error;

use crate::data::BlockId;
use crate::execution::TaskExecutionError;

/// Comprehensive error types for labeling operations
#[derive(Debug, Error)]
pub enum HyperclassError {
    #[error("Insufficient data: {samples} samples available, at least {required} required")]
    InsufficientData { samples: usize, required: usize },

    #[error("Mapper not fitted: {0}")]
    NotFitted(String),

    #[error("Workflow violation: {0}")]
    WorkflowViolation(String),

    #[error("Coordinate out of bounds: ({row}, {col})")]
    OutOfBounds { row: f64, col: f64 },

    #[error("Stale result for block {0}")]
    StaleResult(BlockId),

    #[error("Invalid parameter: {name} - {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Task(#[from] TaskExecutionError),
}

impl HyperclassError {
    /// Data and workflow errors are reported to the user and the operation
    /// is aborted; everything else indicates an environment fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HyperclassError::InsufficientData { .. }
                | HyperclassError::NotFitted(_)
                | HyperclassError::WorkflowViolation(_)
                | HyperclassError::OutOfBounds { .. }
                | HyperclassError::StaleResult(_)
                | HyperclassError::InvalidParameter { .. }
        )
    }

    /// Single user-facing status line for this error
    pub fn status_message(&self) -> String {
        match self {
            HyperclassError::InsufficientData { samples, required } => format!(
                "Not enough valid pixels in this block ({samples}, need {required})"
            ),
            HyperclassError::NotFitted(what) => format!("Model must be fitted first: {what}"),
            HyperclassError::WorkflowViolation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HyperclassError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(HyperclassError::WorkflowViolation("no labels".into()).is_recoverable());
        assert!(HyperclassError::InsufficientData { samples: 2, required: 4 }.is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert!(!HyperclassError::from(io).is_recoverable());
    }

    #[test]
    fn test_status_message_is_user_facing() {
        let err = HyperclassError::WorkflowViolation("Label at least one point before spreading".into());
        assert_eq!(err.status_message(), "Label at least one point before spreading");
    }
}
