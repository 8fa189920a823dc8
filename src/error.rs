//! Custom error types for the sequencer.
//!
//! `SequencerError` covers misuse of the composition API (unknown ids, cycles,
//! double parenting), configuration problems and procedure-file problems.
//!
//! Runtime failures of tasks are deliberately *not* represented here. A leaf
//! that fails, or a stop request anywhere in the graph, travels upwards as a
//! failed completion and surfaces as [`Outcome::Failed`](crate::task::Outcome)
//! on the root. Only the API surface returns `Err`.

use crate::task::TaskId;
use thiserror::Error;

/// Convenience alias for results using the sequencer error type.
pub type AppResult<T> = std::result::Result<T, SequencerError>;

/// Errors returned by the composition API, configuration and procedure loading.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// No task with this id exists (never created or already destroyed).
    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    /// The task exists but is not the kind of composite the call needs.
    #[error("Task {task} is not a {expected}")]
    WrongKind {
        /// Offending task.
        task: TaskId,
        /// Kind the call needs.
        expected: &'static str,
    },

    /// Branch index past the end of a parallel task.
    #[error("Branch {branch} out of range for {task} ({branches} branches)")]
    BranchOutOfRange {
        /// Parallel task.
        task: TaskId,
        /// Requested branch.
        branch: usize,
        /// Number of branches.
        branches: usize,
    },

    /// The task is already a child of some composite.
    #[error("Task {0} already belongs to a composite")]
    AlreadyParented(TaskId),

    /// The child is the parent itself or one of its ancestors.
    #[error("Adding {child} to {parent} would create a cycle")]
    Cycle {
        /// Composite being added to.
        parent: TaskId,
        /// Task being added.
        child: TaskId,
    },

    /// The engine's channel is gone.
    #[error("Engine channel closed")]
    ChannelClosed,

    /// A wait worker was needed outside a Tokio runtime.
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    /// Figment could not extract the configuration.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    /// Loaded configuration failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Procedure file is well-formed TOML but structurally invalid.
    #[error("Procedure error: {0}")]
    Procedure(String),

    /// Procedure file is not valid TOML for a procedure.
    #[error("Procedure parse error: {0}")]
    ProcedureParse(#[from] toml::de::Error),

    /// File could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SequencerError::UnknownTask(TaskId::from_raw(7));
        assert_eq!(err.to_string(), "Unknown task: task#7");
    }

    #[test]
    fn test_branch_error_mentions_width() {
        let err = SequencerError::BranchOutOfRange {
            task: TaskId::from_raw(1),
            branch: 4,
            branches: 2,
        };
        assert!(err.to_string().contains("2 branches"));
    }
}
