//! Error types for the assignment engine.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskState;

/// Top-level error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The origin of an assignment is missing a required reference field.
    #[error("invalid origin: {0}")]
    InvalidOrigin(String),

    /// A task was asked to move to a state it cannot reach from its current one.
    #[error("invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    /// A step result was offered out of plan order or after the task finished.
    #[error("step rejected for task {task_id}: {reason}")]
    StepRejected { task_id: String, reason: String },

    /// No task with the given id is known to the store.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// Failed to provision a sandbox.
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    /// Failed to tear down a sandbox.
    #[error("failed to tear down sandbox {id}: {reason}")]
    Teardown { id: String, reason: String },

    /// A command exceeded its execution timeout and was killed.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// A command could not be run or exited unsuccessfully.
    #[error("command failed: {0}")]
    Runner(String),

    /// The plan names an action the catalog does not know.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Publishing results to the origin failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
