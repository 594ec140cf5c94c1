//! Typed errors for conditions callers need to tell apart.
//!
//! Command code works in `anyhow::Result`; these enums cover the cases where
//! the distinction between "fatal, abort" and "missing, continue degraded"
//! matters to the caller.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("model count mismatch: expected {expected} but found {found} across all queues")]
    CountMismatch { expected: usize, found: usize },

    #[error("no queue capacity: {workspaces} workspaces x {threads} threads for {models} models")]
    NoCapacity {
        workspaces: usize,
        threads: usize,
        models: usize,
    },

    #[error("model {model} is not in queue {queue}")]
    ModelNotInQueue { model: String, queue: String },

    #[error("workspace {0} has no entry in the workspace list")]
    UnknownWorkspace(String),

    #[error("model {0} is listed more than once")]
    DuplicateModel(String),

    #[error("models {first} and {second} both map to workflow file {}", .path.display())]
    WorkflowNameCollision {
        path: PathBuf,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("unresolved placeholders after substitution: {}", .0.join(", "))]
    UnresolvedPlaceholders(Vec<String>),
}
