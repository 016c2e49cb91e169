use std::time::Duration;

use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{}", format_graph_errors(.0))]
    Graph(Vec<GraphError>),

    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool failed: {0}")]
    ToolFailed(String),

    #[error("Unparsable tool output: {0}")]
    OutputParse(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Progress event out of order: {0}")]
    OutOfOrder(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

/// A single problem found while planning the dependency graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("task '{task}' depends on unknown task(s): {}", join_ids(.missing))]
    UnknownDependency { task: TaskId, missing: Vec<TaskId> },

    #[error("dependency cycle detected: {}", format_cycle(.path))]
    Cycle { path: Vec<TaskId> },

    #[error("no schedulable task among {} remaining: {}", .remaining.len(), join_ids(.remaining))]
    Stalled { remaining: Vec<TaskId> },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("'{0}' is not a valid git repository")]
    InvalidRepository(String),

    #[error("base branch '{0}' not found")]
    BaseNotFound(String),

    #[error("isolation for '{0}' already exists (use force to recreate)")]
    AlreadyExists(TaskId),

    #[error("branch '{0}' already exists (use force to recreate)")]
    BranchExists(String),

    #[error("isolation for '{0}' has uncommitted changes")]
    UncommittedChanges(TaskId),

    #[error("git: {0}")]
    Git(String),

    #[error("io: {0}")]
    Io(String),
}

impl From<git2::Error> for IsolationError {
    fn from(e: git2::Error) -> Self {
        IsolationError::Git(e.message().to_string())
    }
}

impl From<std::io::Error> for IsolationError {
    fn from(e: std::io::Error) -> Self {
        IsolationError::Io(e.to_string())
    }
}

fn join_ids(ids: &[TaskId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_cycle(path: &[TaskId]) -> String {
    let mut parts: Vec<&str> = path.iter().map(|id| id.as_str()).collect();
    if let Some(first) = parts.first().copied() {
        parts.push(first);
    }
    parts.join(" -> ")
}

fn format_graph_errors(errors: &[GraphError]) -> String {
    let lines: Vec<String> = errors.iter().map(|e| format!("  - {}", e)).collect();
    format!(
        "Dependency graph has {} error(s):\n{}",
        errors.len(),
        lines.join("\n")
    )
}

pub type Result<T> = std::result::Result<T, Error>;
