//! Task data model.
//!
//! A task is one unit of work delegated to the external tool. Its id doubles
//! as the isolation directory name and the suffix of its branch, so ids are
//! restricted to path- and ref-safe characters by the config loader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Unique, human-chosen identifier for a task within a graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Display name; falls back to the id when empty.
    pub name: String,
    /// Ids of tasks that must succeed before this one may run.
    pub dependencies: BTreeSet<TaskId>,
    /// Location of the instructions handed to the external tool.
    pub work_descriptor: PathBuf,
    /// Optional token estimate, used only for planning output.
    pub estimated_tokens: Option<u64>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        let id = id.into();
        let name = if name.is_empty() {
            id.to_string()
        } else {
            name.to_string()
        };
        Self {
            id,
            name,
            dependencies: BTreeSet::new(),
            work_descriptor: PathBuf::new(),
            estimated_tokens: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_descriptor(mut self, path: impl AsRef<Path>) -> Self {
        self.work_descriptor = path.as_ref().to_path_buf();
        self
    }

    pub fn with_estimate(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }
}

/// Terminal state of one task in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }

    /// Whether the task was actually dispatched (everything except Skipped).
    pub fn is_attempted(&self) -> bool {
        !matches!(self, TaskOutcome::Skipped)
    }

    /// Failed and TimedOut both count as failures in run totals.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failed | TaskOutcome::TimedOut)
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskOutcome::Succeeded => write!(f, "succeeded"),
            TaskOutcome::Failed => write!(f, "failed"),
            TaskOutcome::TimedOut => write!(f, "timed out"),
            TaskOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a task did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The working copy could not be created.
    Isolation,
    /// The work descriptor could not be read.
    Instructions,
    /// The tool process could not be started.
    Spawn,
    /// The tool exited non-zero without a usable payload.
    ExitStatus,
    /// The tool's output was not the expected payload.
    Parse,
    /// The payload reported an unsuccessful run.
    ToolReported,
    Timeout,
    /// An upstream task did not succeed.
    DependencyFailed,
    /// The run was cancelled before this task was dispatched.
    Cancelled,
}

/// Terminal record of one task's attempt (or skip) in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub duration_ms: u64,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    /// Branch the work was done on, once an isolation existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionResult {
    fn blank(task_id: TaskId, outcome: TaskOutcome) -> Self {
        Self {
            task_id,
            outcome,
            duration_ms: 0,
            cost_usd: 0.0,
            output: None,
            error: None,
            failure: None,
            session_id: None,
            num_turns: None,
            branch: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn succeeded(task_id: TaskId, output: String) -> Self {
        let mut result = Self::blank(task_id, TaskOutcome::Succeeded);
        result.output = Some(output);
        result
    }

    pub fn failed(task_id: TaskId, kind: FailureKind, detail: impl Into<String>) -> Self {
        let outcome = if kind == FailureKind::Timeout {
            TaskOutcome::TimedOut
        } else {
            TaskOutcome::Failed
        };
        let mut result = Self::blank(task_id, outcome);
        result.failure = Some(kind);
        result.error = Some(detail.into());
        result
    }

    pub fn skipped(task_id: TaskId, kind: FailureKind, reason: impl Into<String>) -> Self {
        let mut result = Self::blank(task_id, TaskOutcome::Skipped);
        result.failure = Some(kind);
        result.error = Some(reason.into());
        result
    }

    /// Stamp wall-clock bounds; fills `duration_ms` when the tool did not report one.
    pub fn with_timing(mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        if self.duration_ms == 0 {
            self.duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        }
        self.started_at = Some(started_at);
        self.finished_at = Some(finished_at);
        self
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }
}
