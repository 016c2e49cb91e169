//! Core domain models: tasks, their results, and the dependency graph.

pub mod dag;
pub mod task;

pub use dag::{TaskGraph, Wave};
pub use task::{ExecutionResult, FailureKind, Task, TaskId, TaskOutcome};
