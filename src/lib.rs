//! Wave-based orchestration of dependent tasks, each delegated to an
//! external tool inside its own git worktree.

pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod isolation;
pub mod log;
pub mod orchestration;
pub mod util;

pub use error::{Error, GraphError, IsolationError, Result};
