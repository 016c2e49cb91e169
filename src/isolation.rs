//! Per-task isolated working copies.
//!
//! Every task runs in its own git worktree at `<worktrees_base>/<task id>`,
//! checked out on the branch `feature/<task id>`. The manager owns the
//! registry of active contexts for one repository; the scheduler shares it
//! behind a mutex and calls into it from the blocking pool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::task::TaskId;
use crate::error::{Error, IsolationError};
use crate::git::{GitOps, WorktreeEntry};
use crate::{wlog, wlog_debug, wlog_warn};

/// Directory inside each working copy that holds tool-side files.
pub const BRIEF_DIR: &str = ".wavepilot";
pub const BRIEF_FILE: &str = "TASK.md";

const BRANCH_PREFIX: &str = "feature/";

pub type IsolationResult<T> = std::result::Result<T, IsolationError>;

/// Branch name used for a task's working copy.
pub fn branch_name(task_id: &TaskId) -> String {
    format!("{}{}", BRANCH_PREFIX, task_id)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IsolationContext {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

/// What gets written into a fresh working copy so the tool knows its job.
#[derive(Debug, Clone)]
pub struct TaskBrief {
    pub name: String,
    pub instructions: String,
}

impl TaskBrief {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
        }
    }

    fn render(&self, ctx: &IsolationContext) -> String {
        format!(
            "# Task: {name}\n\n\
             - **Task ID:** {id}\n\
             - **Branch:** {branch}\n\
             - **Working copy:** {path}\n\n\
             This working copy is dedicated to this task. Other tasks are being \
             worked on in parallel in separate working copies.\n\n\
             ## Rules\n\n\
             - Implement only what the instructions below describe\n\
             - Write tests for your implementation\n\
             - Commit your changes on this branch when done\n\
             - Do not modify files outside the scope of this task\n\n\
             ## Instructions\n\n\
             {instructions}\n",
            name = self.name,
            id = ctx.task_id,
            branch = ctx.branch,
            path = ctx.path.display(),
            instructions = self.instructions.trim_end(),
        )
    }
}

fn git_failure(e: Error) -> IsolationError {
    match e {
        Error::Git(g) => IsolationError::Git(g.message().to_string()),
        Error::Io(io) => IsolationError::Io(io.to_string()),
        other => IsolationError::Git(other.to_string()),
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub struct IsolationManager {
    git: GitOps,
    worktrees_base: PathBuf,
    active: BTreeMap<TaskId, IsolationContext>,
}

impl IsolationManager {
    /// Open the manager for `repo_path`, rediscovering working copies left
    /// under `worktrees_base` by earlier runs.
    pub fn open(repo_path: &Path, worktrees_base: &Path) -> IsolationResult<Self> {
        let git = GitOps::new(repo_path)
            .map_err(|_| IsolationError::InvalidRepository(repo_path.display().to_string()))?;
        let mut manager = Self {
            git,
            worktrees_base: worktrees_base.to_path_buf(),
            active: BTreeMap::new(),
        };
        manager.rehydrate()?;
        Ok(manager)
    }

    fn rehydrate(&mut self) -> IsolationResult<()> {
        let base = canonical(&self.worktrees_base);
        for entry in self.git.list_worktrees().map_err(git_failure)? {
            let expected_branch = format!("{}{}", BRANCH_PREFIX, entry.name);
            if entry.branch.as_deref() != Some(expected_branch.as_str()) {
                continue;
            }
            if !entry.path.exists() || canonical(&entry.path) != base.join(&entry.name) {
                continue;
            }
            let created_at = std::fs::metadata(&entry.path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let task_id = TaskId::new(entry.name.clone());
            wlog_debug!("Rehydrated isolation '{}' at {}", task_id, entry.path.display());
            self.active.insert(
                task_id.clone(),
                IsolationContext {
                    task_id,
                    path: entry.path,
                    branch: expected_branch,
                    created_at,
                    destroyed_at: None,
                },
            );
        }
        Ok(())
    }

    pub fn repo_path(&self) -> &Path {
        self.git.repo_path()
    }

    pub fn worktrees_base(&self) -> &Path {
        &self.worktrees_base
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.worktrees_base.join(task_id.as_str())
    }

    /// Create the working copy for `task_id` on a new branch cut from `base`.
    ///
    /// With `force`, an existing working copy and branch for the task are
    /// discarded first. The brief, when given, is written under
    /// `.wavepilot/`; project files such as `CLAUDE.md` are never touched.
    pub fn create(
        &mut self,
        task_id: &TaskId,
        base: &str,
        brief: Option<&TaskBrief>,
        force: bool,
    ) -> IsolationResult<IsolationContext> {
        let path = self.path_for(task_id);
        let branch = branch_name(task_id);
        wlog_debug!(
            "IsolationManager::create task={} base={} force={}",
            task_id,
            base,
            force
        );

        if self.git.resolve_commit(base).map_err(git_failure)?.is_none() {
            return Err(IsolationError::BaseNotFound(base.to_string()));
        }

        if self.active.contains_key(task_id) || path.exists() {
            if !force {
                return Err(IsolationError::AlreadyExists(task_id.clone()));
            }
            self.destroy(task_id, true)?;
            self.git
                .remove_worktree(task_id.as_str(), &path)
                .map_err(git_failure)?;
        }

        if self.git.branch_exists(&branch).map_err(git_failure)? {
            if !force {
                return Err(IsolationError::BranchExists(branch));
            }
            self.git.delete_branch(&branch).map_err(git_failure)?;
        }

        self.git
            .create_worktree(task_id.as_str(), &branch, &path, base)
            .map_err(git_failure)?;

        let ctx = IsolationContext {
            task_id: task_id.clone(),
            path,
            branch,
            created_at: Utc::now(),
            destroyed_at: None,
        };

        if let Some(brief) = brief {
            if let Err(e) = self.seed_brief(&ctx, brief) {
                wlog_warn!("Seeding brief for '{}' failed: {}, rolling back", task_id, e);
                let _ = self.git.remove_worktree(task_id.as_str(), &ctx.path);
                let _ = self.git.delete_branch(&ctx.branch);
                return Err(e);
            }
        }

        wlog!("Created isolation '{}' at {}", task_id, ctx.path.display());
        self.active.insert(task_id.clone(), ctx.clone());
        Ok(ctx)
    }

    fn seed_brief(&self, ctx: &IsolationContext, brief: &TaskBrief) -> IsolationResult<()> {
        self.git
            .ensure_excluded(&format!("/{}/", BRIEF_DIR))
            .map_err(git_failure)?;
        let dir = ctx.path.join(BRIEF_DIR);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(BRIEF_FILE), brief.render(ctx))?;
        Ok(())
    }

    /// Remove the working copy for `task_id`. Returns `None` when there was
    /// nothing to remove. The branch is kept.
    pub fn destroy(
        &mut self,
        task_id: &TaskId,
        force: bool,
    ) -> IsolationResult<Option<IsolationContext>> {
        let Some(ctx) = self.active.get(task_id) else {
            return Ok(None);
        };
        if !force && ctx.path.exists() && self.git.is_dirty(&ctx.path).map_err(git_failure)? {
            return Err(IsolationError::UncommittedChanges(task_id.clone()));
        }
        self.git
            .remove_worktree(task_id.as_str(), &ctx.path)
            .map_err(git_failure)?;

        let mut ctx = match self.active.remove(task_id) {
            Some(ctx) => ctx,
            None => return Ok(None),
        };
        ctx.destroyed_at = Some(Utc::now());
        wlog!("Destroyed isolation '{}'", task_id);
        Ok(Some(ctx))
    }

    /// Destroy every isolation whose branch is fully merged into `base`,
    /// deleting the branch as well. Dirty or failing ones are skipped.
    pub fn cleanup_merged(&mut self, base: &str) -> IsolationResult<Vec<TaskId>> {
        if self.git.resolve_commit(base).map_err(git_failure)?.is_none() {
            return Err(IsolationError::BaseNotFound(base.to_string()));
        }
        let candidates: Vec<(TaskId, String)> = self
            .active
            .values()
            .map(|ctx| (ctx.task_id.clone(), ctx.branch.clone()))
            .collect();

        let mut cleaned = Vec::new();
        for (task_id, branch) in candidates {
            match self.git.is_merged(&branch, base) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    wlog_warn!("Could not check merge state of '{}': {}", branch, e);
                    continue;
                }
            }
            if let Err(e) = self.destroy(&task_id, false) {
                wlog_warn!("Skipping cleanup of '{}': {}", task_id, e);
                continue;
            }
            if let Err(e) = self.git.delete_branch(&branch) {
                wlog_warn!("Removed '{}' but kept branch '{}': {}", task_id, branch, e);
            }
            cleaned.push(task_id);
        }
        Ok(cleaned)
    }

    /// Force-destroy every active isolation. Branches are kept.
    pub fn cleanup_all(&mut self) -> IsolationResult<Vec<TaskId>> {
        let ids: Vec<TaskId> = self.active.keys().cloned().collect();
        let mut cleaned = Vec::new();
        for task_id in ids {
            match self.destroy(&task_id, true) {
                Ok(Some(_)) => cleaned.push(task_id),
                Ok(None) => {}
                Err(e) => wlog_warn!("Failed to remove isolation '{}': {}", task_id, e),
            }
        }
        if let Err(e) = self.git.prune_worktrees() {
            wlog_warn!("Worktree prune failed: {}", e);
        }
        Ok(cleaned)
    }

    pub fn exists(&self, task_id: &TaskId) -> bool {
        self.active.contains_key(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&IsolationContext> {
        self.active.get(task_id)
    }

    pub fn get_path(&self, task_id: &TaskId) -> Option<&Path> {
        self.active.get(task_id).map(|ctx| ctx.path.as_path())
    }

    /// Active isolations ordered by task id.
    pub fn list_active(&self) -> Vec<&IsolationContext> {
        self.active.values().collect()
    }

    /// Every worktree registered in the repository, managed or not.
    pub fn list_all_worktrees(&self) -> IsolationResult<Vec<WorktreeEntry>> {
        self.git.list_worktrees().map_err(git_failure)
    }
}
