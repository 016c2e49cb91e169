use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, Repository, StatusOptions, WorktreeAddOptions, WorktreePruneOptions};

use crate::{wlog_debug, wlog_warn, Result};

/// One registered worktree of the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub name: String,
    pub path: PathBuf,
    /// Short branch name checked out in the worktree, if any.
    pub branch: Option<String>,
    /// Commit id of the worktree HEAD.
    pub head: Option<String>,
}

pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        wlog_debug!("GitOps::new path={}", repo_path.display());
        let repo = Repository::open(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Resolve a branch, tag or revision to a commit id.
    pub fn resolve_commit(&self, rev: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let resolved = repo
            .revparse_single(rev)
            .and_then(|obj| obj.peel_to_commit());
        match resolved {
            Ok(commit) => Ok(Some(commit.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound || e.code() == ErrorCode::InvalidSpec => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create `branch` at `base` and check it out in a new worktree at `path`.
    ///
    /// On failure nothing is left behind: the branch and any directory
    /// created here are removed again.
    pub fn create_worktree(&self, name: &str, branch: &str, path: &Path, base: &str) -> Result<()> {
        wlog_debug!(
            "GitOps::create_worktree name={} branch={} base={} path={}",
            name,
            branch,
            base,
            path.display()
        );
        let repo = self.repo()?;
        let commit = repo.revparse_single(base)?.peel_to_commit()?;
        let branch_obj = repo.branch(branch, &commit, false)?;
        let reference = branch_obj.into_reference();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        if let Err(e) = repo.worktree(name, path, Some(&opts)) {
            wlog_warn!("Worktree add failed for '{}': {}, rolling back", name, e);
            self.cleanup_worktree_admin_dir(name);
            if path.exists() {
                let _ = std::fs::remove_dir_all(path);
            }
            let _ = self.delete_branch(branch);
            return Err(e.into());
        }
        wlog_debug!("Worktree created from commit {}", commit.id());
        Ok(())
    }

    /// Remove a worktree directory and its administrative entry.
    /// The branch is left in place.
    pub fn remove_worktree(&self, name: &str, path: &Path) -> Result<()> {
        wlog_debug!("GitOps::remove_worktree name={} path={}", name, path.display());
        let repo = self.repo()?;

        if let Ok(worktree) = repo.find_worktree(name) {
            let _ = worktree.unlock();
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true).locked(true);
            if let Err(e) = worktree.prune(Some(&mut opts)) {
                wlog_warn!("Worktree prune failed for '{}': {}", name, e);
            }
        }

        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }

        // If the admin dir survives, git still considers the branch checked out.
        self.cleanup_worktree_admin_dir(name);
        Ok(())
    }

    fn cleanup_worktree_admin_dir(&self, name: &str) {
        if let Ok(repo) = self.repo() {
            let admin_dir = repo.commondir().join("worktrees").join(name);
            if admin_dir.exists() {
                wlog_debug!("Cleaning up worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
    }

    /// Check if a worktree has uncommitted changes (staged, unstaged or
    /// untracked). Ignored files do not count.
    pub fn is_dirty(&self, worktree_path: &Path) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Whether every commit on `branch` is reachable from `base`.
    pub fn is_merged(&self, branch: &str, base: &str) -> Result<bool> {
        let repo = self.repo()?;
        let branch_oid = match repo.find_branch(branch, BranchType::Local) {
            Ok(b) => b.get().peel_to_commit()?.id(),
            Err(e) if e.code() == ErrorCode::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let base_oid = repo.revparse_single(base)?.peel_to_commit()?.id();
        if branch_oid == base_oid {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(base_oid, branch_oid)?)
    }

    /// Delete a local branch. Returns Ok even if the branch doesn't exist.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        wlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    wlog_warn!("Failed to delete branch '{}': {}", branch, e);
                    return Err(e.into());
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                wlog_debug!("Branch '{}' not found (already deleted?)", branch);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Every registered worktree, including ones this tool did not create.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeEntry>> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        let mut entries = Vec::new();
        for name in names.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            let path = worktree.path().to_path_buf();
            let (branch, head) = match Repository::open_from_worktree(&worktree) {
                Ok(wt_repo) => match wt_repo.head() {
                    Ok(head) => (
                        head.shorthand().map(String::from).filter(|_| head.is_branch()),
                        head.target().map(|oid| oid.to_string()),
                    ),
                    Err(_) => (None, None),
                },
                Err(_) => (None, None),
            };
            entries.push(WorktreeEntry {
                name: name.to_string(),
                path,
                branch,
                head,
            });
        }
        Ok(entries)
    }

    /// Drop administrative entries whose directories no longer exist.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(worktree) = repo.find_worktree(name) {
                if worktree.validate().is_err() && worktree.prune(None).is_ok() {
                    pruned += 1;
                }
            }
        }
        wlog_debug!("prune_worktrees: pruned {} worktrees", pruned);
        Ok(pruned)
    }

    /// Add a pattern to the repository-wide `info/exclude`, shared by all
    /// worktrees. No-op if the pattern is already listed.
    pub fn ensure_excluded(&self, pattern: &str) -> Result<()> {
        let repo = self.repo()?;
        let info_dir = repo.commondir().join("info");
        std::fs::create_dir_all(&info_dir)?;
        let exclude = info_dir.join("exclude");
        let current = std::fs::read_to_string(&exclude).unwrap_or_default();
        if current.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(pattern);
        updated.push('\n');
        std::fs::write(&exclude, updated)?;
        Ok(())
    }
}
