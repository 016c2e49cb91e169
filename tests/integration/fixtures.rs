//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories with prompt files
//! - A fake tool script that speaks the JSON result contract
//! - Running a scheduler while collecting its progress events

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use wavepilot::core::{Task, TaskGraph, TaskId};
use wavepilot::isolation::IsolationManager;
use wavepilot::orchestration::{
    ProgressEvent, RunOutcome, RunSettings, TaskExecutor, ToolSettings, WaveScheduler,
};
use wavepilot::Result;

/// Behaviour is picked from the instructions (`$2`):
/// FAIL reports an error payload, SLEEP hangs, GARBAGE prints non-JSON,
/// CRASH exits non-zero, BADEXIT prints a success payload then exits 1,
/// LINGER leaves a background child holding stdout, ESCAPE does the same
/// from a new session, anything else succeeds after a short pause.
const FAKE_TOOL: &str = r#"#!/bin/sh
prompt="$2"
echo "$prompt" > tool_input.txt
ok='{"type":"result","subtype":"success","is_error":false,"result":"implemented","session_id":"sess-1","total_cost_usd":0.25,"duration_ms":120,"num_turns":2}'
case "$prompt" in
  *FAIL*)
    echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"simulated failure","total_cost_usd":0.05,"duration_ms":10}'
    ;;
  *BADEXIT*)
    echo "$ok"
    exit 1
    ;;
  *LINGER*)
    sleep 30 &
    echo $! > linger.pid
    echo "$ok"
    ;;
  *ESCAPE*)
    setsid sleep 30 &
    echo $! > escape.pid
    echo "$ok"
    ;;
  *SLEEP*)
    sleep 30 &
    echo $! > sleep.pid
    wait
    ;;
  *GARBAGE*)
    echo "this is not json"
    ;;
  *CRASH*)
    echo "fatal: simulated crash" >&2
    exit 3
    ;;
  *)
    sleep 0.3
    echo "done" > TOOL_RAN
    echo "$ok"
    ;;
esac
"#;

/// A temporary project: repository, worktrees directory, prompts and tool.
pub struct TestProject {
    pub temp_dir: TempDir,
    pub repo: PathBuf,
    pub worktrees: PathBuf,
    pub prompts: PathBuf,
    pub tool: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let root = temp_dir.path().to_path_buf();
        let repo = root.join("repo");
        let prompts = root.join("prompts");
        std::fs::create_dir_all(&repo).expect("Failed to create repo dir");
        std::fs::create_dir_all(&prompts).expect("Failed to create prompts dir");

        let project = Self {
            repo,
            worktrees: root.join("worktrees"),
            prompts,
            tool: root.join("fake-tool.sh"),
            temp_dir,
        };

        project.git(&["init", "-b", "main"]);
        project.git(&["config", "user.email", "test@test.com"]);
        project.git(&["config", "user.name", "Test User"]);
        std::fs::write(project.repo.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        std::fs::write(project.repo.join("CLAUDE.md"), "# Project rules\n")
            .expect("Failed to write CLAUDE.md");
        project.git(&["add", "."]);
        project.git(&["commit", "-m", "Initial commit"]);

        std::fs::write(&project.tool, FAKE_TOOL).expect("Failed to write fake tool");
        std::fs::set_permissions(&project.tool, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod fake tool");
        project
    }

    pub fn git(&self, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Write a prompt file and return its path.
    pub fn prompt(&self, id: &str, instructions: &str) -> PathBuf {
        let path = self.prompts.join(format!("{}.md", id));
        std::fs::write(&path, instructions).expect("Failed to write prompt");
        path
    }

    pub fn task(&self, id: &str, deps: &[&str], instructions: &str) -> Task {
        Task::new(id, "")
            .depends_on(deps.iter().copied())
            .with_descriptor(self.prompt(id, instructions))
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            binary: self.tool.clone(),
            ..ToolSettings::default()
        }
    }

    pub fn manager(&self) -> Arc<Mutex<IsolationManager>> {
        let manager =
            IsolationManager::open(&self.repo, &self.worktrees).expect("Failed to open manager");
        Arc::new(Mutex::new(manager))
    }

    pub fn worktree(&self, id: &str) -> PathBuf {
        self.worktrees.join(id)
    }

    pub fn scheduler(
        &self,
        tasks: Vec<Task>,
        settings: RunSettings,
    ) -> (WaveScheduler, mpsc::Receiver<ProgressEvent>) {
        self.scheduler_with(tasks, settings, self.tool_settings())
    }

    pub fn scheduler_with(
        &self,
        tasks: Vec<Task>,
        settings: RunSettings,
        tool: ToolSettings,
    ) -> (WaveScheduler, mpsc::Receiver<ProgressEvent>) {
        let graph = TaskGraph::from_tasks(tasks).expect("Failed to build graph");
        let (tx, rx) = mpsc::channel(16);
        let scheduler = WaveScheduler::new(
            graph,
            settings,
            self.manager(),
            TaskExecutor::new(tool),
            tx,
        );
        (scheduler, rx)
    }
}

pub fn settings(max_parallel: usize, timeout: Duration) -> RunSettings {
    RunSettings {
        max_parallel,
        task_timeout: timeout,
        ..RunSettings::default()
    }
}

/// Run the scheduler to completion while draining its events.
pub async fn run_collecting(
    mut scheduler: WaveScheduler,
    mut rx: mpsc::Receiver<ProgressEvent>,
) -> (Result<RunOutcome>, Vec<ProgressEvent>) {
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let outcome = scheduler.run(CancellationToken::new()).await;
    drop(scheduler);
    let events = collector.await.expect("collector panicked");
    (outcome, events)
}

/// Like [`run_collecting`], but cancels the run as soon as the first task
/// has started.
pub async fn run_cancelling_after_first_start(
    mut scheduler: WaveScheduler,
    mut rx: mpsc::Receiver<ProgressEvent>,
) -> (Result<RunOutcome>, Vec<ProgressEvent>) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::TaskStarted { .. }) {
                trigger.cancel();
            }
            events.push(event);
        }
        events
    });
    let outcome = scheduler.run(cancel).await;
    drop(scheduler);
    let events = collector.await.expect("collector panicked");
    (outcome, events)
}

pub fn result_for<'a>(
    outcome: &'a RunOutcome,
    id: &str,
) -> &'a wavepilot::core::ExecutionResult {
    outcome
        .results
        .iter()
        .find(|r| r.task_id.as_str() == id)
        .unwrap_or_else(|| panic!("no result for {}", id))
}

pub fn started_ids(events: &[ProgressEvent]) -> Vec<TaskId> {
    events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::TaskStarted { task_id, .. } => Some(task_id.clone()),
            _ => None,
        })
        .collect()
}

pub fn branch_exists(repo: &Path, branch: &str) -> bool {
    Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
        .current_dir(repo)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
