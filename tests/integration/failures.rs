//! Task-local failure handling: timeouts, bad output, spawn and isolation errors.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use wavepilot::core::{FailureKind, TaskOutcome};
use wavepilot::isolation::IsolationManager;
use wavepilot::orchestration::{RunSettings, TaskExecutor, ToolSettings};
use wavepilot::IsolationError;

use crate::fixtures::{result_for, run_collecting, settings, TestProject};

/// Whether `pid` is still a live (non-zombie) process.
fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // Field 3 is the state; it follows the parenthesised command name.
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | Some("X") | None)
        }
        Err(_) => false,
    }
}

#[tokio::test]
async fn test_timeout_kills_process_tree() {
    let project = TestProject::new();
    let worktree = project.temp_dir.path().join("scratch");
    std::fs::create_dir_all(&worktree).unwrap();
    let executor = TaskExecutor::new(project.tool_settings());

    let timeout = Duration::from_secs(1);
    let clock = Instant::now();
    let result = executor
        .run_single(&worktree, "SLEEP forever", &"slow".into(), timeout)
        .await;
    let elapsed = clock.elapsed();

    assert_eq!(result.outcome, TaskOutcome::TimedOut);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(result.duration_ms >= 1000, "duration {}ms", result.duration_ms);
    assert!(result.duration_ms < 5000, "duration {}ms", result.duration_ms);
    assert!(elapsed < Duration::from_secs(10));

    let pid: u32 = std::fs::read_to_string(worktree.join("sleep.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    if cfg!(target_os = "linux") {
        // Give init a moment to reap the orphan.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(pid), "background sleep {pid} survived the timeout");
    }
}

fn read_pid(path: &std::path::Path) -> u32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

#[tokio::test]
async fn test_lingering_child_does_not_hold_the_task() {
    let project = TestProject::new();
    let worktree = project.temp_dir.path().join("scratch");
    std::fs::create_dir_all(&worktree).unwrap();
    let executor = TaskExecutor::new(project.tool_settings());

    let clock = Instant::now();
    let result = executor
        .run_single(&worktree, "LINGER behind", &"linger".into(), Duration::from_secs(5))
        .await;

    assert_eq!(result.outcome, TaskOutcome::Succeeded, "{:?}", result.error);
    assert!(clock.elapsed() < Duration::from_secs(4), "took {:?}", clock.elapsed());
    let pid = read_pid(&worktree.join("linger.pid"));
    if cfg!(target_os = "linux") {
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(pid), "background child {pid} outlived the tool");
    }
}

#[tokio::test]
async fn test_deadline_covers_output_draining() {
    if which::which("setsid").is_err() {
        return;
    }
    let project = TestProject::new();
    let worktree = project.temp_dir.path().join("scratch");
    std::fs::create_dir_all(&worktree).unwrap();
    let executor = TaskExecutor::new(project.tool_settings());

    let clock = Instant::now();
    let result = executor
        .run_single(&worktree, "ESCAPE the group", &"escape".into(), Duration::from_secs(1))
        .await;
    let elapsed = clock.elapsed();

    let pid = read_pid(&worktree.join("escape.pid"));
    let _ = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status();

    assert_eq!(result.outcome, TaskOutcome::TimedOut);
    assert_eq!(result.failure, Some(FailureKind::Timeout));
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
}

#[tokio::test]
async fn test_non_zero_exit_fails_despite_success_payload() {
    let project = TestProject::new();
    let (scheduler, rx) = project.scheduler(
        vec![project.task("bad", &[], "BADEXIT please")],
        settings(1, Duration::from_secs(30)),
    );
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let result = result_for(outcome.as_ref().unwrap(), "bad").clone();

    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert_eq!(result.failure, Some(FailureKind::ExitStatus));
    assert!(result.error.unwrap().contains("exit code 1"));
}

#[tokio::test]
async fn test_timeout_does_not_affect_siblings() {
    let project = TestProject::new();
    let tasks = vec![
        project.task("slow", &[], "SLEEP please"),
        project.task("quick", &[], "fine"),
        project.task("after_slow", &["slow"], "blocked"),
    ];
    let (scheduler, rx) = project.scheduler(tasks, settings(2, Duration::from_secs(2)));
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let outcome = outcome.unwrap();

    assert_eq!(result_for(&outcome, "slow").outcome, TaskOutcome::TimedOut);
    assert_eq!(result_for(&outcome, "quick").outcome, TaskOutcome::Succeeded);
    let blocked = result_for(&outcome, "after_slow");
    assert_eq!(blocked.outcome, TaskOutcome::Skipped);
    assert_eq!(blocked.failure, Some(FailureKind::DependencyFailed));
    // The timed-out task's working copy is kept for inspection.
    assert!(project.worktree("slow").exists());
}

#[tokio::test]
async fn test_unparsable_output_is_a_parse_failure() {
    let project = TestProject::new();
    let (scheduler, rx) = project.scheduler(
        vec![project.task("g", &[], "GARBAGE out")],
        settings(1, Duration::from_secs(30)),
    );
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let result = result_for(outcome.as_ref().unwrap(), "g").clone();

    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert_eq!(result.failure, Some(FailureKind::Parse));
    assert!(result.error.unwrap().contains("Unparsable tool output"));
}

#[tokio::test]
async fn test_crash_reports_stderr() {
    let project = TestProject::new();
    let (scheduler, rx) = project.scheduler(
        vec![project.task("c", &[], "CRASH now")],
        settings(1, Duration::from_secs(30)),
    );
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let result = result_for(outcome.as_ref().unwrap(), "c").clone();

    assert_eq!(result.outcome, TaskOutcome::Failed);
    assert_eq!(result.failure, Some(FailureKind::ExitStatus));
    assert!(result.error.unwrap().contains("fatal: simulated crash"));
}

#[tokio::test]
async fn test_missing_tool_fails_each_dispatch() {
    let project = TestProject::new();
    let tool = ToolSettings {
        binary: PathBuf::from("/nonexistent/wavepilot-tool"),
        ..ToolSettings::default()
    };
    let (scheduler, rx) = project.scheduler_with(
        vec![project.task("a", &[], "work"), project.task("b", &[], "work")],
        settings(2, Duration::from_secs(30)),
        tool,
    );
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let outcome = outcome.unwrap();

    for id in ["a", "b"] {
        let result = result_for(&outcome, id);
        assert_eq!(result.outcome, TaskOutcome::Failed);
        assert_eq!(result.failure, Some(FailureKind::Spawn));
    }
}

#[tokio::test]
async fn test_missing_base_branch_fails_isolation() {
    let project = TestProject::new();
    let run_settings = RunSettings {
        base_branch: "develop".to_string(),
        ..settings(2, Duration::from_secs(30))
    };
    let (scheduler, rx) = project.scheduler(
        vec![project.task("a", &[], "work"), project.task("b", &["a"], "work")],
        run_settings,
    );
    let (outcome, _) = run_collecting(scheduler, rx).await;
    let outcome = outcome.unwrap();

    let a = result_for(&outcome, "a");
    assert_eq!(a.failure, Some(FailureKind::Isolation));
    assert!(a.error.as_deref().unwrap().contains("develop"));
    assert_eq!(result_for(&outcome, "b").outcome, TaskOutcome::Skipped);
    assert!(!project.worktree("a").exists());
}

#[test]
fn test_create_with_missing_base_leaves_no_partial_copy() {
    let project = TestProject::new();
    let mut manager = IsolationManager::open(&project.repo, &project.worktrees).unwrap();

    let err = manager.create(&"x".into(), "main-missing", None, false).unwrap_err();
    assert_eq!(err, IsolationError::BaseNotFound("main-missing".to_string()));
    assert!(!project.worktree("x").exists());
    assert!(manager.list_all_worktrees().unwrap().is_empty());
    assert!(!crate::fixtures::branch_exists(&project.repo, "feature/x"));
}
