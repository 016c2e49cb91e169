//! Concurrency gate and wave ordering tests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use wavepilot::core::{FailureKind, TaskId, TaskOutcome};
use wavepilot::orchestration::{ProgressEvent, RunSettings, SchedulerState};

use crate::fixtures::{
    result_for, run_cancelling_after_first_start, run_collecting, settings, started_ids,
    TestProject,
};

/// Highest number of tasks between start and finish at any point of the stream.
fn max_running(events: &[ProgressEvent]) -> usize {
    let mut running = 0usize;
    let mut peak = 0usize;
    for event in events {
        match event {
            ProgressEvent::TaskStarted { .. } => {
                running += 1;
                peak = peak.max(running);
            }
            ProgressEvent::TaskFinished { .. } => running -= 1,
            _ => {}
        }
    }
    peak
}

#[tokio::test]
async fn test_gate_bounds_running_tasks() {
    let project = TestProject::new();
    let tasks = (0..6)
        .map(|i| project.task(&format!("t{i}"), &[], "independent work"))
        .collect();
    let (scheduler, rx) = project.scheduler(tasks, settings(2, Duration::from_secs(30)));
    let (outcome, events) = run_collecting(scheduler, rx).await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.waves.len(), 1);
    assert!(outcome
        .results
        .iter()
        .all(|r| r.outcome == TaskOutcome::Succeeded));
    let peak = max_running(&events);
    assert!(peak <= 2, "{peak} tasks ran at once with capacity 2");
    assert!(peak >= 1);
}

#[tokio::test]
async fn test_sequential_mode_runs_one_at_a_time() {
    let project = TestProject::new();
    let tasks = vec![
        project.task("x", &[], "work"),
        project.task("y", &[], "work"),
        project.task("z", &[], "work"),
    ];
    let run_settings = RunSettings {
        sequential: true,
        ..settings(8, Duration::from_secs(30))
    };
    let (scheduler, rx) = project.scheduler(tasks, run_settings);
    let started = Instant::now();
    let (outcome, events) = run_collecting(scheduler, rx).await;

    assert!(outcome.unwrap().results.iter().all(|r| r.outcome.is_success()));
    assert_eq!(max_running(&events), 1);
    // Three tool runs of ~0.3s each, back to back.
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_next_wave_waits_for_current_wave() {
    let project = TestProject::new();
    let tasks = vec![
        project.task("a1", &[], "work"),
        project.task("a2", &[], "work"),
        project.task("a3", &[], "work"),
        project.task("b1", &["a1"], "work"),
        project.task("b2", &["a2", "a3"], "work"),
    ];
    let (scheduler, rx) = project.scheduler(tasks, settings(4, Duration::from_secs(30)));
    let (outcome, events) = run_collecting(scheduler, rx).await;
    let outcome = outcome.unwrap();

    let wave_of: HashMap<TaskId, usize> = outcome
        .waves
        .iter()
        .flat_map(|w| w.task_ids.iter().map(move |id| (id.clone(), w.number())))
        .collect();

    // Once a task of wave N starts, every task of earlier waves has finished.
    let mut finished_per_wave: HashMap<usize, usize> = HashMap::new();
    for event in &events {
        match event {
            ProgressEvent::TaskStarted { task_id, wave } => {
                assert_eq!(wave_of[task_id], *wave);
                for earlier in outcome.waves.iter().filter(|w| w.number() < *wave) {
                    assert_eq!(
                        finished_per_wave.get(&earlier.number()).copied().unwrap_or(0),
                        earlier.len(),
                        "{} started before wave {} finished",
                        task_id,
                        earlier.number()
                    );
                }
            }
            ProgressEvent::TaskFinished { wave, .. } | ProgressEvent::TaskSkipped { wave, .. } => {
                *finished_per_wave.entry(*wave).or_default() += 1;
            }
            ProgressEvent::WaveStarted { .. } => {}
        }
    }
    assert_eq!(outcome.results.len(), 5);
}

#[tokio::test]
async fn test_independent_runs_do_not_share_a_gate() {
    let first = TestProject::new();
    let second = TestProject::new();
    let (s1, rx1) = first.scheduler(
        vec![first.task("one", &[], "work")],
        settings(1, Duration::from_secs(30)),
    );
    let (s2, rx2) = second.scheduler(
        vec![second.task("two", &[], "work")],
        settings(1, Duration::from_secs(30)),
    );

    let ((o1, e1), (o2, e2)) = tokio::join!(run_collecting(s1, rx1), run_collecting(s2, rx2));
    assert!(o1.unwrap().results[0].outcome.is_success());
    assert!(o2.unwrap().results[0].outcome.is_success());
    assert_eq!(max_running(&e1), 1);
    assert_eq!(max_running(&e2), 1);
}

#[tokio::test]
async fn test_cancel_mid_run_lets_running_task_finish() {
    let project = TestProject::new();
    let tasks = vec![
        project.task("a", &[], "work"),
        project.task("b", &[], "work"),
        project.task("c", &["a"], "work"),
    ];
    let (scheduler, rx) = project.scheduler(tasks, settings(1, Duration::from_secs(30)));
    let (outcome, events) = run_cancelling_after_first_start(scheduler, rx).await;
    let outcome = outcome.unwrap();

    assert!(outcome.cancelled);
    assert_eq!(outcome.state, SchedulerState::Completed);
    assert_eq!(outcome.results.len(), 3);

    // Whichever task won the single slot runs to completion.
    let started = started_ids(&events);
    assert_eq!(started.len(), 1);
    let first = started[0].as_str();
    assert_eq!(result_for(&outcome, first).outcome, TaskOutcome::Succeeded);
    assert!(project.worktree(first).join("TOOL_RAN").exists());

    // The sibling waiting on the gate and the next wave are never dispatched.
    let sibling = if first == "a" { "b" } else { "a" };
    for id in [sibling, "c"] {
        let result = result_for(&outcome, id);
        assert_eq!(result.outcome, TaskOutcome::Skipped, "{id}");
        assert_eq!(result.failure, Some(FailureKind::Cancelled), "{id}");
        assert!(!project.worktree(id).exists(), "{id} got a working copy");
    }
}
