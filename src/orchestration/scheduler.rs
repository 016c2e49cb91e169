//! Wave scheduler.
//!
//! Drives one run: plans the graph into waves, then executes the waves in
//! order. Tasks within a wave run concurrently behind a run-wide semaphore;
//! the next wave starts only once every task of the current one reached a
//! terminal state. A task whose dependency did not succeed is recorded as
//! skipped without ever getting a working copy.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::dag::{TaskGraph, Wave};
use crate::core::task::{ExecutionResult, FailureKind, Task, TaskId, TaskOutcome};
use crate::isolation::{IsolationManager, TaskBrief};
use crate::orchestration::executor::TaskExecutor;
use crate::orchestration::reporter::ProgressEvent;
use crate::util::blocking;
use crate::{wlog, wlog_debug, wlog_error, wlog_warn, Error, Result};

/// Run-level knobs handed to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub base_branch: String,
    /// Gate capacity; ignored in sequential mode.
    pub max_parallel: usize,
    pub sequential: bool,
    pub task_timeout: Duration,
    /// Discard a task's previous working copy and branch before dispatch.
    pub recreate_isolations: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            max_parallel: 3,
            sequential: false,
            task_timeout: Duration::from_secs(1800),
            recreate_isolations: true,
        }
    }
}

impl RunSettings {
    pub fn gate_capacity(&self) -> usize {
        if self.sequential {
            1
        } else {
            self.max_parallel.max(1)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SchedulerState {
    Idle,
    Planning,
    /// Executing the wave with this zero-based index.
    Executing { wave: usize },
    Completed,
    Aborted,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: SchedulerState,
    pub waves: Vec<Wave>,
    /// One result per task, in the order they reached a terminal state.
    pub results: Vec<ExecutionResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.outcome.is_failure())
    }
}

pub struct WaveScheduler {
    graph: Arc<TaskGraph>,
    settings: RunSettings,
    isolation: Arc<Mutex<IsolationManager>>,
    executor: Arc<TaskExecutor>,
    events: mpsc::Sender<ProgressEvent>,
    state: SchedulerState,
}

impl WaveScheduler {
    pub fn new(
        graph: TaskGraph,
        settings: RunSettings,
        isolation: Arc<Mutex<IsolationManager>>,
        executor: TaskExecutor,
        events: mpsc::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            settings,
            isolation,
            executor: Arc::new(executor),
            events,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    fn transition(&mut self, next: SchedulerState) {
        wlog_debug!("Scheduler: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Plan and execute the whole graph.
    ///
    /// Returns `Err` only when planning fails, in which case nothing has
    /// been touched. Task-level failures are part of the returned outcome.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunOutcome> {
        let started_at = Utc::now();
        self.transition(SchedulerState::Planning);
        let waves = match self.graph.plan() {
            Ok(waves) => waves,
            Err(e) => {
                wlog_error!("Planning failed: {}", e);
                self.transition(SchedulerState::Aborted);
                return Err(e);
            }
        };
        wlog!(
            "Planned {} task(s) into {} wave(s), gate capacity {}",
            self.graph.task_count(),
            waves.len(),
            self.settings.gate_capacity()
        );

        let gate = Arc::new(Semaphore::new(self.settings.gate_capacity()));
        let mut outcomes: HashMap<TaskId, TaskOutcome> = HashMap::new();
        let mut results = Vec::with_capacity(self.graph.task_count());

        for wave in &waves {
            self.transition(SchedulerState::Executing { wave: wave.index });
            self.emit(ProgressEvent::WaveStarted {
                wave: wave.number(),
                total_waves: waves.len(),
                task_ids: wave.task_ids.clone(),
            })
            .await;

            let mut in_flight = JoinSet::new();
            for task_id in &wave.task_ids {
                let Some(task) = self.graph.get_task(task_id) else {
                    continue;
                };

                if let Some(result) = self.pre_dispatch_skip(task, &outcomes, &cancel) {
                    self.emit(ProgressEvent::TaskSkipped {
                        wave: wave.number(),
                        result: result.clone(),
                    })
                    .await;
                    outcomes.insert(task_id.clone(), result.outcome);
                    results.push(result);
                    continue;
                }

                let job = TaskJob {
                    task: task.clone(),
                    wave: wave.number(),
                    settings: self.settings.clone(),
                    gate: gate.clone(),
                    isolation: self.isolation.clone(),
                    executor: self.executor.clone(),
                    events: self.events.clone(),
                    cancel: cancel.clone(),
                };
                in_flight.spawn(job.run());
            }

            while let Some(joined) = in_flight.join_next().await {
                match joined {
                    Ok(result) => {
                        outcomes.insert(result.task_id.clone(), result.outcome);
                        results.push(result);
                    }
                    Err(e) => wlog_error!("Task execution aborted: {}", e),
                }
            }

            // A panicked job leaves no result behind; record one so every
            // task still ends in exactly one terminal state.
            for task_id in &wave.task_ids {
                if !outcomes.contains_key(task_id) {
                    let result = ExecutionResult::failed(
                        task_id.clone(),
                        FailureKind::Spawn,
                        "execution aborted unexpectedly",
                    );
                    outcomes.insert(task_id.clone(), result.outcome);
                    results.push(result);
                }
            }
            wlog!("Wave {}/{} finished", wave.number(), waves.len());
        }

        self.transition(SchedulerState::Completed);
        Ok(RunOutcome {
            state: self.state,
            waves,
            results,
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel.is_cancelled(),
        })
    }

    fn pre_dispatch_skip(
        &self,
        task: &Task,
        outcomes: &HashMap<TaskId, TaskOutcome>,
        cancel: &CancellationToken,
    ) -> Option<ExecutionResult> {
        if cancel.is_cancelled() {
            return Some(ExecutionResult::skipped(
                task.id.clone(),
                FailureKind::Cancelled,
                "run cancelled before dispatch",
            ));
        }
        let blocked: Vec<&str> = task
            .dependencies
            .iter()
            .filter(|dep| !outcomes.get(*dep).is_some_and(|o| o.is_success()))
            .map(|dep| dep.as_str())
            .collect();
        if blocked.is_empty() {
            return None;
        }
        wlog_debug!("Skipping '{}': blocked by {:?}", task.id, blocked);
        Some(ExecutionResult::skipped(
            task.id.clone(),
            FailureKind::DependencyFailed,
            format!("dependency did not succeed: {}", blocked.join(", ")),
        ))
    }

    async fn emit(&self, event: ProgressEvent) {
        send_event(&self.events, event).await;
    }
}

/// One task's trip through the gate: isolation, tool run, result.
struct TaskJob {
    task: Task,
    wave: usize,
    settings: RunSettings,
    gate: Arc<Semaphore>,
    isolation: Arc<Mutex<IsolationManager>>,
    executor: Arc<TaskExecutor>,
    events: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
}

impl TaskJob {
    async fn run(self) -> ExecutionResult {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.gate.clone().acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit.filter(|_| !self.cancel.is_cancelled()) else {
            let result = ExecutionResult::skipped(
                self.task.id.clone(),
                FailureKind::Cancelled,
                "run cancelled before dispatch",
            );
            self.emit(ProgressEvent::TaskSkipped {
                wave: self.wave,
                result: result.clone(),
            })
            .await;
            return result;
        };

        self.emit(ProgressEvent::TaskStarted {
            task_id: self.task.id.clone(),
            wave: self.wave,
        })
        .await;
        let result = self.attempt().await;
        self.emit(ProgressEvent::TaskFinished {
            wave: self.wave,
            result: result.clone(),
        })
        .await;
        result
    }

    async fn attempt(&self) -> ExecutionResult {
        let started_at = Utc::now();
        let task_id = &self.task.id;

        let instructions = match tokio::fs::read_to_string(&self.task.work_descriptor).await {
            Ok(text) => text,
            Err(e) => {
                wlog_warn!("Cannot read instructions for '{}': {}", task_id, e);
                return ExecutionResult::failed(
                    task_id.clone(),
                    FailureKind::Instructions,
                    format!(
                        "cannot read {}: {}",
                        self.task.work_descriptor.display(),
                        e
                    ),
                )
                .with_timing(started_at, Utc::now());
            }
        };

        let brief = TaskBrief::new(self.task.name.clone(), instructions.clone());
        let isolation = self.isolation.clone();
        let id = task_id.clone();
        let base = self.settings.base_branch.clone();
        let force = self.settings.recreate_isolations;
        let created = blocking(move || {
            let mut manager = isolation.blocking_lock();
            manager
                .create(&id, &base, Some(&brief), force)
                .map_err(Error::from)
        })
        .await;
        let ctx = match created {
            Ok(ctx) => ctx,
            Err(e) => {
                wlog_warn!("Isolation for '{}' failed: {}", task_id, e);
                return ExecutionResult::failed(
                    task_id.clone(),
                    FailureKind::Isolation,
                    e.to_string(),
                )
                .with_timing(started_at, Utc::now());
            }
        };

        self.executor
            .run_single(&ctx.path, &instructions, task_id, self.settings.task_timeout)
            .await
            .with_branch(&ctx.branch)
    }

    async fn emit(&self, event: ProgressEvent) {
        send_event(&self.events, event).await;
    }
}

/// Progress is best-effort: a dropped receiver never fails a run.
async fn send_event(events: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    if events.send(event).await.is_err() {
        wlog_debug!("Progress receiver dropped");
    }
}
