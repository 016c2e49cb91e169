//! Progress display, run aggregation and report persistence.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::core::dag::{wave_lookup, TaskGraph, Wave};
use crate::core::task::{ExecutionResult, TaskId, TaskOutcome};
use crate::util::truncate;
use crate::{wlog, Error, Result};

const RULE: &str = "════════════════════════════════════════════════════════════";

/// Progress of a run, delivered in order over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    WaveStarted {
        /// One-based wave number.
        wave: usize,
        total_waves: usize,
        task_ids: Vec<TaskId>,
    },
    TaskStarted {
        task_id: TaskId,
        wave: usize,
    },
    TaskFinished {
        wave: usize,
        result: ExecutionResult,
    },
    /// Terminal without ever starting (dependency failed, run cancelled).
    TaskSkipped {
        wave: usize,
        result: ExecutionResult,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveSummary {
    pub wave: usize,
    pub task_ids: Vec<TaskId>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cpu_time_ms: u64,
    /// Span from the first start to the last finish within the wave.
    pub real_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
    pub error: String,
}

/// Aggregate of one run. The raw results travel with it but are persisted
/// separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub project_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_tasks: usize,
    pub attempted: usize,
    pub succeeded: usize,
    /// Includes timed-out tasks.
    pub failed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    /// Sum of per-task durations.
    pub cpu_time_ms: u64,
    /// Wall-clock span of the run.
    pub real_time_ms: u64,
    pub speedup: f64,
    pub total_cost_usd: f64,
    pub waves: Vec<WaveSummary>,
    pub branches_created: Vec<String>,
    pub errors: Vec<TaskError>,
    #[serde(skip)]
    pub results: Vec<ExecutionResult>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

pub struct Reporter {
    out: Box<dyn Write + Send>,
    verbose: bool,
    started: HashSet<TaskId>,
    finished: HashSet<TaskId>,
    results: Vec<ExecutionResult>,
}

impl Reporter {
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(Box::new(std::io::stdout()), verbose)
    }

    pub fn with_writer(out: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            out,
            verbose,
            started: HashSet::new(),
            finished: HashSet::new(),
            results: Vec::new(),
        }
    }

    /// Results seen so far through finish and skip events.
    pub fn results(&self) -> &[ExecutionResult] {
        &self.results
    }

    /// Print one progress event. A finish must follow a matching start,
    /// and every task reaches a terminal state at most once.
    pub fn display_progress(&mut self, event: &ProgressEvent) -> Result<()> {
        let now = Local::now().format("%H:%M:%S");
        match event {
            ProgressEvent::WaveStarted {
                wave,
                total_waves,
                task_ids,
            } => {
                writeln!(
                    self.out,
                    "\n  ▶ Wave {}/{} - {} task(s)",
                    wave,
                    total_waves,
                    task_ids.len()
                )?;
            }
            ProgressEvent::TaskStarted { task_id, .. } => {
                if !self.started.insert(task_id.clone()) {
                    return Err(Error::OutOfOrder(format!("'{}' started twice", task_id)));
                }
                if self.verbose {
                    writeln!(self.out, "  [{}] → {}: started", now, task_id)?;
                }
            }
            ProgressEvent::TaskFinished { result, .. } => {
                let id = &result.task_id;
                if !self.started.contains(id) {
                    return Err(Error::OutOfOrder(format!(
                        "'{}' finished without being started",
                        id
                    )));
                }
                self.record_terminal(result)?;
                let marker = if result.outcome.is_success() { "✓" } else { "✗" };
                write!(self.out, "  [{}] {} {}: {}", now, marker, id, result.outcome)?;
                if result.outcome.is_success() {
                    writeln!(
                        self.out,
                        " ({:.1}s, ${:.2})",
                        result.duration_ms as f64 / 1000.0,
                        result.cost_usd
                    )?;
                } else {
                    writeln!(
                        self.out,
                        " - {}",
                        truncate(result.error.as_deref().unwrap_or("unknown error"), 80)
                    )?;
                }
            }
            ProgressEvent::TaskSkipped { result, .. } => {
                if self.started.contains(&result.task_id) {
                    return Err(Error::OutOfOrder(format!(
                        "'{}' skipped after starting",
                        result.task_id
                    )));
                }
                self.record_terminal(result)?;
                writeln!(
                    self.out,
                    "  [{}] - {}: skipped ({})",
                    now,
                    result.task_id,
                    result.error.as_deref().unwrap_or("not dispatched")
                )?;
            }
        }
        Ok(())
    }

    fn record_terminal(&mut self, result: &ExecutionResult) -> Result<()> {
        if !self.finished.insert(result.task_id.clone()) {
            return Err(Error::OutOfOrder(format!(
                "'{}' reached a terminal state twice",
                result.task_id
            )));
        }
        self.results.push(result.clone());
        Ok(())
    }

    /// Fold per-task results into a [`RunReport`]. Results are ordered by
    /// wave, then task id, so the output does not depend on completion order.
    pub fn aggregate(
        project_name: &str,
        waves: &[Wave],
        results: &[ExecutionResult],
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> RunReport {
        let lookup = wave_lookup(waves);
        let mut ordered: Vec<ExecutionResult> = results.to_vec();
        ordered.sort_by(|a, b| {
            let wa = lookup.get(&a.task_id).copied().unwrap_or(usize::MAX);
            let wb = lookup.get(&b.task_id).copied().unwrap_or(usize::MAX);
            wa.cmp(&wb).then_with(|| a.task_id.cmp(&b.task_id))
        });

        let count = |pred: fn(&TaskOutcome) -> bool| {
            ordered.iter().filter(|r| pred(&r.outcome)).count()
        };
        let attempted = count(TaskOutcome::is_attempted);
        let succeeded = count(TaskOutcome::is_success);
        let failed = count(TaskOutcome::is_failure);
        let timed_out = count(|o| *o == TaskOutcome::TimedOut);
        let skipped = ordered.len() - attempted;

        let cpu_time_ms: u64 = ordered.iter().map(|r| r.duration_ms).sum();
        let real_time_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let speedup = if real_time_ms > 0 {
            cpu_time_ms as f64 / real_time_ms as f64
        } else {
            0.0
        };
        let total_cost_usd = ordered.iter().map(|r| r.cost_usd).sum();

        let wave_summaries = waves
            .iter()
            .map(|wave| summarize_wave(wave, &ordered))
            .collect();

        let branches_created = ordered
            .iter()
            .filter(|r| r.outcome.is_success())
            .filter_map(|r| r.branch.clone())
            .collect();

        let errors = ordered
            .iter()
            .filter(|r| !r.outcome.is_success())
            .map(|r| TaskError {
                task_id: r.task_id.clone(),
                outcome: r.outcome,
                error: r.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            })
            .collect();

        RunReport {
            run_id: Uuid::new_v4(),
            project_name: project_name.to_string(),
            started_at,
            finished_at,
            total_tasks: ordered.len(),
            attempted,
            succeeded,
            failed,
            timed_out,
            skipped,
            cpu_time_ms,
            real_time_ms,
            speedup,
            total_cost_usd,
            waves: wave_summaries,
            branches_created,
            errors,
            results: ordered,
        }
    }

    /// Write `report_<stamp>.json` and `results_<stamp>.json` into `dir`.
    /// The stamp carries milliseconds and the start of the run id, so runs
    /// finishing close together keep separate artifacts.
    pub fn persist(report: &RunReport, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let run = report.run_id.simple().to_string();
        let stamp = format!(
            "{}_{}",
            report.finished_at.format("%Y%m%d_%H%M%S_%3f"),
            &run[..8]
        );
        let report_path = dir.join(format!("report_{}.json", stamp));
        let results_path = dir.join(format!("results_{}.json", stamp));
        std::fs::write(&report_path, serde_json::to_string_pretty(report)?)?;
        std::fs::write(&results_path, serde_json::to_string_pretty(&report.results)?)?;
        wlog!(
            "Report written to {} and {}",
            report_path.display(),
            results_path.display()
        );
        Ok((report_path, results_path))
    }

    pub fn display_plan(&mut self, graph: &TaskGraph, waves: &[Wave]) -> Result<()> {
        let total: usize = waves.iter().map(Wave::len).sum();
        writeln!(self.out, "\n{}", RULE)?;
        writeln!(self.out, "  EXECUTION PLAN")?;
        writeln!(self.out, "{}", RULE)?;
        writeln!(self.out, "\n  {} task(s) in {} wave(s)", total, waves.len())?;

        let mut tokens = 0u64;
        for wave in waves {
            let parallel = if wave.len() > 1 { " [parallel]" } else { "" };
            writeln!(self.out, "\n  Wave {}{}", wave.number(), parallel)?;
            writeln!(self.out, "  {}", "─".repeat(40))?;
            for id in &wave.task_ids {
                let Some(task) = graph.get_task(id) else {
                    continue;
                };
                writeln!(self.out, "  │ {}: {}", id, task.name)?;
                if self.verbose {
                    if task.dependencies.is_empty() {
                        writeln!(self.out, "  │   ← no dependencies")?;
                    } else {
                        let deps: Vec<&str> =
                            task.dependencies.iter().map(TaskId::as_str).collect();
                        writeln!(self.out, "  │   ← waits for {}", deps.join(", "))?;
                    }
                }
                if let Some(estimate) = task.estimated_tokens {
                    tokens += estimate;
                    if self.verbose {
                        writeln!(self.out, "  │   ~{} tokens", estimate)?;
                    }
                }
            }
        }

        writeln!(self.out)?;
        if tokens > 0 {
            writeln!(self.out, "  Estimated tokens: ~{}", tokens)?;
        }
        if !waves.is_empty() {
            writeln!(
                self.out,
                "  Theoretical speedup: {:.1}x",
                total as f64 / waves.len() as f64
            )?;
        }
        writeln!(self.out, "{}", RULE)?;
        Ok(())
    }

    pub fn display_report(&mut self, report: &RunReport) -> Result<()> {
        writeln!(self.out, "\n{}", RULE)?;
        writeln!(self.out, "  RUN REPORT")?;
        writeln!(self.out, "{}", RULE)?;
        writeln!(self.out)?;
        writeln!(self.out, "  Project     : {}", report.project_name)?;
        writeln!(self.out, "  Run         : {}", report.run_id)?;
        writeln!(
            self.out,
            "  CPU time    : {:.1} min",
            report.cpu_time_ms as f64 / 60_000.0
        )?;
        writeln!(
            self.out,
            "  Real time   : {:.1} min",
            report.real_time_ms as f64 / 60_000.0
        )?;
        writeln!(self.out, "  Total cost  : ${:.2}", report.total_cost_usd)?;
        writeln!(self.out, "  Tasks       : {}", report.total_tasks)?;
        writeln!(self.out, "    succeeded : {}", report.succeeded)?;
        writeln!(
            self.out,
            "    failed    : {} ({} timed out)",
            report.failed, report.timed_out
        )?;
        writeln!(self.out, "    skipped   : {}", report.skipped)?;
        writeln!(self.out, "  Waves       : {}", report.waves.len())?;

        if !report.branches_created.is_empty() {
            writeln!(self.out, "\n  Branches created:")?;
            for branch in &report.branches_created {
                writeln!(self.out, "    • {}", branch)?;
            }
        }
        if !report.errors.is_empty() {
            writeln!(self.out, "\n  Errors:")?;
            for err in &report.errors {
                writeln!(self.out, "    • {}: {}", err.task_id, truncate(&err.error, 60))?;
            }
        }
        if report.speedup > 0.0 {
            writeln!(self.out, "\n  Speedup: {:.1}x", report.speedup)?;
        }
        writeln!(self.out, "\n{}", RULE)?;
        Ok(())
    }
}

fn summarize_wave(wave: &Wave, results: &[ExecutionResult]) -> WaveSummary {
    let in_wave: Vec<&ExecutionResult> = results
        .iter()
        .filter(|r| wave.task_ids.contains(&r.task_id))
        .collect();
    let first_start = in_wave.iter().filter_map(|r| r.started_at).min();
    let last_finish = in_wave.iter().filter_map(|r| r.finished_at).max();
    let real_time_ms = match (first_start, last_finish) {
        (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
        _ => 0,
    };
    WaveSummary {
        wave: wave.number(),
        task_ids: wave.task_ids.clone(),
        succeeded: in_wave.iter().filter(|r| r.outcome.is_success()).count(),
        failed: in_wave.iter().filter(|r| r.outcome.is_failure()).count(),
        skipped: in_wave
            .iter()
            .filter(|r| r.outcome == TaskOutcome::Skipped)
            .count(),
        cpu_time_ms: in_wave.iter().map(|r| r.duration_ms).sum(),
        real_time_ms,
    }
}
