use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use wavepilot::config::{ProjectConfig, DEFAULT_CONFIG_PATH};
use wavepilot::core::TaskGraph;
use wavepilot::isolation::IsolationManager;
use wavepilot::orchestration::{Reporter, TaskExecutor, WaveScheduler};
use wavepilot::{wlog, wlog_error, Error, Result};

const EXIT_TASK_FAILURE: u8 = 1;
const EXIT_PLANNING_FAILURE: u8 = 2;

/// Wavepilot - run dependent coding tasks in parallel waves, one git worktree per task
#[derive(Parser, Debug)]
#[command(name = "wavepilot")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    WAVEPILOT_DEBUG=1     Enable debug logging (alternative to --debug)\n    WAVEPILOT_LOG=trace   Set the log level explicitly"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.wavepilot/wavepilot.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate the task graph and show the execution waves without running anything
    Plan {
        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Execute every task, wave by wave
    Run {
        /// Skip confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,

        /// Run one task at a time
        #[arg(long)]
        sequential: bool,

        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Remove task worktrees
    Cleanup {
        /// Only worktrees whose branch is merged into the base branch (default)
        #[arg(long, conflicts_with = "all")]
        merged: bool,

        /// Every worktree, including uncommitted work
        #[arg(long)]
        all: bool,

        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Show active worktrees and tool availability
    Status {
        #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    wavepilot::log::init_with_debug(cli.debug);
    wlog!("wavepilot starting: {:?}", cli.command);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Plan { config } => run_plan(config).await,
            Command::Run {
                yes,
                sequential,
                config,
            } => run_tasks(config, yes, sequential).await,
            Command::Cleanup { all, config, .. } => run_cleanup(config, all).await,
            Command::Status { config } => run_status(config).await,
        }
    });

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            wlog_error!("{}", e);
            eprintln!("Error: {}", e);
            match e {
                Error::Config(_) | Error::Graph(_) | Error::Isolation(_) => {
                    ExitCode::from(EXIT_PLANNING_FAILURE)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn load(config: &Path) -> Result<(ProjectConfig, TaskGraph)> {
    let project = ProjectConfig::load(config)?;
    let graph = TaskGraph::from_tasks(project.tasks.clone())?;
    Ok((project, graph))
}

async fn run_plan(config: PathBuf) -> Result<u8> {
    let (project, graph) = load(&config)?;
    let waves = graph.plan()?;
    let mut reporter = Reporter::new(true);
    reporter.display_plan(&graph, &waves)?;

    let executor = TaskExecutor::new(project.tool.clone());
    if let Err(e) = executor.check_tool_available() {
        println!("\n  Warning: {} (tasks will fail at dispatch)", e);
    }
    Ok(0)
}

async fn run_tasks(config: PathBuf, yes: bool, sequential: bool) -> Result<u8> {
    let (project, graph) = load(&config)?;
    let waves = graph.plan()?;

    let mut reporter = Reporter::new(true);
    reporter.display_plan(&graph, &waves)?;

    let executor = TaskExecutor::new(project.tool.clone());
    match executor.check_tool_available() {
        Ok(path) => println!("\n  Tool: {}", path.display()),
        Err(e) => println!("\n  Warning: {} (tasks will fail at dispatch)", e),
    }

    if !yes && !confirm("\n  Start execution?")? {
        println!("  Cancelled.");
        return Ok(0);
    }

    let repo = project.repo_path.clone();
    let worktrees = project.worktrees_dir.clone();
    let manager =
        wavepilot::util::blocking(move || Ok(IsolationManager::open(&repo, &worktrees)?)).await?;
    let isolation = Arc::new(Mutex::new(manager));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Interrupted: no new tasks will be started, waiting for running ones...");
            wlog!("Ctrl-C received, cancelling run");
            on_interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::channel(256);
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = reporter.display_progress(&event) {
                wlog_error!("Progress display failed: {}", e);
            }
        }
        reporter
    });

    let mut scheduler = WaveScheduler::new(
        graph,
        project.run_settings(sequential),
        isolation,
        executor,
        tx,
    );
    let outcome = scheduler.run(cancel).await?;
    drop(scheduler);
    let mut reporter = progress
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?;

    let report = Reporter::aggregate(
        &project.name,
        &outcome.waves,
        &outcome.results,
        outcome.started_at,
        outcome.finished_at,
    );
    reporter.display_report(&report)?;
    match Reporter::persist(&report, &project.reports_dir) {
        Ok((report_path, results_path)) => {
            println!("  Report:  {}", report_path.display());
            println!("  Results: {}", results_path.display());
        }
        Err(e) => {
            wlog_error!("Failed to persist report: {}", e);
            eprintln!("  Failed to write report: {}", e);
        }
    }

    if !report.branches_created.is_empty() {
        println!("\nNext steps:");
        println!("  1. Review each branch and merge what you want to keep");
        println!("  2. Remove merged worktrees: wavepilot cleanup --merged");
    }

    if outcome.has_failures() {
        Ok(EXIT_TASK_FAILURE)
    } else {
        Ok(0)
    }
}

async fn run_cleanup(config: PathBuf, all: bool) -> Result<u8> {
    let project = ProjectConfig::load(&config)?;
    let base = project.base_branch.clone();
    let cleaned = wavepilot::util::blocking(move || {
        let mut manager = IsolationManager::open(&project.repo_path, &project.worktrees_dir)?;
        let cleaned = if all {
            manager.cleanup_all()?
        } else {
            manager.cleanup_merged(&base)?
        };
        Ok(cleaned)
    })
    .await?;

    if cleaned.is_empty() {
        println!("Nothing to clean up.");
    } else {
        println!("Removed {} worktree(s):", cleaned.len());
        for id in &cleaned {
            println!("  • {}", id);
        }
    }
    Ok(0)
}

async fn run_status(config: PathBuf) -> Result<u8> {
    let project = ProjectConfig::load(&config)?;
    let repo = project.repo_path.clone();
    let worktrees = project.worktrees_dir.clone();
    let (active, all) = wavepilot::util::blocking(move || {
        let manager = IsolationManager::open(&repo, &worktrees)?;
        let active: Vec<_> = manager.list_active().into_iter().cloned().collect();
        let all = manager.list_all_worktrees()?;
        Ok((active, all))
    })
    .await?;

    println!("Project:   {}", project.name);
    println!("Repo:      {}", project.repo_path.display());
    println!("Worktrees: {}", project.worktrees_dir.display());
    println!();

    if active.is_empty() {
        println!("No active task worktrees.");
    } else {
        println!("Active task worktrees ({}):", active.len());
        for ctx in &active {
            println!(
                "  {:<20} {:<28} {}",
                ctx.task_id,
                ctx.branch,
                ctx.created_at.format("%Y-%m-%d %H:%M")
            );
        }
    }
    let unmanaged = all.len().saturating_sub(active.len());
    if unmanaged > 0 {
        println!("  (+{} other worktree(s) in this repository)", unmanaged);
    }

    println!();
    let executor = TaskExecutor::new(project.tool.clone());
    match executor.check_tool_available() {
        Ok(path) => {
            let version = executor
                .tool_version()
                .await
                .unwrap_or_else(|e| format!("version unknown: {}", e));
            println!("Tool: {} ({})", path.display(), version);
        }
        Err(e) => println!("Tool: unavailable - {}", e),
    }
    Ok(0)
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
