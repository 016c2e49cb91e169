//! External tool executor.
//!
//! One task attempt is one headless tool invocation:
//! `<binary> -p <instructions> --output-format json --permission-mode <mode>
//! --allowedTools <list>`, rooted in the task's working copy. The tool must
//! print a single JSON payload on stdout; anything else is a parse failure.

use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::core::task::{ExecutionResult, FailureKind, TaskId};
use crate::util::truncate;
use crate::{wlog_debug, wlog_trace, wlog_warn, Error, Result};

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Glob",
    "Grep",
    "Bash(npm test)",
    "Bash(npm run lint)",
    "Bash(bundle exec rspec)",
    "Bash(bundle exec rubocop)",
    "Bash(pytest)",
    "Bash(python -m pytest)",
];

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_CHARS: usize = 2000;

/// How the external tool is invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSettings {
    pub binary: PathBuf,
    pub permission_mode: String,
    pub allowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
    /// Passed through verbatim after the standard flags.
    pub extra_args: Vec<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            permission_mode: "acceptEdits".to_string(),
            allowed_tools: DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect(),
            append_system_prompt: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success { output: String },
    Error { message: String },
}

/// Parsed payload of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub session_id: Option<String>,
    pub result: ToolOutcome,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl ToolResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.result, ToolOutcome::Success { .. })
    }
}

#[derive(Debug, Deserialize)]
struct RawToolResponse {
    subtype: Option<String>,
    is_error: Option<bool>,
    result: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

/// Parse the tool's stdout. A payload without a success indicator is
/// rejected rather than guessed at.
pub fn parse_json_response(stdout: &str) -> Result<ToolResponse> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(Error::OutputParse("tool produced no output".to_string()));
    }
    let raw: RawToolResponse = serde_json::from_str(trimmed)
        .map_err(|e| Error::OutputParse(format!("{}: {}", e, truncate(trimmed, 200))))?;

    let failed = raw.is_error == Some(true);
    let result = match (raw.subtype.as_deref(), raw.is_error) {
        (Some("success"), _) if !failed => ToolOutcome::Success {
            output: raw.result.unwrap_or_default(),
        },
        (None, Some(false)) => ToolOutcome::Success {
            output: raw.result.unwrap_or_default(),
        },
        (None, None) => {
            return Err(Error::OutputParse(
                "payload has no success indicator".to_string(),
            ))
        }
        (subtype, _) => ToolOutcome::Error {
            message: raw
                .error
                .or(raw.result)
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| {
                    format!("tool reported {}", subtype.unwrap_or("an error"))
                }),
        },
    };

    Ok(ToolResponse {
        session_id: raw.session_id,
        result,
        cost_usd: raw.total_cost_usd,
        duration_ms: raw.duration_ms,
        num_turns: raw.num_turns,
    })
}

fn failure_kind(err: &Error) -> FailureKind {
    match err {
        Error::Timeout(_) => FailureKind::Timeout,
        Error::OutputParse(_) => FailureKind::Parse,
        Error::ToolFailed(_) => FailureKind::ExitStatus,
        _ => FailureKind::Spawn,
    }
}

/// Runs one task attempt at a time. Bounding concurrency is the caller's job.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    settings: ToolSettings,
}

impl TaskExecutor {
    pub fn new(settings: ToolSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    /// Arguments passed to the tool for the given instructions.
    pub fn command_args(&self, instructions: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            instructions.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--permission-mode".to_string(),
            self.settings.permission_mode.clone(),
        ];
        if !self.settings.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.settings.allowed_tools.join(","));
        }
        if let Some(extra) = &self.settings.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(extra.clone());
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    /// Run the tool once in `isolation_path` and fold every outcome,
    /// including spawn errors and timeouts, into an [`ExecutionResult`].
    pub async fn run_single(
        &self,
        isolation_path: &Path,
        instructions: &str,
        task_id: &TaskId,
        timeout: Duration,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = match self.execute(isolation_path, instructions, timeout).await {
            Ok(response) => {
                let mut result = match response.result {
                    ToolOutcome::Success { output } => {
                        ExecutionResult::succeeded(task_id.clone(), output)
                    }
                    ToolOutcome::Error { message } => ExecutionResult::failed(
                        task_id.clone(),
                        FailureKind::ToolReported,
                        truncate(&message, MAX_ERROR_CHARS),
                    ),
                };
                result.cost_usd = response.cost_usd.unwrap_or(0.0);
                result.duration_ms = response.duration_ms.unwrap_or(0);
                result.session_id = response.session_id;
                result.num_turns = response.num_turns;
                result
            }
            Err(e) => {
                let kind = failure_kind(&e);
                wlog_warn!("Task '{}' failed ({:?}): {}", task_id, kind, e);
                ExecutionResult::failed(task_id.clone(), kind, e.to_string())
            }
        };
        wlog_debug!(
            "Task '{}' finished: {} in {:?}",
            task_id,
            result.outcome,
            clock.elapsed()
        );
        result.with_timing(started_at, Utc::now())
    }

    /// Spawn the tool, race it against `timeout`, and parse its payload.
    pub async fn execute(
        &self,
        cwd: &Path,
        instructions: &str,
        timeout: Duration,
    ) -> Result<ToolResponse> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(self.command_args(instructions))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down the whole tree and
        // a terminal Ctrl-C does not reach in-flight tools.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(self.settings.binary.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        wlog_debug!(
            "Spawned {} (pid {:?}) in {}",
            self.settings.binary.display(),
            child.id(),
            cwd.display()
        );

        let pgid = child.id();
        let mut stdout_reader = tokio::spawn(read_all(child.stdout.take()));
        let mut stderr_reader = tokio::spawn(read_all(child.stderr.take()));

        // The deadline covers draining the pipes too: a descendant holding
        // stdout open must not outlive it.
        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await?;
            // Leftover descendants die with the tool; this also closes the pipes.
            kill_group(pgid);
            let stdout = (&mut stdout_reader)
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;
            let stderr = (&mut stderr_reader)
                .await
                .map_err(|e| Error::TaskJoin(e.to_string()))?;
            Ok::<_, Error>((status, stdout, stderr))
        })
        .await;

        let (status, stdout, stderr) = match finished {
            Ok(done) => done?,
            Err(_) => {
                wlog_warn!("Tool exceeded {:?}, killing process group {:?}", timeout, pgid);
                kill_group(pgid);
                let _ = child.kill().await;
                stdout_reader.abort();
                stderr_reader.abort();
                return Err(Error::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&stdout);
        let stderr = String::from_utf8_lossy(&stderr);
        wlog_trace!("Tool exited {:?}, stdout: {}", status.code(), stdout);

        if !status.success() {
            let detail = if stderr.trim().is_empty() {
                format!("exit code {}", status.code().unwrap_or(-1))
            } else {
                truncate(stderr.trim(), MAX_ERROR_CHARS)
            };
            return Err(Error::ToolFailed(detail));
        }
        parse_json_response(&stdout)
    }

    /// Advisory pre-flight check: where the tool binary resolves to.
    pub fn check_tool_available(&self) -> Result<PathBuf> {
        which::which(&self.settings.binary)
            .map_err(|_| Error::ToolNotFound(self.settings.binary.display().to_string()))
    }

    /// First line of `<binary> --version`.
    pub async fn tool_version(&self) -> Result<String> {
        let output = tokio::time::timeout(
            VERSION_TIMEOUT,
            Command::new(&self.settings.binary)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(VERSION_TIMEOUT))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::ToolNotFound(self.settings.binary.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        if !output.status.success() {
            return Err(Error::ToolFailed(format!(
                "--version exited with {}",
                output.status.code().unwrap_or(-1)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

/// SIGKILL every process in the group led by `pgid`. A group that is
/// already gone is not an error.
fn kill_group(pgid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pgid {
        // SAFETY: plain signal delivery to the child's own process group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}
