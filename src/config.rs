//! Project file loading.
//!
//! A project file names the repository, run limits, tool options and the
//! task list. JSON and TOML are both accepted; the format is picked from the
//! file extension.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::core::task::Task;
use crate::orchestration::{RunSettings, ToolSettings};
use crate::{wlog_debug, Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/feature_list.json";

/// Task ids become directory and branch names.
static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Toml,
}

impl Format {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => Format::Toml,
            _ => Format::Json,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default, alias = "claude")]
    pub tool: ToolSection,
    #[serde(default, alias = "tasks")]
    pub features: Vec<FeatureEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    #[serde(default = "default_name")]
    pub name: String,
    pub repo_path: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    pub worktrees_dir: Option<String>,
    pub reports_dir: Option<String>,
    pub prompts_dir: Option<String>,
    #[serde(default = "default_true")]
    pub recreate_isolations: bool,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            repo_path: None,
            base_branch: default_base_branch(),
            max_parallel: default_max_parallel(),
            timeout_seconds: default_timeout_seconds(),
            worktrees_dir: None,
            reports_dir: None,
            prompts_dir: None,
            recreate_isolations: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSection {
    pub binary: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub append_system_prompt: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub prompt_file: Option<String>,
    pub estimated_tokens: Option<u64>,
}

fn default_name() -> String {
    "UnnamedProject".to_string()
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_parallel() -> usize {
    3
}

fn default_timeout_seconds() -> u64 {
    1800
}

fn default_true() -> bool {
    true
}

/// A loaded project with every path resolved.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub source: PathBuf,
    pub name: String,
    pub repo_path: PathBuf,
    pub base_branch: String,
    pub max_parallel: usize,
    pub timeout: Duration,
    pub worktrees_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub recreate_isolations: bool,
    pub tool: ToolSettings,
    pub tasks: Vec<Task>,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        wlog_debug!("ProjectConfig::load path={}", path.display());
        if !path.exists() {
            return Err(Error::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(path)?;
        let source = absolutize(path)?;
        Self::parse(&content, Format::from_path(path), &source)
    }

    /// Parse file content; `source` is the (absolute) location it came from
    /// and anchors the default prompts directory.
    pub fn parse(content: &str, format: Format, source: &Path) -> Result<Self> {
        let file: ProjectFile = match format {
            Format::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("malformed JSON in {}: {}", source.display(), e)))?,
            Format::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("malformed TOML in {}: {}", source.display(), e)))?,
        };
        Self::from_file(file, source)
    }

    fn from_file(file: ProjectFile, source: &Path) -> Result<Self> {
        let ProjectFile {
            project,
            tool,
            features,
        } = file;

        if project.max_parallel == 0 {
            return Err(Error::Config("max_parallel must be at least 1".to_string()));
        }
        if project.timeout_seconds == 0 {
            return Err(Error::Config("timeout_seconds must be at least 1".to_string()));
        }
        if features.is_empty() {
            return Err(Error::Config("no features defined".to_string()));
        }

        let repo_path = match &project.repo_path {
            Some(p) => absolutize(&expand_tilde(p))?,
            None => std::env::current_dir()?,
        };
        let worktrees_dir = match &project.worktrees_dir {
            Some(p) => absolutize(&expand_tilde(p))?,
            None => repo_path
                .parent()
                .unwrap_or(repo_path.as_path())
                .join("worktrees"),
        };
        let reports_dir = match &project.reports_dir {
            Some(p) => absolutize(&expand_tilde(p))?,
            None => absolutize(Path::new("reports"))?,
        };
        let config_dir = source.parent().unwrap_or(Path::new("."));
        let prompts_dir = match &project.prompts_dir {
            Some(p) => absolutize(&expand_tilde(p))?,
            None => config_dir
                .parent()
                .unwrap_or(config_dir)
                .join("prompts"),
        };

        let tasks = build_tasks(&features, &prompts_dir)?;
        let defaults = ToolSettings::default();
        let tool = ToolSettings {
            binary: tool.binary.map(|b| expand_tilde(&b)).unwrap_or(defaults.binary),
            permission_mode: tool.permission_mode.unwrap_or(defaults.permission_mode),
            allowed_tools: tool.allowed_tools.unwrap_or(defaults.allowed_tools),
            append_system_prompt: tool.append_system_prompt,
            extra_args: tool.extra_args,
        };

        wlog_debug!(
            "Config loaded: project={} tasks={} max_parallel={} timeout={}s",
            project.name,
            tasks.len(),
            project.max_parallel,
            project.timeout_seconds
        );

        Ok(Self {
            source: source.to_path_buf(),
            name: project.name,
            repo_path,
            base_branch: project.base_branch,
            max_parallel: project.max_parallel,
            timeout: Duration::from_secs(project.timeout_seconds),
            worktrees_dir,
            reports_dir,
            prompts_dir,
            recreate_isolations: project.recreate_isolations,
            tool,
            tasks,
        })
    }

    pub fn run_settings(&self, sequential: bool) -> RunSettings {
        RunSettings {
            base_branch: self.base_branch.clone(),
            max_parallel: self.max_parallel,
            sequential,
            task_timeout: self.timeout,
            recreate_isolations: self.recreate_isolations,
        }
    }

    pub fn total_estimated_tokens(&self) -> u64 {
        self.tasks.iter().filter_map(|t| t.estimated_tokens).sum()
    }
}

fn build_tasks(features: &[FeatureEntry], prompts_dir: &Path) -> Result<Vec<Task>> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(features.len());
    for feature in features {
        if !TASK_ID_RE.is_match(&feature.id) {
            return Err(Error::Config(format!(
                "invalid task id '{}': use letters, digits, '.', '_' or '-'",
                feature.id
            )));
        }
        if !seen.insert(feature.id.as_str()) {
            return Err(Error::Config(format!("duplicate task id '{}'", feature.id)));
        }
        let prompt_file = feature
            .prompt_file
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| {
                Error::Config(format!("task '{}' has no prompt_file defined", feature.id))
            })?;

        let mut task = Task::new(feature.id.as_str(), &feature.name)
            .depends_on(feature.depends_on.iter().map(String::as_str))
            .with_descriptor(prompts_dir.join(prompt_file));
        if let Some(tokens) = feature.estimated_tokens {
            task = task.with_estimate(tokens);
        }
        tasks.push(task);
    }
    Ok(tasks)
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
