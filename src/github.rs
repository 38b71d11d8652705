//! GitHub Actions host integration
//!
//! Provides:
//! - Trigger kind and branch names from the workflow environment
//! - Step outputs, job summary and workflow command annotations

use anyhow::{Context, Result};
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Event that triggered the workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PullRequest,
    Push,
    Schedule,
    WorkflowDispatch,
    Other(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "pull_request" | "pull_request_target" => EventKind::PullRequest,
            "push" => EventKind::Push,
            "schedule" => EventKind::Schedule,
            "workflow_dispatch" => EventKind::WorkflowDispatch,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Runs that publish the baseline rather than compare against it
    pub fn is_push_like(&self) -> bool {
        matches!(
            self,
            EventKind::Push | EventKind::Schedule | EventKind::WorkflowDispatch
        )
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::PullRequest => "pull_request",
            EventKind::Push => "push",
            EventKind::Schedule => "schedule",
            EventKind::WorkflowDispatch => "workflow_dispatch",
            EventKind::Other(name) => name,
        }
    }
}

/// Values the workflow environment provides for one run
#[derive(Debug, Clone)]
pub struct RunContext {
    pub event: EventKind,
    /// Target branch of a pull request
    pub base_ref: Option<String>,
    /// Branch or tag this run was triggered for
    pub ref_name: Option<String>,
    /// `owner/name`
    pub repository: Option<String>,
    pub api_url: String,
    pub workspace: Option<PathBuf>,
}

impl RunContext {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let event = EventKind::from_name(&var("GITHUB_EVENT_NAME").unwrap_or_default());

        // GITHUB_REF_NAME of a pull request is "<number>/merge"
        let ref_name = match event {
            EventKind::PullRequest => var("GITHUB_HEAD_REF"),
            _ => None,
        }
        .or_else(|| var("GITHUB_REF_NAME"))
        .or_else(|| {
            var("GITHUB_REF").map(|r| {
                r.trim_start_matches("refs/heads/")
                    .trim_start_matches("refs/tags/")
                    .to_string()
            })
        });

        Self {
            event,
            base_ref: var("GITHUB_BASE_REF"),
            ref_name,
            repository: var("GITHUB_REPOSITORY"),
            api_url: var("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            workspace: var("GITHUB_WORKSPACE").map(PathBuf::from),
        }
    }
}

/// Where a run reports to
pub trait Platform {
    fn set_output(&self, name: &str, value: &str) -> Result<()>;
    fn append_summary(&self, markdown: &str) -> Result<()>;
    fn warning(&self, message: &str);
    fn error(&self, message: &str);
}

/// Workflow commands and environment files of a GitHub Actions runner
#[derive(Debug, Clone, Default)]
pub struct GithubActions {
    output_file: Option<PathBuf>,
    summary_file: Option<PathBuf>,
}

impl GithubActions {
    pub fn new(output_file: Option<PathBuf>, summary_file: Option<PathBuf>) -> Self {
        Self {
            output_file,
            summary_file,
        }
    }

    pub fn from_env() -> Self {
        let path = |name: &str| env::var(name).ok().filter(|v| !v.is_empty()).map(PathBuf::from);
        Self::new(path("GITHUB_OUTPUT"), path("GITHUB_STEP_SUMMARY"))
    }
}

impl Platform for GithubActions {
    fn set_output(&self, name: &str, value: &str) -> Result<()> {
        match self.output_file {
            Some(ref path) => append(path, &format!("{}={}\n", name, value)),
            None => {
                tracing::debug!("GITHUB_OUTPUT not set, output {}={}", name, value);
                Ok(())
            }
        }
    }

    fn append_summary(&self, markdown: &str) -> Result<()> {
        match self.summary_file {
            Some(ref path) => append(path, markdown),
            None => {
                tracing::debug!("GITHUB_STEP_SUMMARY not set, skipping job summary");
                Ok(())
            }
        }
    }

    fn warning(&self, message: &str) {
        println!("::warning::{}", escape_command_data(message));
    }

    fn error(&self, message: &str) {
        println!("::error::{}", escape_command_data(message));
    }
}

fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Could not open {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Could not write to {}", path.display()))
}

/// Escape a workflow command message so it stays on one line
pub fn escape_command_data(message: &str) -> String {
    message
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}
