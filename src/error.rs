//! Terminal failure conditions of a run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("coverage report not found: {}", .path.display())]
    InputUnavailable { path: PathBuf },

    #[error("coverage report could not be read or parsed: {}", .path.display())]
    CoverageUnreadable { path: PathBuf },

    #[error("environment variable {0} is not set")]
    MissingEnvironment(&'static str),

    #[error("artifact storage: {0}")]
    Artifact(String),
}

impl ActionError {
    pub fn input_unavailable(path: impl Into<PathBuf>) -> Self {
        Self::InputUnavailable { path: path.into() }
    }

    pub fn coverage_unreadable(path: impl Into<PathBuf>) -> Self {
        Self::CoverageUnreadable { path: path.into() }
    }

    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }
}
