//! covdiff - coverage comparison for pull requests
//!
//! A library for comparing code coverage between a pull request and its base branch:
//! - LCOV, Cobertura and Clover report loading
//! - Per-file and overall comparison with threshold tiers
//! - Markdown report with badges
//! - Baseline storage in GitHub Actions artifacts or a local directory

pub mod action;
pub mod artifacts;
pub mod config;
pub mod coverage;
pub mod error;
pub mod github;
pub mod report;

pub use action::{Action, RunOutcome};
pub use config::Config;
pub use coverage::{CoverageLoader, CoverageSnapshot, DiffResult, Tier};
