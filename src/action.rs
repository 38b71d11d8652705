//! One run of the coverage step
//!
//! Push-like runs publish the report as the branch baseline. Pull request
//! runs fetch the target branch baseline, compare and write the report.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::artifacts::ArtifactStore;
use crate::config::Config;
use crate::coverage::{compare_coverage, format_number, CoverageLoader, CoverageSnapshot, DiffResult, Failure};
use crate::error::ActionError;
use crate::github::{EventKind, Platform, RunContext};
use crate::report::{render_report, BadgeUrlBuilder, RenderedReport};

/// Result of a pull request run
#[derive(Debug, Clone)]
pub struct ComparisonOutcome {
    pub report_path: PathBuf,
    pub overall_coverage: f64,
    pub has_baseline: bool,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Compared(ComparisonOutcome),
    Published { tag: String },
    /// Trigger kinds without a handler
    Skipped { event: String },
}

impl RunOutcome {
    pub fn failures(&self) -> &[Failure] {
        match self {
            RunOutcome::Compared(outcome) => &outcome.failures,
            _ => &[],
        }
    }

    pub fn passed(&self) -> bool {
        self.failures().is_empty()
    }
}

/// A rendered comparison and where it was written
#[derive(Debug, Clone)]
pub struct Comparison {
    pub report_path: PathBuf,
    pub report: RenderedReport,
    pub diff: DiffResult,
}

pub struct Action<'a> {
    config: &'a Config,
    context: &'a RunContext,
    store: &'a dyn ArtifactStore,
    platform: &'a dyn Platform,
    badges: &'a dyn BadgeUrlBuilder,
    output_dir: PathBuf,
}

impl<'a> Action<'a> {
    pub fn new(
        config: &'a Config,
        context: &'a RunContext,
        store: &'a dyn ArtifactStore,
        platform: &'a dyn Platform,
        badges: &'a dyn BadgeUrlBuilder,
    ) -> Self {
        Self {
            config,
            context,
            store,
            platform,
            badges,
            output_dir: PathBuf::new(),
        }
    }

    /// Directory the markdown report is written to (default: working directory)
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        let report_path = self.config.report_path()?;
        if !report_path.is_file() {
            return Err(ActionError::input_unavailable(report_path).into());
        }

        match &self.context.event {
            EventKind::PullRequest => self.compare(&report_path).await.map(RunOutcome::Compared),
            event if event.is_push_like() => self.publish(&report_path).await,
            event => {
                tracing::info!("no handler for '{}' events", event.name());
                println!("{} Nothing to do for {} events", "•".dimmed(), event.name().cyan());
                Ok(RunOutcome::Skipped {
                    event: event.name().to_string(),
                })
            }
        }
    }

    async fn publish(&self, report_path: &Path) -> Result<RunOutcome> {
        let tag = self
            .context
            .ref_name
            .clone()
            .ok_or(ActionError::MissingEnvironment("GITHUB_REF_NAME"))?;

        self.store
            .store(&[report_path.to_path_buf()], &tag)
            .await
            .with_context(|| format!("Could not publish the coverage baseline for '{}'", tag))?;

        println!("{} Baseline published for {}", "📦".cyan(), tag.green());
        Ok(RunOutcome::Published { tag })
    }

    async fn compare(&self, report_path: &Path) -> Result<ComparisonOutcome> {
        let baseline_dir = match self.context.base_ref {
            Some(ref base_ref) => {
                self.store
                    .retrieve(base_ref, self.config.artifact_download_workflow_names.as_deref())
                    .await?
            }
            None => {
                tracing::warn!("GITHUB_BASE_REF is not set, comparing without a baseline");
                None
            }
        };

        let loader = self.loader()?;
        let head = loader
            .load(report_path)
            .ok_or_else(|| ActionError::coverage_unreadable(report_path))?;

        let base = match (baseline_dir, report_path.file_name()) {
            (Some(dir), Some(file_name)) => {
                let path = dir.join(file_name);
                let snapshot = loader.load(&path);
                if snapshot.is_none() {
                    tracing::warn!("baseline artifact has no readable {}", path.display());
                }
                snapshot
            }
            _ => None,
        };

        if base.is_none() {
            let target = self.context.base_ref.as_deref().unwrap_or("the base branch");
            self.platform.warning(&format!(
                "No baseline coverage found for {}, the report has no comparison",
                target
            ));
        }

        let comparison = compare_and_write(self.config, &head, base.as_ref(), &self.output_dir, self.badges)?;

        self.platform.append_summary(&comparison.report.markdown)?;
        self.platform
            .set_output("file", &comparison.report_path.to_string_lossy())?;
        self.platform
            .set_output("coverage", &format_number(comparison.report.overall_coverage))?;

        for failure in &comparison.diff.failures {
            self.platform.error(&failure.to_string());
        }

        println!(
            "\n{} Report generated: {}",
            "📊".cyan(),
            comparison.report_path.display().to_string().green()
        );
        comparison.diff.print_summary();

        Ok(ComparisonOutcome {
            overall_coverage: comparison.report.overall_coverage,
            has_baseline: comparison.diff.has_baseline(),
            failures: comparison.diff.failures,
            report_path: comparison.report_path,
        })
    }

    /// Paths are made relative to the configured base path, else the workspace
    fn loader(&self) -> Result<CoverageLoader> {
        let base_path = match self.config.base_path()? {
            Some(path) => Some(path),
            None => self.context.workspace.clone(),
        };
        Ok(config_loader(self.config)?.with_base_path(base_path))
    }
}

/// Loader honoring the configured format and base path
pub fn config_loader(config: &Config) -> Result<CoverageLoader> {
    Ok(CoverageLoader::new()
        .with_base_path(config.base_path()?)
        .with_format(config.coverage_format()?))
}

/// Diff `head` against `base`, render the report and write it to `<markdown_filename>.md` in `output_dir`
pub fn compare_and_write(
    config: &Config,
    head: &CoverageSnapshot,
    base: Option<&CoverageSnapshot>,
    output_dir: &Path,
    badges: &dyn BadgeUrlBuilder,
) -> Result<Comparison> {
    let diff = compare_coverage(head, base, &config.diff_policy());
    let report = render_report(head, base, &diff, &config.report_options(), badges);

    let report_path = config.markdown_path(output_dir);
    report.write(&report_path)?;

    Ok(Comparison {
        report_path,
        report,
        diff,
    })
}
