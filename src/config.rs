use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::coverage::{CoverageFormat, DiffPolicy, Thresholds, DEFAULT_ERROR_CEILING, DEFAULT_WARNING_CEILING};
use crate::report::ReportOptions;

pub const CONFIG_FILE: &str = "covdiff.toml";

/// Per-run settings. Built once at startup, read-only afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub token: Option<String>,
    /// Coverage report to read (and publish on push-like runs)
    pub filename: String,
    /// Force a report format instead of sniffing it
    pub format: Option<String>,
    /// Root used to make file paths relative
    pub base_path: Option<String>,
    pub badge: bool,
    pub overall_coverage_fail_threshold: f64,
    pub file_coverage_error_min: f64,
    pub file_coverage_warning_max: f64,
    pub fail_on_negative_difference: bool,
    pub fail_on_negative_overall_difference: bool,
    /// Report basename, `.md` is appended
    pub markdown_filename: String,
    /// Only consider artifacts produced by these workflows
    pub artifact_download_workflow_names: Option<Vec<String>>,
    pub artifact_name: String,
    /// Keep artifacts in this directory instead of the GitHub artifact storage
    pub artifact_dir: Option<String>,
    pub report_overall_coverage: bool,
    pub report_package_coverage: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            filename: "coverage.xml".to_string(),
            format: None,
            base_path: None,
            badge: true,
            overall_coverage_fail_threshold: 0.0,
            file_coverage_error_min: DEFAULT_ERROR_CEILING,
            file_coverage_warning_max: DEFAULT_WARNING_CEILING,
            fail_on_negative_difference: false,
            fail_on_negative_overall_difference: false,
            markdown_filename: "code-coverage-results".to_string(),
            artifact_download_workflow_names: None,
            artifact_name: "coverage-report".to_string(),
            artifact_dir: None,
            report_overall_coverage: true,
            report_package_coverage: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load `path` when given, else `covdiff.toml` if it exists, else defaults
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let percentages = [
            ("overall_coverage_fail_threshold", self.overall_coverage_fail_threshold),
            ("file_coverage_error_min", self.file_coverage_error_min),
            ("file_coverage_warning_max", self.file_coverage_warning_max),
        ];
        for (name, value) in percentages {
            if !(0.0..=100.0).contains(&value) {
                anyhow::bail!("'{}' must be between 0 and 100, got {}", name, value);
            }
        }

        for (name, value) in [
            ("filename", &self.filename),
            ("markdown_filename", &self.markdown_filename),
            ("artifact_name", &self.artifact_name),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("'{}' must not be empty", name);
            }
        }

        if let Some(ref format) = self.format {
            format.parse::<CoverageFormat>()?;
        }

        Ok(())
    }

    /// Apply command line / action input overrides on top of file values
    pub fn apply(&mut self, overrides: ConfigOverrides) -> Result<()> {
        let ConfigOverrides {
            token,
            filename,
            format,
            base_path,
            badge,
            overall_coverage_fail_threshold,
            file_coverage_error_min,
            file_coverage_warning_max,
            fail_on_negative_difference,
            fail_on_negative_overall_difference,
            markdown_filename,
            artifact_download_workflow_names,
            artifact_name,
            artifact_dir,
            report_overall_coverage,
            report_package_coverage,
        } = overrides;

        if token.is_some() {
            self.token = token;
        }
        if format.is_some() {
            self.format = format;
        }
        if base_path.is_some() {
            self.base_path = base_path;
        }
        if artifact_dir.is_some() {
            self.artifact_dir = artifact_dir;
        }

        if let Some(filename) = filename {
            self.filename = filename;
        }
        if let Some(markdown_filename) = markdown_filename {
            self.markdown_filename = markdown_filename;
        }
        if let Some(artifact_name) = artifact_name {
            self.artifact_name = artifact_name;
        }

        self.badge = badge.unwrap_or(self.badge);
        self.overall_coverage_fail_threshold =
            overall_coverage_fail_threshold.unwrap_or(self.overall_coverage_fail_threshold);
        self.file_coverage_error_min = file_coverage_error_min.unwrap_or(self.file_coverage_error_min);
        self.file_coverage_warning_max =
            file_coverage_warning_max.unwrap_or(self.file_coverage_warning_max);
        self.fail_on_negative_difference =
            fail_on_negative_difference.unwrap_or(self.fail_on_negative_difference);
        self.fail_on_negative_overall_difference = fail_on_negative_overall_difference
            .unwrap_or(self.fail_on_negative_overall_difference);
        self.report_overall_coverage = report_overall_coverage.unwrap_or(self.report_overall_coverage);
        self.report_package_coverage = report_package_coverage.unwrap_or(self.report_package_coverage);

        if let Some(names) = artifact_download_workflow_names {
            let names: Vec<String> = names
                .into_iter()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect();
            self.artifact_download_workflow_names = (!names.is_empty()).then_some(names);
        }

        self.validate()
    }

    /// Report path with environment variables and `~` expanded
    pub fn report_path(&self) -> Result<PathBuf> {
        expand_path(&self.filename)
    }

    pub fn base_path(&self) -> Result<Option<PathBuf>> {
        self.base_path.as_deref().map(expand_path).transpose()
    }

    pub fn artifact_dir(&self) -> Result<Option<PathBuf>> {
        self.artifact_dir.as_deref().map(expand_path).transpose()
    }

    pub fn coverage_format(&self) -> Result<Option<CoverageFormat>> {
        self.format.as_deref().map(str::parse).transpose()
    }

    pub fn markdown_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}.md", self.markdown_filename))
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.file_coverage_warning_max, self.file_coverage_error_min)
    }

    pub fn diff_policy(&self) -> DiffPolicy {
        DiffPolicy {
            fail_on_negative_difference: self.fail_on_negative_difference,
            fail_on_negative_overall_difference: self.fail_on_negative_overall_difference,
            overall_fail_threshold: self.overall_coverage_fail_threshold,
            thresholds: self.thresholds(),
        }
    }

    pub fn report_options(&self) -> ReportOptions {
        ReportOptions {
            badge: self.badge,
            overall: self.report_overall_coverage,
            files: self.report_package_coverage,
            overall_fail_threshold: self.overall_coverage_fail_threshold,
            thresholds: self.thresholds(),
        }
    }
}

fn expand_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .with_context(|| format!("Could not expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Settings given on the command line. Each flag also reads the matching
/// GitHub Actions input variable.
#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    /// GitHub token used to search and download artifacts
    #[arg(long, env = "INPUT_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Coverage report to read
    #[arg(long, env = "INPUT_FILENAME", global = true)]
    pub filename: Option<String>,

    /// Report format: lcov, cobertura or clover (detected when omitted)
    #[arg(long, env = "INPUT_FORMAT", global = true)]
    pub format: Option<String>,

    /// Root used to make report paths relative
    #[arg(long, env = "INPUT_BASE_PATH", global = true)]
    pub base_path: Option<String>,

    /// Include a coverage badge
    #[arg(long, env = "INPUT_BADGE", global = true)]
    pub badge: Option<bool>,

    /// Fail when overall coverage is below this percentage
    #[arg(long, env = "INPUT_OVERALL_COVERAGE_FAIL_THRESHOLD", global = true)]
    pub overall_coverage_fail_threshold: Option<f64>,

    /// Files below this percentage are errors
    #[arg(long, env = "INPUT_FILE_COVERAGE_ERROR_MIN", global = true)]
    pub file_coverage_error_min: Option<f64>,

    /// Files below this percentage are warnings
    #[arg(long, env = "INPUT_FILE_COVERAGE_WARNING_MAX", global = true)]
    pub file_coverage_warning_max: Option<f64>,

    /// Fail when any file's coverage decreased
    #[arg(long, env = "INPUT_FAIL_ON_NEGATIVE_DIFFERENCE", global = true)]
    pub fail_on_negative_difference: Option<bool>,

    /// Fail when overall coverage decreased
    #[arg(long, env = "INPUT_FAIL_ON_NEGATIVE_OVERALL_DIFFERENCE", global = true)]
    pub fail_on_negative_overall_difference: Option<bool>,

    /// Report basename (".md" is appended)
    #[arg(long, env = "INPUT_MARKDOWN_FILENAME", global = true)]
    pub markdown_filename: Option<String>,

    /// Comma separated workflow names to search for the baseline artifact
    #[arg(long, env = "INPUT_ARTIFACT_DOWNLOAD_WORKFLOW_NAMES", value_delimiter = ',', global = true)]
    pub artifact_download_workflow_names: Option<Vec<String>>,

    /// Artifact name prefix
    #[arg(long, env = "INPUT_ARTIFACT_NAME", global = true)]
    pub artifact_name: Option<String>,

    /// Store baselines in a local directory instead of GitHub
    #[arg(long, env = "INPUT_ARTIFACT_DIR", global = true)]
    pub artifact_dir: Option<String>,

    /// Render the overall comparison block
    #[arg(long, env = "INPUT_REPORT_OVERALL_COVERAGE", global = true)]
    pub report_overall_coverage: Option<bool>,

    /// Render the per-file table
    #[arg(long, env = "INPUT_REPORT_PACKAGE_COVERAGE", global = true)]
    pub report_package_coverage: Option<bool>,
}
