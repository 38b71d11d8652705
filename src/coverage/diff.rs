//! Head/base coverage comparison

use colored::Colorize;
use std::fmt;

use super::threshold::{format_delta, format_number, round2, Thresholds, Tier};
use super::CoverageSnapshot;

/// Which comparisons fail the run
#[derive(Debug, Clone, Default)]
pub struct DiffPolicy {
    pub fail_on_negative_difference: bool,
    pub fail_on_negative_overall_difference: bool,
    /// Absolute minimum for the head overall percentage
    pub overall_fail_threshold: f64,
    /// Per-file tier boundaries
    pub thresholds: Thresholds,
}

/// One row of the comparison, in head order
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub key: String,
    pub relative_path: String,
    pub head: f64,
    /// `None` when the file is new or there is no baseline
    pub base: Option<f64>,
    pub delta: Option<f64>,
    pub head_tier: Tier,
    pub base_tier: Tier,
    /// Differences are classified with the default ceilings
    pub delta_tier: Tier,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverallDiff {
    pub head: f64,
    pub base: Option<f64>,
    /// `head - base` rounded to 2 decimals; regressions are judged on the rounded value
    pub delta: Option<f64>,
}

/// A failure condition found while comparing. Collected, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    FileRegression { path: String, delta: f64 },
    OverallRegression { delta: f64 },
    BelowThreshold { coverage: f64, minimum: f64 },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::FileRegression { path, delta } => write!(
                f,
                "Coverage of {} decreased by {}%",
                path,
                format_number(delta.abs())
            ),
            Failure::OverallRegression { delta } => write!(
                f,
                "Overall coverage decreased by {}%",
                format_number(delta.abs())
            ),
            Failure::BelowThreshold { coverage, minimum } => write!(
                f,
                "Overall coverage {}% is below the minimum of {}%",
                format_number(*coverage),
                format_number(*minimum)
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffResult {
    pub files: Vec<FileDiff>,
    pub overall: OverallDiff,
    pub failures: Vec<Failure>,
}

impl DiffResult {
    pub fn has_baseline(&self) -> bool {
        self.overall.base.is_some()
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn print_summary(&self) {
        println!("Coverage comparison:");

        let head = format!("{}%", format_number(self.overall.head));
        match (self.overall.base, self.overall.delta) {
            (Some(base), Some(delta)) => {
                let indicator = if delta > 0.0 {
                    "↑".green()
                } else if delta < 0.0 {
                    "↓".red()
                } else {
                    "→".dimmed()
                };

                let delta_str = if delta > 0.0 {
                    format!("{}%", format_delta(delta)).green()
                } else if delta < 0.0 {
                    format!("{}%", format_delta(delta)).red()
                } else {
                    "0%".dimmed()
                };

                println!(
                    "  {} Overall: {}% → {} ({})",
                    indicator,
                    format_number(base),
                    head,
                    delta_str
                );
            }
            _ => {
                println!("  {} Overall: {} {}", "•".cyan(), head, "(no baseline)".dimmed());
            }
        }

        for file in self.files.iter().filter(|f| f.delta.is_some_and(|d| d < 0.0)) {
            println!(
                "    {} {} {}",
                "↓".red(),
                file.relative_path,
                file.head_tier.paint(&format!("{}%", format_number(file.head)))
            );
        }

        for failure in &self.failures {
            println!("  {} {}", "✗".red(), failure);
        }
    }
}

/// Align `head` and `base` by file identity and apply the failure policies.
///
/// Every policy is evaluated; failures accumulate in the result.
pub fn compare_coverage(
    head: &CoverageSnapshot,
    base: Option<&CoverageSnapshot>,
    policy: &DiffPolicy,
) -> DiffResult {
    let defaults = Thresholds::default();
    let mut failures = Vec::new();

    let files: Vec<FileDiff> = head
        .files
        .iter()
        .map(|file| {
            let base_pct = base
                .and_then(|b| b.files.get(&file.key))
                .map(|b| b.coverage);
            let delta = base_pct.map(|b| round2(file.coverage - b));

            FileDiff {
                key: file.key.clone(),
                relative_path: file.relative_path.clone(),
                head: file.coverage,
                base: base_pct,
                delta,
                head_tier: policy.thresholds.classify(Some(file.coverage)),
                base_tier: policy.thresholds.classify(base_pct),
                delta_tier: defaults.classify(delta),
            }
        })
        .collect();

    if policy.fail_on_negative_difference {
        for file in &files {
            if let Some(delta) = file.delta.filter(|d| *d < 0.0) {
                failures.push(Failure::FileRegression {
                    path: file.relative_path.clone(),
                    delta,
                });
            }
        }
    }

    let overall = OverallDiff {
        head: head.overall,
        base: base.map(|b| b.overall),
        delta: base.map(|b| round2(head.overall - b.overall)),
    };

    if policy.fail_on_negative_overall_difference {
        if let Some(delta) = overall.delta.filter(|d| *d < 0.0) {
            failures.push(Failure::OverallRegression { delta });
        }
    }

    if head.overall < policy.overall_fail_threshold {
        failures.push(Failure::BelowThreshold {
            coverage: head.overall,
            minimum: policy.overall_fail_threshold,
        });
    }

    DiffResult {
        files,
        overall,
        failures,
    }
}
