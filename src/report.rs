//! Markdown coverage report

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::coverage::{
    format_delta, format_number, CoverageSnapshot, DiffResult, FileDiff, Thresholds, Tier,
};

const SHIELDS_BADGE_URL: &str = "https://img.shields.io/badge";

/// Builds badge image URLs
pub trait BadgeUrlBuilder {
    fn badge_url(&self, label: &str, value: &str, color: &str) -> String;
}

/// Static badges from shields.io
#[derive(Debug, Clone)]
pub struct ShieldsBadge {
    base_url: String,
}

impl Default for ShieldsBadge {
    fn default() -> Self {
        Self {
            base_url: SHIELDS_BADGE_URL.to_string(),
        }
    }
}

impl ShieldsBadge {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl BadgeUrlBuilder for ShieldsBadge {
    fn badge_url(&self, label: &str, value: &str, color: &str) -> String {
        format!(
            "{}/{}-{}-{}",
            self.base_url.trim_end_matches('/'),
            escape_badge_segment(label),
            escape_badge_segment(value),
            escape_badge_segment(color)
        )
    }
}

/// shields.io path escaping: dashes and underscores are doubled
fn escape_badge_segment(segment: &str) -> String {
    segment
        .replace('%', "%25")
        .replace('-', "--")
        .replace('_', "__")
        .replace(' ', "%20")
}

/// Which sections to render
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub badge: bool,
    pub overall: bool,
    pub files: bool,
    pub overall_fail_threshold: f64,
    pub thresholds: Thresholds,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            badge: true,
            overall: true,
            files: true,
            overall_fail_threshold: 0.0,
            thresholds: Thresholds::default(),
        }
    }
}

/// The rendered document and the values surfaced to the caller
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub markdown: String,
    pub overall_coverage: f64,
}

impl RenderedReport {
    /// Write the markdown to `output_path`
    pub fn write(&self, output_path: &Path) -> Result<()> {
        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Could not create {}", parent.display()))?;
        }
        fs::write(output_path, &self.markdown)
            .with_context(|| format!("Could not write report to {}", output_path.display()))
    }
}

/// Render the report. Section order: heading, badge, overall block, file table, footnote.
pub fn render_report(
    head: &CoverageSnapshot,
    base: Option<&CoverageSnapshot>,
    diff: &DiffResult,
    options: &ReportOptions,
    badges: &dyn BadgeUrlBuilder,
) -> RenderedReport {
    let mut sections: Vec<String> = vec!["## Coverage Report".to_string()];

    if options.badge {
        let tier = options.thresholds.classify(Some(head.overall));
        sections.push(badge("Coverage", &percent(head.overall), tier, badges));
    }

    if options.overall {
        sections.push(build_overall(head, base, diff, options, badges));
    }

    if options.files {
        sections.push(build_file_table(diff));
    }

    sections.push(format!(
        "_Minimum allowed coverage is `{}%`, this run produced `{}%`_",
        format_number(options.overall_fail_threshold),
        format_number(head.overall)
    ));

    let mut markdown = sections.join("\n\n");
    markdown.push('\n');

    RenderedReport {
        markdown,
        overall_coverage: head.overall,
    }
}

fn build_overall(
    head: &CoverageSnapshot,
    base: Option<&CoverageSnapshot>,
    diff: &DiffResult,
    options: &ReportOptions,
    badges: &dyn BadgeUrlBuilder,
) -> String {
    let thresholds = &options.thresholds;
    let head_badge = badge(
        "New Coverage",
        &percent(head.overall),
        thresholds.classify(Some(head.overall)),
        badges,
    );

    match (base, diff.overall.delta) {
        (Some(base), Some(delta)) => {
            let base_badge = badge(
                "Base Coverage",
                &percent(base.overall),
                thresholds.classify(Some(base.overall)),
                badges,
            );
            // a difference is not a coverage percentage: default ceilings
            let delta_badge = badge(
                "Difference",
                &format!("{}%", format_delta(delta)),
                Thresholds::default().classify(Some(delta)),
                badges,
            );
            format!(
                "### Overall\n\n\
                 | Base Coverage | New Coverage | Difference |\n\
                 | --- | --- | --- |\n\
                 | {} | {} | {} |",
                base_badge, head_badge, delta_badge
            )
        }
        _ => format!("### Overall\n\n| Coverage |\n| --- |\n| {} |", head_badge),
    }
}

fn build_file_table(diff: &DiffResult) -> String {
    let with_baseline = diff.has_baseline();

    let mut lines = vec!["### Files".to_string(), String::new()];
    if with_baseline {
        lines.push("| Package | Base Coverage | New Coverage | Difference |".to_string());
        lines.push("| --- | --- | --- | --- |".to_string());
    } else {
        lines.push("| Package | Coverage |".to_string());
        lines.push("| --- | --- |".to_string());
    }

    for file in &diff.files {
        lines.push(build_file_row(file, with_baseline));
    }

    lines.join("\n")
}

fn build_file_row(file: &FileDiff, with_baseline: bool) -> String {
    let package = escape_cell(&file.relative_path);
    let head = cell(file.head_tier, &percent(file.head));

    if !with_baseline {
        return format!("| {} | {} |", package, head);
    }

    let base = file
        .base
        .map(|b| cell(file.base_tier, &percent(b)))
        .unwrap_or_default();
    let delta = file
        .delta
        .map(|d| cell(file.delta_tier, &format!("{}%", format_delta(d))))
        .unwrap_or_default();

    format!("| {} | {} | {} | {} |", package, base, head, delta)
}

fn badge(label: &str, value: &str, tier: Tier, badges: &dyn BadgeUrlBuilder) -> String {
    format!("![{}]({})", label, badges.badge_url(label, value, tier.color()))
}

fn cell(tier: Tier, value: &str) -> String {
    format!("{} {}", tier.marker(), value)
}

fn percent(value: f64) -> String {
    format!("{}%", format_number(value))
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|")
}

/// Recover `(package, new coverage)` rows from a rendered per-file table
pub fn parse_file_table(markdown: &str) -> Vec<(String, f64)> {
    let mut rows = Vec::new();
    let mut lines = markdown
        .lines()
        .skip_while(|l| l.trim() != "### Files")
        .skip(1)
        .skip_while(|l| l.trim().is_empty());

    let Some(header) = lines.next() else {
        return rows;
    };
    let head_column = if split_row(header).len() == 4 { 2 } else { 1 };

    for line in lines.skip(1) {
        if !line.starts_with('|') {
            break;
        }
        let cells = split_row(line);
        let Some(value) = cells
            .get(head_column)
            .and_then(|c| c.split_whitespace().last())
            .and_then(|v| v.trim_end_matches('%').parse::<f64>().ok())
        else {
            continue;
        };
        rows.push((cells[0].replace("\\|", "|"), value));
    }

    rows
}

fn split_row(line: &str) -> Vec<String> {
    let inner = line.trim().trim_start_matches('|').trim_end_matches('|');
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push_str("\\|");
                chars.next();
            }
            '|' => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}
