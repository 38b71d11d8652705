//! Coverage module
//!
//! Provides:
//! - LCOV, Cobertura XML and Clover XML parsing
//! - Normalized snapshots keyed by file identity
//! - Threshold classification
//! - Head/base comparison

mod clover;
mod cobertura;
mod diff;
mod lcov;
mod threshold;

pub use clover::*;
pub use cobertura::*;
pub use diff::*;
pub use lcov::*;
pub use threshold::*;

use anyhow::Result;
use chrono::Utc;
use quick_xml::events::BytesStart;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Report as read from disk, before paths are normalized
#[derive(Debug, Clone, Default)]
pub struct ParsedReport {
    /// Root directory the report declares for its sources, if any
    pub source_root: Option<String>,
    /// Overall percentage from the report's own aggregate node
    pub aggregate: Option<f64>,
    pub files: Vec<ParsedFile>,
}

impl ParsedReport {
    /// Weighted roll-up of per-file line counts
    pub fn rollup_percentage(&self) -> f64 {
        let covered: u64 = self.files.iter().map(|f| f.lines_covered as u64).sum();
        let total: u64 = self.files.iter().map(|f| f.lines_total as u64).sum();
        percentage(covered, total)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub path: String,
    pub lines_covered: u32,
    pub lines_total: u32,
}

/// Supported report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageFormat {
    Lcov,
    Cobertura,
    Clover,
}

impl CoverageFormat {
    /// Sniff the format from report content, using the extension as a tie breaker
    pub fn detect(path: &Path, content: &str) -> Option<Self> {
        let head: String = content.chars().take(4096).collect();

        if head.contains("<coverage") {
            if head.contains("clover=") || head.contains("<project") {
                return Some(Self::Clover);
            }
            if head.contains("line-rate") || head.contains("<sources") {
                return Some(Self::Cobertura);
            }
        }

        let lcov_markers = head
            .lines()
            .map(str::trim_start)
            .any(|l| l.starts_with("SF:") || l.starts_with("TN:"));
        if lcov_markers {
            return Some(Self::Lcov);
        }

        match path.extension().and_then(|e| e.to_str()) {
            Some("info") | Some("lcov") => Some(Self::Lcov),
            _ => None,
        }
    }

    pub fn parse(&self, content: &str) -> Result<ParsedReport> {
        match self {
            Self::Lcov => parse_lcov_string(content),
            Self::Cobertura => parse_cobertura_string(content),
            Self::Clover => parse_clover_string(content),
        }
    }
}

impl FromStr for CoverageFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lcov" => Ok(Self::Lcov),
            "cobertura" => Ok(Self::Cobertura),
            "clover" => Ok(Self::Clover),
            _ => anyhow::bail!(
                "Unknown coverage format: {}. Supported: lcov, cobertura, clover",
                s
            ),
        }
    }
}

impl fmt::Display for CoverageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lcov => "lcov",
            Self::Cobertura => "cobertura",
            Self::Clover => "clover",
        };
        f.write_str(name)
    }
}

/// Coverage data for a single file
#[derive(Debug, Clone, PartialEq)]
pub struct FileCoverage {
    /// Identity key, the join key between two snapshots
    pub key: String,
    pub relative_path: String,
    pub absolute_path: String,
    pub lines_covered: u32,
    pub lines_total: u32,
    pub coverage: f64,
}

/// File coverage entries keyed by identity, iterated in insertion order
#[derive(Debug, Clone, Default)]
pub struct FileCoverageMap {
    entries: Vec<FileCoverage>,
    index: HashMap<String, usize>,
}

impl FileCoverageMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file. A repeated key keeps its first position and merges the line counts.
    pub fn insert(&mut self, file: FileCoverage) {
        match self.index.get(&file.key) {
            Some(&pos) => {
                let existing = &mut self.entries[pos];
                existing.lines_covered += file.lines_covered;
                existing.lines_total += file.lines_total;
                existing.coverage = percentage(
                    existing.lines_covered as u64,
                    existing.lines_total as u64,
                );
            }
            None => {
                self.index.insert(file.key.clone(), self.entries.len());
                self.entries.push(file);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&FileCoverage> {
        self.index.get(key).map(|&pos| &self.entries[pos])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileCoverage> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<FileCoverage> for FileCoverageMap {
    fn from_iter<I: IntoIterator<Item = FileCoverage>>(iter: I) -> Self {
        let mut map = Self::new();
        for file in iter {
            map.insert(file);
        }
        map
    }
}

/// One coverage measurement, head or base
#[derive(Debug, Clone)]
pub struct CoverageSnapshot {
    pub overall: f64,
    /// Capture time, unix seconds
    pub timestamp: i64,
    pub base_path: String,
    pub files: FileCoverageMap,
}

/// Resolves a report file into a [`CoverageSnapshot`]
#[derive(Debug, Clone, Default)]
pub struct CoverageLoader {
    base_path: Option<PathBuf>,
    format: Option<CoverageFormat>,
}

impl CoverageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root used to make file paths relative. Takes precedence over the report's own source root.
    pub fn with_base_path(mut self, base_path: Option<PathBuf>) -> Self {
        self.base_path = base_path;
        self
    }

    /// Skip format detection
    pub fn with_format(mut self, format: Option<CoverageFormat>) -> Self {
        self.format = format;
        self
    }

    /// Load a report. Missing, unreadable or unparseable files yield `None`.
    pub fn load(&self, path: &Path) -> Option<CoverageSnapshot> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!("cannot read {}: {}", path.display(), e);
                return None;
            }
        };

        let Some(format) = self.format.or_else(|| CoverageFormat::detect(path, &content)) else {
            tracing::warn!("unrecognized coverage format: {}", path.display());
            return None;
        };

        match format.parse(&content) {
            Ok(parsed) => {
                tracing::debug!(
                    "parsed {} as {} ({} files)",
                    path.display(),
                    format,
                    parsed.files.len()
                );
                Some(self.build(parsed))
            }
            Err(e) => {
                tracing::warn!("failed to parse {} as {}: {:#}", path.display(), format, e);
                None
            }
        }
    }

    /// Normalize a parsed report into a snapshot stamped with the current time
    pub fn build(&self, parsed: ParsedReport) -> CoverageSnapshot {
        let base_path = self.resolve_base_path(&parsed);

        let files = parsed
            .files
            .iter()
            .map(|file| {
                let relative_path = relative_path(&file.path, &base_path);
                FileCoverage {
                    key: identity_key(&relative_path),
                    absolute_path: absolute_path(&file.path, &base_path),
                    lines_covered: file.lines_covered,
                    lines_total: file.lines_total,
                    coverage: percentage(file.lines_covered as u64, file.lines_total as u64),
                    relative_path,
                }
            })
            .collect();

        let overall = parsed
            .aggregate
            .filter(|aggregate| aggregate.is_finite())
            .unwrap_or_else(|| parsed.rollup_percentage())
            .clamp(0.0, 100.0);

        CoverageSnapshot {
            overall,
            timestamp: Utc::now().timestamp(),
            base_path,
            files,
        }
    }

    fn resolve_base_path(&self, parsed: &ParsedReport) -> String {
        if let Some(ref base) = self.base_path {
            return trim_trailing_slash(&normalize_separators(&base.to_string_lossy()));
        }
        if let Some(ref root) = parsed.source_root {
            let root = trim_trailing_slash(&normalize_separators(root));
            if !root.is_empty() {
                return root;
            }
        }
        common_directory(parsed.files.iter().map(|f| f.path.as_str()))
    }
}

/// Stable identity of a file: hex SHA-256 of its normalized relative path
pub fn identity_key(relative_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Make `path` relative to `base_path`
pub fn relative_path(path: &str, base_path: &str) -> String {
    let path = normalize_separators(path);
    let stripped = if base_path.is_empty() {
        path.as_str()
    } else {
        path.strip_prefix(base_path)
            .filter(|rest| rest.is_empty() || rest.starts_with('/'))
            .unwrap_or(&path)
    };

    let mut rel = stripped;
    loop {
        if let Some(rest) = rel.strip_prefix("./") {
            rel = rest;
        } else if let Some(rest) = rel.strip_prefix('/') {
            rel = rest;
        } else {
            break;
        }
    }
    rel.to_string()
}

fn absolute_path(path: &str, base_path: &str) -> String {
    let path = normalize_separators(path);
    if is_absolute(&path) || base_path.is_empty() {
        path
    } else {
        format!("{}/{}", base_path, path.trim_start_matches("./"))
    }
}

/// Longest directory prefix shared by every absolute path; empty when there is none
fn common_directory<'a>(paths: impl Iterator<Item = &'a str>) -> String {
    let mut common: Option<Vec<String>> = None;

    for path in paths {
        let path = normalize_separators(path);
        if !is_absolute(&path) {
            return String::new();
        }
        let mut dirs: Vec<String> = path.split('/').map(str::to_string).collect();
        dirs.pop();

        common = Some(match common {
            None => dirs,
            Some(prev) => prev
                .into_iter()
                .zip(dirs)
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a)
                .collect(),
        });
    }

    common.map(|dirs| dirs.join("/")).unwrap_or_default()
}

fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/') || (bytes.len() > 1 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic())
}

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

fn trim_trailing_slash(path: &str) -> String {
    if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path.to_string()
    }
}

/// Unescaped value of an XML attribute
fn xml_attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .filter_map(|a| a.ok())
        .find(|a| a.key.as_ref() == name)
        .map(|a| {
            a.unescape_value()
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| String::from_utf8_lossy(&a.value).to_string())
        })
}

fn percentage(covered: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (covered as f64 / total as f64) * 100.0
}
