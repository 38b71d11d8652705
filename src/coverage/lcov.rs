//! LCOV format parser

use anyhow::Result;

use super::{ParsedFile, ParsedReport};

/// Parse LCOV content from a string.
///
/// LCOV has no aggregate record, so the overall percentage is left to the
/// loader's weighted roll-up. `LF`/`LH` totals are used when present,
/// otherwise the `DA` records of the file are counted.
pub fn parse_lcov_string(content: &str) -> Result<ParsedReport> {
    let mut files: Vec<ParsedFile> = Vec::new();

    let mut current_file: Option<String> = None;
    let mut file_lines_found: Option<u32> = None;
    let mut file_lines_hit: Option<u32> = None;
    let mut da_found = 0u32;
    let mut da_hit = 0u32;

    for line in content.lines() {
        let line = line.trim();

        if let Some(path) = line.strip_prefix("SF:") {
            current_file = Some(path.to_string());
            file_lines_found = None;
            file_lines_hit = None;
            da_found = 0;
            da_hit = 0;
        } else if let Some(count) = line.strip_prefix("LF:") {
            file_lines_found = count.parse::<u32>().ok();
        } else if let Some(count) = line.strip_prefix("LH:") {
            file_lines_hit = count.parse::<u32>().ok();
        } else if let Some(record) = line.strip_prefix("DA:") {
            // DA:<line>,<hits>[,<checksum>]
            let mut parts = record.split(',');
            if let Some(hits) = parts.nth(1) {
                da_found += 1;
                if hits.parse::<u64>().map(|h| h > 0).unwrap_or(false) {
                    da_hit += 1;
                }
            }
        } else if line == "end_of_record" {
            if let Some(file_path) = current_file.take() {
                let lines_total = file_lines_found.unwrap_or(da_found);
                let lines_covered = file_lines_hit.unwrap_or(da_hit).min(lines_total);

                files.push(ParsedFile {
                    path: file_path,
                    lines_covered,
                    lines_total,
                });
            }
        }
    }

    Ok(ParsedReport {
        source_root: None,
        aggregate: None,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lcov() {
        let lcov = r#"
TN:
SF:src/main.rs
FN:1,main
FNDA:1,main
FNF:1
FNH:1
DA:1,1
DA:2,1
DA:3,0
LF:3
LH:2
BRF:2
BRH:1
end_of_record
SF:src/lib.rs
DA:1,1
DA:2,1
LF:2
LH:2
end_of_record
"#;

        let report = parse_lcov_string(lcov).unwrap();

        assert_eq!(report.files.len(), 2);
        assert_eq!(report.files[0].path, "src/main.rs");
        assert_eq!(report.files[0].lines_total, 3);
        assert_eq!(report.files[0].lines_covered, 2);
        assert!(report.aggregate.is_none());

        // 4/5 = 80%
        assert!((report.rollup_percentage() - 80.0).abs() < 0.01);
    }

    #[test]
    fn test_counts_da_records_without_totals() {
        let lcov = "SF:/repo/a.rs\nDA:1,3\nDA:2,0\nDA:3,1,abc\nDA:4,0\nend_of_record\n";

        let report = parse_lcov_string(lcov).unwrap();
        assert_eq!(report.files[0].lines_total, 4);
        assert_eq!(report.files[0].lines_covered, 2);
    }

    #[test]
    fn test_empty_lcov() {
        let report = parse_lcov_string("").unwrap();
        assert_eq!(report.files.len(), 0);
        assert_eq!(report.rollup_percentage(), 0.0);
    }
}
