//! Cobertura XML format parser

use anyhow::Result;
use quick_xml::events::Event;
use quick_xml::Reader;

use super::{xml_attribute, ParsedFile, ParsedReport};

/// Parse Cobertura XML content from a string
pub fn parse_cobertura_string(content: &str) -> Result<ParsedReport> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut report = ParsedReport::default();

    let mut in_source = false;
    // <methods> repeat the class lines; only class-level lines are counted
    let mut methods_depth = 0u32;

    let mut current_file: Option<String> = None;
    let mut file_lines_covered = 0u32;
    let mut file_lines_total = 0u32;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"coverage" => {
                    report.aggregate = line_rate(e);
                }
                b"source" => in_source = true,
                b"methods" => methods_depth += 1,
                b"class" => {
                    if let Some(filename) = xml_attribute(e, b"filename").filter(|f| !f.is_empty()) {
                        current_file = Some(filename);
                        file_lines_covered = 0;
                        file_lines_total = 0;
                    }
                }
                b"line" => {
                    if current_file.is_some() && methods_depth == 0 {
                        file_lines_total += 1;
                        if line_hit(e) {
                            file_lines_covered += 1;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"coverage" => {
                    report.aggregate = line_rate(e);
                }
                b"class" => {
                    // A class without lines still shows up in the report
                    if let Some(filename) = xml_attribute(e, b"filename").filter(|f| !f.is_empty()) {
                        report.files.push(ParsedFile {
                            path: filename,
                            lines_covered: 0,
                            lines_total: 0,
                        });
                    }
                }
                b"line" => {
                    if current_file.is_some() && methods_depth == 0 {
                        file_lines_total += 1;
                        if line_hit(e) {
                            file_lines_covered += 1;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                if in_source && report.source_root.is_none() {
                    let text = e.unescape()?.trim().to_string();
                    if !text.is_empty() {
                        report.source_root = Some(text);
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"source" => in_source = false,
                b"methods" => methods_depth = methods_depth.saturating_sub(1),
                b"class" => {
                    if let Some(file_path) = current_file.take() {
                        report.files.push(ParsedFile {
                            path: file_path,
                            lines_covered: file_lines_covered,
                            lines_total: file_lines_total,
                        });
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("Error parsing Cobertura XML: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(report)
}

fn line_rate(e: &quick_xml::events::BytesStart<'_>) -> Option<f64> {
    xml_attribute(e, b"line-rate")
        .and_then(|rate| rate.parse::<f64>().ok())
        .filter(|rate| rate.is_finite())
        .map(|rate| rate * 100.0)
}

fn line_hit(e: &quick_xml::events::BytesStart<'_>) -> bool {
    xml_attribute(e, b"hits")
        .and_then(|hits| hits.parse::<u64>().ok())
        .map(|hits| hits > 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cobertura() {
        let xml = r#"<?xml version="1.0"?>
<coverage line-rate="0.8" branch-rate="0.5" lines-covered="80" lines-valid="100">
    <sources>
        <source>/home/runner/work/app</source>
    </sources>
    <packages>
        <package name="src">
            <classes>
                <class name="main" filename="src/main.rs" line-rate="0.75" branch-rate="0.5">
                    <methods>
                        <method name="main" signature="">
                            <lines>
                                <line number="1" hits="1"/>
                            </lines>
                        </method>
                    </methods>
                    <lines>
                        <line number="1" hits="1"/>
                        <line number="2" hits="1"/>
                        <line number="3" hits="0"/>
                        <line number="4" hits="1"/>
                    </lines>
                </class>
                <class name="empty" filename="src/empty.rs" line-rate="1"/>
            </classes>
        </package>
    </packages>
</coverage>"#;

        let report = parse_cobertura_string(xml).unwrap();

        assert!((report.aggregate.unwrap() - 80.0).abs() < 0.01);
        assert_eq!(report.source_root.as_deref(), Some("/home/runner/work/app"));
        assert_eq!(
            report.files,
            vec![
                ParsedFile {
                    path: "src/main.rs".to_string(),
                    lines_covered: 3,
                    lines_total: 4,
                },
                ParsedFile {
                    path: "src/empty.rs".to_string(),
                    lines_covered: 0,
                    lines_total: 0,
                },
            ]
        );
    }

    #[test]
    fn test_classes_sharing_a_file_stay_separate_records() {
        let xml = r#"<coverage line-rate="0.5">
  <packages><package name="p"><classes>
    <class name="A" filename="lib/a.py"><lines><line number="1" hits="1"/></lines></class>
    <class name="B" filename="lib/a.py"><lines><line number="9" hits="0"/></lines></class>
  </classes></package></packages>
</coverage>"#;

        let report = parse_cobertura_string(xml).unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.rollup_percentage(), 50.0);
    }

    #[test]
    fn test_non_finite_line_rate_is_ignored() {
        for rate in ["NaN", "inf", "-inf"] {
            let xml = format!(
                r#"<coverage line-rate="{}"><packages><package><classes>
<class filename="a.py"><lines><line number="1" hits="0"/></lines></class>
</classes></package></packages></coverage>"#,
                rate
            );
            let report = parse_cobertura_string(&xml).unwrap();
            assert_eq!(report.aggregate, None);
            assert_eq!(report.files[0].lines_total, 1);
        }
    }

    #[test]
    fn test_malformed_xml_is_an_error() {
        assert!(parse_cobertura_string("<coverage><class></coverage>").is_err());
    }
}
