//! Clover XML format parser

use anyhow::Result;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{xml_attribute, ParsedFile, ParsedReport};

/// Parse Clover XML content from a string.
///
/// Per-file counts come from the `<metrics>` child of each `<file>`, the
/// aggregate from the `<metrics>` child of `<project>`. Statements are the
/// counted unit.
pub fn parse_clover_string(content: &str) -> Result<ParsedReport> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut report = ParsedReport::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();

    let mut current_file: Option<ParsedFile> = None;

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                handle_element(e, stack.last().map(Vec::as_slice), &mut report, &mut current_file);
                stack.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Empty(ref e)) => {
                handle_element(e, stack.last().map(Vec::as_slice), &mut report, &mut current_file);
                if e.name().as_ref() == b"file" {
                    if let Some(file) = current_file.take() {
                        report.files.push(file);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                stack.pop();
                if e.name().as_ref() == b"file" {
                    if let Some(file) = current_file.take() {
                        report.files.push(file);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("Error parsing Clover XML: {}", e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(report)
}

fn handle_element(
    e: &BytesStart<'_>,
    parent: Option<&[u8]>,
    report: &mut ParsedReport,
    current_file: &mut Option<ParsedFile>,
) {
    match e.name().as_ref() {
        b"file" => {
            // PHPUnit writes the absolute path to `name`, OpenClover to `path`
            let path = xml_attribute(e, b"path")
                .or_else(|| xml_attribute(e, b"name"))
                .filter(|p| !p.is_empty());
            *current_file = path.map(|path| ParsedFile {
                path,
                lines_covered: 0,
                lines_total: 0,
            });
        }
        b"metrics" => {
            let (covered, total) = statement_counts(e);
            match parent {
                Some(b"file") => {
                    if let Some(file) = current_file.as_mut() {
                        file.lines_covered = covered.min(total);
                        file.lines_total = total;
                    }
                }
                Some(b"project") => {
                    if total > 0 {
                        report.aggregate = Some(covered as f64 / total as f64 * 100.0);
                    }
                }
                _ => {}
            }
        }
        _ => {}
    }
}

fn statement_counts(e: &BytesStart<'_>) -> (u32, u32) {
    let count = |name: &[u8]| {
        xml_attribute(e, name)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0)
    };
    (count(b"coveredstatements"), count(b"statements"))
}
