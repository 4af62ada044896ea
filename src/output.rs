//! Report rendering: human tree, JSON, YAML, Markdown, and the CSV
//! training export.

use crate::report::{ScanReport, Verdict};
use crate::tokens::TokenProjector;
use clap::ValueEnum;
use colored::Colorize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tree with colors.
    Tree,
    Json,
    Yaml,
    Markdown,
    /// Training export: one row per scan object.
    Csv,
}

pub fn render(report: &ScanReport, format: OutputFormat, projector: &TokenProjector) -> String {
    match format {
        OutputFormat::Tree => render_tree(report, projector),
        OutputFormat::Json => {
            serde_json::to_string_pretty(&report_data(report, projector)).unwrap_or_default()
        }
        OutputFormat::Yaml => {
            serde_yaml::to_string(&report_data(report, projector)).unwrap_or_default()
        }
        OutputFormat::Markdown => render_markdown(report, projector),
        OutputFormat::Csv => render_csv(report, projector),
    }
}

/// Shared schema for the structured formats.
fn report_data(report: &ScanReport, projector: &TokenProjector) -> serde_json::Value {
    let details: Vec<serde_json::Value> = report
        .malicious_objects()
        .map(|object| {
            json!({
                "path": object.file_path().display().to_string(),
                "name": object.name(),
                "location": object.location().map(|(s, e)| vec![s, e]),
                "score": object.score,
                "tokens": object.token_string(projector),
                "hash": object.instruction_hash(),
                "subword_tokens": object.subword_count(projector),
                "code": object.source_excerpt(),
            })
        })
        .collect();

    json!({
        "version": report.version,
        "input": report.input,
        "start": report.start,
        "duration_seconds": report.duration_seconds,
        "verdict": report.verdict,
        "confidence": report.confidence,
        "threshold": report.threshold,
        "statistics": {
            "total_files": report.all_files.len(),
            "skipped_files": report.skipped_files.len(),
            "processed_files": report.processed_files,
            "processed_objects": report.objects.len(),
            "malicious_objects": report.malicious.len(),
            "warnings": report.warning_count(),
        },
        "activities": report.activities.iter()
            .map(|a| a.replace('_', " "))
            .collect::<Vec<_>>(),
        "files": report.all_files.iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
        "skipped_files": report.skipped_files.iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>(),
        "warnings": report.file_warnings,
        "details": details,
    })
}

fn extensions_of(paths: &[PathBuf]) -> String {
    let mut extensions: Vec<String> = paths
        .iter()
        .filter_map(|p| p.extension())
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .collect();
    extensions.sort();
    extensions.dedup();
    if extensions.is_empty() {
        String::new()
    } else {
        format!(" ({})", extensions.join(", "))
    }
}

fn render_tree(report: &ScanReport, projector: &TokenProjector) -> String {
    let mut out = String::new();
    let processed: Vec<PathBuf> = report
        .all_files
        .iter()
        .filter(|f| !report.skipped_files.contains(f))
        .cloned()
        .collect();

    out.push_str(&format!("- target: {}\n", report.input));
    out.push_str(&format!("- seconds: {:.2}\n", report.duration_seconds));
    out.push_str(&format!("- files: {}\n", report.all_files.len()));
    out.push_str(&format!(
        "  ├── scanned: {}{}\n",
        processed.len(),
        extensions_of(&processed)
    ));

    if report.malicious.is_empty() {
        out.push_str(&format!(
            "  └── skipped: {}{}\n",
            report.skipped_files.len(),
            extensions_of(&report.skipped_files)
        ));
    } else {
        out.push_str(&format!(
            "  ├── skipped: {}{}\n",
            report.skipped_files.len(),
            extensions_of(&report.skipped_files)
        ));
        out.push_str("  └── suspicious:\n");

        let mut by_file: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for &index in &report.malicious {
            let path = report.objects[index].file_path().display().to_string();
            by_file.entry(path).or_default().push(index);
        }

        let file_count = by_file.len();
        for (file_position, (path, indices)) in by_file.iter().enumerate() {
            let last_file = file_position == file_count - 1;
            let (file_branch, file_indent) = if last_file {
                ("      └── ", "          ")
            } else {
                ("      ├── ", "      │   ")
            };
            out.push_str(&format!("{file_branch}{path}\n"));

            for (object_position, &index) in indices.iter().enumerate() {
                let object = &report.objects[index];
                let last_object = object_position == indices.len() - 1;
                let (object_branch, object_indent) = if last_object {
                    ("└── ", "    ")
                } else {
                    ("├── ", "│   ")
                };
                out.push_str(&format!("{file_indent}{object_branch}{}\n", object.name()));

                let activities: Vec<String> = object
                    .tokens(projector)
                    .iter()
                    .filter(|t| report.activities.contains(t))
                    .map(|t| t.replace('_', " "))
                    .collect::<std::collections::BTreeSet<_>>()
                    .into_iter()
                    .collect();
                for (activity_position, activity) in activities.iter().enumerate() {
                    let activity_branch = if activity_position == activities.len() - 1 {
                        "└── "
                    } else {
                        "├── "
                    };
                    out.push_str(&format!(
                        "{file_indent}{object_indent}{activity_branch}{activity}\n"
                    ));
                }
            }
        }
    }

    out.push('\n');
    let verdict_line = match report.verdict {
        Verdict::Malicious => {
            format!("=> {} {:.2}", "malicious".red().bold(), report.confidence)
        }
        Verdict::Clean => format!("=> {}", "clean".green().bold()),
        Verdict::Inconclusive => {
            format!("=> {} (no classifier available)", "inconclusive".yellow().bold())
        }
    };
    out.push_str(&verdict_line);
    out.push('\n');

    if report.warning_count() > 0 {
        out.push_str(&format!("   {} warnings recorded\n", report.warning_count()));
    }
    out
}

fn render_markdown(report: &ScanReport, projector: &TokenProjector) -> String {
    let mut out = String::new();
    out.push_str("# Scan Report\n\n");
    out.push_str(&format!("*Generated by verdict {}*\n\n", report.version));
    out.push_str(&format!("**Target:** `{}`\n\n", report.input));
    out.push_str("## Summary\n\n");
    match report.verdict {
        Verdict::Malicious => out.push_str(&format!(
            "> **Malicious**: `{:.2}`\n\n",
            report.confidence
        )),
        Verdict::Clean => out.push_str(&format!("> **Clean**: `{:.2}`\n\n", report.confidence)),
        Verdict::Inconclusive => out.push_str("> **Inconclusive**: classifier unavailable\n\n"),
    }
    out.push_str(&format!("- Files: {}\n", report.all_files.len()));
    out.push_str(&format!("- Skipped: {}\n", report.skipped_files.len()));
    out.push_str(&format!("- Processed objects: {}\n", report.objects.len()));
    out.push_str(&format!("- Malicious objects: {}\n", report.malicious.len()));
    out.push_str(&format!("- Warnings: {}\n\n", report.warning_count()));

    if !report.activities.is_empty() {
        out.push_str("## Activities\n\n");
        for activity in &report.activities {
            out.push_str(&format!("- {}\n", activity.replace('_', " ")));
        }
        out.push('\n');
    }

    for object in report.malicious_objects() {
        out.push_str(&format!("## {}\n\n", object.file_path().display()));
        out.push_str(&format!("- Object: `{}`\n", object.name()));
        if let Some(score) = object.score {
            out.push_str(&format!("- Score: `{score:.2}`\n"));
        }
        if let Some((start, end)) = object.location() {
            out.push_str(&format!("- Lines: {start}-{end}\n"));
        }
        out.push('\n');
        if let Some(code) = object.source_excerpt() {
            out.push_str("### Code\n\n");
            out.push_str(&format!("```\n{code}\n```\n\n"));
        }
        out.push_str("### Tokens\n\n");
        out.push_str(&format!("```\n{}\n```\n\n", object.token_string(projector)));
    }
    out
}

/// Training export rows:
/// `<file-hash>,<language>,<object-name>,<token-sequence>,<instruction-hash>,<label>`.
/// The label column is left empty; labeling happens downstream.
fn render_csv(report: &ScanReport, projector: &TokenProjector) -> String {
    let mut out = String::from("file_hash,language,object_name,tokens,instruction_hash,label\n");
    for object in &report.objects {
        out.push_str(&format!(
            "{},{},{},{},{},\n",
            object.file_sha256(),
            object.language(),
            csv_field(object.name()),
            csv_field(object.token_string(projector)),
            object.instruction_hash(),
        ));
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScanConfig;
    use crate::mappings::CategoryMapper;
    use crate::scanner::scan_path;
    use std::fs;
    use tempfile::TempDir;

    fn sample_report() -> (ScanReport, CategoryMapper) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.py"), "x = 5\n").unwrap();
        fs::write(dir.path().join("skip.txt"), "nothing\n").unwrap();
        let mapper = CategoryMapper::load().unwrap();
        let report = scan_path(dir.path(), &ScanConfig::default(), &mapper, None).unwrap();
        (report, mapper)
    }

    #[test]
    fn json_and_yaml_share_the_schema() {
        let (report, mapper) = sample_report();
        let projector = TokenProjector::new(&mapper, 15);
        let json_text = render(&report, OutputFormat::Json, &projector);
        let yaml_text = render(&report, OutputFormat::Yaml, &projector);

        let from_json: serde_json::Value = serde_json::from_str(&json_text).unwrap();
        let from_yaml: serde_json::Value = serde_yaml::from_str(&yaml_text).unwrap();
        assert_eq!(from_json, from_yaml);
        assert_eq!(from_json["verdict"], "inconclusive");
        assert_eq!(from_json["statistics"]["skipped_files"], 1);
    }

    #[test]
    fn tree_output_lists_counts_and_verdict() {
        let (report, mapper) = sample_report();
        let projector = TokenProjector::new(&mapper, 15);
        let tree = render(&report, OutputFormat::Tree, &projector);
        assert!(tree.contains("files: 2"));
        assert!(tree.contains("scanned: 1 (.py)"));
        assert!(tree.contains("skipped: 1 (.txt)"));
        assert!(tree.contains("inconclusive"));
    }

    #[test]
    fn csv_rows_cover_every_object() {
        let (report, mapper) = sample_report();
        let projector = TokenProjector::new(&mapper, 15);
        let csv = render(&report, OutputFormat::Csv, &projector);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 1 + report.objects.len());
        assert!(lines[0].starts_with("file_hash,language,object_name"));
        assert!(lines[1].contains("python"));
        assert!(lines[1].contains("<module>"));
    }

    #[test]
    fn csv_quotes_fields_with_commas() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn markdown_includes_summary_counts() {
        let (report, mapper) = sample_report();
        let projector = TokenProjector::new(&mapper, 15);
        let markdown = render(&report, OutputFormat::Markdown, &projector);
        assert!(markdown.contains("# Scan Report"));
        assert!(markdown.contains("- Files: 2"));
        assert!(markdown.contains("Inconclusive"));
    }
}
