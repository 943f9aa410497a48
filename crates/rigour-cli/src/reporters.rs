//! Report exporters and the writer that puts them on disk or stdout.
//!
//! Exporters are pure projections of a [`Report`]: they never mutate it and
//! render the same text for the same report.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use rigour_core::{Report, SceneReport};
use rigour_proto::{ExecutionStatus, JudgmentResult};
use thiserror::Error;

/// Where the most recent run is cached, relative to the working directory.
pub const LAST_REPORT_PATH: &str = ".rigour/last-report.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no previous report at {path}; run `rigour run` first")]
    NoLastReport { path: PathBuf },

    #[error(transparent)]
    Stdout(std::io::Error),
}

/// Report output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ReportFormat {
    /// JSON (machine-readable)
    #[default]
    Json,
    /// Markdown (agent-readable)
    Markdown,
    /// Standalone HTML page
    Html,
}

impl ReportFormat {
    pub fn render(self, report: &Report) -> Result<String, ReportError> {
        match self {
            ReportFormat::Json => JsonReporter.render(report),
            ReportFormat::Markdown => Ok(MarkdownReporter.render(report)),
            ReportFormat::Html => Ok(HtmlReporter.render(report)),
        }
    }
}

fn status_label(status: Option<ExecutionStatus>) -> &'static str {
    status.map_or("not run", ExecutionStatus::as_str)
}

fn status_icon(scene: &SceneReport) -> &'static str {
    match scene.status {
        Some(ExecutionStatus::Passed) => "✅",
        Some(ExecutionStatus::Skipped) => "⏭️",
        Some(ExecutionStatus::Failed) => "❌",
        Some(ExecutionStatus::Error) | None => "⚠️",
    }
}

pub struct JsonReporter;

impl JsonReporter {
    pub fn render(&self, report: &Report) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(report)?)
    }
}

pub struct MarkdownReporter;

impl MarkdownReporter {
    pub fn render(&self, report: &Report) -> String {
        let s = &report.summary;
        let mut md = String::new();

        md.push_str("# Rigour Test Report\n\n");
        let _ = writeln!(md, "**Run:** `{}`  ", report.id);
        let _ = writeln!(md, "**Date:** {}  ", report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(md, "**Mode:** {:?}\n", report.mode);

        md.push_str("## Summary\n\n");
        md.push_str("| Metric | Value |\n|--------|-------|\n");
        let _ = writeln!(md, "| Scenes | {} |", s.total);
        let _ = writeln!(md, "| Passed | {} |", s.passed);
        let _ = writeln!(md, "| Failed | {} |", s.failed);
        let _ = writeln!(md, "| Errored | {} |", s.errored);
        let _ = writeln!(md, "| Skipped | {} |", s.skipped);
        let _ = writeln!(md, "| Healed | {} |", s.healed);
        let _ = writeln!(md, "| Edge cases generated | {} |", s.edge_cases_generated);
        let _ = writeln!(md, "| Pass rate | {:.1}% |", s.pass_rate * 100.0);
        let _ = writeln!(md, "| Duration | {:.2}s |\n", s.duration_ms as f64 / 1000.0);

        md.push_str("## Scenes\n\n");
        md.push_str("| | Scene | State | Status | Judgments | Attempts | Duration |\n");
        md.push_str("|---|-------|-------|--------|-----------|----------|----------|\n");
        for scene in &report.scenes {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} | {}/{} | {} | {}ms |",
                status_icon(scene),
                scene.title.replace('|', "\\|"),
                scene.state,
                status_label(scene.status),
                scene.judgments_passed,
                scene.judgments_total,
                scene.attempts,
                scene.duration_ms
            );
        }

        if report.failures().next().is_some() {
            md.push_str("\n## Failures\n");
            for (scene, judgments) in scenes_with_judgments(report) {
                if !scene.is_failure() {
                    continue;
                }
                let _ = writeln!(md, "\n### {} (`{}`)\n", scene.title, scene.scene_id);
                if let (Some(phase), Some(error)) = (scene.error_phase, &scene.error) {
                    let _ = writeln!(md, "- **{phase} error:** {error}");
                }
                if let Some(strategy) = &scene.healing_strategy {
                    let _ = writeln!(md, "- **Healing strategy:** {strategy}");
                }
                if scene.flaky {
                    md.push_str("- **Flaky:** intermittent pass/fail history\n");
                }
                for judgment in judgments.iter().filter(|j| !j.passed) {
                    let _ = writeln!(
                        md,
                        "- Assertion {} ({}): {}",
                        judgment.assertion_index, judgment.assertion.assertion_type, judgment.reasoning
                    );
                }
            }
        }

        let healed: Vec<_> = report.scenes.iter().filter(|s| s.healed).collect();
        if !healed.is_empty() {
            md.push_str("\n## Healed\n\n");
            for scene in healed {
                let _ = writeln!(
                    md,
                    "- {} via `{}`",
                    scene.title,
                    scene.healing_strategy.as_deref().unwrap_or("unknown")
                );
            }
        }

        if !report.generated_scenes.is_empty() {
            md.push_str("\n## Generated edge cases\n\n");
            for child in &report.generated_scenes {
                let _ = writeln!(
                    md,
                    "- `{}` {} [{}]",
                    child.id(),
                    child.title(),
                    child.priority()
                );
            }
        }

        md
    }
}

/// Judgments are flattened in scene order; pair each scene with its slice.
fn scenes_with_judgments(report: &Report) -> Vec<(&SceneReport, &[JudgmentResult])> {
    let mut offset = 0;
    report
        .scenes
        .iter()
        .map(|scene| {
            let end = (offset + scene.judgments_total).min(report.judgments.len());
            let slice = report.judgments.get(offset..end).unwrap_or_default();
            offset = end;
            (scene, slice)
        })
        .collect()
}

pub struct HtmlReporter;

impl HtmlReporter {
    pub fn render(&self, report: &Report) -> String {
        let s = &report.summary;
        let mut rows = String::new();
        for scene in &report.scenes {
            let class = match scene.status {
                Some(ExecutionStatus::Passed) => "passed",
                Some(ExecutionStatus::Skipped) => "skipped",
                Some(ExecutionStatus::Failed) => "failed",
                Some(ExecutionStatus::Error) | None => "error",
            };
            let detail = scene
                .error
                .as_deref()
                .map(escape_html)
                .unwrap_or_default();
            let _ = writeln!(
                rows,
                "<tr class=\"{class}\"><td>{}</td><td>{}</td><td>{}</td><td>{}/{}</td><td>{}</td><td>{}</td><td>{}ms</td><td>{detail}</td></tr>",
                escape_html(&scene.title),
                scene.state,
                status_label(scene.status),
                scene.judgments_passed,
                scene.judgments_total,
                if scene.healed { "yes" } else { "" },
                scene.children.len(),
                scene.duration_ms,
            );
        }

        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Rigour Test Report</title>
<style>
body {{ font-family: system-ui, sans-serif; margin: 2rem; }}
table {{ border-collapse: collapse; width: 100%; }}
th, td {{ border: 1px solid #ddd; padding: 0.4rem 0.6rem; text-align: left; }}
tr.passed td:first-child {{ border-left: 4px solid #2e7d32; }}
tr.failed td:first-child {{ border-left: 4px solid #c62828; }}
tr.error td:first-child {{ border-left: 4px solid #ef6c00; }}
tr.skipped td:first-child {{ border-left: 4px solid #9e9e9e; }}
.summary span {{ margin-right: 1.5rem; }}
</style>
</head>
<body>
<h1>Rigour Test Report</h1>
<p>Run <code>{id}</code> at {timestamp}</p>
<div class="summary">
<span>Total: {total}</span><span>Passed: {passed}</span><span>Failed: {failed}</span><span>Errored: {errored}</span><span>Skipped: {skipped}</span><span>Healed: {healed}</span><span>Edge cases: {edges}</span><span>Pass rate: {rate:.1}%</span>
</div>
<table>
<thead><tr><th>Scene</th><th>State</th><th>Status</th><th>Judgments</th><th>Healed</th><th>Children</th><th>Duration</th><th>Error</th></tr></thead>
<tbody>
{rows}</tbody>
</table>
</body>
</html>
"#,
            id = escape_html(&report.id),
            timestamp = report.timestamp.to_rfc3339(),
            total = s.total,
            passed = s.passed,
            failed = s.failed,
            errored = s.errored,
            skipped = s.skipped,
            healed = s.healed,
            edges = s.edge_cases_generated,
            rate = s.pass_rate * 100.0,
        )
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Writes rendered reports to a file, or stdout when no path is set.
#[derive(Debug, Clone, Default)]
pub struct ReportWriter {
    output: Option<PathBuf>,
}

impl ReportWriter {
    pub fn new(output: Option<PathBuf>) -> Self {
        Self { output }
    }

    /// Returns the file written, if any.
    pub fn write(&self, report: &Report, format: ReportFormat) -> Result<Option<PathBuf>, ReportError> {
        let rendered = format.render(report)?;
        match &self.output {
            Some(path) => {
                write_file(path, &rendered)?;
                Ok(Some(path.clone()))
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout
                    .write_all(rendered.as_bytes())
                    .and_then(|()| {
                        if rendered.ends_with('\n') {
                            Ok(())
                        } else {
                            stdout.write_all(b"\n")
                        }
                    })
                    .and_then(|()| stdout.flush())
                    .map_err(ReportError::Stdout)?;
                Ok(None)
            }
        }
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), ReportError> {
    let err = |source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    std::fs::write(path, content).map_err(err)
}

/// Caches `report` under `root` for `rigour report --last`.
pub fn save_last(root: &Path, report: &Report) -> Result<PathBuf, ReportError> {
    let path = root.join(LAST_REPORT_PATH);
    write_file(&path, &JsonReporter.render(report)?)?;
    Ok(path)
}

pub fn load_last(root: &Path) -> Result<Report, ReportError> {
    let path = root.join(LAST_REPORT_PATH);
    let content = std::fs::read_to_string(&path)
        .map_err(|_| ReportError::NoLastReport { path: path.clone() })?;
    Ok(serde_json::from_str(&content)?)
}
