//! Parser for test-runner output.
//!
//! Grammar:
//! - summary counts `N passed`, `N failed`, `N skipped`, `N error`/`N errors`,
//!   all read from one summary line: the last one carrying a duration
//!   (`in 0.12s`), else the last stdout line with any count, else the last
//!   stderr line. Capture lines never count.
//! - per-check lines `<id>::<name> PASSED|FAILED|SKIPPED|ERROR` (pytest `-v`)
//!   or lines starting with `✓` / `✗`
//! - captured outcomes `RIGOUR_CAPTURE <target> <json>`

use std::collections::BTreeMap;

use regex::Regex;
use rigour_proto::AssertionResult;
use serde_json::Value;

/// Line prefix an artifact prints to report an observed value.
pub const CAPTURE_PREFIX: &str = "RIGOUR_CAPTURE";

/// Prefix marking lines the runner wrote to stderr in combined output.
pub const STDERR_PREFIX: &str = "[stderr] ";

/// Counts and checks extracted from one run's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    pub passed: Option<u32>,
    pub failed: Option<u32>,
    pub skipped: Option<u32>,
    pub errors: Option<u32>,
    pub checks: Vec<AssertionResult>,
    pub captured: BTreeMap<String, Value>,
    /// First line mentioning `FAILED` or `ERROR`.
    pub first_failure: Option<String>,
}

impl ParsedOutput {
    /// A numeric summary was found.
    pub fn has_summary(&self) -> bool {
        self.passed.is_some()
            || self.failed.is_some()
            || self.skipped.is_some()
            || self.errors.is_some()
    }

    /// Counts derived from per-check lines, for runners that print no summary.
    pub fn counts_from_checks(&self) -> (u32, u32) {
        let passed = self.checks.iter().filter(|c| c.passed).count() as u32;
        (passed, self.checks.len() as u32 - passed)
    }
}

#[derive(Debug, Clone)]
pub struct OutputParser {
    summary: Regex,
    duration: Regex,
    check: Regex,
    glyph: Regex,
    capture: Regex,
}

impl OutputParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            summary: Regex::new(r"\b(\d+) (passed|failed|skipped|errors?)\b")?,
            duration: Regex::new(r"\bin \d+(?:\.\d+)?s\b")?,
            check: Regex::new(r"^(\S+::\S+)\s+(PASSED|FAILED|SKIPPED|ERROR|XFAIL|XPASS)\b")?,
            glyph: Regex::new(r"^\s*([✓✗])\s+(.+?)\s*$")?,
            capture: Regex::new(&format!(r"^\s*{CAPTURE_PREFIX}\s+(\S+)\s+(.+?)\s*$"))?,
        })
    }

    pub fn parse(&self, output: &str) -> ParsedOutput {
        let mut parsed = ParsedOutput::default();

        if let Some(line) = self.summary_line(output) {
            for caps in self.summary.captures_iter(line) {
                let Ok(n) = caps[1].parse::<u32>() else {
                    continue;
                };
                match &caps[2] {
                    "passed" => parsed.passed = Some(n),
                    "failed" => parsed.failed = Some(n),
                    "skipped" => parsed.skipped = Some(n),
                    _ => parsed.errors = Some(n),
                }
            }
        }

        for line in output.lines() {
            if parsed.first_failure.is_none()
                && (line.contains("FAILED") || line.contains("ERROR"))
                && !line.trim_start().starts_with(CAPTURE_PREFIX)
            {
                parsed.first_failure = Some(line.trim().to_string());
            }

            if let Some(caps) = self.capture.captures(line) {
                parsed
                    .captured
                    .insert(caps[1].to_string(), parse_capture_value(&caps[2]));
                continue;
            }

            if let Some(caps) = self.check.captures(line.trim_start()) {
                let outcome = &caps[2];
                if outcome != "SKIPPED" {
                    parsed.checks.push(AssertionResult {
                        name: caps[1].to_string(),
                        passed: matches!(outcome, "PASSED" | "XFAIL"),
                    });
                }
            } else if let Some(caps) = self.glyph.captures(line) {
                parsed.checks.push(AssertionResult {
                    name: caps[2].to_string(),
                    passed: &caps[1] == "✓",
                });
            }
        }

        parsed
    }

    fn summary_line<'a>(&self, output: &'a str) -> Option<&'a str> {
        let candidates: Vec<&str> = output
            .lines()
            .filter(|line| !line.trim_start().starts_with(CAPTURE_PREFIX))
            .filter(|line| self.summary.is_match(line))
            .collect();
        candidates
            .iter()
            .rev()
            .find(|line| self.duration.is_match(line))
            .or_else(|| {
                candidates
                    .iter()
                    .rev()
                    .find(|line| !line.starts_with(STDERR_PREFIX))
            })
            .or_else(|| candidates.last())
            .copied()
    }
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_capture_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Reads capture records written as JSON lines `{"target": ..., "value": ...}`.
///
/// Malformed lines are ignored. Later records for the same target win.
pub fn parse_capture_file(content: &str, into: &mut BTreeMap<String, Value>) {
    for line in content.lines() {
        let Ok(Value::Object(record)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let (Some(Value::String(target)), Some(value)) = (record.get("target"), record.get("value"))
        {
            into.insert(target.clone(), value.clone());
        }
    }
}
