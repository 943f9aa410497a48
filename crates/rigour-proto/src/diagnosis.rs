//! Root-cause classification of a failed execution.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// What kind of failure a diagnosis describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    AssertionMismatch,
    Timeout,
    NetworkError,
    SyntaxError,
    LogicError,
    EnvironmentIssue,
    #[default]
    Unknown,
}

impl IssueType {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueType::AssertionMismatch => "assertion_mismatch",
            IssueType::Timeout => "timeout",
            IssueType::NetworkError => "network_error",
            IssueType::SyntaxError => "syntax_error",
            IssueType::LogicError => "logic_error",
            IssueType::EnvironmentIssue => "environment_issue",
            IssueType::Unknown => "unknown",
        }
    }

    pub fn all() -> &'static [IssueType] {
        &[
            IssueType::AssertionMismatch,
            IssueType::Timeout,
            IssueType::NetworkError,
            IssueType::SyntaxError,
            IssueType::LogicError,
            IssueType::EnvironmentIssue,
            IssueType::Unknown,
        ]
    }

    /// Lenient parse used for backend payloads: unrecognized labels map to
    /// `Unknown`, and a few common synonyms are accepted.
    pub fn parse_lenient(s: &str) -> Self {
        if let Ok(issue) = s.parse() {
            return issue;
        }
        match s.trim().to_ascii_lowercase().as_str() {
            "assertion" | "mismatch" => IssueType::AssertionMismatch,
            "network" | "connection" => IssueType::NetworkError,
            "syntax" => IssueType::SyntaxError,
            "logic" => IssueType::LogicError,
            "environment" | "env" => IssueType::EnvironmentIssue,
            _ => IssueType::Unknown,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        IssueType::all()
            .iter()
            .copied()
            .find(|issue| issue.as_str() == wanted)
            .ok_or_else(|| ValidationError::UnknownVariant {
                kind: "issue type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnosis of a failed execution, produced by the external diagnoser.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Diagnosis {
    #[serde(default)]
    pub issue_type: IssueType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub root_cause: String,
    /// Indices into the scene's assertions.
    #[serde(default)]
    pub affected_assertions: Vec<usize>,
    /// Ordered, most important first.
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub is_flaky: bool,
}

impl Diagnosis {
    pub fn new(issue_type: IssueType, severity: Severity, root_cause: impl Into<String>) -> Self {
        Self {
            issue_type,
            severity,
            root_cause: root_cause.into(),
            ..Default::default()
        }
    }

    pub fn with_recommendation(mut self, recommendation: impl Into<String>) -> Self {
        self.recommendations.push(recommendation.into());
        self
    }
}
