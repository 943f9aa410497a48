//! Execution results and per-assertion judgments.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::scene::Assertion;

/// Outcome status of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    /// Failed or errored: a candidate for healing and a non-zero exit.
    pub fn is_failure(self) -> bool {
        matches!(self, ExecutionStatus::Failed | ExecutionStatus::Error)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pass/fail of one named check reported by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    pub passed: bool,
}

/// Outcome of running one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub status: ExecutionStatus,
    pub passed_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub total_count: u32,
    pub duration_ms: u64,
    /// Raw combined runner output, kept verbatim.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub checks: Vec<AssertionResult>,
    /// Observed values keyed by assertion target.
    #[serde(default)]
    pub captured: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResult {
    /// Builds a result whose status is derived from the counts.
    ///
    /// Any failure makes the run failed. A run with nothing passed and
    /// nothing failed is skipped (inconclusive). Otherwise it passed.
    pub fn from_counts(
        plan_id: impl Into<String>,
        passed: u32,
        failed: u32,
        skipped: u32,
        duration_ms: u64,
        output: impl Into<String>,
    ) -> Self {
        let status = if failed > 0 {
            ExecutionStatus::Failed
        } else if passed == 0 {
            ExecutionStatus::Skipped
        } else {
            ExecutionStatus::Passed
        };

        Self {
            plan_id: plan_id.into(),
            status,
            passed_count: passed,
            failed_count: failed,
            skipped_count: skipped,
            total_count: passed + failed + skipped,
            duration_ms,
            output: output.into(),
            error_message: None,
            checks: Vec::new(),
            captured: BTreeMap::new(),
            exit_code: None,
            timestamp: Utc::now(),
        }
    }

    /// An errored run with no counts, e.g. a timeout or a runner that
    /// could not start.
    pub fn error(
        plan_id: impl Into<String>,
        message: impl Into<String>,
        output: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            status: ExecutionStatus::Error,
            passed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            total_count: 0,
            duration_ms,
            output: output.into(),
            error_message: Some(message.into()),
            checks: Vec::new(),
            captured: BTreeMap::new(),
            exit_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_captured(mut self, target: impl Into<String>, value: Value) -> Self {
        self.captured.insert(target.into(), value);
        self
    }

    /// Zero tests ran. Such results are never healed or explored.
    pub fn is_inconclusive(&self) -> bool {
        self.total_count == 0 && self.status != ExecutionStatus::Error
    }
}

/// Verdict for one assertion against one execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentResult {
    /// Position of the assertion in its scene.
    pub assertion_index: usize,
    pub assertion: Assertion,
    pub passed: bool,
    /// In [0, 1]. Deterministic checks always report 1.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl JudgmentResult {
    pub fn new(
        assertion_index: usize,
        assertion: Assertion,
        passed: bool,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            assertion_index,
            assertion,
            passed,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}
