//! Healing Coordinator: the diagnose, repair and retry loop for failed runs.
//!
//! Strategies are held in an ordered list and the first one whose
//! `can_handle` accepts the diagnosis is applied. Order matters: a strategy
//! listed earlier shadows any later one that would also match.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use rigour_proto::{
    CapabilityError, CodeRepairer, Diagnosis, ExecutionResult, FailureDiagnoser, IssueType,
    Severity,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::HealingConfig;

/// Result of one heal attempt.
///
/// When `recovered` is false, `artifact` is the original, unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingOutcome {
    pub recovered: bool,
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    /// Name of the strategy that ran, if any matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealingOutcome {
    fn unrecovered(artifact: &str, diagnosis: Option<Diagnosis>, reason: impl Into<String>) -> Self {
        Self {
            recovered: false,
            artifact: artifact.to_string(),
            diagnosis,
            strategy: None,
            error: Some(reason.into()),
        }
    }
}

/// A (predicate, transform) pair in the healing dispatch list.
#[async_trait]
pub trait HealingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, diagnosis: &Diagnosis) -> bool;

    /// Returns the transformed artifact.
    async fn apply(&self, artifact: &str, diagnosis: &Diagnosis)
    -> Result<String, CapabilityError>;
}

/// Raises declared timeouts and inserts settle points before requests.
///
/// Purely local: no capability call.
pub struct TimeoutStrategy {
    factor: f64,
    settle: Duration,
    timeout_re: Regex,
    request_re: Regex,
}

impl TimeoutStrategy {
    pub fn new(factor: f64, settle: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            factor,
            settle,
            timeout_re: Regex::new(r"\btimeout\s*=\s*(\d+(?:\.\d+)?)")?,
            request_re: Regex::new(
                r"^(\s*)(?:.*\W)?client\.(?:get|post|put|patch|delete|head|options|request)\(",
            )?,
        })
    }

    /// The deterministic textual transform.
    ///
    /// Settle points only go before lines that begin a statement: never
    /// inside an open bracket, after a `\` continuation, or before an
    /// `elif`/`else`/`except`/`finally` clause.
    pub fn transform(&self, artifact: &str) -> String {
        let mut scaled = false;
        let mut depth: i32 = 0;
        let mut continued = false;
        let mut lines: Vec<String> = Vec::new();
        for line in artifact.lines() {
            let replaced = self
                .timeout_re
                .replace_all(line, |caps: &regex::Captures<'_>| {
                    let value: f64 = caps[1].parse().unwrap_or(0.0);
                    scaled = true;
                    format!("timeout={}", format_number(value * self.factor))
                })
                .into_owned();

            let starts_statement = depth == 0 && !continued && !is_continuation_clause(line);
            if starts_statement && let Some(caps) = self.request_re.captures(&replaced) {
                let indent = caps.get(1).map_or("", |m| m.as_str());
                lines.push(format!(
                    "{indent}time.sleep({})",
                    format_number(self.settle.as_secs_f64())
                ));
            }

            depth = (depth + bracket_delta(line)).max(0);
            continued = line.trim_end().ends_with('\\');
            lines.push(replaced);
        }

        let settled = lines.iter().any(|l| l.trim_start().starts_with("time.sleep("));
        if settled && !artifact.lines().any(|l| l.trim() == "import time") {
            lines.insert(0, "import time".to_string());
        }

        let mut out = lines.join("\n");
        if artifact.ends_with('\n') {
            out.push('\n');
        }
        debug!(scaled, settled, "Applied timeout transform");
        out
    }
}

fn is_continuation_clause(line: &str) -> bool {
    let keyword = line
        .trim_start()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .unwrap_or_default();
    matches!(keyword, "elif" | "else" | "except" | "finally")
}

/// Net change in bracket nesting over one line, ignoring string literals
/// and comments.
fn bracket_delta(line: &str) -> i32 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '#' => break,
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => delta += 1,
            ')' | ']' | '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[async_trait]
impl HealingStrategy for TimeoutStrategy {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn can_handle(&self, diagnosis: &Diagnosis) -> bool {
        diagnosis.issue_type == IssueType::Timeout
    }

    async fn apply(
        &self,
        artifact: &str,
        _diagnosis: &Diagnosis,
    ) -> Result<String, CapabilityError> {
        Ok(self.transform(artifact))
    }
}

/// Delegates the rewrite for one issue type to the code repairer.
pub struct RepairStrategy {
    name: &'static str,
    issue_type: IssueType,
    repairer: Arc<dyn CodeRepairer>,
}

impl RepairStrategy {
    pub fn new(issue_type: IssueType, repairer: Arc<dyn CodeRepairer>) -> Self {
        Self {
            name: issue_type.as_str(),
            issue_type,
            repairer,
        }
    }
}

#[async_trait]
impl HealingStrategy for RepairStrategy {
    fn name(&self) -> &'static str {
        self.name
    }

    fn can_handle(&self, diagnosis: &Diagnosis) -> bool {
        diagnosis.issue_type == self.issue_type
    }

    async fn apply(
        &self,
        artifact: &str,
        diagnosis: &Diagnosis,
    ) -> Result<String, CapabilityError> {
        let repaired = self.repairer.repair(diagnosis, artifact).await?;
        if repaired.trim().is_empty() {
            return Err(CapabilityError::unparseable(
                "code_repairer",
                "repair returned an empty artifact",
            ));
        }
        Ok(repaired)
    }
}

fn repair_strategies(repairer: Arc<dyn CodeRepairer>) -> Vec<Box<dyn HealingStrategy>> {
    vec![
        Box::new(RepairStrategy::new(
            IssueType::AssertionMismatch,
            repairer.clone(),
        )),
        Box::new(RepairStrategy::new(IssueType::LogicError, repairer.clone())),
        Box::new(RepairStrategy::new(IssueType::EnvironmentIssue, repairer)),
    ]
}

pub struct HealingCoordinator {
    diagnoser: Arc<dyn FailureDiagnoser>,
    strategies: Vec<Box<dyn HealingStrategy>>,
    repairable: Vec<IssueType>,
    timeout: Duration,
}

impl HealingCoordinator {
    /// Builds the coordinator with the standard strategy list:
    /// timeout, assertion_mismatch, logic_error, environment_issue.
    pub fn new(
        diagnoser: Arc<dyn FailureDiagnoser>,
        repairer: Arc<dyn CodeRepairer>,
        config: &HealingConfig,
    ) -> Result<Self, regex::Error> {
        let mut strategies: Vec<Box<dyn HealingStrategy>> = vec![Box::new(TimeoutStrategy::new(
            config.timeout_factor,
            Duration::from_millis(config.settle_ms),
        )?)];
        strategies.extend(repair_strategies(repairer));
        Ok(Self::with_strategies(diagnoser, strategies, config))
    }

    /// Like [`HealingCoordinator::new`] without the local timeout strategy.
    pub fn repair_only(
        diagnoser: Arc<dyn FailureDiagnoser>,
        repairer: Arc<dyn CodeRepairer>,
        config: &HealingConfig,
    ) -> Self {
        Self::with_strategies(diagnoser, repair_strategies(repairer), config)
    }

    pub fn with_strategies(
        diagnoser: Arc<dyn FailureDiagnoser>,
        strategies: Vec<Box<dyn HealingStrategy>>,
        config: &HealingConfig,
    ) -> Self {
        Self {
            diagnoser,
            strategies,
            repairable: config.repairable.clone(),
            timeout: config.timeout(),
        }
    }

    /// Names of the registered strategies in dispatch order.
    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Diagnoses `result` and attempts to repair `artifact`.
    ///
    /// Bounded by the configured healing timeout. Never fails: every error
    /// becomes `recovered = false` with the original artifact.
    pub async fn heal(&self, result: &ExecutionResult, artifact: &str) -> HealingOutcome {
        match tokio::time::timeout(self.timeout, self.diagnose_and_recover(result, artifact)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    plan_id = %result.plan_id,
                    timeout_secs = self.timeout.as_secs(),
                    "Healing timed out"
                );
                HealingOutcome::unrecovered(
                    artifact,
                    None,
                    format!("healing timed out after {}s", self.timeout.as_secs()),
                )
            }
        }
    }

    async fn diagnose_and_recover(&self, result: &ExecutionResult, artifact: &str) -> HealingOutcome {
        let diagnosis = match self.diagnoser.diagnose(result).await {
            Ok(d) => d,
            Err(e) => {
                warn!(plan_id = %result.plan_id, error = %e, "Diagnosis failed");
                return HealingOutcome::unrecovered(artifact, None, e.to_string());
            }
        };
        info!(
            plan_id = %result.plan_id,
            issue_type = %diagnosis.issue_type,
            severity = %diagnosis.severity,
            "Diagnosed failure"
        );
        self.recover(artifact, &diagnosis).await
    }

    /// Applies the first matching strategy to `artifact`.
    ///
    /// A critical diagnosis, or one whose issue type is not repairable,
    /// returns `recovered = false` without running any strategy.
    pub async fn recover(&self, artifact: &str, diagnosis: &Diagnosis) -> HealingOutcome {
        if diagnosis.severity == Severity::Critical {
            return HealingOutcome::unrecovered(
                artifact,
                Some(diagnosis.clone()),
                "critical severity is not auto-repaired",
            );
        }
        if !self.repairable.contains(&diagnosis.issue_type) {
            return HealingOutcome::unrecovered(
                artifact,
                Some(diagnosis.clone()),
                format!("{} is not a repairable issue type", diagnosis.issue_type),
            );
        }

        let Some(strategy) = self.strategies.iter().find(|s| s.can_handle(diagnosis)) else {
            return HealingOutcome::unrecovered(
                artifact,
                Some(diagnosis.clone()),
                format!("no strategy handles {}", diagnosis.issue_type),
            );
        };

        debug!(strategy = strategy.name(), "Applying healing strategy");
        match strategy.apply(artifact, diagnosis).await {
            Ok(repaired) if repaired == artifact => HealingOutcome {
                strategy: Some(strategy.name().to_string()),
                ..HealingOutcome::unrecovered(
                    artifact,
                    Some(diagnosis.clone()),
                    "strategy produced no change",
                )
            },
            Ok(repaired) => HealingOutcome {
                recovered: true,
                artifact: repaired,
                diagnosis: Some(diagnosis.clone()),
                strategy: Some(strategy.name().to_string()),
                error: None,
            },
            Err(e) => {
                warn!(strategy = strategy.name(), error = %e, "Healing strategy failed");
                HealingOutcome {
                    strategy: Some(strategy.name().to_string()),
                    ..HealingOutcome::unrecovered(artifact, Some(diagnosis.clone()), e.to_string())
                }
            }
        }
    }
}

const FLAKY_WINDOW: usize = 10;
const FLAKY_MIN_RUNS: usize = 3;
const FLAKY_MIN_FAILURES: usize = 2;

/// Tracks recent pass/fail history per key to spot intermittent failures.
#[derive(Debug, Default)]
pub struct FlakinessTracker {
    history: Mutex<HashMap<String, VecDeque<bool>>>,
}

impl FlakinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, passed: bool) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        let window = history.entry(key.to_string()).or_default();
        window.push_back(passed);
        while window.len() > FLAKY_WINDOW {
            window.pop_front();
        }
    }

    /// Flaky when the window holds at least three runs, both outcomes, a pass
    /// rate between 0.3 and 0.7, and at least two failures.
    pub fn is_flaky(&self, key: &str) -> bool {
        let Ok(history) = self.history.lock() else {
            return false;
        };
        let Some(window) = history.get(key) else {
            return false;
        };
        if window.len() < FLAKY_MIN_RUNS {
            return false;
        }
        let passes = window.iter().filter(|p| **p).count();
        let failures = window.len() - passes;
        if passes == 0 || failures < FLAKY_MIN_FAILURES {
            return false;
        }
        let rate = passes as f64 / window.len() as f64;
        (0.3..=0.7).contains(&rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedDiagnoser {
        diagnosis: Result<Diagnosis, CapabilityError>,
        delay: Duration,
    }

    #[async_trait]
    impl FailureDiagnoser for ScriptedDiagnoser {
        async fn diagnose(&self, _result: &ExecutionResult) -> Result<Diagnosis, CapabilityError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.diagnosis.clone()
        }
    }

    #[derive(Default)]
    struct CountingRepairer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CodeRepairer for CountingRepairer {
        async fn repair(
            &self,
            diagnosis: &Diagnosis,
            artifact: &str,
        ) -> Result<String, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("# fixed: {}\n{artifact}", diagnosis.root_cause))
        }
    }

    fn coordinator(
        diagnosis: Diagnosis,
        repairer: Arc<CountingRepairer>,
    ) -> HealingCoordinator {
        let diagnoser = Arc::new(ScriptedDiagnoser {
            diagnosis: Ok(diagnosis),
            delay: Duration::ZERO,
        });
        HealingCoordinator::new(diagnoser, repairer, &HealingConfig::default()).unwrap()
    }

    fn failed() -> ExecutionResult {
        ExecutionResult::from_counts("plan-1", 0, 1, 0, 10, "FAILED test_x")
    }

    #[test]
    fn test_strategy_order() {
        let c = coordinator(Diagnosis::default(), Arc::new(CountingRepairer::default()));
        assert_eq!(
            c.strategy_names(),
            ["timeout", "assertion_mismatch", "logic_error", "environment_issue"]
        );
    }

    #[tokio::test]
    async fn test_critical_severity_never_recovers() {
        let repairer = Arc::new(CountingRepairer::default());
        let c = coordinator(Diagnosis::default(), repairer.clone());
        for issue in IssueType::all() {
            let d = Diagnosis::new(*issue, Severity::Critical, "bad");
            let outcome = c.recover("artifact", &d).await;
            assert!(!outcome.recovered, "{issue} recovered under critical");
            assert_eq!(outcome.artifact, "artifact");
        }
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_repairable_issue_passes_through() {
        let repairer = Arc::new(CountingRepairer::default());
        let c = coordinator(Diagnosis::default(), repairer.clone());
        for issue in [
            IssueType::NetworkError,
            IssueType::SyntaxError,
            IssueType::EnvironmentIssue,
            IssueType::Unknown,
        ] {
            let outcome = c
                .recover("artifact", &Diagnosis::new(issue, Severity::Medium, "x"))
                .await;
            assert!(!outcome.recovered);
        }
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_assertion_mismatch_uses_repairer() {
        let repairer = Arc::new(CountingRepairer::default());
        let d = Diagnosis::new(IssueType::AssertionMismatch, Severity::High, "wrong code");
        let c = coordinator(d, repairer.clone());

        let outcome = c.heal(&failed(), "assert r.status_code == 201\n").await;
        assert!(outcome.recovered);
        assert_eq!(outcome.strategy.as_deref(), Some("assertion_mismatch"));
        assert!(outcome.artifact.starts_with("# fixed: wrong code"));
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_strategy_is_local() {
        let repairer = Arc::new(CountingRepairer::default());
        let d = Diagnosis::new(IssueType::Timeout, Severity::Medium, "slow");
        let c = coordinator(d, repairer.clone());

        let artifact = "def test_x(client):\n    r = client.get(\"/slow\", timeout=5)\n";
        let outcome = c.heal(&failed(), artifact).await;
        assert!(outcome.recovered);
        assert_eq!(outcome.strategy.as_deref(), Some("timeout"));
        assert_eq!(repairer.calls.load(Ordering::SeqCst), 0);
        assert!(outcome.artifact.contains("timeout=10"));
    }

    #[tokio::test]
    async fn test_diagnoser_failure_is_unrecovered() {
        let diagnoser = Arc::new(ScriptedDiagnoser {
            diagnosis: Err(CapabilityError::call_failed("failure_diagnoser", "offline")),
            delay: Duration::ZERO,
        });
        let c = HealingCoordinator::new(
            diagnoser,
            Arc::new(CountingRepairer::default()),
            &HealingConfig::default(),
        )
        .unwrap();
        let outcome = c.heal(&failed(), "original").await;
        assert!(!outcome.recovered);
        assert_eq!(outcome.artifact, "original");
        assert!(outcome.error.unwrap().contains("offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heal_is_time_bounded() {
        let diagnoser = Arc::new(ScriptedDiagnoser {
            diagnosis: Ok(Diagnosis::new(IssueType::Timeout, Severity::Low, "x")),
            delay: Duration::from_secs(600),
        });
        let config = HealingConfig {
            timeout_secs: 1,
            ..HealingConfig::default()
        };
        let c = HealingCoordinator::new(
            diagnoser,
            Arc::new(CountingRepairer::default()),
            &config,
        )
        .unwrap();
        let outcome = c.heal(&failed(), "original").await;
        assert!(!outcome.recovered);
        assert!(outcome.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_timeout_transform() {
        let strategy = TimeoutStrategy::new(2.0, Duration::from_millis(500)).unwrap();
        let artifact = "import httpx\n\ndef test_x():\n    with httpx.Client(timeout=2.5) as client:\n        r = client.post(\"/login\", json={})\n        assert r.status_code == 200\n";
        let out = strategy.transform(artifact);
        assert!(out.starts_with("import time\nimport httpx"));
        assert!(out.contains("httpx.Client(timeout=5)"));
        assert!(out.contains("        time.sleep(0.5)\n        r = client.post("));
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_timeout_transform_without_requests_only_scales() {
        let strategy = TimeoutStrategy::new(3.0, Duration::from_millis(250)).unwrap();
        let out = strategy.transform("run(timeout=10)");
        assert_eq!(out, "run(timeout=30)");
    }

    #[test]
    fn test_settle_points_only_before_statements() {
        let strategy = TimeoutStrategy::new(2.0, Duration::from_millis(500)).unwrap();
        let artifact = "\
def test_x(client):
    if flag:
        r = client.get(\"/a\")
    elif client.get(\"/b\").ok:
        pass
    data = wrap(
        client.post(\"/c\"),
    )
    total = 1 + \\
        client.get(\"/d\").status_code
";
        let out = strategy.transform(artifact);
        assert_eq!(out.matches("time.sleep(").count(), 1);
        assert!(out.contains("        time.sleep(0.5)\n        r = client.get(\"/a\")"));
        assert!(out.contains("        pass\n    data = wrap(\n        client.post("));
    }

    #[test]
    fn test_repair_only_has_no_timeout_strategy() {
        let diagnoser = Arc::new(ScriptedDiagnoser {
            diagnosis: Ok(Diagnosis::default()),
            delay: Duration::ZERO,
        });
        let c = HealingCoordinator::repair_only(
            diagnoser,
            Arc::new(CountingRepairer::default()),
            &HealingConfig::default(),
        );
        assert_eq!(
            c.strategy_names(),
            ["assertion_mismatch", "logic_error", "environment_issue"]
        );
    }

    #[tokio::test]
    async fn test_unchanged_artifact_is_not_recovered() {
        let repairer = Arc::new(CountingRepairer::default());
        let d = Diagnosis::new(IssueType::Timeout, Severity::Medium, "slow");
        let c = coordinator(d.clone(), repairer);
        let outcome = c.recover("print('no knobs here')", &d).await;
        assert!(!outcome.recovered);
        assert_eq!(outcome.strategy.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_flakiness_tracker() {
        let tracker = FlakinessTracker::new();
        tracker.record("s", true);
        tracker.record("s", false);
        assert!(!tracker.is_flaky("s"));

        tracker.record("s", false);
        tracker.record("s", true);
        // 2 passes, 2 failures
        assert!(tracker.is_flaky("s"));

        let stable = FlakinessTracker::new();
        for _ in 0..5 {
            stable.record("s", false);
        }
        assert!(!stable.is_flaky("s"));
        assert!(!stable.is_flaky("unknown"));
    }

    #[test]
    fn test_flakiness_window_slides() {
        let tracker = FlakinessTracker::new();
        for passed in [true, false, true, false] {
            tracker.record("s", passed);
        }
        assert!(tracker.is_flaky("s"));
        for _ in 0..10 {
            tracker.record("s", true);
        }
        assert!(!tracker.is_flaky("s"));
    }
}
