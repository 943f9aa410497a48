//! Mock reasoning backend implementing every capability port.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rigour_proto::{
    Assertion, CapabilityError, CodeRepairer, Connection, Diagnosis, EdgeCase, EdgeCaseSuggester,
    EdgeCaseSuggestion, ExecutionResult, FailureDiagnoser, IssueType, PlanDraft, PlanGenerator,
    Scene, SemanticEvaluator, SemanticVerdict, Severity, TestCase,
};
use serde_json::Value;

/// Backend returning scripted responses and counting calls per port.
#[derive(Debug)]
pub struct MockBackend {
    failing_plans: HashSet<String>,
    plan_delays: HashMap<String, Duration>,
    edge_cases: Vec<EdgeCase>,
    fail_suggest: bool,
    diagnosis: Diagnosis,
    verdict: SemanticVerdict,
    plan_calls: AtomicUsize,
    suggest_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
    diagnose_calls: AtomicUsize,
    repair_calls: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Plans succeed, two edge cases are suggested, failures diagnose as a
    /// medium assertion mismatch and semantic checks pass.
    pub fn new() -> Self {
        Self {
            failing_plans: HashSet::new(),
            plan_delays: HashMap::new(),
            edge_cases: vec![
                edge_case("Empty payload", "input_validation"),
                edge_case("Expired token", "authentication"),
            ],
            fail_suggest: false,
            diagnosis: Diagnosis::new(
                IssueType::AssertionMismatch,
                Severity::Medium,
                "assertion does not match response",
            ),
            verdict: SemanticVerdict {
                passed: true,
                confidence: 0.9,
                reasoning: "looks right".to_string(),
                remediation: None,
            },
            plan_calls: AtomicUsize::new(0),
            suggest_calls: AtomicUsize::new(0),
            evaluate_calls: AtomicUsize::new(0),
            diagnose_calls: AtomicUsize::new(0),
            repair_calls: AtomicUsize::new(0),
        }
    }

    /// Planning fails for the given scene id.
    pub fn failing_plan(mut self, scene_id: impl Into<String>) -> Self {
        self.failing_plans.insert(scene_id.into());
        self
    }

    /// Planning for the given scene id sleeps first.
    pub fn with_plan_delay(mut self, scene_id: impl Into<String>, delay: Duration) -> Self {
        self.plan_delays.insert(scene_id.into(), delay);
        self
    }

    pub fn with_edge_cases(mut self, edge_cases: Vec<EdgeCase>) -> Self {
        self.edge_cases = edge_cases;
        self
    }

    pub fn failing_suggest(mut self) -> Self {
        self.fail_suggest = true;
        self
    }

    pub fn with_diagnosis(mut self, diagnosis: Diagnosis) -> Self {
        self.diagnosis = diagnosis;
        self
    }

    pub fn with_verdict(mut self, verdict: SemanticVerdict) -> Self {
        self.verdict = verdict;
        self
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn suggest_calls(&self) -> usize {
        self.suggest_calls.load(Ordering::SeqCst)
    }

    pub fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }

    pub fn diagnose_calls(&self) -> usize {
        self.diagnose_calls.load(Ordering::SeqCst)
    }

    pub fn repair_calls(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }
}

/// An edge case with no steps or assertions of its own.
pub fn edge_case(name: &str, category: &str) -> EdgeCase {
    EdgeCase {
        name: name.to_string(),
        category: category.to_string(),
        description: format!("{name} ({category})"),
        priority: "medium".to_string(),
        ..Default::default()
    }
}

#[async_trait]
impl PlanGenerator for MockBackend {
    async fn plan(
        &self,
        scene: &Scene,
        _connection: &Connection,
    ) -> Result<PlanDraft, CapabilityError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.plan_delays.get(scene.id()) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_plans.contains(scene.id()) {
            return Err(CapabilityError::call_failed(
                "plan_generator",
                format!("no plan for {}", scene.id()),
            ));
        }

        let mut draft = PlanDraft::new(format!("# test for {}\ndef test_scene():\n    pass\n", scene.id()));
        draft.test_cases = vec![TestCase {
            id: "test_scene".to_string(),
            name: scene.title().to_string(),
            description: scene.description().to_string(),
            assertion_indices: (0..scene.assertions().len()).collect(),
        }];
        Ok(draft)
    }
}

#[async_trait]
impl EdgeCaseSuggester for MockBackend {
    async fn suggest(
        &self,
        _scene: &Scene,
        _result: &ExecutionResult,
        focus: &[String],
    ) -> Result<EdgeCaseSuggestion, CapabilityError> {
        self.suggest_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_suggest {
            return Err(CapabilityError::unparseable(
                "edge_case_suggester",
                "no JSON in response",
            ));
        }
        Ok(EdgeCaseSuggestion {
            reasoning: format!("focus: {}", focus.join(", ")),
            edge_cases: self.edge_cases.clone(),
        })
    }
}

#[async_trait]
impl SemanticEvaluator for MockBackend {
    async fn evaluate(
        &self,
        _assertion: &Assertion,
        _actual: &Value,
        _context: &Value,
    ) -> Result<SemanticVerdict, CapabilityError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

#[async_trait]
impl FailureDiagnoser for MockBackend {
    async fn diagnose(&self, _result: &ExecutionResult) -> Result<Diagnosis, CapabilityError> {
        self.diagnose_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.diagnosis.clone())
    }
}

#[async_trait]
impl CodeRepairer for MockBackend {
    async fn repair(
        &self,
        diagnosis: &Diagnosis,
        artifact: &str,
    ) -> Result<String, CapabilityError> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{artifact}# repaired: {}\n", diagnosis.root_cause))
    }
}
