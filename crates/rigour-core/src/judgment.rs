//! Judgment Engine: evaluates a scene's assertions against captured outcomes.
//!
//! Every assertion type except `semantic` and `custom` is judged by a pure,
//! deterministic rule with confidence 1.0 (pass) or 0.0 (fail). Qualitative
//! types are handed to the injected [`SemanticEvaluator`]; a failure of that
//! call becomes a failed judgment, never an error.

use std::sync::Arc;

use rigour_proto::{
    Assertion, AssertionType, ExecutionResult, JudgmentResult, Scene, SemanticEvaluator,
};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Reasoning recorded when no captured outcome matches an assertion's target.
pub const NO_CAPTURED_OUTCOME: &str = "no captured outcome";

/// Max characters of runner output included in the evaluator context.
const CONTEXT_OUTPUT_LIMIT: usize = 4000;

pub struct JudgmentEngine {
    evaluator: Option<Arc<dyn SemanticEvaluator>>,
}

impl JudgmentEngine {
    pub fn new(evaluator: Arc<dyn SemanticEvaluator>) -> Self {
        Self {
            evaluator: Some(evaluator),
        }
    }

    /// An engine with no evaluator. Qualitative assertions judge as failed.
    pub fn deterministic_only() -> Self {
        Self { evaluator: None }
    }

    /// Judges every assertion of `scene` against `result`, in declaration order.
    pub async fn judge(&self, scene: &Scene, result: &ExecutionResult) -> Vec<JudgmentResult> {
        let context = evaluation_context(scene, result);
        let mut judgments = Vec::with_capacity(scene.assertions().len());

        for (index, assertion) in scene.assertions().iter().enumerate() {
            let actual = result.captured.get(&assertion.target);
            let judgment = self
                .judge_assertion(index, assertion, actual, &context)
                .await;
            debug!(
                scene_id = %scene.id(),
                assertion = index,
                assertion_type = %assertion.assertion_type,
                passed = judgment.passed,
                "Judged assertion"
            );
            judgments.push(judgment);
        }

        judgments
    }

    /// Judges one assertion against its captured value, if any.
    pub async fn judge_assertion(
        &self,
        index: usize,
        assertion: &Assertion,
        actual: Option<&Value>,
        context: &Value,
    ) -> JudgmentResult {
        let Some(actual) = actual else {
            return JudgmentResult::new(index, assertion.clone(), false, 0.0, NO_CAPTURED_OUTCOME);
        };

        if !assertion.assertion_type.is_qualitative() {
            let (passed, reasoning) = evaluate_deterministic(assertion, actual);
            let confidence = if passed { 1.0 } else { 0.0 };
            return JudgmentResult::new(index, assertion.clone(), passed, confidence, reasoning);
        }

        let Some(evaluator) = &self.evaluator else {
            return JudgmentResult::new(
                index,
                assertion.clone(),
                false,
                0.0,
                "no semantic evaluator configured",
            );
        };

        match evaluator.evaluate(assertion, actual, context).await {
            Ok(verdict) => {
                let judgment = JudgmentResult::new(
                    index,
                    assertion.clone(),
                    verdict.passed,
                    verdict.confidence,
                    verdict.reasoning,
                );
                match verdict.remediation {
                    Some(remediation) => judgment.with_remediation(remediation),
                    None => judgment,
                }
            }
            Err(e) => {
                warn!(assertion = index, error = %e, "Semantic evaluation failed");
                JudgmentResult::new(index, assertion.clone(), false, 0.0, e.to_string())
            }
        }
    }
}

/// Context handed to the semantic evaluator alongside each assertion.
fn evaluation_context(scene: &Scene, result: &ExecutionResult) -> Value {
    let output: String = result.output.chars().take(CONTEXT_OUTPUT_LIMIT).collect();
    json!({
        "scene_id": scene.id(),
        "scene_title": scene.title(),
        "scene_description": scene.description(),
        "plan_id": result.plan_id,
        "status": result.status,
        "output": output,
        "captured": result.captured,
    })
}

/// Applies the deterministic rule for a non-qualitative assertion.
///
/// Returns the verdict and a one-line reasoning. Qualitative types always
/// fail here; they are routed to the evaluator before reaching this point.
pub fn evaluate_deterministic(assertion: &Assertion, actual: &Value) -> (bool, String) {
    let expected = &assertion.expected;
    match assertion.assertion_type {
        AssertionType::StatusCode => {
            let actual = field(actual, "status_code");
            match (as_code(actual), as_code(expected)) {
                (Some(a), Some(e)) if a == e => (true, format!("status code {a} matches")),
                (Some(a), Some(e)) => (false, format!("expected status code {e}, got {a}")),
                _ => (
                    false,
                    format!("cannot compare status codes: expected {expected}, got {actual}"),
                ),
            }
        }
        AssertionType::BodyContains => contains(field(actual, "body"), expected, "body"),
        AssertionType::HeaderContains => contains(field(actual, "headers"), expected, "headers"),
        AssertionType::ResponseTime => {
            let actual = field(actual, "duration_ms");
            let actual = if actual.is_object() {
                field(actual, "duration")
            } else {
                actual
            };
            response_time(
                actual.as_f64(),
                expected.as_f64(),
                assertion.tolerance_or_default(),
            )
        }
        AssertionType::BodySchema => match schema_subset(expected, envelope_body(actual), "$") {
            Ok(()) => (true, "body matches expected schema".to_string()),
            Err(reason) => (false, reason),
        },
        AssertionType::DbState => {
            if deep_equal(expected, envelope_body(actual)) {
                (true, "state matches expected".to_string())
            } else {
                (false, format!("expected state {expected}, got {actual}"))
            }
        }
        AssertionType::Semantic | AssertionType::Custom => (
            false,
            format!("{} assertions require an evaluator", assertion.assertion_type),
        ),
    }
}

/// `actual[name]` when `actual` is an object carrying that field, else `actual`.
fn field<'a>(actual: &'a Value, name: &str) -> &'a Value {
    actual.get(name).unwrap_or(actual)
}

/// The body of a captured response envelope (`{status_code, body, ...}`).
///
/// Plain objects are returned as-is so a captured body may itself contain a
/// `body` key.
fn envelope_body(actual: &Value) -> &Value {
    match actual {
        Value::Object(map) if map.contains_key("status_code") => {
            map.get("body").unwrap_or(actual)
        }
        _ => actual,
    }
}

fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.is_finite())
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn contains(actual: &Value, expected: &Value, what: &str) -> (bool, String) {
    let needle = stringify(expected);
    let haystack = stringify(actual);
    if haystack.contains(&needle) {
        (true, format!("{what} contains '{needle}'"))
    } else {
        (false, format!("{what} does not contain '{needle}'"))
    }
}

/// Passes iff `|actual - expected| <= expected * tolerance`.
pub fn response_time(actual: Option<f64>, expected: Option<f64>, tolerance: f64) -> (bool, String) {
    let (Some(actual), Some(expected)) = (actual, expected) else {
        return (false, "response time is not numeric".to_string());
    };
    if !actual.is_finite() || !expected.is_finite() || !tolerance.is_finite() {
        return (false, "response time is not finite".to_string());
    }

    let bound = expected * tolerance;
    let delta = (actual - expected).abs();
    if delta <= bound {
        (
            true,
            format!("{actual}ms within {bound}ms of expected {expected}ms"),
        )
    } else {
        (
            false,
            format!("{actual}ms deviates {delta}ms from expected {expected}ms (allowed {bound}ms)"),
        )
    }
}

fn type_category(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursive schema subset check.
///
/// Every key of an expected object must be present in the actual object with
/// the same type category, recursing into nested objects. Extra actual keys
/// are allowed. A primitive expected at the top level compares by equality.
pub fn schema_subset(expected: &Value, actual: &Value, path: &str) -> Result<(), String> {
    let Value::Object(expected_map) = expected else {
        return if deep_equal(expected, actual) {
            Ok(())
        } else {
            Err(format!("{path}: expected {expected}, got {actual}"))
        };
    };
    let Value::Object(actual_map) = actual else {
        return Err(format!(
            "{path}: expected object, got {}",
            type_category(actual)
        ));
    };

    for (key, expected_child) in expected_map {
        let child_path = format!("{path}.{key}");
        let Some(actual_child) = actual_map.get(key) else {
            return Err(format!("{child_path}: missing key '{key}'"));
        };
        if expected_child.is_object() {
            schema_subset(expected_child, actual_child, &child_path)?;
        } else if type_category(expected_child) != type_category(actual_child) {
            return Err(format!(
                "{child_path}: expected {}, got {}",
                type_category(expected_child),
                type_category(actual_child)
            ));
        }
    }
    Ok(())
}

/// Deep equality, independent of object key order. Numbers compare by value
/// so `1` equals `1.0`.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| deep_equal(v, other)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigour_proto::{CapabilityError, SemanticVerdict};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn judge_sync(assertion: &Assertion, actual: Value) -> (bool, String) {
        evaluate_deterministic(assertion, &actual)
    }

    #[test]
    fn test_status_code_exact() {
        let a = Assertion::new(AssertionType::StatusCode, "response", 200);
        assert!(judge_sync(&a, json!(200)).0);
        assert!(judge_sync(&a, json!({"status_code": 200, "body": "ok"})).0);
        assert!(judge_sync(&a, json!("200")).0);
        assert!(!judge_sync(&a, json!(201)).0);
        assert!(!judge_sync(&a, json!(null)).0);
    }

    #[test]
    fn test_body_and_header_contains() {
        let a = Assertion::new(AssertionType::BodyContains, "response", "token");
        assert!(judge_sync(&a, json!({"status_code": 200, "body": "{\"token\": \"x\"}"})).0);
        assert!(judge_sync(&a, json!({"token": "abc"})).0);
        assert!(!judge_sync(&a, json!("nothing here")).0);

        let h = Assertion::new(AssertionType::HeaderContains, "response", "application/json");
        assert!(
            judge_sync(
                &h,
                json!({"headers": {"content-type": "application/json"}})
            )
            .0
        );
    }

    #[test]
    fn test_response_time_tolerance() {
        let a = Assertion::new(AssertionType::ResponseTime, "response", 1000).with_tolerance(0.1);
        assert!(judge_sync(&a, json!(1090)).0);
        assert!(!judge_sync(&a, json!(1150)).0);
        assert!(judge_sync(&a, json!({"duration_ms": 950})).0);
        assert!(judge_sync(&a, json!({"duration": 1000.0})).0);
        assert!(!judge_sync(&a, json!("fast")).0);
    }

    #[test]
    fn test_response_time_non_finite_fails() {
        assert!(!response_time(Some(f64::NAN), Some(1000.0), 0.1).0);
        assert!(!response_time(Some(1000.0), Some(f64::INFINITY), 0.1).0);
        assert!(!response_time(Some(1000.0), Some(1000.0), f64::NAN).0);
    }

    #[test]
    fn test_default_tolerance_applies() {
        let a = Assertion::new(AssertionType::ResponseTime, "response", 1000);
        assert!(judge_sync(&a, json!(1100)).0);
        assert!(!judge_sync(&a, json!(1101)).0);
    }

    #[test]
    fn test_schema_subset() {
        let a = Assertion::new(AssertionType::BodySchema, "body", json!({"id": 0, "name": ""}));
        assert!(judge_sync(&a, json!({"id": 1, "name": "x", "extra": true})).0);

        let (passed, reason) = judge_sync(&a, json!({"id": 1}));
        assert!(!passed);
        assert!(reason.contains("name"));

        assert!(!judge_sync(&a, json!({"id": "1", "name": "x"})).0);
    }

    #[test]
    fn test_schema_subset_nested_and_envelope() {
        let expected = json!({"user": {"id": 0, "roles": []}});
        let a = Assertion::new(AssertionType::BodySchema, "response", expected);
        let actual = json!({
            "status_code": 200,
            "body": {"user": {"id": 7, "roles": ["admin"], "email": "a@b"}}
        });
        assert!(judge_sync(&a, actual).0);

        let (passed, reason) = judge_sync(&a, json!({"user": {"id": 7}}));
        assert!(!passed);
        assert!(reason.contains("$.user.roles"));
    }

    #[test]
    fn test_db_state_deep_equal() {
        let a = Assertion::new(
            AssertionType::DbState,
            "users",
            json!({"count": 2, "names": ["a", "b"]}),
        );
        assert!(judge_sync(&a, json!({"names": ["a", "b"], "count": 2.0})).0);
        assert!(!judge_sync(&a, json!({"names": ["b", "a"], "count": 2})).0);
        assert!(!judge_sync(&a, json!({"names": ["a", "b"], "count": 2, "extra": 1})).0);
    }

    struct ScriptedEvaluator {
        verdict: Result<SemanticVerdict, CapabilityError>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl SemanticEvaluator for ScriptedEvaluator {
        async fn evaluate(
            &self,
            _assertion: &Assertion,
            _actual: &Value,
            _context: &Value,
        ) -> Result<SemanticVerdict, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict.clone()
        }
    }

    fn scene_with(assertions: Vec<Assertion>) -> Scene {
        let mut builder = Scene::builder("Greeting", "Says hello");
        for a in assertions {
            builder = builder.with_full_assertion(a);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_assertion_fails_with_zero_confidence() {
        let engine = JudgmentEngine::deterministic_only();
        let scene = scene_with(vec![Assertion::new(
            AssertionType::StatusCode,
            "response",
            200,
        )]);
        let result = ExecutionResult::from_counts("p", 1, 0, 0, 5, "");
        let judgments = engine.judge(&scene, &result).await;
        assert_eq!(judgments.len(), 1);
        assert!(!judgments[0].passed);
        assert_eq!(judgments[0].confidence, 0.0);
        assert_eq!(judgments[0].reasoning, NO_CAPTURED_OUTCOME);
    }

    #[tokio::test]
    async fn test_deterministic_ignores_context() {
        let engine = JudgmentEngine::deterministic_only();
        let a = Assertion::new(AssertionType::StatusCode, "response", 200);
        for context in [json!(null), json!({"noise": [1, 2, 3]})] {
            let j = engine
                .judge_assertion(0, &a, Some(&json!(200)), &context)
                .await;
            assert!(j.passed);
            assert_eq!(j.confidence, 1.0);
        }
    }

    #[tokio::test]
    async fn test_semantic_delegates_to_evaluator() {
        let evaluator = Arc::new(ScriptedEvaluator {
            verdict: Ok(SemanticVerdict {
                passed: true,
                confidence: 0.8,
                reasoning: "friendly".to_string(),
                remediation: None,
            }),
            calls: AtomicUsize::new(0),
        });
        let engine = JudgmentEngine::new(evaluator.clone());
        let scene = scene_with(vec![
            Assertion::new(AssertionType::Semantic, "response", "friendly")
                .with_semantic_prompt("Is it friendly?"),
        ]);
        let result = ExecutionResult::from_counts("p", 1, 0, 0, 5, "")
            .with_captured("response", json!({"body": "Hi there!"}));

        let judgments = engine.judge(&scene, &result).await;
        assert_eq!(evaluator.calls.load(Ordering::SeqCst), 1);
        assert!(judgments[0].passed);
        assert_eq!(judgments[0].confidence, 0.8);
    }

    #[tokio::test]
    async fn test_semantic_remediation_is_kept() {
        let evaluator = Arc::new(ScriptedEvaluator {
            verdict: Ok(SemanticVerdict {
                passed: false,
                confidence: 0.9,
                reasoning: "curt".to_string(),
                remediation: Some("greet the user".to_string()),
            }),
            calls: AtomicUsize::new(0),
        });
        let engine = JudgmentEngine::new(evaluator);
        let a = Assertion::new(AssertionType::Semantic, "response", "friendly")
            .with_semantic_prompt("Is it friendly?");
        let j = engine
            .judge_assertion(0, &a, Some(&json!("No.")), &json!({}))
            .await;
        assert!(!j.passed);
        assert_eq!(j.remediation.as_deref(), Some("greet the user"));
    }

    #[tokio::test]
    async fn test_semantic_failure_becomes_failed_judgment() {
        let evaluator = Arc::new(ScriptedEvaluator {
            verdict: Err(CapabilityError::call_failed("semantic_evaluator", "boom")),
            calls: AtomicUsize::new(0),
        });
        let engine = JudgmentEngine::new(evaluator);
        let a = Assertion::new(AssertionType::Custom, "response", "x").with_semantic_prompt("?");
        let j = engine
            .judge_assertion(0, &a, Some(&json!("anything")), &json!({}))
            .await;
        assert!(!j.passed);
        assert_eq!(j.confidence, 0.0);
        assert!(j.reasoning.contains("boom"));
    }

    #[tokio::test]
    async fn test_semantic_without_evaluator_fails() {
        let engine = JudgmentEngine::deterministic_only();
        let a = Assertion::new(AssertionType::Semantic, "response", "x").with_semantic_prompt("?");
        let j = engine
            .judge_assertion(3, &a, Some(&json!("v")), &json!({}))
            .await;
        assert!(!j.passed);
        assert_eq!(j.assertion_index, 3);
    }
}
