//! Capability ports backed by an agent CLI.
//!
//! Every call renders a prompt, runs the [`AgentBackend`] once, and parses
//! the reply. Replies are free text around a JSON payload or a fenced code
//! block; anything that cannot be read is a `CapabilityError::Unparseable`.

use std::fmt::Write as _;

use async_trait::async_trait;
use regex::Regex;
use rigour_proto::{
    Assertion, CapabilityError, CodeRepairer, Connection, Diagnosis, EdgeCase,
    EdgeCaseSuggester, EdgeCaseSuggestion, ExecutionResult, FailureDiagnoser, IssueType,
    PlanDraft, PlanGenerator, Scene, SceneSpec, SemanticEvaluator, SemanticVerdict, Severity,
    Step, TestCase,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::agent_backend::AgentBackend;
use crate::template_planner::test_function_name;

const PLANNER: &str = "planner";
const SUGGESTER: &str = "suggester";
const EVALUATOR: &str = "evaluator";
const DIAGNOSER: &str = "diagnoser";
const REPAIRER: &str = "repairer";
const SCENE_PARSER: &str = "scene_parser";

/// Characters of the observed value shown to the evaluator.
const ACTUAL_LIMIT: usize = 2000;
/// Characters of serialized context shown to the evaluator.
const CONTEXT_LIMIT: usize = 1000;
/// Characters of runner output shown to the diagnoser.
const OUTPUT_LIMIT: usize = 1500;

/// All five capability ports over a single agent CLI.
#[derive(Debug, Clone)]
pub struct AgentCapabilities {
    backend: AgentBackend,
    json_object: Regex,
    json_array: Regex,
    code_block: Regex,
    test_fn: Regex,
}

impl AgentCapabilities {
    pub fn new(backend: AgentBackend) -> Result<Self, regex::Error> {
        Ok(Self {
            backend,
            json_object: Regex::new(r"(?s)\{.*\}")?,
            json_array: Regex::new(r"(?s)\[.*\]")?,
            code_block: Regex::new(r"(?s)```(?:python|py)?[ \t]*\n(.*?)\n?```")?,
            test_fn: Regex::new(r"(?m)^\s*(?:async\s+)?def\s+(test_\w+)\s*\(")?,
        })
    }

    pub fn backend(&self) -> &AgentBackend {
        &self.backend
    }

    /// First JSON object in `text`, or the whole text if it parses.
    fn extract_object(&self, capability: &'static str, text: &str) -> Result<Value, CapabilityError> {
        let candidate = self
            .json_object
            .find(text)
            .map_or(text.trim(), |m| m.as_str());
        serde_json::from_str::<Value>(candidate)
            .ok()
            .filter(Value::is_object)
            .ok_or_else(|| CapabilityError::unparseable(capability, "no JSON object in reply"))
    }

    /// Code inside the first fenced block, or the bare reply when it
    /// already looks like source.
    fn extract_code(&self, capability: &'static str, text: &str) -> Result<String, CapabilityError> {
        if let Some(caps) = self.code_block.captures(text) {
            let code = caps[1].trim_end();
            if !code.trim().is_empty() {
                return Ok(format!("{code}\n"));
            }
        }
        let trimmed = text.trim();
        let looks_like_code = ["import ", "from ", "def ", "async def ", "#"]
            .iter()
            .any(|p| trimmed.starts_with(p));
        if looks_like_code {
            return Ok(format!("{trimmed}\n"));
        }
        Err(CapabilityError::unparseable(capability, "no code block in reply"))
    }

    pub fn parse_plan(&self, reply: &str) -> Result<PlanDraft, CapabilityError> {
        let artifact = self.extract_code(PLANNER, reply)?;
        let test_cases = self
            .test_fn
            .captures_iter(&artifact)
            .map(|caps| TestCase {
                id: caps[1].to_string(),
                name: caps[1].to_string(),
                description: String::new(),
                assertion_indices: Vec::new(),
            })
            .collect::<Vec<_>>();
        if test_cases.is_empty() {
            return Err(CapabilityError::unparseable(
                PLANNER,
                "generated code defines no test functions",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        let test_cases = test_cases
            .into_iter()
            .filter(|c| seen.insert(c.id.clone()))
            .collect();
        Ok(PlanDraft {
            test_cases,
            dependencies: vec!["pytest".to_string(), "httpx".to_string()],
            ..PlanDraft::new(artifact)
        })
    }

    pub fn parse_suggestion(&self, reply: &str) -> Result<EdgeCaseSuggestion, CapabilityError> {
        let (reasoning, items) = match self.extract_object(SUGGESTER, reply) {
            Ok(Value::Object(obj)) if obj.contains_key("edge_cases") || obj.contains_key("edgeCases") => {
                let reasoning = string_field(&obj, &["reasoning"]).unwrap_or_default();
                let items = obj
                    .get("edge_cases")
                    .or_else(|| obj.get("edgeCases"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                (reasoning, items)
            }
            _ => {
                let items = self
                    .json_array
                    .find(reply)
                    .and_then(|m| serde_json::from_str::<Vec<Value>>(m.as_str()).ok())
                    .ok_or_else(|| {
                        CapabilityError::unparseable(SUGGESTER, "no edge case list in reply")
                    })?;
                (String::new(), items)
            }
        };

        let edge_cases: Vec<EdgeCase> = items.iter().filter_map(edge_case_from_value).collect();
        if edge_cases.len() < items.len() {
            debug!(
                dropped = items.len() - edge_cases.len(),
                "Ignoring edge case entries without a name"
            );
        }
        Ok(EdgeCaseSuggestion {
            reasoning,
            edge_cases,
        })
    }

    pub fn parse_verdict(&self, reply: &str) -> Result<SemanticVerdict, CapabilityError> {
        let value = self.extract_object(EVALUATOR, reply)?;
        let Value::Object(obj) = value else {
            return Err(CapabilityError::unparseable(EVALUATOR, "verdict is not an object"));
        };
        let passed = obj
            .get("passed")
            .and_then(Value::as_bool)
            .ok_or_else(|| CapabilityError::unparseable(EVALUATOR, "verdict has no 'passed' flag"))?;
        let mut confidence = obj
            .get("confidence")
            .or_else(|| obj.get("score"))
            .and_then(Value::as_f64)
            .unwrap_or(if passed { 1.0 } else { 0.0 });
        if confidence > 1.0 && confidence <= 100.0 {
            confidence /= 100.0;
        }
        let remediation = string_field(&obj, &["remediation"]).or_else(|| {
            obj.get("suggestions")
                .and_then(Value::as_array)
                .and_then(|s| s.first())
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        Ok(SemanticVerdict {
            passed,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: string_field(&obj, &["reasoning"]).unwrap_or_default(),
            remediation,
        })
    }

    pub fn parse_diagnosis(&self, reply: &str) -> Result<Diagnosis, CapabilityError> {
        let Value::Object(obj) = self.extract_object(DIAGNOSER, reply)? else {
            return Err(CapabilityError::unparseable(DIAGNOSER, "diagnosis is not an object"));
        };
        let issue_type = string_field(&obj, &["issue_type", "failure_type", "type"])
            .map_or(IssueType::Unknown, |s| IssueType::parse_lenient(&s));
        let severity = string_field(&obj, &["severity"])
            .map_or(Severity::Medium, |s| Severity::parse_lenient(&s));
        let recommendations = obj
            .get("recommendations")
            .or_else(|| obj.get("suggested_fixes"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let affected_assertions = obj
            .get("affected_assertions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_u64)
                    .map(|i| i as usize)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Diagnosis {
            issue_type,
            severity,
            root_cause: string_field(&obj, &["root_cause", "cause"])
                .unwrap_or_else(|| "Unknown".to_string()),
            affected_assertions,
            recommendations,
            is_flaky: obj.get("is_flaky").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Reads a scene from a JSON reply.
    ///
    /// A missing description falls back to `text`, and a semantic or custom
    /// assertion without a prompt uses its expected value as the prompt.
    pub fn parse_scene(&self, reply: &str, text: &str) -> Result<Scene, CapabilityError> {
        let mut value = self.extract_object(SCENE_PARSER, reply)?;
        if let Some(inner) = value.get("scene").filter(|v| v.is_object()) {
            value = inner.clone();
        }
        let mut spec: SceneSpec = serde_json::from_value(value)
            .map_err(|e| CapabilityError::unparseable(SCENE_PARSER, e.to_string()))?;

        if spec.description.trim().is_empty() {
            spec.description = text.trim().to_string();
        }
        for assertion in &mut spec.assertions {
            if assertion.assertion_type.is_qualitative() && assertion.semantic_prompt.is_none() {
                assertion.semantic_prompt = match &assertion.expected {
                    Value::String(expected) => Some(expected.clone()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                };
            }
        }

        Scene::try_from(spec)
            .map_err(|e| CapabilityError::unparseable(SCENE_PARSER, format!("invalid scene: {e}")))
    }

    /// Turns a plain-language test description into a scene.
    pub async fn scene_from_text(&self, text: &str) -> Result<Scene, CapabilityError> {
        let reply = self.backend.run(SCENE_PARSER, &scene_prompt(text)).await?;
        let scene = self.parse_scene(&reply, text)?;
        debug!(scene_id = %scene.id(), steps = scene.steps().len(), "Parsed scene from text");
        Ok(scene)
    }
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

/// Reads one suggested edge case leniently. Steps may be plain strings;
/// malformed assertions are dropped. Entries without a name are skipped.
fn edge_case_from_value(value: &Value) -> Option<EdgeCase> {
    let obj = value.as_object()?;
    let name = string_field(obj, &["name", "title"]).filter(|n| !n.trim().is_empty())?;

    let mut description = string_field(obj, &["description"]).unwrap_or_default();
    if let Some(expected) = string_field(obj, &["expected_behavior"]) {
        if !description.is_empty() {
            description.push('\n');
        }
        let _ = write!(description, "Expected: {expected}");
    }

    let steps = obj
        .get("steps")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| match item {
                    Value::String(action) => Some(Step::new(action.clone())),
                    other => serde_json::from_value::<Step>(other.clone()).ok(),
                })
                .collect()
        })
        .unwrap_or_default();

    let assertions = obj
        .get("assertions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Assertion>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();

    Some(EdgeCase {
        name,
        category: string_field(obj, &["category", "focus"]).unwrap_or_default(),
        description,
        priority: string_field(obj, &["priority"]).unwrap_or_default(),
        steps,
        assertions,
    })
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn plan_prompt(scene: &Scene, connection: &Connection) -> String {
    let mut prompt = String::from("Generate a Python pytest test module for this test scenario.\n\n");
    let _ = writeln!(prompt, "Test Title: {}", scene.title());
    let _ = writeln!(prompt, "Description: {}", scene.description());
    let _ = writeln!(prompt, "Base URL: {}", connection.base_url);
    if let Some(actor) = scene.actor() {
        let _ = writeln!(prompt, "Actor Role: {}", actor.role);
    }

    if !scene.steps().is_empty() {
        prompt.push_str("Steps:\n");
        for (i, step) in scene.steps().iter().enumerate() {
            let _ = write!(prompt, "  {}. {}", i + 1, step.action);
            if let Some(input) = &step.input {
                let _ = write!(prompt, " with {input}");
            }
            if let Some(expect) = &step.expect {
                let _ = write!(prompt, " (expect: {expect})");
            }
            prompt.push('\n');
        }
    }
    if !scene.assertions().is_empty() {
        prompt.push_str("Assertions:\n");
        for assertion in scene.assertions() {
            let _ = writeln!(
                prompt,
                "  - {}: {} == {}",
                assertion.assertion_type, assertion.target, assertion.expected
            );
        }
    }

    let _ = write!(
        prompt,
        "
Requirements:
1. Use httpx for HTTP requests; read the base URL from the RIGOUR_BASE_URL environment variable
2. Include every assertion listed above as a pytest assert
3. After each request, record the response by appending one JSON line
   {{\"target\": \"response\", \"value\": {{\"status_code\": ..., \"body\": ..., \"headers\": {{...}}, \"duration_ms\": ...}}}}
   to the file named by the RIGOUR_CAPTURE_FILE environment variable
4. Make it production-quality, not a stub
5. Name the main test function {}
6. Return the code in a single ```python fenced block

Generate the test module now:",
        test_function_name(scene)
    );
    prompt
}

pub fn suggest_prompt(scene: &Scene, result: &ExecutionResult, focus: &[String]) -> String {
    let mut prompt =
        String::from("Analyze this passing test scenario and suggest specific, actionable edge cases.\n\n");
    let _ = writeln!(prompt, "Title: {}", scene.title());
    let _ = writeln!(prompt, "Description: {}", scene.description());
    if let Some(actor) = scene.actor() {
        let _ = writeln!(prompt, "Actor Role: {}", actor.role);
    }
    for step in scene.steps() {
        let _ = writeln!(prompt, "Step: {}", step.action);
    }
    let _ = writeln!(
        prompt,
        "Last run: {} ({} passed, {} failed)",
        result.status, result.passed_count, result.failed_count
    );
    if !scene.edge_case_hints().is_empty() {
        let _ = writeln!(prompt, "Author hints: {}", scene.edge_case_hints().join("; "));
    }
    if !focus.is_empty() {
        let _ = writeln!(prompt, "Focus areas: {}", focus.join(", "));
    }
    prompt.push_str(
        "
Cover boundary values, authentication and authorization, timing and concurrency,
data shape (null fields, duplicates, unicode), state ordering, business limits,
input validation (injection) and integration failures.

Return JSON: {\"reasoning\": \"...\", \"edge_cases\": [{\"name\": \"...\", \"category\": \"...\",
\"description\": \"...\", \"priority\": \"critical|high|medium|low\",
\"steps\": [{\"action\": \"POST /path\", \"input\": {...}}],
\"assertions\": [{\"type\": \"status_code\", \"target\": \"response\", \"expected\": 400}]}]}
Be specific with actual values and payloads.",
    );
    prompt
}

pub fn evaluate_prompt(assertion: &Assertion, actual: &Value, context: &Value) -> String {
    let actual_text = match actual {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let context_text = context.to_string();
    format!(
        "Evaluate whether this output satisfies the criterion.

Criterion ({kind}): {criterion}
Expected: {expected}

Actual output:
{actual}

Context:
{context}

Return JSON: {{\"passed\": true|false, \"confidence\": 0.0-1.0, \"reasoning\": \"...\", \"remediation\": \"...\"}}",
        kind = assertion.assertion_type,
        criterion = assertion.semantic_prompt.as_deref().unwrap_or(&assertion.target),
        expected = assertion.expected,
        actual = truncate(&actual_text, ACTUAL_LIMIT),
        context = truncate(&context_text, CONTEXT_LIMIT),
    )
}

pub fn diagnose_prompt(result: &ExecutionResult) -> String {
    let kinds: Vec<&str> = IssueType::all().iter().map(|i| i.as_str()).collect();
    format!(
        "Analyze this test failure and provide a root cause diagnosis.

Plan: {plan}
Status: {status}
Counts: {passed} passed, {failed} failed
Error: {error}
Output:
{output}

Return JSON: {{
    \"issue_type\": one of {kinds:?},
    \"severity\": \"critical|high|medium|low\",
    \"root_cause\": \"...\",
    \"affected_assertions\": [indices],
    \"recommendations\": [\"most important first\"],
    \"is_flaky\": bool
}}",
        plan = result.plan_id,
        status = result.status,
        passed = result.passed_count,
        failed = result.failed_count,
        error = result.error_message.as_deref().unwrap_or("none"),
        output = truncate(&result.output, OUTPUT_LIMIT),
    )
}

pub fn scene_prompt(text: &str) -> String {
    format!(
        "Convert this test description into a JSON test scene.

Test description:
{text}

Schema:
{{
  \"title\": \"short title\",
  \"description\": \"the original description\",
  \"actor\": {{\"role\": \"admin|user|anonymous|api_client\", \"persona\": \"optional\"}},
  \"steps\": [{{\"action\": \"HTTP verb + path, e.g. POST /users\", \"input\": {{}}, \"expect\": \"expected outcome\"}}],
  \"assertions\": [{{\"type\": \"status_code|body_contains|body_schema|db_state|response_time|header_contains|semantic|custom\",
                   \"target\": \"response or step_N\", \"expected\": \"any\", \"semantic_prompt\": \"for semantic/custom\"}}],
  \"edge_cases\": [\"edge case hint\"],
  \"tags\": [\"tag\"],
  \"priority\": \"critical|high|medium|low\"
}}

Return ONLY the JSON object."
    )
}

pub fn repair_prompt(diagnosis: &Diagnosis, artifact: &str) -> String {
    format!(
        "Fix this test code based on the diagnosis.

Root Cause: {root}
Issue Type: {issue}
Is Flaky: {flaky}
Recommendations: {recs}

Original Test Code:
```python
{artifact}
```

Return the complete corrected module in a single ```python fenced block.
Keep the test function names and the response capture lines unchanged.",
        root = diagnosis.root_cause,
        issue = diagnosis.issue_type,
        flaky = diagnosis.is_flaky,
        recs = diagnosis.recommendations.join("; "),
    )
}

#[async_trait]
impl PlanGenerator for AgentCapabilities {
    async fn plan(
        &self,
        scene: &Scene,
        connection: &Connection,
    ) -> Result<PlanDraft, CapabilityError> {
        let reply = self.backend.run(PLANNER, &plan_prompt(scene, connection)).await?;
        self.parse_plan(&reply)
    }
}

#[async_trait]
impl EdgeCaseSuggester for AgentCapabilities {
    async fn suggest(
        &self,
        scene: &Scene,
        result: &ExecutionResult,
        focus: &[String],
    ) -> Result<EdgeCaseSuggestion, CapabilityError> {
        let reply = self
            .backend
            .run(SUGGESTER, &suggest_prompt(scene, result, focus))
            .await?;
        self.parse_suggestion(&reply)
    }
}

#[async_trait]
impl SemanticEvaluator for AgentCapabilities {
    async fn evaluate(
        &self,
        assertion: &Assertion,
        actual: &Value,
        context: &Value,
    ) -> Result<SemanticVerdict, CapabilityError> {
        let reply = self
            .backend
            .run(EVALUATOR, &evaluate_prompt(assertion, actual, context))
            .await?;
        self.parse_verdict(&reply)
    }
}

#[async_trait]
impl FailureDiagnoser for AgentCapabilities {
    async fn diagnose(&self, result: &ExecutionResult) -> Result<Diagnosis, CapabilityError> {
        let reply = self.backend.run(DIAGNOSER, &diagnose_prompt(result)).await?;
        self.parse_diagnosis(&reply)
    }
}

#[async_trait]
impl CodeRepairer for AgentCapabilities {
    async fn repair(
        &self,
        diagnosis: &Diagnosis,
        artifact: &str,
    ) -> Result<String, CapabilityError> {
        let reply = self
            .backend
            .run(REPAIRER, &repair_prompt(diagnosis, artifact))
            .await?;
        let code = self.extract_code(REPAIRER, &reply)?;
        if code.trim() == artifact.trim() {
            warn!("Repairer returned the artifact unchanged");
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigour_core::PromptMode;
    use rigour_proto::{AssertionType, ExecutionStatus};
    use serde_json::json;
    use std::time::Duration;

    fn caps() -> AgentCapabilities {
        AgentCapabilities::new(AgentBackend::claude()).unwrap()
    }

    /// Backend that swallows the prompt and prints a fixed reply.
    fn replying(reply: &str) -> AgentCapabilities {
        AgentCapabilities::new(AgentBackend {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), format!("cat >/dev/null; printf '%s' '{reply}'")],
            prompt_mode: PromptMode::Stdin,
            prompt_flag: None,
            timeout: Duration::from_secs(10),
        })
        .unwrap()
    }

    fn scene() -> Scene {
        Scene::builder("Login", "User logs in")
            .with_id("login-happy-path")
            .with_step("POST /login", Some(json!({"user": "a"})), Some("200"))
            .with_assertion(AssertionType::StatusCode, "response", 200)
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_plan_from_fenced_block() {
        let reply = "Here you go:\n```python\nimport httpx\n\ndef test_login():\n    assert True\n\ndef test_logout():\n    pass\n```\nDone.";
        let draft = caps().parse_plan(reply).unwrap();
        assert!(draft.artifact.starts_with("import httpx"));
        assert!(!draft.artifact.contains("```"));
        let ids: Vec<_> = draft.test_cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["test_login", "test_logout"]);
    }

    #[test]
    fn test_parse_plan_bare_code_and_prose() {
        assert!(caps().parse_plan("def test_x():\n    assert 1\n").is_ok());
        let err = caps().parse_plan("I cannot do that.").unwrap_err();
        assert!(matches!(err, CapabilityError::Unparseable { .. }));
        let err = caps().parse_plan("```python\nx = 1\n```").unwrap_err();
        assert!(err.to_string().contains("no test functions"));
    }

    #[test]
    fn test_parse_suggestion_object_and_bare_array() {
        let reply = r#"Sure. {"reasoning": "auth", "edge_cases": [
            {"name": "Expired token", "category": "authentication", "priority": "high",
             "steps": ["POST /login", {"action": "GET /me"}],
             "assertions": [{"type": "status_code", "target": "response", "expected": 401},
                            {"type": "nonsense"}]},
            {"description": "no name"}
        ]}"#;
        let suggestion = caps().parse_suggestion(reply).unwrap();
        assert_eq!(suggestion.reasoning, "auth");
        assert_eq!(suggestion.edge_cases.len(), 1);
        let case = &suggestion.edge_cases[0];
        assert_eq!(case.steps.len(), 2);
        assert_eq!(case.steps[1].action, "GET /me");
        assert_eq!(case.assertions.len(), 1);

        let array = r#"[{"name": "Empty body", "focus": "boundary", "expected_behavior": "400"}]"#;
        let suggestion = caps().parse_suggestion(array).unwrap();
        assert_eq!(suggestion.edge_cases[0].category, "boundary");
        assert_eq!(suggestion.edge_cases[0].description, "Expected: 400");

        assert!(caps().parse_suggestion("nothing here").is_err());
    }

    #[test]
    fn test_parse_verdict_accepts_score() {
        let v = caps()
            .parse_verdict(r#"{"passed": false, "score": 35, "reasoning": "rude", "suggestions": ["be polite"]}"#)
            .unwrap();
        assert!(!v.passed);
        assert!((v.confidence - 0.35).abs() < 1e-9);
        assert_eq!(v.remediation.as_deref(), Some("be polite"));

        assert!(caps().parse_verdict(r#"{"score": 1}"#).is_err());
    }

    #[test]
    fn test_parse_diagnosis_aliases() {
        let d = caps()
            .parse_diagnosis(r#"{"root_cause": "slow", "failure_type": "timeout", "is_flaky": true,
                "suggested_fixes": ["raise timeout"]}"#)
            .unwrap();
        assert_eq!(d.issue_type, IssueType::Timeout);
        assert_eq!(d.severity, Severity::Medium);
        assert!(d.is_flaky);
        assert_eq!(d.recommendations, ["raise timeout"]);

        let d = caps()
            .parse_diagnosis(r#"{"issue_type": "gremlins", "severity": "CRITICAL"}"#)
            .unwrap();
        assert_eq!(d.issue_type, IssueType::Unknown);
        assert_eq!(d.severity, Severity::Critical);
        assert_eq!(d.root_cause, "Unknown");
    }

    #[test]
    fn test_prompts_carry_scene_details() {
        let prompt = plan_prompt(&scene(), &Connection::new("http://api.test"));
        assert!(prompt.contains("Base URL: http://api.test"));
        assert!(prompt.contains("1. POST /login"));
        assert!(prompt.contains("status_code: response == 200"));
        assert!(prompt.contains("test_login_happy_path"));

        let result = ExecutionResult::from_counts("p", 1, 0, 0, 5, "ok");
        let prompt = suggest_prompt(&scene(), &result, &["timeout".to_string()]);
        assert!(prompt.contains("Focus areas: timeout"));
    }

    #[test]
    fn test_evaluate_prompt_truncates() {
        let assertion = Assertion::new(AssertionType::Semantic, "response", "polite")
            .with_semantic_prompt("Is it polite?");
        let actual = Value::String("x".repeat(5000));
        let prompt = evaluate_prompt(&assertion, &actual, &json!({}));
        assert!(prompt.contains("Is it polite?"));
        assert!(!prompt.contains(&"x".repeat(ACTUAL_LIMIT + 1)));
    }

    #[test]
    fn test_parse_scene_fills_gaps() {
        let reply = r#"```json
{"title": "Signup", "steps": [{"action": "POST /users", "input": {"email": "a@b.c"}}],
 "assertions": [{"type": "status_code", "target": "step_1", "expected": 201},
                {"type": "semantic", "target": "step_1", "expected": "welcomes the user"}],
 "priority": "high"}
```"#;
        let scene = caps().parse_scene(reply, "A visitor signs up").unwrap();
        assert_eq!(scene.title(), "Signup");
        assert_eq!(scene.description(), "A visitor signs up");
        assert_eq!(scene.steps()[0].action, "POST /users");
        assert_eq!(
            scene.assertions()[1].semantic_prompt.as_deref(),
            Some("welcomes the user")
        );
    }

    #[test]
    fn test_parse_scene_rejects_invalid() {
        let err = caps().parse_scene("no json", "x").unwrap_err();
        assert!(matches!(err, CapabilityError::Unparseable { .. }));

        let err = caps()
            .parse_scene(r#"{"title": "", "description": "d"}"#, "x")
            .unwrap_err();
        assert!(err.to_string().contains("invalid scene"));
    }

    #[tokio::test]
    async fn test_scene_from_text_through_backend() {
        let caps = replying(r#"{"scene": {"title": "Health", "description": "up", "steps": [{"action": "GET /health"}]}}"#);
        let scene = caps.scene_from_text("the service is up").await.unwrap();
        assert_eq!(scene.title(), "Health");
        assert_eq!(scene.steps().len(), 1);
    }

    #[tokio::test]
    async fn test_diagnose_through_backend() {
        let caps = replying(r#"{"issue_type": "assertion_mismatch", "severity": "low", "root_cause": "wrong code"}"#);
        let result = ExecutionResult::from_counts("p", 0, 1, 0, 5, "1 failed");
        assert_eq!(result.status, ExecutionStatus::Failed);
        let d = caps.diagnose(&result).await.unwrap();
        assert_eq!(d.issue_type, IssueType::AssertionMismatch);
        assert_eq!(d.severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_plan_through_backend_failure() {
        let caps = AgentCapabilities::new(AgentBackend {
            command: "false".to_string(),
            args: vec![],
            prompt_mode: PromptMode::Arg,
            prompt_flag: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let err = caps
            .plan(&scene(), &Connection::new("http://api.test"))
            .await
            .unwrap_err();
        assert_eq!(err.capability(), "planner");
    }
}
