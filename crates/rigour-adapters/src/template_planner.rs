//! Offline plan generator: renders a pytest/httpx module straight from a
//! scene's steps and assertions, without calling any agent.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use async_trait::async_trait;
use regex::Regex;
use rigour_proto::{
    AssertionType, CapabilityError, Connection, PlanDraft, PlanGenerator, Scene, TestCase,
};
use serde_json::Value;

const PRELUDE: &str = r#"import json
import os
import time

import httpx

BASE_URL = os.environ.get("RIGOUR_BASE_URL", {base_url})
HEADERS = json.loads(os.environ.get("RIGOUR_HEADERS", "{}"))


def _body(response):
    try:
        return response.json()
    except ValueError:
        return response.text


def _capture(targets, response, started):
    value = {
        "status_code": response.status_code,
        "body": _body(response),
        "headers": dict(response.headers),
        "duration_ms": (time.monotonic() - started) * 1000,
    }
    path = os.environ.get("RIGOUR_CAPTURE_FILE")
    for target in targets:
        line = json.dumps({"target": target, "value": value})
        if path:
            with open(path, "a") as fh:
                fh.write(line + "\n")
        print("RIGOUR_CAPTURE", target, json.dumps(value))
"#;

/// Renders pytest code from `METHOD /path` steps.
#[derive(Debug, Clone)]
pub struct TemplatePlanGenerator {
    http_step: Regex,
    wait_step: Regex,
}

impl TemplatePlanGenerator {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            http_step: Regex::new(r"(?i)^\s*(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS)\s+(\S+)")?,
            wait_step: Regex::new(r"(?i)^\s*(?:wait|sleep)\s+(\d+(?:\.\d+)?)\s*(ms|s)?\b")?,
        })
    }

    /// Builds the artifact for `scene`. Scenes without an HTTP step get a
    /// single `GET /` so there is always something to observe.
    pub fn render(&self, scene: &Scene, connection: &Connection) -> Result<PlanDraft, CapabilityError> {
        let timeout_secs = connection.timeout_ms as f64 / 1000.0;
        let base_url = python_literal(&Value::String(
            connection.base_url.trim_end_matches('/').to_string(),
        ));

        let mut code = PRELUDE.replace("{base_url}", &base_url);
        let name = test_function_name(scene);

        let extra_targets: BTreeSet<&str> = scene
            .assertions()
            .iter()
            .map(|a| a.target.as_str())
            .filter(|t| *t != "response" && !is_step_target(t))
            .collect();

        let _ = write!(
            code,
            "\n\ndef {name}():\n    \"\"\"{doc}\"\"\"\n    responses = {{}}\n    with httpx.Client(base_url=BASE_URL, headers=HEADERS, timeout={timeout_secs:?}) as client:\n",
            doc = scene.title().replace('"', "'"),
        );

        let mut http_steps = 0usize;
        for step in scene.steps() {
            if let Some(caps) = self.http_step.captures(&step.action) {
                http_steps += 1;
                let method = caps[1].to_ascii_lowercase();
                let path = python_literal(&Value::String(caps[2].to_string()));
                let body = match &step.input {
                    Some(input) if method != "get" && method != "head" => {
                        format!(", json={}", python_literal(input))
                    }
                    Some(Value::Object(params)) => {
                        format!(", params={}", python_literal(&Value::Object(params.clone())))
                    }
                    _ => String::new(),
                };
                let _ = writeln!(code, "        started = time.monotonic()");
                let _ = writeln!(code, "        response = client.{method}({path}{body})");
                let _ = writeln!(
                    code,
                    "        _capture([\"response\", \"step_{http_steps}\"], response, started)"
                );
                let _ = writeln!(code, "        responses[\"step_{http_steps}\"] = response");
            } else if let Some(caps) = self.wait_step.captures(&step.action) {
                let amount: f64 = caps[1].parse().unwrap_or(0.0);
                let secs = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
                    Some(unit) if unit == "ms" => amount / 1000.0,
                    _ => amount,
                };
                let _ = writeln!(code, "        time.sleep({secs:?})");
            } else {
                let _ = writeln!(code, "        # {}", step.action.replace('\n', " "));
            }
        }

        if http_steps == 0 {
            http_steps = 1;
            code.push_str("        started = time.monotonic()\n");
            code.push_str("        response = client.get(\"/\")\n");
            code.push_str("        _capture([\"response\", \"step_1\"], response, started)\n");
            code.push_str("        responses[\"step_1\"] = response\n");
        }

        if !extra_targets.is_empty() {
            let targets: Vec<String> = extra_targets
                .iter()
                .map(|t| python_literal(&Value::String((*t).to_string())))
                .collect();
            let _ = writeln!(code, "        _capture([{}], response, started)", targets.join(", "));
        }

        let mut covered = Vec::new();
        for (index, assertion) in scene.assertions().iter().enumerate() {
            let subject = if is_step_target(&assertion.target) {
                format!("responses[{}]", python_literal(&Value::String(assertion.target.clone())))
            } else {
                "response".to_string()
            };
            match assertion.assertion_type {
                AssertionType::StatusCode => {
                    let _ = writeln!(
                        code,
                        "    assert {subject}.status_code == {}",
                        python_literal(&assertion.expected)
                    );
                    covered.push(index);
                }
                AssertionType::BodyContains => {
                    let needle = match &assertion.expected {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let _ = writeln!(
                        code,
                        "    assert {} in {subject}.text",
                        python_literal(&Value::String(needle))
                    );
                    covered.push(index);
                }
                _ => {}
            }
        }
        if covered.is_empty() {
            code.push_str("    assert response is not None\n");
        }

        Ok(PlanDraft {
            test_cases: vec![TestCase {
                id: name.clone(),
                name,
                description: scene.description().to_string(),
                assertion_indices: covered,
            }],
            dependencies: vec!["pytest".to_string(), "httpx".to_string()],
            estimated_duration_ms: http_steps as u64 * connection.timeout_ms.min(1000),
            ..PlanDraft::new(code)
        })
    }
}

#[async_trait]
impl PlanGenerator for TemplatePlanGenerator {
    async fn plan(
        &self,
        scene: &Scene,
        connection: &Connection,
    ) -> Result<PlanDraft, CapabilityError> {
        self.render(scene, connection)
    }
}

fn is_step_target(target: &str) -> bool {
    target
        .strip_prefix("step_")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// `test_` plus the scene id, underscored and cut to 20 characters.
pub fn test_function_name(scene: &Scene) -> String {
    let slug: String = scene
        .id()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .take(20)
        .collect();
    format!("test_{slug}")
}

/// Renders a JSON value as a Python literal.
pub fn python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(python_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", Value::String(k.clone()), python_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}
