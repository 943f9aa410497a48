//! Executor double that returns scripted outcomes without spawning anything.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rigour_proto::{ExecutionRequest, ExecutionResult, ExecutionStatus, TestExecutor};
use serde_json::json;

/// Returns the next status from a cycling script for every call.
///
/// Passing results capture `response = {status_code: 200, body: "ok"}` so a
/// `status_code == 200` assertion judges as passed.
#[derive(Debug)]
pub struct ScriptedExecutor {
    script: Vec<ExecutionStatus>,
    failing_scenes: HashSet<String>,
    calls: AtomicUsize,
    unit_keys: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<ExecutionStatus>) -> Self {
        Self {
            script,
            failing_scenes: HashSet::new(),
            calls: AtomicUsize::new(0),
            unit_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(vec![ExecutionStatus::Passed])
    }

    pub fn failing() -> Self {
        Self::new(vec![ExecutionStatus::Failed])
    }

    pub fn erroring() -> Self {
        Self::new(vec![ExecutionStatus::Error])
    }

    /// Runs zero tests.
    pub fn empty() -> Self {
        Self::new(vec![ExecutionStatus::Skipped])
    }

    /// Alternates failed, passed, failed, ...
    pub fn failing_then_passing() -> Self {
        Self::new(vec![ExecutionStatus::Failed, ExecutionStatus::Passed])
    }

    /// Every execution of this scene fails, regardless of the script.
    pub fn failing_for(mut self, scene_id: impl Into<String>) -> Self {
        self.failing_scenes.insert(scene_id.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Unit keys received, in call order.
    pub fn unit_keys(&self) -> Vec<String> {
        self.unit_keys
            .lock()
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut keys) = self.unit_keys.lock() {
            keys.push(request.unit_key.clone());
        }

        let scene_id = request.plan.scene_id.as_str();

        let status = if self.failing_scenes.contains(scene_id) {
            ExecutionStatus::Failed
        } else if self.script.is_empty() {
            ExecutionStatus::Passed
        } else {
            self.script[call % self.script.len()]
        };

        let plan_id = request.plan.id;
        match status {
            ExecutionStatus::Passed => {
                ExecutionResult::from_counts(plan_id, 1, 0, 0, 5, "test_scene PASSED\n1 passed")
                    .with_captured("response", json!({"status_code": 200, "body": "ok"}))
            }
            ExecutionStatus::Failed => ExecutionResult::from_counts(
                plan_id,
                0,
                1,
                0,
                5,
                "test_scene FAILED\n1 failed",
            )
            .with_error_message("FAILED test_scene - assert 500 == 200")
            .with_captured("response", json!({"status_code": 500, "body": "boom"})),
            ExecutionStatus::Error => ExecutionResult::error(
                plan_id,
                format!("test run timed out after {}ms", request.timeout.as_millis()),
                "",
                request.timeout.as_millis() as u64,
            ),
            ExecutionStatus::Skipped => {
                ExecutionResult::from_counts(plan_id, 0, 0, 0, 1, "no tests ran")
            }
        }
    }
}
