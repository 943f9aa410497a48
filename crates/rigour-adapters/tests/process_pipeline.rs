//! Orchestrator driving a real runner process (`sh`) end to end.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rigour_adapters::{FILE_PLACEHOLDER, ProcessExecutor};
use rigour_core::testing::MockBackend;
use rigour_core::{Capabilities, Orchestrator, PipelineState, RigourConfig, RunMode};
use rigour_proto::{
    AssertionType, CapabilityError, Connection, ExecutionStatus, PlanDraft, PlanGenerator, Scene,
};
use tempfile::TempDir;

/// Emits a shell script that reports the status code stored in the scene's
/// `status` metadata.
struct ShellPlanner;

#[async_trait]
impl PlanGenerator for ShellPlanner {
    async fn plan(&self, scene: &Scene, _: &Connection) -> Result<PlanDraft, CapabilityError> {
        let status = scene
            .metadata()
            .get("status")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(200);
        let sleep = scene
            .metadata()
            .get("sleep")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.0);
        Ok(PlanDraft::new(format!(
            "sleep {sleep}\n\
             printf '{{\"target\": \"response\", \"value\": {{\"status_code\": {status}, \"body\": \"ok\"}}}}\\n' >> \"$RIGOUR_CAPTURE_FILE\"\n\
             echo 'test_scene.sh::test_call PASSED'\n\
             echo '1 passed in 0.01s'\n"
        )))
    }
}

fn scene(id: &str, status: u64) -> Scene {
    Scene::builder(format!("Scene {id}"), "calls the api")
        .with_id(id)
        .with_step("GET /health", None, None)
        .with_assertion(AssertionType::StatusCode, "response", 200)
        .with_metadata("status", status)
        .build()
        .unwrap()
}

fn orchestrator(root: &TempDir, config: &RigourConfig) -> Orchestrator {
    let executor = ProcessExecutor::new("sh", vec![FILE_PLACEHOLDER.to_string()], root.path())
        .unwrap()
        .with_extension("sh");
    Orchestrator::new(
        Capabilities::from_backend(Arc::new(MockBackend::new())).with_planner(Arc::new(ShellPlanner)),
        Arc::new(executor),
        Connection::new("http://localhost:8000"),
        config,
    )
}

#[tokio::test]
async fn captured_outcomes_drive_judgment() {
    let root = TempDir::new().unwrap();
    let mut config = RigourConfig::default();
    config.pipeline.enable_healing = false;
    let o = orchestrator(&root, &config);

    let batch = o
        .run_scenes(&[scene("ok", 200), scene("bad", 500)], RunMode::Concurrent)
        .await;

    let ok = &batch.runs[0];
    assert_eq!(ok.state, PipelineState::Complete);
    assert_eq!(ok.status(), Some(ExecutionStatus::Passed));
    assert!(ok.judgments[0].passed);
    assert_eq!(ok.children().len(), 2);

    // The runner passed, but the captured status contradicts the assertion.
    let bad = &batch.runs[1];
    assert_eq!(bad.status(), Some(ExecutionStatus::Passed));
    assert!(!bad.judgments[0].passed);
    assert!(bad.judgments[0].reasoning.contains("500"));

    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn runner_timeout_becomes_error_state() {
    let root = TempDir::new().unwrap();
    let o = orchestrator(&root, &RigourConfig::default())
        .with_execution_timeout(Duration::from_millis(200));
    let slow = Scene::builder("Slow", "never answers")
        .with_id("slow")
        .with_metadata("sleep", 5.0)
        .build()
        .unwrap();

    let run = o.run_scene(&slow).await;

    assert_eq!(run.state, PipelineState::Error);
    let result = run.final_result().unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.error_message.as_deref().unwrap().contains("timed out"));
    assert!(run.healing.is_none());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
}
