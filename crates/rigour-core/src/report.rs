//! Batch report: the immutable, exportable summary of one run.

use chrono::{DateTime, Utc};
use rigour_proto::{ExecutionResult, ExecutionStatus, JudgmentResult, Scene};
use serde::{Deserialize, Serialize};

use crate::events::{Phase, PipelineState};
use crate::orchestrator::{BatchRun, RunMode, SceneRun};

/// Aggregate counts over the scenes of a batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Scenes whose plan failed or whose final execution errored.
    pub errored: usize,
    pub healed: usize,
    pub edge_cases_generated: usize,
    /// `passed / total`, 0 for an empty batch.
    pub pass_rate: f64,
    pub duration_ms: u64,
}

/// One row of the report per input scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneReport {
    pub scene_id: String,
    pub title: String,
    pub state: PipelineState,
    /// Final execution status; `None` when the scene never executed.
    pub status: Option<ExecutionStatus>,
    pub attempts: usize,
    pub judgments_passed: usize,
    pub judgments_total: usize,
    pub healed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healing_strategy: Option<String>,
    pub flaky: bool,
    pub children: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SceneReport {
    fn from_run(run: &SceneRun) -> Self {
        Self {
            scene_id: run.scene_id().to_string(),
            title: run.scene.title().to_string(),
            state: run.state,
            status: run.status(),
            attempts: run.executions.len(),
            judgments_passed: run.judgments.iter().filter(|j| j.passed).count(),
            judgments_total: run.judgments.len(),
            healed: run.healed(),
            healing_strategy: run.healing.as_ref().and_then(|h| h.strategy.clone()),
            flaky: run.flaky,
            children: run.children().iter().map(|c| c.id().to_string()).collect(),
            error_phase: run.error.as_ref().map(|e| e.phase),
            error: run.error.as_ref().map(|e| e.message.clone()),
            duration_ms: run.duration_ms,
        }
    }

    /// Counts against the exit code: never executed, or ended failed/errored.
    pub fn is_failure(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status.is_failure(),
        }
    }
}

/// Report of one batch run. Created once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: RunMode,
    pub summary: ReportSummary,
    pub scenes: Vec<SceneReport>,
    /// Final execution of each scene that executed, in scene order.
    pub results: Vec<ExecutionResult>,
    /// Every execution including superseded pre-heal attempts.
    pub audit: Vec<ExecutionResult>,
    /// Latest judgments of every scene, in scene order.
    pub judgments: Vec<JudgmentResult>,
    /// Child scenes produced by exploration, not yet executed.
    pub generated_scenes: Vec<Scene>,
}

impl Report {
    pub fn from_batch(batch: &BatchRun) -> Self {
        let scenes: Vec<SceneReport> = batch.runs.iter().map(SceneReport::from_run).collect();

        let mut summary = ReportSummary {
            total: scenes.len(),
            duration_ms: batch.duration_ms,
            ..Default::default()
        };
        for scene in &scenes {
            match scene.status {
                Some(ExecutionStatus::Passed) => summary.passed += 1,
                Some(ExecutionStatus::Failed) => summary.failed += 1,
                Some(ExecutionStatus::Skipped) => summary.skipped += 1,
                Some(ExecutionStatus::Error) | None => summary.errored += 1,
            }
            if scene.healed {
                summary.healed += 1;
            }
            summary.edge_cases_generated += scene.children.len();
        }
        if summary.total > 0 {
            summary.pass_rate = summary.passed as f64 / summary.total as f64;
        }

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: batch.started_at,
            mode: batch.mode,
            summary,
            scenes,
            results: batch
                .runs
                .iter()
                .filter_map(|r| r.final_result().cloned())
                .collect(),
            audit: batch
                .runs
                .iter()
                .flat_map(|r| r.executions.iter().cloned())
                .collect(),
            judgments: batch
                .runs
                .iter()
                .flat_map(|r| r.judgments.iter().cloned())
                .collect(),
            generated_scenes: batch.generated_scenes(),
        }
    }

    pub fn healed_count(&self) -> usize {
        self.summary.healed
    }

    /// 0 when no scene failed planning or ended failed/errored, else 1.
    ///
    /// Exploration failures do not count: the scene's tests passed.
    pub fn exit_code(&self) -> i32 {
        i32::from(self.scenes.iter().any(SceneReport::is_failure))
    }

    pub fn failures(&self) -> impl Iterator<Item = &SceneReport> {
        self.scenes.iter().filter(|s| s.is_failure())
    }
}
