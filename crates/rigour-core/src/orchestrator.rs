//! Pipeline Orchestrator.
//!
//! Drives each scene through plan, execute, judge, optional heal and optional
//! explore, and runs batches sequentially or concurrently. Every phase
//! recovers locally: a failing capability or runner moves that one scene to
//! `Error` and the batch carries on.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use rigour_core::{Capabilities, Orchestrator, RigourConfig, RunMode};
//! # use rigour_proto::{Connection, Scene, TestExecutor};
//! # async fn demo(capabilities: Capabilities, executor: Arc<dyn TestExecutor>, scenes: Vec<Scene>) {
//! let config = RigourConfig::default();
//! let orchestrator = Orchestrator::new(
//!     capabilities,
//!     executor,
//!     Connection::new("http://localhost:8000"),
//!     &config,
//! );
//! let batch = orchestrator.run_scenes(&scenes, RunMode::Concurrent).await;
//! println!("{} scenes, exit code {}", batch.runs.len(), batch.report().exit_code());
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rigour_proto::{
    CodeRepairer, Connection, EdgeCaseSuggester, Environment, ExecutionRequest, ExecutionResult,
    ExecutionStatus, FailureDiagnoser, JudgmentResult, PlanGenerator, Scene, SemanticEvaluator,
    TestExecutor, TestPlan,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::RigourConfig;
use crate::events::{EventSender, Phase, PhaseEvent, PipelineState, StateTransition};
use crate::exploration::{Exploration, ExplorationCoordinator};
use crate::healing::{FlakinessTracker, HealingCoordinator, HealingOutcome};
use crate::judgment::JudgmentEngine;
use crate::report::Report;

/// The five reasoning ports, injected together.
#[derive(Clone)]
pub struct Capabilities {
    pub planner: Arc<dyn PlanGenerator>,
    pub suggester: Arc<dyn EdgeCaseSuggester>,
    pub evaluator: Arc<dyn SemanticEvaluator>,
    pub diagnoser: Arc<dyn FailureDiagnoser>,
    pub repairer: Arc<dyn CodeRepairer>,
}

impl Capabilities {
    /// Uses one backend for every port.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: PlanGenerator
            + EdgeCaseSuggester
            + SemanticEvaluator
            + FailureDiagnoser
            + CodeRepairer
            + 'static,
    {
        Self {
            planner: backend.clone(),
            suggester: backend.clone(),
            evaluator: backend.clone(),
            diagnoser: backend.clone(),
            repairer: backend,
        }
    }

    /// Replaces only the plan generator.
    pub fn with_planner(mut self, planner: Arc<dyn PlanGenerator>) -> Self {
        self.planner = planner;
        self
    }
}

/// How a batch is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One scene at a time, in input order.
    #[default]
    Sequential,
    /// All scene pipelines launched together.
    Concurrent,
}

impl RunMode {
    pub fn from_parallel(parallel: bool) -> Self {
        if parallel {
            RunMode::Concurrent
        } else {
            RunMode::Sequential
        }
    }
}

/// Where and why a scene entered `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub phase: Phase,
    pub message: String,
}

/// Everything that happened to one scene during a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRun {
    pub scene: Scene,
    pub index: usize,
    pub state: PipelineState,
    pub plan: Option<TestPlan>,
    pub healed_plan: Option<TestPlan>,
    /// Every execution attempt in order. The last one is authoritative.
    pub executions: Vec<ExecutionResult>,
    /// Judgments of the latest execution.
    pub judgments: Vec<JudgmentResult>,
    /// Judgments of superseded executions, kept for audit.
    pub superseded_judgments: Vec<JudgmentResult>,
    pub healing: Option<HealingOutcome>,
    pub exploration: Option<Exploration>,
    pub error: Option<PipelineError>,
    pub flaky: bool,
    pub transitions: Vec<StateTransition>,
    pub duration_ms: u64,
}

impl SceneRun {
    fn new(scene: Scene, index: usize) -> Self {
        Self {
            scene,
            index,
            state: PipelineState::Planned,
            plan: None,
            healed_plan: None,
            executions: Vec::new(),
            judgments: Vec::new(),
            superseded_judgments: Vec::new(),
            healing: None,
            exploration: None,
            error: None,
            flaky: false,
            transitions: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn scene_id(&self) -> &str {
        self.scene.id()
    }

    /// The most recent execution, which supersedes earlier ones for reporting.
    pub fn final_result(&self) -> Option<&ExecutionResult> {
        self.executions.last()
    }

    pub fn status(&self) -> Option<ExecutionStatus> {
        self.final_result().map(|r| r.status)
    }

    /// Healing recovered the artifact and the re-run passed.
    pub fn healed(&self) -> bool {
        self.healing.as_ref().is_some_and(|h| h.recovered)
            && self.status() == Some(ExecutionStatus::Passed)
    }

    pub fn children(&self) -> &[Scene] {
        self.exploration
            .as_ref()
            .map_or(&[], |e| e.children.as_slice())
    }

    /// Failed before any execution took place.
    pub fn failed_before_execution(&self) -> bool {
        self.executions.is_empty() && self.state == PipelineState::Error
    }
}

/// Result of a batch, index-aligned with the input scenes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRun {
    pub mode: RunMode,
    pub runs: Vec<SceneRun>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl BatchRun {
    /// All child scenes produced by exploration, in scene order.
    pub fn generated_scenes(&self) -> Vec<Scene> {
        self.runs
            .iter()
            .flat_map(|r| r.children().iter().cloned())
            .collect()
    }

    pub fn report(&self) -> Report {
        Report::from_batch(self)
    }
}

pub struct Orchestrator {
    planner: Arc<dyn PlanGenerator>,
    executor: Arc<dyn TestExecutor>,
    judge: JudgmentEngine,
    healer: HealingCoordinator,
    explorer: ExplorationCoordinator,
    connection: Connection,
    environment: Environment,
    enable_healing: bool,
    enable_exploration: bool,
    execution_timeout: Duration,
    flakiness: Option<Arc<FlakinessTracker>>,
    events: Option<EventSender>,
    unit_counter: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        capabilities: Capabilities,
        executor: Arc<dyn TestExecutor>,
        connection: Connection,
        config: &RigourConfig,
    ) -> Self {
        let environment = connection.environment();
        Self {
            planner: capabilities.planner,
            executor,
            judge: JudgmentEngine::new(capabilities.evaluator),
            healer: HealingCoordinator::new(
                capabilities.diagnoser.clone(),
                capabilities.repairer.clone(),
                &config.healing,
            )
            .unwrap_or_else(|e| {
                error!(error = %e, "Timeout healing strategy unavailable");
                HealingCoordinator::repair_only(
                    capabilities.diagnoser,
                    capabilities.repairer,
                    &config.healing,
                )
            }),
            explorer: ExplorationCoordinator::new(
                capabilities.suggester,
                config.pipeline.max_edge_cases_per_scene,
            ),
            connection,
            environment,
            enable_healing: config.pipeline.enable_healing,
            enable_exploration: config.pipeline.enable_exploration,
            execution_timeout: config.executor.timeout(),
            flakiness: None,
            events: None,
            unit_counter: AtomicU64::new(0),
        }
    }

    /// Sends phase events to `sender`. Sending never blocks.
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    /// Records every execution outcome into a shared tracker.
    pub fn with_flakiness_tracker(mut self, tracker: Arc<FlakinessTracker>) -> Self {
        self.flakiness = Some(tracker);
        self
    }

    pub fn with_healing(mut self, enabled: bool) -> Self {
        self.enable_healing = enabled;
        self
    }

    pub fn with_exploration(mut self, enabled: bool) -> Self {
        self.enable_exploration = enabled;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Runs a batch and aggregates it into a report.
    pub async fn run(&self, scenes: &[Scene], mode: RunMode) -> Report {
        self.run_scenes(scenes, mode).await.report()
    }

    /// Runs every scene and returns their runs index-aligned with `scenes`.
    ///
    /// Always completes; no scene can cancel or block another.
    pub async fn run_scenes(&self, scenes: &[Scene], mode: RunMode) -> BatchRun {
        let started_at = Utc::now();
        let start = Instant::now();
        self.emit(PhaseEvent::BatchStarted {
            total: scenes.len(),
            concurrent: mode == RunMode::Concurrent,
        });
        info!(scenes = scenes.len(), ?mode, "Starting batch");

        let runs = match mode {
            RunMode::Sequential => {
                let mut runs = Vec::with_capacity(scenes.len());
                for (index, scene) in scenes.iter().enumerate() {
                    runs.push(self.run_pipeline(index, scene).await);
                }
                runs
            }
            RunMode::Concurrent => {
                join_all(
                    scenes
                        .iter()
                        .enumerate()
                        .map(|(index, scene)| self.run_pipeline(index, scene)),
                )
                .await
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        self.emit(PhaseEvent::BatchFinished {
            total: runs.len(),
            duration_ms,
        });
        info!(scenes = runs.len(), duration_ms, "Batch finished");

        BatchRun {
            mode,
            runs,
            started_at,
            duration_ms,
        }
    }

    /// Runs a single scene through the pipeline.
    pub async fn run_scene(&self, scene: &Scene) -> SceneRun {
        self.run_pipeline(0, scene).await
    }

    async fn run_pipeline(&self, index: usize, scene: &Scene) -> SceneRun {
        let start = Instant::now();
        let mut run = SceneRun::new(scene.clone(), index);

        self.drive(&mut run).await;

        run.duration_ms = start.elapsed().as_millis() as u64;
        if let Some(tracker) = &self.flakiness {
            run.flaky = tracker.is_flaky(scene.id());
        }
        self.emit(PhaseEvent::SceneFinished {
            scene_id: scene.id().to_string(),
            index,
            state: run.state,
            status: run.status(),
            healed: run.healed(),
            children: run.children().len(),
            duration_ms: run.duration_ms,
        });
        run
    }

    async fn drive(&self, run: &mut SceneRun) {
        let scene = run.scene.clone();

        // Plan
        let draft = match self.planner.plan(&scene, &self.connection).await {
            Ok(draft) => draft,
            Err(e) => return self.fail(run, Phase::Plan, e.to_string()),
        };
        let plan = match TestPlan::from_draft(&scene, draft) {
            Ok(plan) => plan,
            Err(e) => return self.fail(run, Phase::Plan, e.to_string()),
        };
        debug!(scene_id = %scene.id(), plan_id = %plan.id, "Planned");
        run.plan = Some(plan.clone());
        self.transition(run, PipelineState::Planned, None);

        // Execute
        let result = self.execute(&scene, &plan).await;
        run.executions.push(result);
        self.transition(run, PipelineState::Executed, None);

        // Judge
        self.judge_latest(run).await;
        self.transition(run, PipelineState::Judged, None);

        let Some(status) = run.status() else {
            return;
        };
        if status == ExecutionStatus::Error {
            let message = latest_error_message(run);
            return self.fail(run, Phase::Execute, message);
        }

        // Heal
        if self.enable_healing && status == ExecutionStatus::Failed {
            self.transition(run, PipelineState::Healing, None);
            let outcome = match run.final_result() {
                Some(failed) => self.healer.heal(failed, &plan.artifact).await,
                None => return,
            };
            let recovered = outcome.recovered;
            let artifact = outcome.artifact.clone();
            info!(
                scene_id = %scene.id(),
                recovered,
                strategy = outcome.strategy.as_deref().unwrap_or("none"),
                "Healing finished"
            );
            run.healing = Some(outcome);

            if recovered {
                let healed = plan.healed(artifact);
                let result = self.execute(&scene, &healed).await;
                run.healed_plan = Some(healed);
                run.executions.push(result);
                self.transition(run, PipelineState::Reexecuted, None);

                let superseded = std::mem::take(&mut run.judgments);
                run.superseded_judgments.extend(superseded);
                self.judge_latest(run).await;
                self.transition(run, PipelineState::Judged, Some("re-judged".to_string()));

                if run.status() == Some(ExecutionStatus::Error) {
                    let message = latest_error_message(run);
                    return self.fail(run, Phase::Heal, message);
                }
            }
        }

        // Explore
        if self.enable_exploration && run.status() == Some(ExecutionStatus::Passed) {
            self.transition(run, PipelineState::Exploring, None);
            let explored = match run.final_result() {
                Some(baseline) => self.explorer.explore(&scene, baseline).await,
                None => return,
            };
            match explored {
                Ok(exploration) => run.exploration = Some(exploration),
                Err(e) => return self.fail(run, Phase::Explore, e.to_string()),
            }
        }

        self.transition(run, PipelineState::Complete, None);
    }

    async fn execute(&self, scene: &Scene, plan: &TestPlan) -> ExecutionResult {
        let unit_key = self.next_unit_key(scene.id());
        debug!(scene_id = %scene.id(), plan_id = %plan.id, %unit_key, "Executing plan");
        let request = ExecutionRequest {
            plan: plan.clone(),
            environment: self.environment.clone(),
            unit_key,
            timeout: self.execution_timeout,
        };
        let result = self.executor.execute(request).await;

        if let Some(tracker) = &self.flakiness
            && !result.is_inconclusive()
        {
            tracker.record(scene.id(), result.status == ExecutionStatus::Passed);
        }
        result
    }

    async fn judge_latest(&self, run: &mut SceneRun) {
        if let Some(result) = run.executions.last() {
            run.judgments = self.judge.judge(&run.scene, result).await;
        }
    }

    /// Collision-free execution-unit name: sanitized scene id plus a counter.
    fn next_unit_key(&self, scene_id: &str) -> String {
        let n = self.unit_counter.fetch_add(1, Ordering::Relaxed);
        let slug: String = scene_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(40)
            .collect();
        format!("rigour-{slug}-{n}-")
    }

    fn fail(&self, run: &mut SceneRun, phase: Phase, message: String) {
        warn!(scene_id = %run.scene_id(), %phase, error = %message, "Scene pipeline failed");
        run.error = Some(PipelineError {
            phase,
            message: message.clone(),
        });
        self.transition(run, PipelineState::Error, Some(format!("{phase}: {message}")));
    }

    fn transition(&self, run: &mut SceneRun, to: PipelineState, detail: Option<String>) {
        let from = run.transitions.last().map(|t| t.to);
        if let Some(from) = from
            && !from.can_transition_to(to)
        {
            warn!(scene_id = %run.scene_id(), %from, %to, "Unexpected state transition");
        }

        let transition = StateTransition {
            scene_id: run.scene_id().to_string(),
            index: run.index,
            from,
            to,
            detail,
            timestamp: Utc::now(),
        };
        run.state = to;
        run.transitions.push(transition.clone());
        self.emit(PhaseEvent::Transition(transition));
    }

    fn emit(&self, event: PhaseEvent) {
        if let Some(sender) = &self.events {
            // A dropped observer is not an error for the pipeline.
            let _ = sender.send(event);
        }
    }
}

fn latest_error_message(run: &SceneRun) -> String {
    run.final_result()
        .and_then(|r| r.error_message.clone())
        .unwrap_or_else(|| "test runner reported an error".to_string())
}
