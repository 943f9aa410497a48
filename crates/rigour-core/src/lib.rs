//! # rigour-core
//!
//! Core pipeline for the Rigour test orchestrator.
//!
//! This crate provides:
//! - The Pipeline Orchestrator with its per-scene state machine and batch modes
//! - The Judgment Engine (deterministic rules plus delegated semantic checks)
//! - The Healing Coordinator and its ordered strategy list
//! - The Exploration Coordinator that materializes edge-case child scenes
//! - Phase-transition events, configuration and report aggregation

mod config;
pub mod events;
pub mod exploration;
pub mod healing;
pub mod judgment;
mod orchestrator;
mod report;
pub mod testing;

pub use config::{
    BackendConfig, ConfigError, ExecutorConfig, HealingConfig, PipelineConfig, PromptMode,
    RigourConfig,
};
pub use events::{Phase, PhaseEvent, PipelineState, StateTransition};
pub use exploration::{Exploration, ExplorationCoordinator, RejectedEdgeCase, focus_areas};
pub use healing::{
    FlakinessTracker, HealingCoordinator, HealingOutcome, HealingStrategy, RepairStrategy,
    TimeoutStrategy,
};
pub use judgment::JudgmentEngine;
pub use orchestrator::{
    BatchRun, Capabilities, Orchestrator, PipelineError, RunMode, SceneRun,
};
pub use report::{Report, ReportSummary, SceneReport};
