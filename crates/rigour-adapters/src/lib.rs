//! # rigour-adapters
//!
//! Concrete implementations of the Rigour ports:
//! - [`ProcessExecutor`] runs generated artifacts with an external test runner
//!   (pytest by default) in an isolated, self-cleaning work unit
//! - [`AgentBackend`] and [`AgentCapabilities`] drive an agent CLI (Claude by
//!   default) for planning, edge-case suggestion, semantic evaluation,
//!   diagnosis and repair, and for turning plain-language descriptions into
//!   scenes
//! - [`TemplatePlanGenerator`] renders plans offline from a scene's steps
//!
//! The output grammar shared by executors lives in [`output_parser`].

mod agent_backend;
mod agent_capabilities;
pub mod output_parser;
mod process_executor;
mod template_planner;

use std::sync::Arc;

use rigour_core::{Capabilities, RigourConfig};
use rigour_proto::ExecutionError;
use thiserror::Error;

pub use agent_backend::AgentBackend;
pub use agent_capabilities::{
    AgentCapabilities, diagnose_prompt, evaluate_prompt, plan_prompt, repair_prompt,
    scene_prompt, suggest_prompt,
};
pub use output_parser::{CAPTURE_PREFIX, OutputParser, ParsedOutput};
pub use process_executor::{FILE_PLACEHOLDER, ProcessExecutor};
pub use template_planner::{TemplatePlanGenerator, python_literal, test_function_name};

/// Failure to assemble adapters from configuration.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid built-in pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Executor(#[from] ExecutionError),
}

/// Agent-backed capabilities for every port. With `template_plans`, plans
/// come from [`TemplatePlanGenerator`] instead of the agent.
pub fn capabilities(
    config: &RigourConfig,
    template_plans: bool,
) -> Result<Capabilities, AdapterError> {
    let caps = Capabilities::from_backend(Arc::new(agent(config)?));
    Ok(if template_plans {
        caps.with_planner(Arc::new(TemplatePlanGenerator::new()?))
    } else {
        caps
    })
}

/// The configured agent, for calls outside the five ports.
pub fn agent(config: &RigourConfig) -> Result<AgentCapabilities, AdapterError> {
    Ok(AgentCapabilities::new(AgentBackend::from_config(
        &config.backend,
    ))?)
}

/// The configured process executor.
pub fn executor(config: &RigourConfig) -> Result<ProcessExecutor, AdapterError> {
    Ok(ProcessExecutor::from_config(&config.executor)?)
}
