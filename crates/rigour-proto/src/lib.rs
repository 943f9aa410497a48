//! # rigour-proto
//!
//! Shared types, error definitions, and traits for the Rigour test orchestrator.
//!
//! This crate provides the foundational abstractions used across all Rigour crates,
//! including:
//! - The scenario model (`Scene`, `Step`, `Assertion`) with eager validation
//! - Plans, execution results, judgments and diagnoses
//! - The connection record and the resolved execution environment
//! - Capability ports for the external reasoning backend
//! - The `TestExecutor` port implemented by process runners

mod capability;
mod connection;
mod diagnosis;
mod error;
mod executor;
mod plan;
mod result;
mod scene;

pub use capability::{
    CodeRepairer, EdgeCase, EdgeCaseSuggester, EdgeCaseSuggestion, FailureDiagnoser,
    PlanGenerator, SemanticEvaluator, SemanticVerdict,
};
pub use connection::{
    AuthSpec, AuthType, Connection, ConnectionType, Environment, ProxyConfig, RetryPolicy,
    TlsConfig,
};
pub use diagnosis::{Diagnosis, IssueType, Severity};
pub use error::{CapabilityError, ExecutionError, ValidationError};
pub use executor::{ExecutionRequest, TestExecutor};
pub use plan::{PlanDraft, TestCase, TestPlan};
pub use result::{AssertionResult, ExecutionResult, ExecutionStatus, JudgmentResult};
pub use scene::{
    Actor, ActorAuth, Assertion, AssertionType, DEFAULT_TOLERANCE, Priority, Scene, SceneBuilder,
    SceneSpec, Step,
};
