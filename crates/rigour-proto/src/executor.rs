//! The port through which the pipeline runs a plan.

use std::time::Duration;

use async_trait::async_trait;

use crate::connection::Environment;
use crate::plan::TestPlan;
use crate::result::ExecutionResult;

/// One bounded execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub plan: TestPlan,
    pub environment: Environment,
    /// Collision-free key naming the execution unit for this attempt.
    pub unit_key: String,
    /// Hard wall-clock ceiling for the runner process.
    pub timeout: Duration,
}

/// Runs a generated artifact against an environment.
///
/// Implementations never fail: timeouts, spawn failures and unparseable
/// output are reported as `ExecutionStatus::Error` with the raw output kept.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult;
}
