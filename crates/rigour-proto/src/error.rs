//! Error types shared by every Rigour crate.

use thiserror::Error;

use crate::scene::AssertionType;

/// A malformed scene, assertion, plan or connection.
///
/// Raised eagerly at construction. A value that fails validation never
/// enters the pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },

    #[error("assertion {index} of type {assertion_type} requires a semantic_prompt")]
    MissingSemanticPrompt {
        index: usize,
        assertion_type: AssertionType,
    },

    #[error("assertion {index}: tolerance must be finite and non-negative, got {value}")]
    InvalidTolerance { index: usize, value: f64 },

    #[error("invalid execution order: {0}")]
    InvalidExecutionOrder(String),

    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

/// An external capability call failed or returned something unusable.
///
/// Always caught at the phase boundary; never propagated to the batch caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("{capability} call failed: {message}")]
    CallFailed {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} returned an unparseable payload: {message}")]
    Unparseable {
        capability: &'static str,
        message: String,
    },

    #[error("{capability} timed out after {timeout_ms}ms")]
    Timeout {
        capability: &'static str,
        timeout_ms: u64,
    },
}

impl CapabilityError {
    pub fn call_failed(capability: &'static str, message: impl Into<String>) -> Self {
        Self::CallFailed {
            capability,
            message: message.into(),
        }
    }

    pub fn unparseable(capability: &'static str, message: impl Into<String>) -> Self {
        Self::Unparseable {
            capability,
            message: message.into(),
        }
    }

    /// Name of the port that failed.
    pub fn capability(&self) -> &'static str {
        match self {
            Self::CallFailed { capability, .. }
            | Self::Unparseable { capability, .. }
            | Self::Timeout { capability, .. } => capability,
        }
    }
}

/// Failure of the bounded test-runner process.
///
/// Executors convert these into `status = error` results with the raw output
/// preserved; they never escape an executor's public call.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("test run timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("test runner failed: {message}")]
    Runtime { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
