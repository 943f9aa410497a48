//! Capability ports for the external reasoning backend.
//!
//! Every open-ended operation the pipeline needs (writing a test, proposing
//! edge cases, judging qualitative output, diagnosing and repairing a
//! failure) sits behind one of these traits. Implementations are injected
//! into the coordinators, so any backend can be swapped in and tests can use
//! scripted mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::Connection;
use crate::diagnosis::Diagnosis;
use crate::error::CapabilityError;
use crate::plan::PlanDraft;
use crate::result::ExecutionResult;
use crate::scene::{Assertion, Scene, Step};

/// Writes an executable test artifact for a scene.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn plan(&self, scene: &Scene, connection: &Connection)
    -> Result<PlanDraft, CapabilityError>;
}

/// One candidate edge case proposed for a passing scene.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EdgeCase {
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    /// Free text; parsed leniently when the child scene is built.
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// Response of an [`EdgeCaseSuggester`], in generation order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EdgeCaseSuggestion {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, alias = "edgeCases")]
    pub edge_cases: Vec<EdgeCase>,
}

/// Proposes derivative scenarios from a verified baseline.
///
/// `focus` names the areas the exploration coordinator wants covered first.
#[async_trait]
pub trait EdgeCaseSuggester: Send + Sync {
    async fn suggest(
        &self,
        scene: &Scene,
        result: &ExecutionResult,
        focus: &[String],
    ) -> Result<EdgeCaseSuggestion, CapabilityError>;
}

/// Verdict on a qualitative assertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticVerdict {
    pub passed: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Judges `semantic` and `custom` assertions.
#[async_trait]
pub trait SemanticEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        assertion: &Assertion,
        actual: &Value,
        context: &Value,
    ) -> Result<SemanticVerdict, CapabilityError>;
}

#[async_trait]
pub trait FailureDiagnoser: Send + Sync {
    async fn diagnose(&self, result: &ExecutionResult) -> Result<Diagnosis, CapabilityError>;
}

/// Rewrites an artifact to address a diagnosis. Returns the full new artifact.
#[async_trait]
pub trait CodeRepairer: Send + Sync {
    async fn repair(&self, diagnosis: &Diagnosis, artifact: &str)
    -> Result<String, CapabilityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggestion_accepts_camel_case_list() {
        let json = r#"{
            "reasoning": "auth paths",
            "edgeCases": [
                {"name": "Expired token", "category": "authentication", "priority": "high"}
            ]
        }"#;
        let suggestion: EdgeCaseSuggestion = serde_json::from_str(json).unwrap();
        assert_eq!(suggestion.edge_cases.len(), 1);
        assert_eq!(suggestion.edge_cases[0].category, "authentication");
        assert!(suggestion.edge_cases[0].steps.is_empty());
    }

    #[test]
    fn test_verdict_defaults() {
        let verdict: SemanticVerdict = serde_json::from_str(r#"{"passed": true}"#).unwrap();
        assert!(verdict.passed);
        assert_eq!(verdict.confidence, 0.0);
        assert!(verdict.remediation.is_none());
    }
}
