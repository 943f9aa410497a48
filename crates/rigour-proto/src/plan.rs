//! Generated test plans.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::scene::Scene;

/// Descriptor for one test case inside a generated artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Indices of the scene assertions this case covers.
    #[serde(default)]
    pub assertion_indices: Vec<usize>,
}

/// The payload a `PlanGenerator` returns.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlanDraft {
    pub artifact: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_code: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub estimated_duration_ms: u64,
}

impl PlanDraft {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            ..Default::default()
        }
    }
}

/// An executable plan for one scene, created fresh for every pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPlan {
    pub id: String,
    /// Owning scene. A lookup key, not ownership.
    pub scene_id: String,
    pub artifact: String,
    pub test_cases: Vec<TestCase>,
    execution_order: Vec<String>,
    /// Plan ids this plan derives from (edge-case lineage, healed plans).
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_code: Option<String>,
    pub estimated_duration_ms: u64,
}

impl TestPlan {
    /// Builds a plan for `scene` from a generator payload.
    ///
    /// Execution order defaults to the declared test-case order. An empty
    /// artifact or duplicate test-case ids are rejected.
    pub fn from_draft(scene: &Scene, draft: PlanDraft) -> Result<Self, ValidationError> {
        if draft.artifact.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "artifact" });
        }

        let mut seen = HashSet::new();
        for case in &draft.test_cases {
            if !seen.insert(case.id.as_str()) {
                return Err(ValidationError::InvalidExecutionOrder(format!(
                    "duplicate test case id '{}'",
                    case.id
                )));
            }
        }

        let execution_order = draft.test_cases.iter().map(|c| c.id.clone()).collect();

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            scene_id: scene.id().to_string(),
            artifact: draft.artifact,
            test_cases: draft.test_cases,
            execution_order,
            dependencies: draft.dependencies,
            setup_code: draft.setup_code,
            teardown_code: draft.teardown_code,
            estimated_duration_ms: draft.estimated_duration_ms,
        })
    }

    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Replaces the execution order. It must name known test cases, each at most once.
    pub fn with_execution_order(mut self, order: Vec<String>) -> Result<Self, ValidationError> {
        let known: HashSet<&str> = self.test_cases.iter().map(|c| c.id.as_str()).collect();
        let mut seen = HashSet::new();
        for id in &order {
            if !known.contains(id.as_str()) {
                return Err(ValidationError::InvalidExecutionOrder(format!(
                    "unknown test case '{id}'"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(ValidationError::InvalidExecutionOrder(format!(
                    "test case '{id}' listed twice"
                )));
            }
        }
        self.execution_order = order;
        Ok(self)
    }

    /// A copy of this plan carrying a repaired artifact.
    ///
    /// The new plan gets its own id and lists this plan as a dependency.
    pub fn healed(&self, artifact: String) -> Self {
        let mut dependencies = self.dependencies.clone();
        dependencies.push(self.id.clone());
        Self {
            id: format!("{}-healed", self.id),
            artifact,
            dependencies,
            ..self.clone()
        }
    }

    /// Setup, body and teardown joined into the file the runner executes.
    pub fn full_artifact(&self) -> String {
        let mut out = String::new();
        if let Some(setup) = &self.setup_code {
            out.push_str(setup.trim_end());
            out.push_str("\n\n");
        }
        out.push_str(&self.artifact);
        if let Some(teardown) = &self.teardown_code {
            if !out.ends_with('\n') {
                out.push('\n');
            }
            out.push('\n');
            out.push_str(teardown.trim_end());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case(id: &str) -> TestCase {
        TestCase {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            assertion_indices: vec![],
        }
    }

    fn scene() -> Scene {
        Scene::builder("t", "d").with_id("s-1").build().unwrap()
    }

    #[test]
    fn test_from_draft_defaults_order() {
        let mut draft = PlanDraft::new("def test_a(): pass");
        draft.test_cases = vec![case("a"), case("b")];
        let plan = TestPlan::from_draft(&scene(), draft).unwrap();
        assert_eq!(plan.scene_id, "s-1");
        assert_eq!(plan.execution_order(), ["a", "b"]);
    }

    #[test]
    fn test_from_draft_rejects_empty_artifact() {
        let err = TestPlan::from_draft(&scene(), PlanDraft::new("   ")).unwrap_err();
        assert_eq!(err, ValidationError::EmptyField { field: "artifact" });
    }

    #[test]
    fn test_execution_order_must_be_subset_without_repeats() {
        let mut draft = PlanDraft::new("x");
        draft.test_cases = vec![case("a"), case("b"), case("c")];
        let plan = TestPlan::from_draft(&scene(), draft).unwrap();

        let reordered = plan
            .clone()
            .with_execution_order(vec!["c".into(), "a".into()])
            .unwrap();
        assert_eq!(reordered.execution_order(), ["c", "a"]);

        assert!(
            plan.clone()
                .with_execution_order(vec!["z".into()])
                .is_err()
        );
        assert!(
            plan.with_execution_order(vec!["a".into(), "a".into()])
                .is_err()
        );
    }

    #[test]
    fn test_healed_plan_lineage() {
        let plan = TestPlan::from_draft(&scene(), PlanDraft::new("old")).unwrap();
        let healed = plan.healed("new".to_string());
        assert_eq!(healed.id, format!("{}-healed", plan.id));
        assert_eq!(healed.dependencies, vec![plan.id.clone()]);
        assert_eq!(healed.artifact, "new");
        assert_eq!(healed.scene_id, plan.scene_id);
    }

    #[test]
    fn test_full_artifact_wraps_setup_and_teardown() {
        let mut draft = PlanDraft::new("BODY\n");
        draft.setup_code = Some("SETUP".to_string());
        draft.teardown_code = Some("TEARDOWN".to_string());
        let plan = TestPlan::from_draft(&scene(), draft).unwrap();
        assert_eq!(plan.full_artifact(), "SETUP\n\nBODY\n\nTEARDOWN\n");
    }
}
