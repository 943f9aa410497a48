//! Exploration Coordinator: turns suggested edge cases into child scenes.
//!
//! Materialization is deterministic. For a fixed suggestion response the same
//! children (ids, titles, tags, ordinals) come out every time.

use std::collections::BTreeSet;
use std::sync::Arc;

use rigour_proto::{
    CapabilityError, EdgeCase, EdgeCaseSuggester, ExecutionResult, ExecutionStatus, Priority,
    Scene, ValidationError,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

pub const EDGE_CASE_TAG: &str = "edge-case";
pub const GENERATED_TAG: &str = "generated";

const DEFAULT_FOCUS: [&str; 4] = [
    "boundary_values",
    "authentication",
    "concurrency",
    "data_edge_cases",
];

/// Children generated for one parent scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    pub parent_scene_id: String,
    pub reasoning: String,
    pub focus: Vec<String>,
    pub children: Vec<Scene>,
    /// Suggestions dropped because they did not form a valid scene.
    pub rejected: Vec<RejectedEdgeCase>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedEdgeCase {
    pub index: usize,
    pub name: String,
    pub reason: String,
}

pub struct ExplorationCoordinator {
    suggester: Arc<dyn EdgeCaseSuggester>,
    max_edge_cases: usize,
}

impl ExplorationCoordinator {
    pub fn new(suggester: Arc<dyn EdgeCaseSuggester>, max_edge_cases: usize) -> Self {
        Self {
            suggester,
            max_edge_cases,
        }
    }

    /// Requests edge cases for a passing `scene` and materializes them.
    ///
    /// The suggestion list is truncated to the first `max_edge_cases` entries
    /// before materialization.
    pub async fn explore(
        &self,
        scene: &Scene,
        result: &ExecutionResult,
    ) -> Result<Exploration, CapabilityError> {
        let focus = focus_areas(std::slice::from_ref(result));
        debug!(scene_id = %scene.id(), ?focus, "Requesting edge cases");

        let suggestion = self.suggester.suggest(scene, result, &focus).await?;
        let suggested = suggestion.edge_cases.len();

        let mut children = Vec::new();
        let mut rejected = Vec::new();
        for (index, edge) in suggestion
            .edge_cases
            .iter()
            .take(self.max_edge_cases)
            .enumerate()
        {
            match materialize(scene, index, edge) {
                Ok(child) => children.push(child),
                Err(e) => {
                    warn!(
                        scene_id = %scene.id(),
                        index,
                        edge_case = %edge.name,
                        error = %e,
                        "Skipping invalid edge case"
                    );
                    rejected.push(RejectedEdgeCase {
                        index,
                        name: edge.name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            scene_id = %scene.id(),
            suggested,
            generated = children.len(),
            "Explored edge cases"
        );

        Ok(Exploration {
            parent_scene_id: scene.id().to_string(),
            reasoning: suggestion.reasoning,
            focus,
            children,
            rejected,
        })
    }
}

/// Builds the child scene for the `index`-th edge case of `parent`.
///
/// The parent is only read; it never learns about its children.
pub fn materialize(
    parent: &Scene,
    index: usize,
    edge: &EdgeCase,
) -> Result<Scene, ValidationError> {
    let name = edge.name.trim();
    if name.is_empty() {
        return Err(ValidationError::EmptyField {
            field: "edge_case.name",
        });
    }

    let mut spec = parent.to_spec();
    spec.id = Some(format!("{}-edge-{index}", parent.id()));
    spec.title = format!("{} - {name}", parent.title());
    spec.description = format!(
        "Original: {}\n\nEdge Case: {}",
        parent.description(),
        edge.description
    );
    if !edge.steps.is_empty() {
        spec.steps = edge.steps.clone();
    }
    if !edge.assertions.is_empty() {
        spec.assertions = edge.assertions.clone();
    }
    spec.edge_cases = Vec::new();
    spec.priority = edge
        .priority
        .parse::<Priority>()
        .unwrap_or(parent.priority());
    spec.created_at = None;

    spec.tags.push(EDGE_CASE_TAG.to_string());
    let category = edge.category.trim();
    if !category.is_empty() {
        spec.tags.push(category.to_string());
    }
    spec.tags.push(GENERATED_TAG.to_string());

    spec.metadata
        .insert("parent_scene_id".into(), Value::from(parent.id()));
    spec.metadata.insert("index".into(), Value::from(index));
    spec.metadata
        .insert("edge_case_name".into(), Value::from(name));
    spec.metadata
        .insert("edge_case_category".into(), Value::from(category));

    Scene::try_from(spec)
}

/// Areas the suggester should prioritize, derived from baseline results.
///
/// Sorted and deduplicated.
pub fn focus_areas(results: &[ExecutionResult]) -> Vec<String> {
    let mut areas = BTreeSet::new();

    if results.iter().all(|r| r.status == ExecutionStatus::Passed) {
        areas.extend(DEFAULT_FOCUS);
    }

    for result in results.iter().filter(|r| r.status.is_failure()) {
        let message = result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        if message.contains("timeout") || message.contains("timed out") {
            areas.insert("concurrency");
        } else if message.contains("auth") {
            areas.insert("authentication");
        } else if message.contains("validation") {
            areas.insert("input_validation");
        }
    }

    areas.into_iter().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigour_proto::{Assertion, AssertionType, EdgeCaseSuggestion, Step};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSuggester {
        edge_cases: Vec<EdgeCase>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EdgeCaseSuggester for FixedSuggester {
        async fn suggest(
            &self,
            _scene: &Scene,
            _result: &ExecutionResult,
            _focus: &[String],
        ) -> Result<EdgeCaseSuggestion, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(EdgeCaseSuggestion {
                reasoning: "covering boundaries".to_string(),
                edge_cases: self.edge_cases.clone(),
            })
        }
    }

    fn edge(name: &str, category: &str) -> EdgeCase {
        EdgeCase {
            name: name.to_string(),
            category: category.to_string(),
            description: format!("{name} description"),
            priority: "high".to_string(),
            ..Default::default()
        }
    }

    fn parent() -> Scene {
        Scene::builder("Login", "User logs in")
            .with_id("login")
            .with_tags(["auth"])
            .with_step("POST /login", None, None)
            .with_assertion(AssertionType::StatusCode, "response", 200)
            .build()
            .unwrap()
    }

    fn passed() -> ExecutionResult {
        ExecutionResult::from_counts("plan", 1, 0, 0, 10, "1 passed")
    }

    #[tokio::test]
    async fn test_cap_truncates_in_generation_order() {
        let suggester = Arc::new(FixedSuggester {
            edge_cases: (0..5)
                .map(|i| edge(&format!("case {i}"), "boundary"))
                .collect(),
            calls: AtomicUsize::new(0),
        });
        let coordinator = ExplorationCoordinator::new(suggester.clone(), 3);
        let exploration = coordinator.explore(&parent(), &passed()).await.unwrap();

        assert_eq!(suggester.calls.load(Ordering::SeqCst), 1);
        assert_eq!(exploration.children.len(), 3);
        for (i, child) in exploration.children.iter().enumerate() {
            assert_eq!(child.title(), format!("Login - case {i}"));
            assert_eq!(child.metadata()["index"], i);
            assert!(child.has_tag(EDGE_CASE_TAG));
            assert!(child.has_tag(GENERATED_TAG));
            assert!(child.has_tag("boundary"));
            assert!(child.has_tag("auth"));
            assert_eq!(child.parent_scene_id(), Some("login"));
        }
    }

    #[test]
    fn test_materialize_inherits_and_overrides() {
        let p = parent();
        let mut e = edge("Empty password", "input_validation");
        let child = materialize(&p, 0, &e).unwrap();
        assert_eq!(child.id(), "login-edge-0");
        assert_eq!(child.steps(), p.steps());
        assert_eq!(child.priority(), Priority::High);
        assert_eq!(
            child.description(),
            "Original: User logs in\n\nEdge Case: Empty password description"
        );
        assert_eq!(child.metadata()["edge_case_category"], "input_validation");

        e.steps = vec![Step::new("POST /login").with_input(serde_json::json!({"password": ""}))];
        e.assertions = vec![Assertion::new(AssertionType::StatusCode, "response", 400)];
        e.priority = "whenever".to_string();
        let child = materialize(&p, 1, &e).unwrap();
        assert_eq!(child.steps().len(), 1);
        assert_eq!(child.assertions()[0].expected, 400);
        assert_eq!(child.priority(), p.priority());
    }

    #[test]
    fn test_materialize_leaves_parent_untouched() {
        let p = parent();
        let before = p.clone();
        let _ = materialize(&p, 0, &edge("x", "y")).unwrap();
        assert_eq!(p, before);
        assert!(p.parent_scene_id().is_none());
    }

    #[tokio::test]
    async fn test_invalid_suggestion_skipped_ordinals_kept() {
        let bad = EdgeCase {
            name: "Bad prompt".to_string(),
            category: "semantic".to_string(),
            assertions: vec![Assertion::new(AssertionType::Semantic, "r", "x")],
            ..Default::default()
        };
        let suggester = Arc::new(FixedSuggester {
            edge_cases: vec![edge("a", "c"), bad, edge("b", "c")],
            calls: AtomicUsize::new(0),
        });
        let coordinator = ExplorationCoordinator::new(suggester, 8);
        let exploration = coordinator.explore(&parent(), &passed()).await.unwrap();

        assert_eq!(exploration.children.len(), 2);
        assert_eq!(exploration.children[1].id(), "login-edge-2");
        assert_eq!(exploration.rejected.len(), 1);
        assert_eq!(exploration.rejected[0].index, 1);
    }

    #[test]
    fn test_focus_areas() {
        assert_eq!(
            focus_areas(&[passed()]),
            vec![
                "authentication",
                "boundary_values",
                "concurrency",
                "data_edge_cases"
            ]
        );

        let timeout = ExecutionResult::error("p", "Test timed out after 60s", "", 0);
        let auth = ExecutionResult::from_counts("p", 0, 1, 0, 0, "")
            .with_error_message("401 auth required");
        assert_eq!(
            focus_areas(&[timeout, auth]),
            vec!["authentication", "concurrency"]
        );
    }
}
