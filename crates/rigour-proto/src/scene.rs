//! The declarative scenario model.
//!
//! A [`Scene`] is validated when it is built, never lazily: every public way
//! of obtaining one (`SceneBuilder::build`, `Scene::try_from(SceneSpec)`,
//! deserialization) runs the same checks, so a scene that exists is a scene the
//! pipeline may run.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// Tolerance applied to `response_time` assertions that don't declare one.
pub const DEFAULT_TOLERANCE: f64 = 0.10;

/// Metadata key carrying a generated scene's parent id.
pub(crate) const PARENT_SCENE_ID: &str = "parent_scene_id";

/// Priority levels for scenes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(ValidationError::UnknownVariant {
                kind: "priority",
                value: s.to_string(),
            }),
        }
    }
}

/// Kinds of assertion the judgment engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    StatusCode,
    BodyContains,
    BodySchema,
    HeaderContains,
    ResponseTime,
    DbState,
    Semantic,
    Custom,
}

impl AssertionType {
    pub fn as_str(self) -> &'static str {
        match self {
            AssertionType::StatusCode => "status_code",
            AssertionType::BodyContains => "body_contains",
            AssertionType::BodySchema => "body_schema",
            AssertionType::HeaderContains => "header_contains",
            AssertionType::ResponseTime => "response_time",
            AssertionType::DbState => "db_state",
            AssertionType::Semantic => "semantic",
            AssertionType::Custom => "custom",
        }
    }

    /// Qualitative types are judged by the external evaluator and need a prompt.
    pub fn is_qualitative(self) -> bool {
        matches!(self, AssertionType::Semantic | AssertionType::Custom)
    }
}

impl fmt::Display for AssertionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssertionType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "status_code" => Ok(AssertionType::StatusCode),
            "body_contains" => Ok(AssertionType::BodyContains),
            "body_schema" => Ok(AssertionType::BodySchema),
            "header_contains" => Ok(AssertionType::HeaderContains),
            "response_time" => Ok(AssertionType::ResponseTime),
            "db_state" => Ok(AssertionType::DbState),
            "semantic" => Ok(AssertionType::Semantic),
            "custom" => Ok(AssertionType::Custom),
            _ => Err(ValidationError::UnknownVariant {
                kind: "assertion type",
                value: s.to_string(),
            }),
        }
    }
}

/// A typed expected-outcome check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,

    /// Key into the captured outcomes of an execution.
    pub target: String,

    #[serde(default)]
    pub expected: Value,

    /// Relative tolerance, only meaningful for `response_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Assertion {
    pub fn new(
        assertion_type: AssertionType,
        target: impl Into<String>,
        expected: impl Into<Value>,
    ) -> Self {
        Self {
            assertion_type,
            target: target.into(),
            expected: expected.into(),
            tolerance: None,
            semantic_prompt: None,
            metadata: Map::new(),
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }

    pub fn with_semantic_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.semantic_prompt = Some(prompt.into());
        self
    }

    /// The declared tolerance, or [`DEFAULT_TOLERANCE`].
    pub fn tolerance_or_default(&self) -> f64 {
        self.tolerance.unwrap_or(DEFAULT_TOLERANCE)
    }

    /// Checks the assertion invariants. `index` is its position in the scene.
    pub fn validate(&self, index: usize) -> Result<(), ValidationError> {
        if self.target.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "assertion.target",
            });
        }

        if self.assertion_type.is_qualitative()
            && self
                .semantic_prompt
                .as_deref()
                .is_none_or(|p| p.trim().is_empty())
        {
            return Err(ValidationError::MissingSemanticPrompt {
                index,
                assertion_type: self.assertion_type,
            });
        }

        if let Some(tolerance) = self.tolerance
            && (!tolerance.is_finite() || tolerance < 0.0)
        {
            return Err(ValidationError::InvalidTolerance {
                index,
                value: tolerance,
            });
        }

        Ok(())
    }
}

/// Credentials an actor presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorAuth {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// The user or client performing a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// admin, user, anonymous, api_client, ...
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ActorAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Actor {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            auth: None,
            persona: None,
            metadata: Map::new(),
        }
    }
}

/// A single step of a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// HTTP verb and path (`POST /login`), a UI action, or a delay.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Step {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            input: None,
            expect: None,
            metadata: Map::new(),
        }
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_expect(mut self, expect: impl Into<String>) -> Self {
        self.expect = Some(expect.into());
        self
    }
}

/// Unvalidated scene fields, as written in a scene file.
///
/// Convert with `Scene::try_from(spec)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
    /// Hints for edge-case exploration.
    #[serde(default)]
    pub edge_cases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SceneSpec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            ..Default::default()
        }
    }
}

/// A validated test scenario.
///
/// The id is fixed at construction. Steps and assertions are owned by the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SceneSpec")]
pub struct Scene {
    id: String,
    title: String,
    description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<Actor>,
    steps: Vec<Step>,
    assertions: Vec<Assertion>,
    edge_cases: Vec<String>,
    tags: Vec<String>,
    priority: Priority,
    created_at: DateTime<Utc>,
    metadata: Map<String, Value>,
}

impl Scene {
    /// Builds a scene with only a title and description.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::try_from(SceneSpec::new(title, description))
    }

    pub fn builder(title: impl Into<String>, description: impl Into<String>) -> SceneBuilder {
        SceneBuilder::new(title, description)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn actor(&self) -> Option<&Actor> {
        self.actor.as_ref()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn assertions(&self) -> &[Assertion] {
        &self.assertions
    }

    pub fn edge_case_hints(&self) -> &[String] {
        &self.edge_cases
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    /// The scene this one was generated from, if any. Lookup only.
    pub fn parent_scene_id(&self) -> Option<&str> {
        self.metadata.get(PARENT_SCENE_ID).and_then(Value::as_str)
    }

    /// Returns the unvalidated form, e.g. to derive a new scene from this one.
    pub fn to_spec(&self) -> SceneSpec {
        SceneSpec {
            id: Some(self.id.clone()),
            title: self.title.clone(),
            description: self.description.clone(),
            actor: self.actor.clone(),
            steps: self.steps.clone(),
            assertions: self.assertions.clone(),
            edge_cases: self.edge_cases.clone(),
            tags: self.tags.clone(),
            priority: self.priority,
            created_at: Some(self.created_at),
            metadata: self.metadata.clone(),
        }
    }
}

impl TryFrom<SceneSpec> for Scene {
    type Error = ValidationError;

    fn try_from(spec: SceneSpec) -> Result<Self, Self::Error> {
        let id = match spec.id {
            Some(id) if id.trim().is_empty() => {
                return Err(ValidationError::EmptyField { field: "id" });
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        if spec.title.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "title" });
        }
        if spec.description.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "description",
            });
        }

        if spec.steps.iter().any(|s| s.action.trim().is_empty()) {
            return Err(ValidationError::EmptyField {
                field: "step.action",
            });
        }

        for (index, assertion) in spec.assertions.iter().enumerate() {
            assertion.validate(index)?;
        }

        let mut tags: Vec<String> = Vec::with_capacity(spec.tags.len());
        for tag in spec.tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Ok(Self {
            id,
            title: spec.title,
            description: spec.description,
            actor: spec.actor,
            steps: spec.steps,
            assertions: spec.assertions,
            edge_cases: spec.edge_cases,
            tags,
            priority: spec.priority,
            created_at: spec.created_at.unwrap_or_else(Utc::now),
            metadata: spec.metadata,
        })
    }
}

/// Fluent builder for scenes.
///
/// ```
/// use rigour_proto::{AssertionType, Priority, Scene};
///
/// let scene = Scene::builder("Login", "User logs in with valid credentials")
///     .with_priority(Priority::High)
///     .with_tags(["auth", "critical-path"])
///     .with_step("POST /login", Some(serde_json::json!({"username": "a"})), None)
///     .with_assertion(AssertionType::StatusCode, "response", 200)
///     .build()
///     .unwrap();
/// assert_eq!(scene.assertions().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct SceneBuilder {
    spec: SceneSpec,
}

impl SceneBuilder {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            spec: SceneSpec::new(title, description),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.spec.id = Some(id.into());
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.spec.actor = Some(actor);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.spec.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_step(
        mut self,
        action: impl Into<String>,
        input: Option<Value>,
        expect: Option<&str>,
    ) -> Self {
        self.spec.steps.push(Step {
            action: action.into(),
            input,
            expect: expect.map(str::to_string),
            metadata: Map::new(),
        });
        self
    }

    pub fn with_assertion(
        mut self,
        assertion_type: AssertionType,
        target: impl Into<String>,
        expected: impl Into<Value>,
    ) -> Self {
        self.spec
            .assertions
            .push(Assertion::new(assertion_type, target, expected));
        self
    }

    /// Adds a fully specified assertion (tolerance, semantic prompt, ...).
    pub fn with_full_assertion(mut self, assertion: Assertion) -> Self {
        self.spec.assertions.push(assertion);
        self
    }

    pub fn with_edge_case(mut self, hint: impl Into<String>) -> Self {
        self.spec.edge_cases.push(hint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Scene, ValidationError> {
        Scene::try_from(self.spec)
    }
}
