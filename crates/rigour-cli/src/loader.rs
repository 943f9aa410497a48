//! Loading scenes (YAML or Gherkin) and connection records.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rigour_proto::{Assertion, AssertionType, Connection, Scene, SceneSpec, Step, ValidationError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{path}: scene {index}: {source}")]
    InvalidScene {
        path: PathBuf,
        index: usize,
        #[source]
        source: ValidationError,
    },

    #[error("{path} contains no scenes")]
    NoScenes { path: PathBuf },

    #[error("{path}: duplicate scene id '{id}'")]
    DuplicateSceneId { path: PathBuf, id: String },

    #[error("environment '{name}' not found (available: {})", .available.join(", "))]
    UnknownEnvironment { name: String, available: Vec<String> },

    #[error("{path} defines no connections")]
    NoConnections { path: PathBuf },

    #[error("invalid connection: {0}")]
    InvalidConnection(#[from] ValidationError),
}

fn read(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads scenes from a YAML file, or from Gherkin when the extension is
/// `.feature`.
///
/// Accepted YAML shapes, per document: a list of scenes, a mapping with a
/// `scenes:` list, or a single scene mapping. Multi-document files are
/// concatenated in order.
pub fn load_scenes(path: &Path) -> Result<Vec<Scene>, LoadError> {
    let content = read(path)?;
    if path.extension().is_some_and(|ext| ext == "feature") {
        parse_gherkin(&content, path)
    } else {
        parse_scenes(&content, path)
    }
}

pub fn parse_scenes(content: &str, path: &Path) -> Result<Vec<Scene>, LoadError> {
    let parse_err = |source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let mut specs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(parse_err)?;
        match value {
            Value::Null => {}
            Value::Sequence(items) => specs.extend(items),
            Value::Mapping(ref map) if map.contains_key("scenes") => {
                match map.get("scenes") {
                    Some(Value::Sequence(items)) => specs.extend(items.iter().cloned()),
                    Some(Value::Null) | None => {}
                    Some(other) => specs.push(other.clone()),
                }
            }
            other => specs.push(other),
        }
    }

    let mut scenes = Vec::with_capacity(specs.len());
    for (index, raw) in specs.into_iter().enumerate() {
        let spec: SceneSpec = serde_yaml::from_value(raw).map_err(parse_err)?;
        let scene = Scene::try_from(spec).map_err(|source| LoadError::InvalidScene {
            path: path.to_path_buf(),
            index,
            source,
        })?;
        scenes.push(scene);
    }

    finish(scenes, path)
}

/// Rejects an empty set or a repeated id.
fn finish(scenes: Vec<Scene>, path: &Path) -> Result<Vec<Scene>, LoadError> {
    if scenes.is_empty() {
        return Err(LoadError::NoScenes {
            path: path.to_path_buf(),
        });
    }
    {
        let mut seen = HashSet::new();
        if let Some(dup) = scenes.iter().find(|scene| !seen.insert(scene.id())) {
            return Err(LoadError::DuplicateSceneId {
                path: path.to_path_buf(),
                id: dup.id().to_string(),
            });
        }
    }
    debug!(path = %path.display(), count = scenes.len(), "Loaded scenes");
    Ok(scenes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Given,
    When,
    Then,
}

#[derive(Debug, Default)]
struct GherkinScenario {
    title: String,
    tags: Vec<String>,
    given: Vec<String>,
    when: Vec<String>,
    then: Vec<String>,
}

impl GherkinScenario {
    fn push(&mut self, clause: Clause, text: String) {
        match clause {
            Clause::Given => self.given.push(text),
            Clause::When => self.when.push(text),
            Clause::Then => self.then.push(text),
        }
    }

    /// `When` clauses become steps and `Then` clauses semantic assertions on
    /// the response. The description joins every clause in order.
    fn into_spec(self, feature: &str, background: &[String]) -> SceneSpec {
        let title = if self.title.is_empty() {
            feature.to_string()
        } else {
            self.title
        };
        let description = background
            .iter()
            .chain(&self.given)
            .chain(&self.when)
            .chain(&self.then)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let description = if description.is_empty() {
            title.clone()
        } else {
            description
        };

        let mut spec = SceneSpec::new(title, description);
        spec.steps = self.when.into_iter().map(Step::new).collect();
        spec.assertions = self
            .then
            .into_iter()
            .map(|clause| {
                Assertion::new(AssertionType::Semantic, "response", clause.clone())
                    .with_semantic_prompt(clause)
            })
            .collect();
        spec.tags = self.tags;
        spec
    }
}

/// Splits a step line into its clause keyword and text. `And`, `But` and
/// `*` continue the previous clause.
fn step_line(line: &str, previous: Option<Clause>) -> Option<(Clause, String)> {
    let (keyword, rest) = line.split_once(char::is_whitespace)?;
    let clause = match keyword {
        "Given" => Clause::Given,
        "When" => Clause::When,
        "Then" => Clause::Then,
        "And" | "But" | "*" => previous?,
        _ => return None,
    };
    Some((clause, rest.trim().to_string()))
}

/// Reads scenes from Gherkin text.
///
/// Each `Scenario:` (or `Scenario Outline:`/`Example:`) is one scene; text
/// without any scenario header is a single scene titled by its `Feature:`.
/// `Background:` clauses are shared by every scenario. `@tags` apply to the
/// next feature or scenario.
pub fn parse_gherkin(content: &str, path: &Path) -> Result<Vec<Scene>, LoadError> {
    let mut feature = String::new();
    let mut feature_tags: Vec<String> = Vec::new();
    let mut pending_tags: Vec<String> = Vec::new();
    let mut background: Vec<String> = Vec::new();
    let mut in_background = false;
    let mut scenarios: Vec<GherkinScenario> = Vec::new();
    let mut clause: Option<Clause> = None;

    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            pending_tags.extend(
                line.split_whitespace()
                    .filter_map(|tag| tag.strip_prefix('@'))
                    .map(str::to_string),
            );
            continue;
        }
        if let Some(title) = line.strip_prefix("Feature:") {
            feature = title.trim().to_string();
            feature_tags.append(&mut pending_tags);
            continue;
        }
        if line.starts_with("Background:") {
            in_background = true;
            clause = None;
            continue;
        }
        let header = ["Scenario Outline:", "Scenario:", "Example:"]
            .iter()
            .find_map(|h| line.strip_prefix(h));
        if let Some(title) = header {
            in_background = false;
            clause = None;
            let mut tags = feature_tags.clone();
            tags.append(&mut pending_tags);
            scenarios.push(GherkinScenario {
                title: title.trim().to_string(),
                tags,
                ..GherkinScenario::default()
            });
            continue;
        }

        let Some((next, text)) = step_line(line, clause) else {
            continue;
        };
        clause = Some(next);
        if in_background {
            background.push(text);
            continue;
        }
        if scenarios.is_empty() {
            scenarios.push(GherkinScenario {
                tags: feature_tags.clone(),
                ..GherkinScenario::default()
            });
        }
        if let Some(current) = scenarios.last_mut() {
            current.push(next, text);
        }
    }

    let mut scenes = Vec::with_capacity(scenarios.len());
    for (index, scenario) in scenarios.into_iter().enumerate() {
        let scene = Scene::try_from(scenario.into_spec(&feature, &background)).map_err(|source| {
            LoadError::InvalidScene {
                path: path.to_path_buf(),
                index,
                source,
            }
        })?;
        scenes.push(scene);
    }
    finish(scenes, path)
}

/// Renders scenes as a `scenes:` document that [`load_scenes`] reads back.
pub fn scenes_to_yaml(scenes: &[Scene]) -> Result<String, serde_yaml::Error> {
    #[derive(Serialize)]
    struct SceneFile {
        scenes: Vec<SceneSpec>,
    }

    serde_yaml::to_string(&SceneFile {
        scenes: scenes.iter().map(Scene::to_spec).collect(),
    })
}

/// Reads a connection record and resolves `$VAR` credentials from the
/// process environment.
pub fn load_connection(path: &Path, env: Option<&str>) -> Result<Connection, LoadError> {
    parse_connection(&read(path)?, path, env, |key| std::env::var(key).ok())
}

/// Flat record, or `connections: {name: {...}}` picking `env` (or the first
/// entry). Missing `$VAR` references are warned about, then the record is
/// validated.
pub fn parse_connection(
    content: &str,
    path: &Path,
    env: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Connection, LoadError> {
    let parse_err = |source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let value: Value = serde_yaml::from_str(content).map_err(parse_err)?;

    let raw = match value.get("connections") {
        Some(Value::Mapping(envs)) => {
            let selected = match env {
                Some(name) => envs.get(name).cloned().ok_or_else(|| {
                    LoadError::UnknownEnvironment {
                        name: name.to_string(),
                        available: envs
                            .keys()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect(),
                    }
                })?,
                None => envs.values().next().cloned().ok_or_else(|| {
                    LoadError::NoConnections {
                        path: path.to_path_buf(),
                    }
                })?,
            };
            let name = env
                .map(str::to_string)
                .or_else(|| envs.keys().next().and_then(Value::as_str).map(str::to_string));
            with_default_name(selected, name)
        }
        Some(_) => {
            return Err(LoadError::NoConnections {
                path: path.to_path_buf(),
            });
        }
        None => value,
    };

    let mut connection: Connection = serde_yaml::from_value(raw).map_err(parse_err)?;
    for var in connection.resolve_env_refs(lookup) {
        warn!(variable = %var, "Connection credential references an unset environment variable");
    }
    connection.validate()?;
    Ok(connection)
}

fn with_default_name(mut raw: Value, name: Option<String>) -> Value {
    if let (Value::Mapping(map), Some(name)) = (&mut raw, name)
        && !map.contains_key("name")
    {
        map.insert(Value::from("name"), Value::from(name));
    }
    raw
}
