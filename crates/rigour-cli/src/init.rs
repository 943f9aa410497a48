//! `rigour init`: writes starter scene, connection and config files.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const SCENES_FILE: &str = "scenes.yaml";
pub const CONNECTION_FILE: &str = "connection.yaml";
pub const CONFIG_FILE: &str = "rigour.yml";

const EXAMPLE_SCENES: &str = r#"# Each scene is one end-to-end flow. Steps are "METHOD /path" actions;
# assertions are judged against the values the generated test captures.
scenes:
  - id: health-check
    title: Health endpoint responds
    description: The service reports itself healthy.
    priority: high
    tags: [smoke]
    steps:
      - action: GET /health
    assertions:
      - type: status_code
        target: response
        expected: 200
      - type: response_time
        target: response
        expected: 1000

  - id: create-user
    title: Create a user
    description: A new user can be created and is returned with an id.
    actor:
      role: anonymous
    steps:
      - action: POST /users
        input:
          email: alice@example.com
          name: Alice
    assertions:
      - type: status_code
        target: step_1
        expected: 201
      - type: body_contains
        target: step_1
        expected: alice@example.com
    edge_cases:
      - duplicate email is rejected
      - missing name field
"#;

const EXAMPLE_CONNECTION: &str = r"# Where the system under test lives. $VARS are read from the environment.
connections:
  local:
    type: http
    base_url: http://localhost:8000
    timeout_ms: 30000
    headers:
      Accept: application/json
  staging:
    type: http
    base_url: https://staging.example.com
    auth:
      type: bearer
      credentials:
        token: $STAGING_TOKEN
";

const EXAMPLE_CONFIG: &str = r#"# Every field is optional; these are the defaults.
pipeline:
  enable_healing: true
  enable_exploration: true
  max_edge_cases_per_scene: 8
  parallel: false

executor:
  command: python3
  args: ["-m", "pytest", "{file}", "-v", "--tb=short"]
  timeout_secs: 60
  artifact_extension: py

healing:
  timeout_secs: 120
  timeout_factor: 2.0
  settle_ms: 500
  repairable: [assertion_mismatch, timeout, logic_error]

backend:
  command: claude
  prompt_flag: "-p"
  prompt_mode: arg
  timeout_secs: 300
"#;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("{} already exists. Use --force to overwrite.", .0.display())]
    Exists(PathBuf),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes the starter files into `dir`, returning their paths.
///
/// Nothing is written if any target exists and `force` is false.
pub fn init(dir: &Path, force: bool) -> Result<Vec<PathBuf>, InitError> {
    let files = [
        (SCENES_FILE, EXAMPLE_SCENES),
        (CONNECTION_FILE, EXAMPLE_CONNECTION),
        (CONFIG_FILE, EXAMPLE_CONFIG),
    ];

    if !force
        && let Some(existing) = files
            .iter()
            .map(|(name, _)| dir.join(name))
            .find(|path| path.exists())
    {
        return Err(InitError::Exists(existing));
    }

    std::fs::create_dir_all(dir).map_err(|source| InitError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::with_capacity(files.len());
    for (name, content) in files {
        let path = dir.join(name);
        std::fs::write(&path, content).map_err(|source| InitError::Io {
            path: path.clone(),
            source,
        })?;
        written.push(path);
    }
    Ok(written)
}
