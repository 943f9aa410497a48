//! Integration tests for the `rigour` binary.
//!
//! The runner is `true` or `false` and the planner is the template one, so no
//! Python or agent CLI is needed.

use std::path::Path;
use std::process::{Command, Output};

use rigour_core::{PipelineState, Report};
use rigour_proto::ExecutionStatus;
use tempfile::TempDir;

const SCENES: &str = r"
- id: health
  title: Health check
  description: The service reports itself healthy.
  steps:
    - action: GET /health
  assertions:
    - type: status_code
      target: response
      expected: 200
- id: users
  title: List users
  description: Users can be listed.
  steps:
    - action: GET /users
";

const CONNECTION: &str = "base_url: http://127.0.0.1:9\ntimeout_ms: 1000\n";

fn rigour(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rigour"))
        .args(args)
        .arg("--color")
        .arg("never")
        .current_dir(dir)
        .env_remove("RIGOUR_LOG")
        .output()
        .expect("Failed to execute rigour")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Writes scenes, connection and a config whose runner is `runner`.
fn workspace(runner: &str) -> TempDir {
    let temp = TempDir::new().expect("temp dir");
    let work = temp.path().join("work");
    std::fs::write(temp.path().join("scenes.yaml"), SCENES).unwrap();
    std::fs::write(temp.path().join("connection.yaml"), CONNECTION).unwrap();
    std::fs::write(
        temp.path().join("rigour.yml"),
        format!(
            "executor:\n  command: \"{runner}\"\n  args: []\n  timeout_secs: 10\n  work_root: {}\nbackend:\n  command: \"false\"\n",
            work.display()
        ),
    )
    .unwrap();
    temp
}

fn run(temp: &TempDir, extra: &[&str]) -> Output {
    let mut args = vec![
        "run",
        "scenes.yaml",
        "--connection",
        "connection.yaml",
        "--planner",
        "template",
    ];
    args.extend_from_slice(extra);
    rigour(temp.path(), &args)
}

#[test]
fn test_run_without_checks_is_skipped_and_exits_zero() {
    let temp = workspace("true");

    let output = run(&temp, &[]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let report: Report = serde_json::from_slice(&output.stdout).expect("JSON report on stdout");
    assert_eq!(report.summary.total, 2);
    assert_eq!(report.summary.skipped, 2);
    assert_eq!(report.exit_code(), 0);
    assert!(report.generated_scenes.is_empty());
    for scene in &report.scenes {
        assert_eq!(scene.state, PipelineState::Complete);
        assert_eq!(scene.status, Some(ExecutionStatus::Skipped));
        assert!(!scene.healed);
    }

    assert!(temp.path().join(".rigour/last-report.json").exists());
    // Execution units are released after the run.
    assert_eq!(std::fs::read_dir(temp.path().join("work")).unwrap().count(), 0);
}

#[test]
fn test_runner_error_exits_nonzero() {
    let temp = workspace("false");

    let output = run(&temp, &["--parallel"]);
    assert_eq!(output.status.code(), Some(1), "stderr: {}", stderr(&output));

    let report: Report = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report.summary.errored, 2);
    assert!(report.scenes.iter().all(|s| s.state == PipelineState::Error));
    assert!(report.scenes.iter().all(|s| !s.healed));
    assert!(stderr(&output).contains("Failed Scenes:"));
}

#[test]
fn test_report_written_to_file_and_reexported() {
    let temp = workspace("true");

    let output = run(&temp, &["--format", "html", "--output", "out/report.html"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(output.stdout.is_empty());
    let html = std::fs::read_to_string(temp.path().join("out/report.html")).unwrap();
    assert!(html.contains("Health check"));

    let output = rigour(temp.path(), &["report", "--last"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let markdown = String::from_utf8_lossy(&output.stdout);
    assert!(markdown.contains("# Rigour Test Report"));
    assert!(markdown.contains("| Skipped | 2 |"));
}

#[test]
fn test_report_without_previous_run_fails() {
    let temp = TempDir::new().unwrap();
    let output = rigour(temp.path(), &["report", "--last"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no previous report"));
}

#[test]
fn test_invalid_connection_is_fatal() {
    let temp = workspace("true");
    std::fs::write(temp.path().join("connection.yaml"), "base_url: nowhere\n").unwrap();

    let output = run(&temp, &[]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(stderr(&output).contains("invalid connection"));
    assert!(!temp.path().join(".rigour").exists());
}

#[test]
fn test_unknown_environment_lists_available() {
    let temp = workspace("true");
    std::fs::write(
        temp.path().join("connection.yaml"),
        "connections:\n  local:\n    base_url: http://localhost:8000\n",
    )
    .unwrap();

    let output = run(&temp, &["--env", "prod"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("environment 'prod' not found"), "stderr: {err}");
    assert!(err.contains("local"));
}

#[test]
fn test_invalid_config_is_fatal() {
    let temp = workspace("true");
    let output = run(&temp, &["--timeout", "0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("timeout_secs"));
}

#[test]
fn test_explore_without_baseline_generates_nothing() {
    let temp = workspace("true");
    let output = rigour(
        temp.path(),
        &[
            "explore",
            "scenes.yaml",
            "--connection",
            "connection.yaml",
            "--planner",
            "template",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(output.stdout.is_empty());
    assert!(stderr(&output).contains("No edge cases generated for health"));
}

#[test]
fn test_init_writes_files_and_refuses_overwrite() {
    let temp = TempDir::new().unwrap();

    let output = rigour(temp.path(), &["init"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    for name in ["scenes.yaml", "connection.yaml", "rigour.yml"] {
        assert!(temp.path().join(name).exists(), "{name} missing");
    }

    let output = rigour(temp.path(), &["init"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--force"));

    let output = rigour(temp.path(), &["init", "--force"]);
    assert!(output.status.success());
}

#[test]
fn test_feature_file_runs_each_scenario() {
    let temp = workspace("true");
    std::fs::write(
        temp.path().join("login.feature"),
        "Feature: Login\n  Scenario: Valid credentials\n    When POST /login\n    Then a session is returned\n\n  Scenario: Wrong password\n    When POST /login\n    Then the login is refused\n",
    )
    .unwrap();

    let output = rigour(
        temp.path(),
        &[
            "run",
            "login.feature",
            "--connection",
            "connection.yaml",
            "--planner",
            "template",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: Report = serde_json::from_slice(&output.stdout).unwrap();
    let titles: Vec<_> = report.scenes.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, ["Valid credentials", "Wrong password"]);
}

#[test]
fn test_duplicate_scene_ids_are_fatal() {
    let temp = workspace("true");
    std::fs::write(
        temp.path().join("scenes.yaml"),
        "- id: health\n  title: A\n  description: a\n- id: health\n  title: B\n  description: b\n",
    )
    .unwrap();

    let output = run(&temp, &[]);
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(stderr(&output).contains("duplicate scene id 'health'"));
}

#[test]
fn test_scene_from_text_uses_agent_backend() {
    let temp = workspace("true");
    let work = temp.path().join("work");
    std::fs::write(
        temp.path().join("rigour.yml"),
        format!(
            r#"executor:
  command: "true"
  args: []
  work_root: {}
backend:
  command: sh
  args: ["-c", "cat > /dev/null; echo '{{\"title\": \"Health\", \"description\": \"up\", \"steps\": [{{\"action\": \"GET /health\"}}]}}'"]
  prompt_mode: stdin
"#,
            work.display()
        ),
    )
    .unwrap();

    let output = rigour(
        temp.path(),
        &[
            "run",
            "--from-text",
            "the health endpoint answers",
            "--connection",
            "connection.yaml",
            "--planner",
            "template",
        ],
    );
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: Report = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report.summary.total, 1);
    assert_eq!(report.scenes[0].title, "Health");
}

#[test]
fn test_scene_from_text_backend_failure_is_fatal() {
    let temp = workspace("true");
    let output = rigour(
        temp.path(),
        &[
            "run",
            "--from-text",
            "anything",
            "--connection",
            "connection.yaml",
        ],
    );
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    assert!(stderr(&output).contains("scene_parser"));
}
