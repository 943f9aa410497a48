//! Runs generated artifacts with an external test-runner process.
//!
//! Each attempt gets its own temporary directory under the shared work root,
//! named with the orchestrator's collision-free unit key. The directory is a
//! `TempDir`, so it is removed on every exit path including timeouts and
//! early returns.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rigour_core::ExecutorConfig;
use rigour_proto::{
    Environment, ExecutionError, ExecutionRequest, ExecutionResult, ExecutionStatus, TestExecutor,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::output_parser::{OutputParser, STDERR_PREFIX, parse_capture_file};

/// Placeholder in runner args replaced by the artifact path.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Grace period for draining pipes after the runner exits or is killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const CAPTURE_FILE: &str = "captures.jsonl";

#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    command: String,
    args: Vec<String>,
    work_root: PathBuf,
    extension: String,
    parser: OutputParser,
}

/// Raw outcome of one runner process.
struct RunOutput {
    output: String,
    exit_code: Option<i32>,
    success: bool,
    timed_out: bool,
    captures: Option<String>,
}

impl ProcessExecutor {
    pub fn new(
        command: impl Into<String>,
        args: Vec<String>,
        work_root: impl Into<PathBuf>,
    ) -> Result<Self, ExecutionError> {
        let parser = OutputParser::new().map_err(|e| ExecutionError::Runtime {
            message: format!("invalid output grammar: {e}"),
        })?;
        Ok(Self {
            command: command.into(),
            args,
            work_root: work_root.into(),
            extension: "py".to_string(),
            parser,
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecutionError> {
        Ok(Self::new(config.command.clone(), config.args.clone(), config.work_root())?
            .with_extension(config.artifact_extension.clone()))
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    fn build_args(&self, artifact: &Path) -> Vec<String> {
        let path = artifact.to_string_lossy();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(FILE_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(FILE_PLACEHOLDER, &path)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(path.into_owned());
        }
        args
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        start: Instant,
    ) -> Result<RunOutput, ExecutionError> {
        tokio::fs::create_dir_all(&self.work_root).await?;
        let unit = tempfile::Builder::new()
            .prefix(&request.unit_key)
            .tempdir_in(&self.work_root)?;

        let artifact_path = unit.path().join(format!("test_scene.{}", self.extension));
        tokio::fs::write(&artifact_path, request.plan.full_artifact()).await?;
        let capture_path = unit.path().join(CAPTURE_FILE);

        let args = self.build_args(&artifact_path);
        debug!(
            command = %self.command,
            ?args,
            unit = %unit.path().display(),
            "Spawning test runner"
        );

        let mut command = Command::new(&self.command);
        command
            .args(&args)
            .current_dir(unit.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_environment(&mut command, &request.environment, &capture_path);

        let mut child = command.spawn().map_err(|e| ExecutionError::Runtime {
            message: format!("failed to spawn '{}': {e}", self.command),
        })?;

        let stdout = Drain::spawn(child.stdout.take());
        let stderr = Drain::spawn(child.stderr.take());

        let remaining = request.timeout.saturating_sub(start.elapsed());
        let (exit_code, success, timed_out) =
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    (status.code(), status.success(), false)
                }
                Err(_) => {
                    warn!(
                        unit_key = %request.unit_key,
                        timeout_ms = request.timeout.as_millis() as u64,
                        "Test runner timed out, killing"
                    );
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, "Failed to kill test runner");
                    }
                    (None, false, true)
                }
            };

        let output = combine(&stdout.finish().await, &stderr.finish().await);
        let captures = tokio::fs::read_to_string(&capture_path).await.ok();

        Ok(RunOutput {
            output,
            exit_code,
            success,
            timed_out,
            captures,
        })
    }

    /// Turns a finished run into a result using the output grammar.
    fn interpret(
        &self,
        plan_id: &str,
        run: RunOutput,
        timeout_ms: u64,
        duration_ms: u64,
    ) -> ExecutionResult {
        if run.timed_out {
            return ExecutionResult::error(
                plan_id,
                ExecutionError::Timeout { timeout_ms }.to_string(),
                run.output,
                duration_ms,
            );
        }

        let parsed = self.parser.parse(&run.output);
        let mut captured = parsed.captured.clone();
        if let Some(content) = &run.captures {
            parse_capture_file(content, &mut captured);
        }

        let mut result = if parsed.has_summary() {
            let failed = parsed.failed.unwrap_or(0);
            let mut result = ExecutionResult::from_counts(
                plan_id,
                parsed.passed.unwrap_or(0),
                failed,
                parsed.skipped.unwrap_or(0),
                duration_ms,
                run.output.clone(),
            );
            if parsed.errors.unwrap_or(0) > 0 && failed == 0 {
                result.status = ExecutionStatus::Error;
            }
            result
        } else if run.success || run.output.contains("no tests ran") {
            let (passed, failed) = parsed.counts_from_checks();
            ExecutionResult::from_counts(plan_id, passed, failed, 0, duration_ms, run.output.clone())
        } else {
            ExecutionResult::error(
                plan_id,
                format!(
                    "runner exited with code {} and no parseable summary",
                    run.exit_code
                        .map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
                run.output.clone(),
                duration_ms,
            )
        };

        if result.error_message.is_none() && result.status != ExecutionStatus::Passed {
            result.error_message = parsed.first_failure.clone();
        }
        result.checks = parsed.checks;
        result.captured = captured;
        result.exit_code = run.exit_code;
        result
    }
}

#[async_trait]
impl TestExecutor for ProcessExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();
        let plan_id = request.plan.id.clone();

        let outcome = self.run(&request, start).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(run) => self.interpret(
                &plan_id,
                run,
                request.timeout.as_millis() as u64,
                duration_ms,
            ),
            Err(e) => {
                warn!(plan_id = %plan_id, error = %e, "Test execution failed");
                ExecutionResult::error(&plan_id, e.to_string(), String::new(), duration_ms)
            }
        }
    }
}

fn apply_environment(command: &mut Command, environment: &Environment, capture_path: &Path) {
    let headers = serde_json::to_string(&environment.headers).unwrap_or_else(|_| "{}".to_string());
    command
        .env("RIGOUR_BASE_URL", &environment.base_url)
        .env(
            "RIGOUR_TIMEOUT_MS",
            environment.timeout.as_millis().to_string(),
        )
        .env("RIGOUR_HEADERS", headers)
        .env("RIGOUR_CAPTURE_FILE", capture_path);
}

/// Background reader that keeps whatever it has read even if the stream
/// never reaches EOF (e.g. a grandchild still holds the pipe).
struct Drain {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: Option<JoinHandle<()>>,
}

impl Drain {
    fn spawn<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let handle = stream.map(|mut stream| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buffer, handle }
    }

    async fn finish(self) -> String {
        if let Some(handle) = self.handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                abort.abort();
            }
        }
        let bytes = self
            .buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    let mut output = stdout.to_string();
    for line in stderr.lines() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(STDERR_PREFIX);
        output.push_str(line);
        output.push('\n');
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use rigour_proto::{Connection, PlanDraft, Scene, TestPlan};
    use serde_json::json;
    use tempfile::TempDir;

    fn sh_executor(root: &Path) -> ProcessExecutor {
        ProcessExecutor::new("sh", vec![FILE_PLACEHOLDER.to_string()], root)
            .unwrap()
            .with_extension("sh")
    }

    fn request(script: &str, timeout: Duration) -> ExecutionRequest {
        let scene = Scene::new("t", "d").unwrap();
        ExecutionRequest {
            plan: TestPlan::from_draft(&scene, PlanDraft::new(script)).unwrap(),
            environment: Connection::new("http://api.test/").environment(),
            unit_key: "rigour-test-0-".to_string(),
            timeout,
        }
    }

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_passing_run_with_captures() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let script = r#"
echo "test_scene.sh::test_health PASSED"
echo 'RIGOUR_CAPTURE response {"status_code": 200, "body": "ok"}'
echo "1 passed in 0.01s"
"#;
        let result = executor
            .execute(request(script, Duration::from_secs(10)))
            .await;

        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.passed_count, 1);
        assert_eq!(result.total_count, 1);
        assert_eq!(result.checks.len(), 1);
        assert_eq!(result.captured["response"]["status_code"], 200);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_counts_in_captured_bodies_do_not_fail_a_passing_run() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let script = r#"
echo 'RIGOUR_CAPTURE response {"body": "2 failed attempts"}'
echo "account locked after 2 failed attempts" >&2
echo "1 passed"
"#;
        let result = executor
            .execute(request(script, Duration::from_secs(10)))
            .await;

        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.passed_count, 1);
        assert_eq!(result.failed_count, 0);
        assert_eq!(result.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_failed_run_keeps_first_failure() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let script = r#"
echo "FAILED test_scene.sh::test_health - assert 500 == 200"
echo "1 failed, 2 passed in 0.02s"
exit 1
"#;
        let result = executor
            .execute(request(script, Duration::from_secs(10)))
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.passed_count, 2);
        assert_eq!(
            result.error_message.as_deref(),
            Some("FAILED test_scene.sh::test_health - assert 500 == 200")
        );
        assert_eq!(result.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_summary_is_error() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let result = executor
            .execute(request("echo boom >&2; exit 3", Duration::from_secs(10)))
            .await;

        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.output.contains("[stderr] boom"));
        assert!(result.error_message.unwrap().contains("code 3"));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_collection_error_is_error_status() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let result = executor
            .execute(request(
                "echo 'ERROR test_scene.sh'; echo '1 error in 0.01s'; exit 2",
                Duration::from_secs(10),
            ))
            .await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.error_message.as_deref(), Some("ERROR test_scene.sh"));
    }

    #[tokio::test]
    async fn test_timeout_kills_and_cleans_up() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let start = Instant::now();
        let result = executor
            .execute(request("echo started; exec sleep 30", Duration::from_millis(300)))
            .await;

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.error_message.unwrap().contains("timed out"));
        assert!(result.output.contains("started"));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_environment_and_capture_file() {
        let root = TempDir::new().unwrap();
        let executor = sh_executor(root.path());
        let script = r#"
printf '{"target": "env", "value": {"base": "%s", "timeout": "%s"}}\n' "$RIGOUR_BASE_URL" "$RIGOUR_TIMEOUT_MS" >> "$RIGOUR_CAPTURE_FILE"
echo "1 passed"
"#;
        let result = executor
            .execute(request(script, Duration::from_secs(10)))
            .await;

        assert_eq!(
            result.captured["env"],
            json!({"base": "http://api.test", "timeout": "30000"})
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let root = TempDir::new().unwrap();
        let executor =
            ProcessExecutor::new("/nonexistent/rigour-runner", vec![], root.path()).unwrap();
        let result = executor
            .execute(request("irrelevant", Duration::from_secs(5)))
            .await;
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.error_message.unwrap().contains("failed to spawn"));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_units_do_not_collide() {
        let root = TempDir::new().unwrap();
        let executor = Arc::new(sh_executor(root.path()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let executor = Arc::clone(&executor);
            handles.push(tokio::spawn(async move {
                let mut req = request(
                    &format!("echo 'RIGOUR_CAPTURE n {i}'; sleep 0.1; echo '1 passed'"),
                    Duration::from_secs(10),
                );
                req.unit_key = format!("rigour-s{i}-{i}-");
                executor.execute(req).await
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let result = handle.await.unwrap();
            assert_eq!(result.status, ExecutionStatus::Passed);
            assert_eq!(result.captured["n"], i);
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_build_args_substitutes_or_appends() {
        let root = Path::new("/tmp");
        let with = ProcessExecutor::new("python3", vec!["-m".into(), "pytest".into(), "{file}".into(), "-v".into()], root).unwrap();
        assert_eq!(
            with.build_args(Path::new("/w/test_scene.py")),
            ["-m", "pytest", "/w/test_scene.py", "-v"]
        );
        let without = ProcessExecutor::new("node", vec!["--test".into()], root).unwrap();
        assert_eq!(
            without.build_args(Path::new("/w/t.js")),
            ["--test", "/w/t.js"]
        );
    }
}
