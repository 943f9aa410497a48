//! Agent CLI backend: hands a prompt to an external AI command and collects
//! its reply.

use std::process::Stdio;
use std::time::Duration;

use rigour_core::{BackendConfig, PromptMode};
use rigour_proto::CapabilityError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

/// A CLI command that answers prompts on stdout.
#[derive(Debug, Clone)]
pub struct AgentBackend {
    pub command: String,
    pub args: Vec<String>,
    pub prompt_mode: PromptMode,
    /// Flag preceding the prompt in arg mode, e.g. `-p`.
    pub prompt_flag: Option<String>,
    pub timeout: Duration,
}

impl AgentBackend {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            prompt_mode: config.prompt_mode,
            prompt_flag: config.prompt_flag.clone(),
            timeout: config.timeout(),
        }
    }

    /// Claude CLI in print mode.
    pub fn claude() -> Self {
        Self::from_config(&BackendConfig::default())
    }

    /// Builds the argv and, in stdin mode, the input to write.
    pub fn build_command(&self, prompt: &str) -> (String, Vec<String>, Option<String>) {
        let mut args = self.args.clone();
        match self.prompt_mode {
            PromptMode::Arg => {
                if let Some(flag) = &self.prompt_flag {
                    args.push(flag.clone());
                }
                args.push(prompt.to_string());
                (self.command.clone(), args, None)
            }
            PromptMode::Stdin => (self.command.clone(), args, Some(prompt.to_string())),
        }
    }

    /// Runs the backend once and returns its stdout.
    ///
    /// `capability` names the port in any error. A non-zero exit, a spawn
    /// failure or the deadline passing are all `CapabilityError`s.
    pub async fn run(
        &self,
        capability: &'static str,
        prompt: &str,
    ) -> Result<String, CapabilityError> {
        match tokio::time::timeout(self.timeout, self.run_unbounded(capability, prompt)).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                capability,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn run_unbounded(
        &self,
        capability: &'static str,
        prompt: &str,
    ) -> Result<String, CapabilityError> {
        let (cmd, args, stdin_input) = self.build_command(prompt);
        debug!(command = %cmd, capability, prompt_len = prompt.len(), "Invoking agent backend");

        let failed = |e: std::io::Error| CapabilityError::call_failed(capability, e.to_string());

        let mut command = Command::new(&cmd);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if stdin_input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command
            .spawn()
            .map_err(|e| CapabilityError::call_failed(capability, format!("{cmd}: {e}")))?;

        // Written concurrently with the stdout drain so a reply larger than
        // the pipe buffer cannot stall the prompt write.
        let stdin_task = match (stdin_input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })),
            _ => None,
        };

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut collected = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        let mut output = String::new();
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await.map_err(failed)? {
                output.push_str(&line);
                output.push('\n');
            }
        }

        let status = child.wait().await.map_err(failed)?;
        if let Some(task) = stdin_task {
            match task.await {
                Ok(Ok(())) => {}
                // The backend may answer without reading all of its input.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!(capability, "Agent backend closed stdin early");
                }
                Ok(Err(e)) => return Err(failed(e)),
                Err(e) => return Err(CapabilityError::call_failed(capability, e.to_string())),
            }
        }
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            let detail = stderr.trim();
            return Err(CapabilityError::call_failed(
                capability,
                format!(
                    "{cmd} exited with {}{}",
                    status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| format!("code {c}")),
                    if detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {detail}")
                    }
                ),
            ));
        }

        Ok(output)
    }
}
