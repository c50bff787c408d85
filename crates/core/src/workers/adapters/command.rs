//! Subprocess worker.
//!
//! Spawns a configured command per job, writes the [`Job`] as JSON to its
//! stdin and reads [`WorkerEvent`]s back from stdout as JSON Lines.

use crate::workers::base::{Job, Worker, WorkerError, WorkerEvent, WorkerStream};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Worker backed by an external executable.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn check_availability(&self) -> bool {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.status().await.is_ok()
    }

    /// Execute a job in a fresh subprocess.
    ///
    /// Empty stdout lines are skipped. A line that is not a valid event
    /// yields `StreamParse` and execution continues. If the process exits
    /// without a final event the stream ends with an `Execution` error.
    async fn execute(&self, job: &Job) -> Result<WorkerStream, WorkerError> {
        let input = serde_json::to_vec(job)
            .map_err(|e| WorkerError::Execution(format!("Failed to encode job: {e}")))?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            WorkerError::Unavailable(format!("Failed to spawn command '{}': {e}", self.command))
        })?;

        let command = self.command.clone();
        let stream = async_stream::stream! {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(e) = stdin.write_all(&input).await {
                    yield Err(WorkerError::Execution(format!("Failed to write job: {e}")));
                    return;
                }
                drop(stdin);
            }

            let stdout = match child.stdout.take() {
                Some(stdout) => stdout,
                None => {
                    yield Err(WorkerError::Execution("Failed to capture stdout".to_string()));
                    return;
                }
            };

            let mut lines = BufReader::new(stdout).lines();
            let mut finished = false;
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(event) => {
                        finished = event.is_final();
                        yield Ok(event);
                        if finished {
                            break;
                        }
                    }
                    Err(e) => {
                        yield Err(WorkerError::StreamParse(format!(
                            "Failed to parse event: {e} (line: {line})"
                        )));
                    }
                }
            }

            let status = child.wait().await;
            if !finished {
                let detail = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                yield Err(WorkerError::Execution(format!(
                    "'{command}' ended without a final event ({detail})"
                )));
            }
        };

        Ok(Box::pin(stream))
    }
}
