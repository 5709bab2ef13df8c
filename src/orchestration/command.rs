//! Out-of-process workers and scorers driven by a shell command.
//!
//! The worker command is run once per assignment with the assignment in its
//! environment and must print a JSON report on stdout:
//!
//! ```text
//! {"status": "completed", "touched": ["src/lib.rs"], "summary": "..."}
//! ```
//!
//! Every line the worker writes, on either stream, counts as progress.
//! Long-running workers should print to stderr now and then; a silent one
//! is treated as stale and loses its task.
//!
//! The scorer command receives artifact paths as arguments and prints a
//! JSON array of findings.

use crate::orchestration::convergence::{Finding, FindingScorer, Repairer};
use crate::orchestration::worker::{
    Assignment, ProgressReporter, ReportStatus, WorkerExecutor, WorkerReport, WorkerRole,
};
use crate::util::truncate_utf8;
use crate::{clog_debug, clog_warn, Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Default upper bound on one command invocation.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 3600;

const STDERR_EXCERPT_BYTES: usize = 512;

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn stderr_excerpt(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    truncate_utf8(stderr.trim(), STDERR_EXCERPT_BYTES).to_string()
}

/// Turn a finished worker process into a report. A non-zero exit or
/// unparsable stdout is a failure.
pub fn parse_report(output: &Output) -> WorkerReport {
    if !output.status.success() {
        let excerpt = stderr_excerpt(output);
        let reason = if excerpt.is_empty() {
            format!(
                "worker command exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            excerpt
        };
        return WorkerReport::failed(reason);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    match serde_json::from_str::<WorkerReport>(stdout.trim()) {
        Ok(report) => report,
        Err(e) => WorkerReport::failed(format!("unparsable worker output: {}", e)),
    }
}

pub struct CommandWorker {
    command: String,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Run the command for `assignment`, beating `progress` once per line
    /// of output.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned, its output is not
    /// UTF-8, or it runs past the timeout. The child is killed when the
    /// returned future is dropped.
    pub async fn run(
        &self,
        assignment: &Assignment,
        progress: Option<&ProgressReporter>,
    ) -> Result<WorkerReport> {
        let mut cmd = shell(&self.command);
        cmd.env("CADENCE_TASK_ID", assignment.task_id.as_str())
            .env("CADENCE_SUBJECT", &assignment.subject)
            .env("CADENCE_TARGETS", assignment.targets.join("\n"))
            .env("CADENCE_RISK_TIER", assignment.risk_tier.value().to_string())
            .env(
                "CADENCE_VERIFY_STEPS",
                assignment.verification_steps.to_string(),
            )
            .env("CADENCE_ROLE", assignment.role.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        clog_debug!("running worker command for {}", assignment.task_id);
        let mut child = cmd.spawn()?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::Command("worker output was not captured".to_string()));
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let (mut out_open, mut err_open) = (true, true);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        while out_open || err_open {
            tokio::select! {
                line = out_lines.next_line(), if out_open => match line? {
                    Some(line) => {
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                        beat(progress).await;
                    }
                    None => out_open = false,
                },
                line = err_lines.next_line(), if err_open => match line? {
                    Some(line) => {
                        if stderr_buf.len() < STDERR_EXCERPT_BYTES {
                            stderr_buf.push_str(&line);
                            stderr_buf.push('\n');
                        }
                        beat(progress).await;
                    }
                    None => err_open = false,
                },
                _ = &mut deadline => return Err(Error::Timeout(self.timeout)),
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = &mut deadline => return Err(Error::Timeout(self.timeout)),
        };
        Ok(parse_report(&Output {
            status,
            stdout: stdout_buf.into_bytes(),
            stderr: stderr_buf.into_bytes(),
        }))
    }
}

async fn beat(progress: Option<&ProgressReporter>) {
    if let Some(progress) = progress {
        progress.beat().await;
    }
}

#[async_trait]
impl WorkerExecutor for CommandWorker {
    async fn execute(&self, assignment: &Assignment, progress: &ProgressReporter) -> WorkerReport {
        match self.run(assignment, Some(progress)).await {
            Ok(report) => report,
            Err(e) => {
                clog_warn!("Worker command for {} failed: {}", assignment.task_id, e);
                WorkerReport::failed(e.to_string())
            }
        }
    }
}

/// A repair round is one worker invocation whose targets are the artifacts
/// carrying findings.
#[async_trait]
impl Repairer for CommandWorker {
    async fn repair(&self, round: u32, findings: &[Finding]) -> Result<Vec<String>> {
        let mut targets: Vec<String> = findings.iter().map(|f| f.artifact.clone()).collect();
        targets.sort();
        targets.dedup();
        let assignment = Assignment {
            task_id: format!("repair-{}", round).into(),
            subject: format!("repair {} findings", findings.len()),
            kind: Default::default(),
            targets,
            risk_tier: Default::default(),
            verification_steps: 0,
            role: WorkerRole::Implementer,
        };
        let report = self.run(&assignment, None).await?;
        match report.status {
            ReportStatus::Completed => Ok(report.touched),
            _ => Err(Error::Command(
                report
                    .summary
                    .unwrap_or_else(|| format!("repair round {} did not complete", round)),
            )),
        }
    }
}

pub struct CommandScorer {
    command: String,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandScorer {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl FindingScorer for CommandScorer {
    async fn rescore(&self, artifacts: &[String]) -> Result<Vec<Finding>> {
        let mut cmd = shell(&format!("{} \"$@\"", self.command));
        cmd.arg("cadence-scorer")
            .args(artifacts)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))??;
        if !output.status.success() {
            return Err(Error::Command(format!(
                "scorer exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr_excerpt(&output)
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str(stdout.trim())?)
    }
}
