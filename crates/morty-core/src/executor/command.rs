//! Executor that runs an agent CLI as a subprocess.
//!
//! The job prompt is written to the child's stdin and stderr is inherited.
//! Stdout is captured, echoed to the terminal once the agent exits, and
//! searched for a status block:
//!
//! ```text
//! <!-- MORTY_STATUS -->
//! {"status": "COMPLETED", "tasks_completed": 3}
//! <!-- END_MORTY_STATUS -->
//! ```
//!
//! The block is the only evidence of task progress. A zero exit without one
//! is a failure.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ExecutionResult, JobExecutor, JobRequest};

pub const STATUS_START: &str = "<!-- MORTY_STATUS -->";
pub const STATUS_END: &str = "<!-- END_MORTY_STATUS -->";

/// Runs `program args...` once per job.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(&self, request: &JobRequest) -> Result<ExecutionResult> {
        let prompt = render_prompt(request);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("MORTY_MODULE", &request.module)
            .env("MORTY_JOB", &request.job)
            .env("MORTY_ATTEMPT", request.attempt.to_string())
            .env("MORTY_TASKS_TOTAL", request.tasks.len().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent command '{}' -- is it installed and on PATH?",
                self.program
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // An agent that exits without reading stdin is not an error here;
            // its output decides the outcome.
            if let Err(err) = stdin.write_all(prompt.as_bytes()).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(err).context("failed to write prompt to agent stdin");
                }
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("failed to wait for agent command '{}'", self.program))?;

        if let Err(err) = tokio::io::stdout().write_all(&output.stdout).await {
            tracing::debug!(error = %err, "could not echo agent output");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let block = parse_status_block(&stdout);
        tracing::debug!(
            module = %request.module,
            job = %request.job,
            status = %output.status,
            reported = ?block.as_ref().ok().map(|b| (&b.status, b.tasks_completed)),
            "agent command exited"
        );

        Ok(interpret(request, output.status.success(), &output.status.to_string(), block))
    }
}

/// Progress reported by the agent at the end of its output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusBlock {
    pub status: String,
    pub tasks_completed: usize,
    #[serde(default)]
    pub summary: Option<String>,
}

impl StatusBlock {
    pub fn is_completed(&self) -> bool {
        self.status.eq_ignore_ascii_case("COMPLETED")
    }
}

/// Why no usable status block was found in the agent's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusBlockError {
    Missing,
    Unterminated,
    Malformed(String),
}

impl std::fmt::Display for StatusBlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "no {STATUS_START} block in agent output"),
            Self::Unterminated => write!(f, "{STATUS_START} block has no {STATUS_END} marker"),
            Self::Malformed(err) => write!(f, "{STATUS_START} block is not valid JSON: {err}"),
        }
    }
}

/// Extract the last status block from `output`.
pub fn parse_status_block(output: &str) -> Result<StatusBlock, StatusBlockError> {
    let start = output
        .rfind(STATUS_START)
        .ok_or(StatusBlockError::Missing)?
        + STATUS_START.len();
    let len = output[start..]
        .find(STATUS_END)
        .ok_or(StatusBlockError::Unterminated)?;
    serde_json::from_str(output[start..start + len].trim())
        .map_err(|e| StatusBlockError::Malformed(e.to_string()))
}

/// Fold the exit status and reported block into an [`ExecutionResult`].
fn interpret(
    request: &JobRequest,
    exited_ok: bool,
    exit: &str,
    block: Result<StatusBlock, StatusBlockError>,
) -> ExecutionResult {
    let total = request.tasks.len();
    match (exited_ok, block) {
        (true, Ok(block)) if block.is_completed() => {
            ExecutionResult::succeeded(block.tasks_completed.min(total))
        }
        (true, Ok(block)) => ExecutionResult::failed(
            block.tasks_completed.min(total),
            match block.summary {
                Some(summary) => format!("agent reported status {}: {summary}", block.status),
                None => format!("agent reported status {}", block.status),
            },
        ),
        (true, Err(err)) => ExecutionResult::failed(
            request.tasks_completed,
            format!("agent command exited 0 without completion evidence: {err}"),
        ),
        (false, Ok(block)) => ExecutionResult::failed(
            block.tasks_completed.min(total),
            format!("agent command exited with {exit}"),
        ),
        (false, Err(_)) => ExecutionResult::failed(
            request.tasks_completed,
            format!("agent command exited with {exit}"),
        ),
    }
}

/// Build the prompt handed to the agent for one job.
pub fn render_prompt(request: &JobRequest) -> String {
    let module = request
        .module_display_name
        .as_deref()
        .unwrap_or(&request.module);
    let mut prompt = format!(
        "You are working on job {index} \"{job}\" of module \"{module}\" \
         (attempt {attempt}).\n\nComplete these tasks in order:\n",
        index = request.job_index,
        job = request.job,
        attempt = request.attempt,
    );
    for (i, task) in request.tasks.iter().enumerate() {
        let mark = if i < request.tasks_completed { "x" } else { " " };
        prompt.push_str(&format!("- [{mark}] {task}\n"));
    }
    if request.retry_count > 0 {
        prompt.push_str(&format!(
            "\nPrevious attempts failed {} time(s); {} retries remain.\n",
            request.retry_count,
            request.max_retries.saturating_sub(request.retry_count)
        ));
    }
    prompt.push_str(&format!(
        "\nWhen you stop, print this block as the last thing in your output. \
         Set \"status\" to \"COMPLETED\" only if all {total} tasks are done, \
         otherwise \"FAILED\", and count the leading tasks that are done:\n\
         {STATUS_START}\n\
         {{\"status\": \"COMPLETED\", \"tasks_completed\": <0..={total}>, \"summary\": \"...\"}}\n\
         {STATUS_END}\n",
        total = request.tasks.len(),
    ));
    prompt
}
