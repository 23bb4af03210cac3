//! Publishing task results back to the origin.
//!
//! [`ResultPublisher`] is the seam between the dispatcher and the forge.
//! [`GhPublisher`] commits and pushes from inside the sandbox, then uses the
//! `gh` CLI on the host to open the pull request and comment on the issue.
//! [`StatusLedger`] sits in front of `post_status` and makes sure each task
//! reports each terminal state at most once.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::backoff::ExponentialBackoff;
use crate::error::{Error, Result};
use crate::report;
use crate::runner::{run_process, CommandRunner, Invocation};
use crate::sandbox::{SandboxHandle, TOKEN_CREDENTIAL_HELPER};
use crate::task::{Origin, Task, TaskId, TaskState};

/// A pushed commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub branch: String,
    pub sha: String,
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.sha)
    }
}

/// An opened change request (pull request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub number: u64,
    pub url: String,
}

/// Publishes results and status updates to the origin.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// Commits and pushes the sandbox's changes. `None` means there was
    /// nothing to commit.
    async fn commit_changes(&self, handle: &SandboxHandle, task: &Task) -> Result<Option<CommitRef>>;

    /// Opens a change request for a pushed commit.
    async fn open_change_request(
        &self,
        task: &Task,
        commit: &CommitRef,
        summary: &str,
    ) -> Result<ChangeRef>;

    /// Posts a status message on the origin issue.
    async fn post_status(&self, origin: &Origin, message: &str) -> Result<()>;
}

/// Settings for [`GhPublisher`].
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Branches are named `<prefix>/issue-<n>`.
    pub branch_prefix: String,
    pub base_branch: String,
    pub author_name: String,
    pub author_email: String,
    pub gh_program: String,
    /// Timeout for each git or `gh` command.
    pub command_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            branch_prefix: "xbot".to_string(),
            base_branch: "main".to_string(),
            author_name: "xBot".to_string(),
            author_email: "xbot@users.noreply.github.com".to_string(),
            gh_program: "gh".to_string(),
            command_timeout: Duration::from_secs(120),
        }
    }
}

/// Publisher backed by git in the sandbox and the `gh` CLI on the host.
pub struct GhPublisher {
    runner: Arc<dyn CommandRunner>,
    settings: PublisherSettings,
}

impl GhPublisher {
    /// Creates a publisher that runs git through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: PublisherSettings) -> Self {
        Self { runner, settings }
    }

    fn branch_for(&self, origin: &Origin) -> String {
        format!("{}/issue-{}", self.settings.branch_prefix, origin.issue)
    }

    async fn git(&self, handle: &SandboxHandle, invocation: Invocation) -> Result<String> {
        let label = invocation.display();
        let output = self
            .runner
            .run(handle, invocation, self.settings.command_timeout)
            .await
            .map_err(publish_error)?
            .into_success(&label)
            .map_err(|e| Error::Publish(e.to_string()))?;
        Ok(output.stdout)
    }

    /// Runs `gh` on the host with `stdin` as the body file.
    async fn gh(&self, args: &[&str], stdin: &str) -> Result<String> {
        let mut command = Command::new(&self.settings.gh_program);
        command.args(args);
        let label = format!("{} {}", self.settings.gh_program, args.join(" "));

        let output = run_process(
            command,
            Some(stdin.as_bytes().to_vec()),
            self.settings.command_timeout,
            &label,
        )
        .await
        .map_err(publish_error)?
        .into_success(&label)
        .map_err(|e| Error::Publish(e.to_string()))?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl ResultPublisher for GhPublisher {
    async fn commit_changes(&self, handle: &SandboxHandle, task: &Task) -> Result<Option<CommitRef>> {
        let status = self
            .git(handle, Invocation::new("git").args(["status", "--porcelain"]))
            .await?;
        if status.trim().is_empty() {
            tracing::info!(task_id = %task.id, "no changes to commit");
            return Ok(None);
        }

        let branch = self.branch_for(&task.origin);
        self.git(handle, Invocation::new("git").args(["checkout", "-B", &branch]))
            .await?;
        self.git(handle, Invocation::new("git").args(["add", "-A"]))
            .await?;

        let user_name = format!("user.name={}", self.settings.author_name);
        let user_email = format!("user.email={}", self.settings.author_email);
        self.git(
            handle,
            Invocation::new("git")
                .args(["-c", &user_name, "-c", &user_email, "commit", "-F", "-"])
                .stdin(report::commit_message(task)),
        )
        .await?;

        let sha = self
            .git(handle, Invocation::new("git").args(["rev-parse", "HEAD"]))
            .await?
            .trim()
            .to_string();

        self.git(
            handle,
            Invocation::new("git").args([
                "-c",
                TOKEN_CREDENTIAL_HELPER,
                "push",
                "--force-with-lease",
                "-u",
                "origin",
                &branch,
            ])
            // Fail fast instead of prompting when the helper has no token.
            .env("GIT_TERMINAL_PROMPT", "0"),
        )
        .await?;

        tracing::info!(task_id = %task.id, branch = %branch, sha = %sha, "changes pushed");
        Ok(Some(CommitRef { branch, sha }))
    }

    async fn open_change_request(
        &self,
        task: &Task,
        commit: &CommitRef,
        summary: &str,
    ) -> Result<ChangeRef> {
        let title = report::change_title(task);
        let body = report::change_body(task, summary, &commit.branch);

        let stdout = self
            .gh(
                &[
                    "pr",
                    "create",
                    "--repo",
                    &task.origin.repository,
                    "--title",
                    &title,
                    "--body-file",
                    "-",
                    "--head",
                    &commit.branch,
                    "--base",
                    &self.settings.base_branch,
                ],
                &body,
            )
            .await?;

        let change = parse_change_url(&stdout)?;
        tracing::info!(task_id = %task.id, number = change.number, url = %change.url, "pull request opened");
        Ok(change)
    }

    async fn post_status(&self, origin: &Origin, message: &str) -> Result<()> {
        let issue = origin.issue.to_string();
        self.gh(
            &[
                "issue",
                "comment",
                &issue,
                "--repo",
                &origin.repository,
                "--body-file",
                "-",
            ],
            message,
        )
        .await?;
        Ok(())
    }
}

/// Wraps a command failure as a publish error, keeping timeouts distinct
/// because a timed-out command may still have taken effect.
fn publish_error(e: Error) -> Error {
    match e {
        Error::Timeout { .. } => e,
        other => Error::Publish(other.to_string()),
    }
}

/// Extracts the pull request URL and number from `gh pr create` output.
fn parse_change_url(stdout: &str) -> Result<ChangeRef> {
    let url = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| l.starts_with("http"))
        .ok_or_else(|| Error::Publish(format!("no pull request URL in output: {}", stdout.trim())))?;

    let number = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    Ok(ChangeRef {
        number,
        url: url.to_string(),
    })
}

/// Delivers terminal status updates at most once per task and state.
pub struct StatusLedger {
    delivered: Mutex<HashSet<(TaskId, TaskState)>>,
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for StatusLedger {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl StatusLedger {
    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            delivered: Mutex::new(HashSet::new()),
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Posts the terminal status of `task`, retrying with backoff.
    ///
    /// A timed-out post is not retried: the comment may already exist and
    /// posting again would duplicate it.
    ///
    /// Returns false if a status for this task and state was already
    /// claimed, if the task is not terminal, or if every attempt failed.
    /// Delivery failures are logged and never raised.
    pub async fn deliver(&self, publisher: &dyn ResultPublisher, task: &Task) -> bool {
        let Some(message) = report::status_message(task) else {
            tracing::debug!(task_id = %task.id, state = ?task.state, "no status for non-terminal task");
            return false;
        };

        let key = (task.id.clone(), task.state);
        if !self
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
        {
            tracing::debug!(task_id = %task.id, state = ?task.state, "status already posted");
            return false;
        }

        let mut backoff = ExponentialBackoff::new(self.initial_backoff, self.max_backoff);
        for attempt in 1..=self.attempts {
            match publisher.post_status(&task.origin, &message).await {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, state = ?task.state, "status posted");
                    return true;
                }
                Err(e @ Error::Timeout { .. }) => {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt,
                        error = %e,
                        "status delivery timed out, not retrying"
                    );
                    return false;
                }
                Err(e) if attempt < self.attempts => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        task_id = %task.id,
                        attempt,
                        error = %e,
                        retry_in = ?delay,
                        "status delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %task.id,
                        attempts = self.attempts,
                        error = %e,
                        "status delivery failed, giving up"
                    );
                }
            }
        }
        false
    }
}
