//! Git worktree-based sandbox implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::runner::{run_process, Invocation};

use super::provider::{ProvisionRequest, SandboxHandle, SandboxProvider, TeardownOutcome};

const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider that creates sandboxes using git worktrees.
///
/// Gives filesystem isolation from the main checkout on hosts without a
/// container runtime. Memory and CPU ceilings cannot be enforced here; the
/// lifetime ceiling is still applied by the manager.
#[derive(Clone)]
pub struct WorktreeSandbox {
    /// Path to the git repository.
    repo_path: PathBuf,
    /// Base directory for worktrees. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
}

impl WorktreeSandbox {
    /// Creates a new worktree sandbox provider.
    pub fn new(repo_path: PathBuf, base_dir: Option<PathBuf>) -> Self {
        Self {
            repo_path,
            base_dir,
        }
    }

    fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("assignment-engine-sandboxes"),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<crate::runner::CommandOutput> {
        let mut command = Command::new("git");
        command.current_dir(dir).args(args);
        run_process(command, None, GIT_TIMEOUT, &format!("git {}", args.join(" "))).await
    }
}

#[async_trait]
impl SandboxProvider for WorktreeSandbox {
    fn name(&self) -> &str {
        "worktree"
    }

    fn reserve(&self, request: &ProvisionRequest) -> SandboxHandle {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let branch_name = format!("engine-sandbox-{}-{}", request.origin.issue, &suffix[..8]);
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(request.limits.lifetime)
            .unwrap_or_else(|_| chrono::Duration::zero());

        SandboxHandle {
            workdir: self.base_dir().join(&branch_name),
            id: branch_name,
            task_id: request.task_id.clone(),
            environment: request.environment.clone(),
            created_at: now,
            expires_at: now + lifetime,
        }
    }

    async fn provision(&self, handle: &SandboxHandle, request: &ProvisionRequest) -> Result<()> {
        tokio::fs::create_dir_all(self.base_dir()).await?;

        let worktree_path = handle.workdir.to_string_lossy().into_owned();
        let output = self
            .git(
                &self.repo_path,
                &["worktree", "add", "-b", &handle.id, &worktree_path, "HEAD"],
            )
            .await
            .map_err(|e| Error::Provision(e.to_string()))?;

        if !output.success() {
            return Err(Error::Provision(format!(
                "git worktree add failed: {}",
                output.stderr.trim()
            )));
        }

        tracing::info!(
            path = ?handle.workdir,
            branch = %handle.id,
            memory = %request.limits.memory,
            cpus = request.limits.cpus,
            "created worktree sandbox (resource limits not enforced)"
        );
        Ok(())
    }

    fn command(
        &self,
        handle: &SandboxHandle,
        invocation: &Invocation,
        _timeout: Duration,
    ) -> Result<Command> {
        let dir = match &invocation.workdir {
            Some(dir) if dir.is_absolute() => {
                return Err(Error::Runner(format!(
                    "working directory {} escapes the sandbox",
                    dir.display()
                )))
            }
            Some(dir) => handle.workdir.join(dir),
            None => handle.workdir.clone(),
        };

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(dir)
            .envs(&handle.environment)
            .envs(&invocation.env);
        Ok(command)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<TeardownOutcome> {
        let outcome = if handle.workdir.exists() {
            let worktree_path = handle.workdir.to_string_lossy().into_owned();
            let output = self
                .git(&self.repo_path, &["worktree", "remove", "--force", &worktree_path])
                .await?;
            if !output.success() {
                return Err(Error::Teardown {
                    id: handle.id.clone(),
                    reason: output.stderr.trim().to_string(),
                });
            }
            TeardownOutcome::Removed
        } else {
            // Directory vanished underneath us; forget the stale registration.
            self.git(&self.repo_path, &["worktree", "prune"]).await?;
            TeardownOutcome::AlreadyGone
        };

        let output = self
            .git(&self.repo_path, &["branch", "-D", &handle.id])
            .await?;
        if !output.success() {
            // Branch deletion failure is non-fatal - worktree is already gone
            tracing::debug!(
                branch = %handle.id,
                "worktree branch not deleted, may already be gone"
            );
        }

        Ok(outcome)
    }
}
