//! Container-based sandbox driven through the podman/docker CLI.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::runner::{run_process, Invocation};

use super::provider::{ProvisionRequest, SandboxHandle, SandboxProvider, TeardownOutcome};

/// Git credential helper that reads the token from the sandbox environment,
/// keeping it off every command line.
pub(crate) const TOKEN_CREDENTIAL_HELPER: &str =
    "credential.helper=!f() { echo username=x-access-token; echo \"password=$GITHUB_TOKEN\"; }; f";

const RUNTIME_TIMEOUT: Duration = Duration::from_secs(120);

/// Settings for [`ContainerSandbox`].
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    /// Container runtime binary (`podman` or `docker`).
    pub runtime: String,
    pub image: String,
    /// Directory the container starts in.
    pub workdir: PathBuf,
    /// Clone the origin repository into `<workdir>/repo` after start.
    pub clone_repository: bool,
    /// Base URL repositories are cloned from.
    pub clone_base_url: String,
    /// Forward the host's `GITHUB_TOKEN` into the container.
    pub forward_token: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "podman".to_string(),
            image: "node:20-bookworm".to_string(),
            workdir: PathBuf::from("/workspace"),
            clone_repository: true,
            clone_base_url: "https://github.com".to_string(),
            forward_token: true,
        }
    }
}

/// Provider that runs each task in its own long-lived container.
///
/// The container's main process is `sleep <lifetime>` and it is started with
/// `--rm`, so the runtime itself removes it once the lifetime elapses.
pub struct ContainerSandbox {
    settings: ContainerSettings,
}

impl ContainerSandbox {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }

    fn runtime(&self) -> Command {
        Command::new(&self.settings.runtime)
    }

    /// Arguments for `<runtime> run`.
    fn run_args(&self, handle: &SandboxHandle, request: &ProvisionRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            handle.id.clone(),
            "--memory".to_string(),
            request.limits.memory.clone(),
            "--cpus".to_string(),
            request.limits.cpus.to_string(),
            "--workdir".to_string(),
            self.settings.workdir.to_string_lossy().into_owned(),
            "--label".to_string(),
            format!("assignment-engine.task={}", request.task_id),
        ];
        for (key, value) in &request.environment {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        if self.settings.forward_token {
            // Bare name: the runtime copies the value from the host environment.
            args.push("-e".to_string());
            args.push("GITHUB_TOKEN".to_string());
        }
        args.push(self.settings.image.clone());
        args.push("sleep".to_string());
        args.push(request.limits.lifetime.as_secs().max(1).to_string());
        args
    }

    /// Arguments for `<runtime> exec`.
    fn exec_args(
        &self,
        handle: &SandboxHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Vec<String> {
        let workdir = match &invocation.workdir {
            Some(dir) => handle.workdir.join(dir),
            None => handle.workdir.clone(),
        };

        let mut args = vec!["exec".to_string()];
        if invocation.stdin.is_some() {
            args.push("-i".to_string());
        }
        args.push("--workdir".to_string());
        args.push(workdir.to_string_lossy().into_owned());
        for (key, value) in &invocation.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(handle.id.clone());
        // Deadline enforced inside the container as well, where the runner's
        // process-group kill cannot reach.
        args.extend([
            "timeout".to_string(),
            "-s".to_string(),
            "KILL".to_string(),
            timeout.as_secs().max(1).to_string(),
        ]);
        args.push(invocation.program.clone());
        args.extend(invocation.args.iter().cloned());
        args
    }

    fn clone_args(&self, handle: &SandboxHandle, repository: &str) -> Vec<String> {
        vec![
            "exec".to_string(),
            handle.id.clone(),
            "git".to_string(),
            "-c".to_string(),
            TOKEN_CREDENTIAL_HELPER.to_string(),
            "clone".to_string(),
            "--".to_string(),
            format!(
                "{}/{}.git",
                self.settings.clone_base_url.trim_end_matches('/'),
                repository
            ),
            handle.workdir.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
impl SandboxProvider for ContainerSandbox {
    fn name(&self) -> &str {
        &self.settings.runtime
    }

    fn reserve(&self, request: &ProvisionRequest) -> SandboxHandle {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        let lifetime = chrono::Duration::from_std(request.limits.lifetime)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let workdir = if self.settings.clone_repository {
            self.settings.workdir.join("repo")
        } else {
            self.settings.workdir.clone()
        };

        SandboxHandle {
            id: format!("engine-{}-{}", request.origin.issue, &suffix[..12]),
            task_id: request.task_id.clone(),
            workdir,
            environment: request.environment.clone(),
            created_at: now,
            expires_at: now + lifetime,
        }
    }

    async fn provision(&self, handle: &SandboxHandle, request: &ProvisionRequest) -> Result<()> {
        let mut command = self.runtime();
        command.args(self.run_args(handle, request));

        let output = run_process(command, None, RUNTIME_TIMEOUT, "container run")
            .await
            .map_err(|e| {
                Error::Provision(format!(
                    "container runtime '{}' unavailable: {}",
                    self.settings.runtime, e
                ))
            })?;
        if !output.success() {
            return Err(Error::Provision(format!(
                "{} run failed: {}",
                self.settings.runtime,
                output.stderr.trim()
            )));
        }

        tracing::info!(
            sandbox = %handle,
            container = %output.stdout.trim(),
            image = %self.settings.image,
            memory = %request.limits.memory,
            cpus = request.limits.cpus,
            "container started"
        );

        if self.settings.clone_repository {
            let mut command = self.runtime();
            command.args(self.clone_args(handle, &request.origin.repository));
            let output = run_process(command, None, RUNTIME_TIMEOUT, "git clone")
                .await
                .map_err(|e| Error::Provision(e.to_string()))?;
            if !output.success() {
                return Err(Error::Provision(format!(
                    "failed to clone {}: {}",
                    request.origin.repository,
                    output.stderr.trim()
                )));
            }
            tracing::info!(sandbox = %handle, repository = %request.origin.repository, "repository cloned");
        }

        Ok(())
    }

    fn command(
        &self,
        handle: &SandboxHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<Command> {
        let mut command = self.runtime();
        command.args(self.exec_args(handle, invocation, timeout));
        Ok(command)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<TeardownOutcome> {
        let mut command = self.runtime();
        command.args(["rm", "-f", handle.id.as_str()]);

        let output = run_process(command, None, RUNTIME_TIMEOUT, "container rm").await?;
        if output.success() {
            return Ok(TeardownOutcome::Removed);
        }
        if output.stderr.to_lowercase().contains("no such container") {
            return Ok(TeardownOutcome::AlreadyGone);
        }
        Err(Error::Teardown {
            id: handle.id.clone(),
            reason: output.stderr.trim().to_string(),
        })
    }
}
