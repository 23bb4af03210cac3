//! Sandbox provider trait and types.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::runner::Invocation;
use crate::task::{Origin, Task, TaskId};

/// Resource ceilings applied to every sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in container runtime notation (e.g. "2g").
    pub memory: String,
    /// CPU ceiling.
    pub cpus: f64,
    /// Hard lifetime after which the sandbox is destroyed regardless of state.
    pub lifetime: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: "2g".to_string(),
            cpus: 2.0,
            lifetime: Duration::from_secs(30 * 60),
        }
    }
}

/// Everything a provider needs to create a sandbox for one task.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub task_id: TaskId,
    pub origin: Origin,
    pub limits: ResourceLimits,
    /// Environment injected into the sandbox so in-sandbox tooling can self-identify.
    pub environment: BTreeMap<String, String>,
}

impl ProvisionRequest {
    /// Builds a request carrying the task's identifying metadata.
    pub fn for_task(task: &Task, limits: ResourceLimits) -> Self {
        let environment = BTreeMap::from([
            ("TASK_ID".to_string(), task.id.to_string()),
            ("REPOSITORY".to_string(), task.origin.repository.clone()),
            ("ISSUE_NUMBER".to_string(), task.origin.issue.to_string()),
        ]);
        Self {
            task_id: task.id.clone(),
            origin: task.origin.clone(),
            limits,
            environment,
        }
    }

    /// Adds extra environment entries without overriding the identifying ones.
    pub fn with_environment(mut self, extra: &BTreeMap<String, String>) -> Self {
        for (key, value) in extra {
            self.environment
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        self
    }
}

/// Opaque reference to a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Provider-assigned identifier (container name, worktree branch).
    pub id: String,
    /// Task the sandbox belongs to.
    pub task_id: TaskId,
    /// Directory commands run in, as seen from inside the sandbox.
    pub workdir: PathBuf,
    /// Identifying environment for commands run in the sandbox.
    pub environment: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Result of a teardown attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// The sandbox existed and was removed.
    Removed,
    /// The sandbox was already gone.
    AlreadyGone,
    /// Removal failed; the reason is only ever logged.
    Failed(String),
}

impl TeardownOutcome {
    /// True unless removal failed.
    pub fn is_clean(&self) -> bool {
        !matches!(self, TeardownOutcome::Failed(_))
    }
}

/// Backend that creates and destroys isolated environments.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Allocates the identity of a sandbox without creating anything.
    ///
    /// Separating this from [`SandboxProvider::provision`] lets the manager
    /// destroy a half-created sandbox after a failed or timed-out provision.
    fn reserve(&self, request: &ProvisionRequest) -> SandboxHandle;

    /// Creates the environment described by `handle`.
    async fn provision(&self, handle: &SandboxHandle, request: &ProvisionRequest) -> Result<()>;

    /// Builds the host command that runs `invocation` inside the sandbox.
    ///
    /// `timeout` lets providers enforce the deadline inside the sandbox too.
    fn command(
        &self,
        handle: &SandboxHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<tokio::process::Command>;

    /// Destroys the environment. Must report an absent sandbox as
    /// [`TeardownOutcome::AlreadyGone`] rather than an error.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<TeardownOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_limits_have_sensible_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory, "2g");
        assert_eq!(limits.cpus, 2.0);
        assert_eq!(limits.lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn provision_request_carries_identifying_environment() {
        let origin = Origin::new("owner/repo", 42);
        let task = Task::new(
            TaskId::from("owner-repo-42-1"),
            origin,
            vec![],
            Utc::now(),
        );
        let extra = BTreeMap::from([
            ("TASK_ID".to_string(), "spoofed".to_string()),
            ("CI".to_string(), "1".to_string()),
        ]);

        let request = ProvisionRequest::for_task(&task, ResourceLimits::default())
            .with_environment(&extra);

        assert_eq!(request.environment["TASK_ID"], "owner-repo-42-1");
        assert_eq!(request.environment["REPOSITORY"], "owner/repo");
        assert_eq!(request.environment["ISSUE_NUMBER"], "42");
        assert_eq!(request.environment["CI"], "1");
    }

    #[test]
    fn failed_teardown_is_not_clean() {
        assert!(TeardownOutcome::Removed.is_clean());
        assert!(TeardownOutcome::AlreadyGone.is_clean());
        assert!(!TeardownOutcome::Failed("busy".to_string()).is_clean());
    }
}
