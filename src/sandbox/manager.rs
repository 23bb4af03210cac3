//! Sandbox lifecycle management.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::runner::Invocation;
use crate::task::Task;

use super::provider::{
    ProvisionRequest, ResourceLimits, SandboxHandle, SandboxProvider, TeardownOutcome,
};

/// Settings shared by every sandbox the manager creates.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub limits: ResourceLimits,
    /// Upper bound on a single provisioning attempt.
    pub provision_timeout: Duration,
    /// Extra environment injected alongside the identifying variables.
    pub environment: BTreeMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            provision_timeout: Duration::from_secs(300),
            environment: BTreeMap::new(),
        }
    }
}

struct LiveSandbox {
    handle: SandboxHandle,
    reaper: JoinHandle<()>,
}

/// Creates and destroys sandboxes, and tracks the ones that are alive.
///
/// Every live sandbox has a reaper task that destroys it once its lifetime
/// ceiling passes, whether or not anyone else tears it down.
pub struct SandboxManager {
    provider: Arc<dyn SandboxProvider>,
    settings: SandboxSettings,
    live: Mutex<HashMap<String, LiveSandbox>>,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, settings: SandboxSettings) -> Self {
        Self {
            provider,
            settings,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, LiveSandbox>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provisions a sandbox for `task`. One attempt; no retries.
    ///
    /// On failure or timeout the partially created sandbox is destroyed
    /// before the error is returned.
    pub async fn provision(self: &Arc<Self>, task: &Task) -> Result<SandboxHandle> {
        let request = ProvisionRequest::for_task(task, self.settings.limits.clone())
            .with_environment(&self.settings.environment);
        let handle = self.provider.reserve(&request);

        tracing::info!(
            task_id = %task.id,
            sandbox = %handle,
            provider = %self.provider.name(),
            "provisioning sandbox"
        );

        let attempt = tokio::time::timeout(
            self.settings.provision_timeout,
            self.provider.provision(&handle, &request),
        )
        .await;

        let error = match attempt {
            Ok(Ok(())) => {
                self.register(handle.clone());
                return Ok(handle);
            }
            Ok(Err(Error::Provision(reason))) => Error::Provision(reason),
            Ok(Err(other)) => Error::Provision(other.to_string()),
            Err(_) => Error::Provision(format!(
                "timed out after {:?}",
                self.settings.provision_timeout
            )),
        };

        if let Err(e) = self.provider.destroy(&handle).await {
            tracing::warn!(
                sandbox = %handle,
                error = %e,
                "failed to clean up after failed provision"
            );
        }
        Err(error)
    }

    fn register(self: &Arc<Self>, handle: SandboxHandle) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let lifetime = self.settings.limits.lifetime;
        let reaped = handle.clone();
        let reaper = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(manager) = weak.upgrade() {
                tracing::warn!(sandbox = %reaped, "sandbox lifetime exceeded, destroying");
                manager.teardown_inner(&reaped, false).await;
            }
        });

        self.live().insert(
            handle.id.clone(),
            LiveSandbox { handle, reaper },
        );
    }

    /// Destroys a sandbox. Idempotent and best-effort: failures are logged
    /// and reported, never raised.
    pub async fn teardown(&self, handle: &SandboxHandle) -> TeardownOutcome {
        self.teardown_inner(handle, true).await
    }

    async fn teardown_inner(&self, handle: &SandboxHandle, abort_reaper: bool) -> TeardownOutcome {
        if let Some(entry) = self.live().remove(&handle.id) {
            // The reaper must not abort itself mid-teardown.
            if abort_reaper {
                entry.reaper.abort();
            }
        }

        let outcome = match self.provider.destroy(handle).await {
            Ok(outcome) => outcome,
            Err(e) => TeardownOutcome::Failed(e.to_string()),
        };

        match &outcome {
            TeardownOutcome::Removed => {
                tracing::info!(sandbox = %handle, task_id = %handle.task_id, "sandbox removed")
            }
            TeardownOutcome::AlreadyGone => {
                tracing::debug!(sandbox = %handle, "sandbox already gone")
            }
            TeardownOutcome::Failed(reason) => tracing::warn!(
                sandbox = %handle,
                task_id = %handle.task_id,
                reason = %reason,
                "sandbox teardown failed"
            ),
        }
        outcome
    }

    /// Builds the host command for running `invocation` in `handle`.
    pub fn command(
        &self,
        handle: &SandboxHandle,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<tokio::process::Command> {
        self.provider.command(handle, invocation, timeout)
    }

    /// Sandboxes provisioned and not yet torn down.
    pub fn live_sandboxes(&self) -> Vec<SandboxHandle> {
        let mut handles: Vec<_> = self.live().values().map(|l| l.handle.clone()).collect();
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        handles
    }

    /// Wraps `handle` in a guard that guarantees teardown.
    pub fn lease(self: &Arc<Self>, handle: SandboxHandle) -> SandboxLease {
        SandboxLease {
            manager: Arc::clone(self),
            handle,
            released: false,
        }
    }
}

/// Scoped ownership of a sandbox.
///
/// Call [`SandboxLease::release`] on every exit path; if a lease is dropped
/// without being released (a panic, a cancelled future) teardown is
/// scheduled on the runtime instead.
pub struct SandboxLease {
    manager: Arc<SandboxManager>,
    handle: SandboxHandle,
    released: bool,
}

impl SandboxLease {
    /// The leased sandbox.
    pub fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Tears the sandbox down.
    pub async fn release(mut self) -> TeardownOutcome {
        self.released = true;
        self.manager.teardown(&self.handle).await
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(sandbox = %handle, "sandbox lease dropped, scheduling teardown");
                runtime.spawn(async move {
                    manager.teardown(&handle).await;
                });
            }
            Err(_) => {
                tracing::error!(sandbox = %handle, "sandbox lease dropped outside a runtime, sandbox leaked");
            }
        }
    }
}
