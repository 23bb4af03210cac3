//! Runner that executes commands through the sandbox manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::{SandboxHandle, SandboxManager};

use super::{run_process, CommandOutput, CommandRunner, Invocation};

/// Runs invocations inside sandboxes owned by a [`SandboxManager`].
pub struct SandboxCommandRunner {
    sandboxes: Arc<SandboxManager>,
}

impl SandboxCommandRunner {
    pub fn new(sandboxes: Arc<SandboxManager>) -> Self {
        Self { sandboxes }
    }
}

#[async_trait]
impl CommandRunner for SandboxCommandRunner {
    async fn run(
        &self,
        handle: &SandboxHandle,
        invocation: Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let label = invocation.display();
        let command = self.sandboxes.command(handle, &invocation, timeout)?;

        tracing::debug!(sandbox = %handle, command = %label, "running command");

        run_process(command, invocation.stdin, timeout, &label).await
    }
}
