//! Sandbox module for isolated task execution environments.
//!
//! [`SandboxProvider`] is the backend seam; [`ContainerSandbox`] runs each
//! task in a resource-limited container and [`WorktreeSandbox`] falls back to
//! git worktrees. [`SandboxManager`] owns lifetimes on top of a provider.

mod container;
mod manager;
mod provider;
mod worktree;

pub(crate) use container::TOKEN_CREDENTIAL_HELPER;
pub use container::{ContainerSandbox, ContainerSettings};
pub use manager::{SandboxLease, SandboxManager, SandboxSettings};
pub use provider::{
    ProvisionRequest, ResourceLimits, SandboxHandle, SandboxProvider, TeardownOutcome,
};
pub use worktree::WorktreeSandbox;
