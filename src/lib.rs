//! Assignment Engine - executes assigned issues inside isolated sandboxes
//!
//! Tasks are queued from assignment events, dispatched one at a time into a
//! freshly provisioned sandbox, run through an ordered plan of actions and
//! published back to the origin as a pull request plus a status comment.

pub mod actions;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod publisher;
pub mod report;
pub mod runner;
pub mod sandbox;
pub mod store;
pub mod task;

pub use actions::{Action, ActionCatalog, ActionContext, ActionOutcome};
pub use config::{EngineConfig, SandboxKind, Validate, ValidationResult, DEFAULT_CONFIG_PATH};
pub use dispatcher::{Dispatcher, DispatcherConfig, StopReport, STOPPED_BY_OPERATOR};
pub use error::{Error, Result};
pub use intake::AssignmentEvent;
pub use pipeline::{ActionPipeline, PipelineResult};
pub use publisher::{ChangeRef, CommitRef, GhPublisher, PublisherSettings, ResultPublisher, StatusLedger};
pub use runner::{CommandOutput, CommandRunner, Invocation, SandboxCommandRunner};
pub use sandbox::{
    ContainerSandbox, ContainerSettings, ProvisionRequest, ResourceLimits, SandboxHandle,
    SandboxLease, SandboxManager, SandboxProvider, SandboxSettings, TeardownOutcome,
    WorktreeSandbox,
};
pub use store::TaskStore;
pub use task::{Origin, StepResult, Task, TaskId, TaskState, Transition};
