//! Task records and their lifecycle state machine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::SandboxHandle;

/// Opaque, immutable task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Builds an id from the origin reference and the enqueue timestamp.
    pub fn generate(origin: &Origin, at: DateTime<Utc>) -> Self {
        let repo = origin.repository.replace('/', "-");
        Self(format!("{}-{}-{}", repo, origin.issue, at.timestamp_millis()))
    }

    /// Returns a copy of this id with a disambiguating suffix.
    pub(crate) fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to the record that triggered a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Repository identifier, usually `owner/name`.
    pub repository: String,
    /// Issue or ticket number.
    pub issue: u64,
    /// Issue title.
    #[serde(default)]
    pub title: String,
    /// Free-text issue body.
    #[serde(default)]
    pub body: Option<String>,
}

impl Origin {
    /// Creates an origin with an empty title and no body.
    pub fn new(repository: impl Into<String>, issue: u64) -> Self {
        Self {
            repository: repository.into(),
            issue,
            title: String::new(),
            body: None,
        }
    }

    /// Sets the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Checks the reference fields.
    ///
    /// The repository ends up as a single argv element of git and `gh`
    /// invocations, so it is restricted to the characters those tools
    /// accept in a repository slug and may not look like a flag.
    pub fn validate(&self) -> Result<()> {
        let repo = self.repository.trim();
        if repo.is_empty() {
            return Err(Error::InvalidOrigin("repository is required".to_string()));
        }
        if repo.starts_with('-') || repo.contains("..") {
            return Err(Error::InvalidOrigin(format!(
                "repository '{}' is not a valid reference",
                self.repository
            )));
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/');
        if !repo.chars().all(allowed) || repo != self.repository {
            return Err(Error::InvalidOrigin(format!(
                "repository '{}' contains unsupported characters",
                self.repository
            )));
        }
        if self.issue == 0 {
            return Err(Error::InvalidOrigin("issue number is required".to_string()));
        }
        Ok(())
    }

    /// Human-readable `repo#issue` reference.
    pub fn reference(&self) -> String {
        format!("{}#{}", self.repository, self.issue)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Queued, not yet started.
    #[default]
    Pending,
    /// A sandbox is being created.
    Provisioning,
    /// The action pipeline is running.
    Running,
    /// Results are being published.
    Publishing,
    /// Finished and published.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// States that count against the single-flight limit.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskState::Provisioning | TaskState::Running | TaskState::Publishing
        )
    }

    /// Returns true if `next` is a legal forward transition from `self`.
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Provisioning)
                | (Provisioning, Running)
                | (Running, Publishing)
                | (Publishing, Completed)
                | (Pending | Provisioning | Running | Publishing, Failed)
        )
    }
}

/// A requested state change together with the fields it sets.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Pending -> Provisioning. Sets `started_at`.
    Begin,
    /// Provisioning -> Running. Binds the sandbox.
    Provisioned(SandboxHandle),
    /// Running -> Publishing.
    Publish,
    /// Publishing -> Completed. Sets `finished_at`.
    Complete { published: Option<String> },
    /// Any non-terminal state -> Failed. Sets `error` and `finished_at`.
    Fail {
        error: String,
        published: Option<String>,
    },
}

impl Transition {
    /// Shorthand for a failure with nothing published.
    pub fn fail(error: impl Into<String>) -> Self {
        Transition::Fail {
            error: error.into(),
            published: None,
        }
    }

    /// The state this transition moves to.
    pub fn target(&self) -> TaskState {
        match self {
            Transition::Begin => TaskState::Provisioning,
            Transition::Provisioned(_) => TaskState::Running,
            Transition::Publish => TaskState::Publishing,
            Transition::Complete { .. } => TaskState::Completed,
            Transition::Fail { .. } => TaskState::Failed,
        }
    }

    /// The change reference this transition records, if any.
    pub fn published(&self) -> Option<&str> {
        match self {
            Transition::Complete { published } | Transition::Fail { published, .. } => published.as_deref(),
            _ => None,
        }
    }
}

/// Recorded outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Action name, equal to the plan entry at the same index.
    pub name: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Captured output.
    pub output: String,
    /// Error detail when the step failed.
    pub error: Option<String>,
    /// Files the action created or modified.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Test files the action added.
    #[serde(default)]
    pub tests_added: Vec<String>,
    /// Wall-clock time spent in the step.
    pub duration: Duration,
}

impl StepResult {
    /// A failed step with no output.
    pub fn failed(name: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            files_changed: Vec::new(),
            tests_added: Vec::new(),
            duration,
        }
    }
}

/// One unit of assigned work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub origin: Origin,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Ordered action names selected for this task.
    pub plan: Vec<String>,
    /// Append-only per-action outcomes.
    pub step_results: Vec<StepResult>,
    /// Set iff the task failed.
    pub error: Option<String>,
    /// Change request reference, when one was published.
    pub published_reference: Option<String>,
    /// Sandbox bound to the task, once provisioned.
    pub sandbox: Option<SandboxHandle>,
}

impl Task {
    /// Creates a pending task.
    pub fn new(id: TaskId, origin: Origin, plan: Vec<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            origin,
            state: TaskState::Pending,
            created_at,
            started_at: None,
            finished_at: None,
            plan,
            step_results: Vec::new(),
            error: None,
            published_reference: None,
            sandbox: None,
        }
    }

    /// Applies a transition, leaving the task untouched if it is illegal.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<()> {
        let to = transition.target();
        if !self.state.can_advance_to(to) {
            return Err(Error::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.state,
                to,
            });
        }

        match transition {
            Transition::Begin => {
                self.started_at = Some(now);
            }
            Transition::Provisioned(handle) => {
                self.sandbox = Some(handle);
            }
            Transition::Publish => {}
            Transition::Complete { published } => {
                self.published_reference = published;
                self.finished_at = Some(now);
            }
            Transition::Fail { error, published } => {
                self.error = Some(error);
                if published.is_some() {
                    self.published_reference = published;
                }
                self.finished_at = Some(now);
            }
        }
        self.state = to;
        Ok(())
    }

    /// Records a reference published after the task was already failed.
    ///
    /// Only a failed task accepts this; the error and timestamps are kept.
    pub fn attach_published(&mut self, reference: impl Into<String>) -> Result<()> {
        if self.state != TaskState::Failed {
            return Err(Error::InvalidTransition {
                task_id: self.id.to_string(),
                from: self.state,
                to: TaskState::Failed,
            });
        }
        self.published_reference = Some(reference.into());
        Ok(())
    }

    /// Appends a step result, enforcing plan order.
    pub fn record_step(&mut self, step: StepResult) -> Result<()> {
        let reject = |reason: String| Error::StepRejected {
            task_id: self.id.to_string(),
            reason,
        };
        if self.state != TaskState::Running {
            return Err(reject(format!("task is {:?}, not running", self.state)));
        }
        let index = self.step_results.len();
        match self.plan.get(index) {
            Some(expected) if *expected == step.name => {}
            Some(expected) => {
                return Err(reject(format!(
                    "step {} must be '{}', got '{}'",
                    index, expected, step.name
                )))
            }
            None => return Err(reject(format!("plan has only {} steps", self.plan.len()))),
        }
        self.step_results.push(step);
        Ok(())
    }

    /// Number of recorded steps that failed.
    pub fn failed_steps(&self) -> usize {
        self.step_results.iter().filter(|s| !s.success).count()
    }
}
