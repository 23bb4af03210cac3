//! Ordered execution of a task's plan.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::actions::{ActionCatalog, ActionContext};
use crate::runner::CommandRunner;
use crate::sandbox::SandboxHandle;
use crate::task::{StepResult, Task};

/// Aggregated outcome of one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Step outcomes in plan order.
    pub steps: Vec<StepResult>,
    /// True if the observer stopped the run before the plan was exhausted.
    pub interrupted: bool,
}

impl PipelineResult {
    /// Number of steps that succeeded.
    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.success).count()
    }

    /// Number of steps that failed, unknown actions included.
    pub fn failed(&self) -> usize {
        self.steps.len() - self.succeeded()
    }

    /// Files changed across all successful steps, first occurrence order.
    pub fn files_changed(&self) -> Vec<String> {
        dedup(self.steps.iter().flat_map(|s| s.files_changed.iter()))
    }

    /// Test files added across all successful steps, first occurrence order.
    pub fn tests_added(&self) -> Vec<String> {
        dedup(self.steps.iter().flat_map(|s| s.tests_added.iter()))
    }

    /// One-line account such as `2/3 steps succeeded; 1 file changed`.
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{}/{} steps succeeded",
            self.succeeded(),
            self.steps.len()
        );
        let files = self.files_changed().len();
        if files > 0 {
            summary.push_str(&format!(
                "; {} file{} changed",
                files,
                if files == 1 { "" } else { "s" }
            ));
        }
        let tests = self.tests_added().len();
        if tests > 0 {
            summary.push_str(&format!(
                "; {} test{} added",
                tests,
                if tests == 1 { "" } else { "s" }
            ));
        }
        summary
    }
}

fn dedup<'a>(items: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = Vec::new();
    for item in items {
        if !seen.contains(item) {
            seen.push(item.clone());
        }
    }
    seen
}

/// Runs plans against sandboxes.
///
/// Holds no per-task state and owns no sandbox: the caller provisions and
/// tears down, the pipeline only orchestrates.
pub struct ActionPipeline {
    catalog: Arc<ActionCatalog>,
    runner: Arc<dyn CommandRunner>,
    step_timeout: Duration,
}

impl ActionPipeline {
    /// Creates a pipeline resolving actions from `catalog`; each step gets
    /// `step_timeout`.
    pub fn new(
        catalog: Arc<ActionCatalog>,
        runner: Arc<dyn CommandRunner>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            runner,
            step_timeout,
        }
    }

    /// Runs every action of `task.plan` in order.
    ///
    /// A failing or unknown action is recorded and the next one still runs.
    /// `observer` sees each step as soon as it is recorded; returning
    /// `ControlFlow::Break` ends the run early.
    pub async fn run<F>(&self, handle: &SandboxHandle, task: &Task, mut observer: F) -> PipelineResult
    where
        F: FnMut(&StepResult) -> ControlFlow<()>,
    {
        let mut result = PipelineResult::default();
        let ctx = ActionContext {
            task_id: &task.id,
            origin: &task.origin,
            handle,
            runner: self.runner.as_ref(),
            timeout: self.step_timeout,
        };

        for name in &task.plan {
            let start = Instant::now();
            let step = match self.catalog.resolve(name) {
                Err(e) => StepResult::failed(name, e.to_string(), start.elapsed()),
                Ok(action) => match action.execute(&ctx).await {
                    Ok(outcome) => StepResult {
                        name: name.clone(),
                        success: true,
                        output: outcome.output,
                        error: None,
                        files_changed: outcome.files_changed,
                        tests_added: outcome.tests_added,
                        duration: start.elapsed(),
                    },
                    Err(e) => StepResult::failed(name, e.to_string(), start.elapsed()),
                },
            };

            if step.success {
                tracing::info!(task_id = %task.id, step = %name, duration = ?step.duration, "step succeeded");
            } else {
                tracing::warn!(
                    task_id = %task.id,
                    step = %name,
                    error = step.error.as_deref().unwrap_or_default(),
                    "step failed, continuing"
                );
            }

            let flow = observer(&step);
            result.steps.push(step);
            if flow.is_break() {
                result.interrupted = true;
                break;
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionOutcome};
    use crate::error::{Error, Result};
    use crate::runner::{CommandOutput, Invocation};
    use crate::task::{Origin, TaskId};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRunner(AtomicUsize);

    #[async_trait]
    impl CommandRunner for CountingRunner {
        async fn run(
            &self,
            _handle: &SandboxHandle,
            _invocation: Invocation,
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
            })
        }
    }

    /// Action with a fixed result that still goes through the runner.
    struct Fixed {
        name: &'static str,
        fail: bool,
        file: Option<&'static str>,
    }

    #[async_trait]
    impl Action for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(&self, ctx: &ActionContext<'_>) -> Result<ActionOutcome> {
            ctx.run(Invocation::new("true")).await?;
            if self.fail {
                return Err(Error::Runner(format!("{} broke", self.name)));
            }
            Ok(ActionOutcome {
                output: format!("{} ok", self.name),
                files_changed: self.file.map(|f| vec![f.to_string()]).unwrap_or_default(),
                tests_added: vec![],
            })
        }
    }

    fn pipeline(runner: Arc<CountingRunner>) -> ActionPipeline {
        let mut catalog = ActionCatalog::new();
        catalog.register(Arc::new(Fixed { name: "analyze", fail: false, file: None }));
        catalog.register(Arc::new(Fixed { name: "mutate", fail: false, file: Some("src/a.rs") }));
        catalog.register(Arc::new(Fixed { name: "update-docs", fail: true, file: None }));
        catalog.register(Arc::new(Fixed { name: "add-tests", fail: false, file: Some("src/a.rs") }));
        ActionPipeline::new(Arc::new(catalog), runner, Duration::from_secs(5))
    }

    fn task(plan: &[&str]) -> Task {
        Task::new(
            TaskId::from("r-1-1"),
            Origin::new("r", 1),
            plan.iter().map(|s| s.to_string()).collect(),
            Utc::now(),
        )
    }

    fn handle() -> SandboxHandle {
        SandboxHandle {
            id: "sb".to_string(),
            task_id: TaskId::from("r-1-1"),
            workdir: "/work".into(),
            environment: Default::default(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn failing_step_does_not_abort_the_plan() {
        let pipeline = pipeline(Arc::new(CountingRunner(AtomicUsize::new(0))));
        let task = task(&["analyze", "update-docs", "mutate"]);

        let result = pipeline
            .run(&handle(), &task, |_| ControlFlow::Continue(()))
            .await;

        let names: Vec<_> = result.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, task.plan);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(
            result.steps[1].error.as_deref(),
            Some("command failed: update-docs broke")
        );
        assert!(!result.interrupted);
    }

    #[tokio::test]
    async fn unknown_action_skips_the_runner() {
        let runner = Arc::new(CountingRunner(AtomicUsize::new(0)));
        let pipeline = pipeline(runner.clone());
        let task = task(&["deploy", "analyze"]);

        let result = pipeline
            .run(&handle(), &task, |_| ControlFlow::Continue(()))
            .await;

        assert!(!result.steps[0].success);
        assert_eq!(result.steps[0].error.as_deref(), Some("unknown action: deploy"));
        assert!(result.steps[1].success);
        assert_eq!(runner.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn observer_sees_steps_in_order_and_can_stop() {
        let pipeline = pipeline(Arc::new(CountingRunner(AtomicUsize::new(0))));
        let task = task(&["analyze", "mutate", "add-tests"]);
        let mut seen = Vec::new();

        let result = pipeline
            .run(&handle(), &task, |step| {
                seen.push(step.name.clone());
                if seen.len() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await;

        assert_eq!(seen, vec!["analyze", "mutate"]);
        assert_eq!(result.steps.len(), 2);
        assert!(result.interrupted);
    }

    #[tokio::test]
    async fn summary_counts_distinct_files() {
        let pipeline = pipeline(Arc::new(CountingRunner(AtomicUsize::new(0))));
        let task = task(&["mutate", "add-tests", "update-docs"]);

        let result = pipeline
            .run(&handle(), &task, |_| ControlFlow::Continue(()))
            .await;

        assert_eq!(result.files_changed(), vec!["src/a.rs"]);
        assert_eq!(result.summary(), "2/3 steps succeeded; 1 file changed");
    }

    #[test]
    fn empty_plan_summary() {
        assert_eq!(PipelineResult::default().summary(), "0/0 steps succeeded");
    }
}
