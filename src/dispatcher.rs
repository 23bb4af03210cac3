//! The dispatch loop: one task at a time, from the queue to a terminal state.
//!
//! For each dequeued task the dispatcher provisions a sandbox, runs the
//! plan, publishes the result, tears the sandbox down and posts one status
//! update. Failures end the task, never the loop.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::pipeline::{ActionPipeline, PipelineResult};
use crate::publisher::{ResultPublisher, StatusLedger};
use crate::sandbox::{SandboxHandle, SandboxManager, TeardownOutcome};
use crate::store::TaskStore;
use crate::task::{Origin, Task, TaskId, TaskState, Transition};

/// Error recorded on tasks ended by [`Dispatcher::stop_all`].
pub const STOPPED_BY_OPERATOR: &str = "stopped by operator";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Pause between consecutive tasks.
    pub cooldown: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
        }
    }
}

/// What [`Dispatcher::stop_all`] did.
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    /// Tasks moved to Failed, in enqueue order.
    pub stopped: Vec<TaskId>,
    /// Sandbox id and teardown outcome for every sandbox torn down.
    pub teardowns: Vec<(String, TeardownOutcome)>,
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    sandboxes: Arc<SandboxManager>,
    pipeline: ActionPipeline,
    publisher: Arc<dyn ResultPublisher>,
    ledger: StatusLedger,
    config: DispatcherConfig,
    wake: Notify,
    /// Held while a task is processed, so `run_until_idle` and a spawned
    /// loop never overlap.
    busy: Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher over an existing store and sandbox manager.
    ///
    /// Status updates use [`StatusLedger::default`] until replaced with
    /// [`Dispatcher::with_status_ledger`].
    pub fn new(
        store: Arc<TaskStore>,
        sandboxes: Arc<SandboxManager>,
        pipeline: ActionPipeline,
        publisher: Arc<dyn ResultPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            sandboxes,
            pipeline,
            publisher,
            ledger: StatusLedger::default(),
            config,
            wake: Notify::new(),
            busy: Mutex::new(()),
        }
    }

    /// Replaces the default status ledger.
    pub fn with_status_ledger(mut self, ledger: StatusLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// The underlying task store.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Queues a task and wakes the loop.
    pub fn enqueue(&self, origin: Origin, plan: Vec<String>) -> Result<TaskId> {
        let reference = origin.reference();
        let id = self.store.enqueue(origin, plan)?;
        tracing::info!(task_id = %id, origin = %reference, "task queued");
        self.wake.notify_one();
        Ok(id)
    }

    /// Snapshot of one task, in any state.
    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.store.get(id)
    }

    /// Tasks not yet Completed or Failed, in enqueue order.
    pub fn list_active(&self) -> Vec<Task> {
        self.store.list_active()
    }

    /// Processes queued tasks until the queue is empty.
    ///
    /// Returns the number of tasks processed.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while self.process_next().await.is_some() {
            processed += 1;
            if self.store.queued_len() > 0 {
                tokio::time::sleep(self.config.cooldown).await;
            }
        }
        processed
    }

    /// Runs the loop on a tokio task until `shutdown` turns true or its
    /// sender is dropped. A task already in flight is finished first.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(cooldown = ?self.config.cooldown, "dispatcher started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                if self.process_next().await.is_some() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.cooldown) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }

                tokio::select! {
                    _ = self.wake.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("dispatcher stopped");
        })
    }

    async fn process_next(&self) -> Option<TaskId> {
        let _busy = self.busy.lock().await;
        let task = self.store.dequeue()?;
        let id = task.id.clone();
        self.process(task).await;
        Some(id)
    }

    async fn process(&self, task: Task) {
        let id = task.id.clone();
        if !self.advance(&id, Transition::Begin) {
            return;
        }
        tracing::info!(task_id = %id, plan = ?task.plan, "task started");

        let handle = match self.sandboxes.provision(&task).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(task_id = %id, error = %e, "provisioning failed");
                self.finish(&id, Transition::fail(e.to_string())).await;
                return;
            }
        };
        let lease = self.sandboxes.lease(handle);

        if !self.advance(&id, Transition::Provisioned(lease.handle().clone())) {
            lease.release().await;
            return;
        }

        let result = self
            .pipeline
            .run(lease.handle(), &task, |step| match self.store.record_step(&id, step.clone()) {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    tracing::info!(task_id = %id, reason = %e, "task no longer running, stopping pipeline");
                    ControlFlow::Break(())
                }
            })
            .await;

        if result.interrupted || !self.advance(&id, Transition::Publish) {
            lease.release().await;
            return;
        }

        let task = self.snapshot(&id);
        let terminal = self.publish(lease.handle(), &task, &result).await;
        lease.release().await;
        if let Some(terminal) = terminal {
            self.finish(&id, terminal).await;
        }
    }

    /// Decides the terminal transition from the pipeline result and the
    /// publisher's answers.
    ///
    /// Returns `None` when the task was stopped while publishing; anything
    /// already pushed is attached to the failed record.
    async fn publish(&self, handle: &SandboxHandle, task: &Task, result: &PipelineResult) -> Option<Transition> {
        if !task.plan.is_empty() && result.succeeded() == 0 {
            return Some(Transition::fail(format!("all {} steps failed", result.steps.len())));
        }

        if self.stopped(&task.id) {
            tracing::info!(task_id = %task.id, "task stopped before commit, nothing published");
            return None;
        }
        let commit = match self.publisher.commit_changes(handle, task).await {
            Ok(Some(commit)) => commit,
            Ok(None) => return Some(Transition::Complete { published: None }),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "commit failed");
                return Some(Transition::fail(e.to_string()));
            }
        };

        if self.stopped(&task.id) {
            tracing::warn!(task_id = %task.id, commit = %commit, "task stopped after push, skipping change request");
            self.attach_late(&task.id, &commit.to_string());
            return None;
        }

        match self
            .publisher
            .open_change_request(task, &commit, &result.summary())
            .await
        {
            Ok(change) => Some(Transition::Complete {
                published: Some(change.url),
            }),
            Err(e) => {
                tracing::error!(task_id = %task.id, commit = %commit, error = %e, "change request failed");
                Some(Transition::Fail {
                    error: e.to_string(),
                    published: Some(commit.to_string()),
                })
            }
        }
    }

    /// Applies a terminal transition and posts the status update.
    async fn finish(&self, id: &TaskId, transition: Transition) {
        let published = transition.published().map(str::to_string);
        if !self.advance(id, transition) {
            if let Some(reference) = published {
                self.attach_late(id, &reference);
            }
            return;
        }
        let task = self.snapshot(id);
        match task.state {
            TaskState::Completed => tracing::info!(
                task_id = %id,
                published = task.published_reference.as_deref().unwrap_or("-"),
                failed_steps = task.failed_steps(),
                "task completed"
            ),
            _ => tracing::error!(
                task_id = %id,
                error = task.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
        }
        self.ledger.deliver(self.publisher.as_ref(), &task).await;
    }

    /// Applies a transition. Returns false if the task was already ended
    /// elsewhere (by `stop_all`), in which case the caller abandons it.
    ///
    /// # Panics
    ///
    /// Any other rejection means the dispatcher and the store disagree about
    /// the task's state, which is a bug.
    fn advance(&self, id: &TaskId, transition: Transition) -> bool {
        match self.store.transition(id, transition) {
            Ok(()) => true,
            Err(Error::InvalidTransition { from, .. }) if from.is_terminal() => {
                tracing::info!(task_id = %id, state = ?from, "task already ended, abandoning");
                false
            }
            Err(e) => panic!("task store invariant violated: {}", e),
        }
    }

    fn stopped(&self, id: &TaskId) -> bool {
        self.snapshot(id).state.is_terminal()
    }

    /// Keeps a reference pushed after `stop_all` failed the task.
    fn attach_late(&self, id: &TaskId, reference: &str) {
        match self.store.attach_published(id, reference) {
            Ok(()) => tracing::warn!(task_id = %id, reference, "published after stop, reference kept"),
            Err(e) => tracing::error!(task_id = %id, reference, error = %e, "failed to record late reference"),
        }
    }

    fn snapshot(&self, id: &TaskId) -> Task {
        match self.store.get(id) {
            Ok(task) => task,
            Err(e) => panic!("task store invariant violated: {}", e),
        }
    }

    /// Fails every active task, tears down their sandboxes, clears the queue
    /// and posts one status update per stopped task.
    pub async fn stop_all(&self) -> StopReport {
        let stopped = self.store.stop_all(STOPPED_BY_OPERATOR);

        let mut handles: Vec<SandboxHandle> = stopped.iter().filter_map(|t| t.sandbox.clone()).collect();
        for live in self.sandboxes.live_sandboxes() {
            if !handles.iter().any(|h| h.id == live.id) {
                handles.push(live);
            }
        }

        let mut report = StopReport {
            stopped: stopped.iter().map(|t| t.id.clone()).collect(),
            teardowns: Vec::with_capacity(handles.len()),
        };
        for handle in handles {
            let outcome = self.sandboxes.teardown(&handle).await;
            report.teardowns.push((handle.id, outcome));
        }
        for task in &stopped {
            self.ledger.deliver(self.publisher.as_ref(), task).await;
        }

        let unclean = report.teardowns.iter().filter(|(_, o)| !o.is_clean()).count();
        tracing::info!(
            stopped = report.stopped.len(),
            sandboxes = report.teardowns.len(),
            unclean,
            "all tasks stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionCatalog;
    use crate::error::Result;
    use crate::publisher::{ChangeRef, CommitRef};
    use crate::runner::{CommandOutput, CommandRunner, Invocation};
    use crate::sandbox::{ProvisionRequest, SandboxProvider, SandboxSettings};
    use async_trait::async_trait;
    use chrono::Utc;

    struct NullProvider;

    #[async_trait]
    impl SandboxProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }

        fn reserve(&self, request: &ProvisionRequest) -> SandboxHandle {
            SandboxHandle {
                id: format!("sb-{}", request.task_id),
                task_id: request.task_id.clone(),
                workdir: "/work".into(),
                environment: request.environment.clone(),
                created_at: Utc::now(),
                expires_at: Utc::now(),
            }
        }

        async fn provision(&self, _handle: &SandboxHandle, _request: &ProvisionRequest) -> Result<()> {
            Ok(())
        }

        fn command(
            &self,
            _handle: &SandboxHandle,
            invocation: &Invocation,
            _timeout: Duration,
        ) -> Result<tokio::process::Command> {
            Ok(tokio::process::Command::new(&invocation.program))
        }

        async fn destroy(&self, _handle: &SandboxHandle) -> Result<TeardownOutcome> {
            Ok(TeardownOutcome::Removed)
        }
    }

    struct OkRunner;

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(&self, _: &SandboxHandle, _: Invocation, _: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::ZERO,
            })
        }
    }

    struct NoChanges;

    #[async_trait]
    impl ResultPublisher for NoChanges {
        async fn commit_changes(&self, _: &SandboxHandle, _: &Task) -> Result<Option<CommitRef>> {
            Ok(None)
        }

        async fn open_change_request(&self, _: &Task, _: &CommitRef, _: &str) -> Result<ChangeRef> {
            Err(Error::Publish("nothing to open".to_string()))
        }

        async fn post_status(&self, _: &Origin, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::new(NullProvider),
            SandboxSettings::default(),
        ));
        let pipeline = ActionPipeline::new(
            Arc::new(ActionCatalog::with_defaults()),
            Arc::new(OkRunner),
            Duration::from_secs(5),
        );
        Arc::new(Dispatcher::new(
            Arc::new(TaskStore::new()),
            sandboxes,
            pipeline,
            Arc::new(NoChanges),
            DispatcherConfig {
                cooldown: Duration::ZERO,
            },
        ))
    }

    #[tokio::test]
    async fn run_until_idle_on_empty_queue_does_nothing() {
        assert_eq!(dispatcher().run_until_idle().await, 0);
    }

    #[tokio::test]
    async fn clean_tree_completes_without_reference() {
        let dispatcher = dispatcher();
        let id = dispatcher
            .enqueue(Origin::new("r", 1), vec!["update-docs".to_string()])
            .unwrap();

        assert_eq!(dispatcher.run_until_idle().await, 1);

        let task = dispatcher.get_task(&id).unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert!(task.published_reference.is_none());
        assert!(task.error.is_none());
        assert!(dispatcher.list_active().is_empty());
    }

    #[tokio::test]
    async fn spawned_loop_wakes_on_enqueue_and_shuts_down() {
        let dispatcher = dispatcher();
        let (tx, rx) = watch::channel(false);
        let loop_handle = Arc::clone(&dispatcher).spawn(rx);

        let id = dispatcher
            .enqueue(Origin::new("r", 2), vec!["analyze".to_string()])
            .unwrap();

        let mut state = TaskState::Pending;
        for _ in 0..100 {
            state = dispatcher.get_task(&id).unwrap().state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, TaskState::Completed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), loop_handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_all_with_nothing_active_is_empty() {
        let report = dispatcher().stop_all().await;
        assert!(report.stopped.is_empty());
        assert!(report.teardowns.is_empty());
    }
}
