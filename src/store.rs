//! In-memory task registry and FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::task::{Origin, StepResult, Task, TaskId, TaskState, Transition};

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<TaskId, Task>,
    /// Every task id in enqueue order.
    order: Vec<TaskId>,
    /// Pending task ids awaiting dispatch.
    queue: VecDeque<TaskId>,
}

impl StoreInner {
    fn in_flight(&self) -> Option<&Task> {
        self.tasks.values().find(|t| t.state.is_in_flight())
    }

    fn ordered<'a>(&'a self, keep: impl Fn(&Task) -> bool + 'a) -> impl Iterator<Item = &'a Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(move |t| keep(t))
    }
}

/// Bookkeeping for every task and the pending queue.
///
/// A single mutex guards all state; it is never held across an await, so
/// enqueue can interleave freely with the dispatcher.
#[derive(Default)]
pub struct TaskStore {
    inner: Mutex<StoreInner>,
}

impl TaskStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a pending task and appends it to the queue.
    pub fn enqueue(&self, origin: Origin, plan: Vec<String>) -> Result<TaskId> {
        origin.validate()?;

        let now = Utc::now();
        let mut inner = self.inner();
        let base = TaskId::generate(&origin, now);
        let mut id = base.clone();
        let mut n = 1;
        while inner.tasks.contains_key(&id) {
            id = base.with_suffix(n);
            n += 1;
        }

        inner
            .tasks
            .insert(id.clone(), Task::new(id.clone(), origin, plan, now));
        inner.order.push(id.clone());
        inner.queue.push_back(id.clone());
        Ok(id)
    }

    /// Pops the head of the queue. Task state is not touched.
    pub fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner();
        while let Some(id) = inner.queue.pop_front() {
            match inner.tasks.get(&id) {
                Some(task) if task.state == TaskState::Pending => return Some(task.clone()),
                _ => continue,
            }
        }
        None
    }

    /// Applies a forward transition. On error the record is unchanged.
    ///
    /// Entering `Provisioning` while another task is in flight is rejected,
    /// which keeps the single-flight invariant inside the store itself.
    pub fn transition(&self, id: &TaskId, transition: Transition) -> Result<()> {
        let mut inner = self.inner();
        let to = transition.target();

        if to == TaskState::Provisioning {
            if let Some(active) = inner.in_flight() {
                if active.id != *id {
                    let from = inner.tasks.get(id).map(|t| t.state).unwrap_or_default();
                    tracing::error!(
                        task_id = %id,
                        active = %active.id,
                        "refusing to start a second in-flight task"
                    );
                    return Err(Error::InvalidTransition {
                        task_id: id.to_string(),
                        from,
                        to,
                    });
                }
            }
        }

        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        let from = task.state;
        task.apply(transition, Utc::now())?;
        tracing::debug!(task_id = %id, ?from, ?to, "task transitioned");
        Ok(())
    }

    /// Appends a step result to a running task.
    pub fn record_step(&self, id: &TaskId, step: StepResult) -> Result<()> {
        let mut inner = self.inner();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.record_step(step)
    }

    /// Attaches a reference that was published after the task was stopped.
    pub fn attach_published(&self, id: &TaskId, reference: &str) -> Result<()> {
        let mut inner = self.inner();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        task.attach_published(reference)
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &TaskId) -> Result<Task> {
        self.inner()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    /// All tasks not yet in a terminal state, in enqueue order.
    pub fn list_active(&self) -> Vec<Task> {
        self.inner()
            .ordered(|t| !t.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Every task, in enqueue order.
    pub fn list(&self) -> Vec<Task> {
        self.inner().ordered(|_| true).cloned().collect()
    }

    /// Number of ids still waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.inner().queue.len()
    }

    /// Fails every non-terminal task and clears the queue, atomically.
    ///
    /// Returns the tasks as they were failed, sandbox handles included.
    pub fn stop_all(&self, reason: &str) -> Vec<Task> {
        let mut inner = self.inner();
        let now = Utc::now();
        let ids: Vec<TaskId> = inner
            .ordered(|t| !t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        let mut stopped = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(task) = inner.tasks.get_mut(&id) {
                // Non-terminal -> Failed is always legal.
                if task.apply(Transition::fail(reason), now).is_ok() {
                    stopped.push(task.clone());
                }
            }
        }
        inner.queue.clear();
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn plan(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn step(name: &str) -> StepResult {
        StepResult {
            name: name.to_string(),
            success: true,
            output: String::new(),
            error: None,
            files_changed: vec![],
            tests_added: vec![],
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn enqueue_rejects_malformed_origin() {
        let store = TaskStore::new();
        let err = store.enqueue(Origin::new("", 1), vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidOrigin(_)));
        assert!(store.list().is_empty());
        assert_eq!(store.queued_len(), 0);
    }

    #[test]
    fn dequeue_is_fifo_and_empty_is_none() {
        let store = TaskStore::new();
        let ids: Vec<_> = (1..=5)
            .map(|n| store.enqueue(Origin::new("r", n), vec![]).unwrap())
            .collect();

        let dequeued: Vec<_> = std::iter::from_fn(|| store.dequeue()).map(|t| t.id).collect();
        assert_eq!(dequeued, ids);
        assert!(store.dequeue().is_none());
    }

    #[test]
    fn dequeue_leaves_state_pending() {
        let store = TaskStore::new();
        let id = store.enqueue(Origin::new("r", 1), vec![]).unwrap();
        let task = store.dequeue().unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(store.get(&id).unwrap().state, TaskState::Pending);
    }

    #[test]
    fn ids_are_unique_within_the_same_millisecond() {
        let store = TaskStore::new();
        let a = store.enqueue(Origin::new("r", 42), vec![]).unwrap();
        let b = store.enqueue(Origin::new("r", 42), vec![]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn illegal_transition_leaves_record_unchanged() {
        let store = TaskStore::new();
        let id = store.enqueue(Origin::new("r", 1), plan(&["analyze"])).unwrap();

        let err = store.transition(&id, Transition::Publish).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let task = store.get(&id).unwrap();
        assert_eq!(task.state, TaskState::Pending);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn second_in_flight_task_is_refused() {
        let store = TaskStore::new();
        let a = store.enqueue(Origin::new("r", 1), vec![]).unwrap();
        let b = store.enqueue(Origin::new("r", 2), vec![]).unwrap();

        store.transition(&a, Transition::Begin).unwrap();
        assert!(store.transition(&b, Transition::Begin).is_err());
        assert_eq!(store.get(&b).unwrap().state, TaskState::Pending);

        store.transition(&a, Transition::fail("x")).unwrap();
        store.transition(&b, Transition::Begin).unwrap();
    }

    #[test]
    fn unknown_task_is_not_found() {
        let store = TaskStore::new();
        assert!(matches!(
            store.get(&TaskId::from("nope")),
            Err(Error::TaskNotFound(_))
        ));
    }

    #[test]
    fn steps_recorded_through_store_follow_plan() {
        let store = TaskStore::new();
        let id = store
            .enqueue(Origin::new("r", 1), plan(&["analyze", "mutate"]))
            .unwrap();
        assert!(store.record_step(&id, step("analyze")).is_err());

        store.transition(&id, Transition::Begin).unwrap();
        store.transition(&id, Transition::Provisioned(handle(&id))).unwrap();
        store.record_step(&id, step("analyze")).unwrap();
        assert!(store.record_step(&id, step("analyze")).is_err());
        store.record_step(&id, step("mutate")).unwrap();

        let task = store.get(&id).unwrap();
        assert_eq!(task.step_results.len(), 2);
        assert_eq!(task.sandbox.as_ref().unwrap().id, "sb");
    }

    #[test]
    fn list_active_excludes_terminal_tasks() {
        let store = TaskStore::new();
        let a = store.enqueue(Origin::new("r", 1), vec![]).unwrap();
        let b = store.enqueue(Origin::new("r", 2), vec![]).unwrap();
        store.transition(&a, Transition::fail("x")).unwrap();

        let active: Vec<_> = store.list_active().into_iter().map(|t| t.id).collect();
        assert_eq!(active, vec![b]);
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn stop_all_fails_active_and_clears_queue() {
        let store = TaskStore::new();
        let a = store.enqueue(Origin::new("r", 1), vec![]).unwrap();
        let b = store.enqueue(Origin::new("r", 2), vec![]).unwrap();
        let c = store.enqueue(Origin::new("r", 3), vec![]).unwrap();
        store.dequeue();
        store.transition(&a, Transition::Begin).unwrap();
        store.transition(&a, Transition::Provisioned(handle(&a))).unwrap();
        store.transition(&c, Transition::fail("earlier")).unwrap();

        let stopped = store.stop_all("stopped by operator");

        assert_eq!(stopped.len(), 2);
        assert!(stopped[0].sandbox.is_some());
        assert_eq!(store.queued_len(), 0);
        assert!(store.dequeue().is_none());
        assert!(store.list_active().is_empty());
        for id in [&a, &b] {
            let task = store.get(id).unwrap();
            assert_eq!(task.state, TaskState::Failed);
            assert_eq!(task.error.as_deref(), Some("stopped by operator"));
        }
        assert_eq!(store.get(&c).unwrap().error.as_deref(), Some("earlier"));
    }

    #[test]
    fn concurrent_enqueue_loses_nothing() {
        let store = Arc::new(TaskStore::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for n in 1..=25 {
                        store.enqueue(Origin::new("r", t * 100 + n), vec![]).unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(store.queued_len(), 200);
        assert_eq!(std::iter::from_fn(|| store.dequeue()).count(), 200);
    }

    fn handle(id: &TaskId) -> crate::sandbox::SandboxHandle {
        crate::sandbox::SandboxHandle {
            id: "sb".to_string(),
            task_id: id.clone(),
            workdir: "/work".into(),
            environment: Default::default(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }
}
