//! A bounded, heterogeneous-by-output parallel executor (spec §4.F).
//! Grounded in `lansync/util/task.py`'s `Task`/`TaskList` (itself a thin
//! wrapper over a `ThreadPoolExecutor`): the Python base class exposes
//! `execute`/`on_done`/`on_error`/`cleanup` and relies on duck typing for
//! heterogeneous task subclasses sharing one list. Rust has no such
//! inheritance, so every call site implements one `Task<O>` trait instead
//! of a class hierarchy (spec §9 "ad-hoc inheritance for tasks").
//!
//! `execute` runs on the blocking worker pool (`tokio::task::spawn_blocking`,
//! sized by `Settings::worker_threads`, spec §5 "fixed-size worker pool,
//! default 32") since its suspension points are network calls and DB/file
//! I/O, not pure async work.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::error::{Error, Result};

/// One schedulable unit of work. `execute` produces the task's result;
/// `on_done`/`on_error` react to it; `cleanup` always runs afterward and is
/// the only place that releases resources such as a client-pool slot, so a
/// panicking `execute` can never leak one.
pub trait Task<O>: Send + Sync {
    fn execute(&self) -> Result<O>;
    fn on_done(&mut self, _output: &O) {}
    fn on_error(&mut self, _error: &Error) {}
    fn cleanup(&mut self) {}
}

/// Identifies a submitted task within one `TaskList`; returned by
/// `submit` and echoed back in `wait_any`/`wait_all` results.
pub type TaskId = u64;

pub struct TaskList<O: Send + 'static> {
    join_set: JoinSet<(TaskId, Result<O>)>,
    tasks: HashMap<TaskId, Arc<dyn Task<O>>>,
    next_id: TaskId,
}

impl<O: Send + 'static> Default for TaskList<O> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: Send + 'static> TaskList<O> {
    pub fn new() -> Self {
        TaskList {
            join_set: JoinSet::new(),
            tasks: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Schedules `task.execute` on the blocking pool and starts tracking
    /// it. Returns the id assigned to this submission. A panic inside
    /// `execute` is caught here and turned into an ordinary `Err`, so it
    /// always resolves through the same `on_error`/`cleanup` path instead
    /// of surfacing as a `JoinError` we'd have no task id to attribute.
    pub fn submit(&mut self, task: Arc<dyn Task<O>>) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        let executing = task.clone();
        self.join_set.spawn_blocking(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| executing.execute()));
            let result = outcome.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(Error::Protocol(format!("task panicked: {message}")))
            });
            (id, result)
        });
        self.tasks.insert(id, task);
        id
    }

    /// Finalizes one completed join result: calls `on_done`/`on_error`,
    /// then `cleanup` unconditionally, and removes the task from the list.
    fn finish(&mut self, id: TaskId, outcome: Result<O>) -> (TaskId, Result<O>) {
        let Some(mut task) = self.tasks.remove(&id) else {
            unreachable!("task {id} finished twice");
        };
        // The join_set's own clone was just consumed by `join_next`, so
        // this is the last reference and get_mut always succeeds.
        let task_mut = Arc::get_mut(&mut task).expect("executing clone already dropped");

        match &outcome {
            Ok(output) => task_mut.on_done(output),
            Err(error) => task_mut.on_error(error),
        }
        task_mut.cleanup();
        (id, outcome)
    }

    /// Blocks until at least one in-flight task completes, then drains
    /// every other already-ready one without waiting further. Returns the
    /// id and outcome of each task finalized this call.
    pub async fn wait_any(&mut self) -> Vec<(TaskId, Result<O>)> {
        let mut finished = Vec::new();
        match self.join_set.join_next().await {
            Some(Ok((id, outcome))) => finished.push(self.finish(id, outcome)),
            Some(Err(join_error)) => {
                tracing::error!(%join_error, "task join failed outside of execute (runtime shutdown or abort)");
            }
            None => return finished,
        }

        while let Some(next) = self.join_set.try_join_next() {
            match next {
                Ok((id, outcome)) => finished.push(self.finish(id, outcome)),
                Err(join_error) => tracing::error!(%join_error, "task join failed outside of execute"),
            }
        }
        finished
    }

    /// Drains every in-flight task, waiting as long as necessary.
    pub async fn wait_all(&mut self) -> Vec<(TaskId, Result<O>)> {
        let mut finished = Vec::new();
        while !self.is_empty() {
            finished.extend(self.wait_any().await);
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        value: u32,
        cleanup_count: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Task<u32> for CountingTask {
        fn execute(&self) -> Result<u32> {
            if self.fail {
                Err(Error::Protocol("boom".into()))
            } else {
                Ok(self.value)
            }
        }

        fn cleanup(&mut self) {
            self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn wait_all_collects_every_result_and_runs_cleanup() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut list: TaskList<u32> = TaskList::new();
        for v in [1u32, 2, 3] {
            list.submit(Arc::new(CountingTask { value: v, cleanup_count: cleanups.clone(), fail: false }));
        }
        assert_eq!(list.len(), 3);

        let results = list.wait_all().await;
        assert_eq!(results.len(), 3);
        let mut values: Vec<u32> = results.into_iter().map(|(_, r)| r.unwrap()).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn failed_task_still_runs_cleanup() {
        let cleanups = Arc::new(AtomicUsize::new(0));
        let mut list: TaskList<u32> = TaskList::new();
        list.submit(Arc::new(CountingTask { value: 0, cleanup_count: cleanups.clone(), fail: true }));

        let results = list.wait_any().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_err());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }
}
