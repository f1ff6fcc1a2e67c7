//! Single-threaded, deterministic executor.
//!
//! Tasks run in FIFO order of their wake-ups on the thread calling
//! [`LabExecutor::run_until_quiescent`]. Task ids are never reused, so a stale
//! waker can at worst schedule a finished task, which is ignored.

use crate::runtime::{BoxFuture, Spawn};
use crate::tracing_compat::trace;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

struct LabTask {
    name: &'static str,
    future: Option<BoxFuture>,
}

#[derive(Default)]
struct Queue {
    order: VecDeque<u64>,
    queued: BTreeSet<u64>,
}

#[derive(Default)]
struct Shared {
    next_id: Mutex<u64>,
    tasks: Mutex<BTreeMap<u64, LabTask>>,
    ready: Mutex<Queue>,
}

impl Shared {
    fn schedule(&self, id: u64) {
        let mut ready = self.ready.lock();
        if ready.queued.insert(id) {
            ready.order.push_back(id);
        }
    }

    fn insert(&self, name: &'static str, future: BoxFuture) -> u64 {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        self.tasks.lock().insert(
            id,
            LabTask {
                name,
                future: Some(future),
            },
        );
        trace!(task = id, name, "lab task spawned");
        self.schedule(id);
        id
    }
}

struct TaskWaker {
    id: u64,
    shared: Weak<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.schedule(self.id);
        }
    }
}

/// Result slot of a spawned task.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: u64,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> JoinHandle<T> {
    /// Task id inside the executor.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true once the task produced its output.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Takes the output, if finished.
    pub fn try_take(&self) -> Option<T> {
        self.result.lock().take()
    }
}

/// Deterministic executor for tests.
pub struct LabExecutor {
    shared: Arc<Shared>,
    max_steps: usize,
}

impl std::fmt::Debug for LabExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabExecutor")
            .field("tasks", &self.task_count())
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl Default for LabExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LabExecutor {
    /// Default bound on polls per [`run_until_quiescent`](Self::run_until_quiescent).
    pub const DEFAULT_MAX_STEPS: usize = 100_000;

    /// Creates an empty executor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_steps(Self::DEFAULT_MAX_STEPS)
    }

    /// Creates an executor that polls at most `max_steps` times per run.
    #[must_use]
    pub fn with_max_steps(max_steps: usize) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            max_steps,
        }
    }

    /// A spawner feeding this executor.
    #[must_use]
    pub fn spawner(&self) -> Arc<dyn Spawn> {
        Arc::new(LabSpawner {
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Spawns `future` and returns a handle to its output.
    pub fn spawn<F, T>(&self, name: &'static str, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let id = self.shared.insert(
            name,
            Box::pin(async move {
                let output = future.await;
                *slot.lock() = Some(output);
            }),
        );
        JoinHandle { id, result }
    }

    /// Drops a task's future, running its cleanup. Returns false if it had
    /// already finished.
    pub fn abort(&self, id: u64) -> bool {
        let task = self.shared.tasks.lock().remove(&id);
        match task {
            Some(task) => {
                trace!(task = id, name = task.name, "lab task aborted");
                drop(task);
                true
            }
            None => false,
        }
    }

    /// Number of unfinished tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Returns true when no task is ready to run.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.shared.ready.lock().order.is_empty()
    }

    /// Polls ready tasks until none is ready; returns the number of polls.
    pub fn run_until_quiescent(&self) -> usize {
        let mut steps = 0;
        while steps < self.max_steps {
            let next = {
                let mut ready = self.shared.ready.lock();
                let id = ready.order.pop_front();
                if let Some(id) = id {
                    ready.queued.remove(&id);
                }
                id
            };
            let Some(id) = next else {
                break;
            };
            let future = self
                .shared
                .tasks
                .lock()
                .get_mut(&id)
                .and_then(|task| task.future.take());
            let Some(mut future) = future else {
                continue;
            };
            steps += 1;

            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                shared: Arc::downgrade(&self.shared),
            }));
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    let task = self.shared.tasks.lock().remove(&id);
                    if let Some(task) = task {
                        trace!(task = id, name = task.name, "lab task finished");
                    }
                }
                Poll::Pending => {
                    let mut tasks = self.shared.tasks.lock();
                    match tasks.get_mut(&id) {
                        Some(task) => task.future = Some(future),
                        // Aborted while running.
                        None => {
                            drop(tasks);
                            drop(future);
                        }
                    }
                }
            }
        }
        steps
    }
}

impl Drop for LabExecutor {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        drop(tasks);
    }
}

struct LabSpawner {
    shared: Weak<Shared>,
}

impl Spawn for LabSpawner {
    fn spawn_boxed(&self, name: &'static str, future: BoxFuture) {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.insert(name, future);
            }
            None => trace!(name, "spawn on a dropped lab executor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Condition, TaskSignal};

    #[test]
    fn runs_spawned_tasks_to_completion() {
        let executor = LabExecutor::new();
        let handle = executor.spawn("answer", async { 42 });
        executor.run_until_quiescent();
        assert_eq!(handle.try_take(), Some(42));
        assert_eq!(executor.task_count(), 0);
    }

    #[test]
    fn signal_wakes_waiting_task() {
        let executor = LabExecutor::new();
        let signal = TaskSignal::new("waiter");
        let waiter = signal.clone();
        let handle = executor.spawn("wait", async move {
            waiter.wait(Condition::HAVE_REPLY).await.is_ok()
        });
        executor.run_until_quiescent();
        assert!(!handle.is_finished());

        signal.signal(Condition::HAVE_REPLY);
        executor.run_until_quiescent();
        assert_eq!(handle.try_take(), Some(true));
    }

    #[test]
    fn tasks_spawned_by_tasks_run() {
        let executor = LabExecutor::new();
        let spawner = executor.spawner();
        let flag = Arc::new(Mutex::new(false));
        let inner = flag.clone();
        let _outer = executor.spawn("outer", async move {
            spawner.spawn_boxed(
                "inner",
                Box::pin(async move {
                    *inner.lock() = true;
                }),
            );
        });
        executor.run_until_quiescent();
        assert!(*flag.lock());
    }

    #[test]
    fn abort_drops_pending_task() {
        let executor = LabExecutor::new();
        let handle = executor.spawn("forever", std::future::pending::<()>());
        executor.run_until_quiescent();
        assert!(executor.abort(handle.id()));
        assert!(!executor.abort(handle.id()));
        assert_eq!(executor.task_count(), 0);
    }
}
