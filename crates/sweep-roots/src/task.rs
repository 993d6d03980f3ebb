//! Cooperative task pool.
//!
//! Tasks are `FnMut() -> bool` closures: returning true re-enqueues the
//! task, which is how workers yield between extents without unbounded
//! stacks. Two runners share the interface:
//!
//! - **Threads**: N OS threads over a work-stealing deque set (global
//!   injector, per-worker deques, steal on empty) with condvar parking.
//! - **Inline**: a plain FIFO the caller drains explicitly with
//!   [`run_one`](TaskPool::run_one) or [`drain`](TaskPool::drain);
//!   nothing runs on its own. This is the deterministic runner the
//!   simulation-style tests drive.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A resubmittable unit of work. True = run me again.
pub type TaskFn = Box<dyn FnMut() -> bool + Send>;

struct NamedTask {
    name: String,
    run: TaskFn,
}

struct ThreadState {
    injector: Injector<NamedTask>,
    stealers: Vec<Stealer<NamedTask>>,
    sleep_lock: Mutex<()>,
    wake: Condvar,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct InlineState {
    queue: Mutex<VecDeque<NamedTask>>,
}

enum Runner {
    Threads(ThreadState),
    Inline(InlineState),
}

/// Cloneable handle to a task pool.
#[derive(Clone)]
pub struct TaskPool {
    runner: Arc<Runner>,
}

impl TaskPool {
    /// Start a pool with `workers` OS threads.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let locals: Vec<Worker<NamedTask>> = (0..workers).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let state = Arc::new(Runner::Threads(ThreadState {
            injector: Injector::new(),
            stealers,
            sleep_lock: Mutex::new(()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        }));

        for (index, local) in locals.into_iter().enumerate() {
            let runner = Arc::clone(&state);
            let spawned = std::thread::Builder::new()
                .name(format!("sweep-worker-{index}"))
                .spawn(move || {
                    if let Runner::Threads(threads) = runner.as_ref() {
                        worker_loop(threads, &local);
                    }
                });
            match spawned {
                Ok(handle) => {
                    if let Runner::Threads(threads) = state.as_ref() {
                        threads.handles.lock().push(handle);
                    }
                }
                Err(err) => warn!(target: "sweep::task", %err, "failed to spawn worker thread"),
            }
        }

        Self { runner: state }
    }

    /// Build the caller-drained inline pool.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            runner: Arc::new(Runner::Inline(InlineState {
                queue: Mutex::new(VecDeque::new()),
            })),
        }
    }

    /// Submit a task. With the threads runner it starts as soon as a
    /// worker is free; with the inline runner it waits to be drained.
    pub fn spawn(&self, name: impl Into<String>, run: TaskFn) {
        let task = NamedTask {
            name: name.into(),
            run,
        };
        match self.runner.as_ref() {
            Runner::Threads(threads) => {
                if threads.shutdown.load(Ordering::Acquire) {
                    debug!(target: "sweep::task", task = %task.name, "dropping task after shutdown");
                    return;
                }
                threads.injector.push(task);
                threads.wake.notify_one();
            }
            Runner::Inline(inline) => {
                inline.queue.lock().push_back(task);
            }
        }
    }

    /// Inline runner only: run one task for one iteration, re-queueing
    /// it if it wants to continue. Returns false when the queue is
    /// empty (or on the threads runner, which drains itself).
    pub fn run_one(&self) -> bool {
        let Runner::Inline(inline) = self.runner.as_ref() else {
            return false;
        };
        let Some(mut task) = inline.queue.lock().pop_front() else {
            return false;
        };
        trace!(target: "sweep::task", task = %task.name, "running inline task");
        if (task.run)() {
            inline.queue.lock().push_back(task);
        }
        true
    }

    /// Inline runner only: run until the queue is empty.
    pub fn drain(&self) {
        while self.run_one() {}
    }

    /// Number of queued (not running) tasks. Approximate on the threads
    /// runner.
    #[must_use]
    pub fn queued(&self) -> usize {
        match self.runner.as_ref() {
            Runner::Threads(threads) => threads.injector.len(),
            Runner::Inline(inline) => inline.queue.lock().len(),
        }
    }

    /// Stop accepting work, wake and join all workers. Queued tasks
    /// that never started are dropped.
    pub fn shutdown(&self) {
        if let Runner::Threads(threads) = self.runner.as_ref() {
            threads.shutdown.store(true, Ordering::Release);
            threads.wake.notify_all();
            let handles: Vec<_> = threads.handles.lock().drain(..).collect();
            for handle in handles {
                if handle.join().is_err() {
                    warn!(target: "sweep::task", "worker thread panicked");
                }
            }
        }
    }
}

fn find_task(threads: &ThreadState, local: &Worker<NamedTask>) -> Option<NamedTask> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            threads
                .injector
                .steal_batch_and_pop(local)
                .or_else(|| threads.stealers.iter().map(Stealer::steal).collect())
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success)
    })
}

fn worker_loop(threads: &ThreadState, local: &Worker<NamedTask>) {
    loop {
        if threads.shutdown.load(Ordering::Acquire) {
            return;
        }
        match find_task(threads, local) {
            Some(mut task) => {
                trace!(target: "sweep::task", task = %task.name, "running task");
                if (task.run)() {
                    local.push(task);
                }
            }
            None => {
                let mut guard = threads.sleep_lock.lock();
                if threads.shutdown.load(Ordering::Acquire) {
                    return;
                }
                threads
                    .wake
                    .wait_for(&mut guard, Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn inline_runs_in_fifo_order() {
        let pool = TaskPool::inline();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..3_u64 {
            let log = Arc::clone(&log);
            pool.spawn(format!("t{id}"), Box::new(move || {
                log.lock().push(id);
                false
            }));
        }
        pool.drain();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn inline_requeues_continuing_tasks() {
        let pool = TaskPool::inline();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut remaining = 3_u64;
        {
            let log = Arc::clone(&log);
            pool.spawn("multi", Box::new(move || {
                log.lock().push("multi");
                remaining -= 1;
                remaining > 0
            }));
        }
        {
            let log = Arc::clone(&log);
            pool.spawn("single", Box::new(move || {
                log.lock().push("single");
                false
            }));
        }
        pool.drain();
        // The continuing task yields between iterations.
        assert_eq!(*log.lock(), vec!["multi", "single", "multi", "multi"]);
    }

    #[test]
    fn inline_spawn_from_within_task_is_queued() {
        let pool = TaskPool::inline();
        let ran = Arc::new(AtomicU64::new(0));
        {
            let pool_clone = pool.clone();
            let ran = Arc::clone(&ran);
            pool.spawn("outer", Box::new(move || {
                let ran = Arc::clone(&ran);
                pool_clone.spawn("nested", Box::new(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                    false
                }));
                false
            }));
        }
        pool.drain();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn threads_execute_and_requeue() {
        let pool = TaskPool::new(2);
        let count = Arc::new(AtomicU64::new(0));
        {
            let count = Arc::clone(&count);
            pool.spawn("ticker", Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed) < 4
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::Relaxed) < 5 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_work() {
        let pool = TaskPool::new(1);
        pool.shutdown();
        let ran = Arc::new(AtomicU64::new(0));
        {
            let ran = Arc::clone(&ran);
            pool.spawn("late", Box::new(move || {
                ran.fetch_add(1, Ordering::Relaxed);
                false
            }));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }
}
