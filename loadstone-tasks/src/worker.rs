use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::TaskError;
use crate::priority::WorkerThreadType;
use crate::scheduler::{HelpScope, TaskScheduler};

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerThreadType>> = const { Cell::new(None) };
    static HELP_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The pool the calling thread belongs to, `None` for threads the scheduler did not spawn.
pub(crate) fn current_worker() -> Option<WorkerThreadType> {
    CURRENT_WORKER.with(Cell::get)
}

pub(crate) fn help_depth() -> usize {
    HELP_DEPTH.with(Cell::get)
}

/// Runs `f` one helping level deeper.
pub(crate) fn nested_help<R>(f: impl FnOnce() -> R) -> R {
    HELP_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = f();
    HELP_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

#[derive(Default)]
pub(crate) struct WorkerStats {
    busy_nanos: AtomicU64,
    tasks_executed: AtomicU32,
    last_utilization: AtomicU64,
    last_tasks_executed: AtomicU32,
}

impl WorkerStats {
    fn record(&self, busy: Duration) {
        self.busy_nanos
            .fetch_add(busy.as_nanos() as u64, Ordering::Relaxed);
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn close_window(&self, window: Duration) {
        let busy = self.busy_nanos.swap(0, Ordering::Relaxed);
        let tasks = self.tasks_executed.swap(0, Ordering::Relaxed);

        let utilization = if window.is_zero() {
            0.0
        } else {
            (busy as f64 / window.as_nanos() as f64).min(1.0)
        };

        self.last_utilization
            .store(utilization.to_bits(), Ordering::Relaxed);
        self.last_tasks_executed.store(tasks, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ThreadUtilization {
        ThreadUtilization {
            utilization: f64::from_bits(self.last_utilization.load(Ordering::Relaxed)),
            tasks_executed: self.last_tasks_executed.load(Ordering::Relaxed),
        }
    }
}

/// How busy a worker was during the last completed frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadUtilization {
    /// Between 0 and 1.
    pub utilization: f64,
    pub tasks_executed: u32,
}

pub(crate) struct WorkerRecord {
    pub thread_type: WorkerThreadType,
    pub handle: Option<JoinHandle<()>>,
    pub stats: Arc<WorkerStats>,
}

impl TaskScheduler {
    /// Grows the pool of `thread_type` to `count` threads. Pools never shrink.
    pub fn set_worker_thread_count(&self, thread_type: WorkerThreadType, count: usize) -> Result<(), TaskError> {
        if thread_type.pool_index().is_none() {
            warn!("The main thread has no pool, ignoring a worker count of {}", count);
            return Ok(());
        }

        if self.lock_state().shutting_down {
            return Err(TaskError::SchedulerShutDown);
        }

        let mut workers = self.shared.workers.lock().expect("Worker list lock");
        let existing = workers
            .iter()
            .filter(|worker| worker.thread_type == thread_type)
            .count();

        for index in existing..count {
            let stats = Arc::new(WorkerStats::default());
            let scheduler = self.clone();
            let thread_stats = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{} Worker {}", thread_type.name(), index))
                .spawn(move || worker_loop(scheduler, thread_type, thread_stats))?;

            workers.push(WorkerRecord {
                thread_type,
                handle: Some(handle),
                stats,
            });
        }

        if count > existing {
            debug!("{} pool grown from {} to {} threads", thread_type.name(), existing, count);
        }
        Ok(())
    }

    pub fn worker_thread_count(&self, thread_type: WorkerThreadType) -> usize {
        self.shared
            .workers
            .lock()
            .expect("Worker list lock")
            .iter()
            .filter(|worker| worker.thread_type == thread_type)
            .count()
    }

    /// One entry per worker of the pool, measured over the last completed frame.
    pub fn thread_utilization(&self, thread_type: WorkerThreadType) -> Vec<ThreadUtilization> {
        self.shared
            .workers
            .lock()
            .expect("Worker list lock")
            .iter()
            .filter(|worker| worker.thread_type == thread_type)
            .map(|worker| worker.stats.snapshot())
            .collect()
    }

    pub(crate) fn close_utilization_window(&self, window: Duration) {
        for worker in self.shared.workers.lock().expect("Worker list lock").iter() {
            worker.stats.close_window(window);
        }
    }
}

fn worker_loop(scheduler: TaskScheduler, thread_type: WorkerThreadType, stats: Arc<WorkerStats>) {
    CURRENT_WORKER.with(|current| current.set(Some(thread_type)));

    let Some(pool_index) = thread_type.pool_index() else {
        return;
    };

    let scope = HelpScope {
        tiers: thread_type.worker_tiers(),
        main_thread: false,
        blocked: false,
        waiting_for: None,
    };

    trace!("{} worker started", thread_type.name());
    loop {
        let (entry, priority) = {
            let mut state = scheduler.lock_state();
            loop {
                if state.shutting_down {
                    trace!("{} worker stopped", thread_type.name());
                    return;
                }

                if let Some(picked) = TaskScheduler::take_next_locked(&mut state, &scope) {
                    break picked;
                }

                state = scheduler.shared.work_available[pool_index]
                    .wait(state)
                    .expect("Scheduler state lock");
            }
        };

        let started = Instant::now();
        scheduler.run_invocation(entry, priority);
        stats.record(started.elapsed());
    }
}
