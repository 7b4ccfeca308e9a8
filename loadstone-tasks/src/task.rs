use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::group::TaskGroupId;
use crate::scheduler::TaskScheduler;

/// Decides whether a thread that is blocked (waiting for a group or a condition) may pick this
/// task up while it helps out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskNesting {
    #[default]
    Maybe,
    /// Only executed by blocked threads that wait on the group this task belongs to.
    Never,
}

/// The work behind a [`TaskHandle`]. Invoked once per invocation, potentially from several
/// threads at the same time when the task has a multiplicity above one.
pub trait Task: Send + Sync {
    fn execute(&self, ctx: &TaskContext<'_>);
}

impl<F> Task for F
where
    F: Fn(&TaskContext<'_>) + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext<'_>) {
        self(ctx)
    }
}

/// What a running invocation knows about itself.
pub struct TaskContext<'a> {
    pub(crate) scheduler: &'a TaskScheduler,
    pub(crate) task: &'a TaskHandle,
    pub(crate) group: TaskGroupId,
    pub(crate) invocation: u32,
}

impl TaskContext<'_> {
    /// Zero based, smaller than the task's multiplicity.
    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        self.scheduler
    }

    pub fn task(&self) -> &TaskHandle {
        self.task
    }

    pub fn group(&self) -> TaskGroupId {
        self.group
    }

    /// Long running bodies are expected to poll this and bail out early.
    pub fn is_canceled(&self) -> bool {
        self.task.is_canceled()
    }
}

pub type TaskFinishedFn = Box<dyn Fn(&TaskHandle) + Send + Sync>;

pub(crate) struct TaskInner {
    name: String,
    nesting: TaskNesting,
    multiplicity: u32,
    /// Invocations that have not finished yet, zero when the task is idle and reusable.
    remaining_runs: AtomicU32,
    /// Invocations whose body actually started.
    started_runs: AtomicU32,
    canceled: AtomicBool,
    panicked: AtomicBool,
    group: Mutex<TaskGroupId>,
    on_finished: Option<TaskFinishedFn>,
    body: Box<dyn Task>,
}

/// Shared handle to a task. Cloning is cheap, the task is destroyed with its last handle.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    pub fn new<T: Task + 'static>(name: impl Into<String>, body: T) -> Self {
        TaskBuilder::new(name).build(body)
    }

    pub fn from_fn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        TaskBuilder::new(name).build_fn(body)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn nesting(&self) -> TaskNesting {
        self.inner.nesting
    }

    pub fn multiplicity(&self) -> u32 {
        self.inner.multiplicity
    }

    /// True once every invocation has either run or been canceled. A task that was never
    /// submitted counts as finished.
    pub fn is_finished(&self) -> bool {
        self.inner.remaining_runs.load(Ordering::Acquire) == 0
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Whether any invocation of the last submission panicked.
    pub fn has_panicked(&self) -> bool {
        self.inner.panicked.load(Ordering::Acquire)
    }

    pub fn started_runs(&self) -> u32 {
        self.inner.started_runs.load(Ordering::Acquire)
    }

    /// The group of the last submission.
    pub fn group(&self) -> TaskGroupId {
        *self.inner.group.lock().expect("Task group lock")
    }

    #[inline]
    pub fn ptr_eq(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Arms the task for a new submission. Fails when the previous submission is still running.
    pub(crate) fn prepare_for_group(&self, group: TaskGroupId) -> bool {
        if self
            .inner
            .remaining_runs
            .compare_exchange(
                0,
                self.inner.multiplicity,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        self.inner.started_runs.store(0, Ordering::Release);
        self.inner.canceled.store(false, Ordering::Release);
        self.inner.panicked.store(false, Ordering::Release);
        *self.inner.group.lock().expect("Task group lock") = group;
        true
    }

    pub(crate) fn request_cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn execute(&self, ctx: &TaskContext<'_>) {
        self.inner.started_runs.fetch_add(1, Ordering::AcqRel);
        self.inner.body.execute(ctx);
    }

    pub(crate) fn mark_panicked(&self) {
        self.inner.panicked.store(true, Ordering::Release);
    }

    /// Returns true if these were the last outstanding invocations.
    pub(crate) fn finish_runs(&self, count: u32) -> bool {
        let previous = self.inner.remaining_runs.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(
            previous >= count,
            "Task '{}' finished more invocations than it had",
            self.inner.name
        );
        previous == count
    }

    pub(crate) fn fire_on_finished(&self) {
        if let Some(on_finished) = self.inner.on_finished.as_ref() {
            on_finished(self);
        }
    }
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.inner.name)
            .field("nesting", &self.inner.nesting)
            .field("multiplicity", &self.inner.multiplicity)
            .field(
                "remaining_runs",
                &self.inner.remaining_runs.load(Ordering::Relaxed),
            )
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

pub struct TaskBuilder {
    name: String,
    nesting: TaskNesting,
    multiplicity: u32,
    on_finished: Option<TaskFinishedFn>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nesting: TaskNesting::default(),
            multiplicity: 1,
            on_finished: None,
        }
    }

    pub fn nesting(mut self, nesting: TaskNesting) -> Self {
        self.nesting = nesting;
        self
    }

    /// How often the body is invoked per submission. Invocations may run in parallel.
    pub fn multiplicity(mut self, multiplicity: u32) -> Self {
        self.multiplicity = multiplicity.max(1);
        self
    }

    /// Called once per submission, after the last invocation finished (or was canceled).
    pub fn on_finished<F>(mut self, on_finished: F) -> Self
    where
        F: Fn(&TaskHandle) + Send + Sync + 'static,
    {
        self.on_finished = Some(Box::new(on_finished));
        self
    }

    pub fn build<T: Task + 'static>(self, body: T) -> TaskHandle {
        TaskHandle {
            inner: Arc::new(TaskInner {
                name: self.name,
                nesting: self.nesting,
                multiplicity: self.multiplicity,
                remaining_runs: AtomicU32::new(0),
                started_runs: AtomicU32::new(0),
                canceled: AtomicBool::new(false),
                panicked: AtomicBool::new(false),
                group: Mutex::new(TaskGroupId::INVALID),
                on_finished: self.on_finished,
                body: Box::new(body),
            }),
        }
    }

    pub fn build_fn<F>(self, body: F) -> TaskHandle
    where
        F: Fn(&TaskContext<'_>) + Send + Sync + 'static,
    {
        self.build(body)
    }
}
