use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, error, trace, warn};

use crate::TaskError;
use crate::frame::FramePacing;
use crate::group::{GroupFinishedFn, GroupPhase, GroupSlot, TaskGroupId};
use crate::priority::{TaskPriority, WorkerThreadType};
use crate::task::{TaskContext, TaskHandle, TaskNesting};
use crate::worker::{self, WorkerRecord};

/// Upper bound for how deep a thread nests "execute someone else's task while I wait".
/// Beyond it, a blocked thread just sleeps.
pub const MAX_NESTED_HELPING: usize = 8;

/// Blocked threads re-check their condition at least this often.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub short_task_workers: usize,
    pub long_task_workers: usize,
    pub file_access_workers: usize,
}

impl SchedulerConfig {
    /// No worker threads at all: everything runs on threads that wait or drain frames.
    pub fn without_workers() -> Self {
        Self {
            short_task_workers: 0,
            long_task_workers: 0,
            file_access_workers: 0,
        }
    }

    pub(crate) fn workers_of(&self, thread_type: WorkerThreadType) -> usize {
        match thread_type {
            WorkerThreadType::ShortTasks => self.short_task_workers,
            WorkerThreadType::LongTasks => self.long_task_workers,
            WorkerThreadType::FileAccess => self.file_access_workers,
            WorkerThreadType::MainThread => 0,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|cores| cores.get())
            .unwrap_or(4);

        // leave room for the main thread and the render/driver thread
        Self {
            short_task_workers: cores.saturating_sub(2).max(2),
            long_task_workers: 2,
            file_access_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    FireAndForget,
    WaitTillFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// No invocation has executed (or will execute) its body.
    Canceled,
    /// At least one invocation already ran or was running. With [`CancelMode::WaitTillFinished`]
    /// all of them have finished by the time this is returned.
    AlreadyRunning,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub queued: [usize; TaskPriority::COUNT],
    pub group_slots: usize,
    pub free_group_slots: usize,
    pub this_frame_in_flight: usize,
}

impl SchedulerStats {
    pub fn queued_at(&self, priority: TaskPriority) -> usize {
        self.queued[priority.index()]
    }

    pub fn total_queued(&self) -> usize {
        self.queued.iter().sum()
    }
}

pub(crate) struct QueuedInvocation {
    pub task: TaskHandle,
    pub group: TaskGroupId,
    pub invocation: u32,
}

pub(crate) struct SchedulerState {
    pub queues: Vec<VecDeque<QueuedInvocation>>,
    pub groups: Vec<GroupSlot>,
    pub free_groups: Vec<u32>,
    /// Invocations taken from a this-frame tier that have not finished yet.
    pub this_frame_in_flight: usize,
    pub shutting_down: bool,
}

impl SchedulerState {
    fn new() -> Self {
        Self {
            queues: (0..TaskPriority::COUNT).map(|_| VecDeque::new()).collect_vec(),
            groups: Vec::new(),
            free_groups: Vec::new(),
            this_frame_in_flight: 0,
            shutting_down: false,
        }
    }

    /// A handle is finished once its slot moved on to the next generation.
    pub fn is_finished(&self, group: TaskGroupId) -> bool {
        match self.groups.get(group.index as usize) {
            Some(slot) => slot.generation != group.generation,
            None => true,
        }
    }

    fn current_slot_mut(&mut self, group: TaskGroupId) -> Option<&mut GroupSlot> {
        self.groups
            .get_mut(group.index as usize)
            .filter(|slot| slot.is_current(group))
    }

    pub fn this_frame_queued(&self) -> bool {
        TaskPriority::ALL
            .iter()
            .filter(|priority| priority.is_this_frame())
            .any(|priority| !self.queues[priority.index()].is_empty())
    }
}

/// Which queued work a thread may pick up from a given call site.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HelpScope {
    pub tiers: &'static [(TaskPriority, TaskPriority)],
    pub main_thread: bool,
    /// Blocked threads honor [`TaskNesting::Never`].
    pub blocked: bool,
    pub waiting_for: Option<TaskGroupId>,
}

pub(crate) struct Shared {
    pub state: Mutex<SchedulerState>,
    /// One per pooled worker type, see [`WorkerThreadType::pool_index`].
    pub work_available: [Condvar; 3],
    /// Signaled whenever work is queued or an invocation finishes.
    pub progress: Condvar,
    pub main_thread: ThreadId,
    pub workers: Mutex<Vec<WorkerRecord>>,
    pub frame: Mutex<FramePacing>,
}

/// The job system. Cheap to clone; all clones drive the same queues and worker pools.
///
/// The thread calling [`TaskScheduler::start`] becomes the main thread: it is the only one
/// executing the main-thread tiers and the only one allowed to call the frame hooks.
/// [`TaskScheduler::shutdown`] has to be called to stop and join the workers.
#[derive(Clone)]
pub struct TaskScheduler {
    pub(crate) shared: Arc<Shared>,
}

impl TaskScheduler {
    pub fn start(config: SchedulerConfig) -> Result<TaskScheduler, TaskError> {
        let scheduler = TaskScheduler {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::new()),
                work_available: [Condvar::new(), Condvar::new(), Condvar::new()],
                progress: Condvar::new(),
                main_thread: std::thread::current().id(),
                workers: Mutex::new(Vec::new()),
                frame: Mutex::new(FramePacing::new()),
            }),
        };

        for thread_type in WorkerThreadType::POOLED {
            scheduler.set_worker_thread_count(thread_type, config.workers_of(thread_type))?;
        }

        debug!(
            "Task scheduler started with {} short, {} long and {} file access workers",
            config.short_task_workers, config.long_task_workers, config.file_access_workers
        );
        Ok(scheduler)
    }

    /// Stops all worker threads. Work that is still queued is dropped without running, groups
    /// that are not finished by now never will be.
    pub fn shutdown(&self) {
        let dropped_work = {
            let mut state = self.lock_state();
            state.shutting_down = true;
            state.queues.iter_mut().map(std::mem::take).collect_vec()
        };

        let dropped = dropped_work.iter().map(VecDeque::len).sum::<usize>();
        if dropped > 0 {
            warn!("Dropping {} queued task invocations on shutdown", dropped);
        }
        drop(dropped_work);

        self.notify_everyone();

        let handles = {
            let mut workers = self.shared.workers.lock().expect("Worker list lock");
            workers.iter_mut().filter_map(|worker| worker.handle.take()).collect_vec()
        };

        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }

            if handle.join().is_err() {
                error!("A worker thread terminated abnormally");
            }
        }
        debug!("Task scheduler shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock_state().shutting_down
    }

    pub fn is_main_thread(&self) -> bool {
        std::thread::current().id() == self.shared.main_thread
    }

    pub fn create_group(&self, priority: TaskPriority, on_finished: Option<GroupFinishedFn>) -> TaskGroupId {
        let mut state = self.lock_state();
        let index = match state.free_groups.pop() {
            Some(index) => index,
            None => {
                state.groups.push(GroupSlot::new());
                (state.groups.len() - 1) as u32
            }
        };

        let slot = &mut state.groups[index as usize];
        slot.phase = GroupPhase::Unscheduled;
        slot.priority = priority;
        slot.remaining_tasks = 0;
        slot.unresolved_dependencies = 0;
        slot.on_finished = on_finished;

        TaskGroupId {
            index,
            generation: slot.generation,
        }
    }

    pub fn add_task_to_group(&self, group: TaskGroupId, task: &TaskHandle) {
        let mut state = self.lock_state();
        let Some(slot) = state.current_slot_mut(group) else {
            debug_assert!(false, "{} does not exist (anymore)", group);
            error!("Cannot add task '{}' to {}: no such group", task.name(), group);
            return;
        };

        if slot.phase != GroupPhase::Unscheduled {
            debug_assert!(false, "{} has already been started", group);
            error!("Cannot add task '{}' to {}: already started", task.name(), group);
            return;
        }

        if !task.prepare_for_group(group) {
            debug_assert!(false, "Task '{}' is still in use", task.name());
            error!("Cannot add task '{}' to {}: it has not finished yet", task.name(), group);
            return;
        }

        slot.tasks.push(task.clone());
    }

    /// `group` will not be scheduled before `depends_on` has finished.
    pub fn add_group_dependency(&self, group: TaskGroupId, depends_on: TaskGroupId) {
        let mut state = self.lock_state();
        if !depends_on.is_valid() || depends_on == group || state.is_finished(depends_on) {
            return;
        }

        let Some(slot) = state.current_slot_mut(group) else {
            debug_assert!(false, "{} does not exist (anymore)", group);
            error!("Cannot add a dependency to {}: no such group", group);
            return;
        };

        if slot.phase != GroupPhase::Unscheduled {
            debug_assert!(false, "{} has already been started", group);
            error!("Cannot add a dependency to {}: already started", group);
            return;
        }

        slot.dependencies.push(depends_on);
    }

    pub fn start_group(&self, group: TaskGroupId) {
        let enqueued = {
            let mut state = self.lock_state();
            let dependencies = match state.current_slot_mut(group) {
                Some(slot) if slot.phase == GroupPhase::Unscheduled => {
                    slot.remaining_tasks = slot.tasks.len() as u32;
                    std::mem::take(&mut slot.dependencies)
                }
                Some(_) => {
                    debug_assert!(false, "{} has already been started", group);
                    error!("{} has already been started", group);
                    return;
                }
                None => {
                    debug_assert!(false, "{} does not exist (anymore)", group);
                    error!("Cannot start {}: no such group", group);
                    return;
                }
            };

            let mut unresolved = 0;
            for dependency in dependencies {
                if let Some(dependency_slot) = state.current_slot_mut(dependency) {
                    dependency_slot.dependents.push(group);
                    unresolved += 1;
                }
            }

            let slot = &mut state.groups[group.index as usize];
            slot.unresolved_dependencies = unresolved;
            if unresolved > 0 {
                slot.phase = GroupPhase::WaitingForDependencies;
                trace!("{} waits for {} other groups", group, unresolved);
                return;
            }

            Self::enqueue_group_locked(&mut state, group)
        };

        if enqueued {
            self.notify_everyone();
        } else {
            self.complete_groups(vec![group]);
        }
    }

    pub fn start_single_task(
        &self,
        task: &TaskHandle,
        priority: TaskPriority,
        dependency: Option<TaskGroupId>,
    ) -> TaskGroupId {
        let group = self.create_group(priority, None);
        self.add_task_to_group(group, task);
        if let Some(dependency) = dependency {
            self.add_group_dependency(group, dependency);
        }
        self.start_group(group);
        group
    }

    pub fn is_group_finished(&self, group: TaskGroupId) -> bool {
        self.lock_state().is_finished(group)
    }

    /// Blocks until the group has finished. The calling thread executes compatible queued work in
    /// the meantime, including the group's own tasks.
    pub fn wait_for_group(&self, group: TaskGroupId) -> Result<(), TaskError> {
        let mut state = self.lock_state();
        match state.groups.get(group.index as usize) {
            None => return Err(TaskError::UnknownGroup(group)),
            Some(slot) if slot.generation != group.generation => return Ok(()),
            Some(slot) if slot.phase == GroupPhase::Unscheduled => return Err(TaskError::GroupNotStarted(group)),
            Some(_) => {}
        }

        let scope = self.blocked_scope(Some(group));
        loop {
            if state.is_finished(group) {
                return Ok(());
            }

            if state.shutting_down {
                return Err(TaskError::SchedulerShutDown);
            }

            if worker::help_depth() < MAX_NESTED_HELPING {
                if let Some((entry, priority)) = Self::take_next_locked(&mut state, &scope) {
                    drop(state);
                    worker::nested_help(|| self.run_invocation(entry, priority));
                    state = self.lock_state();
                    continue;
                }
            }

            state = self
                .shared
                .progress
                .wait_timeout(state, WAIT_SLICE)
                .expect("Scheduler state lock")
                .0;
        }
    }

    /// Blocks until `condition` holds, helping with compatible work in the meantime.
    /// The condition is evaluated without holding any scheduler lock.
    pub fn wait_for_condition<F>(&self, condition: F)
    where
        F: Fn() -> bool,
    {
        let scope = self.blocked_scope(None);
        while !condition() {
            if self.try_execute_one(&scope) {
                continue;
            }

            let state = self.lock_state();
            if state.shutting_down {
                return;
            }
            drop(
                self.shared
                    .progress
                    .wait_timeout(state, WAIT_SLICE)
                    .expect("Scheduler state lock"),
            );
        }
    }

    pub fn cancel_task(&self, task: &TaskHandle, mode: CancelMode) -> CancelResult {
        if task.is_finished() {
            return Self::cancel_result(task);
        }

        task.request_cancel();

        let (removed, group) = {
            let mut state = self.lock_state();
            let group = task.group();
            let phase = state.current_slot_mut(group).map(|slot| slot.phase);
            match phase {
                // never queued, the flag keeps the body from running once it is
                Some(GroupPhase::Unscheduled) | Some(GroupPhase::WaitingForDependencies) => {
                    trace!("Canceled task '{}' before {} was scheduled", task.name(), group);
                    return CancelResult::Canceled;
                }
                _ => {
                    let mut removed = 0u32;
                    for queue in state.queues.iter_mut() {
                        queue.retain(|entry| {
                            let matches = entry.task.ptr_eq(task);
                            if matches {
                                removed += 1;
                            }
                            !matches
                        });
                    }
                    (removed, group)
                }
            }
        };

        if removed > 0 {
            trace!("Removed {} queued invocations of task '{}'", removed, task.name());
            self.invocations_finished(task, group, removed, 0);
        }

        if mode == CancelMode::WaitTillFinished && !task.is_finished() {
            self.wait_for_condition(|| task.is_finished());
        }

        Self::cancel_result(task)
    }

    /// Cancels every task of the group.
    pub fn cancel_group(&self, group: TaskGroupId, mode: CancelMode) -> CancelResult {
        let tasks = {
            let mut state = self.lock_state();
            match state.current_slot_mut(group) {
                Some(slot) => slot.tasks.clone(),
                None => return CancelResult::Canceled,
            }
        };

        let mut result = CancelResult::Canceled;
        for task in &tasks {
            if self.cancel_task(task, CancelMode::FireAndForget) == CancelResult::AlreadyRunning {
                result = CancelResult::AlreadyRunning;
            }
        }

        if mode == CancelMode::WaitTillFinished {
            for task in &tasks {
                if !task.is_finished() {
                    self.wait_for_condition(|| task.is_finished());
                }
            }
        }

        result
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.lock_state();
        let mut stats = SchedulerStats {
            group_slots: state.groups.len(),
            free_group_slots: state.free_groups.len(),
            this_frame_in_flight: state.this_frame_in_flight,
            ..SchedulerStats::default()
        };

        for (index, queue) in state.queues.iter().enumerate() {
            stats.queued[index] = queue.len();
        }
        stats
    }

    fn cancel_result(task: &TaskHandle) -> CancelResult {
        if task.is_finished() && task.started_runs() == 0 {
            CancelResult::Canceled
        } else {
            CancelResult::AlreadyRunning
        }
    }

    #[inline]
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared.state.lock().expect("Scheduler state lock")
    }

    pub(crate) fn notify_everyone(&self) {
        for condvar in &self.shared.work_available {
            condvar.notify_all();
        }
        self.shared.progress.notify_all();
    }

    /// The scope of a thread that is blocked in one of the wait calls.
    pub(crate) fn blocked_scope(&self, waiting_for: Option<TaskGroupId>) -> HelpScope {
        let main_thread = self.is_main_thread();
        let thread_type = match worker::current_worker() {
            Some(thread_type) => thread_type,
            None if main_thread => WorkerThreadType::MainThread,
            None => WorkerThreadType::ShortTasks,
        };

        HelpScope {
            tiers: thread_type.worker_tiers(),
            main_thread,
            blocked: true,
            waiting_for,
        }
    }

    /// Runs at most one queued invocation the scope allows. Returns whether one ran.
    pub(crate) fn try_execute_one(&self, scope: &HelpScope) -> bool {
        if scope.blocked && worker::help_depth() >= MAX_NESTED_HELPING {
            return false;
        }

        let picked = {
            let mut state = self.lock_state();
            Self::take_next_locked(&mut state, scope)
        };

        match picked {
            Some((entry, priority)) if scope.blocked => {
                worker::nested_help(|| self.run_invocation(entry, priority));
                true
            }
            Some((entry, priority)) => {
                self.run_invocation(entry, priority);
                true
            }
            None => false,
        }
    }

    /// Takes the next invocation the scope may run off the queues.
    pub(crate) fn take_next_locked(
        state: &mut SchedulerState,
        scope: &HelpScope,
    ) -> Option<(QueuedInvocation, TaskPriority)> {
        let picked = Self::pick_locked(state, scope)?;
        if picked.1.is_this_frame() {
            state.this_frame_in_flight += 1;
        }
        Some(picked)
    }

    fn pick_locked(state: &mut SchedulerState, scope: &HelpScope) -> Option<(QueuedInvocation, TaskPriority)> {
        // the group we are waiting for always comes first, wherever it is queued
        if let Some(group) = scope.waiting_for {
            for priority in TaskPriority::ALL {
                if priority.is_main_thread_only() && !scope.main_thread {
                    continue;
                }

                let queue = &mut state.queues[priority.index()];
                if let Some(position) = queue.iter().position(|entry| entry.group == group) {
                    return queue.remove(position).map(|entry| (entry, priority));
                }
            }
        }

        for &(first, last) in scope.tiers {
            for index in first.index()..=last.index() {
                let queue = &mut state.queues[index];
                let position = if scope.blocked {
                    queue
                        .iter()
                        .position(|entry| entry.task.nesting() == TaskNesting::Maybe)
                } else if queue.is_empty() {
                    None
                } else {
                    Some(0)
                };

                if let Some(position) = position {
                    return queue
                        .remove(position)
                        .map(|entry| (entry, TaskPriority::from_index(index)));
                }
            }
        }

        None
    }

    pub(crate) fn run_invocation(&self, entry: QueuedInvocation, priority: TaskPriority) {
        let QueuedInvocation {
            task,
            group,
            invocation,
        } = entry;

        if task.is_canceled() {
            trace!("Skipping canceled task '{}'", task.name());
        } else {
            let ctx = TaskContext {
                scheduler: self,
                task: &task,
                group,
                invocation,
            };

            if catch_unwind(AssertUnwindSafe(|| task.execute(&ctx))).is_err() {
                task.mark_panicked();
                error!(
                    "Task '{}' panicked in invocation {} ({})",
                    task.name(),
                    invocation,
                    priority
                );
            }
        }

        self.invocations_finished(&task, group, 1, usize::from(priority.is_this_frame()));
    }

    /// Accounts for `count` finished (or removed) invocations of `task`, submitted to `group`.
    pub(crate) fn invocations_finished(&self, task: &TaskHandle, group: TaskGroupId, count: u32, this_frame_runs: usize) {
        let task_done = task.finish_runs(count);
        if task_done {
            task.fire_on_finished();
        }

        let group_done = {
            let mut state = self.lock_state();
            state.this_frame_in_flight -= this_frame_runs;

            if task_done {
                match state.current_slot_mut(group) {
                    Some(slot) => {
                        slot.remaining_tasks -= 1;
                        if slot.remaining_tasks == 0 {
                            slot.phase = GroupPhase::Finishing;
                            true
                        } else {
                            false
                        }
                    }
                    None => {
                        error!("Task '{}' finished for {}, which is gone", task.name(), group);
                        false
                    }
                }
            } else {
                false
            }
        };

        if group_done {
            self.complete_groups(vec![group]);
        } else {
            self.shared.progress.notify_all();
        }
    }

    /// Moves all invocations of the group into its tier. Returns false if there was nothing to
    /// enqueue, in that case the group is marked finishing and has to be completed by the caller.
    fn enqueue_group_locked(state: &mut SchedulerState, group: TaskGroupId) -> bool {
        let slot = &mut state.groups[group.index as usize];
        if slot.tasks.is_empty() {
            slot.phase = GroupPhase::Finishing;
            return false;
        }

        slot.phase = GroupPhase::Scheduled;
        let priority = slot.priority;
        let entries = slot
            .tasks
            .iter()
            .flat_map(|task| {
                (0..task.multiplicity()).map(move |invocation| QueuedInvocation {
                    task: task.clone(),
                    group,
                    invocation,
                })
            })
            .collect_vec();

        trace!("{} scheduled {} invocations as {}", group, entries.len(), priority);
        state.queues[priority.index()].extend(entries);
        true
    }

    /// Runs the completion of groups whose last task finished: callback, generation bump,
    /// dependents, wake up. Empty dependents complete in the same loop.
    fn complete_groups(&self, mut finishing: Vec<TaskGroupId>) {
        while let Some(group) = finishing.pop() {
            let (tasks, on_finished) = {
                let mut state = self.lock_state();
                let slot = &mut state.groups[group.index as usize];
                (std::mem::take(&mut slot.tasks), slot.on_finished.take())
            };

            // may release the last handle of pooled tasks
            drop(tasks);

            if let Some(on_finished) = on_finished {
                on_finished(group);
            }

            let mut state = self.lock_state();
            let dependents = {
                let slot = &mut state.groups[group.index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.phase = GroupPhase::Free;
                slot.dependencies.clear();
                std::mem::take(&mut slot.dependents)
            };
            state.free_groups.push(group.index);

            for dependent in dependents {
                let ready = match state.current_slot_mut(dependent) {
                    Some(slot) => {
                        slot.unresolved_dependencies -= 1;
                        slot.unresolved_dependencies == 0
                    }
                    None => false,
                };

                if ready && !Self::enqueue_group_locked(&mut state, dependent) {
                    finishing.push(dependent);
                }
            }

            trace!("{} finished", group);
            drop(state);
            self.notify_everyone();
        }
    }
}
