use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use std::time::Instant;

use log::{debug, error, warn};
use loadstone_tasks::{TaskBuilder, TaskGroupId, TaskHandle, TaskNesting, TaskPriority};

use crate::resource::events::ResourceEventKind;
use crate::resource::loader::{LoadOutcome, ResourceLoadData};
use crate::resource::manager::{ManagerShared, ManagerState};
use crate::resource::resource::ResourceHandle;
use crate::resource::state::{ResourceFlags, ResourceState};

#[derive(Default)]
pub(crate) struct SlotAssignment {
    pub resource: Option<ResourceHandle>,
    pub data: Option<ResourceLoadData>,
    /// The thread running a content update, so it does not wait for itself.
    pub thread: Option<ThreadId>,
}

/// What a pooled worker task is working on. Set before its group is started, cleared by the task
/// before it finishes.
#[derive(Default)]
pub(crate) struct SlotWork {
    assignment: Mutex<SlotAssignment>,
}

impl SlotWork {
    pub fn lock(&self) -> MutexGuard<'_, SlotAssignment> {
        self.assignment.lock().expect("Slot Assignment Lock")
    }

    fn assign(&self, resource: ResourceHandle, data: Option<ResourceLoadData>) {
        let mut assignment = self.lock();
        assignment.resource = Some(resource);
        assignment.data = data;
        assignment.thread = None;
    }

    fn begin_update(&self) -> Option<(ResourceHandle, ResourceLoadData)> {
        let mut assignment = self.lock();
        assignment.thread = Some(std::thread::current().id());
        let resource = assignment.resource.clone()?;
        let data = assignment.data.take()?;
        Some((resource, data))
    }

    fn take_resource(&self) -> Option<ResourceHandle> {
        let mut assignment = self.lock();
        assignment.data = None;
        assignment.thread = None;
        assignment.resource.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    DataLoad,
    ContentUpdate,
}

/// A pooled worker task and the group it was last started with.
pub(crate) struct WorkerSlot {
    pub task: TaskHandle,
    pub group: TaskGroupId,
    pub work: Arc<SlotWork>,
}

impl WorkerSlot {
    pub fn new(shared: &Arc<ManagerShared>, kind: WorkerKind, index: usize) -> Self {
        let work = Arc::new(SlotWork::default());
        let weak = Arc::downgrade(shared);

        let body_weak = weak.clone();
        let body_work = work.clone();
        let finished_work = work.clone();
        let name = match kind {
            WorkerKind::DataLoad => format!("Resource Data Load {}", index),
            WorkerKind::ContentUpdate => format!("Resource Content Update {}", index),
        };

        let task = TaskBuilder::new(name)
            .nesting(TaskNesting::Maybe)
            .on_finished(move |task| {
                if task.has_panicked() {
                    release_abandoned_work(&weak, &finished_work, kind);
                }
            })
            .build_fn(move |_| {
                let Some(shared) = body_weak.upgrade() else {
                    return;
                };

                match kind {
                    WorkerKind::DataLoad => shared.data_load(&body_work),
                    WorkerKind::ContentUpdate => shared.content_update(&body_work),
                }
            });

        Self {
            task,
            group: TaskGroupId::INVALID,
            work,
        }
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.task.is_finished()
    }
}

fn release_abandoned_work(weak: &Weak<ManagerShared>, work: &SlotWork, kind: WorkerKind) {
    let Some(shared) = weak.upgrade() else {
        return;
    };

    let resource = work.take_resource();
    if let Some(resource) = &resource {
        error!("Worker task panicked while loading {}", **resource);
        if kind == WorkerKind::ContentUpdate {
            // half updated content is not usable, not even a lower quality level of it
            shared
                .events
                .broadcast(ResourceEventKind::ContentUnloading, resource);
            resource.unload_content();
        }
        shared.finish_load(resource, ResourceState::TransformError);
    }

    if kind == WorkerKind::DataLoad {
        let mut state = shared.lock_state();
        state.launch_allowed = true;
        shared.run_worker_task_locked(&mut state);
    }
}

impl ManagerShared {
    /// Starts an idle data load task if there is queued work and no launched task is still on its
    /// way to the queue. Grows the pool up to the configured size.
    pub(crate) fn run_worker_task_locked(self: &Arc<Self>, state: &mut ManagerState) {
        if state.queue.is_empty() || !state.launch_allowed {
            return;
        }

        let index = match state.data_loads.iter().position(WorkerSlot::is_idle) {
            Some(index) => index,
            None if state.data_loads.len() < self.config.max_data_load_tasks => {
                let index = state.data_loads.len();
                state
                    .data_loads
                    .push(WorkerSlot::new(self, WorkerKind::DataLoad, index));
                index
            }
            None => return,
        };

        if state.data_loads[index].task.has_panicked() {
            state.data_loads[index] = WorkerSlot::new(self, WorkerKind::DataLoad, index);
        }

        state.launch_allowed = false;
        let slot = &mut state.data_loads[index];
        slot.group = self
            .scheduler
            .start_single_task(&slot.task, TaskPriority::FileAccess, None);
    }

    /// Claims the next queued resource and reads its data.
    fn data_load(self: &Arc<Self>, work: &SlotWork) {
        let resource = {
            let mut state = self.lock_state();
            let resource = state.queue.pop_front();
            state.launch_allowed = true;
            // more work waiting means more parallel loads, up to the pool size
            self.run_worker_task_locked(&mut state);
            resource
        };

        let Some(resource) = resource else {
            return;
        };

        work.assign(resource.clone(), None);

        let custom_loader = {
            let mut meta = resource.meta();
            if meta.state == ResourceState::Unloaded {
                meta.state = ResourceState::Loading;
            }
            meta.flags.remove(ResourceFlags::HAS_CUSTOM_DATA_LOADER);
            meta.custom_loader.take()
        };

        let loader = match custom_loader {
            Some(loader) => loader,
            None => match self.types.get(resource.type_name()) {
                Some(entry) => entry.loader.clone(),
                None => {
                    error!("{} has no registered resource type", *resource);
                    self.finish_load(&resource, ResourceState::TransformError);
                    work.take_resource();
                    return;
                }
            },
        };

        match loader.open_data_stream(&resource) {
            Ok(LoadOutcome::Data(data)) => self.start_content_update(&resource, data),
            Ok(LoadOutcome::Missing) => self.finish_load(&resource, ResourceState::LoadedResourceMissing),
            Ok(LoadOutcome::NeedsImport) => self.finish_load(&resource, ResourceState::NeedsImport),
            Err(err) => {
                error!("Failed to read the data of {}: {:#}", *resource, err);
                self.finish_load(&resource, ResourceState::TransformError);
            }
        }

        // the claim moved on to the content update, if there is one
        work.take_resource();
    }

    fn start_content_update(self: &Arc<Self>, resource: &ResourceHandle, data: ResourceLoadData) {
        let priority = if resource.is_flagged(ResourceFlags::UPDATE_ON_MAIN_THREAD) {
            TaskPriority::ThisFrameMainThread
        } else {
            TaskPriority::LongRunningHighPriority
        };

        let mut state = self.lock_state();
        let index = match state.content_updates.iter().position(WorkerSlot::is_idle) {
            Some(index) => index,
            None => {
                let index = state.content_updates.len();
                state
                    .content_updates
                    .push(WorkerSlot::new(self, WorkerKind::ContentUpdate, index));
                index
            }
        };

        if state.content_updates[index].task.has_panicked() {
            state.content_updates[index] = WorkerSlot::new(self, WorkerKind::ContentUpdate, index);
        }

        let slot = &mut state.content_updates[index];
        slot.work.assign(resource.clone(), Some(data));
        slot.group = self.scheduler.start_single_task(&slot.task, priority, None);
    }

    fn content_update(self: &Arc<Self>, work: &SlotWork) {
        let Some((resource, data)) = work.begin_update() else {
            warn!("Content update task started without work");
            return;
        };

        let outcome = resource.update_content(&data);
        self.finish_load(&resource, outcome);
        work.take_resource();
    }

    /// Records the outcome of a load and releases the claim on the resource. A resource that got
    /// better but still has quality levels to load is queued again while it is in use.
    pub(crate) fn finish_load(self: &Arc<Self>, resource: &ResourceHandle, outcome: ResourceState) {
        let final_state = {
            let mut meta = resource.meta();
            if outcome.is_failure() && meta.state == ResourceState::Loaded {
                // an additional quality level failed, what is there stays usable
                warn!("Loading another quality level failed with {:?}", outcome);
                meta.quality_levels_loadable = 0;
            } else {
                meta.state = outcome;
            }
            meta.state
        };

        let now = Instant::now();
        {
            let mut state = self.lock_state();
            resource
                .meta()
                .flags
                .remove(ResourceFlags::QUEUED_FOR_LOADING);

            if final_state == ResourceState::Loaded && self.wants_more_quality(resource, now) {
                state.queue.request_load(resource, false, now);
                self.run_worker_task_locked(&mut state);
            }
        }

        debug!("{} finished loading as {:?}", **resource, final_state);
        let kind = if final_state.is_failure() {
            ResourceEventKind::LoadingFailed
        } else {
            ResourceEventKind::ContentUpdated
        };
        self.events.broadcast(kind, resource);
    }

    pub(crate) fn wants_more_quality(&self, resource: &ResourceHandle, now: Instant) -> bool {
        let meta = resource.meta();
        meta.quality_levels_loadable > 0 && self.acquired_recently(meta.last_acquire, now)
    }

    pub(crate) fn acquired_recently(&self, last_acquire: Option<Instant>, now: Instant) -> bool {
        last_acquire.is_some_and(|last| now.saturating_duration_since(last) <= self.config.requeue_window)
    }
}
