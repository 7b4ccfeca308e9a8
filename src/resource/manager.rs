use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use itertools::Itertools;
use log::{debug, info, trace, warn};
use loadstone_tasks::{TaskGroupId, TaskHandle, TaskScheduler};
use thiserror::Error;

use crate::resource::events::{ResourceEvent, ResourceEventKind, ResourceEvents, SubscriptionId};
use crate::resource::loader::ResourceTypeLoader;
use crate::resource::loading_queue::LoadingQueue;
use crate::resource::policy::{AcquireAllowList, AcquireDuringUpdatePolicy};
use crate::resource::resource::{Resource, ResourceContent, ResourceHandle};
use crate::resource::state::{ResourceFlags, ResourcePriority, ResourceState};
use crate::resource::worker_tasks::WorkerSlot;

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("No resource type named '{0}' has been registered")]
    UnknownResourceType(String),
}

#[derive(Clone)]
pub struct ResourceManagerConfig {
    /// Upper bound for data loads running in parallel.
    pub max_data_load_tasks: usize,
    /// Queue entries re-scored per [`ResourceManager::per_frame_update`].
    pub deadline_batch: usize,
    /// Resources acquired within this window are loaded again after a reload and get their
    /// remaining quality levels loaded.
    pub requeue_window: Duration,
    pub acquire_policy: Arc<dyn AcquireDuringUpdatePolicy>,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            max_data_load_tasks: 4,
            deadline_batch: 50,
            requeue_window: Duration::from_secs(30),
            acquire_policy: Arc::new(AcquireAllowList::new()),
        }
    }
}

impl Debug for ResourceManagerConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManagerConfig")
            .field("max_data_load_tasks", &self.max_data_load_tasks)
            .field("deadline_batch", &self.deadline_batch)
            .field("requeue_window", &self.requeue_window)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ResourceTypeOptions {
    pub reloadable: bool,
    pub prevent_file_reload: bool,
    pub update_on_main_thread: bool,
    pub default_priority: ResourcePriority,
}

impl Default for ResourceTypeOptions {
    fn default() -> Self {
        Self {
            reloadable: true,
            prevent_file_reload: false,
            update_on_main_thread: false,
            default_priority: ResourcePriority::Medium,
        }
    }
}

impl ResourceTypeOptions {
    fn initial_flags(&self) -> ResourceFlags {
        let mut flags = ResourceFlags::empty();
        flags.set(ResourceFlags::RELOADABLE, self.reloadable);
        flags.set(ResourceFlags::PREVENT_FILE_RELOAD, self.prevent_file_reload);
        flags.set(ResourceFlags::UPDATE_ON_MAIN_THREAD, self.update_on_main_thread);
        flags
    }
}

type ContentFactory = Box<dyn Fn() -> Box<dyn ResourceContent> + Send + Sync>;

pub(crate) struct ResourceTypeEntry {
    pub name: Arc<str>,
    create: ContentFactory,
    pub loader: Arc<dyn ResourceTypeLoader>,
    pub options: ResourceTypeOptions,
    pub loading_fallback: ArcSwapOption<Resource>,
    pub missing_fallback: ArcSwapOption<Resource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ResourceKey {
    type_name: String,
    id: String,
}

impl ResourceKey {
    fn new(type_name: &str, id: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            id: id.to_string(),
        }
    }
}

/// Everything guarded by the manager lock. Lock order: this, then a resource's own locks, then
/// the scheduler. Never wait on the scheduler while holding it.
pub(crate) struct ManagerState {
    pub queue: LoadingQueue,
    pub data_loads: Vec<WorkerSlot>,
    pub content_updates: Vec<WorkerSlot>,
    /// One-shot permission to launch a data load task, given back once a launched task popped
    /// its resource.
    pub launch_allowed: bool,
    /// Main thread resources whose reload was requested elsewhere.
    pub deferred_unloads: Vec<ResourceHandle>,
}

pub(crate) struct ManagerShared {
    pub config: ResourceManagerConfig,
    pub scheduler: TaskScheduler,
    pub resources: DashMap<ResourceKey, ResourceHandle>,
    pub types: DashMap<String, Arc<ResourceTypeEntry>>,
    pub state: Mutex<ManagerState>,
    pub events: ResourceEvents,
}

impl ManagerShared {
    #[inline]
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("Resource Manager Lock")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Only the handle, nothing is loaded.
    PointerOnly,
    /// Queues the resource if needed and hands out the type's loading fallback until it is there.
    AllowLoadingFallback,
    /// Blocks until the resource is loaded or failed to load.
    BlockTillLoaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    /// The requested resource itself.
    Final,
    LoadingFallback,
    MissingFallback,
}

#[derive(Debug, Clone)]
pub struct AcquiredResource {
    pub resource: ResourceHandle,
    pub result: AcquireResult,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceManagerStats {
    pub resources: usize,
    pub queued: usize,
    pub data_load_tasks: usize,
    pub content_update_tasks: usize,
    pub busy_tasks: usize,
}

/// Owns every resource and streams their data in on the task scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ResourceManager {
    shared: Arc<ManagerShared>,
}

impl ResourceManager {
    pub fn new(scheduler: TaskScheduler, config: ResourceManagerConfig) -> Self {
        let queue = LoadingQueue::new(config.deadline_batch);
        Self {
            shared: Arc::new(ManagerShared {
                config,
                scheduler,
                resources: DashMap::with_capacity(256),
                types: DashMap::new(),
                state: Mutex::new(ManagerState {
                    queue,
                    data_loads: Vec::new(),
                    content_updates: Vec::new(),
                    launch_allowed: true,
                    deferred_unloads: Vec::new(),
                }),
                events: ResourceEvents::default(),
            }),
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.shared.scheduler
    }

    pub fn register_resource_type<T>(
        &self,
        type_name: &str,
        loader: Arc<dyn ResourceTypeLoader>,
        options: ResourceTypeOptions,
    ) where
        T: ResourceContent + Default,
    {
        let entry = ResourceTypeEntry {
            name: Arc::from(type_name),
            create: Box::new(|| -> Box<dyn ResourceContent> { Box::new(T::default()) }),
            loader,
            options,
            loading_fallback: ArcSwapOption::empty(),
            missing_fallback: ArcSwapOption::empty(),
        };

        if self
            .shared
            .types
            .insert(type_name.to_string(), Arc::new(entry))
            .is_some()
        {
            warn!("Resource type '{}' registered twice, the last registration wins", type_name);
        }
    }

    /// Served by [`AcquireMode::AllowLoadingFallback`] while a resource of the type is loading.
    pub fn set_loading_fallback(&self, type_name: &str, fallback: Option<ResourceHandle>) -> Result<(), ResourceError> {
        self.type_entry(type_name)?
            .loading_fallback
            .store(fallback.map(ResourceHandle::into_arc));
        Ok(())
    }

    /// Served by [`ResourceManager::acquire`] for resources of the type that failed to load.
    pub fn set_missing_fallback(&self, type_name: &str, fallback: Option<ResourceHandle>) -> Result<(), ResourceError> {
        self.type_entry(type_name)?
            .missing_fallback
            .store(fallback.map(ResourceHandle::into_arc));
        Ok(())
    }

    /// The resource of the given type and id, created on first use. Nothing is loaded yet.
    pub fn load_resource_by_type(&self, type_name: &str, id: &str) -> Result<ResourceHandle, ResourceError> {
        let key = ResourceKey::new(type_name, id);
        if let Some(resource) = self.shared.resources.get(&key) {
            return Ok(resource.clone());
        }

        let entry = self.type_entry(type_name)?;
        let mut created = false;
        let resource = self
            .shared
            .resources
            .entry(key)
            .or_insert_with(|| {
                created = true;
                ResourceHandle::new(Resource::new(
                    entry.name.clone(),
                    id.to_string(),
                    entry.options.initial_flags(),
                    entry.options.default_priority,
                    (entry.create)(),
                ))
            })
            .clone();

        if created {
            trace!("Created {}", *resource);
            self.shared
                .events
                .broadcast(ResourceEventKind::Created, &resource);
        }
        Ok(resource)
    }

    pub fn find_resource(&self, type_name: &str, id: &str) -> Option<ResourceHandle> {
        self.shared
            .resources
            .get(&ResourceKey::new(type_name, id))
            .map(|resource| resource.clone())
    }

    pub fn loading_state(&self, resource: &ResourceHandle) -> ResourceState {
        resource.loading_state()
    }

    /// Queues the resource for loading. `highest_priority` puts it in front of everything else.
    /// Loaded and failed resources are left alone, unless quality levels are left to load.
    pub fn preload_resource(&self, resource: &ResourceHandle, highest_priority: bool) {
        let now = Instant::now();
        let mut state = self.shared.lock_state();
        {
            let mut meta = resource.meta();
            match meta.state {
                ResourceState::Loaded if meta.quality_levels_loadable == 0 => return,
                failed if failed.is_failure() => return,
                ResourceState::Unloaded => meta.state = ResourceState::Loading,
                _ => {}
            }
        }

        state.queue.request_load(resource, highest_priority, now);
        self.shared.run_worker_task_locked(&mut state);
    }

    /// Blocks until the resource reached `target` or failed to load, and returns the state it
    /// ended up in. The calling thread helps with queued tasks in the meantime.
    pub fn ensure_resource_loading_state(&self, resource: &ResourceHandle, target: ResourceState) -> ResourceState {
        let current = std::thread::current().id();
        loop {
            let state = resource.loading_state();
            if state.reached(target) {
                return state;
            }

            if self.shared.scheduler.is_shut_down() {
                warn!("Gave up waiting for {}, the scheduler is shut down", **resource);
                return state;
            }

            if !resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING) {
                self.preload_resource(resource, true);
            }

            if let Some(group) = self.conflicting_update(resource, current) {
                if let Err(err) = self.shared.scheduler.wait_for_group(group) {
                    warn!("Waiting for a conflicting content update failed: {}", err);
                }
                continue;
            }

            let scheduler = &self.shared.scheduler;
            scheduler.wait_for_condition(|| {
                resource.loading_state().reached(target)
                    || !resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING)
                    || scheduler.is_shut_down()
            });
        }
    }

    /// A content update on another thread, working on another resource whose type must not see
    /// `resource` being acquired while it runs.
    fn conflicting_update(&self, resource: &ResourceHandle, current: std::thread::ThreadId) -> Option<TaskGroupId> {
        let state = self.shared.lock_state();
        state
            .content_updates
            .iter()
            .filter(|slot| !slot.is_idle())
            .find_map(|slot| {
                let assignment = slot.work.lock();
                let updating = assignment.resource.as_ref()?;
                if updating.ptr_eq(resource) || assignment.thread == Some(current) {
                    return None;
                }

                let allowed = self
                    .shared
                    .config
                    .acquire_policy
                    .may_acquire_during_update(updating.type_name(), resource.type_name());
                (!allowed).then_some(slot.group)
            })
    }

    pub fn acquire(&self, resource: &ResourceHandle, mode: AcquireMode) -> AcquiredResource {
        let now = Instant::now();
        resource.meta().last_acquire = Some(now);

        let result = match mode {
            AcquireMode::PointerOnly => AcquireResult::Final,
            AcquireMode::AllowLoadingFallback => {
                let state = resource.loading_state();
                if state == ResourceState::Loaded {
                    if self.shared.wants_more_quality(resource, now) {
                        self.preload_resource(resource, false);
                    }
                    AcquireResult::Final
                } else if state.is_failure() {
                    AcquireResult::MissingFallback
                } else {
                    self.preload_resource(resource, false);
                    AcquireResult::LoadingFallback
                }
            }
            AcquireMode::BlockTillLoaded => {
                if self
                    .ensure_resource_loading_state(resource, ResourceState::Loaded)
                    .is_failure()
                {
                    AcquireResult::MissingFallback
                } else {
                    AcquireResult::Final
                }
            }
        };

        let fallback = match result {
            AcquireResult::Final => None,
            AcquireResult::LoadingFallback => self.fallback_of(resource, |entry| &entry.loading_fallback),
            AcquireResult::MissingFallback => self.fallback_of(resource, |entry| &entry.missing_fallback),
        };

        match fallback {
            Some(fallback) => AcquiredResource {
                resource: fallback,
                result,
            },
            None => AcquiredResource {
                resource: resource.clone(),
                result: AcquireResult::Final,
            },
        }
    }

    fn fallback_of(
        &self,
        resource: &ResourceHandle,
        select: impl Fn(&ResourceTypeEntry) -> &ArcSwapOption<Resource>,
    ) -> Option<ResourceHandle> {
        let entry = self.shared.types.get(resource.type_name())?;
        select(&entry).load_full().map(ResourceHandle::from_arc)
    }

    /// Drops the loaded data so it is read again. Returns false if the reload was refused: the
    /// resource is not reloadable, prevents file reloads (unless forced), is claimed by a worker,
    /// has nothing loaded, or its data did not change (unless forced).
    pub fn reload_resource(&self, resource: &ResourceHandle, force: bool) -> bool {
        let flags = resource.flags();
        if !flags.contains(ResourceFlags::RELOADABLE) {
            return false;
        }

        if flags.contains(ResourceFlags::PREVENT_FILE_RELOAD) && !force {
            return false;
        }

        if let Some(refused) = self.reload_refusal(resource) {
            return refused;
        }

        if !force {
            let Some(loader) = self
                .shared
                .types
                .get(resource.type_name())
                .map(|entry| entry.loader.clone())
            else {
                return false;
            };

            if !loader.is_outdated(resource) {
                return false;
            }
        }

        let main_thread_only = flags.contains(ResourceFlags::UPDATE_ON_MAIN_THREAD);
        {
            // the loader ran without the lock, a load may have claimed the resource meanwhile
            let mut state = self.shared.lock_state();
            if let Some(refused) = Self::reload_refusal_locked(&state, resource) {
                return refused;
            }

            if main_thread_only && !self.shared.scheduler.is_main_thread() {
                if !state
                    .deferred_unloads
                    .iter()
                    .any(|deferred| deferred.ptr_eq(resource))
                {
                    state.deferred_unloads.push(resource.clone());
                }
                return true;
            }

            Self::claim_locked(resource);
        }

        let requeue = self
            .shared
            .acquired_recently(resource.last_acquire(), Instant::now())
            .then_some(false);
        self.unload_claimed(resource, requeue);
        true
    }

    fn reload_refusal(&self, resource: &ResourceHandle) -> Option<bool> {
        let state = self.shared.lock_state();
        Self::reload_refusal_locked(&state, resource)
    }

    /// `Some(result)` if a reload has to stop here. A still queued resource is left in the queue,
    /// the pending load reads the current data anyway.
    fn reload_refusal_locked(state: &ManagerState, resource: &ResourceHandle) -> Option<bool> {
        if resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING) {
            return Some(state.queue.contains(resource));
        }

        (resource.loading_state() <= ResourceState::Loading).then_some(false)
    }

    /// Flags the resource as queued without queueing it, so no load can claim it until
    /// [`ResourceManager::unload_claimed`] hands it back. Needs the manager lock.
    fn claim_locked(resource: &ResourceHandle) {
        resource
            .meta()
            .flags
            .insert(ResourceFlags::QUEUED_FOR_LOADING);
    }

    /// Unloads a resource claimed with [`ResourceManager::claim_locked`] and releases the claim.
    /// `requeue` queues it again, with the highest priority if `Some(true)`. A resource someone
    /// tried to load in the meantime is queued regardless.
    fn unload_claimed(&self, resource: &ResourceHandle, requeue: Option<bool>) {
        self.unload(resource);

        let mut state = self.shared.lock_state();
        let requested = resource.loading_state() == ResourceState::Loading;
        resource
            .meta()
            .flags
            .remove(ResourceFlags::QUEUED_FOR_LOADING);

        if requeue.is_none() && !requested {
            return;
        }

        resource.set_state(ResourceState::Loading);
        state
            .queue
            .request_load(resource, requeue.unwrap_or(false), Instant::now());
        self.shared.run_worker_task_locked(&mut state);
    }

    pub fn reload_resources_of_type(&self, type_name: &str, force: bool) -> usize {
        let resources = self
            .shared
            .resources
            .iter()
            .filter(|entry| entry.key().type_name == type_name)
            .map(|entry| entry.value().clone())
            .collect_vec();

        let reloaded = resources
            .iter()
            .filter(|resource| self.reload_resource(resource, force))
            .count();
        debug!("Reloaded {} of {} '{}' resources", reloaded, resources.len(), type_name);
        reloaded
    }

    pub fn reload_all_resources(&self, force: bool) -> usize {
        let resources = self
            .shared
            .resources
            .iter()
            .map(|entry| entry.value().clone())
            .collect_vec();

        resources
            .iter()
            .filter(|resource| self.reload_resource(resource, force))
            .count()
    }

    /// The next load of the resource reads through `loader`, once. The current data is dropped and
    /// the resource is queued with the highest priority.
    pub fn update_resource_with_custom_loader(&self, resource: &ResourceHandle, loader: Arc<dyn ResourceTypeLoader>) {
        loop {
            {
                let mut state = self.shared.lock_state();
                state.queue.remove(resource);

                // a running load would consume the loader or overwrite what it produces
                if !resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING) {
                    Self::claim_locked(resource);
                    let mut meta = resource.meta();
                    meta.custom_loader = Some(loader);
                    meta.flags.insert(ResourceFlags::HAS_CUSTOM_DATA_LOADER);
                    break;
                }
            }

            self.shared
                .scheduler
                .wait_for_condition(|| !resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING));
        }

        self.unload_claimed(resource, Some(true));
    }

    /// Removes resources nobody holds a handle to anymore. Queued, claimed and deferred resources
    /// are referenced from there, fallbacks from their type. Returns how many were removed.
    pub fn free_unused_resources(&self) -> usize {
        let candidates = self
            .shared
            .resources
            .iter()
            .filter(|entry| entry.value().reference_count() == 1)
            .map(|entry| entry.key().clone())
            .collect_vec();

        let mut freed = 0;
        for key in candidates {
            let Some((_, resource)) = self
                .shared
                .resources
                .remove_if(&key, |_, resource| resource.reference_count() == 1)
            else {
                continue;
            };

            if resource.loading_state() > ResourceState::Loading {
                self.unload(&resource);
            }
            self.shared
                .events
                .broadcast(ResourceEventKind::Deleted, &resource);
            freed += 1;
        }

        if freed > 0 {
            debug!("Freed {} unused resources", freed);
        }
        freed
    }

    /// Stops all loading, unloads every resource and empties the resource table. Returns how many
    /// resources were removed.
    pub fn unload_all_resources(&self) -> usize {
        loop {
            let busy = {
                let mut state = self.shared.lock_state();
                state.queue.clear();
                state.deferred_unloads.clear();
                state
                    .data_loads
                    .iter()
                    .chain(state.content_updates.iter())
                    .filter(|slot| !slot.is_idle())
                    .map(|slot| slot.task.clone())
                    .collect_vec()
            };

            if busy.is_empty() || self.shared.scheduler.is_shut_down() {
                break;
            }

            self.shared
                .scheduler
                .wait_for_condition(|| busy.iter().all(TaskHandle::is_finished));
        }

        for entry in self.shared.types.iter() {
            entry.loading_fallback.store(None);
            entry.missing_fallback.store(None);
        }

        let keys = self
            .shared
            .resources
            .iter()
            .map(|entry| entry.key().clone())
            .collect_vec();

        let mut removed = 0;
        for key in keys {
            let Some((_, resource)) = self.shared.resources.remove(&key) else {
                continue;
            };

            if resource.loading_state() > ResourceState::Loading {
                self.unload(&resource);
            } else {
                resource.set_state(ResourceState::Unloaded);
            }
            self.shared
                .events
                .broadcast(ResourceEventKind::Deleted, &resource);
            removed += 1;
        }

        info!("Unloaded all {} resources", removed);
        removed
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ResourceEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(Arc::new(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Call once per frame: deferred main thread unloads (when called from the main thread),
    /// loading deadlines and the data load launch.
    pub fn per_frame_update(&self) {
        if self.shared.scheduler.is_main_thread() {
            let deferred = {
                let mut state = self.shared.lock_state();
                std::mem::take(&mut state.deferred_unloads)
                    .into_iter()
                    .filter(|resource| {
                        // claimed or queued again since: that load reads the current data
                        let claimable = Self::reload_refusal_locked(&state, resource).is_none();
                        if claimable {
                            Self::claim_locked(resource);
                        }
                        claimable
                    })
                    .collect_vec()
            };

            let now = Instant::now();
            for resource in &deferred {
                let requeue = self
                    .shared
                    .acquired_recently(resource.last_acquire(), now)
                    .then_some(false);
                self.unload_claimed(resource, requeue);
            }
        }

        let mut state = self.shared.lock_state();
        state.queue.update_loading_deadlines(Instant::now());
        self.shared.run_worker_task_locked(&mut state);
    }

    pub fn stats(&self) -> ResourceManagerStats {
        let state = self.shared.lock_state();
        ResourceManagerStats {
            resources: self.shared.resources.len(),
            queued: state.queue.len(),
            data_load_tasks: state.data_loads.len(),
            content_update_tasks: state.content_updates.len(),
            busy_tasks: state
                .data_loads
                .iter()
                .chain(state.content_updates.iter())
                .filter(|slot| !slot.is_idle())
                .count(),
        }
    }

    fn type_entry(&self, type_name: &str) -> Result<Arc<ResourceTypeEntry>, ResourceError> {
        self.shared
            .types
            .get(type_name)
            .map(|entry| entry.clone())
            .ok_or_else(|| ResourceError::UnknownResourceType(type_name.to_string()))
    }

    fn unload(&self, resource: &ResourceHandle) {
        self.shared
            .events
            .broadcast(ResourceEventKind::ContentUnloading, resource);
        resource.unload_content();
        trace!("Unloaded {}", **resource);
    }
}
