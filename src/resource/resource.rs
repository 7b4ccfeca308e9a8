use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

use crate::resource::loader::{ResourceLoadData, ResourceTypeLoader};
use crate::resource::state::{ResourceFlags, ResourcePriority, ResourceState};

/// Seconds since the last acquire stop counting towards the loading priority from here on.
const MAX_ACQUIRE_AGE_PENALTY: f32 = 10.0;
const LOADED_PENALTY: f32 = 30.0;
const PRIORITY_CLASS_WEIGHT: f32 = 10.0;

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What a content update reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLoadDesc {
    pub state: ResourceState,
    /// Quality levels that could still be loaded on top of the current ones.
    pub quality_levels_loadable: u8,
    pub quality_levels_discardable: u8,
}

impl ContentLoadDesc {
    pub fn loaded() -> Self {
        Self {
            state: ResourceState::Loaded,
            quality_levels_loadable: 0,
            quality_levels_discardable: 0,
        }
    }

    pub fn partially_loaded(loadable: u8, discardable: u8) -> Self {
        Self {
            state: ResourceState::Loaded,
            quality_levels_loadable: loadable,
            quality_levels_discardable: discardable,
        }
    }
}

/// The type specific part of a resource.
pub trait ResourceContent: AsAny + Send {
    /// Turns freshly loaded data into content. Called once per loaded quality level.
    fn update_content(&mut self, data: &ResourceLoadData) -> anyhow::Result<ContentLoadDesc>;

    /// Drops everything that was loaded, the resource goes back to unloaded afterwards.
    fn unload_data(&mut self);

    fn memory_usage(&self) -> usize {
        0
    }
}

pub(crate) struct ResourceMeta {
    pub state: ResourceState,
    pub flags: ResourceFlags,
    pub priority: ResourcePriority,
    pub due_date: Option<Instant>,
    pub quality_levels_loadable: u8,
    pub quality_levels_discardable: u8,
    pub memory_usage: usize,
    pub last_acquire: Option<Instant>,
    pub priority_score: f32,
    pub loaded_modification: Option<SystemTime>,
    pub custom_loader: Option<Arc<dyn ResourceTypeLoader>>,
}

pub struct Resource {
    type_name: Arc<str>,
    id: String,
    meta: Mutex<ResourceMeta>,
    content: Mutex<Box<dyn ResourceContent>>,
}

impl Resource {
    pub(crate) fn new(
        type_name: Arc<str>,
        id: String,
        flags: ResourceFlags,
        priority: ResourcePriority,
        content: Box<dyn ResourceContent>,
    ) -> Self {
        Self {
            type_name,
            id,
            meta: Mutex::new(ResourceMeta {
                state: ResourceState::Unloaded,
                flags,
                priority,
                due_date: None,
                quality_levels_loadable: 0,
                quality_levels_discardable: 0,
                memory_usage: 0,
                last_acquire: None,
                priority_score: 0.0,
                loaded_modification: None,
                custom_loader: None,
            }),
            content: Mutex::new(content),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn loading_state(&self) -> ResourceState {
        self.meta().state
    }

    pub fn flags(&self) -> ResourceFlags {
        self.meta().flags
    }

    pub fn priority(&self) -> ResourcePriority {
        self.meta().priority
    }

    pub fn set_priority(&self, priority: ResourcePriority) {
        self.meta().priority = priority;
    }

    /// Past the due date the resource loads as if it was critical.
    pub fn set_due_date(&self, due_date: Option<Instant>) {
        self.meta().due_date = due_date;
    }

    pub fn quality_levels(&self) -> (u8, u8) {
        let meta = self.meta();
        (meta.quality_levels_discardable, meta.quality_levels_loadable)
    }

    pub fn memory_usage(&self) -> usize {
        self.meta().memory_usage
    }

    pub fn last_acquire(&self) -> Option<Instant> {
        self.meta().last_acquire
    }

    /// The score the resource was queued with, lower loads first.
    pub fn priority_score(&self) -> f32 {
        self.meta().priority_score
    }

    /// Modification time of the data the current content was made from.
    pub fn loaded_modification(&self) -> Option<SystemTime> {
        self.meta().loaded_modification
    }

    /// The current loading priority, lower is more urgent.
    pub fn loading_priority(&self, now: Instant) -> f32 {
        let meta = self.meta();
        if meta.priority == ResourcePriority::Critical || meta.due_date.is_some_and(|due| due <= now) {
            return 0.0;
        }

        let mut priority = meta.priority as u8 as f32 * PRIORITY_CLASS_WEIGHT;
        if meta.state == ResourceState::Loaded {
            priority += LOADED_PENALTY;
        }

        let acquire_age = meta
            .last_acquire
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .unwrap_or(MAX_ACQUIRE_AGE_PENALTY);
        priority + acquire_age.min(MAX_ACQUIRE_AGE_PENALTY)
    }

    /// Runs `f` on the content, if it is a `T`.
    pub fn with_content<T, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: ResourceContent,
    {
        let content = self.content();
        content.as_ref().as_any().downcast_ref::<T>().map(f)
    }

    pub fn with_content_mut<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: ResourceContent,
    {
        let mut content = self.content();
        content.as_mut().as_any_mut().downcast_mut::<T>().map(f)
    }

    #[inline]
    pub(crate) fn meta(&self) -> MutexGuard<'_, ResourceMeta> {
        self.meta.lock().expect("Resource meta lock")
    }

    /// A content update that panicked leaves the lock poisoned. The content is reset by
    /// unloading it, so the guard is taken over instead of propagating the panic.
    #[inline]
    fn content(&self) -> MutexGuard<'_, Box<dyn ResourceContent>> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ResourceState) {
        self.meta().state = state;
    }

    pub fn is_flagged(&self, flags: ResourceFlags) -> bool {
        self.meta().flags.contains(flags)
    }

    /// Feeds loaded data into the content. On success the reported state and quality levels are
    /// recorded, a failed update is left for the caller to record.
    pub(crate) fn update_content(&self, data: &ResourceLoadData) -> ResourceState {
        let (result, memory_usage) = {
            let mut content = self.content();
            let result = content.update_content(data);
            (result, content.memory_usage())
        };

        match result {
            Ok(desc) => {
                let mut meta = self.meta();
                meta.state = desc.state;
                meta.quality_levels_loadable = desc.quality_levels_loadable;
                meta.quality_levels_discardable = desc.quality_levels_discardable;
                meta.loaded_modification = data.modified;
                meta.memory_usage = memory_usage;
                desc.state
            }
            Err(err) => {
                log::error!("Content update of {} failed: {:#}", self, err);
                ResourceState::TransformError
            }
        }
    }

    pub(crate) fn unload_content(&self) {
        self.content().unload_data();

        let mut meta = self.meta();
        meta.state = ResourceState::Unloaded;
        meta.quality_levels_loadable = 0;
        meta.quality_levels_discardable = 0;
        meta.memory_usage = 0;
        meta.loaded_modification = None;
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.type_name, self.id)
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta();
        f.debug_struct("Resource")
            .field("type_name", &self.type_name)
            .field("id", &self.id)
            .field("state", &meta.state)
            .field("flags", &meta.flags)
            .field("priority", &meta.priority)
            .finish()
    }
}

/// Shared reference to a resource, owned by the manager's resource table and everyone using it.
#[derive(Clone)]
pub struct ResourceHandle {
    inner: Arc<Resource>,
}

impl ResourceHandle {
    pub(crate) fn new(resource: Resource) -> Self {
        Self {
            inner: Arc::new(resource),
        }
    }

    #[inline]
    pub fn ptr_eq(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Handles to the resource, including the manager's own.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn into_arc(self) -> Arc<Resource> {
        self.inner
    }

    pub(crate) fn from_arc(inner: Arc<Resource>) -> Self {
        Self { inner }
    }
}

impl Deref for ResourceHandle {
    type Target = Resource;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Debug for ResourceHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&*self.inner, f)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{ContentLoadDesc, Resource, ResourceContent};
    use crate::resource::loader::ResourceLoadData;
    use crate::resource::state::{ResourceFlags, ResourcePriority, ResourceState};

    #[derive(Default)]
    struct Blob(Vec<u8>);

    impl ResourceContent for Blob {
        fn update_content(&mut self, data: &ResourceLoadData) -> anyhow::Result<ContentLoadDesc> {
            self.0 = data.bytes.clone();
            Ok(ContentLoadDesc::loaded())
        }

        fn unload_data(&mut self) {
            self.0.clear();
        }
    }

    fn resource(priority: ResourcePriority) -> Resource {
        Resource::new(
            Arc::from("Blob"),
            "blob".to_string(),
            ResourceFlags::RELOADABLE,
            priority,
            Box::new(Blob::default()),
        )
    }

    #[test]
    fn critical_and_overdue_resources_load_first() {
        let now = Instant::now();
        assert_eq!(resource(ResourcePriority::Critical).loading_priority(now), 0.0);

        let overdue = resource(ResourcePriority::VeryLow);
        overdue.set_due_date(Some(now - Duration::from_secs(1)));
        assert_eq!(overdue.loading_priority(now), 0.0);
    }

    #[test]
    fn loaded_and_stale_resources_wait_longer() {
        let now = Instant::now();
        let fresh = resource(ResourcePriority::High);
        fresh.meta().last_acquire = Some(now);
        assert_eq!(fresh.loading_priority(now), 20.0);

        let never_acquired = resource(ResourcePriority::High);
        assert_eq!(never_acquired.loading_priority(now), 30.0);

        let loaded = resource(ResourcePriority::High);
        loaded.meta().last_acquire = Some(now);
        loaded.set_state(ResourceState::Loaded);
        assert_eq!(loaded.loading_priority(now), 50.0);
    }

    #[test]
    fn content_is_reachable_by_its_type() {
        let resource = resource(ResourcePriority::Medium);
        let state = resource.update_content(&ResourceLoadData {
            bytes: vec![1, 2, 3],
            modified: None,
        });
        assert_eq!(state, ResourceState::Loaded);
        assert_eq!(resource.with_content(|blob: &Blob| blob.0.len()), Some(3));

        resource.unload_content();
        assert_eq!(resource.loading_state(), ResourceState::Unloaded);
        assert_eq!(resource.with_content(|blob: &Blob| blob.0.len()), Some(0));
    }
}
