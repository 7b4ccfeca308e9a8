//! This module contains the resource manager: the table of every resource the engine knows about
//! and the pipeline that streams their data in, on top of the task scheduler.
//!
//! A resource is identified by its type name and an id (typically a path relative to the data
//! directory). Referencing it through [`ResourceManager::load_resource_by_type`] creates it in the
//! `Unloaded` state, but does not load anything. Loading is requested through
//! [`ResourceManager::preload_resource`] or [`ResourceManager::acquire`], which put the resource
//! into the loading queue.
//!
//! The loading queue is only roughly sorted: every frame, [`ResourceManager::per_frame_update`]
//! re-scores a batch of entries and runs a single reverse bubble sort pass over it, so urgent
//! entries travel to the front over a couple of frames while queueing itself stays O(1). The
//! score blends the resource's priority class, whether it is loaded already (additional quality
//! levels are less urgent than a first version), and how long ago it was acquired. Critical or
//! overdue resources always score zero.
//!
//! Loading happens in two steps, both as pooled tasks on the scheduler:
//! - A data load task (file access tier) pops the front of the queue and reads the data through
//!   the type's [`ResourceTypeLoader`] (or a one-shot custom loader). Popping the resource is its
//!   claim: the resource stays flagged as queued while it is out of the queue, and nothing else
//!   touches it until the load is done. Only a bounded number of data load tasks exist. Launching
//!   one is guarded by a one-shot permission that the launched task gives back once it popped its
//!   resource, which is also when it launches the next one if the queue is not empty yet.
//! - A content update task (long running tier, or this-frame main thread tier for types that
//!   have to update on the main thread) hands the data to [`ResourceContent::update_content`] and
//!   records the outcome, releasing the claim. A resource that still has quality levels to load
//!   and was recently acquired goes right back into the queue.
//!
//! Missing data, data that needs an import and content updates that fail are states, not errors:
//! [`ResourceManager::acquire`] serves the type's missing fallback for them.
//!
//! Synchronous call sites use [`ResourceManager::ensure_resource_loading_state`]. It waits on
//! the scheduler, so the blocked thread helps with queued work, but it first waits for content
//! updates of other types that the [`AcquireDuringUpdatePolicy`] does not allow it to overlap
//! with.
//!
//! Note: The manager lock guards the loading queue, the queued flag and the worker slots. It is
//! always taken before a resource's own locks and before the scheduler's, and nothing waits while
//! holding it. Listeners of [`ResourceEvent`]s are called without it.
//!
pub mod events;
pub mod loader;
pub mod loading_queue;
pub mod manager;
pub mod policy;
#[allow(clippy::module_inception)]
pub mod resource;
pub mod state;
mod worker_tasks;

pub use events::{ResourceEvent, ResourceEventKind, SubscriptionId};
pub use loader::{FileResourceLoader, LoadOutcome, ResourceLoadData, ResourceTypeLoader};
pub use loading_queue::reverse_bubble_sort_step;
pub use manager::{
    AcquireMode, AcquireResult, AcquiredResource, ResourceError, ResourceManager, ResourceManagerConfig,
    ResourceManagerStats, ResourceTypeOptions,
};
pub use policy::{AcquireAllowList, AcquireDuringUpdatePolicy, AlwaysAllowAcquire};
pub use resource::{ContentLoadDesc, Resource, ResourceContent, ResourceHandle};
pub use state::{ResourceFlags, ResourcePriority, ResourceState};
