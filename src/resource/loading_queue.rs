use std::cmp::Ordering;
use std::collections::VecDeque;
use std::time::Instant;

use log::trace;

use crate::resource::resource::ResourceHandle;
use crate::resource::state::ResourceFlags;

pub(crate) struct LoadingQueueEntry {
    pub resource: ResourceHandle,
    pub priority: f32,
}

impl PartialEq for LoadingQueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl PartialOrd for LoadingQueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.priority.partial_cmp(&other.priority)
    }
}

/// Resources waiting for a data load, roughly ordered by their loading priority. The order is
/// refined a little every frame by [`LoadingQueue::update_loading_deadlines`] instead of being
/// kept sorted, so queueing stays cheap.
///
/// Lives under the manager lock. A resource is in here at most once, and only while it is
/// flagged [`ResourceFlags::QUEUED_FOR_LOADING`].
pub(crate) struct LoadingQueue {
    entries: VecDeque<LoadingQueueEntry>,
    deadline_cursor: usize,
    deadline_batch: usize,
}

impl LoadingQueue {
    pub fn new(deadline_batch: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            deadline_cursor: 0,
            deadline_batch: deadline_batch.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, resource: &ResourceHandle) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.resource.ptr_eq(resource))
    }

    pub fn contains(&self, resource: &ResourceHandle) -> bool {
        self.position(resource).is_some()
    }

    /// Queues the resource unless it already is. `highest_priority` moves it to the front either
    /// way. Returns false if the resource was queued already.
    pub fn request_load(&mut self, resource: &ResourceHandle, highest_priority: bool, now: Instant) -> bool {
        let mut meta = resource.meta();
        if meta.flags.contains(ResourceFlags::QUEUED_FOR_LOADING) {
            drop(meta);
            if highest_priority {
                if let Some(entry) = self.position(resource).and_then(|index| self.entries.remove(index)) {
                    self.entries.push_front(entry);
                }
            }
            return false;
        }

        meta.flags.insert(ResourceFlags::QUEUED_FOR_LOADING);
        drop(meta);

        let priority = if highest_priority {
            0.0
        } else {
            resource.loading_priority(now)
        };
        resource.meta().priority_score = priority;

        let entry = LoadingQueueEntry {
            resource: resource.clone(),
            priority,
        };

        if highest_priority {
            self.entries.push_front(entry);
        } else {
            self.entries.push_back(entry);
        }

        trace!("Queued {} for loading with priority {}", **resource, priority);
        true
    }

    /// Takes the next resource to load. It stays flagged as queued: the caller owns its load now.
    pub fn pop_front(&mut self) -> Option<ResourceHandle> {
        self.entries.pop_front().map(|entry| entry.resource)
    }

    /// Drops the entry and the queued flag.
    pub fn remove(&mut self, resource: &ResourceHandle) -> bool {
        let Some(entry) = self.position(resource).and_then(|index| self.entries.remove(index)) else {
            return false;
        };

        entry
            .resource
            .meta()
            .flags
            .remove(ResourceFlags::QUEUED_FOR_LOADING);
        true
    }

    /// Drops every entry and its queued flag.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry
                .resource
                .meta()
                .flags
                .remove(ResourceFlags::QUEUED_FOR_LOADING);
        }
        self.deadline_cursor = 0;
        count
    }

    /// Re-scores the next batch of entries (wrapping around) and moves the most urgent ones a
    /// step closer to the front.
    pub fn update_loading_deadlines(&mut self, now: Instant) {
        if self.entries.is_empty() {
            self.deadline_cursor = 0;
            return;
        }

        for _ in 0..self.deadline_batch.min(self.entries.len()) {
            if self.deadline_cursor >= self.entries.len() {
                self.deadline_cursor = 0;
            }

            let entry = &mut self.entries[self.deadline_cursor];
            entry.priority = entry.resource.loading_priority(now);
            entry.resource.meta().priority_score = entry.priority;
            self.deadline_cursor += 1;
        }

        reverse_bubble_sort_step(&mut self.entries);
    }
}

/// One bubble sort pass from the back to the front: the smallest element ends up first, every
/// other element moves at most one step. N passes sort N elements.
pub fn reverse_bubble_sort_step<T: PartialOrd>(items: &mut VecDeque<T>) {
    for index in (1..items.len()).rev() {
        if items[index] < items[index - 1] {
            items.swap(index, index - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Instant;

    use itertools::Itertools;

    use super::{LoadingQueue, reverse_bubble_sort_step};
    use crate::resource::loader::ResourceLoadData;
    use crate::resource::resource::{ContentLoadDesc, Resource, ResourceContent, ResourceHandle};
    use crate::resource::state::{ResourceFlags, ResourcePriority};

    struct Nothing;

    impl ResourceContent for Nothing {
        fn update_content(&mut self, _data: &ResourceLoadData) -> anyhow::Result<ContentLoadDesc> {
            Ok(ContentLoadDesc::loaded())
        }

        fn unload_data(&mut self) {}
    }

    fn resource(id: &str, priority: ResourcePriority) -> ResourceHandle {
        ResourceHandle::new(Resource::new(
            Arc::from("Nothing"),
            id.to_string(),
            ResourceFlags::empty(),
            priority,
            Box::new(Nothing),
        ))
    }

    #[test]
    fn n_steps_sort_n_elements() {
        let inputs = [
            vec![5, 4, 3, 2, 1],
            vec![1, 2, 3, 4, 5],
            vec![3, 1, 4, 1, 5, 9, 2, 6],
            vec![7],
            vec![],
        ];

        for input in inputs {
            let mut items = input.iter().copied().collect::<VecDeque<_>>();
            for _ in 0..items.len() {
                reverse_bubble_sort_step(&mut items);
            }
            let expected = input.iter().copied().sorted().collect_vec();
            assert_eq!(items.into_iter().collect_vec(), expected);
        }
    }

    #[test]
    fn one_step_brings_the_minimum_to_the_front() {
        let mut items = VecDeque::from(vec![4.0, 3.0, 8.0, 0.5, 2.0]);
        reverse_bubble_sort_step(&mut items);
        assert_eq!(items[0], 0.5);
    }

    #[test]
    fn highest_priority_request_moves_the_entry_to_the_front() {
        let now = Instant::now();
        let mut queue = LoadingQueue::new(50);
        let first = resource("first", ResourcePriority::High);
        let second = resource("second", ResourcePriority::Low);

        assert!(queue.request_load(&first, false, now));
        assert!(queue.request_load(&second, false, now));
        assert!(!queue.request_load(&second, true, now));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.position(&second), Some(0));
        assert!(second.is_flagged(ResourceFlags::QUEUED_FOR_LOADING));
    }

    #[test]
    fn deadlines_reorder_the_queue() {
        let now = Instant::now();
        let mut queue = LoadingQueue::new(50);
        let low = resource("low", ResourcePriority::VeryLow);
        let urgent = resource("urgent", ResourcePriority::High);
        queue.request_load(&low, false, now);
        queue.request_load(&urgent, false, now);
        assert_eq!(queue.position(&urgent), Some(1));

        urgent.set_priority(ResourcePriority::Critical);
        queue.update_loading_deadlines(now);
        assert_eq!(queue.position(&urgent), Some(0));
        assert_eq!(urgent.priority_score(), 0.0);
    }

    #[test]
    fn removing_clears_the_queued_flag() {
        let now = Instant::now();
        let mut queue = LoadingQueue::new(50);
        let resource = resource("gone", ResourcePriority::Medium);
        queue.request_load(&resource, false, now);

        assert!(queue.remove(&resource));
        assert!(!resource.is_flagged(ResourceFlags::QUEUED_FOR_LOADING));
        assert!(queue.is_empty());
        assert!(!queue.remove(&resource));
    }
}
