use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;

use crate::resource::resource::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceEventKind {
    Created,
    /// New content (or a new quality level) is in place.
    ContentUpdated,
    /// The load ended in one of the failure states.
    LoadingFailed,
    /// Sent before the content is unloaded.
    ContentUnloading,
    /// The resource left the resource table.
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub kind: ResourceEventKind,
    pub resource: ResourceHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ResourceEvent) + Send + Sync>;

/// Listeners are called on whatever thread caused the event, never under the manager lock nor
/// the listener list's own, so they may subscribe and unsubscribe.
#[derive(Default)]
pub(crate) struct ResourceEvents {
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl ResourceEvents {
    pub fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .expect("Listener Write Lock")
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().expect("Listener Write Lock");
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Listener> {
        self.listeners
            .read()
            .expect("Listener Read Lock")
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect_vec()
    }

    pub fn broadcast(&self, kind: ResourceEventKind, resource: &ResourceHandle) {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return;
        }

        let event = ResourceEvent {
            kind,
            resource: resource.clone(),
        };

        for listener in &listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{ResourceEvent, ResourceEventKind, ResourceEvents, SubscriptionId};
    use crate::resource::loader::ResourceLoadData;
    use crate::resource::resource::{ContentLoadDesc, Resource, ResourceContent, ResourceHandle};
    use crate::resource::state::{ResourceFlags, ResourcePriority};

    #[derive(Default)]
    struct Empty;

    impl ResourceContent for Empty {
        fn update_content(&mut self, _data: &ResourceLoadData) -> anyhow::Result<ContentLoadDesc> {
            Ok(ContentLoadDesc::loaded())
        }

        fn unload_data(&mut self) {}
    }

    #[test]
    fn listeners_may_unsubscribe_themselves() {
        let events = Arc::new(ResourceEvents::default());
        let calls = Arc::new(AtomicU32::new(0));
        let own_id = Arc::new(Mutex::new(None::<SubscriptionId>));

        let listener_events = events.clone();
        let listener_calls = calls.clone();
        let listener_id = own_id.clone();
        let id = events.subscribe(Arc::new(move |_: &ResourceEvent| {
            listener_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = listener_id.lock().expect("id").take() {
                assert!(listener_events.unsubscribe(id));
            }
        }));
        *own_id.lock().expect("id") = Some(id);

        let resource = ResourceHandle::new(Resource::new(
            Arc::from("Empty"),
            "empty".to_string(),
            ResourceFlags::empty(),
            ResourcePriority::Medium,
            Box::new(Empty),
        ));
        events.broadcast(ResourceEventKind::Created, &resource);
        events.broadcast(ResourceEventKind::Deleted, &resource);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
