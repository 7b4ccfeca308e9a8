use std::collections::HashSet;

/// Decides whether a resource of one type may be acquired while a content update of another type
/// is running on some other thread. When it may not, the acquiring thread first waits for that
/// update to finish.
pub trait AcquireDuringUpdatePolicy: Send + Sync {
    fn may_acquire_during_update(&self, updating_type: &str, acquired_type: &str) -> bool;
}

/// Explicit pairs of (updating type, acquired type) that do not interfere. Anything not listed
/// waits.
#[derive(Debug, Default, Clone)]
pub struct AcquireAllowList {
    allowed: HashSet<(String, String)>,
}

impl AcquireAllowList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, updating_type: impl Into<String>, acquired_type: impl Into<String>) -> Self {
        self.allowed
            .insert((updating_type.into(), acquired_type.into()));
        self
    }
}

impl AcquireDuringUpdatePolicy for AcquireAllowList {
    fn may_acquire_during_update(&self, updating_type: &str, acquired_type: &str) -> bool {
        self.allowed
            .contains(&(updating_type.to_string(), acquired_type.to_string()))
    }
}

/// Content updates never interfere with each other.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAllowAcquire;

impl AcquireDuringUpdatePolicy for AlwaysAllowAcquire {
    fn may_acquire_during_update(&self, _updating_type: &str, _acquired_type: &str) -> bool {
        true
    }
}
