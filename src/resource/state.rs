use bitflags::bitflags;

/// Where a resource is in its lifecycle. The order matters: `state >= target` is how callers
/// check whether a resource got far enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceState {
    Invalid,
    Unloaded,
    Loading,
    /// The loader found nothing to load. Not an error, the type's missing fallback is used.
    LoadedResourceMissing,
    /// The data was there, but turning it into content failed.
    TransformError,
    /// The data only exists in a source format that has to be imported first.
    NeedsImport,
    Loaded,
}

impl ResourceState {
    /// States a load ends in without producing content. They are never left automatically.
    #[inline]
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ResourceState::LoadedResourceMissing | ResourceState::TransformError | ResourceState::NeedsImport
        )
    }

    /// Whether waiting for `target` is pointless from here on.
    #[inline]
    pub fn reached(self, target: ResourceState) -> bool {
        self >= target || self.is_failure()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResourceFlags: u16 {
        /// In the loading queue or claimed by a worker.
        const QUEUED_FOR_LOADING = 1;
        const RELOADABLE = 1 << 1;
        /// Only forced reloads touch it.
        const PREVENT_FILE_RELOAD = 1 << 2;
        /// The next load reads through a one-shot custom loader.
        const HAS_CUSTOM_DATA_LOADER = 1 << 3;
        /// Content updates have to run on the main thread.
        const UPDATE_ON_MAIN_THREAD = 1 << 4;
        /// A low resolution version is embedded and loaded first.
        const HAS_LOW_RES_DATA = 1 << 5;
    }
}

/// How urgently a resource wants to be loaded. `Critical` always jumps the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ResourcePriority {
    Critical = 0,
    VeryHigh,
    High,
    #[default]
    Medium,
    Low,
    VeryLow,
}

#[cfg(test)]
mod tests {
    use super::ResourceState;

    #[test]
    fn failures_end_the_wait() {
        assert!(ResourceState::LoadedResourceMissing.reached(ResourceState::Loaded));
        assert!(ResourceState::NeedsImport.reached(ResourceState::Loaded));
        assert!(ResourceState::Loaded.reached(ResourceState::Loading));
        assert!(!ResourceState::Loading.reached(ResourceState::Loaded));
        assert!(!ResourceState::Unloaded.reached(ResourceState::Loading));
    }
}
