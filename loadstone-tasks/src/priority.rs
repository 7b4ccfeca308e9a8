/// The queue tier a task group is scheduled into. Tiers are ordered: a worker always drains the
/// lowest tier it is allowed to run before looking at the next one.
///
/// The frame tiers (`EarlyThisFrame` up to `In9Frames`) move one frame closer to "this frame"
/// whenever [`crate::TaskScheduler::finish_frame_tasks`] is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TaskPriority {
    EarlyThisFrame = 0,
    ThisFrame,
    LateThisFrame,
    EarlyNextFrame,
    NextFrame,
    LateNextFrame,
    In2Frames,
    In3Frames,
    In4Frames,
    In5Frames,
    In6Frames,
    In7Frames,
    In8Frames,
    In9Frames,
    LongRunningHighPriority,
    LongRunning,
    FileAccessHighPriority,
    FileAccess,
    /// Has to be finished before the frame ends, but may only run on the main thread.
    ThisFrameMainThread,
    /// Background work for the main thread, drained by
    /// [`crate::TaskScheduler::execute_some_frame_tasks`].
    SomeFrameMainThread,
}

impl TaskPriority {
    pub const COUNT: usize = TaskPriority::SomeFrameMainThread as usize + 1;

    pub const ALL: [TaskPriority; TaskPriority::COUNT] = [
        TaskPriority::EarlyThisFrame,
        TaskPriority::ThisFrame,
        TaskPriority::LateThisFrame,
        TaskPriority::EarlyNextFrame,
        TaskPriority::NextFrame,
        TaskPriority::LateNextFrame,
        TaskPriority::In2Frames,
        TaskPriority::In3Frames,
        TaskPriority::In4Frames,
        TaskPriority::In5Frames,
        TaskPriority::In6Frames,
        TaskPriority::In7Frames,
        TaskPriority::In8Frames,
        TaskPriority::In9Frames,
        TaskPriority::LongRunningHighPriority,
        TaskPriority::LongRunning,
        TaskPriority::FileAccessHighPriority,
        TaskPriority::FileAccess,
        TaskPriority::ThisFrameMainThread,
        TaskPriority::SomeFrameMainThread,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index]
    }

    /// Tiers that have to be empty (and not in flight) once the frame is finished.
    #[inline]
    pub fn is_this_frame(self) -> bool {
        matches!(
            self,
            TaskPriority::EarlyThisFrame
                | TaskPriority::ThisFrame
                | TaskPriority::LateThisFrame
                | TaskPriority::ThisFrameMainThread
        )
    }

    #[inline]
    pub fn is_main_thread_only(self) -> bool {
        matches!(
            self,
            TaskPriority::ThisFrameMainThread | TaskPriority::SomeFrameMainThread
        )
    }

    /// Where the content of this tier ends up after a frame boundary. `None` for tiers that are
    /// not bound to frames.
    pub fn next_frame_target(self) -> Option<TaskPriority> {
        use TaskPriority::*;
        let target = match self {
            EarlyThisFrame | ThisFrame | LateThisFrame => EarlyThisFrame,
            EarlyNextFrame => EarlyThisFrame,
            NextFrame => ThisFrame,
            LateNextFrame => LateThisFrame,
            In2Frames => NextFrame,
            In3Frames => In2Frames,
            In4Frames => In3Frames,
            In5Frames => In4Frames,
            In6Frames => In5Frames,
            In7Frames => In6Frames,
            In8Frames => In7Frames,
            In9Frames => In8Frames,
            _ => return None,
        };
        Some(target)
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskPriority::EarlyThisFrame => "EarlyThisFrame",
            TaskPriority::ThisFrame => "ThisFrame",
            TaskPriority::LateThisFrame => "LateThisFrame",
            TaskPriority::EarlyNextFrame => "EarlyNextFrame",
            TaskPriority::NextFrame => "NextFrame",
            TaskPriority::LateNextFrame => "LateNextFrame",
            TaskPriority::In2Frames => "In2Frames",
            TaskPriority::In3Frames => "In3Frames",
            TaskPriority::In4Frames => "In4Frames",
            TaskPriority::In5Frames => "In5Frames",
            TaskPriority::In6Frames => "In6Frames",
            TaskPriority::In7Frames => "In7Frames",
            TaskPriority::In8Frames => "In8Frames",
            TaskPriority::In9Frames => "In9Frames",
            TaskPriority::LongRunningHighPriority => "LongRunningHighPriority",
            TaskPriority::LongRunning => "LongRunning",
            TaskPriority::FileAccessHighPriority => "FileAccessHighPriority",
            TaskPriority::FileAccess => "FileAccess",
            TaskPriority::ThisFrameMainThread => "ThisFrameMainThread",
            TaskPriority::SomeFrameMainThread => "SomeFrameMainThread",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The class of a thread, deciding which tiers it drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerThreadType {
    ShortTasks,
    LongTasks,
    FileAccess,
    /// The thread that started the scheduler. It has no pool, it helps while blocked and drains
    /// its own tiers in the frame hooks.
    MainThread,
}

impl WorkerThreadType {
    /// Types that own a pool of OS threads.
    pub const POOLED: [WorkerThreadType; 3] = [
        WorkerThreadType::ShortTasks,
        WorkerThreadType::LongTasks,
        WorkerThreadType::FileAccess,
    ];

    pub(crate) fn pool_index(self) -> Option<usize> {
        match self {
            WorkerThreadType::ShortTasks => Some(0),
            WorkerThreadType::LongTasks => Some(1),
            WorkerThreadType::FileAccess => Some(2),
            WorkerThreadType::MainThread => None,
        }
    }

    /// The tier spans (inclusive) a dedicated worker of this type pulls from, in order.
    pub(crate) fn worker_tiers(self) -> &'static [(TaskPriority, TaskPriority)] {
        static SHORT: [(TaskPriority, TaskPriority); 1] = [(TaskPriority::EarlyThisFrame, TaskPriority::In9Frames)];
        static LONG: [(TaskPriority, TaskPriority); 1] =
            [(TaskPriority::LongRunningHighPriority, TaskPriority::LongRunning)];
        static FILE: [(TaskPriority, TaskPriority); 1] =
            [(TaskPriority::FileAccessHighPriority, TaskPriority::FileAccess)];
        static MAIN: [(TaskPriority, TaskPriority); 2] = [
            (TaskPriority::ThisFrameMainThread, TaskPriority::ThisFrameMainThread),
            (TaskPriority::EarlyThisFrame, TaskPriority::In9Frames),
        ];

        match self {
            WorkerThreadType::ShortTasks => &SHORT,
            WorkerThreadType::LongTasks => &LONG,
            WorkerThreadType::FileAccess => &FILE,
            WorkerThreadType::MainThread => &MAIN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WorkerThreadType::ShortTasks => "ShortTasks",
            WorkerThreadType::LongTasks => "LongTasks",
            WorkerThreadType::FileAccess => "FileAccess",
            WorkerThreadType::MainThread => "MainThread",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskPriority;

    #[test]
    fn all_is_in_index_order() {
        for (index, priority) in TaskPriority::ALL.iter().enumerate() {
            assert_eq!(priority.index(), index);
            assert_eq!(TaskPriority::from_index(index), *priority);
        }
    }

    #[test]
    fn frame_tiers_move_exactly_one_frame() {
        assert_eq!(
            TaskPriority::LateThisFrame.next_frame_target(),
            Some(TaskPriority::EarlyThisFrame)
        );
        assert_eq!(
            TaskPriority::NextFrame.next_frame_target(),
            Some(TaskPriority::ThisFrame)
        );
        assert_eq!(
            TaskPriority::In2Frames.next_frame_target(),
            Some(TaskPriority::NextFrame)
        );
        assert_eq!(
            TaskPriority::In9Frames.next_frame_target(),
            Some(TaskPriority::In8Frames)
        );
        assert_eq!(TaskPriority::FileAccess.next_frame_target(), None);
        assert_eq!(TaskPriority::SomeFrameMainThread.next_frame_target(), None);
    }
}
