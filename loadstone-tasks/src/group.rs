use std::fmt::{Display, Formatter};

use crate::priority::TaskPriority;
use crate::task::TaskHandle;

/// Handle to a task group: a slot in the scheduler's group arena plus the generation the slot had
/// when the group was created. The generation moves on when the group finishes, so a handle that
/// outlived its group is recognized as finished instead of aliasing whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskGroupId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl TaskGroupId {
    pub const INVALID: TaskGroupId = TaskGroupId {
        index: u32::MAX,
        generation: 0,
    };

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.index != u32::MAX
    }
}

impl Default for TaskGroupId {
    fn default() -> Self {
        TaskGroupId::INVALID
    }
}

impl Display for TaskGroupId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "TaskGroup#{}@{}", self.index, self.generation)
        } else {
            f.write_str("TaskGroup#invalid")
        }
    }
}

pub type GroupFinishedFn = Box<dyn FnOnce(TaskGroupId) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupPhase {
    Free,
    /// Created, tasks and dependencies may still be added.
    Unscheduled,
    WaitingForDependencies,
    Scheduled,
    /// All tasks are done, the callback and the dependents are being processed.
    Finishing,
}

pub(crate) struct GroupSlot {
    pub generation: u32,
    pub phase: GroupPhase,
    pub priority: TaskPriority,
    pub tasks: Vec<TaskHandle>,
    pub remaining_tasks: u32,
    /// Recorded before the start, resolved into `unresolved_dependencies` by the start.
    pub dependencies: Vec<TaskGroupId>,
    pub unresolved_dependencies: u32,
    /// Groups that wait for this one.
    pub dependents: Vec<TaskGroupId>,
    pub on_finished: Option<GroupFinishedFn>,
}

impl GroupSlot {
    pub fn new() -> Self {
        Self {
            generation: 0,
            phase: GroupPhase::Free,
            priority: TaskPriority::ThisFrame,
            tasks: Vec::new(),
            remaining_tasks: 0,
            dependencies: Vec::new(),
            unresolved_dependencies: 0,
            dependents: Vec::new(),
            on_finished: None,
        }
    }

    #[inline]
    pub fn is_current(&self, id: TaskGroupId) -> bool {
        self.generation == id.generation && self.phase != GroupPhase::Free
    }
}
