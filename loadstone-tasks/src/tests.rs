use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::scheduler::{HelpScope, TaskScheduler};
use crate::{SchedulerConfig, TaskBuilder, TaskHandle, TaskNesting, TaskPriority, WorkerThreadType};

fn scheduler() -> TaskScheduler {
    TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler without workers")
}

fn noop(name: &str) -> TaskHandle {
    TaskHandle::from_fn(name, |_| {})
}

fn blocked_short_scope() -> HelpScope {
    HelpScope {
        tiers: WorkerThreadType::ShortTasks.worker_tiers(),
        main_thread: false,
        blocked: true,
        waiting_for: None,
    }
}

#[test]
fn finished_slots_are_reused_with_a_new_generation() {
    let scheduler = scheduler();
    let first = scheduler.create_group(TaskPriority::ThisFrame, None);
    scheduler.start_group(first);
    assert!(scheduler.is_group_finished(first));

    let second = scheduler.create_group(TaskPriority::ThisFrame, None);
    assert_eq!(second.index, first.index);
    assert_eq!(second.generation, first.generation + 1);
    assert!(scheduler.is_group_finished(first));
    assert!(!scheduler.is_group_finished(second));

    let stats = scheduler.stats();
    assert_eq!(stats.group_slots, 1);
    assert_eq!(stats.free_group_slots, 0);
}

#[test]
fn empty_group_fires_its_callback_on_start() {
    let scheduler = scheduler();
    let fired = Arc::new(AtomicU32::new(0));
    let fired_in_callback = fired.clone();
    let group = scheduler.create_group(
        TaskPriority::LongRunning,
        Some(Box::new(move |_| {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        })),
    );

    scheduler.start_group(group);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn every_invocation_is_queued_into_the_group_tier() {
    let scheduler = scheduler();
    let task = TaskBuilder::new("triple").multiplicity(3).build_fn(|_| {});
    scheduler.start_single_task(&task, TaskPriority::NextFrame, None);

    let stats = scheduler.stats();
    assert_eq!(stats.queued_at(TaskPriority::NextFrame), 3);
    assert_eq!(stats.total_queued(), 3);
    assert!(!task.is_finished());
}

#[test]
fn blocked_helpers_skip_tasks_that_must_not_nest() {
    let scheduler = scheduler();
    let never = TaskBuilder::new("never").nesting(TaskNesting::Never).build_fn(|_| {});
    let maybe = noop("maybe");

    let group = scheduler.create_group(TaskPriority::ThisFrame, None);
    scheduler.add_task_to_group(group, &never);
    scheduler.add_task_to_group(group, &maybe);
    scheduler.start_group(group);

    let mut state = scheduler.lock_state();
    let (entry, priority) =
        TaskScheduler::take_next_locked(&mut state, &blocked_short_scope()).expect("a nestable task");
    assert!(entry.task.ptr_eq(&maybe));
    assert_eq!(priority, TaskPriority::ThisFrame);
    assert_eq!(state.this_frame_in_flight, 1);

    assert!(TaskScheduler::take_next_locked(&mut state, &blocked_short_scope()).is_none());
}

#[test]
fn waiting_for_a_group_prefers_its_own_tasks() {
    let scheduler = scheduler();
    let urgent = noop("urgent");
    let awaited = TaskBuilder::new("awaited").nesting(TaskNesting::Never).build_fn(|_| {});
    scheduler.start_single_task(&urgent, TaskPriority::EarlyThisFrame, None);
    let awaited_group = scheduler.start_single_task(&awaited, TaskPriority::In9Frames, None);

    let scope = HelpScope {
        waiting_for: Some(awaited_group),
        ..blocked_short_scope()
    };

    let mut state = scheduler.lock_state();
    let (entry, priority) = TaskScheduler::take_next_locked(&mut state, &scope).expect("the awaited task");
    assert!(entry.task.ptr_eq(&awaited));
    assert_eq!(priority, TaskPriority::In9Frames);
    assert_eq!(state.this_frame_in_flight, 0);
}

#[test]
fn main_thread_tiers_are_invisible_to_other_threads() {
    let scheduler = scheduler();
    let task = noop("upload");
    let group = scheduler.start_single_task(&task, TaskPriority::ThisFrameMainThread, None);

    let scope = HelpScope {
        waiting_for: Some(group),
        ..blocked_short_scope()
    };

    let mut state = scheduler.lock_state();
    assert!(TaskScheduler::take_next_locked(&mut state, &scope).is_none());

    let main_scope = HelpScope {
        tiers: WorkerThreadType::MainThread.worker_tiers(),
        main_thread: true,
        ..scope
    };
    assert!(TaskScheduler::take_next_locked(&mut state, &main_scope).is_some());
}

#[test]
fn reprioritizing_keeps_the_queue_order() {
    let scheduler = scheduler();
    let late = noop("late");
    let next = noop("next");
    let in_two = noop("in two");
    scheduler.start_single_task(&late, TaskPriority::LateThisFrame, None);
    scheduler.start_single_task(&next, TaskPriority::NextFrame, None);
    scheduler.start_single_task(&in_two, TaskPriority::In2Frames, None);

    scheduler.reprioritize_frame_tasks();

    let state = scheduler.lock_state();
    assert!(state.queues[TaskPriority::EarlyThisFrame.index()][0].task.ptr_eq(&late));
    assert!(state.queues[TaskPriority::ThisFrame.index()][0].task.ptr_eq(&next));
    assert!(state.queues[TaskPriority::NextFrame.index()][0].task.ptr_eq(&in_two));
    assert!(state.queues[TaskPriority::In2Frames.index()].is_empty());
    assert!(state.queues[TaskPriority::LateThisFrame.index()].is_empty());
}
