use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loadstone_tasks::{
    CancelMode, CancelResult, SchedulerConfig, TaskBuilder, TaskError, TaskGroupId, TaskHandle, TaskPriority,
    TaskScheduler, WorkerThreadType,
};

fn with_short_workers(count: usize) -> TaskScheduler {
    TaskScheduler::start(SchedulerConfig {
        short_task_workers: count,
        long_task_workers: 1,
        file_access_workers: 1,
    })
    .expect("scheduler to start")
}

#[test_log::test]
fn every_invocation_runs_exactly_once() {
    let scheduler = with_short_workers(4);
    let invocations = Arc::new((0..10 * 4).map(|_| AtomicU32::new(0)).collect::<Vec<_>>());
    let task_callbacks = Arc::new(AtomicU32::new(0));
    let group_callbacks = Arc::new(AtomicU32::new(0));
    let callbacks_seen_by_group = Arc::new(AtomicU32::new(u32::MAX));

    let group = {
        let task_callbacks = task_callbacks.clone();
        let group_callbacks = group_callbacks.clone();
        let seen = callbacks_seen_by_group.clone();
        scheduler.create_group(
            TaskPriority::ThisFrame,
            Some(Box::new(move |_| {
                seen.store(task_callbacks.load(Ordering::SeqCst), Ordering::SeqCst);
                group_callbacks.fetch_add(1, Ordering::SeqCst);
            })),
        )
    };

    for index in 0..10 {
        let invocations = invocations.clone();
        let task_callbacks = task_callbacks.clone();
        let task = TaskBuilder::new(format!("counter {}", index))
            .multiplicity(4)
            .on_finished(move |_| {
                task_callbacks.fetch_add(1, Ordering::SeqCst);
            })
            .build_fn(move |ctx| {
                invocations[index * 4 + ctx.invocation() as usize].fetch_add(1, Ordering::SeqCst);
            });
        scheduler.add_task_to_group(group, &task);
    }

    scheduler.start_group(group);
    scheduler.wait_for_group(group).expect("group to finish");

    assert!(invocations.iter().all(|count| count.load(Ordering::SeqCst) == 1));
    assert_eq!(task_callbacks.load(Ordering::SeqCst), 10);
    assert_eq!(group_callbacks.load(Ordering::SeqCst), 1);
    assert_eq!(callbacks_seen_by_group.load(Ordering::SeqCst), 10);
    scheduler.shutdown();
}

#[test_log::test]
fn dependent_group_starts_after_its_dependency() {
    let scheduler = with_short_workers(2);
    let first_done = Arc::new(AtomicBool::new(false));
    let saw_first_done = Arc::new(AtomicBool::new(false));

    let first = scheduler.create_group(TaskPriority::ThisFrame, None);
    let second = scheduler.create_group(TaskPriority::ThisFrame, None);

    let done = first_done.clone();
    let slow = TaskHandle::from_fn("slow", move |_| {
        std::thread::sleep(Duration::from_millis(20));
        done.store(true, Ordering::SeqCst);
    });
    scheduler.add_task_to_group(first, &slow);

    let done = first_done.clone();
    let saw = saw_first_done.clone();
    let check = TaskHandle::from_fn("check", move |_| {
        saw.store(done.load(Ordering::SeqCst), Ordering::SeqCst);
    });
    scheduler.add_task_to_group(second, &check);
    scheduler.add_group_dependency(second, first);

    // the dependent is started first on purpose
    scheduler.start_group(second);
    scheduler.start_group(first);
    scheduler.wait_for_group(second).expect("dependent group to finish");

    assert!(scheduler.is_group_finished(first));
    assert!(saw_first_done.load(Ordering::SeqCst));
    scheduler.shutdown();
}

#[test_log::test]
fn canceled_queued_task_never_runs() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_task = ran.clone();
    let task = TaskHandle::from_fn("doomed", move |_| ran_in_task.store(true, Ordering::SeqCst));
    let group = scheduler.start_single_task(&task, TaskPriority::ThisFrame, None);

    assert_eq!(scheduler.cancel_task(&task, CancelMode::FireAndForget), CancelResult::Canceled);
    assert!(task.is_finished());
    assert!(scheduler.is_group_finished(group));
    scheduler.wait_for_group(group).expect("canceled group counts as finished");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(scheduler.stats().total_queued(), 0);
}

#[test_log::test]
fn canceling_before_the_start_skips_the_body() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_task = ran.clone();
    let task = TaskHandle::from_fn("unscheduled", move |_| ran_in_task.store(true, Ordering::SeqCst));

    let group = scheduler.create_group(TaskPriority::ThisFrame, None);
    scheduler.add_task_to_group(group, &task);
    assert_eq!(scheduler.cancel_task(&task, CancelMode::FireAndForget), CancelResult::Canceled);

    scheduler.start_group(group);
    scheduler.wait_for_group(group).expect("group to finish");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(task.started_runs(), 0);
}

#[test_log::test]
fn canceling_a_running_task_waits_for_it() {
    let scheduler = with_short_workers(1);
    let started = Arc::new(AtomicBool::new(false));
    let started_in_task = started.clone();
    let task = TaskHandle::from_fn("spinner", move |ctx| {
        started_in_task.store(true, Ordering::SeqCst);
        while !ctx.is_canceled() {
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    scheduler.start_single_task(&task, TaskPriority::LongRunning, None);
    scheduler.wait_for_condition(|| started.load(Ordering::SeqCst));

    assert_eq!(
        scheduler.cancel_task(&task, CancelMode::WaitTillFinished),
        CancelResult::AlreadyRunning
    );
    assert!(task.is_finished());
    assert_eq!(task.started_runs(), 1);
    scheduler.shutdown();
}

#[test_log::test]
fn main_thread_helps_when_there_are_no_workers() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let threads = Arc::new(Mutex::new(Vec::new()));

    let group = scheduler.create_group(TaskPriority::EarlyThisFrame, None);
    for index in 0..3 {
        let threads = threads.clone();
        let task = TaskHandle::from_fn(format!("early {}", index), move |_| {
            threads.lock().expect("thread list").push(std::thread::current().id());
        });
        scheduler.add_task_to_group(group, &task);
    }
    scheduler.start_group(group);
    scheduler.wait_for_group(group).expect("group to finish");

    let threads = threads.lock().expect("thread list");
    assert_eq!(threads.len(), 3);
    assert!(threads.iter().all(|id| *id == std::thread::current().id()));
}

#[test_log::test]
fn next_frame_work_runs_one_frame_later() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let ran = Arc::new(AtomicU32::new(0));
    let ran_in_task = ran.clone();
    let task = TaskHandle::from_fn("next frame", move |_| {
        ran_in_task.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.start_single_task(&task, TaskPriority::LongRunning, None);

    scheduler.finish_frame_tasks();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.stats().queued_at(TaskPriority::ThisFrame), 1);

    scheduler.finish_frame_tasks();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats().total_queued(), 0);
}

#[test_log::test]
fn finish_frame_waits_for_work_in_flight() {
    let scheduler = with_short_workers(2);
    let finished = Arc::new(AtomicU32::new(0));
    let group = scheduler.create_group(TaskPriority::ThisFrame, None);
    for index in 0..4 {
        let finished = finished.clone();
        let task = TaskHandle::from_fn(format!("frame work {}", index), move |_| {
            std::thread::sleep(Duration::from_millis(10));
            finished.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.add_task_to_group(group, &task);
    }
    scheduler.start_group(group);

    scheduler.finish_frame_tasks();
    assert_eq!(finished.load(Ordering::SeqCst), 4);
    assert_eq!(scheduler.stats().this_frame_in_flight, 0);
    assert_eq!(scheduler.thread_utilization(WorkerThreadType::ShortTasks).len(), 2);
    scheduler.shutdown();
}

#[test_log::test]
fn some_frame_tasks_progress_under_overload() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let ran = Arc::new(AtomicU32::new(0));
    let budget = Duration::from_millis(1);

    // the first call has no frame time to measure yet
    scheduler.execute_some_frame_tasks(budget);

    for index in 0..5 {
        let ran = ran.clone();
        let task = TaskHandle::from_fn(format!("background {}", index), move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.start_single_task(&task, TaskPriority::SomeFrameMainThread, None);
    }

    for _ in 0..30 {
        std::thread::sleep(Duration::from_millis(5));
        scheduler.execute_some_frame_tasks(budget);
    }

    let ran = ran.load(Ordering::SeqCst);
    assert!(ran >= 1, "background work starved");
    assert!(ran < 5, "overloaded frames drained the whole queue");
}

#[test_log::test]
fn panicking_task_does_not_hang_its_group() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let task = TaskHandle::from_fn("explodes", |_| panic!("broken asset"));
    let group = scheduler.start_single_task(&task, TaskPriority::ThisFrame, None);

    scheduler.wait_for_group(group).expect("group to finish");
    assert!(task.has_panicked());
    assert!(task.is_finished());
}

#[test_log::test]
fn finished_task_can_be_submitted_again() {
    let scheduler = with_short_workers(2);
    let ran = Arc::new(AtomicU32::new(0));
    let ran_in_task = ran.clone();
    let task = TaskHandle::from_fn("pooled", move |_| {
        ran_in_task.fetch_add(1, Ordering::SeqCst);
    });

    for _ in 0..3 {
        let group = scheduler.start_single_task(&task, TaskPriority::LongRunning, None);
        scheduler.wait_for_group(group).expect("group to finish");
        assert_eq!(task.group(), group);
    }
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    scheduler.shutdown();
}

#[test_log::test]
fn stale_group_ids_read_as_finished() {
    let scheduler = TaskScheduler::start(SchedulerConfig::without_workers()).expect("scheduler to start");
    let task = TaskHandle::from_fn("quick", |_| {});
    let old = scheduler.start_single_task(&task, TaskPriority::ThisFrame, None);
    scheduler.wait_for_group(old).expect("group to finish");

    let reused = scheduler.create_group(TaskPriority::ThisFrame, None);
    assert!(scheduler.is_group_finished(old));
    assert!(scheduler.wait_for_group(old).is_ok());
    assert!(!scheduler.is_group_finished(reused));
    assert!(matches!(
        scheduler.wait_for_group(reused),
        Err(TaskError::GroupNotStarted(_))
    ));

    scheduler.start_group(reused);
    assert!(scheduler.is_group_finished(reused));
    assert!(matches!(
        scheduler.wait_for_group(TaskGroupId::INVALID),
        Err(TaskError::UnknownGroup(_))
    ));
}

#[test_log::test]
fn pools_only_grow() {
    let scheduler = with_short_workers(1);
    scheduler
        .set_worker_thread_count(WorkerThreadType::FileAccess, 3)
        .expect("pool to grow");
    scheduler
        .set_worker_thread_count(WorkerThreadType::FileAccess, 1)
        .expect("shrinking is ignored");
    assert_eq!(scheduler.worker_thread_count(WorkerThreadType::FileAccess), 3);

    scheduler.shutdown();
    assert!(matches!(
        scheduler.set_worker_thread_count(WorkerThreadType::LongTasks, 4),
        Err(TaskError::SchedulerShutDown)
    ));
}
