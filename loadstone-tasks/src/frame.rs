use std::time::{Duration, Instant};

use log::{error, trace};

use crate::priority::TaskPriority;
use crate::scheduler::{HelpScope, TaskScheduler, WAIT_SLICE};

/// Threshold growth per skipped [`TaskScheduler::execute_some_frame_tasks`] call.
const THRESHOLD_GROWTH: f64 = 1.25;

static FRAME_TIERS: [(TaskPriority, TaskPriority); 2] = [
    (TaskPriority::ThisFrameMainThread, TaskPriority::ThisFrameMainThread),
    (TaskPriority::EarlyThisFrame, TaskPriority::LateThisFrame),
];

static SOME_FRAME_TIERS: [(TaskPriority, TaskPriority); 1] = [(
    TaskPriority::SomeFrameMainThread,
    TaskPriority::SomeFrameMainThread,
)];

pub(crate) struct FramePacing {
    last_some_frame_call: Option<Instant>,
    /// Frame time up to which a single background task is still forced through.
    threshold: Duration,
    last_frame_finished: Instant,
}

impl FramePacing {
    pub fn new() -> Self {
        Self {
            last_some_frame_call: None,
            threshold: Duration::ZERO,
            last_frame_finished: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SomeFrameDecision {
    RunUntil(Instant),
    RunOne,
    Skip,
}

impl TaskScheduler {
    /// Ends the frame on the main thread: everything scheduled for this frame is executed (the
    /// main thread helps), then the frame tiers move one frame ahead.
    pub fn finish_frame_tasks(&self) {
        if !self.is_main_thread() {
            debug_assert!(false, "finish_frame_tasks has to be called from the main thread");
            error!("finish_frame_tasks called from a thread other than the main thread");
            return;
        }

        let scope = HelpScope {
            tiers: &FRAME_TIERS,
            main_thread: true,
            blocked: false,
            waiting_for: None,
        };

        loop {
            if self.try_execute_one(&scope) {
                continue;
            }

            let state = self.lock_state();
            if state.shutting_down || (!state.this_frame_queued() && state.this_frame_in_flight == 0) {
                break;
            }

            // the rest is either running on workers or queued where only they can take it
            drop(
                self.shared
                    .progress
                    .wait_timeout(state, WAIT_SLICE)
                    .expect("Scheduler state lock"),
            );
        }

        self.reprioritize_frame_tasks();

        let window = {
            let mut pacing = self.shared.frame.lock().expect("Frame pacing lock");
            let now = Instant::now();
            let window = now - pacing.last_frame_finished;
            pacing.last_frame_finished = now;
            window
        };
        self.close_utilization_window(window);
    }

    /// Moves the content of every frame tier one frame closer, keeping the queue order.
    /// Leftovers of this frame's late tiers join `EarlyThisFrame`.
    pub fn reprioritize_frame_tasks(&self) {
        let mut state = self.lock_state();
        for priority in TaskPriority::ALL {
            let Some(target) = priority.next_frame_target() else {
                continue;
            };

            if target == priority || state.queues[priority.index()].is_empty() {
                continue;
            }

            let moved = std::mem::take(&mut state.queues[priority.index()]);
            trace!("Moving {} invocations from {} to {}", moved.len(), priority, target);
            state.queues[target.index()].extend(moved);
        }

        drop(state);
        self.notify_everyone();
    }

    /// Drains `SomeFrameMainThread` work without blowing the frame: executes as much as fits in
    /// `smooth_budget` if the frame was fast enough, and otherwise still forces one task through
    /// every few frames so the queue cannot starve.
    pub fn execute_some_frame_tasks(&self, smooth_budget: Duration) {
        if !self.is_main_thread() {
            debug_assert!(false, "execute_some_frame_tasks has to be called from the main thread");
            error!("execute_some_frame_tasks called from a thread other than the main thread");
            return;
        }

        let decision = {
            let mut pacing = self.shared.frame.lock().expect("Frame pacing lock");
            let now = Instant::now();
            let frame_time = pacing
                .last_some_frame_call
                .map(|last| now - last)
                .unwrap_or(Duration::ZERO);
            pacing.last_some_frame_call = Some(now);

            if pacing.threshold.is_zero() {
                pacing.threshold = smooth_budget;
            }

            if frame_time <= smooth_budget {
                pacing.threshold = smooth_budget;
                SomeFrameDecision::RunUntil(now + (smooth_budget - frame_time))
            } else if frame_time <= pacing.threshold {
                pacing.threshold = smooth_budget;
                SomeFrameDecision::RunOne
            } else {
                pacing.threshold = pacing.threshold.mul_f64(THRESHOLD_GROWTH);
                SomeFrameDecision::Skip
            }
        };

        let scope = HelpScope {
            tiers: &SOME_FRAME_TIERS,
            main_thread: true,
            blocked: false,
            waiting_for: None,
        };

        match decision {
            SomeFrameDecision::RunUntil(deadline) => {
                while Instant::now() < deadline && self.try_execute_one(&scope) {}
            }
            SomeFrameDecision::RunOne => {
                self.try_execute_one(&scope);
            }
            SomeFrameDecision::Skip => {}
        }
    }
}
