//! Consumer-thread frame scheduling: a pure state machine deciding what the
//! compositor should do next, and a frame-rate controller pacing when draw
//! ticks happen.
//!
//! Nothing in this crate touches a channel or a clock source; the owner
//! feeds in time and flag mutations and drains out actions. That keeps the
//! whole decision surface unit-testable without threads.

pub mod frame_rate;
pub mod state_machine;

pub use frame_rate::{DEFAULT_MAX_PENDING_SWAPS, FrameRateController};
pub use state_machine::{FramePhase, SchedulerAction, SchedulerStateMachine};

use std::time::Instant;

/// Combines the state machine with the frame-rate controller and answers
/// the two questions the consumer loop asks: "what should I do right now"
/// and "when do I need to wake up next".
#[derive(Debug, Clone)]
pub struct Scheduler {
    state_machine: SchedulerStateMachine,
    frame_rate: FrameRateController,
}

impl Scheduler {
    pub fn new(frame_rate: FrameRateController) -> Self {
        Self {
            state_machine: SchedulerStateMachine::new(),
            frame_rate,
        }
    }

    pub fn state(&self) -> &SchedulerStateMachine {
        &self.state_machine
    }

    pub fn state_mut(&mut self) -> &mut SchedulerStateMachine {
        &mut self.state_machine
    }

    pub fn frame_rate(&self) -> &FrameRateController {
        &self.frame_rate
    }

    pub fn frame_rate_mut(&mut self) -> &mut FrameRateController {
        &mut self.frame_rate
    }

    pub fn next_action(&self) -> SchedulerAction {
        self.state_machine.next_action()
    }

    pub fn did_perform_action(&mut self, action: SchedulerAction) {
        self.state_machine.did_perform_action(action);
    }

    /// Deadline for the next frame tick, or `None` when no tick-driven work
    /// is pending (the consumer loop then blocks on its message queue
    /// indefinitely).
    pub fn next_tick_deadline(&self, now: Instant) -> Option<Instant> {
        if !self.state_machine.needs_tick() {
            return None;
        }
        if !self.frame_rate.tick_permitted() {
            // Saturated with unacknowledged swaps. The owner keeps polling
            // for acks while has_pending_swaps() is true; ticks resume once
            // one lands.
            return None;
        }
        Some(self.frame_rate.next_tick_time(now))
    }

    /// When the next draw is expected; the upload time budget runs out
    /// here.
    pub fn anticipated_draw_time(&self, now: Instant) -> Instant {
        self.frame_rate.anticipated_draw_time(now)
    }

    pub fn did_swap_buffers(&mut self) {
        self.frame_rate.did_swap_buffers();
    }

    pub fn did_swap_buffers_complete(&mut self) {
        self.frame_rate.did_swap_buffers_complete();
    }
}
