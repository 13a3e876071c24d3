use std::fmt;

/// Where the current begin-frame/commit cycle stands. At most one cycle is
/// in flight: a new one cannot start until the previous one commits or
/// aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitPhase {
    /// No cycle in flight.
    Idle,
    /// Begin-frame state was posted to the producer; waiting for the work
    /// queue (or an abort).
    FrameRequested,
    /// The work queue arrived and the resource-update controller is
    /// draining it.
    CommitPending,
}

/// Externally observable frame phase, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    Idle,
    FrameRequested,
    CommitPending,
    /// A commit landed and its frame has not been drawn yet.
    ReadyToDraw,
}

/// What the consumer thread should do next. Emitted by the state machine,
/// consumed by the coordinator's consumer-side core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    None,
    BeginFrame,
    Commit,
    DrawAndSwapIfPossible,
    DrawAndSwapForced,
    ActivatePendingTreeIfNeeded,
    CheckForCompletedUploads,
    GrantResourceAccess,
    BeginOutputSurfaceRecreation,
}

/// Pure decision logic for the consumer thread. All inputs arrive as flag
/// mutations (posted messages become setter calls on the consumer thread);
/// `next_action` inspects the flags, `did_perform_action` advances them.
#[derive(Debug, Clone)]
pub struct SchedulerStateMachine {
    commit_phase: CommitPhase,
    ready_to_commit: bool,
    needs_commit: bool,
    needs_forced_commit: bool,
    needs_redraw: bool,
    needs_forced_redraw: bool,
    visible: bool,
    can_begin_frame: bool,
    can_draw: bool,
    has_pending_tree: bool,
    producer_needs_resource_access: bool,
    output_surface_lost: bool,
    recreation_posted: bool,
    /// A commit landed whose frame has not been drawn yet.
    newly_committed_undrawn: bool,
    inside_tick: bool,
    checked_uploads_this_tick: bool,
    activation_attempted_this_tick: bool,
    draw_attempted_this_tick: bool,
}

impl SchedulerStateMachine {
    pub fn new() -> Self {
        Self {
            commit_phase: CommitPhase::Idle,
            ready_to_commit: false,
            needs_commit: false,
            needs_forced_commit: false,
            needs_redraw: false,
            needs_forced_redraw: false,
            visible: false,
            can_begin_frame: false,
            can_draw: false,
            has_pending_tree: false,
            producer_needs_resource_access: false,
            output_surface_lost: false,
            recreation_posted: false,
            newly_committed_undrawn: false,
            inside_tick: false,
            checked_uploads_this_tick: false,
            activation_attempted_this_tick: false,
            draw_attempted_this_tick: false,
        }
    }

    pub fn next_action(&self) -> SchedulerAction {
        // Resource access is granted whenever no upload drain is in flight
        // and no committed-but-undrawn frame still reads the backings. If
        // drawing is impossible the undrawn frame will never be drawn, so
        // waiting for it would deadlock the blocked producer.
        if self.producer_needs_resource_access
            && self.commit_phase != CommitPhase::CommitPending
            && (!self.newly_committed_undrawn || !self.can_draw)
        {
            return SchedulerAction::GrantResourceAccess;
        }

        if self.output_surface_lost && !self.recreation_posted {
            return SchedulerAction::BeginOutputSurfaceRecreation;
        }

        if self.inside_tick && self.has_pending_tree && !self.checked_uploads_this_tick {
            return SchedulerAction::CheckForCompletedUploads;
        }

        if self.inside_tick
            && self.has_pending_tree
            && self.checked_uploads_this_tick
            && !self.activation_attempted_this_tick
        {
            return SchedulerAction::ActivatePendingTreeIfNeeded;
        }

        if self.ready_to_commit {
            return SchedulerAction::Commit;
        }

        // A forced redraw runs regardless of tick or drawability: the
        // producer is blocked on its result and must always be unblocked.
        if self.needs_forced_redraw {
            return SchedulerAction::DrawAndSwapForced;
        }

        // One optimistic draw attempt per tick; a failed attempt retries on
        // the next tick, not in a loop.
        if self.inside_tick
            && !self.draw_attempted_this_tick
            && self.can_draw
            && !self.output_surface_lost
            && (self.needs_redraw || self.newly_committed_undrawn)
        {
            return SchedulerAction::DrawAndSwapIfPossible;
        }

        if (self.needs_commit || self.needs_forced_commit)
            && self.commit_phase == CommitPhase::Idle
            && self.can_begin_frame
            && !self.output_surface_lost
            && (self.visible || self.needs_forced_commit)
        {
            return SchedulerAction::BeginFrame;
        }

        SchedulerAction::None
    }

    pub fn did_perform_action(&mut self, action: SchedulerAction) {
        match action {
            SchedulerAction::None => {}
            SchedulerAction::BeginFrame => {
                self.commit_phase = CommitPhase::FrameRequested;
                self.needs_commit = false;
                self.needs_forced_commit = false;
            }
            SchedulerAction::Commit => {
                debug_assert!(self.ready_to_commit, "commit without completed uploads");
                self.commit_phase = CommitPhase::Idle;
                self.ready_to_commit = false;
                self.newly_committed_undrawn = true;
                self.needs_redraw = true;
            }
            SchedulerAction::DrawAndSwapIfPossible | SchedulerAction::DrawAndSwapForced => {
                self.needs_redraw = false;
                self.needs_forced_redraw = false;
                self.newly_committed_undrawn = false;
                self.draw_attempted_this_tick = true;
            }
            SchedulerAction::CheckForCompletedUploads => {
                self.checked_uploads_this_tick = true;
            }
            SchedulerAction::ActivatePendingTreeIfNeeded => {
                self.activation_attempted_this_tick = true;
            }
            SchedulerAction::GrantResourceAccess => {
                self.producer_needs_resource_access = false;
            }
            SchedulerAction::BeginOutputSurfaceRecreation => {
                self.recreation_posted = true;
            }
        }
    }

    // Flag mutations, all on the consumer thread.

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn set_can_begin_frame(&mut self, can: bool) {
        self.can_begin_frame = can;
    }

    pub fn set_can_draw(&mut self, can: bool) {
        self.can_draw = can;
    }

    pub fn set_needs_commit(&mut self) {
        self.needs_commit = true;
    }

    pub fn set_needs_forced_commit(&mut self) {
        self.needs_forced_commit = true;
    }

    pub fn set_needs_redraw(&mut self) {
        self.needs_redraw = true;
    }

    pub fn set_needs_forced_redraw(&mut self) {
        self.needs_forced_redraw = true;
    }

    pub fn set_has_pending_tree(&mut self, has: bool) {
        self.has_pending_tree = has;
    }

    pub fn set_producer_needs_resource_access(&mut self) {
        self.producer_needs_resource_access = true;
    }

    // Protocol events.

    /// The producer delivered its work queue for the in-flight cycle.
    pub fn commit_queue_received(&mut self) {
        debug_assert_eq!(self.commit_phase, CommitPhase::FrameRequested);
        self.commit_phase = CommitPhase::CommitPending;
    }

    /// Every queued upload was either performed or discarded; the commit
    /// may be finalized.
    pub fn uploads_ready_to_finalize(&mut self) {
        debug_assert_eq!(self.commit_phase, CommitPhase::CommitPending);
        self.ready_to_commit = true;
    }

    /// The producer aborted the cycle (not visible, or commits deferred).
    /// The request is not lost: needs-commit stays set so a later visible
    /// transition retries.
    pub fn begin_frame_aborted(&mut self) {
        self.commit_phase = CommitPhase::Idle;
        self.needs_commit = true;
    }

    /// An optimistic draw produced no frame. Re-request both a redraw and a
    /// commit; new content may be what makes the next attempt succeed.
    pub fn draw_if_possible_failed(&mut self) {
        self.needs_redraw = true;
        self.needs_commit = true;
    }

    pub fn did_lose_output_surface(&mut self) {
        self.output_surface_lost = true;
    }

    pub fn did_recreate_output_surface(&mut self) {
        self.output_surface_lost = false;
        self.recreation_posted = false;
        self.needs_commit = true;
    }

    /// Bracket one frame tick. Per-tick one-shot actions reset here.
    pub fn begin_tick(&mut self) {
        self.inside_tick = true;
        self.checked_uploads_this_tick = false;
        self.activation_attempted_this_tick = false;
        self.draw_attempted_this_tick = false;
    }

    pub fn end_tick(&mut self) {
        self.inside_tick = false;
    }

    // Queries.

    /// Whether a begin-frame/commit cycle is in flight.
    pub fn commit_pending(&self) -> bool {
        self.commit_phase != CommitPhase::Idle
    }

    pub fn redraw_pending(&self) -> bool {
        self.needs_redraw
    }

    pub fn needs_commit(&self) -> bool {
        self.needs_commit
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Whether the consumer loop should arm a frame tick at all.
    pub fn needs_tick(&self) -> bool {
        if self.has_pending_tree {
            return true;
        }
        self.can_draw
            && !self.output_surface_lost
            && (self.needs_redraw || self.newly_committed_undrawn)
    }

    pub fn frame_phase(&self) -> FramePhase {
        match self.commit_phase {
            CommitPhase::FrameRequested => FramePhase::FrameRequested,
            CommitPhase::CommitPending => FramePhase::CommitPending,
            CommitPhase::Idle if self.newly_committed_undrawn => FramePhase::ReadyToDraw,
            CommitPhase::Idle => FramePhase::Idle,
        }
    }
}

impl Default for SchedulerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FramePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FramePhase::Idle => "idle",
            FramePhase::FrameRequested => "frame-requested",
            FramePhase::CommitPending => "commit-pending",
            FramePhase::ReadyToDraw => "ready-to-draw",
        };
        f.write_str(name)
    }
}
