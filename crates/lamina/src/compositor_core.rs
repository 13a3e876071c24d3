//! Consumer-thread side of the coordinator: owns the scheduler, the
//! resource manager and the renderer, and turns scheduler actions into
//! drawing and protocol messages.

use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use frame_scheduler::{FrameRateController, Scheduler, SchedulerAction};
use protocol::{
    BeginFrameState, ReadbackRect, RendererCapabilities, ResourcePriority, SceneTree,
    ScrollAndScaleSet, ViewTransform,
};
use resources::{Backing, PrioritizedResourceManager, ResourceUpdateController};
use threads::{RendezvousSignal, ScrollRingDrain};

use crate::messages::{CompositorMsg, SceneMsg};
use crate::{CoordinatorSettings, Renderer};

/// A commit whose upload queue is draining. The commit signal unblocks the
/// producer once the frame's content is owned by the consumer.
struct PendingCommit {
    tree: SceneTree,
    commit: RendezvousSignal<()>,
}

enum LoopControl {
    Continue,
    Shutdown,
}

pub(crate) struct CompositorCore {
    settings: CoordinatorSettings,
    scheduler: Scheduler,
    scene_tx: Sender<SceneMsg>,
    scroll_drain: ScrollRingDrain,
    renderer: Option<Box<dyn Renderer>>,
    capabilities: RendererCapabilities,
    manager: PrioritizedResourceManager,
    update_controller: Option<ResourceUpdateController>,
    uploads_ready: bool,
    pending_commit: Option<PendingCommit>,
    active_tree: Option<SceneTree>,
    pending_tree: Option<SceneTree>,
    held_commit: Option<RendezvousSignal<()>>,
    forced_begin_frame_reply: Option<RendezvousSignal<BeginFrameState>>,
    pending_readback: Option<(ReadbackRect, RendezvousSignal<Option<Vec<u8>>>)>,
    resource_access_reply: Option<RendezvousSignal<()>>,
    uploads_confirmed: bool,
    next_frame_is_newly_committed: bool,
    visible: bool,
    can_draw: bool,
    memory_limit_bytes: usize,
}

/// Consumer thread entry point. Blocks on the message queue, waking early
/// for scheduled frame ticks.
pub(crate) fn run(mut core: CompositorCore, rx: Receiver<CompositorMsg>) {
    loop {
        let now = Instant::now();
        let received = match core.next_wakeup(now) {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(msg) => {
                if let LoopControl::Shutdown = core.handle(msg) {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => core.tick(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => return,
        }
        core.pump_actions();
    }
}

impl CompositorCore {
    pub(crate) fn new(
        settings: CoordinatorSettings,
        scene_tx: Sender<SceneMsg>,
        scroll_drain: ScrollRingDrain,
    ) -> Self {
        let frame_rate = FrameRateController::new(Instant::now(), settings.refresh_interval);
        let memory_limit_bytes = settings.memory_allocation_limit_bytes;
        Self {
            settings,
            scheduler: Scheduler::new(frame_rate),
            scene_tx,
            scroll_drain,
            renderer: None,
            capabilities: RendererCapabilities::default(),
            manager: PrioritizedResourceManager::new(),
            update_controller: None,
            uploads_ready: false,
            pending_commit: None,
            active_tree: None,
            pending_tree: None,
            held_commit: None,
            forced_begin_frame_reply: None,
            pending_readback: None,
            resource_access_reply: None,
            uploads_confirmed: false,
            next_frame_is_newly_committed: false,
            visible: false,
            can_draw: false,
            memory_limit_bytes,
        }
    }

    /// When the loop must wake even if no message arrives: either an upload
    /// drain is in progress or the scheduler wants a frame tick.
    fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self
            .update_controller
            .as_ref()
            .is_some_and(|c| c.has_more_updates())
        {
            return Some(self.scheduler.frame_rate().next_tick_time(now));
        }
        // Swap acks are only discovered by polling the renderer; while any
        // are outstanding the loop must keep waking even though new draws
        // are throttled.
        if self.scheduler.frame_rate().has_pending_swaps() {
            return Some(self.scheduler.frame_rate().next_tick_time(now));
        }
        self.scheduler.next_tick_deadline(now)
    }

    fn handle(&mut self, msg: CompositorMsg) -> LoopControl {
        match msg {
            CompositorMsg::InitializeRenderer { renderer, done } => {
                self.install_renderer(renderer, done, false);
            }
            CompositorMsg::RecreateRenderer { renderer, done } => {
                self.install_renderer(renderer, done, true);
            }
            CompositorMsg::SetNeedsCommit => {
                self.scheduler.state_mut().set_needs_commit();
            }
            CompositorMsg::SetNeedsRedraw => {
                self.scheduler.state_mut().set_needs_redraw();
            }
            CompositorMsg::SetVisible { visible, done } => {
                self.visible = visible;
                self.scheduler.state_mut().set_visible(visible);
                self.update_can_draw();
                done.signal(());
            }
            CompositorMsg::SetFrameRate { timebase, interval } => {
                self.scheduler
                    .frame_rate_mut()
                    .set_timebase_and_interval(timebase, interval);
            }
            CompositorMsg::SetMemoryAllocationLimit { bytes } => {
                self.memory_limit_bytes = bytes;
                if self
                    .manager
                    .reduce_memory(bytes, ResourcePriority::ALLOW_EVERYTHING)
                    && self.manager.linked_evicted_backings_exist()
                {
                    // Uploads into just-freed memory are wasted work; the
                    // producer must re-supply the evicted content instead.
                    if let Some(controller) = self.update_controller.as_mut() {
                        controller
                            .discard_uploads_to_evicted_resources(self.manager.evicted_backings());
                    }
                    self.scheduler.state_mut().set_needs_commit();
                }
            }
            CompositorMsg::CreateBacking {
                id,
                size_bytes,
                priority,
            } => {
                self.manager.register_backing(
                    id,
                    Backing {
                        size_bytes,
                        priority,
                        linked: false,
                    },
                );
            }
            CompositorMsg::DeleteBacking { id } => {
                self.manager.unregister_backing(id);
            }
            CompositorMsg::BeginFrameComplete {
                tree,
                mut queue,
                commit,
            } => {
                self.scheduler.state_mut().commit_queue_received();
                if self.manager.linked_evicted_backings_exist() {
                    queue.clear_uploads_to_evicted_resources(self.manager.evicted_backings());
                    self.scheduler.state_mut().set_needs_commit();
                }
                let mut controller = ResourceUpdateController::new(queue);
                controller.set_upload_time_estimate(self.settings.upload_time_estimate);
                self.update_controller = Some(controller);
                self.uploads_ready = false;
                self.pending_commit = Some(PendingCommit { tree, commit });
                self.drain_uploads(Instant::now());
            }
            CompositorMsg::BeginFrameAborted => {
                self.scheduler.state_mut().begin_frame_aborted();
            }
            CompositorMsg::ForceBeginFrame { reply } => {
                self.forced_begin_frame_reply = Some(reply);
                self.scheduler.state_mut().set_needs_forced_commit();
            }
            CompositorMsg::RequestReadback { rect, reply } => {
                self.pending_readback = Some((rect, reply));
                self.scheduler.state_mut().set_needs_forced_redraw();
            }
            CompositorMsg::AcquireResources { done } => {
                self.resource_access_reply = Some(done);
                self.scheduler.state_mut().set_producer_needs_resource_access();
            }
            CompositorMsg::CommitPendingQuery { reply } => {
                reply.signal(self.scheduler.state().commit_pending());
            }
            CompositorMsg::FinishAllRendering { done } => {
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.finish();
                }
                done.signal(());
            }
            CompositorMsg::Shutdown { done } => {
                self.renderer = None;
                done.signal(());
                return LoopControl::Shutdown;
            }
        }
        LoopControl::Continue
    }

    fn install_renderer(
        &mut self,
        mut renderer: Box<dyn Renderer>,
        done: RendezvousSignal<Result<RendererCapabilities, protocol::RendererInitError>>,
        recreation: bool,
    ) {
        match renderer.initialize() {
            Ok(caps) => {
                self.capabilities = caps;
                self.scheduler
                    .frame_rate_mut()
                    .set_swap_complete_supported(caps.using_swap_complete_callback);
                if caps.has_parent_compositor {
                    self.scheduler.frame_rate_mut().set_max_pending_swaps(1);
                }
                self.renderer = Some(renderer);
                self.scheduler.state_mut().set_can_begin_frame(true);
                if recreation {
                    self.scheduler.state_mut().did_recreate_output_surface();
                }
                self.update_can_draw();
                done.signal(Ok(caps));
            }
            Err(err) => done.signal(Err(err)),
        }
    }

    /// One frame tick: advance uploads, poll swap acks, then run scheduler
    /// actions with draws permitted.
    fn tick(&mut self, now: Instant) {
        self.poll_swap_acks();
        self.drain_uploads(now);
        self.scheduler.state_mut().begin_tick();
        self.pump_actions();
        self.scheduler.state_mut().end_tick();
    }

    fn pump_actions(&mut self) {
        loop {
            let action = self.scheduler.next_action();
            if action == SchedulerAction::None {
                return;
            }
            self.scheduler.did_perform_action(action);
            match action {
                SchedulerAction::None => unreachable!(),
                SchedulerAction::BeginFrame => self.begin_frame_action(),
                SchedulerAction::Commit => self.commit_action(),
                SchedulerAction::DrawAndSwapIfPossible => self.draw_and_swap_action(false),
                SchedulerAction::DrawAndSwapForced => self.draw_and_swap_action(true),
                SchedulerAction::CheckForCompletedUploads => self.check_completed_uploads_action(),
                SchedulerAction::ActivatePendingTreeIfNeeded => self.activate_pending_tree_action(),
                SchedulerAction::GrantResourceAccess => self.grant_resource_access_action(),
                SchedulerAction::BeginOutputSurfaceRecreation => {
                    let _ = self.scene_tx.send(SceneMsg::DidLoseOutputSurface);
                }
            }
        }
    }

    /// Feed the upload queue a deadline-sized slice of work. Once the queue
    /// drains, tell the scheduler the commit may be finalized.
    fn drain_uploads(&mut self, now: Instant) {
        if self.uploads_ready || self.pending_commit.is_none() {
            return;
        }
        let finished = match (self.update_controller.as_mut(), self.renderer.as_mut()) {
            (Some(controller), Some(renderer)) => {
                let deadline = self.scheduler.anticipated_draw_time(now);
                if deadline <= now {
                    // Unthrottled pacing gives no budget boundary; drain in
                    // one pass.
                    controller.finalize(renderer.uploader());
                    true
                } else {
                    controller.perform_more_updates(renderer.uploader(), now, deadline)
                }
            }
            _ => true,
        };
        if finished {
            self.uploads_ready = true;
            self.scheduler.state_mut().uploads_ready_to_finalize();
        }
    }

    /// Assemble begin-frame state from accumulated input and hand it to the
    /// producer, either through the forced-frame rendezvous or as a posted
    /// message.
    fn begin_frame_action(&mut self) {
        let mut samples = Vec::new();
        self.scroll_drain.drain(&mut samples);
        let mut scroll_and_scale = ScrollAndScaleSet::default();
        for sample in samples {
            match scroll_and_scale
                .scrolls
                .iter_mut()
                .find(|s| s.layer_id == sample.layer_id)
            {
                Some(existing) => {
                    existing.delta_x += sample.delta_x;
                    existing.delta_y += sample.delta_y;
                }
                None => scroll_and_scale.scrolls.push(sample),
            }
        }
        let state = BeginFrameState {
            frame_begin_time: Instant::now(),
            scroll_and_scale,
            view_transform: ViewTransform::default(),
            memory_allocation_limit_bytes: self.memory_limit_bytes,
        };
        match self.forced_begin_frame_reply.take() {
            Some(reply) => reply.signal(state),
            None => {
                let _ = self.scene_tx.send(SceneMsg::BeginFrame(state));
            }
        }
    }

    fn commit_action(&mut self) {
        if let (Some(controller), Some(renderer)) =
            (self.update_controller.as_mut(), self.renderer.as_mut())
        {
            controller.finalize(renderer.uploader());
        }
        self.update_controller = None;
        let Some(PendingCommit { tree, commit }) = self.pending_commit.take() else {
            return;
        };
        self.manager.set_linked_references(&tree.referenced_backings);
        self.manager.clear_evicted_backings();
        if tree.requires_upload_confirmation {
            // Hold the producer until the uploads are confirmed and the
            // tree activates.
            self.pending_tree = Some(tree);
            self.scheduler.state_mut().set_has_pending_tree(true);
            self.uploads_confirmed = false;
            self.held_commit = Some(commit);
        } else {
            self.active_tree = Some(tree);
            self.next_frame_is_newly_committed = true;
            commit.signal(());
        }
        self.update_can_draw();
    }

    fn check_completed_uploads_action(&mut self) {
        self.uploads_confirmed = self
            .renderer
            .as_ref()
            .map_or(true, |r| !r.has_unconfirmed_uploads());
    }

    fn activate_pending_tree_action(&mut self) {
        if !self.uploads_confirmed {
            return;
        }
        let Some(tree) = self.pending_tree.take() else {
            return;
        };
        self.active_tree = Some(tree);
        self.scheduler.state_mut().set_has_pending_tree(false);
        self.next_frame_is_newly_committed = true;
        if let Some(commit) = self.held_commit.take() {
            commit.signal(());
        }
        self.update_can_draw();
    }

    fn grant_resource_access_action(&mut self) {
        if let Some(done) = self.resource_access_reply.take() {
            done.signal(());
        }
    }

    fn draw_and_swap_action(&mut self, forced: bool) {
        let can_draw = self.can_draw;
        let drew = match (self.renderer.as_mut(), self.active_tree.as_ref()) {
            (Some(renderer), Some(tree)) if can_draw || forced => renderer.draw_frame(tree),
            _ => false,
        };
        if drew {
            if let Some(renderer) = self.renderer.as_mut() {
                renderer.swap_buffers();
            }
            self.scheduler.did_swap_buffers();
            if self.next_frame_is_newly_committed {
                self.next_frame_is_newly_committed = false;
                let _ = self.scene_tx.send(SceneMsg::DidCommitAndDrawFrame);
            }
        } else if !forced {
            self.scheduler.state_mut().draw_if_possible_failed();
        }
        if forced {
            // The producer blocks on the readback reply; it must be
            // signalled whether or not a frame was produced.
            if let Some((rect, reply)) = self.pending_readback.take() {
                let pixels = match (drew, self.renderer.as_mut()) {
                    (true, Some(renderer)) => renderer.readback(rect),
                    _ => None,
                };
                reply.signal(pixels);
            }
        }
        if self.renderer.as_ref().is_some_and(|r| r.context_lost()) {
            self.scheduler.state_mut().did_lose_output_surface();
            self.update_can_draw();
        }
    }

    fn poll_swap_acks(&mut self) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };
        let acks = renderer.poll_swap_acks();
        for _ in 0..acks {
            self.scheduler.did_swap_buffers_complete();
            let _ = self.scene_tx.send(SceneMsg::DidCompleteSwapBuffers);
        }
    }

    fn update_can_draw(&mut self) {
        self.can_draw = self.renderer.is_some() && self.active_tree.is_some() && self.visible;
        self.scheduler.state_mut().set_can_draw(self.can_draw);
    }
}
