//! Producer-side handle: public API, request coalescing, and the blocking
//! protocol calls into the consumer thread.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use protocol::{
    BackingId, BeginFrameState, ReadbackRect, RendererCapabilities, RendererInitError,
    ResourcePriority,
};
use resources::{MAX_PARTIAL_UPDATES_PER_FRAME, ResourceUpdateQueue};
use threads::{CancellationToken, ScrollRingWriter, rendezvous, scroll_ring};

use crate::compositor_core::{self, CompositorCore};
use crate::messages::{CompositorMsg, SceneMsg};
use crate::{CoordinatorError, CoordinatorSettings, FrameObserver, RendererFactory, SceneUpdater};

/// First retry delay after a failed output surface recreation. Doubles on
/// every further failure up to [`MAX_RECREATION_DELAY`].
const INITIAL_RECREATION_DELAY: Duration = Duration::from_millis(30);
const MAX_RECREATION_DELAY: Duration = Duration::from_millis(480);

/// Commit accounting, readable from the producer thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    pub commit_count: u64,
    /// Wall time the producer spent blocked waiting for commits.
    pub total_commit_time: Duration,
}

/// Bounded-exponential retry schedule for output surface recreation.
#[derive(Debug, Clone, Copy)]
struct RecreationBackoff {
    delay: Duration,
    next_attempt_at: Instant,
}

impl RecreationBackoff {
    fn new(now: Instant) -> Self {
        Self {
            delay: INITIAL_RECREATION_DELAY,
            next_attempt_at: now,
        }
    }

    fn attempt_failed(&mut self, now: Instant) {
        self.next_attempt_at = now + self.delay;
        self.delay = (self.delay * 2).min(MAX_RECREATION_DELAY);
    }
}

/// Producer-side coordinator. Owns the consumer thread for its lifetime;
/// dropping (or calling [`stop`](Coordinator::stop)) shuts the consumer
/// down and joins it.
pub struct Coordinator {
    compositor_tx: Sender<CompositorMsg>,
    scene_rx: Receiver<SceneMsg>,
    consumer: Option<JoinHandle<()>>,
    scene: Box<dyn SceneUpdater>,
    observer: Box<dyn FrameObserver>,
    factory: Box<dyn RendererFactory>,
    visible: bool,
    // Request coalescing: at most one commit request crosses the thread
    // boundary per begin-frame cycle.
    commit_requested: bool,
    commit_request_sent: bool,
    animate_requested: bool,
    // The producer starts out owning the shared resources.
    resources_acquired: bool,
    defer_commits: bool,
    deferred_begin_frame: Option<BeginFrameState>,
    renderer_capabilities: Option<RendererCapabilities>,
    recreation: Option<RecreationBackoff>,
    recreation_token: CancellationToken,
    stats: CommitStats,
}

impl Coordinator {
    /// Spawn the consumer thread and return the producer handle together
    /// with the scroll input writer, which may be moved to any thread.
    pub fn start(
        scene: Box<dyn SceneUpdater>,
        observer: Box<dyn FrameObserver>,
        factory: Box<dyn RendererFactory>,
        settings: CoordinatorSettings,
    ) -> Result<(Coordinator, ScrollRingWriter), CoordinatorError> {
        let (compositor_tx, compositor_rx) = unbounded();
        let (scene_tx, scene_rx) = unbounded();
        let (scroll_writer, scroll_drain) = scroll_ring(settings.scroll_ring_capacity);

        // Block until the consumer-side state exists, so every call made
        // after start() finds a live core behind the channel.
        let (ready, ready_wait) = rendezvous();
        let consumer = thread::Builder::new()
            .name("lamina-compositor".into())
            .spawn(move || {
                let core = CompositorCore::new(settings, scene_tx, scroll_drain);
                ready.signal(());
                compositor_core::run(core, compositor_rx);
            })?;
        ready_wait.wait();

        let coordinator = Coordinator {
            compositor_tx,
            scene_rx,
            consumer: Some(consumer),
            scene,
            observer,
            factory,
            visible: false,
            commit_requested: false,
            commit_request_sent: false,
            animate_requested: false,
            resources_acquired: true,
            defer_commits: false,
            deferred_begin_frame: None,
            renderer_capabilities: None,
            recreation: None,
            recreation_token: CancellationToken::new(),
            stats: CommitStats::default(),
        };
        Ok((coordinator, scroll_writer))
    }

    /// Create a renderer and initialize it on the consumer thread,
    /// blocking until its capabilities come back.
    pub fn initialize_renderer(&mut self) -> Result<RendererCapabilities, RendererInitError> {
        let renderer = self.factory.create_renderer()?;
        let (done, wait) = rendezvous();
        self.compositor_tx
            .send(CompositorMsg::InitializeRenderer { renderer, done })
            .map_err(|_| RendererInitError::SurfaceUnavailable)?;
        let caps = wait.wait()?;
        self.renderer_capabilities = Some(caps);
        Ok(caps)
    }

    /// Request a commit. Coalesced: repeated calls before the next
    /// begin-frame are free.
    pub fn set_needs_commit(&mut self) {
        if self.commit_requested {
            return;
        }
        self.commit_requested = true;
        self.send_commit_request();
    }

    /// Request a commit for animation purposes only. Shares the in-flight
    /// request with [`set_needs_commit`](Coordinator::set_needs_commit).
    pub fn set_needs_animate(&mut self) {
        if self.animate_requested {
            return;
        }
        self.animate_requested = true;
        self.send_commit_request();
    }

    fn send_commit_request(&mut self) {
        if self.commit_request_sent {
            return;
        }
        self.commit_request_sent = true;
        let _ = self.compositor_tx.send(CompositorMsg::SetNeedsCommit);
    }

    /// Request a redraw of the already-committed content.
    pub fn set_needs_redraw(&self) {
        let _ = self.compositor_tx.send(CompositorMsg::SetNeedsRedraw);
    }

    /// Change visibility, blocking until the consumer has applied it.
    /// While invisible, begin-frames abort and draws stop.
    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
        let (done, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::SetVisible { visible, done })
            .is_ok()
        {
            wait.wait();
        }
    }

    /// While deferred, begin-frames park instead of running; clearing the
    /// flag replays the parked frame immediately.
    pub fn set_defer_commits(&mut self, defer: bool) {
        if self.defer_commits == defer {
            return;
        }
        self.defer_commits = defer;
        if !defer {
            if let Some(state) = self.deferred_begin_frame.take() {
                self.run_begin_frame(state, false);
            }
        }
    }

    pub fn set_frame_rate(&self, timebase: Instant, interval: Duration) {
        let _ = self
            .compositor_tx
            .send(CompositorMsg::SetFrameRate { timebase, interval });
    }

    pub fn set_memory_allocation_limit(&self, bytes: usize) {
        let _ = self
            .compositor_tx
            .send(CompositorMsg::SetMemoryAllocationLimit { bytes });
    }

    pub fn create_backing(&self, id: BackingId, size_bytes: usize, priority: ResourcePriority) {
        let _ = self.compositor_tx.send(CompositorMsg::CreateBacking {
            id,
            size_bytes,
            priority,
        });
    }

    pub fn delete_backing(&self, id: BackingId) {
        let _ = self.compositor_tx.send(CompositorMsg::DeleteBacking { id });
    }

    /// Block until the producer may mutate shared resource contents again.
    /// Idempotent until the next commit hands the resources back.
    pub fn acquire_resources(&mut self) {
        if self.resources_acquired {
            return;
        }
        let (done, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::AcquireResources { done })
            .is_ok()
        {
            wait.wait();
        }
        self.resources_acquired = true;
    }

    /// Force a commit-and-draw cycle and read the resulting pixels into
    /// `buffer` as RGBA8. Returns false, leaving `buffer` untouched, when
    /// no frame could be produced or commits are deferred.
    pub fn composite_and_readback(&mut self, buffer: &mut [u8], rect: ReadbackRect) -> bool {
        // While commits are deferred the consumer may be waiting on a
        // parked cycle that will not complete; a forced frame cannot
        // overtake it, so waiting here would never return.
        if self.defer_commits {
            return false;
        }
        if self.renderer_capabilities.is_none() || rect.is_empty() {
            return false;
        }
        assert!(buffer.len() >= rect.byte_len(), "readback buffer too small");

        let (reply, mut wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::ForceBeginFrame { reply })
            .is_err()
        {
            return false;
        }
        // A regular begin-frame may already be in flight; it must be
        // serviced here or the consumer never reaches the forced one.
        let state = loop {
            match wait.wait_timeout(Duration::from_millis(1)) {
                Ok(state) => break state,
                Err(unsignalled) => {
                    wait = unsignalled;
                    self.drain_pending_scene_messages();
                }
            }
        };
        self.run_begin_frame(state, true);

        let (reply, readback_wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::RequestReadback { rect, reply })
            .is_err()
        {
            return false;
        }
        match readback_wait.wait() {
            Some(pixels) => {
                buffer[..pixels.len()].copy_from_slice(&pixels);
                true
            }
            None => false,
        }
    }

    /// Block until the consumer has finished all submitted rendering.
    pub fn finish_all_rendering(&self) {
        let (done, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::FinishAllRendering { done })
            .is_ok()
        {
            wait.wait();
        }
    }

    /// Whether a begin-frame/commit cycle is in flight on the consumer.
    pub fn commit_pending_for_testing(&self) -> bool {
        let (reply, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::CommitPendingQuery { reply })
            .is_err()
        {
            return false;
        }
        wait.wait()
    }

    /// Service consumer-thread messages for up to `timeout`. Begin-frames
    /// run the scene update cycle inline; other messages fan out to the
    /// observer. Also drives any pending surface recreation.
    pub fn process_messages(&mut self, timeout: Duration) {
        let mut deadline = Instant::now() + timeout;
        if let Some(backoff) = &self.recreation {
            if !self.recreation_token.is_cancelled() {
                deadline = deadline.min(backoff.next_attempt_at);
            }
        }
        loop {
            match self.scene_rx.recv_deadline(deadline) {
                Ok(msg) => self.handle_scene_msg(msg),
                Err(_) => break,
            }
        }
        self.try_recreate(Instant::now());
    }

    fn drain_pending_scene_messages(&mut self) {
        while let Ok(msg) = self.scene_rx.try_recv() {
            self.handle_scene_msg(msg);
        }
    }

    fn handle_scene_msg(&mut self, msg: SceneMsg) {
        match msg {
            SceneMsg::BeginFrame(state) => self.run_begin_frame(state, false),
            SceneMsg::DidCommitAndDrawFrame => self.observer.did_commit_and_draw_frame(),
            SceneMsg::DidCompleteSwapBuffers => self.observer.did_complete_swap_buffers(),
            SceneMsg::DidLoseOutputSurface => {
                self.observer.did_lose_output_surface();
                if self.recreation.is_none() {
                    self.recreation = Some(RecreationBackoff::new(Instant::now()));
                }
            }
        }
    }

    /// One producer-side begin-frame cycle: scroll application, animation,
    /// layout, repaint, then a blocking commit.
    fn run_begin_frame(&mut self, state: BeginFrameState, forced: bool) {
        if self.defer_commits && !forced {
            self.deferred_begin_frame = Some(state);
            return;
        }
        // Latches clear before scene code runs, so requests made during
        // the update start a fresh cycle.
        self.commit_requested = false;
        self.commit_request_sent = false;
        self.animate_requested = false;
        if !self.visible && !forced {
            let _ = self.compositor_tx.send(CompositorMsg::BeginFrameAborted);
            return;
        }

        self.observer.will_begin_frame();
        self.scene
            .apply_scroll_and_scale(&state.scroll_and_scale, &state.view_transform);
        self.scene.animate(state.frame_begin_time);
        self.scene.layout();
        let mut queue = ResourceUpdateQueue::new();
        let tree = self
            .scene
            .update_layers(&mut queue, state.memory_allocation_limit_bytes);

        // The commit hands resource ownership to the consumer.
        self.resources_acquired = false;
        let commit_started = Instant::now();
        let (commit, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::BeginFrameComplete { tree, queue, commit })
            .is_err()
        {
            return;
        }
        wait.wait();
        self.stats.commit_count += 1;
        self.stats.total_commit_time += commit_started.elapsed();
        self.observer.did_commit();
    }

    fn try_recreate(&mut self, now: Instant) {
        if self.recreation_token.is_cancelled() {
            self.recreation = None;
            return;
        }
        let due = match &self.recreation {
            Some(backoff) => now >= backoff.next_attempt_at,
            None => return,
        };
        if !due {
            return;
        }
        let recreated = match self.factory.create_renderer() {
            Ok(renderer) => {
                let (done, wait) = rendezvous();
                if self
                    .compositor_tx
                    .send(CompositorMsg::RecreateRenderer { renderer, done })
                    .is_err()
                {
                    return;
                }
                match wait.wait() {
                    Ok(caps) => {
                        self.renderer_capabilities = Some(caps);
                        true
                    }
                    Err(_) => false,
                }
            }
            Err(_) => false,
        };
        if recreated {
            self.recreation = None;
            self.observer.did_recreate_output_surface();
        } else if let Some(backoff) = self.recreation.as_mut() {
            backoff.attempt_failed(now);
        }
    }

    /// Shut the consumer thread down and join it. Cancels any scheduled
    /// surface recreation. Safe to call more than once.
    pub fn stop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };
        self.recreation_token.cancel();
        self.recreation = None;
        let (done, wait) = rendezvous();
        if self
            .compositor_tx
            .send(CompositorMsg::Shutdown { done })
            .is_ok()
        {
            wait.wait();
        }
        if consumer.join().is_err() {
            eprintln!("lamina: compositor thread panicked during shutdown");
        }
    }

    pub fn stats(&self) -> CommitStats {
        self.stats
    }

    pub fn renderer_capabilities(&self) -> Option<RendererCapabilities> {
        self.renderer_capabilities
    }

    /// How many partial uploads one frame's queue may carry.
    pub fn max_partial_texture_updates(&self) -> usize {
        match &self.renderer_capabilities {
            Some(caps) if caps.allow_partial_texture_updates => MAX_PARTIAL_UPDATES_PER_FRAME,
            _ => 0,
        }
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Whether the producer currently owns the shared resource contents.
    #[cfg(test)]
    pub(crate) fn owns_shared_resources(&self) -> bool {
        self.resources_acquired
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
