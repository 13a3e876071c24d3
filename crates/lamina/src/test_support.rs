//! Shared fakes for the threaded tests: a scene updater, renderer and
//! renderer factory whose behavior is steered and observed through shared
//! probes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use protocol::{
    BackingId, ReadbackRect, RendererCapabilities, RendererInitError, SceneTree,
    ScrollAndScaleSet, ViewTransform,
};
use resources::{ResourceUpdateQueue, UploadJob, UploadKind, Uploader};

use crate::{FrameObserver, Renderer, RendererFactory, SceneUpdater};

#[derive(Default)]
pub struct SceneProbe {
    pub update_count: AtomicUsize,
    pub last_scroll: Mutex<Option<ScrollAndScaleSet>>,
}

/// Scene updater that emits a fixed set of upload jobs and backing
/// references every frame.
pub struct FakeScene {
    pub probe: Arc<SceneProbe>,
    pub upload_jobs: Vec<UploadJob>,
    pub referenced_backings: Vec<BackingId>,
    pub requires_upload_confirmation: bool,
    frames: u64,
}

impl FakeScene {
    pub fn new() -> (Self, Arc<SceneProbe>) {
        let probe = Arc::new(SceneProbe::default());
        let scene = Self {
            probe: probe.clone(),
            upload_jobs: Vec::new(),
            referenced_backings: Vec::new(),
            requires_upload_confirmation: false,
            frames: 0,
        };
        (scene, probe)
    }
}

impl SceneUpdater for FakeScene {
    fn apply_scroll_and_scale(&mut self, scroll: &ScrollAndScaleSet, _view: &ViewTransform) {
        if !scroll.is_identity() {
            *self.probe.last_scroll.lock().unwrap() = Some(scroll.clone());
        }
    }

    fn animate(&mut self, _frame_time: Instant) {}

    fn layout(&mut self) {}

    fn update_layers(
        &mut self,
        queue: &mut ResourceUpdateQueue,
        _memory_limit_bytes: usize,
    ) -> SceneTree {
        self.probe.update_count.fetch_add(1, Ordering::SeqCst);
        for job in &self.upload_jobs {
            match job.kind {
                UploadKind::Full => queue.append_full_upload(*job),
                UploadKind::Partial => queue.append_partial_upload(*job),
            }
        }
        self.frames += 1;
        SceneTree {
            source_frame_number: self.frames,
            referenced_backings: self.referenced_backings.iter().copied().collect(),
            requires_upload_confirmation: self.requires_upload_confirmation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverEvent {
    WillBeginFrame,
    DidCommit,
    DidCommitAndDrawFrame,
    DidCompleteSwapBuffers,
    DidLoseOutputSurface,
    DidRecreateOutputSurface,
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Arc<Mutex<Vec<ObserverEvent>>>,
}

impl RecordingObserver {
    pub fn new() -> (Self, Arc<Mutex<Vec<ObserverEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

pub fn event_count(events: &Arc<Mutex<Vec<ObserverEvent>>>, wanted: ObserverEvent) -> usize {
    events.lock().unwrap().iter().filter(|e| **e == wanted).count()
}

impl FrameObserver for RecordingObserver {
    fn will_begin_frame(&mut self) {
        self.events.lock().unwrap().push(ObserverEvent::WillBeginFrame);
    }

    fn did_commit(&mut self) {
        self.events.lock().unwrap().push(ObserverEvent::DidCommit);
    }

    fn did_commit_and_draw_frame(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(ObserverEvent::DidCommitAndDrawFrame);
    }

    fn did_complete_swap_buffers(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(ObserverEvent::DidCompleteSwapBuffers);
    }

    fn did_lose_output_surface(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(ObserverEvent::DidLoseOutputSurface);
    }

    fn did_recreate_output_surface(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(ObserverEvent::DidRecreateOutputSurface);
    }
}

pub const READBACK_FILL: u8 = 0xAB;

pub struct RendererProbe {
    pub draws: AtomicUsize,
    pub swaps: AtomicUsize,
    pub uploads: Mutex<Vec<BackingId>>,
    pub flushes: AtomicUsize,
    pub fail_draws: AtomicBool,
    pub context_lost: AtomicBool,
    pub unconfirmed_uploads: AtomicBool,
    /// Swap acks waiting to be picked up by the next poll.
    pub swap_acks: AtomicUsize,
    pub capabilities: Mutex<RendererCapabilities>,
}

impl RendererProbe {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            draws: AtomicUsize::new(0),
            swaps: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            flushes: AtomicUsize::new(0),
            fail_draws: AtomicBool::new(false),
            context_lost: AtomicBool::new(false),
            unconfirmed_uploads: AtomicBool::new(false),
            swap_acks: AtomicUsize::new(0),
            capabilities: Mutex::new(RendererCapabilities::default()),
        })
    }
}

pub struct FakeRenderer {
    pub probe: Arc<RendererProbe>,
}

impl Renderer for FakeRenderer {
    fn initialize(&mut self) -> Result<RendererCapabilities, RendererInitError> {
        self.probe.context_lost.store(false, Ordering::SeqCst);
        Ok(*self.probe.capabilities.lock().unwrap())
    }

    fn draw_frame(&mut self, _tree: &SceneTree) -> bool {
        if self.probe.fail_draws.load(Ordering::SeqCst) {
            return false;
        }
        self.probe.draws.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn swap_buffers(&mut self) {
        self.probe.swaps.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&mut self) {}

    fn readback(&mut self, rect: ReadbackRect) -> Option<Vec<u8>> {
        Some(vec![READBACK_FILL; rect.byte_len()])
    }

    fn uploader(&mut self) -> &mut dyn Uploader {
        self
    }

    fn poll_swap_acks(&mut self) -> usize {
        self.probe.swap_acks.swap(0, Ordering::SeqCst)
    }

    fn has_unconfirmed_uploads(&self) -> bool {
        self.probe.unconfirmed_uploads.load(Ordering::SeqCst)
    }

    fn context_lost(&self) -> bool {
        self.probe.context_lost.load(Ordering::SeqCst)
    }
}

impl Uploader for FakeRenderer {
    fn upload(&mut self, job: &UploadJob) {
        self.probe.uploads.lock().unwrap().push(job.backing);
    }

    fn flush(&mut self) {
        self.probe.flushes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FactoryProbe {
    pub attempts: AtomicUsize,
    pub failures_remaining: AtomicUsize,
}

/// Renderer factory that fails a configurable number of times before
/// handing out renderers sharing one probe.
pub struct FakeRendererFactory {
    pub probe: Arc<FactoryProbe>,
    pub renderer: Arc<RendererProbe>,
}

impl FakeRendererFactory {
    pub fn new(renderer: Arc<RendererProbe>) -> (Self, Arc<FactoryProbe>) {
        let probe = Arc::new(FactoryProbe {
            attempts: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
        });
        (
            Self {
                probe: probe.clone(),
                renderer,
            },
            probe,
        )
    }
}

impl RendererFactory for FakeRendererFactory {
    fn create_renderer(&mut self) -> Result<Box<dyn Renderer>, RendererInitError> {
        self.probe.attempts.fetch_add(1, Ordering::SeqCst);
        if self.probe.failures_remaining.load(Ordering::SeqCst) > 0 {
            self.probe.failures_remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(RendererInitError::ContextCreationFailed);
        }
        Ok(Box::new(FakeRenderer {
            probe: self.renderer.clone(),
        }))
    }
}
