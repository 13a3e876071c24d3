//! Two-thread compositing coordinator.
//!
//! The producer thread owns scene content and layout; the consumer thread
//! owns the scheduler, GPU resources and drawing. [`Coordinator`] is the
//! producer-side handle: it spawns the consumer thread, relays frame and
//! commit requests, and blocks the producer at exactly the points where the
//! two threads must agree on shared state (commit, visibility, resource
//! acquisition, renderer initialization).
//!
//! The host supplies three capabilities: a [`SceneUpdater`] that mutates
//! and repaints producer-side content, a [`FrameObserver`] that hears about
//! frame lifecycle milestones, and a [`RendererFactory`] that produces
//! renderers for the consumer thread to drive.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use protocol::{
    ReadbackRect, RendererCapabilities, RendererInitError, SceneTree, ScrollAndScaleSet,
    ViewTransform,
};
use resources::{DEFAULT_UPLOAD_TIME_ESTIMATE, ResourceUpdateQueue, Uploader};

mod compositor_core;
mod coordinator;
mod messages;

#[cfg(test)]
mod test_support;

pub use coordinator::{CommitStats, Coordinator};

/// Producer-side scene content. Called only on the thread that owns the
/// [`Coordinator`], always from inside a begin-frame cycle, in the order
/// listed here.
pub trait SceneUpdater {
    /// Fold the consumer's accumulated scroll and pinch state into the
    /// scene before layout runs.
    fn apply_scroll_and_scale(&mut self, scroll: &ScrollAndScaleSet, view: &ViewTransform);

    fn animate(&mut self, frame_time: Instant);

    fn layout(&mut self);

    /// Repaint dirty content into `queue` and describe the resulting frame.
    /// `memory_limit_bytes` is the consumer's current allocation budget.
    fn update_layers(
        &mut self,
        queue: &mut ResourceUpdateQueue,
        memory_limit_bytes: usize,
    ) -> SceneTree;
}

/// Frame lifecycle notifications, delivered on the producer thread. All
/// methods default to no-ops so hosts implement only what they care about.
pub trait FrameObserver {
    fn will_begin_frame(&mut self) {}
    fn did_commit(&mut self) {}
    /// The most recent commit has been drawn and swapped.
    fn did_commit_and_draw_frame(&mut self) {}
    fn did_complete_swap_buffers(&mut self) {}
    fn did_lose_output_surface(&mut self) {}
    fn did_recreate_output_surface(&mut self) {}
}

/// Creates renderers on the producer thread; each renderer is moved to the
/// consumer thread and initialized there, where its context lives.
pub trait RendererFactory {
    fn create_renderer(&mut self) -> Result<Box<dyn Renderer>, RendererInitError>;
}

/// Consumer-thread drawing surface. Everything after `initialize` runs on
/// the consumer thread only.
pub trait Renderer: Send {
    /// Bind the context on the consumer thread and report capabilities.
    fn initialize(&mut self) -> Result<RendererCapabilities, RendererInitError>;

    /// Draw the tree. Returning false means no frame was produced; the
    /// scheduler retries on a later tick.
    fn draw_frame(&mut self, tree: &SceneTree) -> bool;

    fn swap_buffers(&mut self);

    /// Block until all submitted rendering has completed.
    fn finish(&mut self);

    /// Read back the given region as tightly packed RGBA8.
    fn readback(&mut self, rect: ReadbackRect) -> Option<Vec<u8>>;

    fn uploader(&mut self) -> &mut dyn Uploader;

    /// Swap acknowledgements that arrived since the last poll. Only
    /// meaningful when capabilities report a swap-complete callback.
    fn poll_swap_acks(&mut self) -> usize {
        0
    }

    /// Whether uploads needing asynchronous confirmation are still in
    /// flight. A pending tree cannot activate until this clears.
    fn has_unconfirmed_uploads(&self) -> bool {
        false
    }

    fn context_lost(&self) -> bool {
        false
    }
}

/// Tunables fixed at coordinator start.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Target interval between draw ticks. Zero means unthrottled.
    pub refresh_interval: Duration,
    /// Initial GPU memory budget handed to the resource manager.
    pub memory_allocation_limit_bytes: usize,
    /// Capacity of the evict-oldest scroll input ring.
    pub scroll_ring_capacity: usize,
    /// Per-upload cost estimate used to slice upload work against frame
    /// deadlines.
    pub upload_time_estimate: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_micros(16_667),
            memory_allocation_limit_bytes: 128 * 1024 * 1024,
            scroll_ring_capacity: 64,
            upload_time_estimate: DEFAULT_UPLOAD_TIME_ESTIMATE,
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorError {
    /// The consumer thread could not be spawned.
    ThreadSpawn(io::Error),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::ThreadSpawn(err) => {
                write!(f, "failed to spawn compositor thread: {err}")
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<io::Error> for CoordinatorError {
    fn from(err: io::Error) -> Self {
        CoordinatorError::ThreadSpawn(err)
    }
}
