//! Message enums crossing the producer/consumer thread boundary. Blocking
//! operations carry the signal half of a rendezvous; one-way notifications
//! carry plain data.

use std::time::{Duration, Instant};

use protocol::{
    BackingId, BeginFrameState, ReadbackRect, RendererCapabilities, RendererInitError,
    ResourcePriority, SceneTree,
};
use resources::ResourceUpdateQueue;
use threads::RendezvousSignal;

use crate::Renderer;

/// Producer -> consumer.
pub(crate) enum CompositorMsg {
    InitializeRenderer {
        renderer: Box<dyn Renderer>,
        done: RendezvousSignal<Result<RendererCapabilities, RendererInitError>>,
    },
    RecreateRenderer {
        renderer: Box<dyn Renderer>,
        done: RendezvousSignal<Result<RendererCapabilities, RendererInitError>>,
    },
    SetNeedsCommit,
    SetNeedsRedraw,
    SetVisible {
        visible: bool,
        done: RendezvousSignal<()>,
    },
    SetFrameRate {
        timebase: Instant,
        interval: Duration,
    },
    SetMemoryAllocationLimit {
        bytes: usize,
    },
    CreateBacking {
        id: BackingId,
        size_bytes: usize,
        priority: ResourcePriority,
    },
    DeleteBacking {
        id: BackingId,
    },
    /// The producer finished its update pass; the commit signal is held
    /// until the frame's content is safely owned by the consumer.
    BeginFrameComplete {
        tree: SceneTree,
        queue: ResourceUpdateQueue,
        commit: RendezvousSignal<()>,
    },
    BeginFrameAborted,
    /// Begin a frame regardless of visibility, replying with begin-frame
    /// state directly instead of posting it.
    ForceBeginFrame {
        reply: RendezvousSignal<BeginFrameState>,
    },
    RequestReadback {
        rect: ReadbackRect,
        reply: RendezvousSignal<Option<Vec<u8>>>,
    },
    AcquireResources {
        done: RendezvousSignal<()>,
    },
    CommitPendingQuery {
        reply: RendezvousSignal<bool>,
    },
    FinishAllRendering {
        done: RendezvousSignal<()>,
    },
    Shutdown {
        done: RendezvousSignal<()>,
    },
}

/// Consumer -> producer.
pub(crate) enum SceneMsg {
    BeginFrame(BeginFrameState),
    DidCommitAndDrawFrame,
    DidCompleteSwapBuffers,
    DidLoseOutputSurface,
}
