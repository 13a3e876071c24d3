//! Value types that cross the producer/consumer thread boundary.
//!
//! Everything here is plain data: no channels, no locks. Ownership of these
//! values transfers wholesale when they are posted to the other thread.

use std::time::Instant;

use smallvec::SmallVec;

/// Identifies one GPU resource backing. Allocated by the producer, resolved
/// by the consumer-side resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackingId(pub u64);

/// Eviction priority of a resource backing. Higher values survive memory
/// pressure longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResourcePriority(pub i32);

impl ResourcePriority {
    /// Cutoff that permits evicting every backing.
    pub const ALLOW_EVERYTHING: ResourcePriority = ResourcePriority(i32::MAX);
    /// Backings that are required for the currently visible content.
    pub const VISIBLE: ResourcePriority = ResourcePriority(100);
    /// Prefetched / offscreen content, first to go under pressure.
    pub const NICE_TO_HAVE: ResourcePriority = ResourcePriority(0);
}

/// Scroll delta accumulated on the consumer thread for one layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollDelta {
    pub layer_id: u64,
    pub delta_x: f32,
    pub delta_y: f32,
}

/// The consumer-side input state handed to the producer at begin-frame:
/// per-layer scroll deltas plus the page scale change since the last frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollAndScaleSet {
    pub scrolls: SmallVec<[ScrollDelta; 4]>,
    pub page_scale_delta: f32,
}

impl Default for ScrollAndScaleSet {
    fn default() -> Self {
        Self {
            scrolls: SmallVec::new(),
            page_scale_delta: 1.0,
        }
    }
}

impl ScrollAndScaleSet {
    pub fn is_identity(&self) -> bool {
        self.scrolls.is_empty() && self.page_scale_delta == 1.0
    }

    /// Fold a newer delta set into this one. Per-layer scrolls add,
    /// page scale deltas multiply.
    pub fn accumulate(&mut self, newer: &ScrollAndScaleSet) {
        for incoming in &newer.scrolls {
            match self
                .scrolls
                .iter_mut()
                .find(|existing| existing.layer_id == incoming.layer_id)
            {
                Some(existing) => {
                    existing.delta_x += incoming.delta_x;
                    existing.delta_y += incoming.delta_y;
                }
                None => self.scrolls.push(*incoming),
            }
        }
        self.page_scale_delta *= newer.page_scale_delta;
    }
}

/// Transform applied by the consumer thread on top of the committed scene
/// (e.g. an in-progress pinch), reported back so producer-side layout can
/// account for it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransform {
    pub scale: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }
}

/// Snapshot of consumer-thread state that seeds one producer update pass.
/// Posted consumer -> producer when the scheduler begins a frame.
#[derive(Debug, Clone)]
pub struct BeginFrameState {
    pub frame_begin_time: Instant,
    pub scroll_and_scale: ScrollAndScaleSet,
    pub view_transform: ViewTransform,
    pub memory_allocation_limit_bytes: usize,
}

/// Immutable-once-committed description of what to draw. The consumer holds
/// at most one active and one pending instance at a time.
#[derive(Debug, Clone)]
pub struct SceneTree {
    pub source_frame_number: u64,
    /// Backings this tree's content visually depends on. Eviction of any of
    /// these must trigger a re-commit.
    pub referenced_backings: SmallVec<[BackingId; 8]>,
    /// True for resource kinds that need asynchronous upload confirmation
    /// before the producer may resume mutating shared state; the commit
    /// rendezvous is held until this tree activates.
    pub requires_upload_confirmation: bool,
}

/// Capabilities reported by a successfully initialized renderer, copied back
/// to the producer thread through the init rendezvous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererCapabilities {
    pub max_texture_size: u32,
    pub using_swap_complete_callback: bool,
    pub allow_partial_texture_updates: bool,
    /// Surfaces nested under a parent compositor throttle to one pending
    /// frame.
    pub has_parent_compositor: bool,
}

impl Default for RendererCapabilities {
    fn default() -> Self {
        Self {
            max_texture_size: 2048,
            using_swap_complete_callback: false,
            allow_partial_texture_updates: true,
            has_parent_compositor: false,
        }
    }
}

/// Pixel region for a synchronous readback, in surface coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadbackRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl ReadbackRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// RGBA8 byte length of the region.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

/// Why renderer initialization failed. Marshalled back to the producer as
/// plain data; the caller decides whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RendererInitError {
    /// No output surface has been handed to the consumer thread yet.
    SurfaceUnavailable,
    /// The surface's context could not be created or was already lost.
    ContextCreationFailed,
    /// A one-shot allocation failed while building renderer state.
    OutOfMemory,
}
