use std::time::{Duration, Instant};

/// Paces draw ticks at a target interval and predicts when the next draw
/// will happen so resource uploads know their time budget.
///
/// An interval of zero means unthrottled: ticks fire on demand as soon as
/// the consumer loop asks for one.
#[derive(Debug, Clone)]
pub struct FrameRateController {
    timebase: Instant,
    interval: Duration,
    /// Frames submitted to the surface but not yet acknowledged.
    pending_swaps: usize,
    max_pending_swaps: usize,
    swap_complete_supported: bool,
}

pub const DEFAULT_MAX_PENDING_SWAPS: usize = 2;

impl FrameRateController {
    pub fn new(timebase: Instant, interval: Duration) -> Self {
        Self {
            timebase,
            interval,
            pending_swaps: 0,
            max_pending_swaps: DEFAULT_MAX_PENDING_SWAPS,
            swap_complete_supported: false,
        }
    }

    /// On-demand pacing, used when vsync throttling is disabled.
    pub fn unthrottled(timebase: Instant) -> Self {
        Self::new(timebase, Duration::ZERO)
    }

    pub fn set_timebase_and_interval(&mut self, timebase: Instant, interval: Duration) {
        self.timebase = timebase;
        self.interval = interval;
    }

    pub fn set_max_pending_swaps(&mut self, max: usize) {
        assert!(max > 0, "max pending swaps must be greater than zero");
        self.max_pending_swaps = max;
    }

    pub fn set_swap_complete_supported(&mut self, supported: bool) {
        self.swap_complete_supported = supported;
        if !supported {
            self.pending_swaps = 0;
        }
    }

    /// The first tick boundary at or after `now`.
    pub fn next_tick_time(&self, now: Instant) -> Instant {
        if self.interval.is_zero() {
            return now;
        }
        let elapsed = now.saturating_duration_since(self.timebase);
        let interval_nanos = self.interval.as_nanos().max(1);
        let intervals_elapsed = elapsed.as_nanos() / interval_nanos;
        let mut tick =
            self.timebase + Duration::from_nanos((intervals_elapsed * interval_nanos) as u64);
        if tick < now {
            tick += self.interval;
        }
        tick
    }

    /// When the next draw is expected to start. Uploads scheduled now may
    /// run until this point without delaying a frame.
    pub fn anticipated_draw_time(&self, now: Instant) -> Instant {
        self.next_tick_time(now)
    }

    /// Whether a new frame may be produced, or the surface is saturated
    /// with unacknowledged swaps.
    pub fn tick_permitted(&self) -> bool {
        !self.swap_complete_supported || self.pending_swaps < self.max_pending_swaps
    }

    /// Whether any submitted frame is still awaiting its swap ack.
    pub fn has_pending_swaps(&self) -> bool {
        self.pending_swaps > 0
    }

    pub fn did_swap_buffers(&mut self) {
        if self.swap_complete_supported {
            self.pending_swaps += 1;
        }
    }

    pub fn did_swap_buffers_complete(&mut self) {
        if self.swap_complete_supported {
            self.pending_swaps = self.pending_swaps.saturating_sub(1);
        }
    }
}
