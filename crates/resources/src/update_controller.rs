//! Drains one frame's upload queue across multiple ticks, bounded by the
//! time remaining until the anticipated draw.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use protocol::BackingId;

use crate::{ResourceUpdateQueue, UploadJob};

/// The uploader is flushed after this many consecutive uploads so the GPU
/// pipeline never sits on a long unflushed run.
pub const FLUSH_PERIOD: usize = 4;

/// Partial uploads allowed per frame; jobs past the cap are promoted to
/// full uploads so one frame cannot monopolize partial-update bandwidth.
pub const MAX_PARTIAL_UPDATES_PER_FRAME: usize = 12;

/// Conservative per-upload cost used to decide how many jobs fit before a
/// deadline.
pub const DEFAULT_UPLOAD_TIME_ESTIMATE: Duration = Duration::from_micros(1000);

/// Performs the actual GPU transfer for a job. Implemented by the renderer;
/// faked in tests.
pub trait Uploader {
    fn upload(&mut self, job: &UploadJob);
    fn flush(&mut self);
}

/// Owns one frame's upload queue and feeds it to an [`Uploader`] in
/// deadline-sized slices.
#[derive(Debug)]
pub struct ResourceUpdateController {
    queue: ResourceUpdateQueue,
    upload_time_estimate: Duration,
    uploads_since_flush: usize,
}

impl ResourceUpdateController {
    pub fn new(mut queue: ResourceUpdateQueue) -> Self {
        queue.promote_partial_overflow(MAX_PARTIAL_UPDATES_PER_FRAME);
        Self {
            queue,
            upload_time_estimate: DEFAULT_UPLOAD_TIME_ESTIMATE,
            uploads_since_flush: 0,
        }
    }

    pub fn set_upload_time_estimate(&mut self, estimate: Duration) {
        assert!(!estimate.is_zero(), "upload time estimate must be non-zero");
        self.upload_time_estimate = estimate;
    }

    pub fn has_more_updates(&self) -> bool {
        self.queue.has_more_uploads()
    }

    /// Drop queued jobs that target just-evicted backings. Called before
    /// any further draining so uploads never land in freed memory.
    pub fn discard_uploads_to_evicted_resources(&mut self, evicted: &HashSet<BackingId>) {
        self.queue.clear_uploads_to_evicted_resources(evicted);
    }

    /// Upload as many jobs as fit before `deadline`, judged by the
    /// per-upload estimate. Returns true once the queue is fully drained
    /// (the "ready to finalize" condition).
    pub fn perform_more_updates(
        &mut self,
        uploader: &mut dyn Uploader,
        now: Instant,
        deadline: Instant,
    ) -> bool {
        let budget = deadline.saturating_duration_since(now);
        // At least one upload per call, so a starved budget still makes
        // progress instead of stalling the drain forever.
        let mut fits =
            ((budget.as_nanos() / self.upload_time_estimate.as_nanos().max(1)) as usize).max(1);

        while fits > 0 {
            let Some(job) = self.take_next_upload() else {
                break;
            };
            self.upload_one(uploader, &job);
            fits -= 1;
        }
        if !self.queue.has_more_uploads() {
            self.flush_if_dirty(uploader);
            return true;
        }
        false
    }

    /// Drain the remainder unconditionally. Used when the draw cannot be
    /// delayed any further.
    pub fn finalize(&mut self, uploader: &mut dyn Uploader) {
        while let Some(job) = self.take_next_upload() {
            self.upload_one(uploader, &job);
        }
        self.flush_if_dirty(uploader);
    }

    fn take_next_upload(&mut self) -> Option<UploadJob> {
        self.queue
            .take_first_full_upload()
            .or_else(|| self.queue.take_first_partial_upload())
    }

    fn upload_one(&mut self, uploader: &mut dyn Uploader, job: &UploadJob) {
        uploader.upload(job);
        self.uploads_since_flush += 1;
        if self.uploads_since_flush == FLUSH_PERIOD {
            self.flush_if_dirty(uploader);
        }
    }

    fn flush_if_dirty(&mut self, uploader: &mut dyn Uploader) {
        if self.uploads_since_flush > 0 {
            uploader.flush();
            self.uploads_since_flush = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UploadKind;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Upload(BackingId),
        Flush,
    }

    #[derive(Default)]
    struct RecordingUploader {
        events: Vec<Event>,
    }

    impl Uploader for RecordingUploader {
        fn upload(&mut self, job: &UploadJob) {
            self.events.push(Event::Upload(job.backing));
        }

        fn flush(&mut self) {
            self.events.push(Event::Flush);
        }
    }

    fn queue_with_full_uploads(count: u64) -> ResourceUpdateQueue {
        let mut queue = ResourceUpdateQueue::new();
        for id in 1..=count {
            queue.append_full_upload(UploadJob {
                backing: BackingId(id),
                kind: UploadKind::Full,
                bytes: 64,
            });
        }
        queue
    }

    #[test]
    fn deadline_bounds_the_number_of_uploads() {
        let mut controller = ResourceUpdateController::new(queue_with_full_uploads(10));
        controller.set_upload_time_estimate(Duration::from_millis(1));
        let mut uploader = RecordingUploader::default();

        let now = Instant::now();
        let finished = controller.perform_more_updates(
            &mut uploader,
            now,
            now + Duration::from_micros(2500),
        );

        assert!(!finished);
        let uploads = uploader
            .events
            .iter()
            .filter(|e| matches!(e, Event::Upload(_)))
            .count();
        assert_eq!(uploads, 2, "only two 1ms uploads fit a 2.5ms budget");
        assert!(controller.has_more_updates());
    }

    #[test]
    fn finalize_drains_everything_with_periodic_flushes() {
        let mut controller = ResourceUpdateController::new(queue_with_full_uploads(10));
        let mut uploader = RecordingUploader::default();
        controller.finalize(&mut uploader);

        assert!(!controller.has_more_updates());
        let flushes = uploader.events.iter().filter(|e| **e == Event::Flush).count();
        assert_eq!(flushes, 3, "10 uploads flush after 4, 8 and the tail");

        // Never two flushes back to back, never more than FLUSH_PERIOD
        // uploads without a flush.
        let mut dangling = 0usize;
        let mut previous_was_flush = false;
        for event in &uploader.events {
            match event {
                Event::Upload(_) => {
                    dangling += 1;
                    assert!(dangling <= FLUSH_PERIOD);
                    previous_was_flush = false;
                }
                Event::Flush => {
                    assert!(!previous_was_flush, "back-to-back flushes");
                    dangling = 0;
                    previous_was_flush = true;
                }
            }
        }
        assert_eq!(uploader.events.last(), Some(&Event::Flush));
    }

    #[test]
    fn drained_queue_reports_ready_and_stays_ready() {
        let mut controller = ResourceUpdateController::new(queue_with_full_uploads(2));
        controller.set_upload_time_estimate(Duration::from_micros(10));
        let mut uploader = RecordingUploader::default();

        let now = Instant::now();
        let deadline = now + Duration::from_millis(1);
        assert!(controller.perform_more_updates(&mut uploader, now, deadline));
        assert!(controller.perform_more_updates(&mut uploader, now, deadline));
        let uploads = uploader
            .events
            .iter()
            .filter(|e| matches!(e, Event::Upload(_)))
            .count();
        assert_eq!(uploads, 2);
    }

    #[test]
    fn jobs_to_evicted_backings_are_discarded_not_uploaded() {
        let mut queue = ResourceUpdateQueue::new();
        for id in [1u64, 2, 3] {
            queue.append_full_upload(UploadJob {
                backing: BackingId(id),
                kind: UploadKind::Full,
                bytes: 64,
            });
        }
        let mut controller = ResourceUpdateController::new(queue);

        let mut evicted = HashSet::new();
        evicted.insert(BackingId(2));
        controller.discard_uploads_to_evicted_resources(&evicted);

        let mut uploader = RecordingUploader::default();
        controller.finalize(&mut uploader);
        let uploaded: Vec<BackingId> = uploader
            .events
            .iter()
            .filter_map(|e| match e {
                Event::Upload(id) => Some(*id),
                Event::Flush => None,
            })
            .collect();
        assert_eq!(uploaded, vec![BackingId(1), BackingId(3)]);
    }

    #[test]
    fn partial_overflow_is_promoted_to_full_uploads() {
        let mut queue = ResourceUpdateQueue::new();
        for id in 0..(MAX_PARTIAL_UPDATES_PER_FRAME as u64 + 3) {
            queue.append_partial_upload(UploadJob {
                backing: BackingId(id),
                kind: UploadKind::Partial,
                bytes: 16,
            });
        }
        let controller = ResourceUpdateController::new(queue);
        assert_eq!(
            controller.queue.partial_upload_count(),
            MAX_PARTIAL_UPDATES_PER_FRAME
        );
        assert_eq!(controller.queue.full_upload_count(), 3);
    }
}
