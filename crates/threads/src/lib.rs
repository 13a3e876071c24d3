//! Cross-thread plumbing shared by the producer and consumer threads:
//! the one-shot rendezvous latch behind every blocking coordinator call,
//! cancellation tokens checked at task execution time, and a lock-free
//! evict-oldest ring for scroll input samples.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use crossbeam_queue::ArrayQueue;
use protocol::ScrollDelta;

/// Create the two halves of a one-shot cross-thread latch.
///
/// The blocking caller keeps the wait half and posts the signal half to the
/// other thread inside a message. Both halves are consumed on use, so
/// signalling twice or waiting twice is unrepresentable.
pub fn rendezvous<T>() -> (RendezvousSignal<T>, RendezvousWait<T>) {
    // Capacity 1 so the signaller never blocks on a waiter that has not
    // reached `wait()` yet.
    let (sender, receiver) = bounded(1);
    (RendezvousSignal { sender }, RendezvousWait { receiver })
}

/// Signal half of a rendezvous. Sent across the thread boundary inside the
/// message that requested the blocking operation.
pub struct RendezvousSignal<T> {
    sender: Sender<T>,
}

impl<T> RendezvousSignal<T> {
    /// Deliver the result and wake the waiter. Consumes the signal half.
    ///
    /// A waiter that already gave up (dropped its half) is tolerated: the
    /// value is dropped. That only happens on teardown paths.
    pub fn signal(self, value: T) {
        let _ = self.sender.send(value);
    }
}

impl<T> std::fmt::Debug for RendezvousSignal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RendezvousSignal")
    }
}

/// Wait half of a rendezvous, kept by the blocking caller.
pub struct RendezvousWait<T> {
    receiver: Receiver<T>,
}

impl<T> std::fmt::Debug for RendezvousWait<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RendezvousWait")
    }
}

impl<T> RendezvousWait<T> {
    /// Block until the other thread signals. Consumes the wait half.
    pub fn wait(self) -> T {
        match self.receiver.recv() {
            Ok(value) => value,
            Err(_) => panic!("rendezvous signal half dropped without signalling"),
        }
    }

    /// Block for at most `timeout`. On timeout the wait half is handed back
    /// so the caller can service other work and retry.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => {
                panic!("rendezvous signal half dropped without signalling")
            }
        }
    }
}

/// Shared flag that turns already-queued work into a no-op once cancelled.
///
/// Cloning yields another handle to the same flag. Tasks capture a clone
/// when posted and check it when they finally run, decoupling cancellation
/// from object lifetime.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

// The scroll ring is single-producer, single-consumer by construction: the
// Arc inside the writer and drain halves is never exposed.
struct SharedScrollRing {
    // Input-side writes are lock-free; when full we evict oldest and keep
    // newest.
    queue: ArrayQueue<ScrollDelta>,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

/// Create a scroll-input ring of the given capacity.
///
/// Input events arriving on any thread are pushed through the writer; the
/// consumer thread drains the samples when it assembles begin-frame state.
pub fn scroll_ring(capacity: usize) -> (ScrollRingWriter, ScrollRingDrain) {
    assert!(capacity > 0, "scroll ring capacity must be greater than zero");
    let shared = Arc::new(SharedScrollRing {
        queue: ArrayQueue::new(capacity),
        dropped: AtomicU64::new(0),
        pushed: AtomicU64::new(0),
    });
    (
        ScrollRingWriter {
            shared: shared.clone(),
        },
        ScrollRingDrain { shared },
    )
}

pub struct ScrollRingWriter {
    shared: Arc<SharedScrollRing>,
}

impl ScrollRingWriter {
    pub fn push(&self, sample: ScrollDelta) {
        let mut pending_sample = sample;
        loop {
            match self.shared.queue.push(pending_sample) {
                Ok(()) => {
                    self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(returned_sample) => {
                    pending_sample = returned_sample;
                    if self.shared.queue.pop().is_some() {
                        self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        std::thread::yield_now();
                    }
                }
            }
        }
    }

    pub fn dropped_samples(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

pub struct ScrollRingDrain {
    shared: Arc<SharedScrollRing>,
}

impl ScrollRingDrain {
    /// Pop every queued sample into `output`. Appends; the caller clears.
    pub fn drain(&self, output: &mut Vec<ScrollDelta>) {
        while let Some(sample) = self.shared.queue.pop() {
            output.push(sample);
        }
    }

    pub fn pushed_samples(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}
