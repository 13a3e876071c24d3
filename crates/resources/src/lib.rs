//! Consumer-thread GPU resource bookkeeping: priority-tagged backings with
//! eviction under memory pressure, and the upload work queue the producer
//! hands across at commit time.

pub mod update_controller;

pub use update_controller::{
    DEFAULT_UPLOAD_TIME_ESTIMATE, FLUSH_PERIOD, MAX_PARTIAL_UPDATES_PER_FRAME,
    ResourceUpdateController, Uploader,
};

use std::collections::{HashMap, HashSet};

use protocol::{BackingId, ResourcePriority};

/// One GPU-resident allocation tracked by the manager.
#[derive(Debug, Clone, Copy)]
pub struct Backing {
    pub size_bytes: usize,
    pub priority: ResourcePriority,
    /// Still referenced by producer-visible state. Unlinked backings are
    /// safe to evict first; evicting a linked one forces a re-commit.
    pub linked: bool,
}

/// Tracks resource backings by eviction priority and enforces memory
/// limits. Owned exclusively by the consumer thread.
#[derive(Debug, Default)]
pub struct PrioritizedResourceManager {
    backings: HashMap<BackingId, Backing>,
    memory_use_bytes: usize,
    evicted: HashSet<BackingId>,
    evicted_linked_backing: bool,
}

impl PrioritizedResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_backing(&mut self, id: BackingId, backing: Backing) {
        let replaced = self.backings.insert(id, backing);
        assert!(replaced.is_none(), "backing registered twice: {id:?}");
        self.memory_use_bytes += backing.size_bytes;
    }

    pub fn set_priority(&mut self, id: BackingId, priority: ResourcePriority) {
        if let Some(backing) = self.backings.get_mut(&id) {
            backing.priority = priority;
        }
    }

    pub fn set_linked(&mut self, id: BackingId, linked: bool) {
        if let Some(backing) = self.backings.get_mut(&id) {
            backing.linked = linked;
        }
    }

    /// Relink the whole backing set to one committed tree: exactly the
    /// referenced backings become linked, everything else unlinks.
    pub fn set_linked_references(&mut self, referenced: &[BackingId]) {
        for (id, backing) in &mut self.backings {
            backing.linked = referenced.contains(id);
        }
    }

    pub fn unregister_backing(&mut self, id: BackingId) {
        if let Some(backing) = self.backings.remove(&id) {
            self.memory_use_bytes -= backing.size_bytes;
        }
        self.evicted.remove(&id);
    }

    pub fn memory_use_bytes(&self) -> usize {
        self.memory_use_bytes
    }

    pub fn contains(&self, id: BackingId) -> bool {
        self.backings.contains_key(&id)
    }

    pub fn is_evicted(&self, id: BackingId) -> bool {
        self.evicted.contains(&id)
    }

    /// Evict backings in ascending priority order until usage fits under
    /// `limit_bytes` or only backings at-or-above `priority_cutoff` remain.
    /// Returns whether anything was evicted.
    pub fn reduce_memory(&mut self, limit_bytes: usize, priority_cutoff: ResourcePriority) -> bool {
        if self.memory_use_bytes <= limit_bytes {
            return false;
        }

        let mut candidates: Vec<(ResourcePriority, BackingId)> = self
            .backings
            .iter()
            .filter(|(_, backing)| backing.priority < priority_cutoff)
            .map(|(id, backing)| (backing.priority, *id))
            .collect();
        candidates.sort();

        let mut evicted_any = false;
        for (_, id) in candidates {
            if self.memory_use_bytes <= limit_bytes {
                break;
            }
            let Some(backing) = self.backings.remove(&id) else {
                continue;
            };
            self.memory_use_bytes -= backing.size_bytes;
            if backing.linked {
                self.evicted_linked_backing = true;
            }
            self.evicted.insert(id);
            evicted_any = true;
        }
        evicted_any
    }

    /// Whether any backing the producer's last-committed state still
    /// depends on has been evicted. When true, the next commit cycle must
    /// be re-requested so the producer re-supplies that content.
    pub fn linked_evicted_backings_exist(&self) -> bool {
        self.evicted_linked_backing
    }

    pub fn evicted_backings(&self) -> &HashSet<BackingId> {
        &self.evicted
    }

    /// Forget the evicted set once a commit has re-supplied the content.
    pub fn clear_evicted_backings(&mut self) {
        self.evicted.clear();
        self.evicted_linked_backing = false;
    }
}

/// Upload granularity. Partial uploads touch a sub-region of a backing and
/// are cheap individually but capped per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Full,
    Partial,
}

/// One raster/upload job produced by the producer for a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadJob {
    pub backing: BackingId,
    pub kind: UploadKind,
    pub bytes: usize,
}

/// Ordered upload work for one frame. Built by the producer thread, then
/// ownership transfers wholesale in the begin-frame-complete message.
#[derive(Debug, Default)]
pub struct ResourceUpdateQueue {
    full: Vec<UploadJob>,
    partial: Vec<UploadJob>,
    next_full: usize,
    next_partial: usize,
}

impl ResourceUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_full_upload(&mut self, job: UploadJob) {
        debug_assert_eq!(job.kind, UploadKind::Full);
        self.full.push(job);
    }

    pub fn append_partial_upload(&mut self, job: UploadJob) {
        debug_assert_eq!(job.kind, UploadKind::Partial);
        self.partial.push(job);
    }

    pub fn full_upload_count(&self) -> usize {
        self.full.len() - self.next_full
    }

    pub fn partial_upload_count(&self) -> usize {
        self.partial.len() - self.next_partial
    }

    pub fn has_more_uploads(&self) -> bool {
        self.full_upload_count() > 0 || self.partial_upload_count() > 0
    }

    pub fn take_first_full_upload(&mut self) -> Option<UploadJob> {
        if self.next_full < self.full.len() {
            let job = self.full[self.next_full];
            self.next_full += 1;
            Some(job)
        } else {
            None
        }
    }

    pub fn take_first_partial_upload(&mut self) -> Option<UploadJob> {
        if self.next_partial < self.partial.len() {
            let job = self.partial[self.next_partial];
            self.next_partial += 1;
            Some(job)
        } else {
            None
        }
    }

    /// Reclassify partial jobs beyond `cap` as full uploads. Called once
    /// when the queue is handed to the update controller.
    pub fn promote_partial_overflow(&mut self, cap: usize) {
        debug_assert_eq!(self.next_partial, 0, "promotion after draining started");
        while self.partial.len() > cap {
            let mut job = match self.partial.pop() {
                Some(job) => job,
                None => break,
            };
            job.kind = UploadKind::Full;
            self.full.push(job);
        }
    }

    /// Drop queued jobs whose target backing has been evicted; uploading
    /// into freed memory would be wasted work at best.
    pub fn clear_uploads_to_evicted_resources(&mut self, evicted: &HashSet<BackingId>) {
        let next_full = self.next_full;
        self.full.retain_with_index(next_full, evicted);
        let next_partial = self.next_partial;
        self.partial.retain_with_index(next_partial, evicted);
    }
}

// retain() would shift the already-consumed prefix; only the unconsumed
// tail is filtered.
trait RetainTail {
    fn retain_with_index(&mut self, from: usize, evicted: &HashSet<BackingId>);
}

impl RetainTail for Vec<UploadJob> {
    fn retain_with_index(&mut self, from: usize, evicted: &HashSet<BackingId>) {
        let tail: Vec<UploadJob> = self
            .drain(from..)
            .filter(|job| !evicted.contains(&job.backing))
            .collect();
        self.extend(tail);
    }
}
