//! Work items
//!
//! A work item ties one compile request to its function body, its target
//! entry point, and the immutable profile snapshot gathered for it. Items
//! are owned by the scheduler; the job queue only sees their ids.

use crate::data::{snapshot_registry, CodeGenData, SnapshotId};
use brio_core::profile::ValueType;
use brio_core::{EntryPoint, FunctionBody, FunctionInstance, JitMode, LoopId};
use brio_jobs::JobId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type WorkItemId = JobId;

/// What is being compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItemKind {
    /// The whole function body.
    Function,
    /// One loop body, compiled against the value types observed live in
    /// the interpreter frame that requested it.
    LoopBody {
        loop_id: LoopId,
        seed_types: Vec<ValueType>,
    },
}

/// Where the item currently sits. Owned by the scheduler; the processor
/// never inspects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    NotInQueue,
    /// Parked on the scheduler's unscheduled list, not yet admitted.
    InForegroundQueue,
    /// Admitted to the job processor.
    InJitQueue,
}

#[derive(Debug)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub body: Arc<FunctionBody>,
    pub kind: WorkItemKind,
    pub entry_point: Arc<EntryPoint>,
    /// Set exactly once, when the item is admitted to the queue.
    jit_mode: Mutex<Option<JitMode>>,
    /// The gathered profile snapshot this compile reads. Registered so
    /// helper-path lookups can resolve it by id; unregistered on drop.
    snapshot: Mutex<Option<(SnapshotId, Arc<CodeGenData>)>>,
    pub queue_state: Mutex<QueueState>,
    pub queued_at: Instant,
    /// Set when the caller demanded this compile regardless of heuristics.
    pub forced: bool,
    /// The closure the request came from, when one was supplied. Its
    /// per-closure caches override the shared body-level ones at gather
    /// time.
    live: Mutex<Option<Arc<FunctionInstance>>>,
    /// Admission control declined the item at processing time; the entry
    /// point stays queued rather than failing.
    dropped: AtomicBool,
}

impl WorkItem {
    pub fn new(
        id: WorkItemId,
        body: Arc<FunctionBody>,
        kind: WorkItemKind,
        entry_point: Arc<EntryPoint>,
        forced: bool,
    ) -> Self {
        Self {
            id,
            body,
            kind,
            entry_point,
            jit_mode: Mutex::new(None),
            snapshot: Mutex::new(None),
            queue_state: Mutex::new(QueueState::NotInQueue),
            queued_at: Instant::now(),
            forced,
            live: Mutex::new(None),
            dropped: AtomicBool::new(false),
        }
    }

    pub fn set_live_instance(&self, instance: Arc<FunctionInstance>) {
        *self.live.lock() = Some(instance);
    }

    pub fn live_instance(&self) -> Option<Arc<FunctionInstance>> {
        self.live.lock().clone()
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Relaxed);
    }

    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_loop_body(&self) -> bool {
        matches!(self.kind, WorkItemKind::LoopBody { .. })
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        match self.kind {
            WorkItemKind::LoopBody { loop_id, .. } => Some(loop_id),
            WorkItemKind::Function => None,
        }
    }

    /// Record the tier this item compiles at. Must agree with any earlier
    /// recording; the mode is fixed once the item enters the queue.
    pub fn set_jit_mode(&self, mode: JitMode) {
        let mut slot = self.jit_mode.lock();
        debug_assert!(
            slot.is_none() || *slot == Some(mode),
            "jit mode changed after queueing"
        );
        *slot = Some(mode);
    }

    pub fn jit_mode(&self) -> Option<JitMode> {
        *self.jit_mode.lock()
    }

    pub fn verify_jit_mode(&self, expected: JitMode) -> bool {
        *self.jit_mode.lock() == Some(expected)
    }

    /// Attach the gathered snapshot and register it for helper-path
    /// lookups. Replacing an earlier snapshot (a rejit regathers)
    /// unregisters the old one first.
    pub fn attach_snapshot(&self, data: Arc<CodeGenData>) -> SnapshotId {
        let id = snapshot_registry().register(Arc::clone(&data));
        let mut slot = self.snapshot.lock();
        if let Some((old, _)) = slot.take() {
            snapshot_registry().unregister(old);
        }
        *slot = Some((id, data));
        id
    }

    pub fn snapshot(&self) -> Option<Arc<CodeGenData>> {
        self.snapshot.lock().as_ref().map(|(_, d)| Arc::clone(d))
    }

    pub fn snapshot_id(&self) -> Option<SnapshotId> {
        self.snapshot.lock().as_ref().map(|(id, _)| *id)
    }

    pub fn queue_state(&self) -> QueueState {
        *self.queue_state.lock()
    }

    pub fn set_queue_state(&self, state: QueueState) {
        *self.queue_state.lock() = state;
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        if let Some((id, _)) = self.snapshot.lock().take() {
            snapshot_registry().unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brio_core::function_body::FunctionAttributes;
    use brio_core::FunctionId;

    fn item() -> WorkItem {
        let body = Arc::new(FunctionBody::new(
            FunctionId(1),
            "f",
            100,
            25,
            FunctionAttributes::default(),
            Vec::new(),
        ));
        let ep = body.default_entry_point();
        WorkItem::new(1, body, WorkItemKind::Function, ep, false)
    }

    fn snapshot_for(id: FunctionId) -> Arc<CodeGenData> {
        Arc::new(CodeGenData::empty(id))
    }

    #[test]
    fn jit_mode_is_set_once_and_verifiable() {
        let item = item();
        assert_eq!(item.jit_mode(), None);
        item.set_jit_mode(JitMode::FullJit);
        assert!(item.verify_jit_mode(JitMode::FullJit));
        assert!(!item.verify_jit_mode(JitMode::SimpleJit));
        // Re-recording the same mode is fine.
        item.set_jit_mode(JitMode::FullJit);
    }

    #[test]
    fn snapshot_registration_follows_the_item_lifetime() {
        let item = item();
        let id = item.attach_snapshot(snapshot_for(FunctionId(1)));
        assert!(snapshot_registry().get(id).is_some());
        drop(item);
        assert!(snapshot_registry().get(id).is_none());
    }

    #[test]
    fn regather_replaces_the_registered_snapshot() {
        let item = item();
        let first = item.attach_snapshot(snapshot_for(FunctionId(1)));
        let second = item.attach_snapshot(snapshot_for(FunctionId(1)));
        assert_ne!(first, second);
        assert!(snapshot_registry().get(first).is_none());
        assert!(snapshot_registry().get(second).is_some());
    }
}
