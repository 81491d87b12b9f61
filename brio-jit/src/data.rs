//! Frozen jit-time profile snapshots and the process-wide registry
//!
//! A snapshot is the compile-time-visible copy of runtime profile data a
//! work item carries into the backend. Snapshots are immutable once built
//! and are held jointly by the work item and the process-wide registry, so
//! a background thread still reading one cannot have it collected out from
//! under it even after the work item is logically done.

use brio_core::{CacheKind, CallSiteId, FunctionId, PropertyId, TypeId};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle into the [`SnapshotRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(pub u64);

/// Classification of one inline-cache slot at gather time.
///
/// `NoInfo` is a distinct category: the site was profiled but carries no
/// type information at all. It is tallied separately from `Polymorphic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheClassification {
    Monomorphic(TypeId),
    Polymorphic(Vec<TypeId>),
    /// Profiled, executed, but no object ever flowed through.
    Empty,
    /// No profiled type information at all.
    NoInfo,
}

/// Object-type-specialization record chosen for one cache.
#[derive(Debug, Clone)]
pub struct ObjTypeSpecRecord {
    /// The shape the generated code guards on.
    pub guard_type: TypeId,
    /// Compatible shapes admitted through an equivalent-type guard.
    pub equivalent_types: Vec<TypeId>,
}

/// One classified inline-cache entry in a snapshot.
#[derive(Debug, Clone)]
pub struct JitTimeInlineCache {
    pub site: CallSiteId,
    /// Property id rebound privately to this snapshot.
    pub property_id: PropertyId,
    pub kind: CacheKind,
    pub classification: CacheClassification,
    pub obj_type_spec: Option<ObjTypeSpecRecord>,
}

/// One call site in a snapshot, with its inlinee subtree when the policy
/// chose to inline it.
#[derive(Debug, Clone)]
pub struct JitTimeCallSite {
    pub site: CallSiteId,
    pub fan_out: usize,
    /// Nested record mirroring the inlining decision. The records form a
    /// tree, never a graph: recursive inlining is depth-bounded.
    pub inlinee: Option<Box<CodeGenData>>,
}

/// Tallies of cache classifications for one gathered function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherStats {
    pub monomorphic: u32,
    pub polymorphic: u32,
    pub empty: u32,
    pub no_info: u32,
}

/// The frozen snapshot for one function (and, recursively, everything
/// inlined into it).
#[derive(Debug, Clone)]
pub struct CodeGenData {
    pub function: FunctionId,
    pub inline_caches: Vec<JitTimeInlineCache>,
    pub call_sites: Vec<JitTimeCallSite>,
    /// Constructor-cache records: call site, installed property, produced
    /// shape.
    pub ctor_caches: Vec<(CallSiteId, PropertyId, TypeId)>,
    /// Whether speculative integer arithmetic overflowed in this body.
    pub saw_int_overflow: bool,
    pub stats: GatherStats,
    /// Highest count of loop-resident inlinees observed while walking the
    /// prospective inline tree; carried across an aggressive-inlining
    /// fallback.
    pub highest_loop_inlinee_count: u32,
    /// Sites whose property was seen both as an own slot and, elsewhere,
    /// as an accessor. Inlining both the accessor and a subsequent
    /// apply/call dispatch on the same access is unsound, so these sites
    /// are excluded from inlining.
    pub accessor_conflicts: Vec<CallSiteId>,
}

impl CodeGenData {
    /// A snapshot with nothing profiled. What the gatherer produces for a
    /// body that has never executed.
    pub fn empty(function: FunctionId) -> Self {
        Self {
            function,
            inline_caches: Vec::new(),
            call_sites: Vec::new(),
            ctor_caches: Vec::new(),
            saw_int_overflow: false,
            stats: GatherStats::default(),
            highest_loop_inlinee_count: 0,
            accessor_conflicts: Vec::new(),
        }
    }

    /// Total inlinees in this record's subtree, this record excluded.
    pub fn inlinee_count(&self) -> usize {
        self.call_sites
            .iter()
            .filter_map(|cs| cs.inlinee.as_deref())
            .map(|inner| 1 + inner.inlinee_count())
            .sum()
    }
}

/// Process-wide registry pinning snapshots while any thread may read them.
///
/// Registration is explicit and paired with the owning work item's
/// lifetime rather than relying on ownership transfer; unregistering drops
/// the registry's share, after which the snapshot lives only as long as
/// outstanding `Arc` clones.
#[derive(Default)]
pub struct SnapshotRegistry {
    entries: Mutex<FxHashMap<u64, Arc<CodeGenData>>>,
    next_id: AtomicU64,
}

impl SnapshotRegistry {
    pub fn register(&self, data: Arc<CodeGenData>) -> SnapshotId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, data);
        SnapshotId(id)
    }

    pub fn get(&self, id: SnapshotId) -> Option<Arc<CodeGenData>> {
        self.entries.lock().get(&id.0).cloned()
    }

    /// Returns whether the id was registered.
    pub fn unregister(&self, id: SnapshotId) -> bool {
        self.entries.lock().remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static REGISTRY: Lazy<SnapshotRegistry> = Lazy::new(SnapshotRegistry::default);

/// The process-wide snapshot registry.
pub fn snapshot_registry() -> &'static SnapshotRegistry {
    &REGISTRY
}
