//! Mutable runtime profile updated by the interpreter
//!
//! The profile is the live, concurrently-updated side of profiling: inline
//! caches, call-site observations, and per-loop value types. The backend
//! never reads it directly from a compile thread; the gatherer clones what
//! it needs on the foreground thread, under the body's profile lock.

use crate::{CallSiteId, FunctionId, LoopId, PropertyId, TypeId};
use rustc_hash::FxHashMap;

/// Lattice of value types observed for a register at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Never observed.
    Uninitialized,
    Int,
    Float,
    String,
    Object,
    /// More than one of the above.
    Mixed,
}

impl ValueType {
    /// Merge a new observation into the lattice.
    pub fn merge(self, other: ValueType) -> ValueType {
        use ValueType::*;
        match (self, other) {
            (Uninitialized, v) | (v, Uninitialized) => v,
            (a, b) if a == b => a,
            _ => Mixed,
        }
    }
}

/// How a property access goes through its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Load/store of an object's own slot.
    OwnSlot,
    /// Dispatch through a getter/setter.
    Accessor,
}

/// One inline cache: the shapes observed at a property-access site.
///
/// Updated in place by the interpreter; the gatherer takes clones with a
/// fresh property-id binding so concurrent updates cannot corrupt a
/// snapshot mid-read.
#[derive(Debug, Clone)]
pub struct InlineCache {
    pub property_id: PropertyId,
    pub kind: CacheKind,
    /// Shapes seen at this site, most recent last.
    pub types: Vec<TypeId>,
    /// Whether the site ever executed. A site that executed but observed
    /// no shape is "empty"; one that never executed has no info at all.
    pub profiled: bool,
}

impl InlineCache {
    pub fn new(property_id: PropertyId, kind: CacheKind) -> Self {
        Self {
            property_id,
            kind,
            types: Vec::new(),
            profiled: false,
        }
    }

    /// Interpreter-side update: the site executed without observing an
    /// object shape.
    pub fn record_execution(&mut self) {
        self.profiled = true;
    }

    /// Interpreter-side update: record a shape observation.
    pub fn record_type(&mut self, type_id: TypeId) {
        self.profiled = true;
        if !self.types.contains(&type_id) {
            self.types.push(type_id);
        }
    }

    /// Clone this cache's current value, rebinding it to a property id
    /// private to the snapshot.
    pub fn clone_with_property(&self, property_id: PropertyId) -> InlineCache {
        InlineCache {
            property_id,
            kind: self.kind,
            types: self.types.clone(),
            profiled: self.profiled,
        }
    }

    pub fn is_monomorphic(&self) -> bool {
        self.types.len() == 1
    }
}

/// Observations for one profiled call site.
#[derive(Debug, Clone, Default)]
pub struct CallSiteProfile {
    /// Distinct callees seen at this site.
    pub callees: Vec<FunctionId>,
    /// Total calls through this site.
    pub count: u64,
}

impl CallSiteProfile {
    pub fn record_callee(&mut self, callee: FunctionId) {
        if !self.callees.contains(&callee) {
            self.callees.push(callee);
        }
        self.count += 1;
    }

    /// Fan-out observed at this site.
    pub fn polymorphism(&self) -> usize {
        self.callees.len()
    }
}

/// The full runtime profile for one function body.
#[derive(Debug, Default)]
pub struct RuntimeProfile {
    /// Inline caches keyed by access site. A site present with no profiled
    /// type information still occupies a slot here.
    pub inline_caches: FxHashMap<CallSiteId, InlineCache>,
    /// Call-site observations keyed by call site.
    pub call_sites: FxHashMap<CallSiteId, CallSiteProfile>,
    /// Value types observed for locals live at each loop's entry.
    pub loop_locals: FxHashMap<LoopId, Vec<ValueType>>,
    /// Sites where speculative integer arithmetic overflowed at runtime.
    pub overflow_sites: Vec<CallSiteId>,
    /// Constructor-cache observations keyed by call site: the property
    /// installed and the shape the constructor produced.
    pub ctor_caches: FxHashMap<CallSiteId, (PropertyId, TypeId)>,
}

impl RuntimeProfile {
    pub fn saw_int_overflow(&self) -> bool {
        !self.overflow_sites.is_empty()
    }

    /// Record the value types of locals live at a loop's entry, merging
    /// with earlier observations.
    pub fn record_loop_locals(&mut self, loop_id: LoopId, observed: &[ValueType]) {
        let entry = self
            .loop_locals
            .entry(loop_id)
            .or_insert_with(|| vec![ValueType::Uninitialized; observed.len()]);
        for (slot, &ty) in entry.iter_mut().zip(observed) {
            *slot = slot.merge(ty);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_merge_is_a_lattice() {
        assert_eq!(ValueType::Uninitialized.merge(ValueType::Int), ValueType::Int);
        assert_eq!(ValueType::Int.merge(ValueType::Int), ValueType::Int);
        assert_eq!(ValueType::Int.merge(ValueType::Float), ValueType::Mixed);
        assert_eq!(ValueType::Mixed.merge(ValueType::Int), ValueType::Mixed);
    }

    #[test]
    fn inline_cache_clone_rebinds_property() {
        let mut cache = InlineCache::new(PropertyId(7), CacheKind::OwnSlot);
        cache.record_type(TypeId(0x1000));
        let cloned = cache.clone_with_property(PropertyId(99));
        assert_eq!(cloned.property_id, PropertyId(99));
        assert_eq!(cloned.types, cache.types);

        // Updating the live cache must not disturb the clone.
        cache.record_type(TypeId(0x2000));
        assert_eq!(cloned.types.len(), 1);
    }

    #[test]
    fn loop_local_observations_merge() {
        let mut profile = RuntimeProfile::default();
        profile.record_loop_locals(LoopId(0), &[ValueType::Int, ValueType::Int]);
        profile.record_loop_locals(LoopId(0), &[ValueType::Int, ValueType::Float]);
        let locals = &profile.loop_locals[&LoopId(0)];
        assert_eq!(locals[0], ValueType::Int);
        assert_eq!(locals[1], ValueType::Mixed);
    }
}
