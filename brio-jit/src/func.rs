//! Per-compilation working state ("Func")
//!
//! A compilation unit owns everything mutable for one attempt: the symbol
//! table, the stack-frame layout cursor, and the lazily allocated guard
//! and cache tables. Units form a tree mirroring the inlining decisions;
//! the tree is held in an arena indexed by integer id, with a plain parent
//! index and a cached top index instead of parent pointers. All stack and
//! constant allocation happens on the top unit; inlined units only record
//! offsets relative to it.

use crate::config::{BackendConfig, StackGrowthDirection};
use brio_core::{CallSiteId, FunctionBody, PropertyId, RegSlot, TypeId};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Index of a compilation unit within its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

/// Unique id of a register or temporary within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymId(pub u32);

/// Byte offset into the native stack frame. Sign follows the configured
/// growth direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackOffset(pub i32);

/// Symbol table: unique ids for all registers and temporaries.
#[derive(Debug, Default)]
pub struct SymbolTable {
    next: u32,
    by_reg: FxHashMap<RegSlot, SymId>,
}

impl SymbolTable {
    /// Id for a bytecode register, allocating on first use.
    pub fn ensure(&mut self, reg: RegSlot) -> SymId {
        if let Some(&sym) = self.by_reg.get(&reg) {
            return sym;
        }
        let sym = SymId(self.next);
        self.next += 1;
        self.by_reg.insert(reg, sym);
        sym
    }

    /// A fresh temporary with no register binding.
    pub fn new_temp(&mut self) -> SymId {
        let sym = SymId(self.next);
        self.next += 1;
        sym
    }

    pub fn len(&self) -> usize {
        self.next as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next == 0
    }
}

/// Monotone stack-frame layout cursor.
///
/// One allocator exists per compilation, on the top unit. The growth
/// direction is an architecture policy threaded through here once; every
/// caller computes offsets with the same sign convention.
#[derive(Debug)]
pub struct StackAllocator {
    direction: StackGrowthDirection,
    alignment: u32,
    cursor: i32,
    /// Byte ranges handed out so far, for overlap checking.
    allocated: Vec<(i32, u32)>,
}

impl StackAllocator {
    pub fn new(direction: StackGrowthDirection, alignment: u32) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            direction,
            alignment,
            cursor: 0,
            allocated: Vec::new(),
        }
    }

    /// Allocate `size` bytes, aligned to the smaller of the rounded-up
    /// request size and the platform stack alignment.
    pub fn allocate(&mut self, size: u32) -> StackOffset {
        debug_assert!(size > 0);
        let align = size.next_power_of_two().min(self.alignment) as i32;
        let offset = match self.direction {
            StackGrowthDirection::Upward => {
                let offset = round_up(self.cursor, align);
                self.cursor = offset + size as i32;
                offset
            }
            StackGrowthDirection::Downward => {
                let offset = round_down(self.cursor - size as i32, align);
                self.cursor = offset;
                offset
            }
        };
        debug_assert!(
            !self.overlaps(offset, size),
            "stack allocation at {offset} overlaps an earlier one"
        );
        self.allocated.push((offset, size));
        StackOffset(offset)
    }

    fn overlaps(&self, offset: i32, size: u32) -> bool {
        let end = offset + size as i32;
        self.allocated
            .iter()
            .any(|&(o, s)| offset < o + s as i32 && o < end)
    }

    /// Total frame height in bytes.
    pub fn frame_height(&self) -> u32 {
        self.cursor.unsigned_abs()
    }

    pub fn direction(&self) -> StackGrowthDirection {
        self.direction
    }

    /// Offset of an inlinee's first actual argument, computed by walking
    /// backward from the last materialized out-argument of the call, in
    /// the configured growth direction.
    pub fn first_actual_offset(&self, last_out_arg: StackOffset, arg_count: u32, arg_size: u32) -> StackOffset {
        let span = (arg_count.saturating_sub(1) * arg_size) as i32;
        match self.direction {
            StackGrowthDirection::Upward => StackOffset(last_out_arg.0 - span),
            StackGrowthDirection::Downward => StackOffset(last_out_arg.0 + span),
        }
    }
}

fn round_up(value: i32, align: i32) -> i32 {
    (value + align - 1) & !(align - 1)
}

fn round_down(value: i32, align: i32) -> i32 {
    value & !(align - 1)
}

/// An equivalent-type guard: a set of compatible shapes one check admits.
#[derive(Debug, Clone)]
pub struct EquivalentTypeGuard {
    pub types: Vec<TypeId>,
}

/// A range check recorded for slot-array or frame-display accesses.
#[derive(Debug, Clone)]
pub struct RangeCheck {
    pub array_sym: SymId,
    pub upper_bound: u32,
}

/// One compilation unit in the inline tree.
#[derive(Debug)]
pub struct Func {
    pub id: FuncId,
    pub parent: Option<FuncId>,
    /// Cached index of the tree's top unit; computed once at creation.
    pub top: FuncId,
    pub body: Arc<FunctionBody>,
    /// Byte offset in the caller's bytecode where control returns after
    /// this inlined call. Set iff this unit is inlined.
    pub post_call_offset: Option<u32>,
    /// Register receiving the inlined call's result. Set iff inlined.
    pub return_value_slot: Option<RegSlot>,
    pub is_debugging: bool,
    pub can_stack_nested_functions: bool,
    pub do_stack_closure: bool,
    pub symbols: SymbolTable,
    /// Present only on the top unit.
    stack: Option<StackAllocator>,
    /// Frame offset of this inlinee relative to the top unit.
    pub inlinee_frame_offset: Option<StackOffset>,

    // Guard and cache tables, allocated on first use. Most functions use
    // none of these.
    single_type_guards: Option<Vec<TypeId>>,
    equivalent_type_guards: Option<Vec<EquivalentTypeGuard>>,
    property_guards: Option<FxHashMap<PropertyId, Vec<u32>>>,
    ctor_caches: Option<FxHashMap<PropertyId, Vec<CallSiteId>>>,
    range_checks: Option<Vec<RangeCheck>>,
}

impl Func {
    /// Single-type guards, constructed on first use.
    pub fn ensure_single_type_guards(&mut self) -> &mut Vec<TypeId> {
        self.single_type_guards.get_or_insert_with(Vec::new)
    }

    pub fn ensure_equivalent_type_guards(&mut self) -> &mut Vec<EquivalentTypeGuard> {
        self.equivalent_type_guards.get_or_insert_with(Vec::new)
    }

    /// Property-id -> dependent guard indices. One-to-many: a shape change
    /// for a property invalidates exactly the guards linked under it.
    pub fn ensure_property_guards(&mut self) -> &mut FxHashMap<PropertyId, Vec<u32>> {
        self.property_guards.get_or_insert_with(FxHashMap::default)
    }

    pub fn ensure_ctor_caches(&mut self) -> &mut FxHashMap<PropertyId, Vec<CallSiteId>> {
        self.ctor_caches.get_or_insert_with(FxHashMap::default)
    }

    pub fn ensure_range_checks(&mut self) -> &mut Vec<RangeCheck> {
        self.range_checks.get_or_insert_with(Vec::new)
    }

    pub fn is_top(&self) -> bool {
        self.parent.is_none()
    }

    /// Record a single-type guard and link it under its property id.
    pub fn add_linked_type_guard(&mut self, property: PropertyId, ty: TypeId) -> u32 {
        let guards = self.single_type_guards.get_or_insert_with(Vec::new);
        let index = guards.len() as u32;
        guards.push(ty);
        self.property_guards
            .get_or_insert_with(FxHashMap::default)
            .entry(property)
            .or_default()
            .push(index);
        index
    }

    pub fn single_type_guards(&self) -> &[TypeId] {
        self.single_type_guards.as_deref().unwrap_or(&[])
    }

    pub fn equivalent_type_guards(&self) -> &[EquivalentTypeGuard] {
        self.equivalent_type_guards.as_deref().unwrap_or(&[])
    }

    pub fn property_guard_index(&self) -> Vec<(PropertyId, Vec<u32>)> {
        self.property_guards
            .as_ref()
            .map(|map| map.iter().map(|(&p, v)| (p, v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn ctor_cache_index(&self) -> Vec<(PropertyId, CallSiteId)> {
        self.ctor_caches
            .as_ref()
            .map(|map| {
                map.iter()
                    .flat_map(|(&p, sites)| sites.iter().map(move |&s| (p, s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_guard_tables(&self) -> bool {
        self.single_type_guards.is_some()
            || self.equivalent_type_guards.is_some()
            || self.property_guards.is_some()
            || self.ctor_caches.is_some()
            || self.range_checks.is_some()
    }
}

/// Arena owning one compilation's unit tree. Stack-allocated for the
/// duration of a single pipeline run; a rejit builds a brand-new arena.
#[derive(Debug)]
pub struct FuncArena {
    funcs: Vec<Func>,
}

impl FuncArena {
    pub fn new() -> Self {
        Self { funcs: Vec::new() }
    }

    /// Create the top unit. Exactly one per arena; `post_call_offset` and
    /// `return_value_slot` must both be unset for it.
    pub fn new_top(&mut self, body: Arc<FunctionBody>, config: &BackendConfig, is_loop_body: bool) -> FuncId {
        assert!(self.funcs.is_empty(), "arena already has a top unit");
        let id = FuncId(0);
        let flags = UnitFlags::compute(&body, config, is_loop_body, true);
        self.funcs.push(Func {
            id,
            parent: None,
            top: id,
            body,
            post_call_offset: None,
            return_value_slot: None,
            is_debugging: flags.is_debugging,
            can_stack_nested_functions: flags.can_stack_nested_functions,
            do_stack_closure: flags.do_stack_closure,
            symbols: SymbolTable::default(),
            stack: Some(StackAllocator::new(config.stack_growth, config.stack_alignment)),
            inlinee_frame_offset: None,
            single_type_guards: None,
            equivalent_type_guards: None,
            property_guards: None,
            ctor_caches: None,
            range_checks: None,
        });
        id
    }

    /// Create an inlined unit. Both `post_call_offset` and
    /// `return_value_slot` must be supplied; the pair is either fully set
    /// (inlined) or fully unset (top), never mixed.
    pub fn new_inlinee(
        &mut self,
        parent: FuncId,
        body: Arc<FunctionBody>,
        config: &BackendConfig,
        post_call_offset: u32,
        return_value_slot: RegSlot,
    ) -> FuncId {
        let top = self.funcs[parent.0 as usize].top;
        let id = FuncId(self.funcs.len() as u32);
        let flags = UnitFlags::compute(&body, config, false, false);
        // Inlinee frames live inside the top unit's frame.
        let frame_offset = {
            let frame_size = body.instruction_count.max(1) * 8;
            self.stack_mut(top).allocate(frame_size)
        };
        self.funcs.push(Func {
            id,
            parent: Some(parent),
            top,
            body,
            post_call_offset: Some(post_call_offset),
            return_value_slot: Some(return_value_slot),
            is_debugging: flags.is_debugging,
            can_stack_nested_functions: flags.can_stack_nested_functions,
            do_stack_closure: false,
            symbols: SymbolTable::default(),
            stack: None,
            inlinee_frame_offset: Some(frame_offset),
            single_type_guards: None,
            equivalent_type_guards: None,
            property_guards: None,
            ctor_caches: None,
            range_checks: None,
        });
        id
    }

    pub fn get(&self, id: FuncId) -> &Func {
        &self.funcs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: FuncId) -> &mut Func {
        &mut self.funcs[id.0 as usize]
    }

    /// O(1): every unit caches its top index at creation.
    pub fn top_of(&self, id: FuncId) -> FuncId {
        self.funcs[id.0 as usize].top
    }

    /// Allocate frame bytes for any unit; the allocation always lands on
    /// the top unit's cursor.
    pub fn stack_allocate(&mut self, id: FuncId, size: u32) -> StackOffset {
        let top = self.top_of(id);
        self.stack_mut(top).allocate(size)
    }

    pub fn frame_height(&self, id: FuncId) -> u32 {
        let top = self.top_of(id);
        self.funcs[top.0 as usize]
            .stack
            .as_ref()
            .map(|s| s.frame_height())
            .unwrap_or(0)
    }

    fn stack_mut(&mut self, top: FuncId) -> &mut StackAllocator {
        self.funcs[top.0 as usize]
            .stack
            .as_mut()
            .expect("top unit owns the stack allocator")
    }

    pub fn stack(&self, id: FuncId) -> &StackAllocator {
        let top = self.top_of(id);
        self.funcs[top.0 as usize]
            .stack
            .as_ref()
            .expect("top unit owns the stack allocator")
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Func> {
        self.funcs.iter()
    }
}

impl Default for FuncArena {
    fn default() -> Self {
        Self::new()
    }
}

struct UnitFlags {
    is_debugging: bool,
    can_stack_nested_functions: bool,
    do_stack_closure: bool,
}

impl UnitFlags {
    /// Flags computed eagerly at construction; every later pass reads
    /// them.
    fn compute(body: &FunctionBody, config: &BackendConfig, is_loop_body: bool, is_top: bool) -> Self {
        let is_debugging = config.debugging && !body.attributes.is_library;
        let can_stack_nested_functions = !is_debugging
            && !(is_loop_body && body.attributes.has_nested_functions);
        let do_stack_closure = can_stack_nested_functions
            && config.stack_nested_funcs_enabled
            && config.stack_closure_enabled
            && is_top;
        Self {
            is_debugging,
            can_stack_nested_functions,
            do_stack_closure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brio_core::function_body::FunctionAttributes;
    use brio_core::FunctionId;

    fn body(id: u32) -> Arc<FunctionBody> {
        Arc::new(FunctionBody::new(
            FunctionId(id),
            format!("f{id}"),
            100,
            20,
            FunctionAttributes::default(),
            Vec::new(),
        ))
    }

    fn config(direction: StackGrowthDirection) -> BackendConfig {
        BackendConfig {
            stack_growth: direction,
            ..BackendConfig::default()
        }
    }

    #[test]
    fn downward_offsets_are_strictly_decreasing_and_disjoint() {
        let mut alloc = StackAllocator::new(StackGrowthDirection::Downward, 16);
        let a = alloc.allocate(8);
        let b = alloc.allocate(16);
        let c = alloc.allocate(4);
        assert!(a.0 < 0);
        assert!(b < a);
        assert!(c < b);
        assert_eq!(alloc.frame_height(), alloc.cursor.unsigned_abs());
    }

    #[test]
    fn upward_offsets_are_strictly_increasing_and_disjoint() {
        let mut alloc = StackAllocator::new(StackGrowthDirection::Upward, 16);
        let a = alloc.allocate(8);
        let b = alloc.allocate(16);
        let c = alloc.allocate(4);
        assert_eq!(a.0, 0);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn alignment_is_min_of_size_and_platform() {
        let mut alloc = StackAllocator::new(StackGrowthDirection::Upward, 16);
        let _ = alloc.allocate(3);
        // A 4-byte request aligns to 4, not 16.
        let b = alloc.allocate(4);
        assert_eq!(b.0 % 4, 0);
        // A 32-byte request still aligns only to the platform's 16.
        let c = alloc.allocate(32);
        assert_eq!(c.0 % 16, 0);
    }

    #[test]
    fn first_actual_offset_agrees_with_growth_direction() {
        let mut down = StackAllocator::new(StackGrowthDirection::Downward, 16);
        let last = down.allocate(8);
        let first = down.first_actual_offset(last, 3, 8);
        assert_eq!(first.0, last.0 + 16);

        let mut up = StackAllocator::new(StackGrowthDirection::Upward, 16);
        let a = up.allocate(8);
        let b = up.allocate(8);
        let last = up.allocate(8);
        let _ = (a, b);
        let first = up.first_actual_offset(last, 3, 8);
        assert_eq!(first.0, last.0 - 16);
    }

    #[test]
    fn exactly_one_top_unit_holds_the_allocator() {
        let cfg = config(StackGrowthDirection::Downward);
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(1), &cfg, false);
        let inlinee = arena.new_inlinee(top, body(2), &cfg, 12, RegSlot(3));
        let nested = arena.new_inlinee(inlinee, body(3), &cfg, 20, RegSlot(4));

        assert!(arena.get(top).is_top());
        assert!(!arena.get(inlinee).is_top());
        assert_eq!(arena.top_of(nested), top);
        assert!(arena.get(inlinee).inlinee_frame_offset.is_some());

        // Allocation through any unit lands on the top cursor.
        let before = arena.frame_height(top);
        let _ = arena.stack_allocate(nested, 8);
        assert!(arena.frame_height(top) > before);
    }

    #[test]
    fn inlined_units_carry_both_return_fields() {
        let cfg = config(StackGrowthDirection::Downward);
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(1), &cfg, false);
        assert!(arena.get(top).post_call_offset.is_none());
        assert!(arena.get(top).return_value_slot.is_none());

        let inlinee = arena.new_inlinee(top, body(2), &cfg, 44, RegSlot(1));
        assert_eq!(arena.get(inlinee).post_call_offset, Some(44));
        assert_eq!(arena.get(inlinee).return_value_slot, Some(RegSlot(1)));
    }

    #[test]
    fn guard_tables_allocate_lazily() {
        let cfg = config(StackGrowthDirection::Downward);
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(1), &cfg, false);
        assert!(!arena.get(top).has_guard_tables());

        let func = arena.get_mut(top);
        let idx = func.add_linked_type_guard(PropertyId(5), TypeId(0xbeef));
        let idx2 = func.add_linked_type_guard(PropertyId(5), TypeId(0xcafe));
        assert!(func.has_guard_tables());
        assert_eq!(func.single_type_guards().len(), 2);
        // Both guards link under one property id, not stored per guard.
        let index = func.property_guard_index();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].1, vec![idx, idx2]);
    }

    #[test]
    fn stack_closure_requires_top_and_both_switches() {
        let mut cfg = config(StackGrowthDirection::Downward);
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(1), &cfg, false);
        assert!(arena.get(top).do_stack_closure);
        let inlinee = arena.new_inlinee(top, body(2), &cfg, 4, RegSlot(0));
        assert!(!arena.get(inlinee).do_stack_closure);

        cfg.stack_closure_enabled = false;
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(3), &cfg, false);
        assert!(!arena.get(top).do_stack_closure);
    }

    #[test]
    fn debugging_disables_stack_nested_functions_for_user_code() {
        let mut cfg = config(StackGrowthDirection::Downward);
        cfg.debugging = true;
        let mut arena = FuncArena::new();
        let top = arena.new_top(body(1), &cfg, false);
        assert!(arena.get(top).is_debugging);
        assert!(!arena.get(top).can_stack_nested_functions);
    }
}
