//! Function bodies and the script context that owns them

use crate::entry_point::EntryPoint;
use crate::execution_mode::ExecutionModeState;
use crate::profile::{InlineCache, RuntimeProfile};
use crate::{CallSiteId, FunctionId, LoopId, RegSlot};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A speculative optimization the backend may apply to a body.
///
/// Each kind can be disabled exactly once, permanently, by a rejit; the set
/// is finite, which is what bounds the rejit retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Speculation {
    AggressiveIntTypeSpec = 0,
    TrackIntOverflow = 1,
    FieldHoist = 2,
    ApplyTargetInlining = 3,
    SwitchOpt = 4,
    LoopCountBasedBoundCheckHoist = 5,
    ObjTypeSpec = 6,
    EquivObjTypeSpec = 7,
}

impl Speculation {
    pub const ALL: [Speculation; 8] = [
        Speculation::AggressiveIntTypeSpec,
        Speculation::TrackIntOverflow,
        Speculation::FieldHoist,
        Speculation::ApplyTargetInlining,
        Speculation::SwitchOpt,
        Speculation::LoopCountBasedBoundCheckHoist,
        Speculation::ObjTypeSpec,
        Speculation::EquivObjTypeSpec,
    ];

    /// Number of distinct clearable speculations; bounds rejit attempts.
    pub const COUNT: usize = Self::ALL.len();

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Per-body set of permanently disabled speculations.
#[derive(Debug, Default)]
pub struct SpeculationSet {
    disabled: AtomicU32,
}

impl SpeculationSet {
    /// Disable a speculation. Returns true if it was not already disabled.
    pub fn disable(&self, speculation: Speculation) -> bool {
        let prev = self.disabled.fetch_or(speculation.bit(), Ordering::AcqRel);
        prev & speculation.bit() == 0
    }

    pub fn is_disabled(&self, speculation: Speculation) -> bool {
        self.disabled.load(Ordering::Acquire) & speculation.bit() != 0
    }

    pub fn disabled_count(&self) -> u32 {
        self.disabled.load(Ordering::Acquire).count_ones()
    }
}

/// Static attributes of a body that gate inlining and codegen decisions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionAttributes {
    pub has_switch: bool,
    pub has_try: bool,
    pub is_library: bool,
    pub has_nested_functions: bool,
    pub is_inlinable: bool,
}

/// One loop within a function body.
#[derive(Debug, Clone)]
pub struct LoopHeader {
    pub id: LoopId,
    /// Registers live at the loop's entry, in slot order.
    pub locals: Vec<RegSlot>,
}

/// The parsed representation of one function: stable bytecode metadata,
/// the live runtime profile, speculation flags, and the entry-point slots
/// calls dispatch through.
///
/// The bytecode itself is stable once parsed; everything mutable hangs off
/// interior locks so bodies can be shared across the interpreter and the
/// backend threads.
#[derive(Debug)]
pub struct FunctionBody {
    pub id: FunctionId,
    pub name: String,
    pub bytecode_len_bytes: u32,
    pub instruction_count: u32,
    pub attributes: FunctionAttributes,
    loop_headers: Vec<LoopHeader>,
    profile: RwLock<RuntimeProfile>,
    execution: Mutex<ExecutionModeState>,
    speculations: SpeculationSet,
    /// The current default entry point. Exactly one at a time.
    default_entry_point: Mutex<Arc<EntryPoint>>,
    /// Superseded entry points that may still be on some thread's stack;
    /// released by the scheduler's deferred-free sweep, never dropped here.
    retired_entry_points: Mutex<Vec<Arc<EntryPoint>>>,
    loop_entry_points: Mutex<FxHashMap<LoopId, Arc<EntryPoint>>>,
}

impl FunctionBody {
    pub fn new(
        id: FunctionId,
        name: impl Into<String>,
        bytecode_len_bytes: u32,
        instruction_count: u32,
        attributes: FunctionAttributes,
        loop_headers: Vec<LoopHeader>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            bytecode_len_bytes,
            instruction_count,
            attributes,
            loop_headers,
            profile: RwLock::new(RuntimeProfile::default()),
            execution: Mutex::new(ExecutionModeState::new(DEFAULT_FULL_JIT_THRESHOLD)),
            speculations: SpeculationSet::default(),
            default_entry_point: Mutex::new(Arc::new(EntryPoint::new())),
            retired_entry_points: Mutex::new(Vec::new()),
            loop_entry_points: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn loop_headers(&self) -> &[LoopHeader] {
        &self.loop_headers
    }

    pub fn loop_header(&self, loop_id: LoopId) -> Option<&LoopHeader> {
        self.loop_headers.iter().find(|h| h.id == loop_id)
    }

    pub fn profile(&self) -> &RwLock<RuntimeProfile> {
        &self.profile
    }

    pub fn execution(&self) -> &Mutex<ExecutionModeState> {
        &self.execution
    }

    pub fn speculations(&self) -> &SpeculationSet {
        &self.speculations
    }

    pub fn default_entry_point(&self) -> Arc<EntryPoint> {
        self.default_entry_point.lock().clone()
    }

    /// Install a fresh default entry point, retiring the old one. The
    /// retired entry point is queued for deferred release because frames
    /// calling through it may still be live.
    pub fn install_entry_point(&self, entry_point: Arc<EntryPoint>) {
        let old = {
            let mut slot = self.default_entry_point.lock();
            std::mem::replace(&mut *slot, entry_point)
        };
        debug!(function = self.id.0, "installed new default entry point");
        self.retired_entry_points.lock().push(old);
    }

    /// Drain retired entry points whose frames can no longer be live.
    pub fn take_retired_entry_points(&self) -> Vec<Arc<EntryPoint>> {
        std::mem::take(&mut *self.retired_entry_points.lock())
    }

    pub fn retired_entry_point_count(&self) -> usize {
        self.retired_entry_points.lock().len()
    }

    pub fn loop_entry_point(&self, loop_id: LoopId) -> Option<Arc<EntryPoint>> {
        self.loop_entry_points.lock().get(&loop_id).cloned()
    }

    pub fn install_loop_entry_point(&self, loop_id: LoopId, entry_point: Arc<EntryPoint>) {
        self.loop_entry_points.lock().insert(loop_id, entry_point);
    }
}

const DEFAULT_FULL_JIT_THRESHOLD: u64 = 12;

/// A live function object: a closure over a body. Its per-closure inline
/// caches can be fresher and more monomorphic than the shared body-level
/// caches, so the gatherer prefers them when a live object is supplied.
#[derive(Debug)]
pub struct FunctionInstance {
    pub body: Arc<FunctionBody>,
    closure_caches: RwLock<FxHashMap<CallSiteId, InlineCache>>,
}

impl FunctionInstance {
    pub fn new(body: Arc<FunctionBody>) -> Self {
        Self {
            body,
            closure_caches: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn record_closure_cache(&self, site: CallSiteId, cache: InlineCache) {
        self.closure_caches.write().insert(site, cache);
    }

    pub fn closure_cache(&self, site: CallSiteId) -> Option<InlineCache> {
        self.closure_caches.read().get(&site).cloned()
    }
}

/// One execution context: the table of function bodies the backend may be
/// asked to compile. Passed explicitly to every scheduler operation.
#[derive(Debug, Default)]
pub struct ScriptContext {
    functions: RwLock<FxHashMap<FunctionId, Arc<FunctionBody>>>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&self, body: Arc<FunctionBody>) {
        self.functions.write().insert(body.id, body);
    }

    pub fn function(&self, id: FunctionId) -> Option<Arc<FunctionBody>> {
        self.functions.read().get(&id).cloned()
    }

    pub fn function_count(&self) -> usize {
        self.functions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> FunctionBody {
        FunctionBody::new(
            FunctionId(1),
            "f",
            100,
            25,
            FunctionAttributes::default(),
            Vec::new(),
        )
    }

    #[test]
    fn speculation_disable_is_idempotent() {
        let b = body();
        assert!(b.speculations().disable(Speculation::AggressiveIntTypeSpec));
        assert!(!b.speculations().disable(Speculation::AggressiveIntTypeSpec));
        assert!(b.speculations().is_disabled(Speculation::AggressiveIntTypeSpec));
        assert_eq!(b.speculations().disabled_count(), 1);
    }

    #[test]
    fn installing_entry_point_retires_the_old_one() {
        let b = body();
        let first = b.default_entry_point();
        let second = Arc::new(EntryPoint::new());
        b.install_entry_point(second.clone());
        assert!(Arc::ptr_eq(&b.default_entry_point(), &second));
        let retired = b.take_retired_entry_points();
        assert_eq!(retired.len(), 1);
        assert!(Arc::ptr_eq(&retired[0], &first));
    }

    #[test]
    fn script_context_resolves_bodies() {
        let ctx = ScriptContext::new();
        let b = Arc::new(body());
        ctx.register_function(b.clone());
        assert!(Arc::ptr_eq(&ctx.function(FunctionId(1)).unwrap(), &b));
        assert!(ctx.function(FunctionId(2)).is_none());
    }
}
