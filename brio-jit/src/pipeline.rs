//! The compilation pipeline and its phase discipline
//!
//! One pipeline run drives a freshly built compilation-unit tree through a
//! fixed, debug-verified phase order. The mechanical passes here are thin
//! on purpose: instruction selection, register allocation and encoding are
//! collaborators, not the subject of this crate. What must hold exactly is
//! the ordering, the one-shot phase flags, and the rule that guard tables
//! are read out only after lowering has finished.
//!
//! A rejit is not an error: the pipeline reports it as a distinct outcome
//! and the caller retries with one speculative assumption permanently
//! disabled, so the retry loop strictly narrows the assumption set.

use crate::code::NativeCodeBlock;
use crate::config::BackendConfig;
use crate::data::{CacheClassification, CodeGenData};
use crate::error::BackendError;
use crate::func::{Func, FuncArena, FuncId};
use brio_core::{
    EntryPointTransferData, FunctionBody, JitMode, RegSlot, ScriptContext, Speculation,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Pipeline phases in their mandatory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    IRBuild,
    Inline,
    FlowGraphBuild,
    GlobalOptimize,
    Lower,
    EncodeConstants,
    InterruptProbeInsertion,
    RegisterAllocate,
    Peephole,
    Layout,
    EHBailoutPatchUp,
    InsertSecurityNOPs,
    PrologEpilog,
    FinalLower,
    Encode,
}

impl Phase {
    pub const ORDER: [Phase; 15] = [
        Phase::IRBuild,
        Phase::Inline,
        Phase::FlowGraphBuild,
        Phase::GlobalOptimize,
        Phase::Lower,
        Phase::EncodeConstants,
        Phase::InterruptProbeInsertion,
        Phase::RegisterAllocate,
        Phase::Peephole,
        Phase::Layout,
        Phase::EHBailoutPatchUp,
        Phase::InsertSecurityNOPs,
        Phase::PrologEpilog,
        Phase::FinalLower,
        Phase::Encode,
    ];

    fn index(self) -> usize {
        Phase::ORDER.iter().position(|&p| p == self).unwrap()
    }

    /// Phases that may legitimately be skipped for a given compilation.
    fn may_be_skipped(self) -> bool {
        matches!(self, Phase::InterruptProbeInsertion | Phase::EHBailoutPatchUp)
    }
}

/// Monotonic one-shot phase flags with ordering checks.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    completed: u16,
    last: Option<usize>,
    lowered: bool,
}

impl PhaseTracker {
    pub fn begin(&mut self, phase: Phase) {
        let index = phase.index();
        assert!(
            self.completed & (1 << index) == 0,
            "phase {phase:?} already ran"
        );
        let next_required = self.last.map(|l| l + 1).unwrap_or(0);
        assert!(
            index >= next_required,
            "phase {phase:?} began before its predecessor completed"
        );
        // Anything jumped over must be a skippable phase.
        for skipped in next_required..index {
            assert!(
                Phase::ORDER[skipped].may_be_skipped(),
                "phase {:?} was skipped",
                Phase::ORDER[skipped]
            );
        }
    }

    pub fn complete(&mut self, phase: Phase) {
        let index = phase.index();
        self.completed |= 1 << index;
        self.last = Some(index);
        if phase == Phase::Lower {
            self.lowered = true;
        }
    }

    pub fn has_completed(&self, phase: Phase) -> bool {
        self.completed & (1 << phase.index()) != 0
    }

    /// Whether the post-lowering consistency check should run after the
    /// phase that just completed.
    pub fn is_lowered(&self) -> bool {
        self.lowered
    }
}

/// Why a compilation must be retried with a speculation disabled.
/// Each reason maps to exactly one clearable assumption flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejitReason {
    AggressiveIntTypeSpecDisabled,
    TrackIntOverflowDisabled,
    FieldHoistDisabled,
    ApplyTargetInliningDisabled,
    SwitchOptDisabled,
    LoopCountBasedBoundCheckHoistDisabled,
    ObjTypeSpecDisabled,
    EquivObjTypeSpecDisabled,
}

impl RejitReason {
    pub fn speculation(self) -> Speculation {
        match self {
            RejitReason::AggressiveIntTypeSpecDisabled => Speculation::AggressiveIntTypeSpec,
            RejitReason::TrackIntOverflowDisabled => Speculation::TrackIntOverflow,
            RejitReason::FieldHoistDisabled => Speculation::FieldHoist,
            RejitReason::ApplyTargetInliningDisabled => Speculation::ApplyTargetInlining,
            RejitReason::SwitchOptDisabled => Speculation::SwitchOpt,
            RejitReason::LoopCountBasedBoundCheckHoistDisabled => {
                Speculation::LoopCountBasedBoundCheckHoist
            }
            RejitReason::ObjTypeSpecDisabled => Speculation::ObjTypeSpec,
            RejitReason::EquivObjTypeSpecDisabled => Speculation::EquivObjTypeSpec,
        }
    }
}

/// Result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed {
        block: NativeCodeBlock,
        transfer: EntryPointTransferData,
    },
    NeedsRejit(RejitReason),
    Failed(BackendError),
}

/// Drives one compilation attempt over a fresh unit tree.
pub struct Pipeline<'a> {
    config: &'a BackendConfig,
    ctx: &'a ScriptContext,
    body: &'a Arc<FunctionBody>,
    data: &'a CodeGenData,
    mode: JitMode,
    is_loop_body: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a BackendConfig,
        ctx: &'a ScriptContext,
        body: &'a Arc<FunctionBody>,
        data: &'a CodeGenData,
        mode: JitMode,
        is_loop_body: bool,
    ) -> Self {
        Self {
            config,
            ctx,
            body,
            data,
            mode,
            is_loop_body,
        }
    }

    fn phase_enabled(&self, phase: Phase) -> bool {
        !self.config.disabled_phases.contains(&phase)
    }

    /// Run the whole pipeline once. The arena and all unit state are
    /// private to this call; nothing is published on any outcome other
    /// than `Completed`.
    pub fn run(self) -> PipelineOutcome {
        if let Some(err) = self.config.induced_failure {
            return PipelineOutcome::Failed(err);
        }
        // Functions containing try/catch cannot be compiled under debug.
        if self.config.debugging && self.body.attributes.has_try {
            return PipelineOutcome::Failed(BackendError::Aborted);
        }

        let mut arena = FuncArena::new();
        let top = arena.new_top(Arc::clone(self.body), self.config, self.is_loop_body);
        let mut tracker = PhaseTracker::default();

        // IRBuild
        tracker.begin(Phase::IRBuild);
        if self.phase_enabled(Phase::IRBuild) {
            self.build_ir(&mut arena, top);
        }
        self.finish_phase(&mut tracker, Phase::IRBuild, &arena);

        // Inline: realize the gatherer's decisions as inlinee units.
        tracker.begin(Phase::Inline);
        if self.phase_enabled(Phase::Inline) && self.mode == JitMode::FullJit && !self.is_loop_body
        {
            self.build_inlinees(&mut arena, top, self.data);
        }
        self.finish_phase(&mut tracker, Phase::Inline, &arena);

        // FlowGraphBuild
        tracker.begin(Phase::FlowGraphBuild);
        let block_count = 1 + arena
            .iter()
            .map(|f| f.body.loop_headers().len())
            .sum::<usize>();
        self.finish_phase(&mut tracker, Phase::FlowGraphBuild, &arena);

        // GlobalOptimize: type specialization; the only phase that can
        // demand a rejit before lowering.
        tracker.begin(Phase::GlobalOptimize);
        if self.phase_enabled(Phase::GlobalOptimize) && self.mode == JitMode::FullJit {
            if let Some(reason) = self.global_optimize(&mut arena, top) {
                return PipelineOutcome::NeedsRejit(reason);
            }
        }
        self.finish_phase(&mut tracker, Phase::GlobalOptimize, &arena);

        // Lower: may introduce new address-load-hoisting guards, which is
        // why guard tables are not read out before this point.
        tracker.begin(Phase::Lower);
        if self.phase_enabled(Phase::Lower) {
            self.lower(&mut arena, top);
        }
        self.finish_phase(&mut tracker, Phase::Lower, &arena);

        tracker.begin(Phase::EncodeConstants);
        self.finish_phase(&mut tracker, Phase::EncodeConstants, &arena);

        if self.config.interrupt_probes {
            tracker.begin(Phase::InterruptProbeInsertion);
            trace!(function = self.body.id.0, probes = block_count, "inserted interrupt probes");
            self.finish_phase(&mut tracker, Phase::InterruptProbeInsertion, &arena);
        }

        tracker.begin(Phase::RegisterAllocate);
        self.finish_phase(&mut tracker, Phase::RegisterAllocate, &arena);

        tracker.begin(Phase::Peephole);
        self.finish_phase(&mut tracker, Phase::Peephole, &arena);

        tracker.begin(Phase::Layout);
        self.finish_phase(&mut tracker, Phase::Layout, &arena);

        if self.body.attributes.has_try {
            tracker.begin(Phase::EHBailoutPatchUp);
            self.finish_phase(&mut tracker, Phase::EHBailoutPatchUp, &arena);
        }

        tracker.begin(Phase::InsertSecurityNOPs);
        self.finish_phase(&mut tracker, Phase::InsertSecurityNOPs, &arena);

        tracker.begin(Phase::PrologEpilog);
        self.finish_phase(&mut tracker, Phase::PrologEpilog, &arena);

        tracker.begin(Phase::FinalLower);
        self.finish_phase(&mut tracker, Phase::FinalLower, &arena);

        tracker.begin(Phase::Encode);
        let (block, transfer) = self.encode(&mut arena, top);
        self.finish_phase(&mut tracker, Phase::Encode, &arena);

        debug!(
            function = self.body.id.0,
            mode = ?self.mode,
            bytes = block.len(),
            inlinees = arena.len() - 1,
            "pipeline completed"
        );
        PipelineOutcome::Completed { block, transfer }
    }

    fn finish_phase(&self, tracker: &mut PhaseTracker, phase: Phase, arena: &FuncArena) {
        tracker.complete(phase);
        if tracker.is_lowered() {
            post_lower_consistency_check(arena);
        }
    }

    fn build_ir(&self, arena: &mut FuncArena, top: FuncId) {
        // One symbol and frame slot per local register, capped so the
        // stand-in pass stays cheap on large bodies.
        let locals = (self.body.instruction_count / 4).clamp(1, 64);
        for reg in 0..locals {
            let func = arena.get_mut(top);
            func.symbols.ensure(RegSlot(reg));
            arena.stack_allocate(top, 8);
        }
        for header in self.body.loop_headers() {
            for &reg in &header.locals {
                arena.get_mut(top).symbols.ensure(reg);
            }
        }
    }

    fn build_inlinees(&self, arena: &mut FuncArena, parent: FuncId, data: &CodeGenData) {
        for cs in &data.call_sites {
            let Some(inner) = cs.inlinee.as_deref() else {
                continue;
            };
            let Some(callee) = self.ctx.function(inner.function) else {
                continue;
            };
            // Return point and result register come from the call site.
            let post_call_offset = cs.site.0 * 4 + 4;
            let return_slot = RegSlot(cs.site.0);
            let id = arena.new_inlinee(parent, callee, self.config, post_call_offset, return_slot);
            self.build_inlinees(arena, id, inner);
        }
    }

    /// Returns a rejit reason when a speculative assumption the profile
    /// contradicts is still enabled for this body.
    fn global_optimize(&self, arena: &mut FuncArena, top: FuncId) -> Option<RejitReason> {
        let speculations = self.body.speculations();

        if self.data.saw_int_overflow
            && !speculations.is_disabled(Speculation::AggressiveIntTypeSpec)
        {
            return Some(RejitReason::AggressiveIntTypeSpecDisabled);
        }

        for cache in &self.data.inline_caches {
            let Some(spec) = &cache.obj_type_spec else {
                continue;
            };
            match &cache.classification {
                CacheClassification::Monomorphic(_)
                    if !speculations.is_disabled(Speculation::ObjTypeSpec) =>
                {
                    arena
                        .get_mut(top)
                        .add_linked_type_guard(cache.property_id, spec.guard_type);
                }
                CacheClassification::Polymorphic(_)
                    if !speculations.is_disabled(Speculation::EquivObjTypeSpec) =>
                {
                    arena.get_mut(top).ensure_equivalent_type_guards().push(
                        crate::func::EquivalentTypeGuard {
                            types: spec.equivalent_types.clone(),
                        },
                    );
                }
                _ => {}
            }
        }
        None
    }

    fn lower(&self, arena: &mut FuncArena, top: FuncId) {
        // Constructor caches get their address-load guards here; lowering
        // is allowed to grow the guard tables, which is why transfer data
        // is only read out at the end.
        let ctor_caches: Vec<_> = self.data.ctor_caches.clone();
        let func = arena.get_mut(top);
        for (site, property, ty) in ctor_caches {
            func.ensure_ctor_caches().entry(property).or_default().push(site);
            if self.mode == JitMode::FullJit {
                func.add_linked_type_guard(property, ty);
            }
        }
    }

    fn encode(&self, arena: &mut FuncArena, top: FuncId) -> (NativeCodeBlock, EntryPointTransferData) {
        let total_instructions: u32 = arena.iter().map(|f| f.body.instruction_count).sum();

        const PROLOG: [u8; 8] = [0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x00];
        const EPILOG: [u8; 8] = [0x48, 0x83, 0xc4, 0x00, 0x5d, 0xc3, 0xcc, 0xcc];

        let guard_count = arena.get(top).single_type_guards().len();
        let body_bytes = (total_instructions as usize) * 4;
        let mut buffer = Vec::with_capacity(PROLOG.len() + body_bytes + EPILOG.len());
        buffer.extend_from_slice(&PROLOG);
        for i in 0..total_instructions {
            buffer.extend_from_slice(&(i ^ self.body.id.0).to_le_bytes());
        }
        buffer.extend_from_slice(&EPILOG);

        let type_guard_offsets = (0..guard_count as u32)
            .map(|i| PROLOG.len() as u32 + i * 4)
            .collect();

        let transfer = self.read_out_transfer(arena, top, type_guard_offsets);
        (NativeCodeBlock::new(buffer), transfer)
    }

    /// Read the guard tables into the entry point's transfer data. Runs
    /// only inside Encode, after lowering has frozen the tables.
    fn read_out_transfer(
        &self,
        arena: &FuncArena,
        top: FuncId,
        type_guard_offsets: Vec<u32>,
    ) -> EntryPointTransferData {
        let func: &Func = arena.get(top);
        let debug_slot_offsets = if func.is_debugging {
            (0..func.symbols.len() as i32).map(|i| -8 * (i + 1)).collect()
        } else {
            Vec::new()
        };
        EntryPointTransferData {
            frame_height: arena.frame_height(top),
            debug_slot_offsets,
            stack_closure: func.do_stack_closure,
            inlinee_frame_offsets: arena
                .iter()
                .filter_map(|f| f.inlinee_frame_offset)
                .map(|o| o.0)
                .collect(),
            single_type_guards: func.single_type_guards().to_vec(),
            equivalent_type_guards: func
                .equivalent_type_guards()
                .iter()
                .map(|g| g.types.clone())
                .collect(),
            property_guard_index: func.property_guard_index(),
            ctor_caches: func.ctor_cache_index(),
            type_guard_offsets,
        }
    }
}

/// Consistency check run automatically after every phase once lowering
/// has occurred.
fn post_lower_consistency_check(arena: &FuncArena) {
    let mut tops = 0;
    for func in arena.iter() {
        if func.is_top() {
            tops += 1;
            assert!(func.post_call_offset.is_none() && func.return_value_slot.is_none());
        } else {
            assert!(func.post_call_offset.is_some() && func.return_value_slot.is_some());
            assert!(func.inlinee_frame_offset.is_some());
        }
    }
    assert_eq!(tops, 1, "exactly one top unit per compilation");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::GatherStats;
    use brio_core::function_body::FunctionAttributes;
    use brio_core::FunctionId;

    fn body(id: u32, attrs: FunctionAttributes) -> Arc<FunctionBody> {
        Arc::new(FunctionBody::new(
            FunctionId(id),
            format!("f{id}"),
            120,
            30,
            attrs,
            Vec::new(),
        ))
    }

    fn empty_data(function: FunctionId) -> CodeGenData {
        CodeGenData {
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

    #[test]
    fn tracker_enforces_order() {
        let mut tracker = PhaseTracker::default();
        tracker.begin(Phase::IRBuild);
        tracker.complete(Phase::IRBuild);
        tracker.begin(Phase::Inline);
        tracker.complete(Phase::Inline);
        assert!(tracker.has_completed(Phase::IRBuild));
        assert!(!tracker.has_completed(Phase::Lower));
    }

    #[test]
    #[should_panic(expected = "already ran")]
    fn tracker_rejects_rerunning_a_phase() {
        let mut tracker = PhaseTracker::default();
        tracker.begin(Phase::IRBuild);
        tracker.complete(Phase::IRBuild);
        tracker.begin(Phase::IRBuild);
    }

    #[test]
    #[should_panic(expected = "was skipped")]
    fn tracker_rejects_skipping_a_required_phase() {
        let mut tracker = PhaseTracker::default();
        tracker.begin(Phase::IRBuild);
        tracker.complete(Phase::IRBuild);
        // Jumping straight to GlobalOptimize skips Inline and
        // FlowGraphBuild, which are not skippable.
        tracker.begin(Phase::GlobalOptimize);
    }

    #[test]
    fn tracker_allows_skipping_optional_phases() {
        let mut tracker = PhaseTracker::default();
        for phase in [
            Phase::IRBuild,
            Phase::Inline,
            Phase::FlowGraphBuild,
            Phase::GlobalOptimize,
            Phase::Lower,
            Phase::EncodeConstants,
        ] {
            tracker.begin(phase);
            tracker.complete(phase);
        }
        // InterruptProbeInsertion is optional.
        tracker.begin(Phase::RegisterAllocate);
        tracker.complete(Phase::RegisterAllocate);
        assert!(tracker.is_lowered());
    }

    #[test]
    fn completed_run_produces_code_and_transfer() {
        let config = BackendConfig::default();
        let ctx = ScriptContext::new();
        let b = body(1, FunctionAttributes::default());
        let data = empty_data(b.id);
        let outcome = Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run();
        match outcome {
            PipelineOutcome::Completed { block, transfer } => {
                assert!(!block.is_empty());
                assert!(transfer.frame_height > 0);
                assert!(transfer.stack_closure);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn overflow_with_live_speculation_demands_rejit_once() {
        let config = BackendConfig::default();
        let ctx = ScriptContext::new();
        let b = body(1, FunctionAttributes::default());
        let mut data = empty_data(b.id);
        data.saw_int_overflow = true;

        match Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run() {
            PipelineOutcome::NeedsRejit(RejitReason::AggressiveIntTypeSpecDisabled) => {}
            other => panic!("expected rejit, got {other:?}"),
        }

        // Clearing the speculation converges the retry.
        b.speculations().disable(Speculation::AggressiveIntTypeSpec);
        match Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run() {
            PipelineOutcome::Completed { .. } => {}
            other => panic!("expected completion after disable, got {other:?}"),
        }
    }

    #[test]
    fn simple_jit_never_speculates_into_a_rejit() {
        let config = BackendConfig::default();
        let ctx = ScriptContext::new();
        let b = body(1, FunctionAttributes::default());
        let mut data = empty_data(b.id);
        data.saw_int_overflow = true;
        match Pipeline::new(&config, &ctx, &b, &data, JitMode::SimpleJit, false).run() {
            PipelineOutcome::Completed { .. } => {}
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn induced_failure_surfaces_as_that_condition() {
        let config = BackendConfig {
            induced_failure: Some(BackendError::OutOfMemory),
            ..BackendConfig::default()
        };
        let ctx = ScriptContext::new();
        let b = body(1, FunctionAttributes::default());
        let data = empty_data(b.id);
        match Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run() {
            PipelineOutcome::Failed(BackendError::OutOfMemory) => {}
            other => panic!("expected OOM, got {other:?}"),
        }
    }

    #[test]
    fn try_catch_under_debug_is_not_compiled() {
        let config = BackendConfig {
            debugging: true,
            ..BackendConfig::default()
        };
        let ctx = ScriptContext::new();
        let b = body(
            1,
            FunctionAttributes {
                has_try: true,
                ..FunctionAttributes::default()
            },
        );
        let data = empty_data(b.id);
        match Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run() {
            PipelineOutcome::Failed(BackendError::Aborted) => {}
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn eh_patch_up_runs_only_for_try_bodies() {
        let config = BackendConfig::default();
        let ctx = ScriptContext::new();
        let b = body(
            1,
            FunctionAttributes {
                has_try: true,
                ..FunctionAttributes::default()
            },
        );
        let data = empty_data(b.id);
        // No debugger attached: try bodies compile, with the conditional
        // patch-up phase included.
        match Pipeline::new(&config, &ctx, &b, &data, JitMode::FullJit, false).run() {
            PipelineOutcome::Completed { .. } => {}
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
