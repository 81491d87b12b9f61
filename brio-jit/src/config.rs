//! Backend configuration
//!
//! All admission-control thresholds and phase switches are injectable;
//! the defaults here are advisory tuning values, not correctness
//! requirements.

use crate::error::BackendError;
use crate::gatherer::InliningPolicy;
use crate::pipeline::Phase;

/// Which way the native stack grows on the target architecture.
///
/// A single policy decision consulted by the one stack allocator; every
/// offset computation threads through it rather than duplicating
/// per-architecture logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackGrowthDirection {
    /// Offsets increase from the frame base.
    Upward,
    /// Offsets decrease from the frame base (x86-family convention).
    Downward,
}

/// Tunables for the code generator.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Background compile threads. Zero selects the degenerate foreground
    /// processor, where loop-body requests block.
    pub max_threads: usize,
    /// Compile synchronously at request time instead of queueing.
    pub prejit: bool,
    /// Capacity bound on currently-queued full-jit items; exceeding it
    /// evicts the oldest queued full-jit item (best effort).
    pub max_jit_queue_len: usize,
    /// Per-item admission bound on bytecode size.
    pub max_bytecode_bytes: u32,
    /// Per-item admission bound on instruction count.
    pub max_instructions: u32,
    /// Advisory process-wide budget on bytes of compiled code.
    pub process_code_budget_bytes: usize,
    /// Keep promoting speculative work while total bytecode compiled so
    /// far stays under this; lets small scripts get ahead of demand.
    pub speculative_jit_bytecode_target: u64,
    /// Queue depth past which the processor may run a job inline on the
    /// requesting thread.
    pub foreground_queue_depth_threshold: usize,
    /// Two-pass aggressive inlining in the gatherer.
    pub aggressive_inlining: bool,
    /// Force loop-body compilation to block the requester.
    pub force_loop_body_sync: bool,
    /// Phase-enable flag for stack-allocated nested functions.
    pub stack_nested_funcs_enabled: bool,
    /// Phase-enable flag for the stack-closure optimization. Both this and
    /// `stack_nested_funcs_enabled` must be on for it to apply.
    pub stack_closure_enabled: bool,
    /// Insert interrupt probes during the pipeline.
    pub interrupt_probes: bool,
    /// Debugger attached to this context; disables several optimizations.
    pub debugging: bool,
    pub stack_growth: StackGrowthDirection,
    /// Platform stack alignment in bytes. Power of two.
    pub stack_alignment: u32,
    /// Phases disabled for testing. A disabled required phase still
    /// advances the phase tracker; only its work is skipped.
    pub disabled_phases: Vec<Phase>,
    /// Testing switch: make the pipeline fail with this condition instead
    /// of encoding.
    pub induced_failure: Option<BackendError>,
    pub inlining: InliningPolicy,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_threads: 2,
            prejit: false,
            max_jit_queue_len: 8,
            max_bytecode_bytes: 60_000,
            max_instructions: 30_000,
            process_code_budget_bytes: 64 * 1024 * 1024,
            speculative_jit_bytecode_target: 32 * 1024,
            foreground_queue_depth_threshold: 16,
            aggressive_inlining: true,
            force_loop_body_sync: false,
            stack_nested_funcs_enabled: true,
            stack_closure_enabled: true,
            interrupt_probes: false,
            debugging: false,
            stack_growth: StackGrowthDirection::Downward,
            stack_alignment: 16,
            disabled_phases: Vec::new(),
            induced_failure: None,
            inlining: InliningPolicy::default(),
        }
    }
}
