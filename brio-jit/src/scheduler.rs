//! The native code generator
//!
//! One per script context. Owns the work-item table, decides the tier for
//! each request, feeds the job processor, and runs the compile pipeline
//! from the processor's callbacks. The interpreter talks to it through
//! three entry points: a function got called enough (`request_compile`),
//! a hot loop wants its own body (`request_loop_body_compile`), and a call
//! landed on a thunk whose code is not ready yet (`check_codegen_thunk`).
//!
//! Lock order: the scheduler's own mutex is never held across any
//! processor call, because every processor call may re-enter the manager
//! callbacks on this or another thread.

use crate::code::{
    add_process_code_bytes, check_codegen_thunk_address, process_code_bytes, DeferredFreeList,
    NativeCodeBlock,
};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::gatherer::gather_codegen_data;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::transport::{
    apply_fixups, FailureDisposition, RemoteCompiler, RemoteContextHandle, SerializedWorkItem,
    TransportError,
};
use crate::work_item::{QueueState, WorkItem, WorkItemId, WorkItemKind};
use brio_core::entry_point::{CodeGenState, FailureReason};
use brio_core::profile::ValueType;
use brio_core::{EntryPoint, FunctionBody, FunctionInstance, JitMode, LoopId, Speculation};
use brio_jobs::{
    BackgroundJobProcessor, ForegroundJobProcessor, JobId, JobManager, JobProcessor,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Counters exposed for diagnostics and tests. All advisory.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub queued: AtomicU64,
    pub compiled: AtomicU64,
    pub failed: AtomicU64,
    /// Items refused at admission because the body exceeded size bounds.
    pub dropped: AtomicU64,
    /// Queued full-jit items removed to make room for newer ones.
    pub evicted: AtomicU64,
    pub rejits: AtomicU64,
    /// Speculative items promoted into the queue from a worker's idle
    /// moment.
    pub speculative_promoted: AtomicU64,
}

struct Inner {
    items: FxHashMap<WorkItemId, Arc<WorkItem>>,
    /// Speculative work parked until a worker goes idle.
    unscheduled: Vec<Arc<WorkItem>>,
    /// Currently queued (not in-flight) full-jit items, oldest first.
    queued_full: Vec<WorkItemId>,
    /// Published code, kept alive until its entry point is swept.
    live_code: FxHashMap<WorkItemId, NativeCodeBlock>,
    /// Total bytecode bytes promoted speculatively so far.
    speculative_bytes: u64,
    closed: bool,
}

pub struct NativeCodeGenerator {
    ctx: Arc<brio_core::ScriptContext>,
    config: BackendConfig,
    processor: Arc<dyn JobProcessor>,
    inner: Mutex<Inner>,
    next_id: AtomicU64,
    pub stats: SchedulerStats,
    deferred_free: DeferredFreeList,
    remote: Mutex<Option<Arc<dyn RemoteCompiler>>>,
}

impl NativeCodeGenerator {
    pub fn new(ctx: Arc<brio_core::ScriptContext>, config: BackendConfig) -> Arc<Self> {
        let processor: Arc<dyn JobProcessor> = if config.max_threads > 0 {
            Arc::new(BackgroundJobProcessor::new(config.max_threads))
        } else {
            Arc::new(ForegroundJobProcessor::new())
        };
        Self::with_processor(ctx, config, processor)
    }

    /// Construction with an explicit processor, for tests.
    pub fn with_processor(
        ctx: Arc<brio_core::ScriptContext>,
        config: BackendConfig,
        processor: Arc<dyn JobProcessor>,
    ) -> Arc<Self> {
        let generator = Arc::new(Self {
            ctx,
            config,
            processor,
            inner: Mutex::new(Inner {
                items: FxHashMap::default(),
                unscheduled: Vec::new(),
                queued_full: Vec::new(),
                live_code: FxHashMap::default(),
                speculative_bytes: 0,
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            stats: SchedulerStats::default(),
            deferred_free: DeferredFreeList::new(),
            remote: Mutex::new(None),
        });
        let manager: Weak<dyn JobManager> =
            Arc::downgrade(&generator) as Weak<dyn JobManager>;
        generator.processor.register_manager(manager);
        generator
    }

    /// Route compiles through an out-of-process backend.
    pub fn set_remote_compiler(&self, remote: Arc<dyn RemoteCompiler>) {
        *self.remote.lock() = Some(remote);
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn queue_depth(&self) -> usize {
        self.processor.queue_depth()
    }

    /// Request a compile for `body` at the tier its execution state has
    /// earned. Installs a fresh entry point (retiring the old one) and
    /// queues the work. `live` is the closure the call came from, when
    /// the caller holds one; its caches refine the gathered snapshot.
    /// Returns the entry point calls should now dispatch through, or
    /// `None` when no compile is warranted.
    pub fn request_compile(
        &self,
        body: &Arc<FunctionBody>,
        forced: bool,
        live: Option<Arc<FunctionInstance>>,
    ) -> Option<Arc<EntryPoint>> {
        let mode = {
            let exec = body.execution().lock();
            if exec.was_full_jitted_and_wont_interpret_again() {
                // Terminal tier already reached; nothing left to do.
                return None;
            }
            if exec.is_hot_enough_for_full_jit() {
                JitMode::FullJit
            } else {
                JitMode::SimpleJit
            }
        };
        self.request_compile_at(body, mode, forced, live)
    }

    pub fn request_compile_at(
        &self,
        body: &Arc<FunctionBody>,
        mode: JitMode,
        forced: bool,
        live: Option<Arc<FunctionInstance>>,
    ) -> Option<Arc<EntryPoint>> {
        // A compile at this tier or higher is already underway; the
        // caller keeps dispatching through the existing entry point.
        let current = body.default_entry_point();
        if current.is_pending_or_queued() && current.jit_mode() >= Some(mode) {
            return None;
        }

        let entry_point = Arc::new(EntryPoint::new());
        entry_point.set_jit_mode(mode);
        entry_point.install_thunk(check_codegen_thunk_address());
        if entry_point.transition(CodeGenState::CodeGenPending).is_err() {
            return None;
        }
        body.install_entry_point(Arc::clone(&entry_point));

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(WorkItem::new(
            id,
            Arc::clone(body),
            WorkItemKind::Function,
            Arc::clone(&entry_point),
            forced,
        ));
        item.set_jit_mode(mode);
        if let Some(live) = live {
            item.set_live_instance(live);
        }
        if !self.enqueue(item) {
            return None;
        }
        if self.config.prejit {
            self.processor.prioritize_job_and_wait(id);
        }
        Some(entry_point)
    }

    /// Park a compile as speculative work. It enters the queue when a
    /// worker runs out of demanded work (budget permitting) or when a
    /// later invocation prioritizes it; its tier is decided then.
    pub fn queue_speculative(&self, body: &Arc<FunctionBody>) -> Option<Arc<EntryPoint>> {
        if self.inner.lock().closed {
            return None;
        }
        let entry_point = Arc::new(EntryPoint::new());
        entry_point.install_thunk(check_codegen_thunk_address());
        if entry_point.transition(CodeGenState::CodeGenPending).is_err() {
            return None;
        }
        body.install_entry_point(Arc::clone(&entry_point));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(WorkItem::new(
            id,
            Arc::clone(body),
            WorkItemKind::Function,
            Arc::clone(&entry_point),
            false,
        ));
        item.set_queue_state(QueueState::InForegroundQueue);
        let mut inner = self.inner.lock();
        if inner.closed {
            item.entry_point.fail(FailureReason::Aborted);
            return None;
        }
        inner.items.insert(id, Arc::clone(&item));
        inner.unscheduled.push(item);
        Some(entry_point)
    }

    /// Re-invocation hook: the function behind `entry_point` got called
    /// again while its compile is still outstanding. A parked speculative
    /// item is admitted at the tier the execution ladder picks now (full
    /// jit when `force` or hot); an item already in the queue moves to
    /// the front of its class. Never blocks and never creates a
    /// duplicate. Returns false when nothing is outstanding for this
    /// entry point.
    pub fn prioritize(
        &self,
        entry_point: &Arc<EntryPoint>,
        force: bool,
        live: Option<Arc<FunctionInstance>>,
    ) -> bool {
        let item = {
            let inner = self.inner.lock();
            inner
                .items
                .values()
                .find(|item| Arc::ptr_eq(&item.entry_point, entry_point))
                .cloned()
        };
        let Some(item) = item else {
            return false;
        };
        if let Some(live) = live {
            item.set_live_instance(live);
        }
        match item.queue_state() {
            QueueState::InForegroundQueue => self.promote_unscheduled(&item, force),
            QueueState::InJitQueue => self.processor.prioritize_job(item.id),
            QueueState::NotInQueue => false,
        }
    }

    /// Move one parked item into the jit queue at the tier earned now.
    fn promote_unscheduled(&self, item: &Arc<WorkItem>, force: bool) -> bool {
        let taken = {
            let mut inner = self.inner.lock();
            match inner.unscheduled.iter().position(|i| Arc::ptr_eq(i, item)) {
                Some(pos) => {
                    inner.unscheduled.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !taken {
            return false;
        }
        let mode = {
            let exec = item.body.execution().lock();
            if force || exec.is_hot_enough_for_full_jit() {
                JitMode::FullJit
            } else {
                JitMode::SimpleJit
            }
        };
        item.set_jit_mode(mode);
        item.entry_point.set_jit_mode(mode);
        debug!(function = item.body.id.0, ?mode, "promoting parked work item");
        self.enqueue(Arc::clone(item))
    }

    /// Request a compile of one loop body against the value types live in
    /// the requesting interpreter frame. Blocks the requester when no
    /// background thread exists or when configured to.
    pub fn request_loop_body_compile(
        &self,
        body: &Arc<FunctionBody>,
        loop_id: LoopId,
        seed_types: Vec<ValueType>,
    ) -> Option<Arc<EntryPoint>> {
        body.loop_header(loop_id)?;
        if body
            .execution()
            .lock()
            .was_full_jitted_and_wont_interpret_again()
        {
            // The owner left the interpreter for good; no frame will ever
            // enter this loop body again.
            return None;
        }
        let entry_point = Arc::new(EntryPoint::new());
        entry_point.set_jit_mode(JitMode::FullJit);
        entry_point.install_thunk(check_codegen_thunk_address());
        if entry_point.transition(CodeGenState::CodeGenPending).is_err() {
            return None;
        }
        body.install_loop_entry_point(loop_id, Arc::clone(&entry_point));

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(WorkItem::new(
            id,
            Arc::clone(body),
            WorkItemKind::LoopBody { loop_id, seed_types },
            Arc::clone(&entry_point),
            true,
        ));
        item.set_jit_mode(JitMode::FullJit);
        if !self.enqueue(item) {
            return None;
        }
        if !self.processor.is_background() || self.config.force_loop_body_sync {
            self.processor.prioritize_job_and_wait(id);
        } else {
            self.processor.prioritize_job(id);
        }
        Some(entry_point)
    }

    /// Admission control, then hand the item to the processor. Returns
    /// false when the item was refused.
    fn enqueue(&self, item: Arc<WorkItem>) -> bool {
        if item.entry_point.transition(CodeGenState::CodeGenQueued).is_err() {
            return false;
        }

        let body = &item.body;
        if !item.forced && self.exceeds_size_limits(body) {
            // Too large to be worth compiling. The entry point stays at
            // queued so callers keep dispatching to the interpreter; no
            // retry is scheduled. Forced items (loop bodies, prejit)
            // already have a frame waiting on them and are admitted
            // regardless.
            debug!(function = body.id.0, "refusing oversized body at admission");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut evict = None;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            if item.jit_mode() == Some(JitMode::FullJit) && !item.is_loop_body() {
                if inner.queued_full.len() >= self.config.max_jit_queue_len {
                    evict = inner.queued_full.first().copied();
                }
                inner.queued_full.push(item.id);
            }
            inner.items.insert(item.id, Arc::clone(&item));
        }

        if let Some(victim) = evict {
            self.evict_queued(victim);
        }

        item.set_queue_state(QueueState::InJitQueue);
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        // Full-jit items form the processor's critical class so they are
        // dequeued ahead of every simple-jit item still waiting.
        let critical = item.jit_mode() == Some(JitMode::FullJit);
        self.processor.add_job(item.id, critical);
        true
    }

    fn exceeds_size_limits(&self, body: &FunctionBody) -> bool {
        body.bytecode_len_bytes > self.config.max_bytecode_bytes
            || body.instruction_count > self.config.max_instructions
    }

    /// Best-effort removal of the oldest queued full-jit item. If the
    /// processor already started it, leave it alone.
    fn evict_queued(&self, victim: WorkItemId) {
        if !self.processor.remove_job(victim) {
            trace!(job = victim, "eviction candidate already in flight");
            return;
        }
        let item = {
            let mut inner = self.inner.lock();
            inner.queued_full.retain(|&id| id != victim);
            inner.items.remove(&victim)
        };
        if let Some(item) = item {
            item.entry_point.fail(FailureReason::NotScheduledBudget);
            item.set_queue_state(QueueState::NotInQueue);
            self.stats.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(function = item.body.id.0, "evicted queued full-jit item");
        }
    }

    /// A call reached an entry point whose code is not ready. Pull its
    /// compile to the front and wait for it, then report where the call
    /// should go. Compiles that failed leave the caller on the
    /// interpreter permanently.
    pub fn check_codegen_thunk(
        &self,
        entry_point: &Arc<EntryPoint>,
    ) -> brio_core::entry_point::CallTarget {
        if entry_point.is_pending_or_queued() {
            let pending = {
                let inner = self.inner.lock();
                inner
                    .items
                    .values()
                    .find(|item| Arc::ptr_eq(&item.entry_point, entry_point))
                    .cloned()
            };
            if let Some(item) = pending {
                if item.queue_state() == QueueState::InForegroundQueue {
                    // A real call arrived; the item stops being
                    // speculative right here.
                    self.promote_unscheduled(&item, false);
                }
                self.processor.prioritize_job_and_wait(item.id);
            }
        }
        entry_point.call_target()
    }

    /// Compile one item, retrying with individual speculations disabled
    /// until the pipeline converges. The speculation set is finite and
    /// disabling is idempotent, so the retry count is bounded by the
    /// number of flags.
    fn compile_item(&self, item: &Arc<WorkItem>) -> bool {
        let body = &item.body;
        let mode = match item.jit_mode() {
            Some(mode) => mode,
            None => {
                item.entry_point.fail(FailureReason::Aborted);
                return false;
            }
        };
        debug_assert!(
            item.verify_jit_mode(mode),
            "work item tier changed between dequeue and compile"
        );

        if !self.admit_for_processing(item) {
            return false;
        }

        if let Some(remote) = self.remote.lock().clone() {
            return self.compile_item_remote(item, mode, &remote);
        }

        let mut attempt_item = Arc::clone(item);
        for attempt in 0..=Speculation::COUNT {
            let live = attempt_item.live_instance();
            let data = gather_codegen_data(
                &self.ctx,
                body,
                body,
                &self.config.inlining,
                self.config.aggressive_inlining,
                live.as_deref(),
            );
            attempt_item.attach_snapshot(Arc::clone(&data));

            let outcome = Pipeline::new(
                &self.config,
                &self.ctx,
                body,
                &data,
                mode,
                attempt_item.is_loop_body(),
            )
            .run();

            match outcome {
                PipelineOutcome::Completed { block, transfer } => {
                    return self.publish(&attempt_item, mode, block, 0, transfer);
                }
                PipelineOutcome::NeedsRejit(reason) => {
                    let newly = body.speculations().disable(reason.speculation());
                    self.stats.rejits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        function = body.id.0,
                        ?reason,
                        attempt,
                        "pipeline demands rejit"
                    );
                    if !newly {
                        // The flag was already clear yet the pipeline
                        // asked again; no further attempt can differ.
                        item.entry_point.fail(FailureReason::Aborted);
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    attempt_item = self.fresh_attempt(&attempt_item);
                }
                PipelineOutcome::Failed(err) => {
                    item.entry_point.fail(failure_reason(err));
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(function = body.id.0, %err, "compile failed");
                    return false;
                }
            }
        }
        item.entry_point.fail(FailureReason::Aborted);
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Admission is re-checked when the worker picks the item up; the
    /// budget that admitted it at enqueue time may be gone by now.
    /// Declined items leave the entry point at queued, exactly like a
    /// refusal at enqueue time.
    fn admit_for_processing(&self, item: &Arc<WorkItem>) -> bool {
        if item.forced {
            return true;
        }
        if self.exceeds_size_limits(&item.body)
            || process_code_bytes() >= self.config.process_code_budget_bytes
        {
            item.mark_dropped();
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                function = item.body.id.0,
                "dropping work item at processing time"
            );
            return false;
        }
        true
    }

    /// Every rejit retry runs through a brand-new work item so no
    /// snapshot or bookkeeping survives from the failed attempt. The
    /// entry point carries over; retry items never enter the job queue
    /// or the item table.
    fn fresh_attempt(&self, prior: &Arc<WorkItem>) -> Arc<WorkItem> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(WorkItem::new(
            id,
            Arc::clone(&prior.body),
            prior.kind.clone(),
            Arc::clone(&prior.entry_point),
            prior.forced,
        ));
        if let Some(mode) = prior.jit_mode() {
            item.set_jit_mode(mode);
        }
        if let Some(live) = prior.live_instance() {
            item.set_live_instance(live);
        }
        item
    }

    /// Remote compiles retry on rejit demands exactly like local ones:
    /// the speculation flag lives on this side, so the requester clears
    /// it and issues a fresh call through a fresh work item.
    fn compile_item_remote(
        &self,
        item: &Arc<WorkItem>,
        mode: JitMode,
        remote: &Arc<dyn RemoteCompiler>,
    ) -> bool {
        let body = &item.body;
        let mut attempt_item = Arc::clone(item);
        for attempt in 0..=Speculation::COUNT {
            let wire = SerializedWorkItem {
                function: body.id,
                jit_mode: mode,
                loop_id: attempt_item.loop_id(),
                bytecode_len_bytes: body.bytecode_len_bytes,
                instruction_count: body.instruction_count,
            };
            match remote.compile(&wire, RemoteContextHandle(body.id.0 as u64)) {
                Ok(result) => {
                    let mut block = NativeCodeBlock::new(result.code);
                    let base = block.base() as u64;
                    if let Err(err) = apply_fixups(block.bytes_mut(), base, &result.fixups) {
                        panic!("jit transport protocol violation: {err}");
                    }
                    return self.publish(
                        &attempt_item,
                        mode,
                        block,
                        result.thunk_offset as usize,
                        result.transfer,
                    );
                }
                Err(TransportError::NeedsRejit(reason)) => {
                    let newly = body.speculations().disable(reason.speculation());
                    self.stats.rejits.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        function = body.id.0,
                        ?reason,
                        attempt,
                        "remote pipeline demands rejit"
                    );
                    if !newly {
                        item.entry_point.fail(FailureReason::Aborted);
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    attempt_item = self.fresh_attempt(&attempt_item);
                }
                Err(err) => match err.disposition() {
                    FailureDisposition::DowngradeToAborted => {
                        warn!(function = body.id.0, %err, "jit transport unavailable");
                        item.entry_point.fail(FailureReason::Aborted);
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    FailureDisposition::Surface(backend_err) => {
                        item.entry_point.fail(failure_reason(backend_err));
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    FailureDisposition::FailFast => {
                        panic!("jit transport protocol violation: {err}");
                    }
                },
            }
        }
        item.entry_point.fail(FailureReason::Aborted);
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Record the transfer data, flip the entry point live, and retain
    /// the block for as long as the entry point stays installed.
    /// `entry_offset` is where calls land inside the block; remote
    /// results enter through their calling-convention thunk rather than
    /// at the block base.
    fn publish(
        &self,
        item: &Arc<WorkItem>,
        mode: JitMode,
        block: NativeCodeBlock,
        entry_offset: usize,
        transfer: brio_core::EntryPointTransferData,
    ) -> bool {
        let entry_point = &item.entry_point;
        if entry_point.record(transfer).is_err() {
            // Raced with a failure (eviction or close); drop the code.
            return false;
        }
        let base = block.base();
        let len = block.len();
        debug_assert!(entry_offset < len.max(1));
        add_process_code_bytes(len);
        {
            let mut inner = self.inner.lock();
            inner.live_code.insert(item.id, block);
        }
        if entry_point.publish(base + entry_offset, len).is_err() {
            let block = self.inner.lock().live_code.remove(&item.id);
            if let Some(block) = block {
                self.deferred_free.defer(block);
            }
            return false;
        }
        {
            let mut exec = item.body.execution().lock();
            match mode {
                JitMode::SimpleJit => exec.on_simple_jit_installed(),
                JitMode::FullJit => exec.on_full_jit_installed(),
            }
        }
        self.stats.compiled.fetch_add(1, Ordering::Relaxed);
        debug!(
            function = item.body.id.0,
            ?mode,
            code_bytes = len,
            "published native code"
        );
        true
    }

    /// Release retired entry points for `body` whose frames can no longer
    /// be live, moving their code onto the deferred-free list.
    pub fn sweep_retired(&self, body: &Arc<FunctionBody>) {
        for entry_point in body.take_retired_entry_points() {
            if entry_point.is_pending_or_queued() {
                // Superseded before it ever finished.
                entry_point.fail(FailureReason::Aborted);
            }
            let block = entry_point.native_address().and_then(|address| {
                let mut inner = self.inner.lock();
                // The published address may sit inside the block (thunk
                // entry), so match by range rather than base.
                let id = inner
                    .live_code
                    .iter()
                    .find(|(_, block)| block.range().contains(&address))
                    .map(|(&id, _)| id);
                id.and_then(|id| inner.live_code.remove(&id))
            });
            if let Some(block) = block {
                self.deferred_free.defer(block);
            }
        }
    }

    /// Free deferred blocks no stack frame can still reference.
    pub fn sweep_deferred(&self, still_live: impl Fn(&std::ops::Range<usize>) -> bool) -> usize {
        self.deferred_free.sweep(still_live)
    }

    pub fn deferred_free_list(&self) -> &DeferredFreeList {
        &self.deferred_free
    }

    /// Promote parked speculative items into the queue while the budget
    /// lasts. Called from a worker that is about to go idle.
    fn promote_speculative_work(&self) {
        loop {
            let item = {
                let mut inner = self.inner.lock();
                if inner.closed
                    || inner.speculative_bytes >= self.config.speculative_jit_bytecode_target
                    || inner.unscheduled.is_empty()
                {
                    return;
                }
                let item = inner.unscheduled.remove(0);
                inner.speculative_bytes += u64::from(item.body.bytecode_len_bytes);
                // Drop the table entry; enqueue re-inserts it.
                inner.items.remove(&item.id);
                item
            };
            // Parked items carry no tier; the execution ladder picks one
            // at promotion time.
            let mode = {
                let exec = item.body.execution().lock();
                if exec.is_hot_enough_for_full_jit() {
                    JitMode::FullJit
                } else {
                    JitMode::SimpleJit
                }
            };
            item.set_jit_mode(mode);
            item.entry_point.set_jit_mode(mode);
            self.stats.speculative_promoted.fetch_add(1, Ordering::Relaxed);
            trace!(function = item.body.id.0, "promoting speculative work");
            if !self.enqueue(item) {
                continue;
            }
        }
    }

    /// Stop accepting work and abort everything still pending. In-flight
    /// compiles finish; their results are discarded by the failed entry
    /// points.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            for item in inner.unscheduled.drain(..) {
                item.entry_point.fail(FailureReason::Aborted);
            }
        }
        self.processor.close();
        let mut inner = self.inner.lock();
        for item in inner.items.values() {
            if item.entry_point.is_pending_or_queued() {
                item.entry_point.fail(FailureReason::Aborted);
            }
        }
        inner.items.clear();
        inner.queued_full.clear();
    }
}

impl JobManager for NativeCodeGenerator {
    fn process(&self, job: JobId, background: bool) -> bool {
        let item = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.queued_full.retain(|&id| id != job);
            inner.items.get(&job).cloned()
        };
        let item = match item {
            Some(item) => item,
            None => return false,
        };
        trace!(job, background, function = item.body.id.0, "compiling work item");
        self.compile_item(&item)
    }

    fn job_processed(&self, job: JobId, succeeded: bool) {
        let item = {
            let mut inner = self.inner.lock();
            inner.queued_full.retain(|&id| id != job);
            inner.items.remove(&job)
        };
        if let Some(item) = item {
            item.set_queue_state(QueueState::NotInQueue);
            if item.was_dropped() {
                // Admission declined it at processing time; the entry
                // point stays queued so calls keep dispatching to the
                // interpreter.
            } else if !succeeded && item.entry_point.is_pending_or_queued() {
                // Close-drain path: the job never ran.
                item.entry_point.fail(FailureReason::Aborted);
            }
        }
    }

    fn should_process_in_foreground(&self, queue_depth: usize) -> bool {
        queue_depth > self.config.foreground_queue_depth_threshold
    }

    fn before_wait(&self) {
        // A worker is about to go idle; this is the only point where
        // speculative work enters the queue. `before_wait` is invoked
        // without the processor lock held, so enqueueing from here is
        // safe.
        self.promote_speculative_work();
    }
}

impl Drop for NativeCodeGenerator {
    fn drop(&mut self) {
        self.processor.close();
    }
}

fn failure_reason(err: BackendError) -> FailureReason {
    match err {
        BackendError::OutOfMemory => FailureReason::OutOfMemory,
        BackendError::StackOverflow => FailureReason::StackOverflow,
        BackendError::Aborted => FailureReason::Aborted,
    }
}
