//! Entry points: the mutable slot a function calls through
//!
//! An entry point tracks one compilation attempt from scheduling to
//! published native code (or failure). Its state only moves forward; a
//! recompilation allocates a brand-new entry point rather than rewinding
//! this one. The publish step is release-ordered so a thread calling
//! through the thunk either sees the pre-compile state or the fully
//! populated result, never a half-written one.

use crate::{CallSiteId, JitMode, PropertyId, TypeId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Code-gen progress of one entry point. Strictly increasing, except that
/// failure resets through `PendingCleanup` to `CleanedUp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CodeGenState {
    /// No compilation has been requested for this entry point.
    NotScheduled = 0,
    /// A code-gen job has been scheduled.
    CodeGenPending = 1,
    /// The job entered the jit queue and its profile snapshot is frozen.
    CodeGenQueued = 2,
    /// The backend completed, but the job has not been retired yet.
    CodeGenRecorded = 3,
    /// Native code is published and callable.
    CodeGenDone = 4,
    /// Failed; transfer data is being torn down.
    PendingCleanup = 5,
    /// Failed and fully torn down. The function runs interpreted.
    CleanedUp = 6,
}

impl CodeGenState {
    fn from_u8(v: u8) -> CodeGenState {
        match v {
            0 => CodeGenState::NotScheduled,
            1 => CodeGenState::CodeGenPending,
            2 => CodeGenState::CodeGenQueued,
            3 => CodeGenState::CodeGenRecorded,
            4 => CodeGenState::CodeGenDone,
            5 => CodeGenState::PendingCleanup,
            _ => CodeGenState::CleanedUp,
        }
    }
}

/// Why a compilation attempt terminated without publishing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    OutOfMemory,
    StackOverflow,
    /// The context or transport closed while the job was in flight.
    Aborted,
    /// Admission control declined the work; not an error.
    NotScheduledBudget,
}

/// Guard and cache data transferred out of a finished full-jit compilation.
///
/// The runtime consults this on every call until the entry point is
/// superseded, so it is written in full before the done flag flips.
#[derive(Debug, Clone, Default)]
pub struct EntryPointTransferData {
    /// Native stack frame height in bytes.
    pub frame_height: u32,
    /// Offsets of local-variable debug slots within the frame.
    pub debug_slot_offsets: Vec<i32>,
    /// Whether the stack-closure optimization was applied.
    pub stack_closure: bool,
    /// Frame offsets of each inlinee, outermost first.
    pub inlinee_frame_offsets: Vec<i32>,
    /// Shapes guarded by single-type guards.
    pub single_type_guards: Vec<TypeId>,
    /// Equivalent-type guard sets (polymorphic-but-compatible shapes).
    pub equivalent_type_guards: Vec<Vec<TypeId>>,
    /// Property id -> indices into the guard tables that depend on it.
    /// One-to-many: a shape change for a property invalidates exactly
    /// these guards.
    pub property_guard_index: Vec<(PropertyId, Vec<u32>)>,
    /// Constructor caches transferred for runtime invalidation.
    pub ctor_caches: Vec<(PropertyId, CallSiteId)>,
    /// Byte offsets of guard checks within the code buffer.
    pub type_guard_offsets: Vec<u32>,
}

/// Error from an invalid entry-point state transition.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid entry point transition {from:?} -> {to:?}")]
pub struct StateError {
    pub from: CodeGenState,
    pub to: CodeGenState,
}

/// The mutable slot, owned by the running function object, holding its
/// current callable address and compilation state.
#[derive(Debug)]
pub struct EntryPoint {
    state: AtomicU8,
    /// Address of the check-codegen thunk installed at schedule time.
    thunk_address: AtomicUsize,
    /// Published native code address; valid only once state is Done.
    native_address: AtomicUsize,
    code_size: AtomicUsize,
    jit_mode: Mutex<Option<JitMode>>,
    transfer: Mutex<Option<EntryPointTransferData>>,
    failure: Mutex<Option<FailureReason>>,
}

/// What a call through the thunk should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// No native code (yet, or ever); run the interpreter.
    Interpreter,
    /// Jump to published native code.
    Native(usize),
}

impl EntryPoint {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CodeGenState::NotScheduled as u8),
            thunk_address: AtomicUsize::new(0),
            native_address: AtomicUsize::new(0),
            code_size: AtomicUsize::new(0),
            jit_mode: Mutex::new(None),
            transfer: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CodeGenState {
        CodeGenState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the state machine. Transitions must move strictly forward
    /// and must not leave a terminal state.
    pub fn transition(&self, to: CodeGenState) -> Result<(), StateError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = CodeGenState::from_u8(current);
            if !Self::is_valid_transition(from, to) {
                return Err(StateError { from, to });
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn is_valid_transition(from: CodeGenState, to: CodeGenState) -> bool {
        use CodeGenState::*;
        if to <= from {
            return false;
        }
        match from {
            CodeGenDone | CleanedUp => false,
            PendingCleanup => to == CleanedUp,
            // Failure may reset from any pre-terminal state.
            _ => to != CleanedUp || from == PendingCleanup,
        }
    }

    pub fn is_pending_or_queued(&self) -> bool {
        matches!(
            self.state(),
            CodeGenState::CodeGenPending | CodeGenState::CodeGenQueued | CodeGenState::CodeGenRecorded
        )
    }

    pub fn is_done(&self) -> bool {
        self.state() == CodeGenState::CodeGenDone
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.state() == CodeGenState::CleanedUp
    }

    /// Record the tier this entry point is being compiled at. Set once.
    pub fn set_jit_mode(&self, mode: JitMode) {
        let mut slot = self.jit_mode.lock();
        debug_assert!(slot.is_none() || *slot == Some(mode), "jit mode changed after being set");
        *slot = Some(mode);
    }

    pub fn jit_mode(&self) -> Option<JitMode> {
        *self.jit_mode.lock()
    }

    pub fn install_thunk(&self, thunk_address: usize) {
        self.thunk_address.store(thunk_address, Ordering::Release);
    }

    pub fn thunk_address(&self) -> usize {
        self.thunk_address.load(Ordering::Acquire)
    }

    /// Record backend output without retiring the job yet.
    pub fn record(&self, transfer: EntryPointTransferData) -> Result<(), StateError> {
        *self.transfer.lock() = Some(transfer);
        self.transition(CodeGenState::CodeGenRecorded)
    }

    /// Publish the finished native code. All transfer fields are written
    /// before the terminal state store; the state store is the release
    /// point readers synchronize with.
    pub fn publish(&self, native_address: usize, code_size: usize) -> Result<(), StateError> {
        self.native_address.store(native_address, Ordering::Relaxed);
        self.code_size.store(code_size, Ordering::Relaxed);
        self.transition(CodeGenState::CodeGenDone)
    }

    /// Drive the entry point through the failure path. Idempotent once
    /// cleaned up.
    pub fn fail(&self, reason: FailureReason) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(reason);
            }
        }
        // Either transition may lose a race with a concurrent failure;
        // the terminal state is the same either way.
        let _ = self.transition(CodeGenState::PendingCleanup);
        *self.transfer.lock() = None;
        let _ = self.transition(CodeGenState::CleanedUp);
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        *self.failure.lock()
    }

    /// Resolve what a call through the thunk should do right now.
    pub fn call_target(&self) -> CallTarget {
        if self.state() == CodeGenState::CodeGenDone {
            CallTarget::Native(self.native_address.load(Ordering::Relaxed))
        } else {
            CallTarget::Interpreter
        }
    }

    pub fn native_address(&self) -> Option<usize> {
        match self.call_target() {
            CallTarget::Native(addr) => Some(addr),
            CallTarget::Interpreter => None,
        }
    }

    pub fn code_size(&self) -> usize {
        self.code_size.load(Ordering::Relaxed)
    }

    pub fn transfer_data(&self) -> Option<EntryPointTransferData> {
        if self.is_done() || self.state() == CodeGenState::CodeGenRecorded {
            self.transfer.lock().clone()
        } else {
            None
        }
    }
}

impl Default for EntryPoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_advance_monotonically() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenPending).unwrap();
        ep.transition(CodeGenState::CodeGenQueued).unwrap();
        ep.record(EntryPointTransferData::default()).unwrap();
        ep.publish(0xdead_0000, 64).unwrap();
        assert!(ep.is_done());

        // Done is terminal: nothing moves it again.
        assert!(ep.transition(CodeGenState::PendingCleanup).is_err());
        assert!(ep.transition(CodeGenState::CleanedUp).is_err());
    }

    #[test]
    fn backwards_transitions_are_rejected() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenQueued).unwrap();
        assert!(ep.transition(CodeGenState::CodeGenPending).is_err());
    }

    #[test]
    fn cleanup_requires_pending_cleanup_first() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenPending).unwrap();
        assert!(ep.transition(CodeGenState::CleanedUp).is_err());
        ep.fail(FailureReason::OutOfMemory);
        assert!(ep.is_cleaned_up());
        assert_eq!(ep.failure_reason(), Some(FailureReason::OutOfMemory));
    }

    #[test]
    fn call_target_is_interpreter_until_done() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenPending).unwrap();
        ep.transition(CodeGenState::CodeGenQueued).unwrap();
        assert_eq!(ep.call_target(), CallTarget::Interpreter);
        ep.record(EntryPointTransferData::default()).unwrap();
        ep.publish(0x4000, 128).unwrap();
        assert_eq!(ep.call_target(), CallTarget::Native(0x4000));
    }

    #[test]
    fn failed_entry_point_keeps_interpreter_target() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenPending).unwrap();
        ep.fail(FailureReason::StackOverflow);
        assert_eq!(ep.call_target(), CallTarget::Interpreter);
        assert!(ep.transfer_data().is_none());
    }

    #[test]
    fn first_failure_reason_wins() {
        let ep = EntryPoint::new();
        ep.transition(CodeGenState::CodeGenPending).unwrap();
        ep.fail(FailureReason::Aborted);
        ep.fail(FailureReason::OutOfMemory);
        assert_eq!(ep.failure_reason(), Some(FailureReason::Aborted));
    }

    #[test]
    fn jit_mode_is_set_once() {
        let ep = EntryPoint::new();
        ep.set_jit_mode(JitMode::FullJit);
        // Re-setting the same mode is fine.
        ep.set_jit_mode(JitMode::FullJit);
        assert_eq!(ep.jit_mode(), Some(JitMode::FullJit));
    }
}
