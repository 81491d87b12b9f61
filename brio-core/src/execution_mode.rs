//! Execution-mode tier ladder for function bodies
//!
//! A function climbs from plain interpretation through the profiling
//! interpreter tiers into simple-jit and finally full-jit code. The backend
//! scheduler only consults this state to decide promotion; the transitions
//! themselves are driven by the interpreter's call counting.

/// Optimization tier requested for one compilation.
///
/// Chosen once per work item and asserted to never change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JitMode {
    /// Cheap, fast-compiling tier with few speculative optimizations.
    SimpleJit,
    /// The final, most-optimized tier.
    FullJit,
}

/// Where a function body currently executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionMode {
    Interpreter,
    AutoProfilingInterpreter,
    SimpleJit,
    ProfilingInterpreter,
    FullJit,
}

/// Per-body execution-mode state with the call counting that drives
/// tier transitions.
#[derive(Debug)]
pub struct ExecutionModeState {
    mode: ExecutionMode,
    interpreted_calls: u64,
    /// Calls in a profiling tier before the body is considered hot enough
    /// for a direct promotion to full jit.
    full_jit_threshold: u64,
}

impl ExecutionModeState {
    pub fn new(full_jit_threshold: u64) -> Self {
        Self {
            mode: ExecutionMode::Interpreter,
            interpreted_calls: 0,
            full_jit_threshold,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Record one interpreted call; moves the body into the auto-profiling
    /// tier after its first call so profile data starts accumulating.
    pub fn record_interpreted_call(&mut self) {
        self.interpreted_calls += 1;
        if self.mode == ExecutionMode::Interpreter {
            self.mode = ExecutionMode::AutoProfilingInterpreter;
        }
    }

    pub fn interpreted_calls(&self) -> u64 {
        self.interpreted_calls
    }

    /// Whether the execution-mode transition logic says this body deserves
    /// a direct promotion to full jit, skipping the simple-jit tier.
    pub fn is_hot_enough_for_full_jit(&self) -> bool {
        self.interpreted_calls >= self.full_jit_threshold
    }

    /// Called when simple-jit code for the body is installed.
    pub fn on_simple_jit_installed(&mut self) {
        if self.mode < ExecutionMode::SimpleJit {
            self.mode = ExecutionMode::SimpleJit;
        }
    }

    /// Called when full-jit code for the body is installed.
    pub fn on_full_jit_installed(&mut self) {
        self.mode = ExecutionMode::FullJit;
    }

    /// Called when a rejit or failure sends the body back to the
    /// profiling interpreter.
    pub fn on_code_discarded(&mut self) {
        self.mode = ExecutionMode::ProfilingInterpreter;
    }

    /// True once the body runs full-jit code and the transition logic does
    /// not expect it to fall back to interpretation. Loop-body compilation
    /// for such a body is wasted work.
    pub fn was_full_jitted_and_wont_interpret_again(&self) -> bool {
        self.mode == ExecutionMode::FullJit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn climbs_into_auto_profiling_on_first_call() {
        let mut state = ExecutionModeState::new(10);
        assert_eq!(state.mode(), ExecutionMode::Interpreter);
        state.record_interpreted_call();
        assert_eq!(state.mode(), ExecutionMode::AutoProfilingInterpreter);
    }

    #[test]
    fn hot_threshold_gates_full_jit_promotion() {
        let mut state = ExecutionModeState::new(3);
        for _ in 0..2 {
            state.record_interpreted_call();
        }
        assert!(!state.is_hot_enough_for_full_jit());
        state.record_interpreted_call();
        assert!(state.is_hot_enough_for_full_jit());
    }

    #[test]
    fn full_jit_is_terminal_for_loop_body_requests() {
        let mut state = ExecutionModeState::new(1);
        state.on_full_jit_installed();
        assert!(state.was_full_jitted_and_wont_interpret_again());
        state.on_code_discarded();
        assert!(!state.was_full_jitted_and_wont_interpret_again());
    }
}
