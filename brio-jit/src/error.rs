//! Error types for the code generation backend

/// A condition that terminates one compilation attempt.
///
/// These are caught at the work-dispatch boundary, recorded on the work
/// item, and resolved before control returns to the function's caller; a
/// compile failure is never visible above the request boundary. Resource
/// conditions are never silently downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("out of memory during code generation")]
    OutOfMemory,
    #[error("stack overflow during code generation")]
    StackOverflow,
    /// The context or transport closed while the job was in flight.
    /// Expected termination, not a bug.
    #[error("code generation aborted")]
    Aborted,
}

pub type BackendResult<T> = Result<T, BackendError>;
