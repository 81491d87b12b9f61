//! Runtime-side data model shared by the Brio interpreter and the JIT backend
//!
//! This crate defines the structures the backend reads and publishes into:
//! function bodies with their runtime profile, entry points with their
//! code-gen state machine, and the execution-mode tier ladder that drives
//! promotion decisions.

pub mod entry_point;
pub mod execution_mode;
pub mod function_body;
pub mod profile;

pub use entry_point::{CallTarget, CodeGenState, EntryPoint, EntryPointTransferData, FailureReason};
pub use execution_mode::{ExecutionMode, ExecutionModeState, JitMode};
pub use function_body::{FunctionBody, FunctionInstance, ScriptContext, Speculation};
pub use profile::{CacheKind, InlineCache, RuntimeProfile, ValueType};

/// Unique id of a function body within one script context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Identifies one loop within a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(pub u32);

/// Interned property name id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyId(pub u32);

/// Object-shape identity (a type address in the runtime object model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u64);

/// Identifies one profiled call site or property-access site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteId(pub u32);

/// A bytecode register slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegSlot(pub u32);
