//! Brio JIT backend
//!
//! The tiered native code generator for the Brio runtime. Function bodies
//! arrive from the interpreter with a live runtime profile; this crate
//! freezes the profile into an immutable snapshot, runs a fixed-order
//! compile pipeline over a compilation-unit tree (simple-jit or full-jit,
//! whole functions or single loop bodies), and publishes the results
//! through entry points the runtime calls through. Compilation normally
//! happens on background threads via the `brio-jobs` processor; a
//! degenerate foreground mode compiles on the requesting thread.
//!
//! The main entry point is [`NativeCodeGenerator`]:
//!
//! ```
//! use brio_core::{FunctionBody, ScriptContext};
//! use brio_core::function_body::FunctionAttributes;
//! use brio_jit::{BackendConfig, NativeCodeGenerator};
//! use std::sync::Arc;
//!
//! let ctx = Arc::new(ScriptContext::new());
//! let body = Arc::new(FunctionBody::new(
//!     brio_core::FunctionId(0),
//!     "main",
//!     120,
//!     30,
//!     FunctionAttributes::default(),
//!     Vec::new(),
//! ));
//! ctx.register_function(Arc::clone(&body));
//!
//! let generator = NativeCodeGenerator::new(Arc::clone(&ctx), BackendConfig::default());
//! let entry_point = generator.request_compile(&body, false, None).unwrap();
//! generator.check_codegen_thunk(&entry_point);
//! generator.close();
//! ```

pub mod code;
pub mod config;
pub mod data;
pub mod error;
pub mod func;
pub mod gatherer;
pub mod pipeline;
pub mod scheduler;
pub mod transport;
pub mod work_item;


pub use code::{DeferredFreeList, NativeCodeBlock};
pub use config::{BackendConfig, StackGrowthDirection};
pub use data::{CacheClassification, CodeGenData, SnapshotId};
pub use error::{BackendError, BackendResult};
pub use gatherer::{gather_codegen_data, InliningPolicy};
pub use pipeline::{Phase, Pipeline, PipelineOutcome, RejitReason};
pub use scheduler::{NativeCodeGenerator, SchedulerStats};
pub use transport::{Fixup, InProcessCompiler, RemoteCompiler, SerializedWorkItem, TransportError};
pub use work_item::{WorkItem, WorkItemId, WorkItemKind};
