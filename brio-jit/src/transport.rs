//! Out-of-process JIT transport
//!
//! In OOP mode the pipeline runs in a separate process: the work item's
//! description goes over as a flat buffer, and a flat code buffer plus a
//! fixup table comes back. The compiling process cannot know the buffer's
//! final address, so every internal pointer is expressed as a
//! (source-offset, target-offset) pair and rebased by one linear pass once
//! the receiving side owns the buffer. The fixup format is transport
//! independent: an in-process adapter drives the normal pipeline behind
//! the same trait.

use crate::config::BackendConfig;
use crate::data::CodeGenData;
use crate::error::BackendError;
use crate::pipeline::{Pipeline, PipelineOutcome, RejitReason};
use brio_core::{EntryPointTransferData, FunctionId, JitMode, LoopId, ScriptContext};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::sync::Arc;
use thiserror::Error;

/// Opaque handle identifying the requesting context to the remote
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteContextHandle(pub u64);

/// Transport-level failure classification.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The remote process is unreachable. Downgraded to best-effort: the
    /// compile is treated as aborted and state updates no-op.
    #[error("transport call failed: {0}")]
    CallFailed(String),
    /// Real resource condition reported by the remote side. Always
    /// surfaced.
    #[error("remote process out of memory")]
    RemoteOutOfMemory,
    /// Always surfaced, like out-of-memory.
    #[error("remote process stack overflow")]
    RemoteStackOverflow,
    /// The remote pipeline wants a speculation disabled before it can
    /// finish. The requester clears the flag locally and retries the
    /// call, so the bounded-convergence guarantee holds across the
    /// process boundary too.
    #[error("remote pipeline demands rejit: {0:?}")]
    NeedsRejit(RejitReason),
    /// Malformed or unknown response; indicates a protocol bug.
    #[error("unknown transport failure code {0}")]
    Unknown(u32),
    #[error("malformed transport payload: {0}")]
    Malformed(String),
}

/// What the dispatcher should do with a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Treat as an expected termination; further calls no-op.
    DowngradeToAborted,
    /// Surface the condition to the requester.
    Surface(BackendError),
    /// Protocol or environment bug: fail fast rather than limp on.
    FailFast,
}

impl TransportError {
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            TransportError::CallFailed(_) => FailureDisposition::DowngradeToAborted,
            TransportError::RemoteOutOfMemory => {
                FailureDisposition::Surface(BackendError::OutOfMemory)
            }
            TransportError::RemoteStackOverflow => {
                FailureDisposition::Surface(BackendError::StackOverflow)
            }
            // The retry loop consumes rejit demands before dispositions
            // apply; a caller without one treats the attempt as aborted.
            TransportError::NeedsRejit(_) => FailureDisposition::DowngradeToAborted,
            TransportError::Unknown(_) | TransportError::Malformed(_) => {
                FailureDisposition::FailFast
            }
        }
    }
}

/// One internal-pointer relocation: write `base + target` at
/// `base + source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixup {
    pub source: u32,
    pub target: u32,
}

/// Serialized description of one work item, as sent to the remote
/// process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedWorkItem {
    pub function: FunctionId,
    pub jit_mode: JitMode,
    /// Present for loop-body work items.
    pub loop_id: Option<LoopId>,
    pub bytecode_len_bytes: u32,
    pub instruction_count: u32,
}

const WIRE_MAGIC: u32 = 0x4a42_5257; // "WRBJ"

impl SerializedWorkItem {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.write_u32::<LittleEndian>(WIRE_MAGIC).unwrap();
        buf.write_u32::<LittleEndian>(self.function.0).unwrap();
        buf.write_u8(match self.jit_mode {
            JitMode::SimpleJit => 0,
            JitMode::FullJit => 1,
        })
        .unwrap();
        match self.loop_id {
            Some(LoopId(id)) => {
                buf.write_u8(1).unwrap();
                buf.write_u32::<LittleEndian>(id).unwrap();
            }
            None => {
                buf.write_u8(0).unwrap();
                buf.write_u32::<LittleEndian>(0).unwrap();
            }
        }
        buf.write_u32::<LittleEndian>(self.bytecode_len_bytes).unwrap();
        buf.write_u32::<LittleEndian>(self.instruction_count).unwrap();
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        if magic != WIRE_MAGIC {
            return Err(TransportError::Malformed(format!(
                "bad magic {magic:#x}"
            )));
        }
        let function = FunctionId(read_u32(&mut cursor)?);
        let jit_mode = match read_u8(&mut cursor)? {
            0 => JitMode::SimpleJit,
            1 => JitMode::FullJit,
            other => {
                return Err(TransportError::Malformed(format!("bad jit mode {other}")))
            }
        };
        let has_loop = read_u8(&mut cursor)? != 0;
        let loop_raw = read_u32(&mut cursor)?;
        let loop_id = has_loop.then_some(LoopId(loop_raw));
        let bytecode_len_bytes = read_u32(&mut cursor)?;
        let instruction_count = read_u32(&mut cursor)?;
        Ok(Self {
            function,
            jit_mode,
            loop_id,
            bytecode_len_bytes,
            instruction_count,
        })
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, TransportError> {
    r.read_u32::<LittleEndian>()
        .map_err(|e| TransportError::Malformed(e.to_string()))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, TransportError> {
    r.read_u8().map_err(|e| TransportError::Malformed(e.to_string()))
}

/// Everything the remote side returns for one compiled work item.
#[derive(Debug, Clone)]
pub struct RemoteCompileResult {
    pub code: Vec<u8>,
    pub fixups: Vec<Fixup>,
    /// Re-entrant calling-convention thunk, as a remote-relative offset.
    pub thunk_offset: u32,
    pub transfer: EntryPointTransferData,
}

/// The single RPC surface: compile one serialized work item.
pub trait RemoteCompiler: Send + Sync {
    fn compile(
        &self,
        item: &SerializedWorkItem,
        context: RemoteContextHandle,
    ) -> Result<RemoteCompileResult, TransportError>;
}

/// Rebase every internal pointer in `code` against `base`. One linear
/// pass; each record writes the 8-byte value `base + target` at offset
/// `source`.
pub fn apply_fixups(code: &mut [u8], base: u64, fixups: &[Fixup]) -> Result<(), TransportError> {
    for fixup in fixups {
        let source = fixup.source as usize;
        let target = fixup.target as usize;
        if source + 8 > code.len() {
            return Err(TransportError::Malformed(format!(
                "fixup source {source} out of bounds for {} byte buffer",
                code.len()
            )));
        }
        if target >= code.len() {
            return Err(TransportError::Malformed(format!(
                "fixup target {target} out of bounds for {} byte buffer",
                code.len()
            )));
        }
        LittleEndian::write_u64(&mut code[source..source + 8], base + target as u64);
    }
    Ok(())
}

/// Drives the normal in-process pipeline behind the remote-compiler
/// trait, producing the same wire-shaped result.
pub struct InProcessCompiler {
    ctx: Arc<ScriptContext>,
    config: BackendConfig,
}

impl InProcessCompiler {
    pub fn new(ctx: Arc<ScriptContext>, config: BackendConfig) -> Self {
        Self { ctx, config }
    }
}

impl RemoteCompiler for InProcessCompiler {
    fn compile(
        &self,
        item: &SerializedWorkItem,
        _context: RemoteContextHandle,
    ) -> Result<RemoteCompileResult, TransportError> {
        let body = self
            .ctx
            .function(item.function)
            .ok_or_else(|| TransportError::CallFailed("unknown function".into()))?;
        // The remote side compiles from a bare description; it has no
        // live closures, so no fresher caches are available.
        let data: Arc<CodeGenData> = crate::gatherer::gather_codegen_data(
            &self.ctx,
            &body,
            &body,
            &self.config.inlining,
            self.config.aggressive_inlining,
            None,
        );
        let outcome = Pipeline::new(
            &self.config,
            &self.ctx,
            &body,
            &data,
            item.jit_mode,
            item.loop_id.is_some(),
        )
        .run();
        match outcome {
            PipelineOutcome::Completed { block, transfer } => {
                let mut code = block.bytes().to_vec();
                // The entry trampoline at offset 0 points at the first
                // post-prolog instruction; expressed as a fixup so the
                // receiver rebases it.
                let fixups = vec![Fixup { source: 0, target: 8 }];
                // Leave room for the rebased pointer.
                if code.len() < 8 {
                    code.resize(8, 0xcc);
                }
                Ok(RemoteCompileResult {
                    code,
                    fixups,
                    thunk_offset: 8,
                    transfer,
                })
            }
            PipelineOutcome::NeedsRejit(reason) => Err(TransportError::NeedsRejit(reason)),
            PipelineOutcome::Failed(BackendError::OutOfMemory) => {
                Err(TransportError::RemoteOutOfMemory)
            }
            PipelineOutcome::Failed(BackendError::StackOverflow) => {
                Err(TransportError::RemoteStackOverflow)
            }
            PipelineOutcome::Failed(BackendError::Aborted) => {
                Err(TransportError::CallFailed("remote compile aborted".into()))
            }
        }
    }
}
