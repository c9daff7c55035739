//! The crate's single error type and result alias.
//!
//! `CompileError` is a `thiserror` enum whose variants carry enough context to
//! explain a fatal compile. The spec's taxonomy groups them into three kinds:
//! unsupported input (`UnsupportedOpcode`, `Unsupported`, `Malformed`),
//! invariant violations (`BranchNotBlockFinal`, `StackDepthMismatch`,
//! `FallthroughToMultiple`, `CriticalEdge`, `RepairCycle`, `Internal`), and
//! resource exhaustion (`OutOfRegisters`). Any fatal condition discards the
//! whole in-progress method compile; there is no partial-result semantics.

use thiserror::Error;

use crate::bytecode::Opcode;
use crate::ir::{BlockId, VReg};

/// The result type threaded through every fallible pipeline pass.
pub type CompileResult<T> = Result<T, CompileError>;

/// A fatal condition encountered while compiling one method body.
#[derive(Debug, Error)]
pub enum CompileError {
    /// An opcode the back end does not lower (e.g. `jmp`, `throw`).
    #[error("unsupported opcode {opcode:?} at offset {offset:#x}")]
    UnsupportedOpcode { opcode: Opcode, offset: u32 },

    /// An unsupported input shape described by a static reason.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A truncated or undecodable body.
    #[error("malformed bytecode at offset {offset:#x}: {reason}")]
    Malformed { offset: u32, reason: &'static str },

    /// A method token with no entry in the module's method table.
    #[error("unknown method token {0}")]
    UnknownMethod(u32),

    /// A branch instruction that was not the final instruction of its block.
    #[error("branch at offset {offset:#x} is not block-final")]
    BranchNotBlockFinal { offset: u32 },

    /// Two predecessors reach a block with disagreeing operand-stack depths.
    #[error("stack depth mismatch at BB{block}: expected {expected}, found {found}")]
    StackDepthMismatch {
        block: BlockId,
        expected: u32,
        found: u32,
    },

    /// A fallthrough block with more than one successor.
    #[error("BB{block} falls through to multiple successors")]
    FallthroughToMultiple { block: BlockId },

    /// A critical edge needing multi-pair repair could not be resolved.
    #[error("critical edge into BB{block} needs multi-pair repair")]
    CriticalEdge { block: BlockId },

    /// A repair cycle longer than a single two-cycle swap.
    #[error("unresolvable repair cycle")]
    RepairCycle,

    /// Every register-allocation strategy was exhausted for this vreg.
    #[error("out of registers allocating R{vreg}")]
    OutOfRegisters { vreg: VReg },

    /// An internal invariant was violated — an unexpected compiler bug.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Construct a [`CompileError::Internal`] from format arguments.
macro_rules! internal {
    ($($arg:tt)*) => {
        $crate::error::CompileError::Internal(format!($($arg)*))
    };
}

pub(crate) use internal;
