//! Error types for fragment compilation.
//!
//! Every variant here is recoverable: the caller's contract is "the JIT
//! attempt failed, keep running the fragment uncompiled". Malformed trees
//! (an out-of-range variable index reaching lowering, a kind that analysis
//! rules out) are bugs and panic instead.

use thiserror::Error;

use crate::analyze::FunType;
use crate::term::{BinOp, UnOp};

/// Why a fragment could not be compiled.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The tree uses an operator the engine cannot lower for the resolved
    /// function type (e.g. `Pow` over integers, shifts over doubles).
    #[error("operator {op:?} is not lowerable for {funtype:?} functions")]
    UnsupportedOp { op: OpKind, funtype: FunType },

    /// The backend rejected the function declaration or definition.
    #[error("backend module error: {0}")]
    Module(#[from] cranelift_module::ModuleError),

    /// The backend failed while finalizing machine code.
    #[error("backend codegen error: {0}")]
    Backend(String),
}

/// Operator kind carried by [`CompileError::UnsupportedOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Binary(BinOp),
    Unary(UnOp),
}

/// Result type alias for compilation operations.
pub type Result<T> = std::result::Result<T, CompileError>;
