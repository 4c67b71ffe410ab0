//! JIT compilation of Term trees to native machine code via Cranelift.
//!
//! A [`JitContext`] hosts sequential build sessions; each successful session
//! yields a [`CompiledFn`] whose parameters and return value all share the
//! tree's resolved function type.
//!
//! # Function Signatures
//!
//! - **Int function**: `fn(i64, ...) -> i64`, one `i64` per variable slot
//! - **Double function**: `fn(f64, ...) -> f64`
//! - **Apply trampoline** (per function): `fn(*const T) -> T` over a flat
//!   argument buffer, used by the typed and generic invocation helpers

#[cfg(test)]
mod tests;

mod compiler;

pub use compiler::{CompiledFn, JitContext};
