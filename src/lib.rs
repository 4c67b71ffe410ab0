//! fragjit — compile arithmetic expression fragments once, call them often.
//!
//! This crate JIT-compiles small arithmetic/comparison expression trees,
//! extracted from a host program's execution graph by an external scanner,
//! into native functions. The scanner replaces sub-fragments it cannot
//! represent with [`Term::Variable`] leaves carrying dense argument indices;
//! compilation turns the tree into a function of those arguments.
//!
//! Compilation is strictly an optimization: a fragment the engine cannot
//! lower comes back as a typed error and the host keeps interpreting it.
//!
//! ```no_run
//! use fragjit::{JitContext, NumericKind, Term};
//!
//! // (2.2 + (v1 + v0)) * v0
//! let tree = Term::mul(
//!     Term::add(
//!         Term::double(2.2),
//!         Term::add(
//!             Term::variable(1, NumericKind::Double),
//!             Term::variable(0, NumericKind::Double),
//!         ),
//!     ),
//!     Term::variable(0, NumericKind::Double),
//! );
//!
//! let ctx = JitContext::new();
//! let f = ctx.compile(&tree).unwrap();
//! assert_eq!(f.arity(), 2);
//! let y = f.call_f64(&[2.0, 5.0]);
//! assert!((y - 18.4).abs() < 1e-9);
//! ```

pub mod analyze;
mod error;
pub mod jit;
mod term;

pub use analyze::{arity, extract_vars, resolve_funtype, FunType, VarSlot};
pub use error::{CompileError, OpKind, Result};
pub use jit::{CompiledFn, JitContext};
pub use term::{BinOp, NumericKind, Term, UnOp, Value};
