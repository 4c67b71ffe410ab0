//! Read-only traversals over a [`Term`] tree: variable extraction and
//! function-type resolution.
//!
//! Both walks are pure; codegen runs them before opening a build session and
//! copies out everything it needs, so the caller keeps ownership of the tree.

use crate::term::{NumericKind, Term, UnOp};

/// The type applied uniformly to every parameter and the return value of a
/// compiled function. These are the only two supported ABI shapes; mixed
/// signatures do not exist. `UInt` leaves resolve to `Int` — there is no
/// unsigned compiled form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunType {
    Int,
    Double,
}

impl NumericKind {
    fn funtype(self) -> FunType {
        match self {
            NumericKind::Int | NumericKind::UInt => FunType::Int,
            NumericKind::Double => FunType::Double,
        }
    }
}

/// One `Variable` occurrence, in source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarSlot {
    pub index: usize,
    pub declared: NumericKind,
}

/// Collects every `Variable` leaf in a left-to-right, depth-first walk.
///
/// Duplicates are included: a slot referenced twice appears twice. Codegen
/// derives arity from the maximum index observed, not from the occurrence
/// count.
pub fn extract_vars(term: &Term) -> Vec<VarSlot> {
    let mut vars = Vec::new();
    collect_vars(term, &mut vars);
    vars
}

fn collect_vars(term: &Term, vars: &mut Vec<VarSlot>) {
    match term {
        Term::Constant(_) => {}
        Term::Variable { index, declared } => vars.push(VarSlot {
            index: *index,
            declared: *declared,
        }),
        Term::Binary { left, right, .. } => {
            collect_vars(left, vars);
            collect_vars(right, vars);
        }
        Term::Unary { operand, .. } => collect_vars(operand, vars),
    }
}

/// Number of formal parameters the compiled function needs: one past the
/// maximum variable index, or zero for a variable-free tree. An index in that
/// range with no occurrence is still a (unread) parameter.
pub fn arity(term: &Term) -> usize {
    extract_vars(term)
        .iter()
        .map(|v| v.index + 1)
        .max()
        .unwrap_or(0)
}

/// Resolves the single numeric type of the whole tree: `Double` dominates.
///
/// A binary node resolves its left operand first and short-circuits when that
/// is already `Double`; otherwise the right operand is resolved in full, so a
/// `Double` nested at any depth of either subtree promotes the tree. The
/// float intrinsics (`sin`, `cos`, `sqrt`, `log`, `exp`) force `Double`
/// regardless of their operand; `TruncToInt` and `BoolNot` take their
/// operand's type.
pub fn resolve_funtype(term: &Term) -> FunType {
    match term {
        Term::Constant(value) => value.kind().funtype(),
        Term::Variable { declared, .. } => declared.funtype(),
        Term::Binary { left, right, .. } => {
            if resolve_funtype(left) == FunType::Double {
                FunType::Double
            } else {
                resolve_funtype(right)
            }
        }
        Term::Unary { op, operand } => match op {
            UnOp::Sin | UnOp::Cos | UnOp::Sqrt | UnOp::Log | UnOp::Exp => FunType::Double,
            UnOp::TruncToInt | UnOp::BoolNot => resolve_funtype(operand),
        },
    }
}
