//! Expression trees for fragment compilation.
//!
//! A [`Term`] is the IR handed to this crate by the component that scans the
//! host program's execution graph: a finite, acyclic tree of numeric
//! constants, argument-slot variables and arithmetic operators. Sub-fragments
//! the scanner could not represent have already been replaced by `Variable`
//! leaves carrying a dense argument index and the numeric kind imposed by
//! their usage context.
//!
//! Terms are immutable value trees. Each node owns its children through
//! `Box`, so dropping the root releases every reachable node exactly once and
//! a double free is unrepresentable. `Clone` is a deep copy; two trees never
//! share a subtree.

/// The numeric kinds a constant or variable leaf can carry.
///
/// `UInt` is modeled but compiles the same as `Int`: there is no dedicated
/// unsigned function shape (see [`crate::analyze::FunType`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Int,
    UInt,
    Double,
}

/// A constant value, stored per kind with no narrowing at construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Double(f64),
}

impl Value {
    pub fn kind(&self) -> NumericKind {
        match self {
            Value::Int(_) => NumericKind::Int,
            Value::UInt(_) => NumericKind::UInt,
            Value::Double(_) => NumericKind::Double,
        }
    }
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    LeftShift,
    RightShift,
    Equal,
    BoolAnd,
    BoolOr,
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Sin,
    Cos,
    Sqrt,
    Log,
    Exp,
    TruncToInt,
    BoolNot,
}

/// An expression tree node.
///
/// `Variable.index` identifies a call-argument slot of the compiled function.
/// Indices need not be contiguous as authored; the compiled arity is
/// `max(index) + 1` and an unreferenced index in that range is still a formal
/// parameter (unread).
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Constant(Value),
    Variable {
        index: usize,
        declared: NumericKind,
    },
    Binary {
        op: BinOp,
        left: Box<Term>,
        right: Box<Term>,
    },
    Unary {
        op: UnOp,
        operand: Box<Term>,
    },
}

impl Term {
    // Constructors for each variant

    pub fn constant(value: Value) -> Self {
        Term::Constant(value)
    }

    pub fn int(value: i64) -> Self {
        Term::Constant(Value::Int(value))
    }

    pub fn uint(value: u64) -> Self {
        Term::Constant(Value::UInt(value))
    }

    pub fn double(value: f64) -> Self {
        Term::Constant(Value::Double(value))
    }

    pub fn variable(index: usize, declared: NumericKind) -> Self {
        Term::Variable { index, declared }
    }

    pub fn binary(op: BinOp, left: Term, right: Term) -> Self {
        Term::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnOp, operand: Term) -> Self {
        Term::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    // Sugar for the common arithmetic kinds

    pub fn add(left: Term, right: Term) -> Self {
        Term::binary(BinOp::Add, left, right)
    }

    pub fn sub(left: Term, right: Term) -> Self {
        Term::binary(BinOp::Subtract, left, right)
    }

    pub fn mul(left: Term, right: Term) -> Self {
        Term::binary(BinOp::Multiply, left, right)
    }

    pub fn div(left: Term, right: Term) -> Self {
        Term::binary(BinOp::Divide, left, right)
    }

    pub fn eq(left: Term, right: Term) -> Self {
        Term::binary(BinOp::Equal, left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_keep_their_kind() {
        assert_eq!(Term::int(-3), Term::Constant(Value::Int(-3)));
        assert_eq!(Value::UInt(7).kind(), NumericKind::UInt);
        assert_eq!(Value::Double(2.5).kind(), NumericKind::Double);
    }

    #[test]
    fn trees_are_deep_copies() {
        let a = Term::mul(Term::add(Term::int(1), Term::variable(0, NumericKind::Int)), Term::int(2));
        let b = a.clone();
        assert_eq!(a, b);
        // Dropping one tree must not touch the sibling copy.
        drop(a);
        assert_eq!(
            b,
            Term::mul(Term::add(Term::int(1), Term::variable(0, NumericKind::Int)), Term::int(2))
        );
    }
}
