//! Tests for JIT-compiled expression fragments.

use super::JitContext;
use crate::analyze::FunType;
use crate::error::CompileError;
use crate::term::{BinOp, NumericKind, Term, UnOp, Value};

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

/// Direct evaluation of a constant-only arithmetic tree, double semantics.
/// Reference for the round-trip tests; anything beyond `Constant` and the
/// four arithmetic kinds is out of its scope.
fn interp_f64(t: &Term) -> f64 {
    match t {
        Term::Constant(Value::Int(n)) => *n as f64,
        Term::Constant(Value::UInt(n)) => *n as f64,
        Term::Constant(Value::Double(x)) => *x,
        Term::Binary { op, left, right } => {
            let l = interp_f64(left);
            let r = interp_f64(right);
            match op {
                BinOp::Add => l + r,
                BinOp::Subtract => l - r,
                BinOp::Multiply => l * r,
                BinOp::Divide => l / r,
                other => panic!("interp_f64: unexpected op {other:?}"),
            }
        }
        other => panic!("interp_f64: unexpected node {other:?}"),
    }
}

/// Direct evaluation of a constant-only arithmetic tree, int semantics.
fn interp_int(t: &Term) -> i64 {
    match t {
        Term::Constant(Value::Int(n)) => *n,
        Term::Constant(Value::UInt(n)) => *n as i64,
        Term::Binary { op, left, right } => {
            let l = interp_int(left);
            let r = interp_int(right);
            match op {
                BinOp::Add => l + r,
                BinOp::Subtract => l - r,
                BinOp::Multiply => l * r,
                BinOp::Divide => l / r,
                other => panic!("interp_int: unexpected op {other:?}"),
            }
        }
        other => panic!("interp_int: unexpected node {other:?}"),
    }
}

/// Worked example fragment: (2.2 + (v1 + v0)) * v0.
fn example_tree() -> Term {
    Term::mul(
        Term::add(
            Term::double(2.2),
            Term::add(
                Term::variable(1, NumericKind::Double),
                Term::variable(0, NumericKind::Double),
            ),
        ),
        Term::variable(0, NumericKind::Double),
    )
}

#[test]
fn example_fragment_compiles_and_evaluates() {
    let ctx = JitContext::new();
    let f = ctx.compile(&example_tree()).unwrap();
    assert_eq!(f.funtype(), FunType::Double);
    assert_eq!(f.arity(), 2);
    assert_close(f.call_f64(&[2.0, 5.0]), 18.4);
    // Same function, fresh arguments.
    assert_close(f.call_f64(&[2.0, 3.8]), 16.0);
}

#[test]
fn constant_int_trees_round_trip_exactly() {
    let ctx = JitContext::new();
    let trees = [
        Term::add(Term::int(2), Term::int(40)),
        Term::sub(Term::mul(Term::int(6), Term::int(7)), Term::int(-8)),
        Term::div(Term::int(-17), Term::int(5)),
        Term::add(Term::uint(3), Term::mul(Term::int(4), Term::int(5))),
    ];
    for tree in &trees {
        let f = ctx.compile(tree).unwrap();
        assert_eq!(f.funtype(), FunType::Int);
        assert_eq!(f.arity(), 0);
        assert_eq!(f.call_int(&[]), interp_int(tree), "tree: {tree:?}");
    }
}

#[test]
fn constant_double_trees_round_trip_within_tolerance() {
    let ctx = JitContext::new();
    let trees = [
        Term::add(Term::double(2.3), Term::int(1)),
        Term::div(Term::double(1.0), Term::double(3.0)),
        Term::mul(Term::sub(Term::double(0.1), Term::double(0.7)), Term::int(9)),
    ];
    for tree in &trees {
        let f = ctx.compile(tree).unwrap();
        assert_eq!(f.funtype(), FunType::Double);
        assert_close(f.call_f64(&[]), interp_f64(tree));
    }
}

#[test]
fn sparse_variable_indices_widen_the_arity() {
    // Distinct indices {0, 1, 3}: arity 4, slot 2 present but unread.
    let tree = Term::add(
        Term::add(
            Term::variable(0, NumericKind::Int),
            Term::variable(3, NumericKind::Int),
        ),
        Term::variable(1, NumericKind::Int),
    );
    let ctx = JitContext::new();
    let f = ctx.compile(&tree).unwrap();
    assert_eq!(f.arity(), 4);
    assert_eq!(f.call_int(&[10, 20, 999, 30]), 60);
    assert_eq!(f.call_int(&[10, 20, -999, 30]), 60);
}

#[test]
fn mixed_tree_promotes_to_double_in_either_operand_order() {
    let ctx = JitContext::new();
    let f = ctx
        .compile(&Term::add(Term::double(2.5), Term::int(1)))
        .unwrap();
    assert_eq!(f.funtype(), FunType::Double);
    assert_close(f.call_f64(&[]), 3.5);

    // Int first along the left-biased resolution path, double only on the
    // right branch, nested one level down: still a double function.
    let f = ctx
        .compile(&Term::add(
            Term::int(1),
            Term::mul(Term::int(2), Term::double(0.25)),
        ))
        .unwrap();
    assert_eq!(f.funtype(), FunType::Double);
    assert_close(f.call_f64(&[]), 1.5);
}

#[test]
fn integer_division_truncates() {
    let ctx = JitContext::new();
    let f = ctx.compile(&Term::div(Term::int(7), Term::int(2))).unwrap();
    assert_eq!(f.call_int(&[]), 3);
}

#[test]
fn integer_shifts_and_comparisons() {
    let ctx = JitContext::new();
    let v = Term::variable(0, NumericKind::Int);

    let f = ctx
        .compile(&Term::binary(BinOp::LeftShift, v.clone(), Term::int(3)))
        .unwrap();
    assert_eq!(f.call_int(&[5]), 40);

    let f = ctx
        .compile(&Term::binary(BinOp::RightShift, v.clone(), Term::int(2)))
        .unwrap();
    assert_eq!(f.call_int(&[40]), 10);
    assert_eq!(f.call_int(&[-8]), -2);

    let f = ctx.compile(&Term::eq(v.clone(), Term::int(7))).unwrap();
    assert_eq!(f.call_int(&[7]), 1);
    assert_eq!(f.call_int(&[8]), 0);
}

#[test]
fn integer_boolean_operators_normalize_to_zero_or_one() {
    let ctx = JitContext::new();
    let v0 = Term::variable(0, NumericKind::Int);
    let v1 = Term::variable(1, NumericKind::Int);

    let and = ctx
        .compile(&Term::binary(BinOp::BoolAnd, v0.clone(), v1.clone()))
        .unwrap();
    assert_eq!(and.call_int(&[3, -2]), 1);
    assert_eq!(and.call_int(&[3, 0]), 0);
    assert_eq!(and.call_int(&[0, 0]), 0);

    let or = ctx
        .compile(&Term::binary(BinOp::BoolOr, v0.clone(), v1))
        .unwrap();
    assert_eq!(or.call_int(&[0, 5]), 1);
    assert_eq!(or.call_int(&[0, 0]), 0);

    let not = ctx
        .compile(&Term::unary(UnOp::BoolNot, v0))
        .unwrap();
    assert_eq!(not.call_int(&[0]), 1);
    assert_eq!(not.call_int(&[42]), 0);
}

#[test]
fn double_boolean_operators_normalize_to_zero_or_one() {
    let ctx = JitContext::new();
    let v0 = Term::variable(0, NumericKind::Double);
    let v1 = Term::variable(1, NumericKind::Double);

    let eq = ctx.compile(&Term::eq(v0.clone(), v1.clone())).unwrap();
    assert_close(eq.call_f64(&[2.5, 2.5]), 1.0);
    assert_close(eq.call_f64(&[2.5, 2.4]), 0.0);
    // NaN compares unequal to everything, itself included.
    assert_close(eq.call_f64(&[f64::NAN, f64::NAN]), 0.0);

    let and = ctx
        .compile(&Term::binary(BinOp::BoolAnd, v0.clone(), v1.clone()))
        .unwrap();
    assert_close(and.call_f64(&[3.5, -0.5]), 1.0);
    assert_close(and.call_f64(&[3.5, 0.0]), 0.0);
    // Only zero is false; NaN counts as truthy.
    assert_close(and.call_f64(&[f64::NAN, 1.0]), 1.0);

    let or = ctx
        .compile(&Term::binary(BinOp::BoolOr, v0.clone(), v1))
        .unwrap();
    assert_close(or.call_f64(&[0.0, 0.5]), 1.0);
    assert_close(or.call_f64(&[0.0, 0.0]), 0.0);
    assert_close(or.call_f64(&[0.0, -0.0]), 0.0);

    let not = ctx.compile(&Term::unary(UnOp::BoolNot, v0)).unwrap();
    assert_close(not.call_f64(&[0.0]), 1.0);
    assert_close(not.call_f64(&[2.0]), 0.0);
    assert_close(not.call_f64(&[f64::NAN]), 0.0);
}

#[test]
fn double_intrinsics() {
    let ctx = JitContext::new();
    let v = Term::variable(0, NumericKind::Double);

    let f = ctx.compile(&Term::unary(UnOp::Sin, v.clone())).unwrap();
    assert_close(f.call_f64(&[0.0]), 0.0);
    assert_close(f.call_f64(&[std::f64::consts::FRAC_PI_2]), 1.0);

    let f = ctx.compile(&Term::unary(UnOp::Cos, v.clone())).unwrap();
    assert_close(f.call_f64(&[0.0]), 1.0);

    let f = ctx.compile(&Term::unary(UnOp::Sqrt, v.clone())).unwrap();
    assert_close(f.call_f64(&[4.0]), 2.0);

    let f = ctx.compile(&Term::unary(UnOp::Log, v.clone())).unwrap();
    assert_close(f.call_f64(&[1.0]), 0.0);

    let f = ctx.compile(&Term::unary(UnOp::Exp, v.clone())).unwrap();
    assert_close(f.call_f64(&[0.0]), 1.0);

    let f = ctx
        .compile(&Term::binary(
            BinOp::Pow,
            v,
            Term::variable(1, NumericKind::Double),
        ))
        .unwrap();
    assert_close(f.call_f64(&[2.0, 10.0]), 1024.0);
}

#[test]
fn intrinsic_on_int_variable_promotes_the_tree() {
    // sqrt forces a double function even over an int-declared slot.
    let tree = Term::unary(UnOp::Sqrt, Term::variable(0, NumericKind::Int));
    let ctx = JitContext::new();
    let f = ctx.compile(&tree).unwrap();
    assert_eq!(f.funtype(), FunType::Double);
    assert_close(f.call_f64(&[9.0]), 3.0);
}

#[test]
fn trunc_to_int_discards_the_fraction() {
    let ctx = JitContext::new();
    let f = ctx
        .compile(&Term::unary(
            UnOp::TruncToInt,
            Term::variable(0, NumericKind::Double),
        ))
        .unwrap();
    assert_eq!(f.funtype(), FunType::Double);
    assert_close(f.call_f64(&[2.7]), 2.0);
    assert_close(f.call_f64(&[-2.7]), -2.0);

    // Inputs with no i64 counterpart must not trap: NaN passes through and
    // already-integral huge values are unchanged.
    assert!(f.call_f64(&[f64::NAN]).is_nan());
    assert_eq!(f.call_f64(&[1e300]), 1e300);
    assert_eq!(f.call_f64(&[f64::INFINITY]), f64::INFINITY);

    // Over an int tree it is the identity.
    let f = ctx
        .compile(&Term::unary(
            UnOp::TruncToInt,
            Term::variable(0, NumericKind::Int),
        ))
        .unwrap();
    assert_eq!(f.funtype(), FunType::Int);
    assert_eq!(f.call_int(&[-3]), -3);
}

#[test]
fn unsupported_operator_fails_without_poisoning_the_context() {
    let ctx = JitContext::new();

    // Integer pow has no loop-free lowering.
    let err = ctx
        .compile(&Term::binary(BinOp::Pow, Term::int(2), Term::int(10)))
        .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedOp { .. }), "{err}");

    // Shifts make no sense over doubles.
    let err = ctx
        .compile(&Term::binary(
            BinOp::LeftShift,
            Term::double(1.5),
            Term::int(2),
        ))
        .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedOp { .. }), "{err}");

    // The same context still compiles a valid fragment afterwards.
    let f = ctx.compile(&example_tree()).unwrap();
    assert_close(f.call_f64(&[2.0, 5.0]), 18.4);
}

#[test]
fn compiled_fn_debug_reports_the_callable_shape() {
    let ctx = JitContext::new();
    let f = ctx.compile(&example_tree()).unwrap();
    let rendered = format!("{f:?}");
    assert!(rendered.contains("arity: 2"), "{rendered}");
    assert!(rendered.contains("Double"), "{rendered}");
}

#[test]
fn handle_outlives_its_context() {
    let ctx = JitContext::new();
    let f = ctx.compile(&example_tree()).unwrap();
    drop(ctx);
    assert_close(f.call_f64(&[2.0, 5.0]), 18.4);
}

#[test]
fn context_hosts_many_sequential_sessions() {
    let ctx = JitContext::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let tree = Term::add(Term::variable(0, NumericKind::Int), Term::int(i));
        handles.push(ctx.compile(&tree).unwrap());
    }
    for (i, f) in handles.iter().enumerate() {
        assert_eq!(f.call_int(&[100]), 100 + i as i64);
    }
}

#[test]
fn generic_apply_marshals_boxed_slots() {
    let ctx = JitContext::new();

    let f = ctx.compile(&example_tree()).unwrap();
    // Int slots widen losslessly to double.
    let result = f.apply(&[Value::Int(2), Value::Double(5.0)]);
    match result {
        Value::Double(x) => assert_close(x, 18.4),
        other => panic!("expected a double result, got {other:?}"),
    }

    let f = ctx
        .compile(&Term::add(
            Term::variable(0, NumericKind::Int),
            Term::variable(1, NumericKind::Int),
        ))
        .unwrap();
    assert_eq!(f.apply(&[Value::Int(40), Value::UInt(2)]), Value::Int(42));
}

#[test]
#[should_panic(expected = "expected 2 arguments")]
fn generic_apply_rejects_wrong_arity() {
    let ctx = JitContext::new();
    let f = ctx.compile(&example_tree()).unwrap();
    f.apply(&[Value::Double(1.0)]);
}

#[test]
fn raw_entry_casts_to_a_typed_closure() {
    let ctx = JitContext::new();
    let f = ctx.compile(&example_tree()).unwrap();
    let g: extern "C" fn(f64, f64) -> f64 = unsafe { std::mem::transmute(f.raw_entry()) };
    assert_close(g(2.0, 5.0), 18.4);
    assert_close(g(2.0, 3.8), 16.0);
}
