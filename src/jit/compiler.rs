//! Cranelift JIT compiler for Term trees.
//!
//! Lowers an expression fragment into one native function whose parameters
//! and return value all share the tree's resolved [`FunType`]: `n` formal
//! `i64` or `f64` arguments, one result. Alongside the n-ary entry point an
//! *apply trampoline* `fn(*const T) -> T` is emitted that loads the `n`
//! arguments from a caller-provided buffer and forwards to the main function,
//! so a caller holding the handle opaquely can still invoke it.
//!
//! # Fallback Policy
//!
//! Compilation is strictly an optimization. An operator the engine cannot
//! lower for the resolved function type, or a backend failure, comes back as
//! a [`CompileError`] and leaves the context ready for the next attempt; the
//! caller keeps running the fragment uncompiled. Only malformed trees panic.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::types::{F64, I64};
use cranelift_codegen::ir::{self, AbiParam, Function, InstBuilder, MemFlags, UserFuncName};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use tracing::debug;

use crate::analyze::{self, FunType};
use crate::error::{CompileError, OpKind, Result};
use crate::term::{BinOp, Term, UnOp, Value};

/// Runtime support routines the generated code may call. Registered with the
/// JIT builder under `fragjit_`-prefixed symbol names at context creation.
mod runtime {
    pub extern "C" fn sin(x: f64) -> f64 {
        x.sin()
    }
    pub extern "C" fn cos(x: f64) -> f64 {
        x.cos()
    }
    pub extern "C" fn log(x: f64) -> f64 {
        x.ln()
    }
    pub extern "C" fn exp(x: f64) -> f64 {
        x.exp()
    }
    pub extern "C" fn pow(x: f64, y: f64) -> f64 {
        x.powf(y)
    }
}

/// The backend build context.
///
/// Owns the Cranelift module (and with it the machine code of every function
/// finalized here). A context hosts build sessions strictly one at a time;
/// the interior `RefCell` turns a violation into a panic rather than
/// corruption. Handles produced by [`compile`](JitContext::compile) clone the
/// inner `Rc`, so compiled code stays mapped until the context *and* every
/// outstanding handle are gone. Not `Send`: compilation is single-threaded.
pub struct JitContext {
    module: Rc<RefCell<JITModule>>,
    next_fn: Cell<u32>,
}

impl JitContext {
    /// Create a context for the host ISA.
    ///
    /// # Panics
    ///
    /// Panics if the native ISA cannot be configured; that is a host setup
    /// problem, not a per-fragment failure.
    pub fn new() -> Self {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("use_colocated_libcalls", "false")
            .expect("cranelift setting");
        flag_builder
            .set("is_pic", "false")
            .expect("cranelift setting");
        let isa_builder =
            cranelift_native::builder().unwrap_or_else(|e| panic!("cranelift ISA builder: {e}"));
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .unwrap_or_else(|e| panic!("cranelift ISA finish: {e}"));
        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol("fragjit_sin", runtime::sin as *const u8);
        builder.symbol("fragjit_cos", runtime::cos as *const u8);
        builder.symbol("fragjit_log", runtime::log as *const u8);
        builder.symbol("fragjit_exp", runtime::exp as *const u8);
        builder.symbol("fragjit_pow", runtime::pow as *const u8);
        JitContext {
            module: Rc::new(RefCell::new(JITModule::new(builder))),
            next_fn: Cell::new(0),
        }
    }

    /// Compile one Term tree into a callable function.
    ///
    /// Runs tree analysis to derive the function type and arity, then lowers
    /// the tree in a single build session. The tree is read-only input; no
    /// reference into it is retained after this returns.
    pub fn compile(&self, term: &Term) -> Result<CompiledFn> {
        let funtype = analyze::resolve_funtype(term);
        let vars = analyze::extract_vars(term);
        let arity = vars.iter().map(|v| v.index + 1).max().unwrap_or(0);
        debug!(
            occurrences = vars.len(),
            arity,
            ?funtype,
            "compiling fragment"
        );

        // Reject before touching the module so a failed attempt has no
        // side effects on later build sessions.
        ensure_lowerable(term, funtype)?;

        let mut module = self.module.borrow_mut();
        let fn_idx = self.next_fn.get();
        self.next_fn.set(fn_idx + 1);

        let kind_ty = match funtype {
            FunType::Int => I64,
            FunType::Double => F64,
        };

        // Main function: n formals of kind_ty, one kind_ty return.
        let mut sig = module.make_signature();
        for _ in 0..arity {
            sig.params.push(AbiParam::new(kind_ty));
        }
        sig.returns.push(AbiParam::new(kind_ty));
        let name = format!("fragment_{fn_idx}");
        let func_id = module.declare_function(&name, Linkage::Local, &sig)?;

        let intrinsic_ids = if funtype == FunType::Double {
            Some(declare_intrinsics(&mut module)?)
        } else {
            None
        };

        let mut func = Function::with_name_signature(UserFuncName::user(0, fn_idx * 2), sig);
        let mut func_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut func, &mut func_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let params = builder.block_params(entry).to_vec();

            let intrinsics = intrinsic_ids
                .as_ref()
                .map(|ids| ids.bind(&mut module, builder.func));
            let mut emitter = Emitter {
                builder: &mut builder,
                params: &params,
                funtype,
                intrinsics,
            };
            let result = emitter.emit(term);
            builder.ins().return_(&[result]);
            builder.finalize();
        }
        define(&mut module, func_id, func)?;

        // Apply trampoline: load the n arguments from a flat buffer and
        // forward to the main function.
        let ptr_type = module.target_config().pointer_type();
        let mut apply_sig = module.make_signature();
        apply_sig.params.push(AbiParam::new(ptr_type));
        apply_sig.returns.push(AbiParam::new(kind_ty));
        let apply_id =
            module.declare_function(&format!("{name}_apply"), Linkage::Local, &apply_sig)?;

        let mut apply_func =
            Function::with_name_signature(UserFuncName::user(0, fn_idx * 2 + 1), apply_sig);
        let mut apply_ctx = FunctionBuilderContext::new();
        {
            let mut builder = FunctionBuilder::new(&mut apply_func, &mut apply_ctx);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);

            let base = builder.block_params(entry)[0];
            let flags = MemFlags::trusted();
            let mut args = Vec::with_capacity(arity);
            for i in 0..arity {
                let offset = (i as i32) * 8;
                args.push(builder.ins().load(kind_ty, flags, base, offset));
            }
            let callee = module.declare_func_in_func(func_id, builder.func);
            let call = builder.ins().call(callee, &args);
            let result = builder.inst_results(call)[0];
            builder.ins().return_(&[result]);
            builder.finalize();
        }
        define(&mut module, apply_id, apply_func)?;

        module
            .finalize_definitions()
            .map_err(|e| CompileError::Backend(e.to_string()))?;
        let entry = module.get_finalized_function(func_id);
        let apply = module.get_finalized_function(apply_id);
        drop(module);

        Ok(CompiledFn {
            _module: Rc::clone(&self.module),
            entry,
            apply,
            arity,
            funtype,
        })
    }
}

impl Default for JitContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A compiled fragment: the finalized native routine plus what a caller
/// needs to marshal arguments (arity and function type).
///
/// Holds a shared reference to the backend module, so invoking the handle
/// after the [`JitContext`] is dropped remains valid; the code memory is
/// released only when the last referent goes away.
///
/// Integer `Divide` compiles to a hardware divide: a divisor of 0, or
/// `i64::MIN / -1`, traps and aborts the process. Callers of an `Int`
/// function must screen those inputs themselves.
pub struct CompiledFn {
    _module: Rc<RefCell<JITModule>>,
    entry: *const u8,
    apply: *const u8,
    arity: usize,
    funtype: FunType,
}

impl CompiledFn {
    /// Number of formal parameters (one past the maximum variable index).
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// The type of every parameter and of the return value.
    pub fn funtype(&self) -> FunType {
        self.funtype
    }

    /// Direct typed invocation of an `Int`-typed function.
    ///
    /// # Panics
    ///
    /// Panics if the function type is not `Int` or `args` is not exactly
    /// `arity()` long. Arguments that make a compiled `Divide` trap (divisor
    /// 0, `i64::MIN / -1`) abort the process; see the type-level docs.
    pub fn call_int(&self, args: &[i64]) -> i64 {
        assert_eq!(self.funtype, FunType::Int, "call_int on a double function");
        assert_eq!(
            args.len(),
            self.arity,
            "call_int: expected {} arguments, got {}",
            self.arity,
            args.len()
        );
        let f: unsafe extern "C" fn(*const i64) -> i64 =
            unsafe { std::mem::transmute(self.apply) };
        unsafe { f(args.as_ptr()) }
    }

    /// Direct typed invocation of a `Double`-typed function.
    ///
    /// # Panics
    ///
    /// Panics if the function type is not `Double` or `args` is not exactly
    /// `arity()` long.
    pub fn call_f64(&self, args: &[f64]) -> f64 {
        assert_eq!(
            self.funtype,
            FunType::Double,
            "call_f64 on an int function"
        );
        assert_eq!(
            args.len(),
            self.arity,
            "call_f64: expected {} arguments, got {}",
            self.arity,
            args.len()
        );
        let f: unsafe extern "C" fn(*const f64) -> f64 =
            unsafe { std::mem::transmute(self.apply) };
        unsafe { f(args.as_ptr()) }
    }

    /// Generic invocation for callers holding the handle opaquely: ordered
    /// typed argument slots, one typed result slot.
    ///
    /// Each slot is converted to the function type: integers widen to `f64`
    /// for a `Double` function; a `Double` slot passed to an `Int` function
    /// is a caller error and panics, as is a wrong argument count. The
    /// integer-division trap inputs on the type-level docs apply here too.
    pub fn apply(&self, args: &[Value]) -> Value {
        assert_eq!(
            args.len(),
            self.arity,
            "apply: expected {} arguments, got {}",
            self.arity,
            args.len()
        );
        match self.funtype {
            FunType::Int => {
                let buf: Vec<i64> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(n) => *n,
                        Value::UInt(n) => *n as i64,
                        Value::Double(_) => {
                            panic!("apply: double argument passed to an int function")
                        }
                    })
                    .collect();
                Value::Int(self.call_int(&buf))
            }
            FunType::Double => {
                let buf: Vec<f64> = args
                    .iter()
                    .map(|v| match v {
                        Value::Int(n) => *n as f64,
                        Value::UInt(n) => *n as f64,
                        Value::Double(x) => *x,
                    })
                    .collect();
                Value::Double(self.call_f64(&buf))
            }
        }
    }

    /// The raw n-ary entry point, for callers that cast to a concrete
    /// function type themselves, e.g.
    /// `extern "C" fn(f64, f64) -> f64` for a `Double` function of arity 2.
    ///
    /// The pointer is valid for the lifetime of this handle. Calling through
    /// it with a mismatched signature is undefined behavior.
    pub fn raw_entry(&self) -> *const u8 {
        self.entry
    }
}

// Manual impl: JITModule is not Debug. Reports the callable shape.
impl fmt::Debug for CompiledFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFn")
            .field("arity", &self.arity)
            .field("funtype", &self.funtype)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

/// Walk the tree and reject any operator the engine cannot lower under this
/// function type. Runs before the build session opens.
fn ensure_lowerable(term: &Term, funtype: FunType) -> Result<()> {
    match term {
        Term::Constant(_) | Term::Variable { .. } => Ok(()),
        Term::Binary { op, left, right } => {
            let supported = match (funtype, op) {
                (FunType::Int, BinOp::Pow) => false,
                (FunType::Double, BinOp::LeftShift | BinOp::RightShift) => false,
                _ => true,
            };
            if !supported {
                return Err(CompileError::UnsupportedOp {
                    op: OpKind::Binary(*op),
                    funtype,
                });
            }
            ensure_lowerable(left, funtype)?;
            ensure_lowerable(right, funtype)
        }
        // Every unary kind lowers under Double, and the float intrinsics
        // resolve any tree containing them to Double.
        Term::Unary { operand, .. } => ensure_lowerable(operand, funtype),
    }
}

fn define(module: &mut JITModule, func_id: FuncId, func: Function) -> Result<()> {
    let mut ctx = Context::for_function(func);
    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CompileError::Backend(e.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(())
}

struct IntrinsicIds {
    sin: FuncId,
    cos: FuncId,
    log: FuncId,
    exp: FuncId,
    pow: FuncId,
}

struct Intrinsics {
    sin: ir::FuncRef,
    cos: ir::FuncRef,
    log: ir::FuncRef,
    exp: ir::FuncRef,
    pow: ir::FuncRef,
}

fn declare_intrinsics(module: &mut JITModule) -> Result<IntrinsicIds> {
    let mut unary_sig = module.make_signature();
    unary_sig.params.push(AbiParam::new(F64));
    unary_sig.returns.push(AbiParam::new(F64));
    let mut binary_sig = module.make_signature();
    binary_sig.params.push(AbiParam::new(F64));
    binary_sig.params.push(AbiParam::new(F64));
    binary_sig.returns.push(AbiParam::new(F64));
    Ok(IntrinsicIds {
        sin: module.declare_function("fragjit_sin", Linkage::Import, &unary_sig)?,
        cos: module.declare_function("fragjit_cos", Linkage::Import, &unary_sig)?,
        log: module.declare_function("fragjit_log", Linkage::Import, &unary_sig)?,
        exp: module.declare_function("fragjit_exp", Linkage::Import, &unary_sig)?,
        pow: module.declare_function("fragjit_pow", Linkage::Import, &binary_sig)?,
    })
}

impl IntrinsicIds {
    fn bind(&self, module: &mut JITModule, func: &mut Function) -> Intrinsics {
        Intrinsics {
            sin: module.declare_func_in_func(self.sin, func),
            cos: module.declare_func_in_func(self.cos, func),
            log: module.declare_func_in_func(self.log, func),
            exp: module.declare_func_in_func(self.exp, func),
            pow: module.declare_func_in_func(self.pow, func),
        }
    }
}

/// Recursive lowering of a Term tree into one basic block of straight-line
/// instructions. All values share the function type; constants of the other
/// kinds are widened at emission.
struct Emitter<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    params: &'a [ir::Value],
    funtype: FunType,
    intrinsics: Option<Intrinsics>,
}

impl Emitter<'_, '_> {
    fn emit(&mut self, term: &Term) -> ir::Value {
        match term {
            Term::Constant(value) => self.emit_const(value),
            Term::Variable { index, .. } => {
                // Analysis sized the signature from the maximum index, so
                // this can only fire on a malformed tree.
                assert!(
                    *index < self.params.len(),
                    "variable index {} out of range for arity {}",
                    index,
                    self.params.len()
                );
                self.params[*index]
            }
            Term::Binary { op, left, right } => {
                let l = self.emit(left);
                let r = self.emit(right);
                match self.funtype {
                    FunType::Int => self.emit_int_binop(*op, l, r),
                    FunType::Double => self.emit_f64_binop(*op, l, r),
                }
            }
            Term::Unary { op, operand } => {
                let v = self.emit(operand);
                match self.funtype {
                    FunType::Int => self.emit_int_unop(*op, v),
                    FunType::Double => self.emit_f64_unop(*op, v),
                }
            }
        }
    }

    fn emit_const(&mut self, value: &Value) -> ir::Value {
        match (self.funtype, value) {
            (FunType::Int, Value::Int(n)) => self.builder.ins().iconst(I64, *n),
            (FunType::Int, Value::UInt(n)) => self.builder.ins().iconst(I64, *n as i64),
            (FunType::Int, Value::Double(_)) => {
                unreachable!("double constant in an int-typed tree")
            }
            (FunType::Double, Value::Int(n)) => self.builder.ins().f64const(*n as f64),
            (FunType::Double, Value::UInt(n)) => self.builder.ins().f64const(*n as f64),
            (FunType::Double, Value::Double(x)) => self.builder.ins().f64const(*x),
        }
    }

    fn emit_int_binop(&mut self, op: BinOp, l: ir::Value, r: ir::Value) -> ir::Value {
        match op {
            BinOp::Add => self.builder.ins().iadd(l, r),
            BinOp::Subtract => self.builder.ins().isub(l, r),
            BinOp::Multiply => self.builder.ins().imul(l, r),
            BinOp::Divide => self.builder.ins().sdiv(l, r),
            BinOp::LeftShift => self.builder.ins().ishl(l, r),
            BinOp::RightShift => self.builder.ins().sshr(l, r),
            BinOp::Equal => {
                let cmp = self.builder.ins().icmp(IntCC::Equal, l, r);
                self.builder.ins().uextend(I64, cmp)
            }
            BinOp::BoolAnd => {
                let ln = self.builder.ins().icmp_imm(IntCC::NotEqual, l, 0);
                let rn = self.builder.ins().icmp_imm(IntCC::NotEqual, r, 0);
                let both = self.builder.ins().band(ln, rn);
                self.builder.ins().uextend(I64, both)
            }
            BinOp::BoolOr => {
                let ln = self.builder.ins().icmp_imm(IntCC::NotEqual, l, 0);
                let rn = self.builder.ins().icmp_imm(IntCC::NotEqual, r, 0);
                let either = self.builder.ins().bor(ln, rn);
                self.builder.ins().uextend(I64, either)
            }
            BinOp::Pow => unreachable!("rejected before lowering"),
        }
    }

    fn emit_f64_binop(&mut self, op: BinOp, l: ir::Value, r: ir::Value) -> ir::Value {
        match op {
            BinOp::Add => self.builder.ins().fadd(l, r),
            BinOp::Subtract => self.builder.ins().fsub(l, r),
            BinOp::Multiply => self.builder.ins().fmul(l, r),
            BinOp::Divide => self.builder.ins().fdiv(l, r),
            BinOp::Pow => {
                let pow = self.intrinsics().pow;
                self.call(pow, &[l, r])
            }
            BinOp::Equal => {
                let cmp = self.builder.ins().fcmp(FloatCC::Equal, l, r);
                self.bool_to_f64(cmp)
            }
            BinOp::BoolAnd => {
                let ln = self.f64_truthy(l);
                let rn = self.f64_truthy(r);
                let both = self.builder.ins().band(ln, rn);
                self.bool_to_f64(both)
            }
            BinOp::BoolOr => {
                let ln = self.f64_truthy(l);
                let rn = self.f64_truthy(r);
                let either = self.builder.ins().bor(ln, rn);
                self.bool_to_f64(either)
            }
            BinOp::LeftShift | BinOp::RightShift => unreachable!("rejected before lowering"),
        }
    }

    fn emit_int_unop(&mut self, op: UnOp, v: ir::Value) -> ir::Value {
        match op {
            // Already integral.
            UnOp::TruncToInt => v,
            UnOp::BoolNot => {
                let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, v, 0);
                self.builder.ins().uextend(I64, is_zero)
            }
            UnOp::Sin | UnOp::Cos | UnOp::Sqrt | UnOp::Log | UnOp::Exp => {
                unreachable!("float intrinsic resolves the tree to double")
            }
        }
    }

    fn emit_f64_unop(&mut self, op: UnOp, v: ir::Value) -> ir::Value {
        match op {
            UnOp::Sqrt => self.builder.ins().sqrt(v),
            UnOp::Sin => {
                let f = self.intrinsics().sin;
                self.call(f, &[v])
            }
            UnOp::Cos => {
                let f = self.intrinsics().cos;
                self.call(f, &[v])
            }
            UnOp::Log => {
                let f = self.intrinsics().log;
                self.call(f, &[v])
            }
            UnOp::Exp => {
                let f = self.intrinsics().exp;
                self.call(f, &[v])
            }
            UnOp::TruncToInt => {
                // Round toward zero in the float domain. An int-convert
                // round trip would trap on NaN and out-of-range inputs;
                // trunc passes them through instead.
                self.builder.ins().trunc(v)
            }
            UnOp::BoolNot => {
                let zero = self.builder.ins().f64const(0.0);
                let is_zero = self.builder.ins().fcmp(FloatCC::Equal, v, zero);
                self.bool_to_f64(is_zero)
            }
        }
    }

    fn intrinsics(&self) -> &Intrinsics {
        self.intrinsics
            .as_ref()
            .expect("intrinsics are declared for every double function")
    }

    fn call(&mut self, f: ir::FuncRef, args: &[ir::Value]) -> ir::Value {
        let call = self.builder.ins().call(f, args);
        self.builder.inst_results(call)[0]
    }

    /// 0.0 stays false, everything else (NaN included) is true.
    fn f64_truthy(&mut self, v: ir::Value) -> ir::Value {
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().fcmp(FloatCC::NotEqual, v, zero)
    }

    fn bool_to_f64(&mut self, cond: ir::Value) -> ir::Value {
        let one = self.builder.ins().f64const(1.0);
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().select(cond, one, zero)
    }
}
