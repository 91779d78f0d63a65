//! End-to-end execution of assembled functions
//!
//! Covers the prepare / set-args / execute / inspect-return lifecycle,
//! the arithmetic and branching core of the instruction set, and the
//! JIT resume trampoline.

mod common;

use common::FunctionBuilder;
use sable_bytecode::{BytecodeWriter, Opcode, TypeKind};
use sable_engine::{Context, ContextError, Engine, ExecutionStatus};
use std::sync::Arc;

/// `int sum(int a, int b) { return a + b; }`
fn register_sum(engine: &Arc<Engine>) -> sable_bytecode::FunctionId {
    let mut w = BytecodeWriter::new();
    w.emit_vvv(Opcode::AddI, 1, 0, -1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    FunctionBuilder::new("sum")
        .params(&[TypeKind::Int32, TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(1)
        .var("a", TypeKind::Int32, 0, false)
        .var("b", TypeKind::Int32, -1, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(engine, w)
}

#[test]
fn test_sum_of_two_arguments() {
    common::init_logging();
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    let mut ctx = Context::new(engine);
    ctx.prepare(sum).unwrap();
    ctx.set_arg_dword(0, 3).unwrap();
    ctx.set_arg_dword(1, 4).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 7);
    assert_eq!(ctx.state(), ExecutionStatus::Finished);
}

#[test]
fn test_reprepare_same_function_reuses_frame() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    let mut ctx = Context::new(engine);
    for (a, b, r) in [(1u32, 2u32, 3u32), (10, 20, 30), (0, 0, 0)] {
        ctx.prepare(sum).unwrap();
        ctx.set_arg_dword(0, a).unwrap();
        ctx.set_arg_dword(1, b).unwrap();
        ctx.execute().unwrap();
        assert_eq!(ctx.get_return_dword(), r);
    }
}

#[test]
fn test_arg_setter_validation() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    let mut ctx = Context::new(engine);

    // Not prepared yet
    assert_eq!(ctx.set_arg_dword(0, 1), Err(ContextError::ContextNotPrepared));

    ctx.prepare(sum).unwrap();
    // Index out of bounds
    assert_eq!(ctx.set_arg_dword(2, 1), Err(ContextError::InvalidArg));
    // Wrong width
    assert_eq!(ctx.set_arg_qword(0, 1), Err(ContextError::InvalidType));
    assert_eq!(ctx.set_arg_byte(0, 1), Err(ContextError::InvalidType));
    // Prepare while prepared is allowed, but execute twice is not
    ctx.set_arg_dword(0, 1).unwrap();
    ctx.set_arg_dword(1, 2).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.execute(), Err(ContextError::ContextNotPrepared));
}

#[test]
fn test_prepare_on_missing_function_fails() {
    let engine = Engine::with_defaults();
    let mut ctx = Context::new(engine);
    assert_eq!(
        ctx.prepare(sable_bytecode::FunctionId(42)),
        Err(ContextError::NoFunction)
    );
}

#[test]
fn test_qword_and_double_returns() {
    let engine = Engine::with_defaults();

    // int64 wide(int64 a) { return a * 3; }
    let mut w = BytecodeWriter::new();
    w.emit_vq(Opcode::SetV64, 4, 3);
    w.emit_vvv(Opcode::MulI64, 2, 0, 4);
    w.emit_v(Opcode::CpyVtoR64, 2);
    w.emit_w(Opcode::Ret, 2);
    let wide = FunctionBuilder::new("wide")
        .params(&[TypeKind::Int64])
        .returns(TypeKind::Int64)
        .locals(4)
        .var("a", TypeKind::Int64, 0, false)
        .var("r", TypeKind::Int64, 2, false)
        .var("t", TypeKind::Int64, 4, false)
        .build(&engine, w);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(wide).unwrap();
    ctx.set_arg_qword(0, 1_000_000_007).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_qword(), 3_000_000_021);

    // double scale(double x) { return x * 0.5; }
    let mut w = BytecodeWriter::new();
    w.emit_vq(Opcode::SetV64, 4, 0.5f64.to_bits());
    w.emit_vvv(Opcode::MulD, 2, 0, 4);
    w.emit_v(Opcode::CpyVtoR64, 2);
    w.emit_w(Opcode::Ret, 2);
    let scale = FunctionBuilder::new("scale")
        .params(&[TypeKind::Double])
        .returns(TypeKind::Double)
        .locals(4)
        .var("x", TypeKind::Double, 0, false)
        .var("r", TypeKind::Double, 2, false)
        .var("h", TypeKind::Double, 4, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(scale).unwrap();
    ctx.set_arg_double(0, 9.0).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_double(), 4.5);
}

#[test]
fn test_return_inspectors_gate_on_type_and_state() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    let mut ctx = Context::new(engine);
    ctx.prepare(sum).unwrap();
    ctx.set_arg_dword(0, 1).unwrap();
    ctx.set_arg_dword(1, 1).unwrap();

    // Not finished yet
    assert_eq!(ctx.get_return_dword(), 0);

    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 2);
    // Mismatched widths read as zero
    assert_eq!(ctx.get_return_qword(), 0);
    assert_eq!(ctx.get_return_byte(), 0);
    assert_eq!(ctx.get_return_float(), 0.0);
}

#[test]
fn test_branch_loop_counts_down() {
    let engine = Engine::with_defaults();

    // int count(int n) { int i = 0; while (i != n) i++; return i; }
    let mut w = BytecodeWriter::new();
    w.emit_vw(Opcode::SetV32, 1, 0);
    let top = w.label();
    w.bind(top);
    w.emit_vv(Opcode::CmpI, 1, 0);
    let done = w.label();
    w.emit_branch(Opcode::Jz, done);
    w.emit_v(Opcode::IncVi, 1);
    w.emit_branch(Opcode::Jmp, top);
    w.bind(done);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 1);
    let count = FunctionBuilder::new("count")
        .params(&[TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(1)
        .var("n", TypeKind::Int32, 0, false)
        .var("i", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(count).unwrap();
    ctx.set_arg_dword(0, 1000).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 1000);
}

#[test]
fn test_nested_script_calls() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    // int twice(int a, int b) { return sum(a, b) + sum(a, b); }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::PushV32, -1);
    w.emit_v(Opcode::PushV32, 0);
    w.emit_w(Opcode::Call, sum.0);
    w.emit_v(Opcode::CpyRtoV32, 1);
    w.emit_v(Opcode::PushV32, -1);
    w.emit_v(Opcode::PushV32, 0);
    w.emit_w(Opcode::Call, sum.0);
    w.emit_v(Opcode::CpyRtoV32, 2);
    w.emit_vvv(Opcode::AddI, 1, 1, 2);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let twice = FunctionBuilder::new("twice")
        .params(&[TypeKind::Int32, TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(2)
        .var("a", TypeKind::Int32, 0, false)
        .var("b", TypeKind::Int32, -1, false)
        .var("x", TypeKind::Int32, 1, false)
        .var("y", TypeKind::Int32, 2, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(twice).unwrap();
    ctx.set_arg_dword(0, 20).unwrap();
    ctx.set_arg_dword(1, 1).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 42);
}

#[test]
fn test_conversions_roundtrip_values() {
    let engine = Engine::with_defaults();

    // double widen(int x) { return double(x); }
    let mut w = BytecodeWriter::new();
    w.emit_vv(Opcode::ItoD, 2, 0);
    w.emit_v(Opcode::CpyVtoR64, 2);
    w.emit_w(Opcode::Ret, 1);
    let widen = FunctionBuilder::new("widen")
        .params(&[TypeKind::Int32])
        .returns(TypeKind::Double)
        .locals(3)
        .var("x", TypeKind::Int32, 0, false)
        .var("d", TypeKind::Double, 2, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(widen).unwrap();
    ctx.set_arg_dword(0, (-7i32) as u32).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_double(), -7.0);
}

#[test]
fn test_float_compare_nan_is_never_equal() {
    let engine = Engine::with_defaults();

    // int cmp(float a, float b) { compare into the register; return it }
    let mut w = BytecodeWriter::new();
    w.emit_vv(Opcode::CmpF, 0, -1);
    w.emit_w(Opcode::Ret, 2);
    let cmp = FunctionBuilder::new("cmp")
        .params(&[TypeKind::Float, TypeKind::Float])
        .returns(TypeKind::Int32)
        .var("a", TypeKind::Float, 0, false)
        .var("b", TypeKind::Float, -1, false)
        .build(&engine, w);

    let run = |a: f32, b: f32| -> i32 {
        let mut ctx = Context::new(Arc::clone(&engine));
        ctx.prepare(cmp).unwrap();
        ctx.set_arg_float(0, a).unwrap();
        ctx.set_arg_float(1, b).unwrap();
        ctx.execute().unwrap();
        ctx.get_return_dword() as i32
    };

    assert_eq!(run(1.0, 1.0), 0);
    assert_eq!(run(1.0, 2.0), -1);
    assert_eq!(run(2.0, 1.0), 1);
    // NaN never compares equal
    assert_ne!(run(f32::NAN, f32::NAN), 0);
    assert_ne!(run(f32::NAN, 1.0), 0);
}

#[test]
fn test_jit_entry_transfers_control() {
    let engine = Engine::with_defaults();

    // Body computes 7; the JIT (when attached) computes 99 and skips to
    // the return
    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::JitEntry, 1); // words 0..2
    w.emit_vw(Opcode::SetV32, 1, 7); // words 2..4
    w.emit_v(Opcode::CpyVtoR32, 1); // word 4
    w.emit_w(Opcode::Ret, 0); // words 5..7
    let f = FunctionBuilder::new("jitted")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    // Without a JIT body the entry is a fall-through
    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 7);

    engine.set_jit_body(
        f,
        Arc::new(|regs: &mut sable_engine::vm::Registers| {
            regs.value_register = 99;
            regs.program_pointer = Some(5);
        }),
    );

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 99);
}

#[test]
fn test_pow_instruction() {
    let engine = Engine::with_defaults();

    // int ipow(int base, int exp) { return base ** exp; }
    let mut w = BytecodeWriter::new();
    w.emit_vvv(Opcode::PowI, 1, 0, -1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let ipow = FunctionBuilder::new("ipow")
        .params(&[TypeKind::Int32, TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(1)
        .var("base", TypeKind::Int32, 0, false)
        .var("exp", TypeKind::Int32, -1, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(ipow).unwrap();
    ctx.set_arg_dword(0, 2).unwrap();
    ctx.set_arg_dword(1, 16).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 65536);
}

#[test]
fn test_globals_are_shared_through_the_engine() {
    let engine = Engine::with_defaults();
    let base = engine.allocate_global(1);
    engine.write_global(base, 41);

    // int bump() { return ++g; }
    let mut w = BytecodeWriter::new();
    w.emit_vw(Opcode::LdGRdR32, 1, base); // also leaves &g in the register
    w.emit(Opcode::IncI32);
    w.emit_vw(Opcode::CpyGtoV32, 1, base);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 0);
    let bump = FunctionBuilder::new("bump")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("t", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(bump).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_dword(), 42);
    assert_eq!(engine.read_global(base), 42);
}

#[test]
fn test_introspection_of_callstack() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    let mut ctx = Context::new(engine);
    assert_eq!(ctx.get_callstack_size(), 0);

    ctx.prepare(sum).unwrap();
    assert_eq!(ctx.get_callstack_size(), 1);
    assert_eq!(ctx.get_function(0), Some(sum));
    assert_eq!(ctx.get_var_count(0), Some(3));

    let (name, _, on_heap, offset) = ctx.get_var(0, 0).unwrap();
    assert_eq!(name, "a");
    assert!(!on_heap);
    assert_eq!(offset, 0);
    assert_eq!(ctx.get_var_declaration(2, 0).unwrap(), "int r");
}
