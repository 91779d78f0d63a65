//! Suspension, abortion, nested executions and args-on-stack inspection

mod common;

use common::{system_function, FunctionBuilder};
use sable_bytecode::{BytecodeWriter, DataType, Opcode, TypeKind};
use sable_engine::{CallConv, Context, Engine, ExecutionStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
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

/// Counting loop with a suspend cue per iteration:
/// `int spin() { int i = 0; while (i != 3) { <cue> i++; } return i; }`
fn register_spin(engine: &Arc<Engine>) -> sable_bytecode::FunctionId {
    let mut w = BytecodeWriter::new();
    w.emit_vw(Opcode::SetV32, 1, 0);
    let top = w.label();
    w.bind(top);
    w.emit(Opcode::Suspend);
    w.emit_v(Opcode::IncVi, 1);
    w.emit_vw(Opcode::CmpIi, 1, 3);
    w.emit_branch(Opcode::Jnz, top);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 0);
    FunctionBuilder::new("spin")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("i", TypeKind::Int32, 1, false)
        .build(engine, w)
}

#[test]
fn test_suspend_and_resume_from_line_callback() {
    common::init_logging();
    let engine = Engine::with_defaults();
    let spin = register_spin(&engine);

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_cb = Arc::clone(&calls);

    let mut ctx = Context::new(engine);
    ctx.set_line_callback(
        Box::new(move |ctx| {
            // Suspend at the first in-loop cue (the first call is the
            // function-entry cue)
            if calls_in_cb.fetch_add(1, Ordering::Relaxed) == 1 {
                ctx.suspend();
            }
        }),
        CallConv::Cdecl,
    )
    .unwrap();

    ctx.prepare(spin).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Suspended);
    assert_eq!(ctx.state(), ExecutionStatus::Suspended);

    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 3);
    assert!(calls.load(Ordering::Relaxed) >= 4);
}

#[test]
fn test_abort_from_line_callback() {
    let engine = Engine::with_defaults();
    let spin = register_spin(&engine);

    let mut ctx = Context::new(engine);
    ctx.set_line_callback(Box::new(|ctx| ctx.abort()), CallConv::Cdecl)
        .unwrap();

    ctx.prepare(spin).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Aborted);
    ctx.unprepare().unwrap();
}

#[test]
fn test_abort_from_interrupt_handle() {
    let engine = Engine::with_defaults();
    let spin = register_spin(&engine);

    let mut ctx = Context::new(engine);
    let handle = ctx.interrupt_handle();

    // Request between prepare and execute; the first suspend cue
    // observes it
    ctx.prepare(spin).unwrap();
    handle.abort();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Aborted);
}

#[test]
fn test_nested_call_from_host_function() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    // Host function that reuses the context for a nested sum(5, 6)
    let nested = system_function(
        &engine,
        "nested",
        &[],
        DataType::value(TypeKind::Int32),
        Arc::new(move |g| {
            let ctx = g.context();
            ctx.push_state().unwrap();
            assert!(ctx.is_nested());
            assert_eq!(ctx.nested_count(), 1);

            ctx.prepare(sum).unwrap();
            ctx.set_arg_dword(0, 5).unwrap();
            ctx.set_arg_dword(1, 6).unwrap();
            assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
            let r = ctx.get_return_dword();

            ctx.pop_state().unwrap();
            assert!(!ctx.is_nested());
            g.set_return_dword(r);
        }),
    );

    // int outer() { return nested() + 1; }
    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::CallSys, nested.0);
    w.emit_v(Opcode::CpyRtoV32, 1);
    w.emit_v(Opcode::IncVi, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 0);
    let outer = FunctionBuilder::new("outer")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(outer).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 12);
}

#[test]
fn test_nested_execution_preserves_registers() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    // The outer value register holds a sentinel across the nested call
    let checker = system_function(
        &engine,
        "checker",
        &[],
        DataType::value(TypeKind::Int32),
        Arc::new(move |g| {
            let ctx = g.context();
            let state_before = ctx.get_state_registers(0).unwrap();

            ctx.push_state().unwrap();
            ctx.prepare(sum).unwrap();
            ctx.set_arg_dword(0, 1).unwrap();
            ctx.set_arg_dword(1, 2).unwrap();
            ctx.execute().unwrap();
            ctx.pop_state().unwrap();

            let state_after = ctx.get_state_registers(0).unwrap();
            assert_eq!(
                state_before.value_register,
                state_after.value_register
            );
            assert_eq!(
                state_before.original_stack_pointer,
                state_after.original_stack_pointer
            );
            assert_eq!(state_before.arguments_size, state_after.arguments_size);
            g.set_return_dword(77);
        }),
    );

    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::CallSys, checker.0);
    w.emit_v(Opcode::CpyRtoV32, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 0);
    let outer = FunctionBuilder::new("outer")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(outer).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 77);
}

#[test]
fn test_push_state_requires_active() {
    let engine = Engine::with_defaults();
    let mut ctx = Context::new(engine);
    assert!(ctx.push_state().is_err());
    assert!(ctx.pop_state().is_err());
}

#[test]
fn test_args_on_stack_inspection() {
    let engine = Engine::with_defaults();
    let sum = register_sum(&engine);

    // Suspend between the two argument pushes for sum(3, 4)
    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::PushC32, 4); // b, pushed first
    w.emit(Opcode::Suspend);
    w.emit_w(Opcode::PushC32, 3); // a
    w.emit_w(Opcode::Call, sum.0);
    w.emit_v(Opcode::CpyRtoV32, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("pusher")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = Arc::clone(&fired);

    let mut ctx = Context::new(engine);
    ctx.set_line_callback(
        Box::new(move |ctx| {
            if fired_cb.fetch_add(1, Ordering::Relaxed) == 1 {
                ctx.suspend();
            }
        }),
        CallConv::Cdecl,
    )
    .unwrap();

    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Suspended);

    // One argument (the second parameter) is on the stack
    assert_eq!(ctx.get_args_on_stack_count(0).unwrap(), 1);
    let (ty, addr) = ctx.get_arg_on_stack(0, 0).unwrap();
    assert_eq!(ty.kind, TypeKind::Int32);
    assert_eq!(ctx.deref_read(addr, 4), Some(4));

    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 7);
}

#[test]
fn test_user_data_slots() {
    let engine = Engine::with_defaults();
    let mut ctx = Context::new(engine);

    assert!(ctx.get_user_data(1).is_none());
    assert!(ctx.set_user_data(Arc::new(42u32), 1).is_none());
    assert!(ctx.set_user_data(Arc::new("side"), 2).is_none());

    let old = ctx.set_user_data(Arc::new(43u32), 1).unwrap();
    assert_eq!(*old.downcast::<u32>().unwrap(), 42);
    assert_eq!(
        *ctx.get_user_data(1).unwrap().downcast::<u32>().unwrap(),
        43
    );
    assert!(ctx.get_user_data(2).is_some());
}
