//! Script exceptions: raising, reporting, try/catch and unwinding

mod common;

use common::{system_function, FunctionBuilder};
use sable_bytecode::{BytecodeWriter, DataType, Opcode, TypeKind};
use sable_engine::{
    CallConv, Context, Engine, EngineProperties, ExecutionStatus, ScriptException,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// `int div(int a, int b) { return a / b; }` with the division on line 12
fn register_div(engine: &Arc<Engine>) -> sable_bytecode::FunctionId {
    let mut w = BytecodeWriter::new();
    w.emit_vvv(Opcode::DivI, 1, 0, -1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    FunctionBuilder::new("div")
        .params(&[TypeKind::Int32, TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(1)
        .var("a", TypeKind::Int32, 0, false)
        .var("b", TypeKind::Int32, -1, false)
        .var("r", TypeKind::Int32, 1, false)
        .line(0, 12, 5)
        .line(2, 13, 1)
        .build(engine, w)
}

#[test]
fn test_divide_by_zero_reports_line() {
    common::init_logging();
    let engine = Engine::with_defaults();
    let div = register_div(&engine);

    let mut ctx = Context::new(engine);
    ctx.prepare(div).unwrap();
    ctx.set_arg_dword(0, 10).unwrap();
    ctx.set_arg_dword(1, 0).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);

    assert_eq!(ctx.get_exception(), Some(&ScriptException::DivideByZero));
    assert!(ctx
        .get_exception_string()
        .unwrap()
        .contains("Divide by zero"));
    let (line, col, section) = ctx.get_exception_line_number().unwrap();
    assert_eq!(line, 12);
    assert_eq!(col, 5);
    assert_eq!(section, "test.sbl");
    assert_eq!(ctx.get_exception_function(), Some(div));
    assert!(!ctx.will_exception_be_caught());

    // Details survive unprepare, until the next prepare
    ctx.unprepare().unwrap();
    assert_eq!(ctx.get_exception(), Some(&ScriptException::DivideByZero));
}

#[test]
fn test_divide_overflow() {
    let engine = Engine::with_defaults();
    let div = register_div(&engine);

    let mut ctx = Context::new(engine);
    ctx.prepare(div).unwrap();
    ctx.set_arg_dword(0, i32::MIN as u32).unwrap();
    ctx.set_arg_dword(1, (-1i32) as u32).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::DivideOverflow));
}

#[test]
fn test_unsigned_divide_by_zero() {
    let engine = Engine::with_defaults();

    let mut w = BytecodeWriter::new();
    w.emit_vvv(Opcode::DivU, 1, 0, -1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let f = FunctionBuilder::new("udiv")
        .params(&[TypeKind::Uint32, TypeKind::Uint32])
        .returns(TypeKind::Uint32)
        .locals(1)
        .var("a", TypeKind::Uint32, 0, false)
        .var("b", TypeKind::Uint32, -1, false)
        .var("r", TypeKind::Uint32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 10).unwrap();
    ctx.set_arg_dword(1, 0).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::DivideByZero));
}

#[test]
fn test_pow_overflow_raises() {
    let engine = Engine::with_defaults();

    let mut w = BytecodeWriter::new();
    w.emit_vvv(Opcode::PowI, 1, 0, -1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let f = FunctionBuilder::new("ipow")
        .params(&[TypeKind::Int32, TypeKind::Int32])
        .returns(TypeKind::Int32)
        .locals(1)
        .var("a", TypeKind::Int32, 0, false)
        .var("b", TypeKind::Int32, -1, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 46341).unwrap();
    ctx.set_arg_dword(1, 2).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::PowOverflow));
}

#[test]
fn test_null_pointer_check_leaves_stack_untouched() {
    let engine = Engine::with_defaults();

    // Push a null pointer, then fail the reference check
    let mut w = BytecodeWriter::new();
    w.emit(Opcode::PushNull);
    w.emit(Opcode::ChkRef);
    w.emit(Opcode::PopPtr);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("nullcheck").build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::NullPointerAccess));
}

#[test]
fn test_try_catch_recovers() {
    let engine = Engine::with_defaults();

    // int f() {
    //   int t = 7; int z = 0;
    //   try { t = t / z; } catch { return 42; }
    //   return 0;
    // }
    let mut w = BytecodeWriter::new();
    w.emit_vw(Opcode::SetV32, 1, 7); // 0..2
    w.emit_vw(Opcode::SetV32, 2, 0); // 2..4   try covers [4, 8)
    w.emit_vvv(Opcode::DivI, 1, 1, 2); // 4..6  raises here
    w.emit_vw(Opcode::SetV32, 1, 0); // 6..8   (skipped)
    w.emit_vw(Opcode::SetV32, 1, 42); // 8..10  catch handler
    w.emit_v(Opcode::CpyVtoR32, 1); // 10
    w.emit_w(Opcode::Ret, 0); // 11..13
    let f = FunctionBuilder::new("guarded")
        .returns(TypeKind::Int32)
        .locals(2)
        .var("t", TypeKind::Int32, 1, false)
        .var("z", TypeKind::Int32, 2, false)
        .try_catch(4, 8, 0)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 42);
}

#[test]
fn test_exception_in_callee_caught_by_caller() {
    let engine = Engine::with_defaults();
    let div = register_div(&engine);

    // int f() { try { return div(1, 0); } catch { return 7; } }
    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::PushC32, 0); // 0..2    try covers [0, 12)
    w.emit_w(Opcode::PushC32, 1); // 2..4
    w.emit_w(Opcode::Call, div.0); // 4..6
    w.emit_v(Opcode::CpyRtoV32, 1); // 6
    w.emit_v(Opcode::CpyVtoR32, 1); // 7
    w.emit_w(Opcode::Ret, 0); // 8..10
    w.emit_w(Opcode::Jmp, 0); // 10..12  padding between ranges
    w.emit_vw(Opcode::SetV32, 1, 7); // 12..14  catch handler (pos 12)
    w.emit_v(Opcode::CpyVtoR32, 1); // 14
    w.emit_w(Opcode::Ret, 0); // 15..17
    let f = FunctionBuilder::new("catches_callee")
        .returns(TypeKind::Int32)
        .locals(1)
        .var("r", TypeKind::Int32, 1, false)
        .try_catch(0, 12, 0)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 7);
}

#[test]
fn test_recursion_hits_call_stack_limit() {
    let engine = Engine::new(EngineProperties {
        max_call_stack_size: 100,
        ..EngineProperties::default()
    });

    // void forever() { forever(); }
    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::Call, 0); // self; first registered function gets id 0
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("forever").build(&engine, w);
    assert_eq!(f.0, 0);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::StackOverflow));

    ctx.unprepare().unwrap();
    assert_eq!(ctx.state(), ExecutionStatus::Uninitialized);
    assert_eq!(engine.heap_stats().1, 0);
}

#[test]
fn test_operand_stack_growth_is_capped() {
    // Small blocks with a low ceiling; deep frames must overflow
    let engine = Engine::new(EngineProperties {
        init_stack_size: 64,
        max_stack_size: 256,
        ..EngineProperties::default()
    });

    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::Call, 0);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("deep")
        .locals(32)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::StackOverflow));
}

#[test]
fn test_host_panic_is_caught_and_translated() {
    let engine = Engine::with_defaults();

    let boom = system_function(
        &engine,
        "boom",
        &[],
        DataType::value(TypeKind::Void),
        Arc::new(|_g| panic!("kaboom")),
    );

    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::CallSys, boom.0);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("calls_boom").build(&engine, w);

    // Untranslated: generic message
    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert!(matches!(
        ctx.get_exception(),
        Some(ScriptException::ExceptionCaught(_))
    ));

    // With a translation callback the payload becomes the message
    engine.set_translate_exception_callback(Some(Arc::new(|payload| {
        payload
            .downcast_ref::<&str>()
            .map(|s| format!("translated: {}", s))
    })));

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(
        ctx.get_exception_string().unwrap(),
        "Caught an exception from the application: translated: kaboom"
    );
}

#[test]
fn test_set_exception_from_host_function() {
    let engine = Engine::with_defaults();

    let fail = system_function(
        &engine,
        "fail",
        &[],
        DataType::value(TypeKind::Void),
        Arc::new(|g| {
            g.context()
                .set_exception("resource unavailable", true)
                .unwrap();
        }),
    );

    let mut w = BytecodeWriter::new();
    w.emit_w(Opcode::CallSys, fail.0);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("calls_fail").build(&engine, w);

    let mut ctx = Context::new(engine);

    // Outside a system call the API is rejected
    assert!(ctx.set_exception("nope", true).is_err());

    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(
        ctx.get_exception_string().unwrap(),
        "resource unavailable"
    );
}

#[test]
fn test_exception_callback_fires() {
    let engine = Engine::with_defaults();
    let div = register_div(&engine);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_cb = Arc::clone(&seen);

    let mut ctx = Context::new(engine);
    ctx.set_exception_callback(
        Box::new(move |ctx| {
            seen_in_cb.fetch_add(1, Ordering::Relaxed);
            assert_eq!(ctx.state(), ExecutionStatus::Exception);
        }),
        CallConv::Cdecl,
    )
    .unwrap();

    ctx.prepare(div).unwrap();
    ctx.set_arg_dword(0, 1).unwrap();
    ctx.set_arg_dword(1, 0).unwrap();
    ctx.execute().unwrap();
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    ctx.clear_exception_callback();
    ctx.prepare(div).unwrap();
    ctx.set_arg_dword(0, 1).unwrap();
    ctx.set_arg_dword(1, 0).unwrap();
    ctx.execute().unwrap();
    assert_eq!(seen.load(Ordering::Relaxed), 1);
}

#[test]
fn test_unsupported_callback_convention() {
    let engine = Engine::with_defaults();
    let mut ctx = Context::new(engine);
    assert!(ctx
        .set_line_callback(Box::new(|_| {}), CallConv::Generic)
        .is_err());
    assert!(ctx
        .set_exception_callback(Box::new(|_| {}), CallConv::ThisCallObjFirst)
        .is_err());
}
