//! Object lifecycle across script execution: allocation, reference
//! counting, casts, virtual dispatch and delegates

mod common;

use common::FunctionBuilder;
use sable_bytecode::{
    BytecodeWriter, DataType, FunctionId, FunctionKind, Opcode, ScriptFunction, TypeId, TypeKind,
};
use sable_engine::{Context, Engine, ExecutionStatus, ScriptException, TypeInfo};
use std::sync::Arc;

#[test]
fn test_alloc_and_free_balance() {
    common::init_logging();
    let engine = Engine::with_defaults();
    let res = engine.register_type({
        let mut t = TypeInfo::value_type("Resource", 2);
        t.is_reference = true;
        t
    });

    // void f() { Resource r; } with an explicit allocate and release
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::PushFrame, 2); // destination: &h
    w.emit_ww(Opcode::Alloc, res.0, 0);
    w.emit_vw(Opcode::Free, 2, res.0);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("scoped")
        .locals(2)
        .var("h", TypeKind::Handle(res), 2, true)
        .build(&engine, w);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);

    let (created, live) = engine.heap_stats();
    assert_eq!(created, 1);
    assert_eq!(live, 0);
}

#[test]
fn test_method_reads_receiver_field() {
    let engine = Engine::with_defaults();
    let cls = engine.register_type(TypeInfo::script_class("Widget", 1));

    // int Widget::value() { return this.field0; }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::LoadThisR, 0);
    w.emit_v(Opcode::RdR4, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let getv = FunctionBuilder::new("value")
        .returns(TypeKind::Int32)
        .receiver(cls)
        .locals(1)
        .var("this", TypeKind::Handle(cls), 0, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let h = engine.allocate_object(cls);
    engine.write_object(h, 0, 55);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(getv).unwrap();
    ctx.set_object(Some(h)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 55);

    assert_eq!(ctx.get_this_type_id(0), Some(cls));
    assert_eq!(ctx.get_this_pointer(0), Some(h));

    ctx.unprepare().unwrap();
    engine.release(h);
    assert_eq!(engine.heap_stats().1, 0);
}

#[test]
fn test_method_with_null_receiver_raises() {
    let engine = Engine::with_defaults();
    let cls = engine.register_type(TypeInfo::script_class("Widget", 1));

    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::LoadThisR, 0);
    w.emit_v(Opcode::RdR4, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let getv = FunctionBuilder::new("value")
        .returns(TypeKind::Int32)
        .receiver(cls)
        .locals(1)
        .var("this", TypeKind::Handle(cls), 0, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(getv).unwrap();
    ctx.set_object(None).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::NullPointerAccess));
}

#[test]
fn test_virtual_dispatch_through_vtable() {
    let engine = Engine::with_defaults();

    // The concrete method is registered first, so its id is known when
    // the class's vtable is built
    let cls = TypeId(0);

    let mut w = BytecodeWriter::new();
    w.emit_vw(Opcode::SetV32, 1, 31);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let impl_id = FunctionBuilder::new("concrete")
        .returns(TypeKind::Int32)
        .receiver(cls)
        .locals(1)
        .var("this", TypeKind::Handle(cls), 0, false)
        .var("r", TypeKind::Int32, 1, false)
        .signature(7)
        .build(&engine, w);

    let registered = engine.register_type({
        let mut t = TypeInfo::script_class("Impl", 1);
        t.virtual_function_table = vec![impl_id];
        t.methods = vec![impl_id];
        t
    });
    assert_eq!(registered, cls);

    // The virtual descriptor resolves through the receiver
    let virt = engine.register_function(ScriptFunction {
        id: FunctionId(0),
        name: "virtual".into(),
        declaration: "int virtual()".into(),
        kind: FunctionKind::Virtual { vtable_index: 0 },
        object_type: Some(cls),
        params: vec![],
        return_type: DataType::value(TypeKind::Int32),
        signature_id: 7,
        script: None,
    });

    // int caller(Impl@ o) { return o.virtual(); }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::PushVPtr, 0);
    w.emit_w(Opcode::CallIntf, virt.0);
    w.emit_vw(Opcode::Free, 0, cls.0);
    w.emit_w(Opcode::Ret, 2);
    let caller = FunctionBuilder::new("caller")
        .params(&[TypeKind::Handle(cls)])
        .returns(TypeKind::Int32)
        .var("o", TypeKind::Handle(cls), 0, false)
        .build(&engine, w);

    let h = engine.allocate_object(cls);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(caller).unwrap();
    ctx.set_arg_object(0, Some(h)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 31);

    ctx.unprepare().unwrap();
    engine.release(h);
    assert_eq!(engine.heap_stats().1, 0);
}

#[test]
fn test_cast_narrows_or_yields_null() {
    let engine = Engine::with_defaults();
    let base = engine.register_type(TypeInfo::script_class("Base", 1));
    let derived = engine.register_type({
        let mut t = TypeInfo::script_class("Derived", 1);
        t.derives_from = Some(base);
        t
    });

    // Derived@ narrow(Base@ o) { return cast<Derived>(o); }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::PushFrame, 0);
    w.emit_w(Opcode::Cast, derived.0);
    w.emit_vw(Opcode::Free, 0, base.0);
    w.emit_w(Opcode::Ret, 2);
    let narrow = FunctionBuilder::new("narrow")
        .params(&[TypeKind::Handle(base)])
        .returns(TypeKind::Handle(derived))
        .var("o", TypeKind::Handle(base), 0, false)
        .build(&engine, w);

    // A Derived object survives the cast
    let d = engine.allocate_object(derived);
    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(narrow).unwrap();
    ctx.set_arg_object(0, Some(d)).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_object(), Some(d));
    ctx.unprepare().unwrap();
    engine.release(d);
    assert_eq!(engine.heap_stats().1, 0);

    // A plain Base object does not
    let b = engine.allocate_object(base);
    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(narrow).unwrap();
    ctx.set_arg_object(0, Some(b)).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.get_return_object(), None);
    ctx.unprepare().unwrap();
    engine.release(b);
    assert_eq!(engine.heap_stats().1, 0);
}

#[test]
fn test_delegate_call_through_function_pointer() {
    let engine = Engine::with_defaults();
    let cls = TypeId(0);

    // int Target::value() { return this.field0; }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::LoadThisR, 0);
    w.emit_v(Opcode::RdR4, 1);
    w.emit_v(Opcode::CpyVtoR32, 1);
    w.emit_w(Opcode::Ret, 2);
    let method = FunctionBuilder::new("value")
        .returns(TypeKind::Int32)
        .receiver(cls)
        .locals(1)
        .var("this", TypeKind::Handle(cls), 0, false)
        .var("r", TypeKind::Int32, 1, false)
        .build(&engine, w);

    let registered = engine.register_type(TypeInfo::script_class("Target", 1));
    assert_eq!(registered, cls);

    let funcdef = engine.funcdef_type();

    // int invoke(Getter@ cb) { return cb(); }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::CallPtr, 0);
    w.emit_vw(Opcode::Free, 0, funcdef.0);
    w.emit_w(Opcode::Ret, 2);
    let invoke = FunctionBuilder::new("invoke")
        .params(&[TypeKind::Funcdef(funcdef)])
        .returns(TypeKind::Int32)
        .var("cb", TypeKind::Funcdef(funcdef), 0, false)
        .build(&engine, w);

    let recv = engine.allocate_object(cls);
    engine.write_object(recv, 0, 99);
    let delegate = engine.allocate_function_object(method, Some(recv));

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(invoke).unwrap();
    ctx.set_arg_object(0, Some(delegate)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);
    assert_eq!(ctx.get_return_dword(), 99);

    ctx.unprepare().unwrap();
    engine.release(delegate);
    engine.release(recv);
    assert_eq!(engine.heap_stats().1, 0);
}

#[test]
fn test_null_function_pointer_raises_unbound() {
    let engine = Engine::with_defaults();

    // The funcdef type carries its signature so the unwinder can
    // describe calls that never happened
    let signature = engine.register_function(ScriptFunction {
        id: FunctionId(0),
        name: "Getter".into(),
        declaration: "int Getter()".into(),
        kind: FunctionKind::Script,
        object_type: None,
        params: vec![],
        return_type: DataType::value(TypeKind::Int32),
        signature_id: 9,
        script: None,
    });
    let funcdef = engine.register_type({
        let mut t = TypeInfo::value_type("Getter", 0);
        t.is_reference = true;
        t.methods = vec![signature];
        t
    });

    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::ClrVPtr, 2);
    w.emit_v(Opcode::CallPtr, 2);
    w.emit_w(Opcode::Ret, 0);
    let f = FunctionBuilder::new("null_call")
        .locals(2)
        .var("cb", TypeKind::Funcdef(funcdef), 2, false)
        .build(&engine, w);

    let mut ctx = Context::new(engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Exception);
    assert_eq!(ctx.get_exception(), Some(&ScriptException::UnboundFunction));
}

#[test]
fn test_handle_copy_counts_references() {
    let engine = Engine::with_defaults();
    let res = engine.register_type(TypeInfo::script_class("Shared", 1));

    // void share(Shared@ p) { Shared@ h = p; }
    let mut w = BytecodeWriter::new();
    w.emit_v(Opcode::ClrVPtr, 2);
    w.emit_v(Opcode::PushVPtr, 0);
    w.emit_vw(Opcode::RefCpyV, 2, res.0);
    w.emit(Opcode::PopPtr);
    w.emit_vw(Opcode::Free, 2, res.0);
    w.emit_vw(Opcode::Free, 0, res.0);
    w.emit_w(Opcode::Ret, 2);
    let share = FunctionBuilder::new("share")
        .params(&[TypeKind::Handle(res)])
        .locals(2)
        .var("p", TypeKind::Handle(res), 0, false)
        .var("h", TypeKind::Handle(res), 2, false)
        .build(&engine, w);

    let obj = engine.allocate_object(res);

    let mut ctx = Context::new(Arc::clone(&engine));
    ctx.prepare(share).unwrap();
    ctx.set_arg_object(0, Some(obj)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionStatus::Finished);

    // Only the host's original reference remains
    ctx.unprepare().unwrap();
    engine.release(obj);
    assert_eq!(engine.heap_stats().1, 0);
}
