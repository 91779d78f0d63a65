//! Sable execution engine
//!
//! The runtime half of the Sable virtual machine: execution contexts over
//! the instruction set defined in `sable-bytecode`.
//!
//! A [`Context`](vm::Context) owns one independent execution — its
//! segmented operand stack, call stack, registers and exception state —
//! and is driven through the prepare / set-args / execute lifecycle:
//!
//! ```rust,ignore
//! let engine = Engine::with_defaults();
//! let sum = engine.register_function(/* compiled `int sum(int, int)` */);
//!
//! let mut ctx = Context::new(engine);
//! ctx.prepare(sum)?;
//! ctx.set_arg_dword(0, 3)?;
//! ctx.set_arg_dword(1, 4)?;
//! assert_eq!(ctx.execute()?, ExecutionStatus::Finished);
//! assert_eq!(ctx.get_return_dword(), 7);
//! ```
//!
//! Contexts support nested executions (host → script → host → script)
//! through `push_state` / `pop_state`, cooperative suspension and
//! cross-thread abortion, script-level try/catch with precise unwinding
//! of live objects, and serialization of a suspended execution for
//! snapshotting.

pub mod vm;

pub use vm::{
    active_context_id, CallConv, Context, ContextError, CtxResult, Engine, EngineProperties,
    ExceptionInfo, ExecutionStatus, Generic, InterruptHandle, NativeFn, ObjectHandle,
    ScriptException, StackPtr, TypeInfo, VmPtr,
};
