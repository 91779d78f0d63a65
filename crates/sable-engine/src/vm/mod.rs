//! Sable VM execution core
//!
//! This module tree implements the execution side of the VM:
//! - [`Context`] — an independent, suspendable, serializable execution of a
//!   script function, with its own operand stack and call stack
//! - [`StackArena`] — the segmented, downward-growing DWORD operand stack
//! - [`CallStack`] — tagged frame records, including the sentinels that
//!   bound nested host-initiated executions
//! - [`Engine`] — the shared runtime: function table, type registry,
//!   object heap, native registry, engine properties and user data
//!
//! The interpreter loop itself lives in `interp`, exception unwinding in
//! `unwind`; both are `impl Context` blocks.

pub mod callstack;
pub mod context;
pub mod engine;
pub mod generic;
pub mod interp;
pub mod pow;
pub mod ptr;
pub mod registers;
pub mod stack;
pub mod unwind;

pub use callstack::{CallFrame, CallRecord, CallStack, StateSnapshot};
pub use context::{
    CallConv, CallStateRegisters, Context, ContextCallback, ExceptionInfo, InterruptHandle,
};
pub use engine::{
    active_context_id, ConstructFn, DestructFn, Engine, EngineProperties, HeapObject, JitFn,
    NativeFn, ObjectBody, ObjectHeap, TranslateExceptionFn, TypeInfo,
};
pub use generic::Generic;
pub use ptr::{ObjectHandle, PtrKind, StackPtr, VmPtr};
pub use registers::{ExecutionStatus, Registers};
pub use stack::StackArena;

/// Errors returned by the context API on misuse
///
/// These never corrupt the context: a failed call leaves every register,
/// stack block and owned reference exactly as it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// An argument was out of bounds or otherwise invalid
    #[error("Invalid argument")]
    InvalidArg,

    /// No function, or the referenced function does not exist
    #[error("No function")]
    NoFunction,

    /// The requested operation is not supported here
    #[error("Not supported")]
    NotSupported,

    /// The value's type does not match the declared type
    #[error("Invalid type")]
    InvalidType,

    /// The context is executing and cannot be changed
    #[error("Context is active")]
    ContextActive,

    /// The context is not in the state the operation requires
    #[error("Context is not prepared")]
    ContextNotPrepared,

    /// A stack or call-stack allocation failed or hit its configured limit
    #[error("Out of memory")]
    OutOfMemory,

    /// Internal error
    #[error("Error")]
    Error,
}

/// Result alias for fallible context operations
pub type CtxResult<T> = Result<T, ContextError>;

/// Runtime exceptions the interpreter can raise
///
/// Raising one of these sets the context status to
/// [`ExecutionStatus::Exception`] and records the function, line and
/// section of the faulting instruction. Script-level try/catch may
/// intercept them unless raised with `allow_catch = false`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptException {
    #[error("Null pointer access")]
    NullPointerAccess,

    #[error("Divide by zero")]
    DivideByZero,

    #[error("Divide overflow")]
    DivideOverflow,

    #[error("Overflow in exponent operation")]
    PowOverflow,

    #[error("Stack overflow")]
    StackOverflow,

    #[error("Unbound function called")]
    UnboundFunction,

    #[error("Too many nested calls")]
    TooManyNestedCalls,

    #[error("Unrecognized byte code")]
    UnrecognizedByteCode,

    /// A host function raised an application exception that was caught at
    /// the system-call boundary
    #[error("Caught an exception from the application: {0}")]
    ExceptionCaught(String),

    /// Free-text exception raised by the application via `set_exception`
    #[error("{0}")]
    App(String),
}
