//! Register file and the execution status machine

use super::ptr::{ObjectHandle, StackPtr};
use sable_bytecode::TypeId;

/// Lifecycle states of a context
///
/// Transitions are driven by the lifecycle API and by the interpreter;
/// operations called in the wrong state fail with `ContextActive` or
/// `ContextNotPrepared` and leave the context untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// No function prepared
    Uninitialized,
    /// Function prepared, arguments may be set
    Prepared,
    /// The interpreter loop is running
    Active,
    /// Execution yielded; `execute` resumes it
    Suspended,
    /// The initial function returned normally
    Finished,
    /// Execution was aborted from the outside
    Aborted,
    /// A script exception terminated execution
    Exception,
    /// The call stack is being rebuilt from serialized state
    Deserialization,
}

/// The mutable register file of one context
///
/// The interpreter keeps the hot registers (program pointer, stack
/// pointer, frame pointer) in locals and writes them back here before any
/// call that can observe them: host calls, callbacks, exception raises.
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    /// Word offset into the current function's bytecode; `None` until
    /// execution starts
    pub program_pointer: Option<u32>,
    /// Base of the current frame's argument area
    pub stack_frame_pointer: StackPtr,
    pub stack_pointer: StackPtr,
    /// 64-bit scalar result slot; compares write their -1/0/+1 into the
    /// low 32 bits
    pub value_register: u64,
    /// Pointer-typed result slot
    pub object_register: Option<ObjectHandle>,
    /// Type of the object register's content, when known
    pub object_type: Option<TypeId>,
    /// Set when suspend requests or line callbacks need servicing at the
    /// next suspend point
    pub do_process_suspend: bool,
}

impl Default for Registers {
    fn default() -> Self {
        Self {
            program_pointer: None,
            stack_frame_pointer: StackPtr { block: 0, cell: 0 },
            stack_pointer: StackPtr { block: 0, cell: 0 },
            value_register: 0,
            object_register: None,
            object_type: None,
            do_process_suspend: false,
        }
    }
}

impl Registers {
    /// Reset the result registers, keeping the stack positions
    pub fn clear_results(&mut self) {
        self.value_register = 0;
        self.object_register = None;
        self.object_type = None;
    }
}
