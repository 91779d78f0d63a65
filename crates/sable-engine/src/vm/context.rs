//! The execution context
//!
//! A [`Context`] owns one independent execution of a script function: the
//! segmented operand stack, the call stack, the register file, exception
//! state, and the interpreter loop (in `interp`) that drives it. Contexts
//! support nested calls (host → script → host → script), cooperative
//! suspension and abortion, try/catch unwinding, and serialization of a
//! live execution.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──prepare──▶ Prepared ──execute──▶ Active
//!        ▲                      ▲                  │ │ │ │
//!        │                      └────suspended─────┘ │ │ │
//!        │                                 Finished◀─┘ │ └─▶Exception
//!        └──────unprepare──────────────────── Aborted◀─┘
//! ```
//!
//! `push_state` checkpoints an Active execution behind a sentinel call
//! stack record so a host function invoked by the script can reuse the
//! same context for a fresh call; `pop_state` restores the checkpoint.

use super::callstack::{CallFrame, CallRecord, CallStack, StateSnapshot};
use super::engine::{self, Engine};
use super::ptr::{ObjectHandle, PtrKind, StackPtr, VmPtr};
use super::registers::{ExecutionStatus, Registers};
use super::stack::StackArena;
use super::{ContextError, CtxResult, ScriptException};
use rustc_hash::FxHashMap;
use sable_bytecode::{
    DataType, FunctionId, FunctionKind, ScriptFunction, TypeId, TypeKind, PTR_SIZE,
};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with the context at line cues or on exceptions
pub type ContextCallback = Box<dyn FnMut(&mut Context) + Send>;

/// Calling convention of a host callback
///
/// Callbacks run as plain closures; the convention is kept on the API so
/// callers registering through a binding layer get the same validation
/// the native layer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    Cdecl,
    StdCall,
    ThisCallAsGlobal,
    Generic,
    ThisCallObjFirst,
    ThisCallObjLast,
}

impl CallConv {
    fn supported_for_callback(self) -> bool {
        !matches!(
            self,
            CallConv::Generic | CallConv::ThisCallObjFirst | CallConv::ThisCallObjLast
        )
    }
}

/// Details of the most recent script exception
///
/// Kept until the next `prepare`, so the exception can be inspected even
/// after the context has been unprepared.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub kind: ScriptException,
    pub function: Option<FunctionId>,
    pub line: u32,
    pub column: u32,
    pub section: String,
}

/// Cross-thread interrupt bits polled by the interpreter
///
/// `abort` and `suspend` may be requested from any thread through an
/// [`InterruptHandle`]; the interpreter observes them at suspend
/// instructions and after system calls. A request racing a status change
/// is caught by the next poll.
#[derive(Debug, Default)]
pub(crate) struct InterruptFlags {
    pub do_suspend: AtomicBool,
    pub do_abort: AtomicBool,
    pub external_suspend_request: AtomicBool,
    pub do_process_suspend: AtomicBool,
}

/// Clonable handle for requesting suspension or abortion from other threads
#[derive(Clone)]
pub struct InterruptHandle {
    flags: Arc<InterruptFlags>,
}

impl InterruptHandle {
    /// Request cooperative suspension at the next suspend point
    pub fn suspend(&self) {
        self.flags.do_suspend.store(true, Ordering::Relaxed);
        self.flags
            .external_suspend_request
            .store(true, Ordering::Relaxed);
        self.flags.do_process_suspend.store(true, Ordering::Relaxed);
    }

    /// Request abortion at the next suspend point
    pub fn abort(&self) {
        self.flags.do_suspend.store(true, Ordering::Relaxed);
        self.flags
            .external_suspend_request
            .store(true, Ordering::Relaxed);
        self.flags.do_process_suspend.store(true, Ordering::Relaxed);
        self.flags.do_abort.store(true, Ordering::Relaxed);
    }
}

/// Cached argument description for `get_arg_on_stack`
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArgOnStack {
    pub ty: DataType,
}

/// An independent execution of a script function
pub struct Context {
    pub(crate) id: u64,
    pub(crate) engine: Arc<Engine>,
    pub(crate) status: ExecutionStatus,
    pub(crate) regs: Registers,
    pub(crate) stack: StackArena,
    pub(crate) call_stack: CallStack,

    /// Function at the bottom of this execution; strong while prepared
    pub(crate) initial_function: Option<Arc<ScriptFunction>>,
    /// Function whose bytecode is executing; switches on call and return
    pub(crate) current_function: Option<Arc<ScriptFunction>>,
    /// System function whose host code is currently running, if any
    pub(crate) calling_system_function: Option<FunctionId>,

    pub(crate) original_stack_pointer: StackPtr,
    pub(crate) arguments_size: u32,
    pub(crate) return_value_size: u32,

    pub(crate) exception: Option<ExceptionInfo>,
    pub(crate) exception_will_be_caught: bool,

    pub(crate) interrupt: Arc<InterruptFlags>,
    pub(crate) in_exception_handler: bool,
    pub(crate) need_to_cleanup_args: bool,
    pub(crate) is_stack_memory_not_allocated: bool,

    pub(crate) line_callback: Option<ContextCallback>,
    pub(crate) exception_callback: Option<ContextCallback>,
    line_callback_installed: bool,
    exception_callback_installed: bool,

    user_data: FxHashMap<u64, Arc<dyn Any + Send + Sync>>,

    /// Decode-ahead cache for `get_arg_on_stack`, keyed by function and
    /// program position
    pub(crate) args_cache: Vec<ArgOnStack>,
    pub(crate) args_cache_func: Option<FunctionId>,
    pub(crate) args_cache_pos: u32,
}

impl Context {
    /// Create a context executing against `engine`
    pub fn new(engine: Arc<Engine>) -> Self {
        let props = engine.properties().clone();
        Self {
            id: engine::next_context_id(),
            engine,
            status: ExecutionStatus::Uninitialized,
            regs: Registers::default(),
            stack: StackArena::new(props.init_stack_size, props.max_stack_size),
            call_stack: CallStack::new(props.max_call_stack_size),
            initial_function: None,
            current_function: None,
            calling_system_function: None,
            original_stack_pointer: StackPtr { block: 0, cell: 0 },
            arguments_size: 0,
            return_value_size: 0,
            exception: None,
            exception_will_be_caught: false,
            interrupt: Arc::new(InterruptFlags::default()),
            in_exception_handler: false,
            need_to_cleanup_args: false,
            is_stack_memory_not_allocated: false,
            line_callback: None,
            exception_callback: None,
            line_callback_installed: false,
            exception_callback_installed: false,
            user_data: FxHashMap::default(),
            args_cache: Vec::new(),
            args_cache_func: None,
            args_cache_pos: 0,
        }
    }

    /// The engine this context executes against
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Current lifecycle state
    pub fn state(&self) -> ExecutionStatus {
        self.status
    }

    /// Handle for requesting suspension or abortion from another thread
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flags: Arc::clone(&self.interrupt),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Prepare the context for executing `func`
    ///
    /// Re-preparing the same function after it finished reuses the frame
    /// layout. Transitions Uninitialized/Finished (or a terminal state)
    /// to Prepared; fails with `ContextActive` while executing.
    pub fn prepare(&mut self, func: FunctionId) -> CtxResult<()> {
        let func = self.engine.function(func).ok_or(ContextError::NoFunction)?;

        if matches!(
            self.status,
            ExecutionStatus::Active | ExecutionStatus::Suspended
        ) {
            return Err(ContextError::ContextActive);
        }

        // Clean up an execution that did not run to completion
        if !matches!(
            self.status,
            ExecutionStatus::Finished | ExecutionStatus::Uninitialized
        ) {
            self.clean_stack(false);
        }

        self.clean_return_object();

        if self.initial_function.is_some() {
            self.release_prepared_receiver();

            // Reset the stack to where it was before the previous prepare
            self.regs.stack_pointer = self.original_stack_pointer;
        }

        let same = self
            .initial_function
            .as_ref()
            .map(|f| f.id == func.id)
            .unwrap_or(false);

        if same {
            self.current_function = self.initial_function.clone();
        } else {
            self.initial_function = Some(Arc::clone(&func));
            self.current_function = Some(Arc::clone(&func));

            self.arguments_size = func.arguments_size();
            self.return_value_size = if func.returns_on_stack() {
                func.return_type.value_size()
            } else {
                0
            };

            let stack_needed = self.arguments_size
                + self.return_value_size
                + func.script_data().map(|s| s.stack_needed).unwrap_or(0);

            let sp = if self.stack.is_allocated() {
                self.regs.stack_pointer
            } else {
                self.stack.allocate_first()
            };
            match self.stack.reserve(stack_needed, sp, 0) {
                Ok(new_sp) => self.regs.stack_pointer = new_sp,
                Err(_) => {
                    self.is_stack_memory_not_allocated = true;
                    self.regs.stack_frame_pointer = self.regs.stack_pointer;
                    self.set_internal_exception(ScriptException::StackOverflow, true);
                    return Err(ContextError::OutOfMemory);
                }
            }
        }

        // Most of the time the previous state is Finished and these are
        // already initialized
        if self.status != ExecutionStatus::Finished {
            self.exception = None;
            self.exception_will_be_caught = false;
            self.interrupt.do_abort.store(false, Ordering::Relaxed);
            self.interrupt.do_suspend.store(false, Ordering::Relaxed);
            self.interrupt
                .external_suspend_request
                .store(false, Ordering::Relaxed);
            self.interrupt
                .do_process_suspend
                .store(false, Ordering::Relaxed);
            self.regs.do_process_suspend = self.line_callback_installed;
        }
        self.status = ExecutionStatus::Prepared;
        self.regs.program_pointer = None;

        // Lay out the initial frame: arguments, then the return value area
        self.regs.stack_frame_pointer = self
            .regs
            .stack_pointer
            .offset(-((self.arguments_size + self.return_value_size) as i32));
        self.original_stack_pointer = self.regs.stack_pointer;
        self.regs.stack_pointer = self.regs.stack_frame_pointer;

        self.stack
            .zero(self.regs.stack_frame_pointer, self.arguments_size);

        if self.return_value_size > 0 {
            // The hidden first argument addresses the return value slot
            let mut slot = self.regs.stack_frame_pointer;
            let func = self.initial_function.as_ref().ok_or(ContextError::Error)?;
            if func.has_receiver() {
                slot = slot.offset(PTR_SIZE as i32);
            }
            let ret_area = self
                .regs
                .stack_frame_pointer
                .offset(self.arguments_size as i32);
            self.stack.write64(slot, VmPtr::stack(ret_area).raw());
        }

        log::trace!(
            "context {}: prepared {} ({} arg cells)",
            self.id,
            func.name,
            self.arguments_size
        );
        Ok(())
    }

    /// Release everything the prepared or finished execution owned and
    /// return to Uninitialized
    pub fn unprepare(&mut self) -> CtxResult<()> {
        if matches!(
            self.status,
            ExecutionStatus::Active | ExecutionStatus::Suspended
        ) {
            return Err(ContextError::ContextActive);
        }

        let depth = engine::push_active_context(self.id);
        debug_assert!(depth >= 1);

        if !matches!(
            self.status,
            ExecutionStatus::Uninitialized | ExecutionStatus::Finished
        ) {
            self.clean_stack(false);
        }

        debug_assert!(!self.need_to_cleanup_args);

        self.clean_return_object();

        engine::pop_active_context(self.id);

        self.release_prepared_receiver();

        if self.initial_function.take().is_some() {
            self.regs.stack_pointer = self.original_stack_pointer;
        }

        self.current_function = None;
        self.regs.program_pointer = None;
        self.status = ExecutionStatus::Uninitialized;
        self.regs.stack_frame_pointer = StackPtr { block: 0, cell: 0 };

        // Nothing on the call stack holds stack memory any more; drop the
        // grown blocks
        if self.call_stack.is_empty() {
            self.stack.shrink_to_first();
        }

        Ok(())
    }

    /// Release the receiver stored in slot 0 of the prepared frame, when
    /// the initial function is a script-object method
    fn release_prepared_receiver(&mut self) {
        let Some(initial) = self.initial_function.as_ref() else {
            return;
        };
        let Some(obj_type) = initial.object_type else {
            return;
        };
        let is_script_obj = self
            .engine
            .type_info(obj_type)
            .map(|t| t.is_script_object)
            .unwrap_or(false);
        if !is_script_obj || !self.stack.is_allocated() {
            return;
        }
        let fp = self.regs.stack_frame_pointer;
        if !self.stack.contains(fp) {
            return;
        }
        let raw = self.stack.read64(fp);
        if let Some(h) = VmPtr::from_raw(raw).as_object() {
            self.engine.release(h);
        }
        self.stack.write64(fp, 0);
    }

    /// Destroy or release whatever the finished execution returned
    pub(crate) fn clean_return_object(&mut self) {
        if let Some(initial) = self.initial_function.as_ref() {
            if initial.returns_on_stack() && self.status == ExecutionStatus::Finished {
                // The value was constructed in the return area on the stack
                let ret_area = self
                    .regs
                    .stack_frame_pointer
                    .offset(self.arguments_size as i32);
                if let Some(ty) = initial.return_type.object_type() {
                    let size = self.return_value_size;
                    if self.stack.contains(ret_area) && size > 0 {
                        let mut cells =
                            self.stack.cells(ret_area, size).to_vec();
                        self.engine.destruct_in_place(ty, &mut cells);
                        self.stack.cells_mut(ret_area, size).copy_from_slice(&cells);
                    }
                }
                return;
            }
        }

        if let Some(h) = self.regs.object_register.take() {
            self.engine.release(h);
        }
        self.regs.object_type = None;
    }

    /// Run the prepared or suspended execution until it finishes,
    /// suspends, aborts or raises
    pub fn execute(&mut self) -> CtxResult<ExecutionStatus> {
        if !matches!(
            self.status,
            ExecutionStatus::Prepared | ExecutionStatus::Suspended
        ) {
            return Err(ContextError::ContextNotPrepared);
        }

        self.status = ExecutionStatus::Active;

        let depth = engine::push_active_context(self.id);

        // Refuse runaway host→script recursion before it exhausts the
        // thread's own stack
        if depth as u32 > self.engine.properties().max_nested_calls {
            self.set_internal_exception(ScriptException::TooManyNestedCalls, true);
        } else if self.regs.program_pointer.is_none() {
            self.set_program_pointer();
        }

        let auto_gc = self.engine.properties().auto_garbage_collect;
        let gc_pre = if auto_gc { self.engine.heap_stats().0 } else { 0 };

        while self.status == ExecutionStatus::Active {
            self.run_interpreter();

            // An exception that a script try/catch covers unwinds here and
            // resumes at the catch position
            if self.status == ExecutionStatus::Exception && self.exception_will_be_caught {
                self.clean_stack(true);
            }
        }

        if self.line_callback_installed {
            // One final call so listeners observe the state change
            self.call_line_callback();
            self.regs.do_process_suspend = true;
        } else {
            self.regs.do_process_suspend = false;
        }
        self.interrupt.do_suspend.store(false, Ordering::Relaxed);
        self.interrupt
            .do_process_suspend
            .store(false, Ordering::Relaxed);

        if auto_gc {
            let gc_post = self.engine.heap_stats().0;
            if gc_post > gc_pre {
                self.engine.garbage_collect_steps(gc_post - gc_pre);
            } else {
                self.engine.garbage_collect_steps(1);
            }
        }

        engine::pop_active_context(self.id);

        if self.status == ExecutionStatus::Finished {
            self.regs.object_type = self
                .initial_function
                .as_ref()
                .and_then(|f| f.return_type.object_type());
            return Ok(ExecutionStatus::Finished);
        }

        if self.interrupt.do_abort.swap(false, Ordering::Relaxed) {
            self.status = ExecutionStatus::Aborted;
            return Ok(ExecutionStatus::Aborted);
        }

        match self.status {
            ExecutionStatus::Suspended => Ok(ExecutionStatus::Suspended),
            ExecutionStatus::Exception => Ok(ExecutionStatus::Exception),
            _ => Err(ContextError::Error),
        }
    }

    /// Resolve the entry function and set up its frame; called on the
    /// first `execute` after a prepare
    pub(crate) fn set_program_pointer(&mut self) {
        debug_assert!(self.regs.program_pointer.is_none());
        let Some(mut func) = self.current_function.clone() else {
            self.set_internal_exception(ScriptException::NullPointerAccess, false);
            return;
        };

        // Virtual and interface entry points resolve against the receiver
        if matches!(
            func.kind,
            FunctionKind::Virtual { .. } | FunctionKind::Interface { .. }
        ) {
            let receiver = VmPtr::from_raw(self.stack.read64(self.regs.stack_frame_pointer));
            match self.resolve_real_function(&func, receiver) {
                Ok(real) => {
                    self.current_function = Some(Arc::clone(&real));
                    func = real;
                }
                Err(exc) => {
                    self.set_internal_exception(exc, false);
                    return;
                }
            }
        }

        match func.kind {
            FunctionKind::Script => {
                self.regs.program_pointer = Some(0);
                self.prepare_script_function();
            }
            FunctionKind::System | FunctionKind::Generic => {
                debug_assert!(self.status != ExecutionStatus::Deserialization);
                let popped = self.call_system_function(func.id);
                self.regs.stack_pointer = self.regs.stack_pointer.offset(popped);
                if self.status == ExecutionStatus::Active {
                    self.status = ExecutionStatus::Finished;
                }
            }
            _ => {
                if self.status != ExecutionStatus::Exception {
                    self.set_internal_exception(ScriptException::NullPointerAccess, false);
                }
            }
        }
    }

    /// Request abortion; safe from the executing thread, or from any
    /// thread through [`Context::interrupt_handle`]
    pub fn abort(&mut self) {
        if self.status == ExecutionStatus::Suspended {
            self.status = ExecutionStatus::Aborted;
        }
        self.interrupt_handle().abort();
    }

    /// Request cooperative suspension at the next suspend point
    pub fn suspend(&mut self) {
        self.interrupt_handle().suspend();
    }

    /// True when the context is executing nested calls
    pub fn is_nested(&self) -> bool {
        self.nested_count() > 0
    }

    /// Number of nested execution boundaries on the call stack
    pub fn nested_count(&self) -> u32 {
        self.call_stack.nested_depth() as u32
    }

    /// Checkpoint the Active execution so the context can be freshly
    /// prepared for a nested call; restored by [`Context::pop_state`]
    pub fn push_state(&mut self) -> CtxResult<()> {
        if self.status != ExecutionStatus::Active {
            return Err(ContextError::Error);
        }

        // Both records must fit, or nothing changes
        if !self.call_stack.has_room_for(2) {
            return Err(ContextError::OutOfMemory);
        }

        self.push_call_state().map_err(|_| ContextError::Error)?;

        let snapshot = StateSnapshot {
            calling_system_function: self.calling_system_function,
            initial_function: self.initial_function.as_ref().map(|f| f.id),
            original_stack_pointer: self.original_stack_pointer,
            arguments_size: self.arguments_size,
            value_register: self.regs.value_register,
            object_register: self.regs.object_register,
            object_type: self.regs.object_type,
        };
        self.call_stack
            .push_nested(snapshot)
            .map_err(|_| ContextError::Error)?;

        // Keep the nested execution from overwriting the value at the top
        self.regs.stack_pointer = self.regs.stack_pointer.offset(-(PTR_SIZE as i32));

        self.initial_function = None;
        self.calling_system_function = None;
        self.regs.object_register = None;
        self.regs.object_type = None;

        if self.status != ExecutionStatus::Deserialization {
            self.status = ExecutionStatus::Uninitialized;
        }
        Ok(())
    }

    /// Restore the checkpoint made by [`Context::push_state`]
    pub fn pop_state(&mut self) -> CtxResult<()> {
        if !self.is_nested() {
            return Err(ContextError::Error);
        }

        // Drop whatever the nested execution left behind
        self.unprepare()?;

        let Some(CallRecord::Nested(snapshot)) = self.call_stack.pop() else {
            return Err(ContextError::Error);
        };

        self.calling_system_function = snapshot.calling_system_function;
        self.initial_function = snapshot
            .initial_function
            .and_then(|id| self.engine.function(id));
        self.original_stack_pointer = snapshot.original_stack_pointer;
        self.arguments_size = snapshot.arguments_size;
        self.regs.value_register = snapshot.value_register;
        self.regs.object_register = snapshot.object_register;
        self.regs.object_type = snapshot.object_type;

        self.return_value_size = self
            .initial_function
            .as_ref()
            .filter(|f| f.returns_on_stack())
            .map(|f| f.return_type.value_size())
            .unwrap_or(0);

        self.pop_call_state();
        self.status = ExecutionStatus::Active;
        Ok(())
    }

    /// Save the current execution position on the call stack
    pub(crate) fn push_call_state(&mut self) -> Result<(), ScriptException> {
        let frame = CallFrame {
            frame_pointer: self.regs.stack_frame_pointer,
            function: self
                .current_function
                .as_ref()
                .map(|f| f.id)
                .unwrap_or(FunctionId(0)),
            program_pointer: self.regs.program_pointer,
            stack_pointer: self.regs.stack_pointer,
        };
        self.call_stack.push_frame(frame).map_err(|_| {
            log::debug!("context {}: call stack limit reached", self.id);
            ScriptException::StackOverflow
        })
    }

    /// Restore the most recent execution position from the call stack
    pub(crate) fn pop_call_state(&mut self) {
        match self.call_stack.pop() {
            Some(CallRecord::Frame(frame)) => {
                self.regs.stack_frame_pointer = frame.frame_pointer;
                self.current_function = self.engine.function(frame.function);
                self.regs.program_pointer = frame.program_pointer;
                self.regs.stack_pointer = frame.stack_pointer;
            }
            other => {
                debug_assert!(other.is_none(), "popped a sentinel as a call frame");
            }
        }
    }

    // ========================================================================
    // Argument setters
    // ========================================================================

    /// Set the receiver for a prepared method call
    pub fn set_object(&mut self, obj: Option<ObjectHandle>) -> CtxResult<()> {
        if self.status != ExecutionStatus::Prepared {
            return Err(ContextError::ContextNotPrepared);
        }
        let func = self
            .initial_function
            .as_ref()
            .ok_or(ContextError::ContextNotPrepared)?;
        let Some(obj_type) = func.object_type else {
            return Err(ContextError::Error);
        };

        let fp = self.regs.stack_frame_pointer;
        if let Some(h) = obj {
            let counted = self
                .engine
                .type_info(obj_type)
                .map(|t| t.is_reference && !t.is_nocount)
                .unwrap_or(false);
            if counted {
                self.engine.add_ref(h);
            }
            self.stack.write64(fp, VmPtr::object(h, 0).raw());
        } else {
            self.stack.write64(fp, 0);
        }
        Ok(())
    }

    fn arg_slot(&self, arg: usize) -> CtxResult<(StackPtr, DataType)> {
        if self.status != ExecutionStatus::Prepared {
            return Err(ContextError::ContextNotPrepared);
        }
        let func = self
            .initial_function
            .as_ref()
            .ok_or(ContextError::ContextNotPrepared)?;
        let param = func.params.get(arg).ok_or(ContextError::InvalidArg)?;

        let mut offset = 0i32;
        if func.has_receiver() {
            offset += PTR_SIZE as i32;
        }
        if func.returns_on_stack() {
            offset += PTR_SIZE as i32;
        }
        for p in &func.params[..arg] {
            offset += p.ty.stack_size() as i32;
        }
        Ok((self.regs.stack_frame_pointer.offset(offset), param.ty))
    }

    fn primitive_byte_size(ty: DataType) -> Option<u32> {
        if ty.is_reference() || ty.is_object() {
            return None;
        }
        match ty.kind {
            TypeKind::Bool | TypeKind::Int8 | TypeKind::Uint8 => Some(1),
            TypeKind::Int16 | TypeKind::Uint16 => Some(2),
            TypeKind::Int32 | TypeKind::Uint32 | TypeKind::Float => Some(4),
            TypeKind::Int64 | TypeKind::Uint64 | TypeKind::Double => Some(8),
            _ => None,
        }
    }

    /// Set a byte-sized argument
    pub fn set_arg_byte(&mut self, arg: usize, value: u8) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if Self::primitive_byte_size(ty) != Some(1) {
            return Err(ContextError::InvalidType);
        }
        self.stack.write(slot, value as u32);
        Ok(())
    }

    /// Set a word-sized argument
    pub fn set_arg_word(&mut self, arg: usize, value: u16) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if Self::primitive_byte_size(ty) != Some(2) {
            return Err(ContextError::InvalidType);
        }
        self.stack.write(slot, value as u32);
        Ok(())
    }

    /// Set a dword-sized argument
    pub fn set_arg_dword(&mut self, arg: usize, value: u32) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if Self::primitive_byte_size(ty) != Some(4) {
            return Err(ContextError::InvalidType);
        }
        self.stack.write(slot, value);
        Ok(())
    }

    /// Set a qword-sized argument
    pub fn set_arg_qword(&mut self, arg: usize, value: u64) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if Self::primitive_byte_size(ty) != Some(8) {
            return Err(ContextError::InvalidType);
        }
        self.stack.write64(slot, value);
        Ok(())
    }

    /// Set a float argument
    pub fn set_arg_float(&mut self, arg: usize, value: f32) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if ty.kind != TypeKind::Float || ty.is_reference() {
            return Err(ContextError::InvalidType);
        }
        self.stack.write(slot, value.to_bits());
        Ok(())
    }

    /// Set a double argument
    pub fn set_arg_double(&mut self, arg: usize, value: f64) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if ty.kind != TypeKind::Double || ty.is_reference() {
            return Err(ContextError::InvalidType);
        }
        self.stack.write64(slot, value.to_bits());
        Ok(())
    }

    /// Set a reference argument to an address
    pub fn set_arg_address(&mut self, arg: usize, value: VmPtr) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if !ty.is_reference() && !ty.is_object() {
            return Err(ContextError::InvalidType);
        }
        self.stack.write64(slot, value.raw());
        Ok(())
    }

    /// Set an object argument
    ///
    /// Handle parameters gain a reference; for by-value parameters the
    /// context takes ownership of the passed object.
    pub fn set_arg_object(&mut self, arg: usize, obj: Option<ObjectHandle>) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if !ty.is_object() {
            return Err(ContextError::InvalidType);
        }
        match obj {
            Some(h) => {
                if ty.is_counted() {
                    self.engine.add_ref(h);
                }
                self.stack.write64(slot, VmPtr::object(h, 0).raw());
            }
            None => self.stack.write64(slot, 0),
        }
        Ok(())
    }

    /// Set a variant (`?`) argument: the address of a value plus its type
    pub fn set_arg_var_type(
        &mut self,
        arg: usize,
        value: VmPtr,
        type_id: TypeId,
    ) -> CtxResult<()> {
        let (slot, ty) = self.arg_slot(arg)?;
        if ty.kind != TypeKind::Variant {
            return Err(ContextError::InvalidType);
        }
        self.stack.write64(slot, value.raw());
        self.stack
            .write(slot.offset(PTR_SIZE as i32), type_id.0);
        Ok(())
    }

    // ========================================================================
    // Return value inspectors
    // ========================================================================

    fn return_ready(&self) -> Option<&Arc<ScriptFunction>> {
        if self.status != ExecutionStatus::Finished {
            return None;
        }
        self.initial_function.as_ref()
    }

    /// Low byte of the return value; 0 unless Finished with a byte-sized
    /// return type
    pub fn get_return_byte(&self) -> u8 {
        self.return_ready()
            .filter(|f| Self::primitive_byte_size(f.return_type) == Some(1))
            .map(|_| self.regs.value_register as u8)
            .unwrap_or(0)
    }

    /// Low word of the return value
    pub fn get_return_word(&self) -> u16 {
        self.return_ready()
            .filter(|f| Self::primitive_byte_size(f.return_type) == Some(2))
            .map(|_| self.regs.value_register as u16)
            .unwrap_or(0)
    }

    /// Low dword of the return value
    pub fn get_return_dword(&self) -> u32 {
        self.return_ready()
            .filter(|f| Self::primitive_byte_size(f.return_type) == Some(4))
            .map(|_| self.regs.value_register as u32)
            .unwrap_or(0)
    }

    /// Full qword of the return value
    pub fn get_return_qword(&self) -> u64 {
        self.return_ready()
            .filter(|f| Self::primitive_byte_size(f.return_type) == Some(8))
            .map(|_| self.regs.value_register)
            .unwrap_or(0)
    }

    /// The return value as a float
    pub fn get_return_float(&self) -> f32 {
        self.return_ready()
            .filter(|f| f.return_type.kind == TypeKind::Float && !f.return_type.is_reference())
            .map(|_| f32::from_bits(self.regs.value_register as u32))
            .unwrap_or(0.0)
    }

    /// The return value as a double
    pub fn get_return_double(&self) -> f64 {
        self.return_ready()
            .filter(|f| f.return_type.kind == TypeKind::Double && !f.return_type.is_reference())
            .map(|_| f64::from_bits(self.regs.value_register))
            .unwrap_or(0.0)
    }

    /// The returned address, for reference-returning functions
    pub fn get_return_address(&self) -> VmPtr {
        self.return_ready()
            .filter(|f| f.return_type.is_reference())
            .map(|_| VmPtr::from_raw(self.regs.value_register))
            .unwrap_or(VmPtr::null())
    }

    /// The returned object handle
    pub fn get_return_object(&self) -> Option<ObjectHandle> {
        let func = self.return_ready()?;
        if func.returns_object_handle() {
            self.regs.object_register
        } else {
            None
        }
    }

    /// Address of the return value itself: the stack slot for values
    /// returned on the stack, or the object register content
    pub fn get_address_of_return_value(&self) -> VmPtr {
        let Some(func) = self.return_ready() else {
            return VmPtr::null();
        };
        if func.returns_on_stack() {
            return VmPtr::stack(
                self.regs
                    .stack_frame_pointer
                    .offset(self.arguments_size as i32),
            );
        }
        match self.regs.object_register {
            Some(h) => VmPtr::object(h, 0),
            None => VmPtr::null(),
        }
    }

    // ========================================================================
    // Exception surface
    // ========================================================================

    /// Raise an application exception; valid only from within a system
    /// function invoked by this context
    pub fn set_exception(&mut self, descr: &str, allow_catch: bool) -> CtxResult<()> {
        if self.calling_system_function.is_none() {
            return Err(ContextError::Error);
        }
        self.set_internal_exception(ScriptException::App(descr.to_string()), allow_catch);
        Ok(())
    }

    /// Raise a script exception from inside the interpreter
    pub(crate) fn set_internal_exception(&mut self, kind: ScriptException, allow_catch: bool) {
        if self.in_exception_handler {
            debug_assert!(false, "exception raised while unwinding");
            return;
        }

        self.status = ExecutionStatus::Exception;
        self.regs.do_process_suspend = true;

        let (function, line, column, section) = match self.current_function.as_ref() {
            Some(f) => {
                let pos = self.regs.program_pointer.unwrap_or(0);
                let (line, column) = f.find_line(pos).unwrap_or((0, 0));
                (
                    Some(f.id),
                    line,
                    column,
                    f.section_name().unwrap_or("").to_string(),
                )
            }
            None => (None, 0, 0, String::new()),
        };
        log::debug!(
            "context {}: exception `{}` in {:?} at line {}",
            self.id,
            kind,
            function,
            line
        );
        self.exception = Some(ExceptionInfo {
            kind,
            function,
            line,
            column,
            section,
        });

        self.exception_will_be_caught = allow_catch && self.find_exception_try_catch();

        if self.exception_callback_installed {
            self.call_exception_callback();
        }
    }

    /// Function the last exception was raised in
    pub fn get_exception_function(&self) -> Option<FunctionId> {
        self.exception.as_ref().and_then(|e| e.function)
    }

    /// Line, column and section of the last exception
    pub fn get_exception_line_number(&self) -> Option<(u32, u32, &str)> {
        self.exception
            .as_ref()
            .map(|e| (e.line, e.column, e.section.as_str()))
    }

    /// Message of the last exception
    pub fn get_exception_string(&self) -> Option<String> {
        self.exception.as_ref().map(|e| e.kind.to_string())
    }

    /// Kind of the last exception
    pub fn get_exception(&self) -> Option<&ScriptException> {
        self.exception.as_ref().map(|e| &e.kind)
    }

    /// Whether the pending exception will be caught by script code
    pub fn will_exception_be_caught(&self) -> bool {
        self.exception_will_be_caught
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Install the callback invoked at every line cue
    pub fn set_line_callback(&mut self, cb: ContextCallback, conv: CallConv) -> CtxResult<()> {
        // Turn the callback off while it is being replaced
        self.line_callback_installed = false;

        if !conv.supported_for_callback() {
            self.regs.do_process_suspend =
                self.interrupt.do_suspend.load(Ordering::Relaxed);
            return Err(ContextError::NotSupported);
        }

        self.line_callback = Some(cb);
        self.line_callback_installed = true;
        // Suspend instructions must be processed while a line callback is
        // installed or a suspension was requested
        self.regs.do_process_suspend = true;
        Ok(())
    }

    /// Remove the line callback
    pub fn clear_line_callback(&mut self) {
        self.line_callback = None;
        self.line_callback_installed = false;
        self.regs.do_process_suspend = self.interrupt.do_suspend.load(Ordering::Relaxed);
    }

    /// Install the callback invoked when an exception is raised
    pub fn set_exception_callback(&mut self, cb: ContextCallback, conv: CallConv) -> CtxResult<()> {
        if !conv.supported_for_callback() {
            return Err(ContextError::NotSupported);
        }
        self.exception_callback = Some(cb);
        self.exception_callback_installed = true;
        Ok(())
    }

    /// Remove the exception callback
    pub fn clear_exception_callback(&mut self) {
        self.exception_callback = None;
        self.exception_callback_installed = false;
    }

    pub(crate) fn call_line_callback(&mut self) {
        if let Some(mut cb) = self.line_callback.take() {
            cb(self);
            if self.line_callback.is_none() && self.line_callback_installed {
                self.line_callback = Some(cb);
            }
        }
    }

    pub(crate) fn call_exception_callback(&mut self) {
        if let Some(mut cb) = self.exception_callback.take() {
            cb(self);
            if self.exception_callback.is_none() && self.exception_callback_installed {
                self.exception_callback = Some(cb);
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of frames visible to introspection; the current function is
    /// level 0
    pub fn get_callstack_size(&self) -> usize {
        if self.current_function.is_none() {
            return 0;
        }
        1 + self.call_stack.len()
    }

    /// Function executing at `level`
    ///
    /// At a nested boundary this reports the system function whose host
    /// code initiated the nesting.
    pub fn get_function(&self, level: usize) -> Option<FunctionId> {
        if level >= self.get_callstack_size() {
            return None;
        }
        if level == 0 {
            return self.current_function.as_ref().map(|f| f.id);
        }
        match self.call_stack.at_level(level)? {
            CallRecord::Frame(f) => Some(f.function),
            CallRecord::Nested(s) => s.calling_system_function,
        }
    }

    /// Function, frame pointer, program position and stack pointer at
    /// `level`; `None` for nested boundary records
    pub(crate) fn frame_at_level(
        &self,
        level: usize,
    ) -> Option<(Arc<ScriptFunction>, StackPtr, Option<u32>, StackPtr)> {
        if level >= self.get_callstack_size() {
            return None;
        }
        if level == 0 {
            let func = self.current_function.clone()?;
            return Some((
                func,
                self.regs.stack_frame_pointer,
                self.regs.program_pointer,
                self.regs.stack_pointer,
            ));
        }
        match self.call_stack.at_level(level)? {
            CallRecord::Frame(f) => {
                let func = self.engine.function(f.function)?;
                Some((func, f.frame_pointer, f.program_pointer, f.stack_pointer))
            }
            CallRecord::Nested(_) => None,
        }
    }

    /// Source line and column at `level`; the section name comes with it
    ///
    /// For calling frames the position is backed up one word so the
    /// reported line is the call site, not the instruction after it.
    pub fn get_line_number(&self, level: usize) -> Option<(u32, u32, String)> {
        let (func, _, pp, _) = self.frame_at_level(level)?;
        func.script_data()?;
        let mut pos = pp.unwrap_or(0);
        if level > 0 {
            pos = pos.saturating_sub(1);
        }
        let (line, col) = func.find_line(pos)?;
        Some((line, col, func.section_name().unwrap_or("").to_string()))
    }

    /// Number of declared variables at `level`
    pub fn get_var_count(&self, level: usize) -> Option<usize> {
        let func = self.engine.function(self.get_function(level)?)?;
        Some(func.script_data()?.variables.len())
    }

    /// Variable metadata: name, type, heap flag and frame offset
    pub fn get_var(
        &self,
        var_index: usize,
        level: usize,
    ) -> Option<(String, DataType, bool, i32)> {
        let func = self.engine.function(self.get_function(level)?)?;
        let var = func.script_data()?.variables.get(var_index)?;
        Some((var.name.clone(), var.ty, var.on_heap, var.stack_offset))
    }

    /// Human-readable declaration of a variable
    pub fn get_var_declaration(&self, var_index: usize, level: usize) -> Option<String> {
        let (name, ty, _, _) = self.get_var(var_index, level)?;
        let type_name = self.type_name(ty);
        if name.is_empty() {
            Some(type_name)
        } else {
            Some(format!("{} {}", type_name, name))
        }
    }

    fn type_name(&self, ty: DataType) -> String {
        let base = match ty.kind {
            TypeKind::Void => "void".to_string(),
            TypeKind::Bool => "bool".to_string(),
            TypeKind::Int8 => "int8".to_string(),
            TypeKind::Int16 => "int16".to_string(),
            TypeKind::Int32 => "int".to_string(),
            TypeKind::Int64 => "int64".to_string(),
            TypeKind::Uint8 => "uint8".to_string(),
            TypeKind::Uint16 => "uint16".to_string(),
            TypeKind::Uint32 => "uint".to_string(),
            TypeKind::Uint64 => "uint64".to_string(),
            TypeKind::Float => "float".to_string(),
            TypeKind::Double => "double".to_string(),
            TypeKind::Variant => "?".to_string(),
            TypeKind::Object(t) | TypeKind::Funcdef(t) => self
                .engine
                .type_info(t)
                .map(|i| i.name.clone())
                .unwrap_or_else(|| "<unknown>".to_string()),
            TypeKind::Handle(t) => {
                let name = self
                    .engine
                    .type_info(t)
                    .map(|i| i.name.clone())
                    .unwrap_or_else(|| "<unknown>".to_string());
                format!("{}@", name)
            }
        };
        if ty.is_reference() {
            format!("{}&", base)
        } else {
            base
        }
    }

    /// Address of a variable's value at `level`
    ///
    /// Heap-resident objects and reference parameters dereference the
    /// slot unless `dont_dereference` is set. Stack-constructed value
    /// objects that are not alive at the current position yield null
    /// unless `return_uninitialized` is set.
    pub fn get_address_of_var(
        &self,
        var_index: usize,
        level: usize,
        dont_dereference: bool,
        return_uninitialized: bool,
    ) -> VmPtr {
        if self.regs.program_pointer.is_none() {
            return VmPtr::null();
        }
        let Some((func, fp, _, _)) = self.frame_at_level(level) else {
            return VmPtr::null();
        };
        let Some(sd) = func.script_data() else {
            return VmPtr::null();
        };
        let Some(var) = sd.variables.get(var_index) else {
            return VmPtr::null();
        };

        let slot = fp.offset(-var.stack_offset);
        let is_value_object = matches!(var.ty.kind, TypeKind::Object(_)) && !var.ty.is_reference();

        if is_value_object || var.stack_offset <= 0 {
            let mut on_heap = var.on_heap;

            if is_value_object && !on_heap && !return_uninitialized {
                let live = self.determine_live_objects(level);
                if live.get(var_index).copied().unwrap_or(0) <= 0 {
                    return VmPtr::null();
                }
            }

            if !on_heap && var.stack_offset <= 0 && var.ty.is_reference() {
                on_heap = true;
            }

            if on_heap && !dont_dereference {
                return VmPtr::from_raw(self.stack.read64(slot));
            }
        }

        VmPtr::stack(slot)
    }

    /// Receiver type at `level`, for methods
    pub fn get_this_type_id(&self, level: usize) -> Option<TypeId> {
        let func = self.engine.function(self.get_function(level)?)?;
        func.object_type
    }

    /// Receiver object at `level`, for methods
    pub fn get_this_pointer(&self, level: usize) -> Option<ObjectHandle> {
        let (func, fp, _, _) = self.frame_at_level(level)?;
        func.object_type?;
        VmPtr::from_raw(self.stack.read64(fp)).as_object()
    }

    // ========================================================================
    // Serialization
    // ========================================================================

    /// Begin rebuilding a serialized execution; the host then pushes
    /// functions bottom-up and restores the per-frame registers
    pub fn start_deserialization(&mut self) -> CtxResult<()> {
        if matches!(
            self.status,
            ExecutionStatus::Active | ExecutionStatus::Suspended
        ) {
            return Err(ContextError::ContextActive);
        }
        self.unprepare()?;
        self.status = ExecutionStatus::Deserialization;
        Ok(())
    }

    /// Rebuild one call level during deserialization
    ///
    /// The first pushed function becomes the initial function; subsequent
    /// pushes stack frames on top, exactly as live calls would have.
    pub fn push_function(
        &mut self,
        func: FunctionId,
        receiver: Option<ObjectHandle>,
    ) -> CtxResult<()> {
        if self.status != ExecutionStatus::Deserialization {
            return Err(ContextError::ContextNotPrepared);
        }
        let mut func = self.engine.function(func).ok_or(ContextError::InvalidArg)?;

        // Delegates are unwrapped before this API; virtual and interface
        // methods resolve against the receiver
        if matches!(
            func.kind,
            FunctionKind::Virtual { .. } | FunctionKind::Interface { .. }
        ) {
            let ptr = receiver.map(|h| VmPtr::object(h, 0)).unwrap_or(VmPtr::null());
            func = self
                .resolve_real_function(&func, ptr)
                .map_err(|_| ContextError::InvalidArg)?;
        }

        if self.get_callstack_size() == 0 {
            self.status = ExecutionStatus::Uninitialized;
            self.prepare(func.id)?;
            if let Some(h) = receiver {
                let fp = self.regs.stack_frame_pointer;
                self.stack.write64(fp, VmPtr::object(h, 0).raw());
            }
            self.status = ExecutionStatus::Deserialization;
        } else {
            self.call_script_function(&func);
            if let Some(h) = receiver {
                let fp = self.regs.stack_frame_pointer;
                self.stack.write64(fp, VmPtr::object(h, 0).raw());
            }
        }
        Ok(())
    }

    /// Snapshot of the per-execution registers at `level`
    ///
    /// Level 0 reads the live state; higher levels must name a pushed
    /// state sentinel, else `NoFunction`.
    pub fn get_state_registers(&self, level: usize) -> CtxResult<StateSnapshot> {
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        if level == 0 {
            return Ok(StateSnapshot {
                calling_system_function: self.calling_system_function,
                initial_function: self.initial_function.as_ref().map(|f| f.id),
                original_stack_pointer: self.original_stack_pointer,
                arguments_size: self.arguments_size,
                value_register: self.regs.value_register,
                object_register: self.regs.object_register,
                object_type: self.regs.object_type,
            });
        }
        match self.call_stack.at_level(level) {
            Some(CallRecord::Nested(s)) => Ok(*s),
            Some(CallRecord::Frame(_)) => Err(ContextError::NoFunction),
            None => Err(ContextError::InvalidArg),
        }
    }

    /// Snapshot of the per-frame call registers at `level`
    ///
    /// Stack pointers come back in serialized (block, offset) form and
    /// the program pointer as a bytecode word offset.
    pub fn get_call_state_registers(&self, level: usize) -> CtxResult<CallStateRegisters> {
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        let (func, fp, pp, sp) = if level == 0 {
            let func = self
                .current_function
                .as_ref()
                .ok_or(ContextError::NoFunction)?;
            (
                func.id,
                self.regs.stack_frame_pointer,
                self.regs.program_pointer,
                self.regs.stack_pointer,
            )
        } else {
            match self.call_stack.at_level(level) {
                Some(CallRecord::Frame(f)) => {
                    (f.function, f.frame_pointer, f.program_pointer, f.stack_pointer)
                }
                Some(CallRecord::Nested(_)) => return Err(ContextError::NoFunction),
                None => return Err(ContextError::InvalidArg),
            }
        };
        let sfp = self.stack.serialize_ptr(fp).ok_or(ContextError::Error)?;
        let ssp = self.stack.serialize_ptr(sp).ok_or(ContextError::Error)?;
        Ok(CallStateRegisters {
            stack_frame_pointer: sfp,
            function: func,
            program_pointer: pp,
            stack_pointer: ssp,
            stack_index: sp.block,
        })
    }

    /// Restore per-execution registers during deserialization
    pub fn set_state_registers(&mut self, level: usize, state: StateSnapshot) -> CtxResult<()> {
        if self.status != ExecutionStatus::Deserialization {
            return Err(ContextError::ContextActive);
        }
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        if level == 0 {
            if !self.stack.contains(state.original_stack_pointer) {
                return Err(ContextError::InvalidArg);
            }
            self.calling_system_function = state.calling_system_function;
            self.initial_function = state
                .initial_function
                .and_then(|id| self.engine.function(id));
            self.original_stack_pointer = state.original_stack_pointer;
            self.arguments_size = state.arguments_size;
            self.regs.value_register = state.value_register;
            self.regs.object_register = state.object_register;
            self.regs.object_type = state.object_type;
            Ok(())
        } else {
            match self.call_stack.at_level(level) {
                Some(CallRecord::Nested(_)) => {}
                _ => return Err(ContextError::Error),
            }
            // Replace the sentinel in place
            let replaced = self
                .call_stack
                .replace_at_level(level, CallRecord::Nested(state));
            debug_assert!(replaced);
            Ok(())
        }
    }

    /// Restore per-frame call registers during deserialization
    pub fn set_call_state_registers(
        &mut self,
        level: usize,
        regs: CallStateRegisters,
    ) -> CtxResult<()> {
        if self.status != ExecutionStatus::Deserialization {
            return Err(ContextError::ContextActive);
        }
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        let fp = self
            .stack
            .deserialize_ptr(regs.stack_frame_pointer)
            .ok_or(ContextError::InvalidArg)?;
        let sp = self
            .stack
            .deserialize_ptr(regs.stack_pointer)
            .ok_or(ContextError::InvalidArg)?;

        if level == 0 {
            let current = self
                .current_function
                .as_ref()
                .ok_or(ContextError::NoFunction)?;
            let len = current
                .script_data()
                .map(|s| s.bytecode.len() as u32)
                .unwrap_or(0);
            let pp = regs.program_pointer.filter(|&p| p < len);
            self.regs.stack_frame_pointer = fp;
            self.regs.program_pointer = pp;
            self.regs.stack_pointer = sp;
            Ok(())
        } else {
            let (function, len) = match self.call_stack.at_level(level) {
                Some(CallRecord::Frame(f)) => {
                    let func = self
                        .engine
                        .function(f.function)
                        .ok_or(ContextError::NoFunction)?;
                    (
                        f.function,
                        func.script_data().map(|s| s.bytecode.len() as u32).unwrap_or(0),
                    )
                }
                _ => return Err(ContextError::Error),
            };
            let frame = CallFrame {
                frame_pointer: fp,
                function,
                program_pointer: regs.program_pointer.filter(|&p| p < len),
                stack_pointer: sp,
            };
            let replaced = self
                .call_stack
                .replace_at_level(level, CallRecord::Frame(frame));
            debug_assert!(replaced);
            Ok(())
        }
    }

    /// Mark deserialization complete; the context becomes Suspended and
    /// can resume with `execute`
    pub fn finish_deserialization(&mut self) -> CtxResult<()> {
        if self.status != ExecutionStatus::Deserialization {
            return Err(ContextError::ContextNotPrepared);
        }
        if self.current_function.is_none() {
            self.unprepare()?;
            return Err(ContextError::ContextNotPrepared);
        }
        self.status = ExecutionStatus::Suspended;
        Ok(())
    }

    // ========================================================================
    // User data
    // ========================================================================

    /// Attach opaque data under a type key, returning the previous value
    pub fn set_user_data(
        &mut self,
        data: Arc<dyn Any + Send + Sync>,
        type_key: u64,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.insert(type_key, data)
    }

    /// Fetch opaque data by type key
    pub fn get_user_data(&self, type_key: u64) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.get(&type_key).cloned()
    }

    // ========================================================================
    // Pointer dereferencing
    // ========================================================================

    /// Read a value through a VM pointer, for host-side inspection of
    /// variables and reference arguments
    pub fn deref_read(&self, ptr: VmPtr, bytes: u32) -> Option<u64> {
        self.read_through(ptr, bytes).ok()
    }

    /// Write a value through a VM pointer, for host-side writes to
    /// variables and out parameters
    pub fn deref_write(&mut self, ptr: VmPtr, bytes: u32, value: u64) -> bool {
        self.write_through(ptr, bytes, value).is_ok()
    }

    /// Read `bytes` (1, 2, 4 or 8) through a pointer; null raises
    pub(crate) fn read_through(
        &self,
        ptr: VmPtr,
        bytes: u32,
    ) -> Result<u64, ScriptException> {
        let v = match ptr.kind() {
            PtrKind::Null => return Err(ScriptException::NullPointerAccess),
            PtrKind::Stack(p) => {
                if bytes == 8 {
                    self.stack.read64(p)
                } else {
                    self.stack.read(p) as u64
                }
            }
            PtrKind::Global(g) => {
                if bytes == 8 {
                    self.engine.read_global64(g)
                } else {
                    self.engine.read_global(g) as u64
                }
            }
            PtrKind::Object { handle, offset } => {
                if bytes == 8 {
                    let lo = self
                        .engine
                        .read_object(handle, offset)
                        .ok_or(ScriptException::NullPointerAccess)?;
                    let hi = self
                        .engine
                        .read_object(handle, offset + 1)
                        .ok_or(ScriptException::NullPointerAccess)?;
                    (lo as u64) | ((hi as u64) << 32)
                } else {
                    self.engine
                        .read_object(handle, offset)
                        .ok_or(ScriptException::NullPointerAccess)? as u64
                }
            }
            PtrKind::Type(_) => return Err(ScriptException::NullPointerAccess),
        };
        Ok(match bytes {
            1 => v & 0xFF,
            2 => v & 0xFFFF,
            4 => v & 0xFFFF_FFFF,
            _ => v,
        })
    }

    /// Write `bytes` (1, 2, 4 or 8) through a pointer; null raises
    ///
    /// Byte and word writes touch only the low bits of the cell, exactly
    /// as a narrow store through a raw pointer would.
    pub(crate) fn write_through(
        &mut self,
        ptr: VmPtr,
        bytes: u32,
        value: u64,
    ) -> Result<(), ScriptException> {
        if bytes < 4 {
            let mask = if bytes == 1 { 0xFFu32 } else { 0xFFFFu32 };
            let old = self.read_through(ptr, 4)? as u32;
            let merged = (old & !mask) | (value as u32 & mask);
            return self.write_through(ptr, 4, merged as u64);
        }
        match ptr.kind() {
            PtrKind::Null => Err(ScriptException::NullPointerAccess),
            PtrKind::Stack(p) => {
                if bytes == 8 {
                    self.stack.write64(p, value);
                } else {
                    self.stack.write(p, value as u32);
                }
                Ok(())
            }
            PtrKind::Global(g) => {
                if bytes == 8 {
                    self.engine.write_global64(g, value);
                } else {
                    self.engine.write_global(g, value as u32);
                }
                Ok(())
            }
            PtrKind::Object { handle, offset } => {
                let ok = if bytes == 8 {
                    self.engine.write_object(handle, offset, value as u32)
                        && self
                            .engine
                            .write_object(handle, offset + 1, (value >> 32) as u32)
                } else {
                    self.engine.write_object(handle, offset, value as u32)
                };
                if ok {
                    Ok(())
                } else {
                    Err(ScriptException::NullPointerAccess)
                }
            }
            PtrKind::Type(_) => Err(ScriptException::NullPointerAccess),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.unprepare().is_err() {
            // An active context cannot release its frame; abandon the
            // owned memory rather than touch live state
            log::warn!("context {} dropped while active", self.id);
        }
    }
}

/// Serialized per-frame call registers
///
/// Stack pointers use the packed (block « 26 | offset) form; the program
/// pointer is a word offset into the function's bytecode.
#[derive(Debug, Clone, Copy)]
pub struct CallStateRegisters {
    pub stack_frame_pointer: u32,
    pub function: FunctionId,
    pub program_pointer: Option<u32>,
    pub stack_pointer: u32,
    pub stack_index: u32,
}
