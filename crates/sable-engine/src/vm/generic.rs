//! The generic calling-convention bridge
//!
//! Host functions receive a [`Generic`] over the call's argument area.
//! It exposes typed argument getters, the receiver, the address of each
//! argument (for reference parameters), and the return slots the
//! marshaller copies back into the context's registers after the call.
//!
//! Host code may also reach the context itself — to raise an exception,
//! to checkpoint it with `push_state` and run a nested script call, or
//! to inspect the call stack.

use super::context::Context;
use super::ptr::{ObjectHandle, StackPtr, VmPtr};
use sable_bytecode::{DataType, ScriptFunction, TypeKind};
use std::sync::Arc;

/// View over one system call's arguments and return slots
pub struct Generic<'a> {
    ctx: &'a mut Context,
    func: Arc<ScriptFunction>,
    args_base: StackPtr,
    receiver: Option<ObjectHandle>,
    ret_ptr: Option<VmPtr>,
    return_value: u64,
    object_return: Option<ObjectHandle>,
}

impl<'a> Generic<'a> {
    pub(crate) fn new(
        ctx: &'a mut Context,
        func: Arc<ScriptFunction>,
        args_base: StackPtr,
        receiver: Option<ObjectHandle>,
        ret_ptr: Option<VmPtr>,
    ) -> Self {
        Self {
            ctx,
            func,
            args_base,
            receiver,
            ret_ptr,
            return_value: 0,
            object_return: None,
        }
    }

    /// The function being called
    pub fn function(&self) -> &ScriptFunction {
        &self.func
    }

    /// Number of declared arguments
    pub fn arg_count(&self) -> usize {
        self.func.params.len()
    }

    /// The receiver, for method calls
    pub fn receiver(&self) -> Option<ObjectHandle> {
        self.receiver
    }

    /// The context driving this call
    ///
    /// Gives host code access to `set_exception`, `push_state` and the
    /// introspection surface.
    pub fn context(&mut self) -> &mut Context {
        self.ctx
    }

    fn arg_slot(&self, arg: usize) -> Option<(StackPtr, DataType)> {
        let param = self.func.params.get(arg)?;
        let offset: u32 = self.func.params[..arg]
            .iter()
            .map(|p| p.ty.stack_size())
            .sum();
        Some((self.args_base.offset(offset as i32), param.ty))
    }

    /// Argument as a byte
    pub fn arg_byte(&self, arg: usize) -> u8 {
        self.arg_slot(arg)
            .map(|(p, _)| self.ctx.stack.read(p) as u8)
            .unwrap_or(0)
    }

    /// Argument as a word
    pub fn arg_word(&self, arg: usize) -> u16 {
        self.arg_slot(arg)
            .map(|(p, _)| self.ctx.stack.read(p) as u16)
            .unwrap_or(0)
    }

    /// Argument as a dword
    pub fn arg_dword(&self, arg: usize) -> u32 {
        self.arg_slot(arg)
            .map(|(p, _)| self.ctx.stack.read(p))
            .unwrap_or(0)
    }

    /// Argument as a qword
    pub fn arg_qword(&self, arg: usize) -> u64 {
        self.arg_slot(arg)
            .map(|(p, _)| self.ctx.stack.read64(p))
            .unwrap_or(0)
    }

    /// Argument as a float
    pub fn arg_float(&self, arg: usize) -> f32 {
        f32::from_bits(self.arg_dword(arg))
    }

    /// Argument as a double
    pub fn arg_double(&self, arg: usize) -> f64 {
        f64::from_bits(self.arg_qword(arg))
    }

    /// Argument as an address (reference parameters)
    pub fn arg_address(&self, arg: usize) -> VmPtr {
        self.arg_slot(arg)
            .map(|(p, _)| VmPtr::from_raw(self.ctx.stack.read64(p)))
            .unwrap_or(VmPtr::null())
    }

    /// Argument as an object handle
    pub fn arg_object(&self, arg: usize) -> Option<ObjectHandle> {
        self.arg_slot(arg)
            .and_then(|(p, _)| VmPtr::from_raw(self.ctx.stack.read64(p)).as_object())
    }

    /// Address of the argument slot itself, for writing through out
    /// parameters
    pub fn address_of_arg(&self, arg: usize) -> VmPtr {
        self.arg_slot(arg)
            .map(|(p, _)| VmPtr::stack(p))
            .unwrap_or(VmPtr::null())
    }

    /// Declared type of an argument
    pub fn arg_type(&self, arg: usize) -> Option<DataType> {
        self.arg_slot(arg).map(|(_, t)| t)
    }

    /// Where a value returned on the stack must be constructed
    pub fn address_of_return_location(&self) -> VmPtr {
        self.ret_ptr.unwrap_or(VmPtr::null())
    }

    // ========================================================================
    // Return slots
    // ========================================================================

    /// Return a byte
    pub fn set_return_byte(&mut self, v: u8) {
        self.return_value = v as u64;
    }

    /// Return a word
    pub fn set_return_word(&mut self, v: u16) {
        self.return_value = v as u64;
    }

    /// Return a dword
    pub fn set_return_dword(&mut self, v: u32) {
        self.return_value = v as u64;
    }

    /// Return a qword
    pub fn set_return_qword(&mut self, v: u64) {
        self.return_value = v;
    }

    /// Return a float
    pub fn set_return_float(&mut self, v: f32) {
        self.return_value = v.to_bits() as u64;
    }

    /// Return a double
    pub fn set_return_double(&mut self, v: f64) {
        self.return_value = v.to_bits();
    }

    /// Return an address (reference-returning functions)
    pub fn set_return_address(&mut self, v: VmPtr) {
        self.return_value = v.raw();
    }

    /// Return an object handle; the handle gains a reference that the
    /// context releases when the value is consumed
    pub fn set_return_object(&mut self, h: Option<ObjectHandle>) {
        if let Some(h) = h {
            if matches!(
                self.func.return_type.kind,
                TypeKind::Handle(_) | TypeKind::Funcdef(_)
            ) {
                self.ctx.engine.add_ref(h);
            }
        }
        self.object_return = h;
    }

    pub(crate) fn take_return_value(&mut self) -> u64 {
        self.return_value
    }

    pub(crate) fn take_object_return(&mut self) -> Option<ObjectHandle> {
        self.object_return.take()
    }
}
