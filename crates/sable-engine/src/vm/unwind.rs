//! Exception unwinding and liveness reconstruction
//!
//! When an exception is raised the interpreter loop exits and the stack
//! is cleaned one frame at a time. Each frame releases exactly the
//! objects that are alive at the faulting program position: heap-resident
//! variables are released through their slots, stack-constructed value
//! objects are destroyed only when the liveness replay says they were
//! constructed. The replay walks the function's object-variable event log
//! (declare / init / destroy / block begin / block end) up to the current
//! position, counting simultaneous live occurrences per variable so that
//! slot reuse across scopes is disambiguated.
//!
//! A try/catch range covering the faulting position stops the unwinding:
//! the stack pointer is restored to the range's recorded depth and the
//! program pointer moves to the catch handler. Unwinding never crosses a
//! nested-execution sentinel; the exception surfaces to the host instead.

use super::context::{ArgOnStack, Context};
use super::ptr::VmPtr;
use super::registers::ExecutionStatus;
use super::{ContextError, CtxResult};
use sable_bytecode::{instr, DataType, LiveObjectEvent, ScriptFunction, TryCatchInfo, PTR_SIZE};
use std::sync::Arc;

impl Context {
    /// Whether any frame on the call stack has a try/catch range
    /// covering its current program position
    pub(crate) fn find_exception_try_catch(&self) -> bool {
        if let Some(func) = self.current_function.as_ref() {
            if let Some(pp) = self.regs.program_pointer {
                if func.find_try_catch(pp).is_some() {
                    return true;
                }
            }
        }

        let levels = self.get_callstack_size();
        for level in 1..levels {
            if let Some((func, _, Some(pp), _)) = self.frame_at_level(level) {
                if func.find_try_catch(pp).is_some() {
                    return true;
                }
            }
        }
        false
    }

    /// Unwind the stack after an exception (or while discarding an
    /// unfinished execution)
    ///
    /// With `catch_exception` set, a covering try/catch range stops the
    /// unwinding and resumes execution at the catch handler.
    pub(crate) fn clean_stack(&mut self, catch_exception: bool) {
        self.in_exception_handler = true;

        let mut caught = self.clean_stack_frame(catch_exception);
        if !caught {
            // Keep exception status during the walk so the per-frame
            // liveness replay treats positions as faulting
            self.status = ExecutionStatus::Exception;

            while !caught && !self.call_stack.is_empty() {
                // Never unwind across a nested-execution boundary
                if self
                    .call_stack
                    .top()
                    .map(|r| r.is_nested_marker())
                    .unwrap_or(false)
                {
                    break;
                }

                self.pop_call_state();
                caught = self.clean_stack_frame(catch_exception);
            }
        }

        if caught {
            self.status = ExecutionStatus::Active;
        }
        self.in_exception_handler = false;
    }

    /// Clean the current frame; true when a try/catch caught the
    /// exception and execution can resume
    fn clean_stack_frame(&mut self, catch_exception: bool) -> bool {
        let Some(func) = self.current_function.clone() else {
            return false;
        };

        let mut caught: Option<TryCatchInfo> = None;

        if !self.is_stack_memory_not_allocated && self.regs.program_pointer.is_some() {
            // Arguments half-pushed for a call that never happened must
            // be destroyed first
            self.clean_args_on_stack();

            let Some(sd) = func.script_data() else {
                return false;
            };

            if catch_exception {
                let pos = self.regs.program_pointer.unwrap_or(0);
                caught = func.find_try_catch(pos);
            }

            // Uncover the frame unless a catch handler keeps it
            if caught.is_none() {
                self.regs.stack_pointer = self
                    .regs
                    .stack_pointer
                    .offset(sd.variable_space as i32);
            }

            let live = self.determine_live_objects(0);
            let fp = self.regs.stack_frame_pointer;

            for (n, var) in sd.variables.iter().enumerate() {
                if let Some(tc) = caught.as_ref() {
                    // Variables declared before the try block survive;
                    // several variables can share a slot, so scan the
                    // whole event log for this slot's declaration
                    let mut skip_clean = 0i32;
                    for info in &sd.object_variable_info {
                        if info.var_offset == var.stack_offset
                            && info.event == LiveObjectEvent::Declared
                        {
                            if info.program_pos < tc.try_pos {
                                if skip_clean >= 0 {
                                    skip_clean = 1;
                                }
                                break;
                            } else if info.program_pos < tc.catch_pos {
                                skip_clean = -1;
                                break;
                            }
                        }
                    }
                    if skip_clean > 0 {
                        continue;
                    }
                }

                let slot = fp.offset(-var.stack_offset);
                if var.on_heap {
                    let raw = self.stack.read64(slot);
                    if raw != 0 {
                        // References borrowed from elsewhere are not
                        // owned by this frame
                        if var.ty.object_type().is_some() && !var.ty.is_reference() {
                            if let Some(h) = VmPtr::from_raw(raw).as_object() {
                                self.release_unless_nocount(var.ty, h);
                            }
                        }
                        self.stack.write64(slot, 0);
                    }
                } else if live.get(n).copied().unwrap_or(0) > 0 {
                    // A value object constructed in place on the stack
                    if let Some(ty) = var.ty.object_type() {
                        let size = self
                            .engine
                            .type_info(ty)
                            .map(|t| t.size)
                            .unwrap_or(0);
                        if size > 0 && self.stack.contains(slot) {
                            let mut cells = self.stack.cells(slot, size).to_vec();
                            self.engine.destruct_in_place(ty, &mut cells);
                            self.stack.cells_mut(slot, size).copy_from_slice(&cells);
                        }
                    }
                }
            }
        } else {
            self.is_stack_memory_not_allocated = false;
        }

        if let Some(tc) = caught {
            let sd = func.script_data().map(|s| s.variable_space).unwrap_or(0);
            self.regs.stack_pointer = self
                .regs
                .stack_frame_pointer
                .offset(-((tc.stack_size + sd) as i32));
            self.regs.program_pointer = Some(tc.catch_pos);
            return true;
        }

        // Frames that do not own their receiver and parameters skip the
        // final cleanup
        if func
            .script_data()
            .map(|s| s.dont_cleanup_on_exception)
            .unwrap_or(false)
        {
            return false;
        }

        let fp = self.regs.stack_frame_pointer;
        let mut offset = 0i32;
        if func.has_receiver() {
            let raw = self.stack.read64(fp);
            if raw != 0 {
                if let Some(h) = VmPtr::from_raw(raw).as_object() {
                    let counted = func
                        .object_type
                        .and_then(|t| self.engine.type_info(t))
                        .map(|t| t.is_reference && !t.is_nocount)
                        .unwrap_or(false);
                    if counted {
                        self.engine.release(h);
                    }
                }
                self.stack.write64(fp, 0);
            }
            offset += PTR_SIZE as i32;
        }
        if func.returns_on_stack() {
            offset += PTR_SIZE as i32;
        }
        for p in &func.params {
            if p.ty.is_object() && !p.ty.is_reference() {
                let slot = fp.offset(offset);
                let raw = self.stack.read64(slot);
                if raw != 0 {
                    if let Some(h) = VmPtr::from_raw(raw).as_object() {
                        self.release_unless_nocount(p.ty, h);
                    }
                    self.stack.write64(slot, 0);
                }
            }
            offset += p.ty.stack_size() as i32;
        }

        false
    }

    fn release_unless_nocount(&self, ty: DataType, h: super::ptr::ObjectHandle) {
        let nocount = ty
            .object_type()
            .and_then(|t| self.engine.type_info(t))
            .map(|t| t.is_reference && t.is_nocount)
            .unwrap_or(false);
        if !nocount {
            self.engine.release(h);
        }
    }

    /// Destroy arguments pushed for a call that raised before it happened
    ///
    /// Scans the bytecode for the call instruction the arguments were
    /// meant for, then releases each pushed argument according to the
    /// callee's parameter types and restores the stack pointer.
    pub(crate) fn clean_args_on_stack(&mut self) {
        if !self.need_to_cleanup_args {
            return;
        }
        self.need_to_cleanup_args = false;

        let Some(func) = self.current_function.clone() else {
            return;
        };
        let Some(sd) = func.script_data() else {
            return;
        };

        // Find the instruction just before the current program pointer
        let pp = self.regs.program_pointer.unwrap_or(0) as usize;
        let code = &sd.bytecode;
        let mut at = 0usize;
        let mut prev: Option<usize> = None;
        while at < pp {
            prev = Some(at);
            let Some(op) = instr::opcode(code[at]) else {
                return;
            };
            at += op.size_words() as usize;
        }
        let Some(prev) = prev else {
            return;
        };

        let Some(op) = instr::opcode(code[prev]) else {
            return;
        };
        debug_assert!(op.is_call());

        let callee = match op {
            sable_bytecode::Opcode::CallPtr => {
                self.pending_call_signature(&func, instr::sw0(code[prev]))
            }
            _ => self
                .engine
                .function(sable_bytecode::FunctionId(code[prev + 1])),
        };
        let Some(callee) = callee else {
            debug_assert!(false, "pending call with no resolvable callee");
            return;
        };

        let sp = self.regs.stack_pointer;
        let mut offset = 0i32;
        if callee.has_receiver() {
            offset += PTR_SIZE as i32;
        }
        if callee.returns_on_stack() {
            offset += PTR_SIZE as i32;
        }
        for p in &callee.params {
            if p.ty.is_object() && !p.ty.is_reference() {
                let slot = sp.offset(offset);
                let raw = self.stack.read64(slot);
                if raw != 0 {
                    if let Some(h) = VmPtr::from_raw(raw).as_object() {
                        self.release_unless_nocount(p.ty, h);
                    }
                    self.stack.write64(slot, 0);
                }
            }
            offset += p.ty.stack_size() as i32;
        }

        self.regs.stack_pointer = sp.offset(offset);
    }

    /// Signature of the function a `CallPtr` through `var_offset` would
    /// have invoked
    ///
    /// The declared funcdef type of the variable or parameter names the
    /// signature; the function object still held in the slot is the
    /// fallback.
    fn pending_call_signature(
        &self,
        func: &Arc<ScriptFunction>,
        var_offset: i32,
    ) -> Option<Arc<ScriptFunction>> {
        self.funcdef_signature_of_var(func, var_offset).or_else(|| {
            let raw = self
                .stack
                .read64(self.regs.stack_frame_pointer.offset(-var_offset));
            let (target, _) = VmPtr::from_raw(raw)
                .as_object()
                .and_then(|h| self.engine.function_object(h))?;
            self.engine.function(target)
        })
    }

    // ========================================================================
    // Liveness reconstruction
    // ========================================================================

    /// Per-variable count of simultaneous live occurrences at the
    /// current position of `level`
    ///
    /// Replays the object-variable event log from the start each time;
    /// the log records events on the instruction after the one that
    /// created or destroyed the object, so the current position counts as
    /// executed. The faulting instruction itself (and, for calling
    /// frames, the call in progress) is not considered executed.
    pub(crate) fn determine_live_objects(&self, level: usize) -> Vec<i32> {
        let Some((func, _, pp, _)) = self.frame_at_level(level) else {
            return Vec::new();
        };
        let Some(sd) = func.script_data() else {
            return Vec::new();
        };

        let mut pos = pp.unwrap_or(0) as i64;
        if level == 0 {
            if self.status == ExecutionStatus::Exception {
                // The last instruction failed; back off so it does not
                // count as executed
                pos -= 1;
            }
        } else {
            // The call made by this frame is still executing; a value
            // object it returns is not alive yet
            pos -= 1;
        }

        let mut live = vec![0i32; sd.variables.len()];
        let infos = &sd.object_variable_info;

        let Some(first_after) = infos
            .iter()
            .position(|i| i.program_pos as i64 > pos)
        else {
            return live;
        };

        let mut n = first_after as i64 - 1;
        while n >= 0 {
            let info = &infos[n as usize];
            match info.event {
                LiveObjectEvent::Uninitialized => {
                    if let Some(v) = self.var_for_offset(&func, level, info.var_offset) {
                        live[v] -= 1;
                    } else {
                        debug_assert!(false, "destroy event for unknown slot");
                    }
                }
                LiveObjectEvent::Initialized => {
                    if let Some(v) = self.var_for_offset(&func, level, info.var_offset) {
                        live[v] += 1;
                    }
                }
                LiveObjectEvent::BlockBegin => {
                    // The program was inside this block when it stopped
                }
                LiveObjectEvent::BlockEnd => {
                    // A block that both began and ended is out of scope;
                    // skip everything inside it
                    let mut nested = 1;
                    while nested > 0 && n > 0 {
                        n -= 1;
                        match infos[n as usize].event {
                            LiveObjectEvent::BlockEnd => nested += 1,
                            LiveObjectEvent::BlockBegin => nested -= 1,
                            _ => {}
                        }
                    }
                }
                LiveObjectEvent::Declared => {}
            }
            n -= 1;
        }

        live
    }

    /// Which variable currently occupies `offset`; several variables may
    /// share a slot across scopes, so scoping decides
    fn var_for_offset(
        &self,
        func: &Arc<ScriptFunction>,
        level: usize,
        offset: i32,
    ) -> Option<usize> {
        let sd = func.script_data()?;
        sd.variables
            .iter()
            .enumerate()
            .position(|(v, var)| var.stack_offset == offset && self.is_var_in_scope(v, level))
    }

    /// Whether the variable is visible at the current position of `level`
    pub fn is_var_in_scope(&self, var_index: usize, level: usize) -> bool {
        if self.regs.program_pointer.is_none() {
            return false;
        }
        let Some((func, _, pp, _)) = self.frame_at_level(level) else {
            return false;
        };
        let Some(sd) = func.script_data() else {
            return false;
        };
        let Some(var) = sd.variables.get(var_index) else {
            return false;
        };

        let pos = pp.unwrap_or(0);
        let declared_at = var.declared_at;
        if declared_at > pos {
            return false;
        }

        // Unnamed temporaries are reserved slots live throughout the call
        let mut found_decl = var.name.is_empty();

        let infos = &sd.object_variable_info;
        let mut n = 0usize;
        while n < infos.len() {
            if infos[n].program_pos >= declared_at {
                // Events at the declaration position but before the
                // declaration itself belong to the previous occupant
                if infos[n].program_pos == declared_at
                    && !found_decl
                    && infos[n].event != LiveObjectEvent::Declared
                {
                    n += 1;
                    continue;
                }
                found_decl = true;

                // If the declaring block ends before the current
                // position, the variable is out of scope
                let mut depth = 0i32;
                while n < infos.len() {
                    if infos[n].program_pos > pos {
                        break;
                    }
                    match infos[n].event {
                        LiveObjectEvent::BlockBegin => depth += 1,
                        LiveObjectEvent::BlockEnd => {
                            depth -= 1;
                            if depth < 0 {
                                return false;
                            }
                        }
                        _ => {}
                    }
                    n += 1;
                }
                break;
            }
            n += 1;
        }

        true
    }

    // ========================================================================
    // Args-on-stack inspection
    // ========================================================================

    /// Number of argument values pushed but not yet consumed by a call
    /// at `level`
    ///
    /// Equals the argument count the next call instruction will consume
    /// for the frame's current program position. The decoded types are
    /// cached for [`Context::get_arg_on_stack`].
    pub fn get_args_on_stack_count(&mut self, level: usize) -> CtxResult<usize> {
        self.args_cache.clear();
        self.args_cache_func = None;
        self.args_cache_pos = 0;

        if self.regs.program_pointer.is_none() {
            return Err(ContextError::Error);
        }
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        let Some((func, sf, pp, sp)) = self.frame_at_level(level) else {
            return Err(ContextError::NoFunction);
        };
        let Some(sd) = func.script_data() else {
            return Err(ContextError::NoFunction);
        };

        // Anything on the stack beyond the local variable space is
        // pushed arguments
        let mut stack_pos =
            (sf.cell as i64 - sp.cell as i64 - sd.variable_space as i64) as i64;

        // A call already in progress at a deeper level owns part of it
        if let Some(called) = self.called_function_below(level) {
            stack_pos -= called.arguments_size() as i64;
        }

        if stack_pos <= 0 {
            return Ok(0);
        }

        self.args_cache_func = Some(func.id);
        self.args_cache_pos = pp.unwrap_or(0);

        // Attribute the pushed cells to the calls that will consume
        // them, innermost first; arguments are pushed last-to-first, so
        // the covered parameters are a suffix of each callee's list
        let mut prog_pos = pp.unwrap_or(0);
        while stack_pos > 0 {
            let Some((callee, call_pos)) = self.find_next_called_function(&func, prog_pos)
            else {
                break;
            };

            let sizes: Vec<u32> = callee.params.iter().map(|p| p.ty.stack_size()).collect();
            let mut start = sizes.len();
            let mut acc = 0i64;
            while start > 0 && acc < stack_pos {
                start -= 1;
                acc += sizes[start] as i64;
            }
            for p in &callee.params[start..] {
                self.args_cache.push(ArgOnStack { ty: p.ty });
            }
            stack_pos -= acc;

            let Some(op) = sd
                .bytecode
                .get(call_pos as usize)
                .and_then(|w| instr::opcode(*w))
            else {
                break;
            };
            prog_pos = call_pos + op.size_words();
        }

        Ok(self.args_cache.len())
    }

    /// Type and address of one argument pushed on the stack at `level`
    ///
    /// `arg` counts in declaration order, first parameter first.
    pub fn get_arg_on_stack(&mut self, level: usize, arg: usize) -> CtxResult<(DataType, VmPtr)> {
        if self.regs.program_pointer.is_none() {
            return Err(ContextError::Error);
        }
        if level >= self.get_callstack_size() {
            return Err(ContextError::InvalidArg);
        }
        let Some((func, _, pp, mut sp)) = self.frame_at_level(level) else {
            return Err(ContextError::NoFunction);
        };

        if let Some(called) = self.called_function_below(level) {
            sp = sp.offset(called.arguments_size() as i32);
        }

        // Refresh the cache when it was built for another position
        if self.args_cache_func != Some(func.id) || self.args_cache_pos != pp.unwrap_or(0) {
            self.get_args_on_stack_count(level)?;
        }

        if arg >= self.args_cache.len() {
            return Err(ContextError::InvalidArg);
        }

        // The cache is ordered from the stack top; the public index
        // counts from the bottom
        let internal = self.args_cache.len() - arg - 1;
        let delta: u32 = self.args_cache[..internal]
            .iter()
            .map(|a| a.ty.stack_size())
            .sum();
        let entry = self.args_cache[internal];
        Ok((entry.ty, VmPtr::stack(sp.offset(delta as i32))))
    }

    /// The function already being called by the frame one level deeper
    fn called_function_below(&self, level: usize) -> Option<Arc<ScriptFunction>> {
        if level == 0 {
            return None;
        }
        if level == 1 {
            return self.current_function.clone();
        }
        let (func, _, _, _) = self.frame_at_level(level - 1)?;
        Some(func)
    }
}

// ============================================================================
// Tests
// ============================================================================
