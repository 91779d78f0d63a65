//! The interpreter loop and call transitions
//!
//! [`Context::run_interpreter`] decodes and executes instructions until
//! the status leaves Active: a return from the bottom frame, a suspend
//! request, an abort, or an exception. The hot registers (program
//! pointer, stack pointer, frame pointer) live in locals and are written
//! back to the context before anything that can observe them — host
//! calls, callbacks, exception raises — and reloaded afterwards.
//!
//! Between instructions the loop asserts, in debug builds, that each
//! handler advanced the program pointer by exactly the opcode's encoded
//! size; instructions that modify control flow themselves are exempt.

use super::context::Context;
use super::generic::Generic;
use super::pow;
use super::ptr::{ObjectHandle, StackPtr, VmPtr};
use super::registers::ExecutionStatus;
use super::stack::RESERVE_MARGIN;
use super::ScriptException;
use sable_bytecode::{
    instr, FunctionId, FunctionKind, Opcode, ScriptFunction, TypeKind, PTR_SIZE,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Stack cell of the variable at frame-relative offset `slot`
#[inline]
fn vp(fp: StackPtr, slot: i32) -> StackPtr {
    fp.offset(-slot)
}

impl Context {
    /// Flush the hot registers and raise a script exception at `pc`
    fn raise(&mut self, pc: usize, sp: StackPtr, fp: StackPtr, exc: ScriptException) {
        self.regs.program_pointer = Some(pc as u32);
        self.regs.stack_pointer = sp;
        self.regs.stack_frame_pointer = fp;
        self.set_internal_exception(exc, true);
    }

    /// Execute instructions until the status leaves Active
    pub(crate) fn run_interpreter(&mut self) {
        'function: loop {
            let Some(func) = self.current_function.clone() else {
                self.set_internal_exception(ScriptException::UnrecognizedByteCode, false);
                return;
            };
            let Some(sd) = func.script_data() else {
                self.set_internal_exception(ScriptException::UnrecognizedByteCode, false);
                return;
            };
            let code: &[u32] = &sd.bytecode;

            let Some(pp) = self.regs.program_pointer else {
                self.set_internal_exception(ScriptException::UnrecognizedByteCode, false);
                return;
            };
            let mut pc = pp as usize;
            let mut sp = self.regs.stack_pointer;
            let mut fp = self.regs.stack_frame_pointer;

            loop {
                let Some(&w0) = code.get(pc) else {
                    self.raise(pc, sp, fp, ScriptException::UnrecognizedByteCode);
                    return;
                };
                let Some(op) = instr::opcode(w0) else {
                    self.raise(pc, sp, fp, ScriptException::UnrecognizedByteCode);
                    return;
                };
                #[cfg(debug_assertions)]
                let pc_before = pc;

                let sw0 = instr::sw0(w0);

                match op {
                    // ===== Stack moves & constants =====
                    Opcode::PopPtr => {
                        sp = sp.offset(PTR_SIZE as i32);
                        pc += 1;
                    }
                    Opcode::PushNull => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, 0);
                        pc += 1;
                    }
                    Opcode::PushC32 => {
                        sp = sp.offset(-1);
                        self.stack.write(sp, code[pc + 1]);
                        pc += 2;
                    }
                    Opcode::PushC64 => {
                        sp = sp.offset(-2);
                        self.stack.write64(sp, instr::qword(code[pc + 1], code[pc + 2]));
                        pc += 3;
                    }
                    Opcode::PushV32 => {
                        sp = sp.offset(-1);
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(sp, v);
                        pc += 1;
                    }
                    Opcode::PushV64 | Opcode::PushVPtr => {
                        sp = sp.offset(-2);
                        let v = self.stack.read64(vp(fp, sw0));
                        self.stack.write64(sp, v);
                        pc += 1;
                    }
                    Opcode::PushRPtr => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, self.regs.value_register);
                        pc += 1;
                    }
                    Opcode::PopRPtr => {
                        self.regs.value_register = self.stack.read64(sp);
                        sp = sp.offset(PTR_SIZE as i32);
                        pc += 1;
                    }
                    Opcode::PushG32 => {
                        sp = sp.offset(-1);
                        let v = self.engine.read_global(code[pc + 1]);
                        self.stack.write(sp, v);
                        pc += 2;
                    }
                    Opcode::PushGPtr | Opcode::PushGlobalAddr => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack
                            .write64(sp, VmPtr::global(code[pc + 1]).raw());
                        pc += 2;
                    }
                    Opcode::PushFrame => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, VmPtr::stack(vp(fp, sw0)).raw());
                        pc += 1;
                    }
                    Opcode::VarIdx => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, sw0 as i64 as u64);
                        pc += 1;
                    }
                    Opcode::FuncPtr => {
                        let h = self
                            .engine
                            .function_pointer_object(FunctionId(code[pc + 1]));
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, VmPtr::object(h, 0).raw());
                        pc += 2;
                    }
                    Opcode::ObjTypePush => {
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(
                            sp,
                            VmPtr::type_info(sable_bytecode::TypeId(code[pc + 1])).raw(),
                        );
                        pc += 2;
                    }
                    Opcode::TypeIdPush => {
                        sp = sp.offset(-1);
                        self.stack.write(sp, code[pc + 1]);
                        pc += 2;
                    }
                    Opcode::SwapPtr => {
                        let a = self.stack.read64(sp);
                        let b = self.stack.read64(sp.offset(PTR_SIZE as i32));
                        self.stack.write64(sp, b);
                        self.stack.write64(sp.offset(PTR_SIZE as i32), a);
                        pc += 1;
                    }
                    Opcode::RdsPtr => {
                        let p = VmPtr::from_raw(self.stack.read64(sp));
                        match self.read_through(p, 8) {
                            Ok(v) => self.stack.write64(sp, v),
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::ClrHi => {
                        let vr = self.regs.value_register;
                        self.regs.value_register =
                            (vr & 0xFFFF_FFFF_0000_0000) | (vr & 0xFF);
                        pc += 1;
                    }
                    Opcode::Str => {
                        debug_assert!(false, "deprecated Str instruction executed");
                        pc += 2;
                    }

                    // ===== Register / variable moves =====
                    Opcode::SetV1 => {
                        self.stack.write(vp(fp, sw0), code[pc + 1] & 0xFF);
                        pc += 2;
                    }
                    Opcode::SetV2 => {
                        self.stack.write(vp(fp, sw0), code[pc + 1] & 0xFFFF);
                        pc += 2;
                    }
                    Opcode::SetV32 => {
                        self.stack.write(vp(fp, sw0), code[pc + 1]);
                        pc += 2;
                    }
                    Opcode::SetV64 => {
                        self.stack
                            .write64(vp(fp, sw0), instr::qword(code[pc + 1], code[pc + 2]));
                        pc += 3;
                    }
                    Opcode::SetG32 => {
                        self.engine.write_global(code[pc + 1], code[pc + 2]);
                        pc += 3;
                    }
                    Opcode::ClrVPtr => {
                        self.stack.write64(vp(fp, sw0), 0);
                        pc += 1;
                    }
                    Opcode::CpyVtoV32 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read(vp(fp, s));
                        self.stack.write(vp(fp, sw0), v);
                        pc += 2;
                    }
                    Opcode::CpyVtoV64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s));
                        self.stack.write64(vp(fp, sw0), v);
                        pc += 2;
                    }
                    Opcode::CpyVtoR32 => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.regs.value_register =
                            (self.regs.value_register & 0xFFFF_FFFF_0000_0000) | v as u64;
                        pc += 1;
                    }
                    Opcode::CpyVtoR64 => {
                        self.regs.value_register = self.stack.read64(vp(fp, sw0));
                        pc += 1;
                    }
                    Opcode::CpyRtoV32 => {
                        self.stack
                            .write(vp(fp, sw0), self.regs.value_register as u32);
                        pc += 1;
                    }
                    Opcode::CpyRtoV64 => {
                        self.stack.write64(vp(fp, sw0), self.regs.value_register);
                        pc += 1;
                    }
                    Opcode::CpyVtoG32 => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.engine.write_global(code[pc + 1], v);
                        pc += 2;
                    }
                    Opcode::CpyGtoV32 => {
                        let v = self.engine.read_global(code[pc + 1]);
                        self.stack.write(vp(fp, sw0), v);
                        pc += 2;
                    }
                    Opcode::LdGRdR32 => {
                        let g = code[pc + 1];
                        self.regs.value_register = VmPtr::global(g).raw();
                        let v = self.engine.read_global(g);
                        self.stack.write(vp(fp, sw0), v);
                        pc += 2;
                    }
                    Opcode::Ldg => {
                        self.regs.value_register = VmPtr::global(code[pc + 1]).raw();
                        pc += 2;
                    }
                    Opcode::Ldv => {
                        self.regs.value_register = VmPtr::stack(vp(fp, sw0)).raw();
                        pc += 1;
                    }
                    Opcode::LoadThisR => {
                        let this = VmPtr::from_raw(self.stack.read64(fp));
                        if this.is_null() {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        self.regs.value_register = this.add_cells(sw0 as u32).raw();
                        pc += 1;
                    }
                    Opcode::LoadRObjR => {
                        let obj = VmPtr::from_raw(self.regs.value_register);
                        if obj.is_null() {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        self.regs.value_register = obj.add_cells(sw0 as u32).raw();
                        pc += 1;
                    }
                    Opcode::LoadVObjR => {
                        let off = instr::sw1(code[pc + 1]);
                        let obj = VmPtr::from_raw(self.stack.read64(vp(fp, sw0)));
                        if obj.is_null() {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        self.regs.value_register = obj.add_cells(off as u32).raw();
                        pc += 1;
                    }
                    Opcode::WrtV1 | Opcode::WrtV2 | Opcode::WrtV4 | Opcode::WrtV8 => {
                        let bytes = match op {
                            Opcode::WrtV1 => 1,
                            Opcode::WrtV2 => 2,
                            Opcode::WrtV4 => 4,
                            _ => 8,
                        };
                        let value = if bytes == 8 {
                            self.stack.read64(vp(fp, sw0))
                        } else {
                            self.stack.read(vp(fp, sw0)) as u64
                        };
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        if let Err(e) = self.write_through(ptr, bytes, value) {
                            self.raise(pc, sp, fp, e);
                            return;
                        }
                        pc += 1;
                    }
                    Opcode::RdR1 | Opcode::RdR2 | Opcode::RdR4 | Opcode::RdR8 => {
                        let bytes = match op {
                            Opcode::RdR1 => 1,
                            Opcode::RdR2 => 2,
                            Opcode::RdR4 => 4,
                            _ => 8,
                        };
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        match self.read_through(ptr, bytes) {
                            Ok(v) => {
                                if bytes == 8 {
                                    self.stack.write64(vp(fp, sw0), v);
                                } else {
                                    self.stack.write(vp(fp, sw0), v as u32);
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }

                    // ===== Logical tests =====
                    Opcode::Not => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), (v == 0) as u32);
                        pc += 1;
                    }
                    Opcode::Tz | Opcode::Tnz | Opcode::Ts | Opcode::Tns | Opcode::Tp
                    | Opcode::Tnp => {
                        let v = self.regs.value_register as i32;
                        let r = match op {
                            Opcode::Tz => v == 0,
                            Opcode::Tnz => v != 0,
                            Opcode::Ts => v < 0,
                            Opcode::Tns => v >= 0,
                            Opcode::Tp => v > 0,
                            _ => v <= 0,
                        };
                        self.regs.value_register = r as u64;
                        pc += 1;
                    }

                    // ===== Branches =====
                    Opcode::Jmp => {
                        pc = (pc as i64 + 2 + code[pc + 1] as i32 as i64) as usize;
                    }
                    Opcode::Jz | Opcode::Jnz | Opcode::Js | Opcode::Jns | Opcode::Jp
                    | Opcode::Jnp => {
                        let v = self.regs.value_register as i32;
                        let taken = match op {
                            Opcode::Jz => v == 0,
                            Opcode::Jnz => v != 0,
                            Opcode::Js => v < 0,
                            Opcode::Jns => v >= 0,
                            Opcode::Jp => v > 0,
                            _ => v <= 0,
                        };
                        if taken {
                            pc = (pc as i64 + 2 + code[pc + 1] as i32 as i64) as usize;
                        } else {
                            pc += 2;
                        }
                    }
                    Opcode::JLowZ | Opcode::JLowNz => {
                        let b = self.regs.value_register as u8;
                        let taken = if op == Opcode::JLowZ { b == 0 } else { b != 0 };
                        if taken {
                            pc = (pc as i64 + 2 + code[pc + 1] as i32 as i64) as usize;
                        } else {
                            pc += 2;
                        }
                    }
                    Opcode::JmpP => {
                        // Indexed jump into a table of Jmp instructions
                        let index = self.stack.read(vp(fp, sw0)) as i32;
                        pc = (pc as i64
                            + 1
                            + index as i64 * Opcode::Jmp.size_words() as i64)
                            as usize;
                    }

                    // ===== Three-way compares =====
                    Opcode::CmpI => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = self.stack.read(vp(fp, sw0)) as i32;
                        let y = self.stack.read(vp(fp, b)) as i32;
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpU => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = self.stack.read(vp(fp, sw0));
                        let y = self.stack.read(vp(fp, b));
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpF => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = f32::from_bits(self.stack.read(vp(fp, sw0)));
                        let y = f32::from_bits(self.stack.read(vp(fp, b)));
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpD => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = f64::from_bits(self.stack.read64(vp(fp, sw0)));
                        let y = f64::from_bits(self.stack.read64(vp(fp, b)));
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpI64 => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = self.stack.read64(vp(fp, sw0)) as i64;
                        let y = self.stack.read64(vp(fp, b)) as i64;
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpU64 => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = self.stack.read64(vp(fp, sw0));
                        let y = self.stack.read64(vp(fp, b));
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpPtr => {
                        let b = instr::sw1(code[pc + 1]);
                        let x = self.stack.read64(vp(fp, sw0));
                        let y = self.stack.read64(vp(fp, b));
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpIi => {
                        let x = self.stack.read(vp(fp, sw0)) as i32;
                        let y = code[pc + 1] as i32;
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpIu => {
                        let x = self.stack.read(vp(fp, sw0));
                        let y = code[pc + 1];
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }
                    Opcode::CmpIf => {
                        let x = f32::from_bits(self.stack.read(vp(fp, sw0)));
                        let y = f32::from_bits(code[pc + 1]);
                        self.regs.value_register =
                            (if x == y { 0i32 } else if x < y { -1 } else { 1 }) as u32 as u64;
                        pc += 2;
                    }

                    // ===== Increment / decrement through the value register =====
                    Opcode::IncI8 | Opcode::DecI8 => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: i8 = if op == Opcode::IncI8 { 1 } else { -1 };
                        match self.read_through(ptr, 1) {
                            Ok(v) => {
                                let nv = (v as u8).wrapping_add(delta as u8);
                                if let Err(e) = self.write_through(ptr, 1, nv as u64) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncI16 | Opcode::DecI16 => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: i16 = if op == Opcode::IncI16 { 1 } else { -1 };
                        match self.read_through(ptr, 2) {
                            Ok(v) => {
                                let nv = (v as u16).wrapping_add(delta as u16);
                                if let Err(e) = self.write_through(ptr, 2, nv as u64) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncI32 | Opcode::DecI32 => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: i32 = if op == Opcode::IncI32 { 1 } else { -1 };
                        match self.read_through(ptr, 4) {
                            Ok(v) => {
                                let nv = (v as u32).wrapping_add(delta as u32);
                                if let Err(e) = self.write_through(ptr, 4, nv as u64) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncI64 | Opcode::DecI64 => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: i64 = if op == Opcode::IncI64 { 1 } else { -1 };
                        match self.read_through(ptr, 8) {
                            Ok(v) => {
                                let nv = v.wrapping_add(delta as u64);
                                if let Err(e) = self.write_through(ptr, 8, nv) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncF | Opcode::DecF => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: f32 = if op == Opcode::IncF { 1.0 } else { -1.0 };
                        match self.read_through(ptr, 4) {
                            Ok(v) => {
                                let nv = f32::from_bits(v as u32) + delta;
                                if let Err(e) =
                                    self.write_through(ptr, 4, nv.to_bits() as u64)
                                {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncD | Opcode::DecD => {
                        let ptr = VmPtr::from_raw(self.regs.value_register);
                        let delta: f64 = if op == Opcode::IncD { 1.0 } else { -1.0 };
                        match self.read_through(ptr, 8) {
                            Ok(v) => {
                                let nv = f64::from_bits(v) + delta;
                                if let Err(e) = self.write_through(ptr, 8, nv.to_bits()) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::IncVi => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), v.wrapping_add(1));
                        pc += 1;
                    }
                    Opcode::DecVi => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), v.wrapping_sub(1));
                        pc += 1;
                    }

                    // ===== 32-bit integer arithmetic =====
                    Opcode::AddI | Opcode::SubI | Opcode::MulI => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1))) as i32;
                        let b = self.stack.read(vp(fp, instr::sw2(w1))) as i32;
                        let r = match op {
                            Opcode::AddI => a.wrapping_add(b),
                            Opcode::SubI => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        self.stack.write(vp(fp, sw0), r as u32);
                        pc += 2;
                    }
                    Opcode::DivI | Opcode::ModI => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1))) as i32;
                        let b = self.stack.read(vp(fp, instr::sw2(w1))) as i32;
                        if b == 0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        if b == -1 && a == i32::MIN {
                            self.raise(pc, sp, fp, ScriptException::DivideOverflow);
                            return;
                        }
                        let r = if op == Opcode::DivI { a / b } else { a % b };
                        self.stack.write(vp(fp, sw0), r as u32);
                        pc += 2;
                    }
                    Opcode::DivU | Opcode::ModU => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read(vp(fp, instr::sw2(w1)));
                        if b == 0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        let r = if op == Opcode::DivU { a / b } else { a % b };
                        self.stack.write(vp(fp, sw0), r);
                        pc += 2;
                    }
                    Opcode::NegI => {
                        let v = self.stack.read(vp(fp, sw0)) as i32;
                        self.stack.write(vp(fp, sw0), v.wrapping_neg() as u32);
                        pc += 1;
                    }
                    Opcode::AddIi | Opcode::SubIi | Opcode::MulIi => {
                        let s = instr::sw1(code[pc + 1]);
                        let a = self.stack.read(vp(fp, s)) as i32;
                        let b = code[pc + 2] as i32;
                        let r = match op {
                            Opcode::AddIi => a.wrapping_add(b),
                            Opcode::SubIi => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        self.stack.write(vp(fp, sw0), r as u32);
                        pc += 3;
                    }

                    // ===== 64-bit integer arithmetic =====
                    Opcode::AddI64 | Opcode::SubI64 | Opcode::MulI64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1))) as i64;
                        let b = self.stack.read64(vp(fp, instr::sw2(w1))) as i64;
                        let r = match op {
                            Opcode::AddI64 => a.wrapping_add(b),
                            Opcode::SubI64 => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        };
                        self.stack.write64(vp(fp, sw0), r as u64);
                        pc += 2;
                    }
                    Opcode::DivI64 | Opcode::ModI64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1))) as i64;
                        let b = self.stack.read64(vp(fp, instr::sw2(w1))) as i64;
                        if b == 0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        if b == -1 && a == i64::MIN {
                            self.raise(pc, sp, fp, ScriptException::DivideOverflow);
                            return;
                        }
                        let r = if op == Opcode::DivI64 { a / b } else { a % b };
                        self.stack.write64(vp(fp, sw0), r as u64);
                        pc += 2;
                    }
                    Opcode::DivU64 | Opcode::ModU64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read64(vp(fp, instr::sw2(w1)));
                        if b == 0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        let r = if op == Opcode::DivU64 { a / b } else { a % b };
                        self.stack.write64(vp(fp, sw0), r);
                        pc += 2;
                    }
                    Opcode::NegI64 => {
                        let v = self.stack.read64(vp(fp, sw0)) as i64;
                        self.stack.write64(vp(fp, sw0), v.wrapping_neg() as u64);
                        pc += 1;
                    }

                    // ===== 32-bit float arithmetic =====
                    Opcode::AddF | Opcode::SubF | Opcode::MulF => {
                        let w1 = code[pc + 1];
                        let a = f32::from_bits(self.stack.read(vp(fp, instr::sw1(w1))));
                        let b = f32::from_bits(self.stack.read(vp(fp, instr::sw2(w1))));
                        let r = match op {
                            Opcode::AddF => a + b,
                            Opcode::SubF => a - b,
                            _ => a * b,
                        };
                        self.stack.write(vp(fp, sw0), r.to_bits());
                        pc += 2;
                    }
                    Opcode::DivF | Opcode::ModF => {
                        let w1 = code[pc + 1];
                        let a = f32::from_bits(self.stack.read(vp(fp, instr::sw1(w1))));
                        let b = f32::from_bits(self.stack.read(vp(fp, instr::sw2(w1))));
                        if b == 0.0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        let r = if op == Opcode::DivF { a / b } else { a % b };
                        self.stack.write(vp(fp, sw0), r.to_bits());
                        pc += 2;
                    }
                    Opcode::NegF => {
                        let v = f32::from_bits(self.stack.read(vp(fp, sw0)));
                        self.stack.write(vp(fp, sw0), (-v).to_bits());
                        pc += 1;
                    }
                    Opcode::AddIf | Opcode::SubIf | Opcode::MulIf => {
                        let s = instr::sw1(code[pc + 1]);
                        let a = f32::from_bits(self.stack.read(vp(fp, s)));
                        let b = f32::from_bits(code[pc + 2]);
                        let r = match op {
                            Opcode::AddIf => a + b,
                            Opcode::SubIf => a - b,
                            _ => a * b,
                        };
                        self.stack.write(vp(fp, sw0), r.to_bits());
                        pc += 3;
                    }

                    // ===== 64-bit float arithmetic =====
                    Opcode::AddD | Opcode::SubD | Opcode::MulD => {
                        let w1 = code[pc + 1];
                        let a = f64::from_bits(self.stack.read64(vp(fp, instr::sw1(w1))));
                        let b = f64::from_bits(self.stack.read64(vp(fp, instr::sw2(w1))));
                        let r = match op {
                            Opcode::AddD => a + b,
                            Opcode::SubD => a - b,
                            _ => a * b,
                        };
                        self.stack.write64(vp(fp, sw0), r.to_bits());
                        pc += 2;
                    }
                    Opcode::DivD | Opcode::ModD => {
                        let w1 = code[pc + 1];
                        let a = f64::from_bits(self.stack.read64(vp(fp, instr::sw1(w1))));
                        let b = f64::from_bits(self.stack.read64(vp(fp, instr::sw2(w1))));
                        if b == 0.0 {
                            self.raise(pc, sp, fp, ScriptException::DivideByZero);
                            return;
                        }
                        let r = if op == Opcode::DivD { a / b } else { a % b };
                        self.stack.write64(vp(fp, sw0), r.to_bits());
                        pc += 2;
                    }
                    Opcode::NegD => {
                        let v = f64::from_bits(self.stack.read64(vp(fp, sw0)));
                        self.stack.write64(vp(fp, sw0), (-v).to_bits());
                        pc += 1;
                    }

                    // ===== Exponentiation =====
                    Opcode::PowI => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1))) as i32;
                        let b = self.stack.read(vp(fp, instr::sw2(w1))) as i32;
                        match pow::pow_i32(a, b) {
                            Some(r) => self.stack.write(vp(fp, sw0), r as u32),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowU => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read(vp(fp, instr::sw2(w1)));
                        match pow::pow_u32(a, b) {
                            Some(r) => self.stack.write(vp(fp, sw0), r),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowI64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1))) as i64;
                        let b = self.stack.read64(vp(fp, instr::sw2(w1))) as i64;
                        match pow::pow_i64(a, b) {
                            Some(r) => self.stack.write64(vp(fp, sw0), r as u64),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowU64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read64(vp(fp, instr::sw2(w1)));
                        match pow::pow_u64(a, b) {
                            Some(r) => self.stack.write64(vp(fp, sw0), r),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowF => {
                        let w1 = code[pc + 1];
                        let a = f32::from_bits(self.stack.read(vp(fp, instr::sw1(w1))));
                        let b = f32::from_bits(self.stack.read(vp(fp, instr::sw2(w1))));
                        match pow::pow_f32(a, b) {
                            Some(r) => self.stack.write(vp(fp, sw0), r.to_bits()),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowD => {
                        let w1 = code[pc + 1];
                        let a = f64::from_bits(self.stack.read64(vp(fp, instr::sw1(w1))));
                        let b = f64::from_bits(self.stack.read64(vp(fp, instr::sw2(w1))));
                        match pow::pow_f64(a, b) {
                            Some(r) => self.stack.write64(vp(fp, sw0), r.to_bits()),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }
                    Opcode::PowDi => {
                        let w1 = code[pc + 1];
                        let a = f64::from_bits(self.stack.read64(vp(fp, instr::sw1(w1))));
                        let b = self.stack.read(vp(fp, instr::sw2(w1))) as i32;
                        match pow::pow_f64_i32(a, b) {
                            Some(r) => self.stack.write64(vp(fp, sw0), r.to_bits()),
                            None => {
                                self.raise(pc, sp, fp, ScriptException::PowOverflow);
                                return;
                            }
                        }
                        pc += 2;
                    }

                    // ===== Bit operations =====
                    Opcode::BNot => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), !v);
                        pc += 1;
                    }
                    Opcode::BAnd | Opcode::BOr | Opcode::BXor | Opcode::BSll
                    | Opcode::BSrl | Opcode::BSra => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read(vp(fp, instr::sw2(w1)));
                        let r = match op {
                            Opcode::BAnd => a & b,
                            Opcode::BOr => a | b,
                            Opcode::BXor => a ^ b,
                            Opcode::BSll => a.wrapping_shl(b),
                            Opcode::BSrl => a.wrapping_shr(b),
                            _ => ((a as i32).wrapping_shr(b)) as u32,
                        };
                        self.stack.write(vp(fp, sw0), r);
                        pc += 2;
                    }
                    Opcode::BNot64 => {
                        let v = self.stack.read64(vp(fp, sw0));
                        self.stack.write64(vp(fp, sw0), !v);
                        pc += 1;
                    }
                    Opcode::BAnd64 | Opcode::BOr64 | Opcode::BXor64 | Opcode::BSll64
                    | Opcode::BSrl64 | Opcode::BSra64 => {
                        let w1 = code[pc + 1];
                        let a = self.stack.read64(vp(fp, instr::sw1(w1)));
                        let b = self.stack.read64(vp(fp, instr::sw2(w1)));
                        let r = match op {
                            Opcode::BAnd64 => a & b,
                            Opcode::BOr64 => a | b,
                            Opcode::BXor64 => a ^ b,
                            Opcode::BSll64 => a.wrapping_shl(b as u32),
                            Opcode::BSrl64 => a.wrapping_shr(b as u32),
                            _ => ((a as i64).wrapping_shr(b as u32)) as u64,
                        };
                        self.stack.write64(vp(fp, sw0), r);
                        pc += 2;
                    }

                    // ===== In-place conversions =====
                    Opcode::ItoF => {
                        let v = self.stack.read(vp(fp, sw0)) as i32;
                        self.stack.write(vp(fp, sw0), (v as f32).to_bits());
                        pc += 1;
                    }
                    Opcode::FtoI => {
                        let v = f32::from_bits(self.stack.read(vp(fp, sw0)));
                        self.stack.write(vp(fp, sw0), (v as i32) as u32);
                        pc += 1;
                    }
                    Opcode::UtoF => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), (v as f32).to_bits());
                        pc += 1;
                    }
                    Opcode::FtoU => {
                        let v = f32::from_bits(self.stack.read(vp(fp, sw0)));
                        self.stack.write(vp(fp, sw0), v as u32);
                        pc += 1;
                    }
                    Opcode::SbToI => {
                        let v = self.stack.read(vp(fp, sw0)) as u8 as i8;
                        self.stack.write(vp(fp, sw0), v as i32 as u32);
                        pc += 1;
                    }
                    Opcode::SwToI => {
                        let v = self.stack.read(vp(fp, sw0)) as u16 as i16;
                        self.stack.write(vp(fp, sw0), v as i32 as u32);
                        pc += 1;
                    }
                    Opcode::UbToI => {
                        let v = self.stack.read(vp(fp, sw0)) & 0xFF;
                        self.stack.write(vp(fp, sw0), v);
                        pc += 1;
                    }
                    Opcode::UwToI => {
                        let v = self.stack.read(vp(fp, sw0)) & 0xFFFF;
                        self.stack.write(vp(fp, sw0), v);
                        pc += 1;
                    }
                    Opcode::ItoB => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), v & 0xFF);
                        pc += 1;
                    }
                    Opcode::ItoW => {
                        let v = self.stack.read(vp(fp, sw0));
                        self.stack.write(vp(fp, sw0), v & 0xFFFF);
                        pc += 1;
                    }

                    // ===== Widening / narrowing conversions =====
                    Opcode::I64toI => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s)) as i64;
                        self.stack.write(vp(fp, sw0), v as i32 as u32);
                        pc += 2;
                    }
                    Opcode::UtoI64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read(vp(fp, s));
                        self.stack.write64(vp(fp, sw0), v as u64);
                        pc += 2;
                    }
                    Opcode::ItoI64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read(vp(fp, s)) as i32;
                        self.stack.write64(vp(fp, sw0), v as i64 as u64);
                        pc += 2;
                    }
                    Opcode::FtoD => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f32::from_bits(self.stack.read(vp(fp, s)));
                        self.stack.write64(vp(fp, sw0), (v as f64).to_bits());
                        pc += 2;
                    }
                    Opcode::DtoF => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f64::from_bits(self.stack.read64(vp(fp, s)));
                        self.stack.write(vp(fp, sw0), (v as f32).to_bits());
                        pc += 2;
                    }
                    Opcode::FtoU64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f32::from_bits(self.stack.read(vp(fp, s)));
                        self.stack.write64(vp(fp, sw0), v as u64);
                        pc += 2;
                    }
                    Opcode::U64toF => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s));
                        self.stack.write(vp(fp, sw0), (v as f32).to_bits());
                        pc += 2;
                    }
                    Opcode::I64toF => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s)) as i64;
                        self.stack.write(vp(fp, sw0), (v as f32).to_bits());
                        pc += 2;
                    }
                    Opcode::FtoI64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f32::from_bits(self.stack.read(vp(fp, s)));
                        self.stack.write64(vp(fp, sw0), (v as i64) as u64);
                        pc += 2;
                    }
                    Opcode::DtoI64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f64::from_bits(self.stack.read64(vp(fp, s)));
                        self.stack.write64(vp(fp, sw0), (v as i64) as u64);
                        pc += 2;
                    }
                    Opcode::DtoU64 => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f64::from_bits(self.stack.read64(vp(fp, s)));
                        self.stack.write64(vp(fp, sw0), v as u64);
                        pc += 2;
                    }
                    Opcode::I64toD => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s)) as i64;
                        self.stack.write64(vp(fp, sw0), (v as f64).to_bits());
                        pc += 2;
                    }
                    Opcode::U64toD => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read64(vp(fp, s));
                        self.stack.write64(vp(fp, sw0), (v as f64).to_bits());
                        pc += 2;
                    }
                    Opcode::ItoD => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read(vp(fp, s)) as i32;
                        self.stack.write64(vp(fp, sw0), (v as f64).to_bits());
                        pc += 2;
                    }
                    Opcode::DtoI => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f64::from_bits(self.stack.read64(vp(fp, s)));
                        self.stack.write(vp(fp, sw0), (v as i32) as u32);
                        pc += 2;
                    }
                    Opcode::UtoD => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = self.stack.read(vp(fp, s));
                        self.stack.write64(vp(fp, sw0), (v as f64).to_bits());
                        pc += 2;
                    }
                    Opcode::DtoU => {
                        let s = instr::sw1(code[pc + 1]);
                        let v = f64::from_bits(self.stack.read64(vp(fp, s)));
                        self.stack.write(vp(fp, sw0), v as u32);
                        pc += 2;
                    }

                    // ===== Calls & control =====
                    Opcode::Call => {
                        let id = FunctionId(code[pc + 1]);
                        pc += 2;
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        match self.engine.function(id) {
                            Some(f) => self.call_script_function(&f),
                            None => {
                                self.set_internal_exception(
                                    ScriptException::UnboundFunction,
                                    true,
                                );
                            }
                        }

                        if self.status != ExecutionStatus::Active {
                            return;
                        }
                        continue 'function;
                    }
                    Opcode::CallSys => {
                        let id = FunctionId(code[pc + 1]);
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        let popped = self.call_system_function(id);
                        sp = sp.offset(popped);
                        pc += 2;

                        if self.regs.do_process_suspend
                            || self.interrupt.do_process_suspend.load(Ordering::Relaxed)
                        {
                            if self.interrupt.do_suspend.load(Ordering::Relaxed) {
                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;
                                self.status = ExecutionStatus::Suspended;
                                return;
                            }
                            if self.status != ExecutionStatus::Active {
                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;
                                return;
                            }
                        }
                        if self.status != ExecutionStatus::Active {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;
                            return;
                        }
                    }
                    Opcode::CallBnd => {
                        let id = FunctionId(code[pc + 1]);
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        match self.engine.bound_import(id) {
                            None => {
                                // Leave the program pointer on the next
                                // instruction for the unwinder
                                self.regs.program_pointer = Some((pc + 2) as u32);
                                self.need_to_cleanup_args = true;
                                self.set_internal_exception(
                                    ScriptException::UnboundFunction,
                                    true,
                                );
                                return;
                            }
                            Some(target) => match self.engine.function(target) {
                                Some(f) if f.kind == FunctionKind::Script => {
                                    self.regs.program_pointer = Some((pc + 2) as u32);
                                    self.call_script_function(&f);
                                }
                                Some(f) => {
                                    let popped = self.call_system_function(f.id);
                                    self.regs.stack_pointer =
                                        self.regs.stack_pointer.offset(popped);
                                    self.regs.program_pointer = Some((pc + 2) as u32);
                                }
                                None => {
                                    self.regs.program_pointer = Some((pc + 2) as u32);
                                    self.need_to_cleanup_args = true;
                                    self.set_internal_exception(
                                        ScriptException::UnboundFunction,
                                        true,
                                    );
                                    return;
                                }
                            },
                        }

                        if self.status != ExecutionStatus::Active {
                            return;
                        }
                        continue 'function;
                    }
                    Opcode::CallIntf => {
                        let id = FunctionId(code[pc + 1]);
                        pc += 2;
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        match self.engine.function(id) {
                            Some(f) => self.call_interface_method(&f),
                            None => {
                                self.set_internal_exception(
                                    ScriptException::UnboundFunction,
                                    true,
                                );
                            }
                        }

                        if self.status != ExecutionStatus::Active {
                            return;
                        }
                        continue 'function;
                    }
                    Opcode::CallPtr => {
                        let raw = self.stack.read64(vp(fp, sw0));
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        let target = VmPtr::from_raw(raw)
                            .as_object()
                            .and_then(|h| self.engine.function_object(h));
                        let Some((target, receiver)) = target else {
                            self.regs.program_pointer = Some((pc + 1) as u32);
                            self.need_to_cleanup_args = true;
                            self.set_internal_exception(ScriptException::UnboundFunction, true);
                            return;
                        };

                        self.regs.program_pointer = Some((pc + 1) as u32);
                        self.call_function_pointer(target, receiver);

                        if self.status != ExecutionStatus::Active {
                            return;
                        }
                        continue 'function;
                    }
                    Opcode::Thiscall1 => {
                        // Fast path for `T& f(i32)`-shaped methods; the
                        // exception behavior is the system-call path's
                        let id = FunctionId(code[pc + 1]);
                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        let popped = self.call_system_function(id);
                        sp = sp.offset(popped);
                        pc += 2;

                        if self.status != ExecutionStatus::Active {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;
                            return;
                        }
                    }
                    Opcode::Ret => {
                        let is_bottom = self
                            .call_stack
                            .top()
                            .map(|r| r.is_nested_marker())
                            .unwrap_or(true);
                        if is_bottom {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;
                            self.status = ExecutionStatus::Finished;
                            return;
                        }

                        let args = code[pc + 1];
                        self.pop_call_state();

                        sp = self.regs.stack_pointer.offset(args as i32);
                        self.regs.stack_pointer = sp;
                        continue 'function;
                    }
                    Opcode::Suspend => {
                        if self.regs.do_process_suspend
                            || self.interrupt.do_process_suspend.load(Ordering::Relaxed)
                        {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;
                            self.call_line_callback();
                            if self.status != ExecutionStatus::Active {
                                return;
                            }
                            if self.interrupt.do_suspend.load(Ordering::Relaxed) {
                                self.regs.program_pointer = Some((pc + 1) as u32);
                                self.status = ExecutionStatus::Suspended;
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::JitEntry => {
                        let arg = code[pc + 1];
                        let jit = if arg != 0 {
                            self.engine.jit_body(func.id)
                        } else {
                            None
                        };
                        match jit {
                            Some(jit) => {
                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;

                                jit(&mut self.regs);

                                if self.status != ExecutionStatus::Active {
                                    return;
                                }
                                // Resume wherever the JIT left the
                                // program pointer
                                continue 'function;
                            }
                            None => pc += 2,
                        }
                    }

                    // ===== Object lifecycle =====
                    Opcode::Alloc => {
                        let type_id = sable_bytecode::TypeId(code[pc + 1]);
                        let ctor = code[pc + 2];
                        let Some(info) = self.engine.type_info(type_id) else {
                            self.raise(pc, sp, fp, ScriptException::UnrecognizedByteCode);
                            return;
                        };

                        if info.is_script_object {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;

                            let mem = self.engine.allocate_object(type_id);

                            let Some(ctor_fn) = self.engine.function(FunctionId(ctor))
                            else {
                                self.set_internal_exception(
                                    ScriptException::UnboundFunction,
                                    true,
                                );
                                return;
                            };

                            // The destination address was pushed before
                            // the constructor arguments
                            let dest_loc = self
                                .regs
                                .stack_pointer
                                .offset(ctor_fn.space_for_args() as i32);
                            let dest = VmPtr::from_raw(self.stack.read64(dest_loc));
                            if !dest.is_null() {
                                let obj = VmPtr::object(mem, 0).raw();
                                if let Err(e) = self.write_through(dest, 8, obj) {
                                    self.set_internal_exception(e, true);
                                    return;
                                }
                            }

                            // Push the receiver for the constructor
                            self.regs.stack_pointer =
                                self.regs.stack_pointer.offset(-(PTR_SIZE as i32));
                            let rsp = self.regs.stack_pointer;
                            self.stack.write64(rsp, VmPtr::object(mem, 0).raw());

                            self.regs.program_pointer = Some((pc + 3) as u32);
                            self.call_script_function(&ctor_fn);

                            if self.status != ExecutionStatus::Active {
                                return;
                            }
                            continue 'function;
                        } else {
                            let mem = self.engine.allocate_object(type_id);

                            if ctor != 0 {
                                sp = sp.offset(-(PTR_SIZE as i32));
                                self.stack.write64(sp, VmPtr::object(mem, 0).raw());

                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;

                                let popped = self.call_system_function(FunctionId(ctor));
                                sp = sp.offset(popped);
                            }

                            let dest = VmPtr::from_raw(self.stack.read64(sp));
                            sp = sp.offset(PTR_SIZE as i32);
                            pc += 3;

                            if self.status != ExecutionStatus::Active {
                                // The constructor raised; undo the
                                // allocation before unwinding
                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;
                                self.engine.release(mem);
                                let _ = self.write_through(dest, 8, 0);
                                return;
                            }

                            if !dest.is_null() {
                                let obj = VmPtr::object(mem, 0).raw();
                                if let Err(e) = self.write_through(dest, 8, obj) {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            }

                            if self.interrupt.do_suspend.load(Ordering::Relaxed)
                                && (self.regs.do_process_suspend
                                    || self
                                        .interrupt
                                        .do_process_suspend
                                        .load(Ordering::Relaxed))
                            {
                                self.regs.program_pointer = Some(pc as u32);
                                self.regs.stack_pointer = sp;
                                self.regs.stack_frame_pointer = fp;
                                self.status = ExecutionStatus::Suspended;
                                return;
                            }
                        }
                    }
                    Opcode::Free => {
                        let raw = self.stack.read64(vp(fp, sw0));
                        if let Some(h) = VmPtr::from_raw(raw).as_object() {
                            self.regs.program_pointer = Some(pc as u32);
                            self.regs.stack_pointer = sp;
                            self.regs.stack_frame_pointer = fp;

                            let type_id = sable_bytecode::TypeId(code[pc + 1]);
                            let nocount = self
                                .engine
                                .type_info(type_id)
                                .map(|t| t.is_reference && t.is_nocount)
                                .unwrap_or(false);
                            if !nocount {
                                self.engine.release(h);
                            }
                            self.stack.write64(vp(fp, sw0), 0);
                        }
                        pc += 2;
                    }
                    Opcode::LoadObj => {
                        let raw = self.stack.read64(vp(fp, sw0));
                        self.regs.object_type = None;
                        self.regs.object_register = VmPtr::from_raw(raw).as_object();
                        self.stack.write64(vp(fp, sw0), 0);
                        pc += 1;
                    }
                    Opcode::StoreObj => {
                        let h = self.regs.object_register.take();
                        let raw = h.map(|h| VmPtr::object(h, 0).raw()).unwrap_or(0);
                        self.stack.write64(vp(fp, sw0), raw);
                        pc += 1;
                    }
                    Opcode::GetObj => {
                        // Exchange the variable index on the stack for
                        // the object it names, transferring ownership
                        let loc = sp.offset(sw0);
                        let offset = self.stack.read64(loc) as i64 as i32;
                        let slot = vp(fp, offset);
                        let obj = self.stack.read64(slot);
                        self.stack.write64(loc, obj);
                        self.stack.write64(slot, 0);
                        pc += 1;
                    }
                    Opcode::RefCpy => {
                        let type_id = sable_bytecode::TypeId(code[pc + 1]);
                        let dest = VmPtr::from_raw(self.stack.read64(sp));
                        sp = sp.offset(PTR_SIZE as i32);
                        let src = VmPtr::from_raw(self.stack.read64(sp));

                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        if let Err(e) = self.ref_copy(type_id, dest, src) {
                            self.raise(pc, sp, fp, e);
                            return;
                        }
                        pc += 2;
                    }
                    Opcode::RefCpyV => {
                        let type_id = sable_bytecode::TypeId(code[pc + 1]);
                        let dest = VmPtr::stack(vp(fp, sw0));
                        let src = VmPtr::from_raw(self.stack.read64(sp));

                        self.regs.program_pointer = Some(pc as u32);
                        self.regs.stack_pointer = sp;
                        self.regs.stack_frame_pointer = fp;

                        if let Err(e) = self.ref_copy(type_id, dest, src) {
                            self.raise(pc, sp, fp, e);
                            return;
                        }
                        pc += 2;
                    }
                    Opcode::ChkRef => {
                        if self.stack.read64(sp) == 0 {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        pc += 1;
                    }
                    Opcode::GetObjRef => {
                        let loc = sp.offset(sw0);
                        let offset = self.stack.read64(loc) as i64 as i32;
                        let v = self.stack.read64(vp(fp, offset));
                        self.stack.write64(loc, v);
                        pc += 1;
                    }
                    Opcode::GetRef => {
                        let loc = sp.offset(sw0);
                        let offset = self.stack.read64(loc) as i64 as i32;
                        self.stack
                            .write64(loc, VmPtr::stack(vp(fp, offset)).raw());
                        pc += 1;
                    }
                    Opcode::ChkRefS => {
                        // The stack top holds the address of a handle;
                        // the handle itself must not be null
                        let p = VmPtr::from_raw(self.stack.read64(sp));
                        match self.read_through(p, 8) {
                            Ok(0) => {
                                self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                                return;
                            }
                            Ok(_) => {}
                            Err(e) => {
                                self.raise(pc, sp, fp, e);
                                return;
                            }
                        }
                        pc += 1;
                    }
                    Opcode::ChkNullV => {
                        if self.stack.read64(vp(fp, sw0)) == 0 {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        pc += 1;
                    }
                    Opcode::ChkNullS => {
                        if self.stack.read64(sp.offset(sw0)) == 0 {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        pc += 1;
                    }
                    Opcode::Cast => {
                        let p = VmPtr::from_raw(self.stack.read64(sp));
                        if !p.is_null() {
                            let handle = match self.read_through(p, 8) {
                                Ok(raw) => VmPtr::from_raw(raw).as_object(),
                                Err(e) => {
                                    self.raise(pc, sp, fp, e);
                                    return;
                                }
                            };
                            if let Some(h) = handle {
                                let target = sable_bytecode::TypeId(code[pc + 1]);
                                let compatible = self
                                    .engine
                                    .object_type(h)
                                    .map(|t| {
                                        self.engine.type_derives_from(t, target)
                                            || self.engine.type_implements(t, target)
                                    })
                                    .unwrap_or(false);
                                if compatible {
                                    self.engine.add_ref(h);
                                    self.regs.object_type = None;
                                    self.regs.object_register = Some(h);
                                } else {
                                    debug_assert!(self.regs.object_register.is_none());
                                }
                            }
                        }
                        sp = sp.offset(PTR_SIZE as i32);
                        pc += 2;
                    }
                    Opcode::AddSi => {
                        let p = VmPtr::from_raw(self.stack.read64(sp));
                        if p.is_null() {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        self.stack.write64(sp, p.add_cells(sw0 as u32).raw());
                        pc += 2;
                    }

                    // ===== Initialization lists =====
                    Opcode::AllocMem => {
                        let cells = code[pc + 1];
                        let h = self.engine.allocate_buffer(cells);
                        self.stack
                            .write64(vp(fp, sw0), VmPtr::object(h, 0).raw());
                        pc += 2;
                    }
                    Opcode::SetListSize => {
                        let buf = VmPtr::from_raw(self.stack.read64(vp(fp, sw0)));
                        let off = code[pc + 1];
                        let size = code[pc + 2];
                        if let Err(e) =
                            self.write_through(buf.add_cells(off), 4, size as u64)
                        {
                            self.raise(pc, sp, fp, e);
                            return;
                        }
                        pc += 3;
                    }
                    Opcode::PushListElmnt => {
                        let buf = VmPtr::from_raw(self.stack.read64(vp(fp, sw0)));
                        if buf.is_null() {
                            self.raise(pc, sp, fp, ScriptException::NullPointerAccess);
                            return;
                        }
                        let off = code[pc + 1];
                        sp = sp.offset(-(PTR_SIZE as i32));
                        self.stack.write64(sp, buf.add_cells(off).raw());
                        pc += 2;
                    }
                    Opcode::SetListType => {
                        let buf = VmPtr::from_raw(self.stack.read64(vp(fp, sw0)));
                        let off = code[pc + 1];
                        let type_id = code[pc + 2];
                        if let Err(e) =
                            self.write_through(buf.add_cells(off), 4, type_id as u64)
                        {
                            self.raise(pc, sp, fp, e);
                            return;
                        }
                        pc += 3;
                    }
                }

                #[cfg(debug_assertions)]
                if !op.is_control() {
                    debug_assert_eq!(
                        pc - pc_before,
                        op.size_words() as usize,
                        "handler for {:?} advanced the wrong distance",
                        op
                    );
                }
            }
        }
    }

    /// Release the old reference at `dest` and store an addref'd `src`
    fn ref_copy(
        &mut self,
        type_id: sable_bytecode::TypeId,
        dest: VmPtr,
        src: VmPtr,
    ) -> Result<(), ScriptException> {
        let counted = self
            .engine
            .type_info(type_id)
            .map(|t| t.is_reference && !t.is_nocount)
            .unwrap_or(false);
        if counted {
            let old = VmPtr::from_raw(self.read_through(dest, 8)?);
            if let Some(h) = old.as_object() {
                self.engine.release(h);
            }
            if let Some(h) = src.as_object() {
                self.engine.add_ref(h);
            }
        }
        self.write_through(dest, 8, src.raw())
    }

    // ========================================================================
    // Call transitions
    // ========================================================================

    /// Enter a script function: push the return frame, switch functions,
    /// and lay out the callee's stack frame
    pub(crate) fn call_script_function(&mut self, func: &Arc<ScriptFunction>) {
        debug_assert!(func.script.is_some());

        if let Err(exc) = self.push_call_state() {
            self.set_internal_exception(exc, true);
            return;
        }

        self.current_function = Some(Arc::clone(func));
        self.regs.program_pointer = Some(0);

        self.prepare_script_function();
    }

    /// Reserve the callee's stack space, zero its heap-object slots and
    /// position the frame and stack pointers
    pub(crate) fn prepare_script_function(&mut self) {
        let Some(func) = self.current_function.clone() else {
            return;
        };
        let Some(sd) = func.script_data() else {
            return;
        };

        let old_sp = self.regs.stack_pointer;
        let need = sd.stack_needed;

        if !self.stack.is_allocated() || old_sp.cell < need + RESERVE_MARGIN {
            let args = func.arguments_size();
            match self.stack.reserve(need, old_sp, args) {
                Ok(new_sp) => self.regs.stack_pointer = new_sp,
                Err(_) => {
                    self.is_stack_memory_not_allocated = true;
                    self.regs.stack_frame_pointer = self.regs.stack_pointer;
                    self.set_internal_exception(ScriptException::StackOverflow, true);
                    return;
                }
            }
        }

        self.regs.stack_frame_pointer = self.regs.stack_pointer;

        // Heap-object locals must read as null before first use; value
        // objects are initialized by their constructors instead
        let fp = self.regs.stack_frame_pointer;
        for var in sd.variables.iter().rev() {
            if var.stack_offset <= 0 {
                continue;
            }
            if var.on_heap && var.ty.is_object() {
                self.stack.write64(vp(fp, var.stack_offset), 0);
            }
        }

        self.regs.stack_pointer = self
            .regs
            .stack_pointer
            .offset(-(sd.variable_space as i32));

        // Line cues fire on function entry too, so endless recursion can
        // be interrupted even without suspend instructions in the body
        if self.regs.do_process_suspend
            || self.interrupt.do_process_suspend.load(Ordering::Relaxed)
        {
            self.call_line_callback();
            if self.interrupt.do_suspend.load(Ordering::Relaxed)
                && self.status == ExecutionStatus::Active
            {
                self.status = ExecutionStatus::Suspended;
            }
        }
    }

    /// Resolve a virtual or interface method against the receiver at the
    /// stack top, then call the real function
    pub(crate) fn call_interface_method(&mut self, func: &Arc<ScriptFunction>) {
        let receiver = VmPtr::from_raw(self.stack.read64(self.regs.stack_pointer));
        match self.resolve_real_function(func, receiver) {
            Ok(real) => self.call_script_function(&real),
            Err(exc) => {
                self.need_to_cleanup_args = true;
                self.set_internal_exception(exc, true);
            }
        }
    }

    /// Find the concrete method a virtual or interface descriptor names
    /// on the receiver's type
    pub(crate) fn resolve_real_function(
        &self,
        func: &Arc<ScriptFunction>,
        receiver: VmPtr,
    ) -> Result<Arc<ScriptFunction>, ScriptException> {
        let handle = receiver
            .as_object()
            .ok_or(ScriptException::NullPointerAccess)?;
        let obj_type_id = self
            .engine
            .object_type(handle)
            .ok_or(ScriptException::NullPointerAccess)?;
        let obj_type = self
            .engine
            .type_info(obj_type_id)
            .ok_or(ScriptException::NullPointerAccess)?;

        match func.kind {
            FunctionKind::Virtual { vtable_index } => obj_type
                .virtual_function_table
                .get(vtable_index as usize)
                .and_then(|id| self.engine.function(*id))
                .ok_or(ScriptException::NullPointerAccess),
            FunctionKind::Interface { vtable_index } => {
                let iface = func.object_type.ok_or(ScriptException::NullPointerAccess)?;
                if let Some(n) = obj_type.interfaces.iter().position(|t| *t == iface) {
                    let offset = obj_type
                        .interface_vft_offsets
                        .get(n)
                        .copied()
                        .unwrap_or(0);
                    let real = obj_type
                        .virtual_function_table
                        .get((vtable_index + offset) as usize)
                        .and_then(|id| self.engine.function(*id))
                        .ok_or(ScriptException::NullPointerAccess)?;
                    debug_assert_eq!(real.signature_id, func.signature_id);
                    return Ok(real);
                }

                // Fall back to a signature scan over the type's methods
                for id in &obj_type.methods {
                    let Some(m) = self.engine.function(*id) else {
                        continue;
                    };
                    if m.signature_id == func.signature_id {
                        if let FunctionKind::Virtual { vtable_index } = m.kind {
                            return obj_type
                                .virtual_function_table
                                .get(vtable_index as usize)
                                .and_then(|id| self.engine.function(*id))
                                .ok_or(ScriptException::NullPointerAccess);
                        }
                        return Ok(m);
                    }
                }
                Err(ScriptException::NullPointerAccess)
            }
            FunctionKind::Imported => match self.engine.bound_import(func.id) {
                Some(target) => self
                    .engine
                    .function(target)
                    .ok_or(ScriptException::UnboundFunction),
                None => Err(ScriptException::UnboundFunction),
            },
            _ => Ok(Arc::clone(func)),
        }
    }

    /// Dispatch a call through a function-pointer or delegate object
    fn call_function_pointer(&mut self, target: FunctionId, receiver: Option<ObjectHandle>) {
        let Some(func) = self.engine.function(target) else {
            self.need_to_cleanup_args = true;
            self.set_internal_exception(ScriptException::UnboundFunction, true);
            return;
        };

        if let Some(recv) = receiver {
            // Delegate: push the bound receiver; the reserve margin
            // guarantees the room
            self.regs.stack_pointer = self.regs.stack_pointer.offset(-(PTR_SIZE as i32));
            let sp = self.regs.stack_pointer;
            self.stack.write64(sp, VmPtr::object(recv, 0).raw());

            match func.kind {
                FunctionKind::System | FunctionKind::Generic => {
                    let popped = self.call_system_function(func.id);
                    self.regs.stack_pointer = self.regs.stack_pointer.offset(popped);
                }
                FunctionKind::Virtual { .. } | FunctionKind::Interface { .. } => {
                    self.call_interface_method(&func);
                }
                _ => self.call_script_function(&func),
            }
            return;
        }

        match func.kind {
            FunctionKind::Script => self.call_script_function(&func),
            FunctionKind::System | FunctionKind::Generic => {
                let popped = self.call_system_function(func.id);
                self.regs.stack_pointer = self.regs.stack_pointer.offset(popped);
            }
            FunctionKind::Imported => match self.engine.bound_import(func.id) {
                Some(bound) => match self.engine.function(bound) {
                    Some(f) => self.call_script_function(&f),
                    None => {
                        self.need_to_cleanup_args = true;
                        self.set_internal_exception(ScriptException::UnboundFunction, true);
                    }
                },
                None => {
                    self.need_to_cleanup_args = true;
                    self.set_internal_exception(ScriptException::UnboundFunction, true);
                }
            },
            _ => self.call_interface_method(&func),
        }
    }

    // ========================================================================
    // System calls
    // ========================================================================

    /// Invoke a host function: marshal the argument area, run the native
    /// entry point, write the result registers, and report how many
    /// cells to pop
    ///
    /// A panic crossing the host boundary is caught, optionally routed
    /// through the engine's translation callback, and re-raised as the
    /// `ExceptionCaught` script exception.
    pub(crate) fn call_system_function(&mut self, id: FunctionId) -> i32 {
        let Some(func) = self.engine.function(id) else {
            self.set_internal_exception(ScriptException::UnboundFunction, true);
            return 0;
        };
        let Some(native) = self.engine.native(id) else {
            self.set_internal_exception(ScriptException::UnboundFunction, true);
            return 0;
        };

        let sp = self.regs.stack_pointer;
        let mut offset = 0u32;

        let receiver = if func.has_receiver() {
            let h = VmPtr::from_raw(self.stack.read64(sp)).as_object();
            if h.is_none() {
                // The callee is known, so its pushed arguments can be
                // destroyed right here instead of by the unwinder
                let mut skip = PTR_SIZE;
                if func.returns_on_stack() {
                    skip += PTR_SIZE;
                }
                self.release_system_args(&func, sp.offset(skip as i32));
                self.set_internal_exception(ScriptException::NullPointerAccess, true);
                return (skip + func.space_for_args()) as i32;
            }
            offset += PTR_SIZE;
            h
        } else {
            None
        };

        let ret_ptr = if func.returns_on_stack() {
            let p = VmPtr::from_raw(self.stack.read64(sp.offset(offset as i32)));
            offset += PTR_SIZE;
            Some(p)
        } else {
            None
        };

        let args_base = sp.offset(offset as i32);
        let pop_size = (offset + func.space_for_args()) as i32;

        let prev_calling = self.calling_system_function.replace(id);

        let outcome = {
            let func_for_call = Arc::clone(&func);
            let mut generic = Generic::new(self, func_for_call, args_base, receiver, ret_ptr);
            catch_unwind(AssertUnwindSafe(|| {
                native(&mut generic);
                (generic.take_return_value(), generic.take_object_return())
            }))
        };

        self.calling_system_function = prev_calling;

        match outcome {
            Ok((value, object)) => {
                if func.returns_object_handle() {
                    self.regs.object_register = object;
                    self.regs.object_type = func.return_type.object_type();
                } else if !func.returns_on_stack() {
                    self.regs.value_register = value;
                }
                self.release_system_args(&func, args_base);
            }
            Err(payload) => {
                let msg = self
                    .engine
                    .translate_app_exception(payload.as_ref())
                    .unwrap_or_else(|| "unhandled host panic".to_string());
                log::debug!("context {}: host exception: {}", self.id, msg);
                if self.status != ExecutionStatus::Exception {
                    self.set_internal_exception(ScriptException::ExceptionCaught(msg), true);
                }
                self.release_system_args(&func, args_base);
            }
        }

        pop_size
    }

    /// Destroy the argument area of a completed system call: by-value
    /// objects are destroyed and counted handles released
    fn release_system_args(&mut self, func: &Arc<ScriptFunction>, args_base: StackPtr) {
        let mut offset = 0i32;
        for p in &func.params {
            if p.ty.is_object() && !p.ty.is_reference() {
                let raw = self.stack.read64(args_base.offset(offset));
                if let Some(h) = VmPtr::from_raw(raw).as_object() {
                    let nocount = matches!(p.ty.kind, TypeKind::Handle(t)
                        if self.engine.type_info(t).map(|i| i.is_nocount).unwrap_or(false));
                    if !nocount {
                        self.engine.release(h);
                    }
                    self.stack.write64(args_base.offset(offset), 0);
                }
            }
            offset += p.ty.stack_size() as i32;
        }
    }

    // ========================================================================
    // Pending-call inspection
    // ========================================================================

    /// Scan forward from `pos` for the next call instruction and resolve
    /// the function it will invoke
    ///
    /// Used both by the unwinder (to release already-pushed arguments)
    /// and by the args-on-stack inspection API.
    pub(crate) fn find_next_called_function(
        &self,
        func: &Arc<ScriptFunction>,
        pos: u32,
    ) -> Option<(Arc<ScriptFunction>, u32)> {
        let sd = func.script_data()?;
        let code = &sd.bytecode;
        let mut pc = pos as usize;
        while pc < code.len() {
            let op = instr::opcode(code[pc])?;
            if op.is_call() {
                let callee = match op {
                    Opcode::Call | Opcode::CallSys | Opcode::CallIntf | Opcode::Thiscall1 => {
                        self.engine.function(FunctionId(code[pc + 1]))
                    }
                    Opcode::CallBnd => {
                        let import = FunctionId(code[pc + 1]);
                        // The imported signature describes the args even
                        // while unbound
                        self.engine.function(import)
                    }
                    Opcode::CallPtr => {
                        let var = instr::sw0(code[pc]);
                        self.funcdef_signature_of_var(func, var)
                    }
                    _ => None,
                };
                return callee.map(|f| (f, pc as u32));
            }
            pc += op.size_words() as usize;
        }
        None
    }

    /// The funcdef signature of a variable or parameter holding a
    /// function pointer
    pub(crate) fn funcdef_signature_of_var(
        &self,
        func: &Arc<ScriptFunction>,
        var_offset: i32,
    ) -> Option<Arc<ScriptFunction>> {
        let sd = func.script_data()?;
        let ty = sd
            .variables
            .iter()
            .find(|v| v.stack_offset == var_offset)
            .map(|v| v.ty)
            .or_else(|| {
                // Look through the parameters
                let mut pos = 0i32;
                if func.has_receiver() {
                    pos -= PTR_SIZE as i32;
                }
                if func.returns_on_stack() {
                    pos -= PTR_SIZE as i32;
                }
                for p in &func.params {
                    if pos == var_offset {
                        return Some(p.ty);
                    }
                    pos -= p.ty.stack_size() as i32;
                }
                None
            })?;
        match ty.kind {
            TypeKind::Funcdef(t) => {
                // A funcdef type's single method carries the signature
                let info = self.engine.type_info(t)?;
                info.methods
                    .first()
                    .and_then(|id| self.engine.function(*id))
            }
            _ => None,
        }
    }
}
