//! Sable bytecode definitions
//!
//! This crate defines the instruction set of the Sable virtual machine and
//! the function metadata the execution engine consumes:
//! - [`Opcode`] — the ~200 single-byte instructions and their encoded sizes
//! - [`instr`] — instruction word packing and the [`BytecodeWriter`] assembler
//! - [`ScriptFunction`] — resolved function descriptors: bytecode,
//!   signatures, variable tables, try/catch ranges and the object-variable
//!   liveness log
//!
//! The interpreter itself lives in `sable-engine`; this crate has no
//! execution machinery and no engine dependencies, so compiler backends
//! and tooling can depend on it alone.

pub mod function;
pub mod instr;
pub mod opcode;

pub use function::{
    DataType, FunctionId, FunctionKind, LineInfo, LiveObjectEvent, ObjVarInfo, Param,
    RefModifier, ScriptData, ScriptFunction, TryCatchInfo, TypeId, TypeKind, Variable, PTR_SIZE,
};
pub use instr::{BytecodeWriter, Label};
pub use opcode::{Opcode, OperandLayout};
