//! Shared helpers for the engine integration suites
//!
//! Functions are assembled directly with the bytecode writer, the same
//! way the compiler backend emits them.

// Each suite uses a different slice of these helpers
#![allow(dead_code)]

use sable_bytecode::{
    BytecodeWriter, DataType, FunctionId, FunctionKind, LineInfo, ObjVarInfo, Param,
    ScriptData, ScriptFunction, TryCatchInfo, TypeKind, Variable,
};
use sable_engine::Engine;
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Build a `ScriptFunction` descriptor around assembled bytecode
pub struct FunctionBuilder {
    pub name: String,
    pub params: Vec<DataType>,
    pub return_type: DataType,
    pub object_type: Option<sable_bytecode::TypeId>,
    pub variables: Vec<Variable>,
    pub variable_space: u32,
    pub stack_needed: u32,
    pub line_numbers: Vec<LineInfo>,
    pub try_catch_info: Vec<TryCatchInfo>,
    pub object_variable_info: Vec<ObjVarInfo>,
    pub signature_id: u32,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            params: Vec::new(),
            return_type: DataType::value(TypeKind::Void),
            object_type: None,
            variables: Vec::new(),
            variable_space: 0,
            stack_needed: 32,
            line_numbers: Vec::new(),
            try_catch_info: Vec::new(),
            object_variable_info: Vec::new(),
            signature_id: 0,
        }
    }

    pub fn params(mut self, params: &[TypeKind]) -> Self {
        self.params = params.iter().map(|k| DataType::value(*k)).collect();
        self
    }

    pub fn returns(mut self, kind: TypeKind) -> Self {
        self.return_type = DataType::value(kind);
        self
    }

    pub fn receiver(mut self, ty: sable_bytecode::TypeId) -> Self {
        self.object_type = Some(ty);
        self
    }

    pub fn locals(mut self, space: u32) -> Self {
        self.variable_space = space;
        self
    }

    pub fn var(mut self, name: &str, kind: TypeKind, offset: i32, on_heap: bool) -> Self {
        self.variables.push(Variable {
            name: name.to_string(),
            ty: DataType::value(kind),
            stack_offset: offset,
            declared_at: 0,
            on_heap,
        });
        self
    }

    pub fn line(mut self, pos: u32, row: u32, col: u32) -> Self {
        self.line_numbers.push(LineInfo {
            program_pos: pos,
            row,
            col,
        });
        self
    }

    pub fn try_catch(mut self, try_pos: u32, catch_pos: u32, stack_size: u32) -> Self {
        self.try_catch_info.push(TryCatchInfo {
            try_pos,
            catch_pos,
            stack_size,
        });
        self
    }

    pub fn signature(mut self, id: u32) -> Self {
        self.signature_id = id;
        self
    }

    pub fn kind(self, kind: FunctionKind, engine: &Arc<Engine>, code: BytecodeWriter) -> FunctionId {
        let bytecode = code.finish();
        let func = ScriptFunction {
            id: FunctionId(0),
            name: self.name.clone(),
            declaration: self.name,
            kind,
            object_type: self.object_type,
            params: self
                .params
                .into_iter()
                .map(|ty| Param { name: None, ty })
                .collect(),
            return_type: self.return_type,
            signature_id: self.signature_id,
            script: Some(ScriptData {
                bytecode,
                variable_space: self.variable_space,
                stack_needed: self.stack_needed,
                variables: self.variables,
                object_variable_info: self.object_variable_info,
                try_catch_info: self.try_catch_info,
                line_numbers: self.line_numbers,
                section_name: "test.sbl".to_string(),
                dont_cleanup_on_exception: false,
            }),
        };
        engine.register_function(func)
    }

    /// Register as an ordinary script function
    pub fn build(self, engine: &Arc<Engine>, code: BytecodeWriter) -> FunctionId {
        self.kind(FunctionKind::Script, engine, code)
    }
}

/// Register a host function with the native calling convention
pub fn system_function(
    engine: &Arc<Engine>,
    name: &str,
    params: &[DataType],
    return_type: DataType,
    native: sable_engine::NativeFn,
) -> FunctionId {
    let func = ScriptFunction {
        id: FunctionId(0),
        name: name.to_string(),
        declaration: name.to_string(),
        kind: FunctionKind::System,
        object_type: None,
        params: params
            .iter()
            .map(|ty| Param { name: None, ty: *ty })
            .collect(),
        return_type,
        signature_id: 0,
        script: None,
    };
    engine.register_system_function(func, native)
}
