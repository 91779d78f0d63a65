//! Function descriptors and per-function metadata
//!
//! A [`ScriptFunction`] is the resolved unit of execution the engine hands
//! to a context: the bytecode itself plus everything the interpreter and
//! the unwinder need to know about it — parameter and return signatures,
//! the local variable table, try/catch ranges, and the object-variable
//! liveness event log replayed during exception cleanup.

/// Size in DWORD cells of a pointer-sized value on the operand stack
///
/// Pointers (object handles, stack addresses, global addresses) always
/// occupy two cells regardless of host pointer width.
pub const PTR_SIZE: u32 = 2;

/// Identifier of a registered type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Identifier of a registered or compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Scalar and object type kinds usable in signatures and variable tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float,
    Double,
    /// Object passed and stored by value
    Object(TypeId),
    /// Reference-counted object handle
    Handle(TypeId),
    /// First-class function pointer; values are reference counted
    Funcdef(TypeId),
    /// `?` parameter: a reference plus a type id describing what it
    /// points at
    Variant,
}

/// Reference passing mode of a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefModifier {
    None,
    In,
    Out,
    InOut,
}

/// A resolved data type as it appears in a signature or variable table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub kind: TypeKind,
    pub modifier: RefModifier,
    pub is_const: bool,
}

impl DataType {
    /// Plain value of the given kind
    pub const fn value(kind: TypeKind) -> Self {
        Self {
            kind,
            modifier: RefModifier::None,
            is_const: false,
        }
    }

    /// Reference to the given kind
    pub const fn reference(kind: TypeKind, modifier: RefModifier) -> Self {
        Self {
            kind,
            modifier,
            is_const: false,
        }
    }

    /// True when passed by reference
    #[inline]
    pub const fn is_reference(&self) -> bool {
        !matches!(self.modifier, RefModifier::None)
    }

    /// True for object kinds (by value, handle or funcdef)
    #[inline]
    pub const fn is_object(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object(_) | TypeKind::Handle(_) | TypeKind::Funcdef(_)
        )
    }

    /// True for reference-counted kinds (handles and funcdefs)
    #[inline]
    pub const fn is_counted(&self) -> bool {
        matches!(self.kind, TypeKind::Handle(_) | TypeKind::Funcdef(_))
    }

    /// The named object type, if any
    #[inline]
    pub const fn object_type(&self) -> Option<TypeId> {
        match self.kind {
            TypeKind::Object(t) | TypeKind::Handle(t) | TypeKind::Funcdef(t) => Some(t),
            _ => None,
        }
    }

    /// Cells this value occupies on the operand stack
    ///
    /// References and objects are passed as pointers; 64-bit scalars use
    /// two cells, everything else one. `Void` occupies nothing. Variant
    /// parameters carry a reference plus a type id word.
    pub const fn stack_size(&self) -> u32 {
        if matches!(self.kind, TypeKind::Variant) {
            return PTR_SIZE + 1;
        }
        if self.is_reference() || self.is_object() {
            return PTR_SIZE;
        }
        match self.kind {
            TypeKind::Void => 0,
            TypeKind::Int64 | TypeKind::Uint64 | TypeKind::Double => 2,
            _ => 1,
        }
    }

    /// Cells a value of this type occupies when stored in a variable slot
    pub const fn value_size(&self) -> u32 {
        match self.kind {
            TypeKind::Void => 0,
            TypeKind::Int64 | TypeKind::Uint64 | TypeKind::Double => 2,
            TypeKind::Object(_) | TypeKind::Handle(_) | TypeKind::Funcdef(_) => PTR_SIZE,
            TypeKind::Variant => PTR_SIZE + 1,
            _ => 1,
        }
    }
}

/// A named parameter in a function signature
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<String>,
    pub ty: DataType,
}

/// An entry in a function's local variable table
///
/// Offsets are frame-relative DWORD counts; the variable's first cell is
/// `frame_pointer - stack_offset`. Parameters appear first, at offsets
/// inside the argument area. Several variables may share a slot across
/// scopes; the declaration position tells them apart.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub ty: DataType,
    pub stack_offset: i32,
    /// Bytecode position of the declaration; 0 for parameters and
    /// temporaries live throughout the call
    pub declared_at: u32,
    /// True when the slot holds a handle to a heap allocation rather than
    /// the object constructed in place on the stack
    pub on_heap: bool,
}

/// One try/catch range of a function, in bytecode word positions
///
/// An exception raised while the program pointer lies in
/// `[try_pos, catch_pos)` transfers control to `catch_pos` with the stack
/// pointer restored to `frame - stack_size - variable_space`.
#[derive(Debug, Clone, Copy)]
pub struct TryCatchInfo {
    pub try_pos: u32,
    pub catch_pos: u32,
    pub stack_size: u32,
}

/// Liveness events for object variables, replayed during unwinding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveObjectEvent {
    /// A scope declares the variable; one count per simultaneous scope
    Declared,
    /// The object in the slot has been constructed
    Initialized,
    /// The object in the slot has been destroyed
    Uninitialized,
    /// A block begins; pairs with `BlockEnd` for scope-bounded replay
    BlockBegin,
    /// A block ends
    BlockEnd,
}

/// One entry of the object-variable liveness log
#[derive(Debug, Clone, Copy)]
pub struct ObjVarInfo {
    /// Bytecode word position the event is keyed to
    pub program_pos: u32,
    /// Frame-relative offset of the variable the event concerns; zero for
    /// block markers
    pub var_offset: i32,
    pub event: LiveObjectEvent,
}

/// Source line table entry; rows map bytecode ranges to script lines
#[derive(Debug, Clone, Copy)]
pub struct LineInfo {
    pub program_pos: u32,
    pub row: u32,
    pub col: u32,
}

/// What kind of callable a descriptor represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Compiled script function with bytecode
    Script,
    /// Host function using the native convention
    System,
    /// Host function using the generic (introspected) convention
    Generic,
    /// Interface method; resolved against the receiver's interface
    /// chunk of the vtable at call time
    Interface {
        vtable_index: u32,
    },
    /// Virtual method; resolved through the receiver's vtable
    Virtual {
        vtable_index: u32,
    },
    /// Imported function bound at runtime
    Imported,
}

/// Bytecode and metadata for script functions
#[derive(Debug, Clone, Default)]
pub struct ScriptData {
    pub bytecode: Vec<u32>,
    /// Cells of local variable space below the frame pointer
    pub variable_space: u32,
    /// Worst-case operand stack requirement, in cells
    pub stack_needed: u32,
    pub variables: Vec<Variable>,
    pub object_variable_info: Vec<ObjVarInfo>,
    pub try_catch_info: Vec<TryCatchInfo>,
    pub line_numbers: Vec<LineInfo>,
    pub section_name: String,
    /// Set for functions whose frames must not be cleaned during
    /// exception unwinding
    pub dont_cleanup_on_exception: bool,
}

/// A resolved function descriptor
#[derive(Debug, Clone)]
pub struct ScriptFunction {
    pub id: FunctionId,
    pub name: String,
    pub declaration: String,
    pub kind: FunctionKind,
    /// Receiver type for methods
    pub object_type: Option<TypeId>,
    pub params: Vec<Param>,
    pub return_type: DataType,
    /// Functions with the same signature share an id; used for interface
    /// method resolution
    pub signature_id: u32,
    /// Present for `FunctionKind::Script`
    pub script: Option<ScriptData>,
}

impl ScriptFunction {
    /// Cells the declared parameters occupy on the operand stack
    pub fn space_for_args(&self) -> u32 {
        self.params.iter().map(|p| p.ty.stack_size()).sum()
    }

    /// True for methods called with a receiver
    #[inline]
    pub fn has_receiver(&self) -> bool {
        self.object_type.is_some()
    }

    /// True when the return value is produced into caller-provided stack
    /// memory addressed by a hidden first argument
    #[inline]
    pub fn returns_on_stack(&self) -> bool {
        matches!(self.return_type.kind, TypeKind::Object(_)) && !self.return_type.is_reference()
    }

    /// True when the return value is carried in the object register
    #[inline]
    pub fn returns_object_handle(&self) -> bool {
        matches!(
            self.return_type.kind,
            TypeKind::Handle(_) | TypeKind::Funcdef(_)
        ) && !self.return_type.is_reference()
    }

    /// Total argument-area size: declared parameters plus the receiver
    /// slot and the hidden return pointer slot when present
    pub fn arguments_size(&self) -> u32 {
        let mut size = self.space_for_args();
        if self.has_receiver() {
            size += PTR_SIZE;
        }
        if self.returns_on_stack() {
            size += PTR_SIZE;
        }
        size
    }

    /// Script metadata, for functions that have bytecode
    #[inline]
    pub fn script_data(&self) -> Option<&ScriptData> {
        self.script.as_ref()
    }

    /// Source line and column for a bytecode position
    ///
    /// Rows cover the range from their position up to the next row's
    /// position; the lookup returns the last row at or before `pos`.
    pub fn find_line(&self, pos: u32) -> Option<(u32, u32)> {
        let lines = &self.script.as_ref()?.line_numbers;
        if lines.is_empty() {
            return None;
        }
        let idx = match lines.binary_search_by_key(&pos, |l| l.program_pos) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        Some((lines[idx].row, lines[idx].col))
    }

    /// The section (source file) this function was declared in
    pub fn section_name(&self) -> Option<&str> {
        self.script.as_ref().map(|s| s.section_name.as_str())
    }

    /// The innermost try/catch range covering `pos`, if any
    ///
    /// Ranges cover `[try_pos, catch_pos)`. When ranges nest, the one with
    /// the latest `try_pos` wins.
    pub fn find_try_catch(&self, pos: u32) -> Option<TryCatchInfo> {
        let script = self.script.as_ref()?;
        script
            .try_catch_info
            .iter()
            .filter(|tc| pos >= tc.try_pos && pos < tc.catch_pos)
            .max_by_key(|tc| tc.try_pos)
            .copied()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_t() -> DataType {
        DataType::value(TypeKind::Int32)
    }

    fn func_with_lines(lines: Vec<LineInfo>) -> ScriptFunction {
        ScriptFunction {
            id: FunctionId(1),
            name: "f".into(),
            declaration: "void f()".into(),
            kind: FunctionKind::Script,
            object_type: None,
            params: vec![],
            return_type: DataType::value(TypeKind::Void),
            signature_id: 0,
            script: Some(ScriptData {
                line_numbers: lines,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_stack_sizes() {
        assert_eq!(i32_t().stack_size(), 1);
        assert_eq!(DataType::value(TypeKind::Double).stack_size(), 2);
        assert_eq!(DataType::value(TypeKind::Bool).stack_size(), 1);
        assert_eq!(
            DataType::reference(TypeKind::Int32, RefModifier::InOut).stack_size(),
            PTR_SIZE
        );
        assert_eq!(
            DataType::value(TypeKind::Handle(TypeId(7))).stack_size(),
            PTR_SIZE
        );
    }

    #[test]
    fn test_arguments_size_with_receiver_and_return() {
        let f = ScriptFunction {
            id: FunctionId(3),
            name: "m".into(),
            declaration: "Obj m(int, double)".into(),
            kind: FunctionKind::Script,
            object_type: Some(TypeId(1)),
            params: vec![
                Param {
                    name: None,
                    ty: i32_t(),
                },
                Param {
                    name: None,
                    ty: DataType::value(TypeKind::Double),
                },
            ],
            return_type: DataType::value(TypeKind::Object(TypeId(2))),
            signature_id: 0,
            script: None,
        };
        assert!(f.has_receiver());
        assert!(f.returns_on_stack());
        // 1 (int) + 2 (double) + 2 (this) + 2 (return ptr)
        assert_eq!(f.arguments_size(), 7);
    }

    #[test]
    fn test_find_line_picks_covering_row() {
        let f = func_with_lines(vec![
            LineInfo {
                program_pos: 0,
                row: 10,
                col: 1,
            },
            LineInfo {
                program_pos: 4,
                row: 11,
                col: 5,
            },
            LineInfo {
                program_pos: 9,
                row: 12,
                col: 1,
            },
        ]);
        assert_eq!(f.find_line(0), Some((10, 1)));
        assert_eq!(f.find_line(3), Some((10, 1)));
        assert_eq!(f.find_line(4), Some((11, 5)));
        assert_eq!(f.find_line(8), Some((11, 5)));
        assert_eq!(f.find_line(100), Some((12, 1)));
    }

    #[test]
    fn test_find_try_catch_prefers_innermost() {
        let mut f = func_with_lines(vec![]);
        f.script.as_mut().unwrap().try_catch_info = vec![
            TryCatchInfo {
                try_pos: 0,
                catch_pos: 100,
                stack_size: 0,
            },
            TryCatchInfo {
                try_pos: 10,
                catch_pos: 50,
                stack_size: 4,
            },
        ];
        assert_eq!(f.find_try_catch(5).unwrap().catch_pos, 100);
        assert_eq!(f.find_try_catch(20).unwrap().catch_pos, 50);
        assert_eq!(f.find_try_catch(60).unwrap().catch_pos, 100);
        assert!(f.find_try_catch(100).is_none());
    }
}
