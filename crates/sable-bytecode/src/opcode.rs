//! Bytecode opcodes for the Sable VM
//!
//! This module defines the complete instruction set executed by the
//! interpreter in `sable-engine`. All instructions are encoded as 32-bit
//! words: the low byte of the first word is the opcode, the upper 16 bits
//! hold the primary frame-relative slot operand when the instruction has
//! one, and up to two further words carry additional slot operands and
//! immediates (see [`OperandLayout`]).
//!
//! Opcodes are organized into numeric categories:
//! - 0x00-0x14: Stack moves & constants
//! - 0x18-0x33: Register / variable moves
//! - 0x38-0x3E: Logical tests
//! - 0x40-0x49: Branches
//! - 0x4C-0x55: Three-way compares
//! - 0x58-0x65: Increment / decrement
//! - 0x68-0x72: 32-bit integer arithmetic
//! - 0x74-0x7B: 64-bit integer arithmetic
//! - 0x7E-0x86: 32-bit float arithmetic
//! - 0x88-0x8D: 64-bit float arithmetic
//! - 0x90-0x96: Exponentiation
//! - 0x98-0xA6: Bit operations (32- and 64-bit)
//! - 0xA8-0xC4: Numeric conversions
//! - 0xC8-0xD0: Calls & control
//! - 0xD4-0xE2: Object lifecycle
//! - 0xE6-0xE9: Initialization lists

/// Operand layout of an encoded instruction
///
/// `V` operands are signed 16-bit frame-relative slot offsets; `W` operands
/// are full 32-bit immediate words (constants, ids, global indices, branch
/// offsets); `Q` is a 64-bit immediate occupying two words.
///
/// Packing: the first `V` operand lives in the upper 16 bits of word 0,
/// the second and third in the low/high halves of word 1. `W` and `Q`
/// immediates follow in their own words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLayout {
    /// No operands — 1 word
    None,
    /// One slot operand — 1 word
    V,
    /// Two slot operands — 2 words
    Vv,
    /// Three slot operands — 2 words
    Vvv,
    /// One immediate word — 2 words
    W,
    /// One slot operand + one immediate word — 2 words
    Vw,
    /// One 64-bit immediate — 3 words
    Q,
    /// One slot operand + one 64-bit immediate — 3 words
    Vq,
    /// Two slot operands + one immediate word — 3 words
    Vvw,
    /// Two immediate words — 3 words
    Ww,
    /// One slot operand + two immediate words — 3 words
    Vww,
}

impl OperandLayout {
    /// Encoded size in 32-bit words, including the opcode word
    #[inline]
    pub const fn size_words(self) -> u32 {
        match self {
            OperandLayout::None | OperandLayout::V => 1,
            OperandLayout::Vv
            | OperandLayout::Vvv
            | OperandLayout::W
            | OperandLayout::Vw => 2,
            OperandLayout::Q
            | OperandLayout::Vq
            | OperandLayout::Vvw
            | OperandLayout::Ww
            | OperandLayout::Vww => 3,
        }
    }
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$meta:meta])*
            $name:ident = $value:expr, $layout:ident;
        )*
    ) => {
        /// Bytecode opcode enumeration
        ///
        /// Each opcode occupies the low byte of its first instruction word.
        /// The encoded size of every instruction is fixed by its
        /// [`OperandLayout`]; the interpreter asserts in debug builds that
        /// each handler advances the program pointer by exactly that size
        /// (branches and calls excepted).
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $(
                $(#[$meta])*
                $name = $value,
            )*
        }

        impl Opcode {
            /// Decode an opcode from its byte value
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $( $value => Some(Self::$name), )*
                    _ => None,
                }
            }

            /// Operand layout of this opcode
            pub const fn layout(self) -> OperandLayout {
                match self {
                    $( Self::$name => OperandLayout::$layout, )*
                }
            }

            /// Upper-case mnemonic, for disassembly and traces
            pub const fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }

            /// All defined opcodes, in declaration order
            pub const ALL: &'static [Opcode] = &[ $( Self::$name, )* ];
        }
    };
}

define_opcodes! {
    // ===== Stack moves & constants (0x00-0x14) =====

    /// Discard a pointer-sized value (2 cells) from the stack top
    PopPtr = 0x00, None;
    /// Push a null pointer (2 cells)
    PushNull = 0x01, None;
    /// Push a 32-bit constant
    PushC32 = 0x02, W;
    /// Push a 64-bit constant
    PushC64 = 0x03, Q;
    /// Push the 32-bit value of a local variable
    PushV32 = 0x04, V;
    /// Push the 64-bit value of a local variable
    PushV64 = 0x05, V;
    /// Push the pointer value held in a local variable
    PushVPtr = 0x06, V;
    /// Push the pointer held in the value register
    PushRPtr = 0x07, None;
    /// Pop a pointer from the stack into the value register
    PopRPtr = 0x08, None;
    /// Push the 32-bit value of a global variable
    PushG32 = 0x09, W;
    /// Push the address of a global variable
    PushGPtr = 0x0A, W;
    /// Push the address of a local variable (frame pointer - offset)
    PushFrame = 0x0B, V;
    /// Push the address of a global variable (alias used for out-params)
    PushGlobalAddr = 0x0C, W;
    /// Push a variable index to be resolved later by GetObj/GetRef
    VarIdx = 0x0D, V;
    /// Push a function pointer object for the given function id
    FuncPtr = 0x0E, W;
    /// Push a type-info reference for the given type id
    ObjTypePush = 0x0F, W;
    /// Push a 32-bit type id constant
    TypeIdPush = 0x10, W;
    /// Swap the two pointer-sized values at the stack top
    SwapPtr = 0x11, None;
    /// Replace the address at the stack top with the pointer it points to
    RdsPtr = 0x12, None;
    /// Clear the upper bits of the value register after a byte-sized test
    ClrHi = 0x13, None;
    /// Deprecated string-constant instruction; asserts and does nothing
    Str = 0x14, W;

    // ===== Register / variable moves (0x18-0x33) =====

    /// Store an 8-bit immediate into a variable (upper bits cleared)
    SetV1 = 0x18, Vw;
    /// Store a 16-bit immediate into a variable (upper bits cleared)
    SetV2 = 0x19, Vw;
    /// Store a 32-bit immediate into a variable
    SetV32 = 0x1A, Vw;
    /// Store a 64-bit immediate into a variable
    SetV64 = 0x1B, Vq;
    /// Store a 32-bit immediate into a global variable
    SetG32 = 0x1C, Ww;
    /// Zero a pointer-sized variable
    ClrVPtr = 0x1D, V;
    /// Copy a 32-bit value between variables
    CpyVtoV32 = 0x1E, Vv;
    /// Copy a 64-bit value between variables
    CpyVtoV64 = 0x1F, Vv;
    /// Copy a 32-bit variable into the value register
    CpyVtoR32 = 0x20, V;
    /// Copy a 64-bit variable into the value register
    CpyVtoR64 = 0x21, V;
    /// Copy the low 32 bits of the value register into a variable
    CpyRtoV32 = 0x22, V;
    /// Copy the value register into a 64-bit variable
    CpyRtoV64 = 0x23, V;
    /// Copy a 32-bit variable into a global
    CpyVtoG32 = 0x24, Vw;
    /// Copy a 32-bit global into a variable
    CpyGtoV32 = 0x25, Vw;
    /// Load a global's address into the value register and its value into a variable
    LdGRdR32 = 0x26, Vw;
    /// Load a global's address into the value register
    Ldg = 0x27, W;
    /// Load a local variable's address into the value register
    Ldv = 0x28, V;
    /// Load `this` + field offset into the value register; null-checks `this`
    LoadThisR = 0x29, V;
    /// Add a field offset to the object pointer in the value register; null-checks it
    LoadRObjR = 0x2A, V;
    /// Load an object variable + field offset into the value register; null-checks it
    LoadVObjR = 0x2B, Vv;
    /// Write the low 8 bits of a variable through the pointer in the value register
    WrtV1 = 0x2C, V;
    /// Write the low 16 bits of a variable through the pointer in the value register
    WrtV2 = 0x2D, V;
    /// Write 32 bits of a variable through the pointer in the value register
    WrtV4 = 0x2E, V;
    /// Write 64 bits of a variable through the pointer in the value register
    WrtV8 = 0x2F, V;
    /// Read 8 bits through the pointer in the value register into a variable
    RdR1 = 0x30, V;
    /// Read 16 bits through the pointer in the value register into a variable
    RdR2 = 0x31, V;
    /// Read 32 bits through the pointer in the value register into a variable
    RdR4 = 0x32, V;
    /// Read 64 bits through the pointer in the value register into a variable
    RdR8 = 0x33, V;

    // ===== Logical tests (0x38-0x3E) =====

    /// Logical NOT of a 32-bit variable in place
    Not = 0x38, V;
    /// value register = (low 32 bits == 0)
    Tz = 0x39, None;
    /// value register = (low 32 bits != 0)
    Tnz = 0x3A, None;
    /// value register = (low 32 bits < 0)
    Ts = 0x3B, None;
    /// value register = (low 32 bits >= 0)
    Tns = 0x3C, None;
    /// value register = (low 32 bits > 0)
    Tp = 0x3D, None;
    /// value register = (low 32 bits <= 0)
    Tnp = 0x3E, None;

    // ===== Branches (0x40-0x49) =====

    /// Unconditional relative jump
    Jmp = 0x40, W;
    /// Jump if the low 32 bits of the value register are zero
    Jz = 0x41, W;
    /// Jump if the low 32 bits of the value register are not zero
    Jnz = 0x42, W;
    /// Jump if negative
    Js = 0x43, W;
    /// Jump if not negative
    Jns = 0x44, W;
    /// Jump if positive
    Jp = 0x45, W;
    /// Jump if not positive
    Jnp = 0x46, W;
    /// Jump if the low byte of the value register is zero
    JLowZ = 0x47, W;
    /// Jump if the low byte of the value register is not zero
    JLowNz = 0x48, W;
    /// Indexed jump into a table of Jmp instructions
    JmpP = 0x49, V;

    // ===== Three-way compares (0x4C-0x55) =====

    /// Signed 32-bit compare into the value register (-1, 0, +1)
    CmpI = 0x4C, Vv;
    /// Unsigned 32-bit compare
    CmpU = 0x4D, Vv;
    /// 32-bit float compare
    CmpF = 0x4E, Vv;
    /// 64-bit float compare
    CmpD = 0x4F, Vv;
    /// Signed 64-bit compare
    CmpI64 = 0x50, Vv;
    /// Unsigned 64-bit compare
    CmpU64 = 0x51, Vv;
    /// Pointer compare, for `is` / `!is` tests
    CmpPtr = 0x52, Vv;
    /// Signed 32-bit compare against an immediate
    CmpIi = 0x53, Vw;
    /// Unsigned 32-bit compare against an immediate
    CmpIu = 0x54, Vw;
    /// 32-bit float compare against an immediate
    CmpIf = 0x55, Vw;

    // ===== Increment / decrement through the value register (0x58-0x65) =====

    /// Increment the i8 pointed to by the value register
    IncI8 = 0x58, None;
    /// Decrement the i8 pointed to by the value register
    DecI8 = 0x59, None;
    /// Increment the i16 pointed to by the value register
    IncI16 = 0x5A, None;
    /// Decrement the i16 pointed to by the value register
    DecI16 = 0x5B, None;
    /// Increment the i32 pointed to by the value register
    IncI32 = 0x5C, None;
    /// Decrement the i32 pointed to by the value register
    DecI32 = 0x5D, None;
    /// Increment the i64 pointed to by the value register
    IncI64 = 0x5E, None;
    /// Decrement the i64 pointed to by the value register
    DecI64 = 0x5F, None;
    /// Increment the f32 pointed to by the value register
    IncF = 0x60, None;
    /// Decrement the f32 pointed to by the value register
    DecF = 0x61, None;
    /// Increment the f64 pointed to by the value register
    IncD = 0x62, None;
    /// Decrement the f64 pointed to by the value register
    DecD = 0x63, None;
    /// Increment a 32-bit variable in place
    IncVi = 0x64, V;
    /// Decrement a 32-bit variable in place
    DecVi = 0x65, V;

    // ===== 32-bit integer arithmetic (0x68-0x72) =====

    /// dst = a + b (i32, wrapping)
    AddI = 0x68, Vvv;
    /// dst = a - b (i32, wrapping)
    SubI = 0x69, Vvv;
    /// dst = a * b (i32, wrapping)
    MulI = 0x6A, Vvv;
    /// dst = a / b (i32); raises DivideByZero / DivideOverflow
    DivI = 0x6B, Vvv;
    /// dst = a % b (i32); raises DivideByZero / DivideOverflow
    ModI = 0x6C, Vvv;
    /// dst = a / b (u32); raises DivideByZero
    DivU = 0x6D, Vvv;
    /// dst = a % b (u32); raises DivideByZero
    ModU = 0x6E, Vvv;
    /// dst = -src (i32, wrapping)
    NegI = 0x6F, V;
    /// dst = src + imm (i32, wrapping)
    AddIi = 0x70, Vvw;
    /// dst = src - imm (i32, wrapping)
    SubIi = 0x71, Vvw;
    /// dst = src * imm (i32, wrapping)
    MulIi = 0x72, Vvw;

    // ===== 64-bit integer arithmetic (0x74-0x7B) =====

    /// dst = a + b (i64, wrapping)
    AddI64 = 0x74, Vvv;
    /// dst = a - b (i64, wrapping)
    SubI64 = 0x75, Vvv;
    /// dst = a * b (i64, wrapping)
    MulI64 = 0x76, Vvv;
    /// dst = a / b (i64); raises DivideByZero / DivideOverflow
    DivI64 = 0x77, Vvv;
    /// dst = a % b (i64); raises DivideByZero / DivideOverflow
    ModI64 = 0x78, Vvv;
    /// dst = a / b (u64); raises DivideByZero
    DivU64 = 0x79, Vvv;
    /// dst = a % b (u64); raises DivideByZero
    ModU64 = 0x7A, Vvv;
    /// dst = -src (i64, wrapping)
    NegI64 = 0x7B, V;

    // ===== 32-bit float arithmetic (0x7E-0x86) =====

    /// dst = a + b (f32)
    AddF = 0x7E, Vvv;
    /// dst = a - b (f32)
    SubF = 0x7F, Vvv;
    /// dst = a * b (f32)
    MulF = 0x80, Vvv;
    /// dst = a / b (f32)
    DivF = 0x81, Vvv;
    /// dst = a % b (f32)
    ModF = 0x82, Vvv;
    /// dst = -src (f32)
    NegF = 0x83, V;
    /// dst = src + imm (f32)
    AddIf = 0x84, Vvw;
    /// dst = src - imm (f32)
    SubIf = 0x85, Vvw;
    /// dst = src * imm (f32)
    MulIf = 0x86, Vvw;

    // ===== 64-bit float arithmetic (0x88-0x8D) =====

    /// dst = a + b (f64)
    AddD = 0x88, Vvv;
    /// dst = a - b (f64)
    SubD = 0x89, Vvv;
    /// dst = a * b (f64)
    MulD = 0x8A, Vvv;
    /// dst = a / b (f64)
    DivD = 0x8B, Vvv;
    /// dst = a % b (f64)
    ModD = 0x8C, Vvv;
    /// dst = -src (f64)
    NegD = 0x8D, V;

    // ===== Exponentiation (0x90-0x96) =====

    /// dst = a ** b (i32); raises PowOverflow
    PowI = 0x90, Vvv;
    /// dst = a ** b (u32); raises PowOverflow
    PowU = 0x91, Vvv;
    /// dst = a ** b (f32); raises PowOverflow on infinite result
    PowF = 0x92, Vvv;
    /// dst = a ** b (f64); raises PowOverflow on infinite result
    PowD = 0x93, Vvv;
    /// dst = a ** b (f64 base, i32 exponent); raises PowOverflow
    PowDi = 0x94, Vvv;
    /// dst = a ** b (i64); raises PowOverflow
    PowI64 = 0x95, Vvv;
    /// dst = a ** b (u64); raises PowOverflow
    PowU64 = 0x96, Vvv;

    // ===== 32-bit bit operations (0x98-0x9E) =====

    /// Bitwise NOT of a 32-bit variable in place
    BNot = 0x98, V;
    /// dst = a & b
    BAnd = 0x99, Vvv;
    /// dst = a | b
    BOr = 0x9A, Vvv;
    /// dst = a ^ b
    BXor = 0x9B, Vvv;
    /// dst = a << b
    BSll = 0x9C, Vvv;
    /// dst = a >> b (logical)
    BSrl = 0x9D, Vvv;
    /// dst = a >> b (arithmetic)
    BSra = 0x9E, Vvv;

    // ===== 64-bit bit operations (0xA0-0xA6) =====

    /// Bitwise NOT of a 64-bit variable in place
    BNot64 = 0xA0, V;
    /// dst = a & b (64-bit)
    BAnd64 = 0xA1, Vvv;
    /// dst = a | b (64-bit)
    BOr64 = 0xA2, Vvv;
    /// dst = a ^ b (64-bit)
    BXor64 = 0xA3, Vvv;
    /// dst = a << b (64-bit)
    BSll64 = 0xA4, Vvv;
    /// dst = a >> b (64-bit, logical)
    BSrl64 = 0xA5, Vvv;
    /// dst = a >> b (64-bit, arithmetic)
    BSra64 = 0xA6, Vvv;

    // ===== In-place conversions (0xA8-0xB1) =====

    /// i32 -> f32 in place
    ItoF = 0xA8, V;
    /// f32 -> i32 in place (truncating)
    FtoI = 0xA9, V;
    /// u32 -> f32 in place
    UtoF = 0xAA, V;
    /// f32 -> u32 in place (truncating)
    FtoU = 0xAB, V;
    /// sign-extend i8 -> i32 in place
    SbToI = 0xAC, V;
    /// sign-extend i16 -> i32 in place
    SwToI = 0xAD, V;
    /// zero-extend u8 -> u32 in place
    UbToI = 0xAE, V;
    /// zero-extend u16 -> u32 in place
    UwToI = 0xAF, V;
    /// truncate i32 -> i8 in place
    ItoB = 0xB0, V;
    /// truncate i32 -> i16 in place
    ItoW = 0xB1, V;

    // ===== Widening / narrowing conversions (0xB4-0xC4) =====

    /// i64 -> i32
    I64toI = 0xB4, Vv;
    /// u32 -> i64
    UtoI64 = 0xB5, Vv;
    /// i32 -> i64
    ItoI64 = 0xB6, Vv;
    /// f32 -> f64
    FtoD = 0xB7, Vv;
    /// f64 -> f32
    DtoF = 0xB8, Vv;
    /// f32 -> u64 (truncating)
    FtoU64 = 0xB9, Vv;
    /// u64 -> f32
    U64toF = 0xBA, Vv;
    /// i64 -> f32
    I64toF = 0xBB, Vv;
    /// f32 -> i64 (truncating)
    FtoI64 = 0xBC, Vv;
    /// f64 -> i64 (truncating)
    DtoI64 = 0xBD, Vv;
    /// f64 -> u64 (truncating)
    DtoU64 = 0xBE, Vv;
    /// i64 -> f64
    I64toD = 0xBF, Vv;
    /// u64 -> f64
    U64toD = 0xC0, Vv;
    /// i32 -> f64
    ItoD = 0xC1, Vv;
    /// f64 -> i32 (truncating)
    DtoI = 0xC2, Vv;
    /// u32 -> f64
    UtoD = 0xC3, Vv;
    /// f64 -> u32 (truncating)
    DtoU = 0xC4, Vv;

    // ===== Calls & control (0xC8-0xD0) =====

    /// Call a script function by id
    Call = 0xC8, W;
    /// Call a system (host) function by id
    CallSys = 0xC9, W;
    /// Call a bound imported function by id
    CallBnd = 0xCA, W;
    /// Call an interface or virtual method, resolved from the receiver
    CallIntf = 0xCB, W;
    /// Call through a function pointer or delegate held in a variable
    CallPtr = 0xCC, V;
    /// Fast path for `T& f(i32)`-shaped system methods
    Thiscall1 = 0xCD, W;
    /// Return from the current function, popping the argument area
    Ret = 0xCE, W;
    /// Cooperative yield point; honours line callbacks and suspend requests
    Suspend = 0xCF, None;
    /// Transfer control to the function's JIT body when one is attached
    JitEntry = 0xD0, W;

    // ===== Object lifecycle (0xD4-0xE2) =====

    /// Allocate an object of a type; runs the constructor when one is given
    Alloc = 0xD4, Ww;
    /// Release / destroy the object held in a variable and zero the slot
    Free = 0xD5, Vw;
    /// Move an object from a variable into the object register
    LoadObj = 0xD6, V;
    /// Move the object register into a variable
    StoreObj = 0xD7, V;
    /// Exchange a variable index on the stack for the object it names
    GetObj = 0xD8, V;
    /// Release the old and addref the new handle at the stack top
    RefCpy = 0xD9, W;
    /// Release the old and addref the new handle in a variable
    RefCpyV = 0xDA, Vw;
    /// Raise NullPointerAccess if the stack top holds a null pointer
    ChkRef = 0xDB, None;
    /// Resolve a variable index on the stack to the address of its object
    GetObjRef = 0xDC, V;
    /// Resolve a variable index on the stack to the variable's address
    GetRef = 0xDD, V;
    /// Raise NullPointerAccess if the pointer below the stack top is null
    ChkRefS = 0xDE, None;
    /// Raise NullPointerAccess if a pointer variable is null
    ChkNullV = 0xDF, V;
    /// Raise NullPointerAccess if the pointer at sp+offset is null
    ChkNullS = 0xE0, V;
    /// Cast the object register to a target type; null on failure
    Cast = 0xE1, W;
    /// Add a field offset to the object pointer at the stack top; null-checks it
    AddSi = 0xE2, Vw;

    // ===== Initialization lists (0xE6-0xE9) =====

    /// Allocate a raw list buffer of the given size into a variable
    AllocMem = 0xE6, Vw;
    /// Write a repeat count into a list buffer
    SetListSize = 0xE7, Vww;
    /// Push the address of a list buffer element
    PushListElmnt = 0xE8, Vw;
    /// Write a type id into a list buffer
    SetListType = 0xE9, Vww;
}

impl Opcode {
    /// Encoded size of this instruction in 32-bit words
    #[inline]
    pub const fn size_words(self) -> u32 {
        self.layout().size_words()
    }

    /// True for instructions that modify the program pointer themselves
    ///
    /// These are exempt from the debug-build advance check.
    pub const fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::Jmp
                | Opcode::Jz
                | Opcode::Jnz
                | Opcode::Js
                | Opcode::Jns
                | Opcode::Jp
                | Opcode::Jnp
                | Opcode::JLowZ
                | Opcode::JLowNz
                | Opcode::JmpP
                | Opcode::Call
                | Opcode::CallSys
                | Opcode::CallBnd
                | Opcode::CallIntf
                | Opcode::CallPtr
                | Opcode::Thiscall1
                | Opcode::Ret
                | Opcode::Suspend
                | Opcode::JitEntry
                | Opcode::Alloc
        )
    }

    /// True for the call instructions that consume pushed arguments
    pub const fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::Call
                | Opcode::CallSys
                | Opcode::CallBnd
                | Opcode::CallIntf
                | Opcode::CallPtr
                | Opcode::Thiscall1
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
