//! Tagged VM pointers
//!
//! The operand stack holds 32-bit cells; pointer-sized values occupy two
//! cells and carry a [`VmPtr`]. A `VmPtr` is a tagged 64-bit word naming
//! one of the address spaces the VM can reach:
//!
//! ```text
//! bits 56..64  tag: 0 = null, 1 = stack, 2 = global, 3 = object, 4 = type
//! stack:   bits 26..32 block index, bits 0..26 cell offset
//! global:  bits 0..32 global cell index
//! object:  bits 32..56 field cell offset, bits 0..32 heap handle
//! type:    bits 0..32 type id
//! ```
//!
//! The all-zero word is the null pointer, so a zeroed stack slot reads as
//! null. Pointer equality and the three-way pointer compare operate on
//! the raw word.

use sable_bytecode::TypeId;
use std::num::NonZeroU32;

const TAG_SHIFT: u32 = 56;
const TAG_STACK: u64 = 1;
const TAG_GLOBAL: u64 = 2;
const TAG_OBJECT: u64 = 3;
const TAG_TYPE: u64 = 4;

const STACK_BLOCK_SHIFT: u32 = 26;
const STACK_OFFSET_MASK: u32 = (1 << STACK_BLOCK_SHIFT) - 1;

/// Handle to an object in the engine heap
///
/// Handles are never zero; the zero word is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub NonZeroU32);

impl ObjectHandle {
    /// Construct from a raw non-zero slab index
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(ObjectHandle)
    }

    /// Raw slab index
    #[inline]
    pub fn raw(self) -> u32 {
        self.0.get()
    }
}

/// A position on the segmented operand stack
///
/// `cell` indexes into block `block`; lower cells are lower addresses.
/// The stack grows downward, so pushing decreases `cell`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackPtr {
    pub block: u32,
    pub cell: u32,
}

impl StackPtr {
    /// Pack into the 32-bit serialized form: block in the upper 6 bits,
    /// cell offset in the lower 26
    #[inline]
    pub fn serialize(self) -> u32 {
        debug_assert!(self.block < (1 << (32 - STACK_BLOCK_SHIFT)));
        debug_assert!(self.cell <= STACK_OFFSET_MASK);
        (self.block << STACK_BLOCK_SHIFT) | self.cell
    }

    /// Reverse of [`Self::serialize`]; validity against actual block
    /// bounds is checked by the arena
    #[inline]
    pub fn deserialize(v: u32) -> Self {
        StackPtr {
            block: v >> STACK_BLOCK_SHIFT,
            cell: v & STACK_OFFSET_MASK,
        }
    }

    /// The position `n` cells toward higher addresses
    #[inline]
    pub fn offset(self, n: i32) -> StackPtr {
        StackPtr {
            block: self.block,
            cell: (self.cell as i64 + n as i64) as u32,
        }
    }
}

/// Decoded form of a [`VmPtr`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrKind {
    Null,
    Stack(StackPtr),
    Global(u32),
    Object { handle: ObjectHandle, offset: u32 },
    Type(TypeId),
}

/// Tagged pointer word as stored in two stack cells or the value register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmPtr(u64);

impl VmPtr {
    /// The null pointer
    #[inline]
    pub const fn null() -> Self {
        VmPtr(0)
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer to a stack cell
    #[inline]
    pub fn stack(ptr: StackPtr) -> Self {
        VmPtr((TAG_STACK << TAG_SHIFT) | ptr.serialize() as u64)
    }

    /// Pointer to a global variable cell
    #[inline]
    pub fn global(index: u32) -> Self {
        VmPtr((TAG_GLOBAL << TAG_SHIFT) | index as u64)
    }

    /// Pointer to a heap object, optionally into one of its fields
    #[inline]
    pub fn object(handle: ObjectHandle, field_offset: u32) -> Self {
        debug_assert!(field_offset < (1 << 24));
        VmPtr((TAG_OBJECT << TAG_SHIFT) | ((field_offset as u64) << 32) | handle.raw() as u64)
    }

    /// Reference to a registered type
    #[inline]
    pub fn type_info(id: TypeId) -> Self {
        VmPtr((TAG_TYPE << TAG_SHIFT) | id.0 as u64)
    }

    /// Raw 64-bit word, as stored on the stack
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Reinterpret a raw stack word as a pointer
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        VmPtr(raw)
    }

    /// Decode the tag and payload
    pub fn kind(self) -> PtrKind {
        if self.0 == 0 {
            return PtrKind::Null;
        }
        let payload = self.0 & ((1u64 << TAG_SHIFT) - 1);
        match self.0 >> TAG_SHIFT {
            TAG_STACK => PtrKind::Stack(StackPtr::deserialize(payload as u32)),
            TAG_GLOBAL => PtrKind::Global(payload as u32),
            TAG_OBJECT => {
                let handle = ObjectHandle::new(payload as u32)
                    .expect("object pointer with zero handle");
                PtrKind::Object {
                    handle,
                    offset: (payload >> 32) as u32,
                }
            }
            TAG_TYPE => PtrKind::Type(TypeId(payload as u32)),
            _ => PtrKind::Null,
        }
    }

    /// The object handle, when this points at an object base or field
    pub fn as_object(self) -> Option<ObjectHandle> {
        match self.kind() {
            PtrKind::Object { handle, .. } => Some(handle),
            _ => None,
        }
    }

    /// This pointer displaced by `cells` toward higher addresses
    ///
    /// Meaningful for stack, global and object pointers; null stays null.
    pub fn add_cells(self, cells: u32) -> VmPtr {
        match self.kind() {
            PtrKind::Null => VmPtr::null(),
            PtrKind::Stack(p) => VmPtr::stack(p.offset(cells as i32)),
            PtrKind::Global(g) => VmPtr::global(g + cells),
            PtrKind::Object { handle, offset } => VmPtr::object(handle, offset + cells),
            PtrKind::Type(_) => self,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_is_zero_word() {
        assert_eq!(VmPtr::null().raw(), 0);
        assert!(VmPtr::from_raw(0).is_null());
        assert_eq!(VmPtr::from_raw(0).kind(), PtrKind::Null);
    }

    #[test]
    fn test_stack_ptr_roundtrip() {
        let p = StackPtr { block: 3, cell: 1024 };
        let v = VmPtr::stack(p);
        assert_eq!(v.kind(), PtrKind::Stack(p));
        assert_eq!(StackPtr::deserialize(p.serialize()), p);
    }

    #[test]
    fn test_object_ptr_roundtrip() {
        let h = ObjectHandle::new(42).unwrap();
        let v = VmPtr::object(h, 7);
        assert_eq!(v.kind(), PtrKind::Object { handle: h, offset: 7 });
        assert_eq!(v.as_object(), Some(h));
    }

    #[test]
    fn test_add_cells() {
        let h = ObjectHandle::new(9).unwrap();
        let v = VmPtr::object(h, 2).add_cells(3);
        assert_eq!(v.kind(), PtrKind::Object { handle: h, offset: 5 });

        let g = VmPtr::global(10).add_cells(4);
        assert_eq!(g.kind(), PtrKind::Global(14));

        assert!(VmPtr::null().add_cells(8).is_null());
    }

    #[test]
    fn test_distinct_address_spaces_compare_unequal() {
        let s = VmPtr::stack(StackPtr { block: 0, cell: 5 });
        let g = VmPtr::global(5);
        assert_ne!(s.raw(), g.raw());
    }
}
