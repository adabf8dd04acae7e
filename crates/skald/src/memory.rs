//! The VM address space.
//!
//! The interpreter never holds raw host pointers. Every pointer-sized slot
//! carries a tagged 64-bit [`VmPtr`] addressing either the data stack, the
//! engine's global data area, a heap object interior, a function or a type.
//! The all-zero encoding is the null pointer, so null checks and the
//! call-stack nested-marker sentinel stay bit-exact with a zeroed slot.

use crate::function::FunctionId;
use crate::heap::ObjectId;
use crate::types::TypeId;

const TAG_SHIFT: u32 = 61;
const TAG_RAW: u64 = 0;
const TAG_STACK: u64 = 1;
const TAG_GLOBAL: u64 = 2;
const TAG_OBJECT: u64 = 3;
const TAG_FUNC: u64 = 4;
const TAG_TYPE: u64 = 5;

/// A tagged VM address, two stack slots wide when stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmPtr {
    #[default]
    Null,
    /// A small scalar riding a pointer slot (e.g. a variable offset pushed
    /// ahead of `GetObj`/`GetRef` rewriting, or a list element count).
    Raw(u64),
    /// Interior of a data-stack block, byte-granular.
    Stack { block: u32, byte: u32 },
    /// Interior of the engine's global data area, byte-granular.
    Global { byte: u32 },
    /// Interior of a heap object's payload, byte-granular.
    Object { id: ObjectId, byte: u32 },
    /// A function handle.
    Func(FunctionId),
    /// A type handle.
    Type(TypeId),
}

impl VmPtr {
    #[must_use]
    pub fn is_null(self) -> bool {
        matches!(self, VmPtr::Null)
    }

    /// Encodes into the 64-bit slot representation.
    #[must_use]
    pub fn encode(self) -> u64 {
        match self {
            VmPtr::Null => 0,
            VmPtr::Raw(v) => {
                debug_assert!(v >> TAG_SHIFT == 0, "raw payload must fit below the tag bits");
                v
            }
            VmPtr::Stack { block, byte } => {
                (TAG_STACK << TAG_SHIFT) | (u64::from(block & 0xFF) << 32) | u64::from(byte)
            }
            VmPtr::Global { byte } => (TAG_GLOBAL << TAG_SHIFT) | u64::from(byte),
            VmPtr::Object { id, byte } => {
                (TAG_OBJECT << TAG_SHIFT) | (u64::from(id.raw()) << 32) | u64::from(byte)
            }
            VmPtr::Func(id) => (TAG_FUNC << TAG_SHIFT) | u64::from(id.0),
            VmPtr::Type(id) => (TAG_TYPE << TAG_SHIFT) | u64::from(id.0),
        }
    }

    /// Decodes from the 64-bit slot representation.
    #[must_use]
    pub fn decode(v: u64) -> VmPtr {
        if v == 0 {
            return VmPtr::Null;
        }
        match v >> TAG_SHIFT {
            TAG_RAW => VmPtr::Raw(v),
            TAG_STACK => VmPtr::Stack { block: ((v >> 32) & 0xFF) as u32, byte: v as u32 },
            TAG_GLOBAL => VmPtr::Global { byte: v as u32 },
            TAG_OBJECT => {
                VmPtr::Object { id: ObjectId::from_raw(((v >> 32) & 0x1FFF_FFFF) as u32), byte: v as u32 }
            }
            TAG_FUNC => VmPtr::Func(FunctionId(v as u32)),
            _ => VmPtr::Type(TypeId(v as u32)),
        }
    }

    /// Adds a byte displacement; only data addresses support it.
    ///
    /// Used by the field-offset instructions, which have already null-checked
    /// the base.
    #[must_use]
    pub fn offset_bytes(self, delta: i32) -> VmPtr {
        match self {
            VmPtr::Stack { block, byte } => VmPtr::Stack { block, byte: byte.wrapping_add_signed(delta) },
            VmPtr::Global { byte } => VmPtr::Global { byte: byte.wrapping_add_signed(delta) },
            VmPtr::Object { id, byte } => VmPtr::Object { id, byte: byte.wrapping_add_signed(delta) },
            other => other,
        }
    }

    /// The object id, when this address points at (the start of) an object.
    #[must_use]
    pub fn as_object(self) -> Option<ObjectId> {
        match self {
            VmPtr::Object { id, .. } => Some(id),
            _ => None,
        }
    }

    /// The function id, when this is a function handle.
    #[must_use]
    pub fn as_func(self) -> Option<FunctionId> {
        match self {
            VmPtr::Func(id) => Some(id),
            _ => None,
        }
    }
}

impl From<ObjectId> for VmPtr {
    fn from(id: ObjectId) -> VmPtr {
        VmPtr::Object { id, byte: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_all_zero() {
        assert_eq!(VmPtr::Null.encode(), 0);
        assert_eq!(VmPtr::decode(0), VmPtr::Null);
    }

    #[test]
    fn codec_roundtrip() {
        let ptrs = [
            VmPtr::Raw(42),
            VmPtr::Stack { block: 3, byte: 1024 },
            VmPtr::Global { byte: 16 },
            VmPtr::Object { id: ObjectId::from_raw(7), byte: 12 },
            VmPtr::Func(FunctionId(9)),
            VmPtr::Type(TypeId(0x105)),
        ];
        for p in ptrs {
            assert_eq!(VmPtr::decode(p.encode()), p, "roundtrip failed for {p:?}");
        }
    }

    #[test]
    fn offsets_stay_within_the_same_region() {
        let p = VmPtr::Object { id: ObjectId::from_raw(1), byte: 8 };
        assert_eq!(p.offset_bytes(4), VmPtr::Object { id: ObjectId::from_raw(1), byte: 12 });
        let s = VmPtr::Stack { block: 0, byte: 40 };
        assert_eq!(s.offset_bytes(-8), VmPtr::Stack { block: 0, byte: 32 });
    }
}
