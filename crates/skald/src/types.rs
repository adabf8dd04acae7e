//! Type system contracts consumed by the execution context.
//!
//! The engine owns the registry; the context only reads these descriptors to
//! size stack frames, dispatch virtual calls and drive object disposal.

use crate::function::FunctionId;

/// Number of 32-bit slots a pointer-sized value occupies on the data stack.
pub const PTR_SLOTS: u32 = 2;

/// Identifies a type in the engine registry.
///
/// Primitive types have fixed ids below [`TypeId::FIRST_OBJECT`]; registered
/// object types are numbered from there in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const VOID: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const INT8: TypeId = TypeId(2);
    pub const INT16: TypeId = TypeId(3);
    pub const INT32: TypeId = TypeId(4);
    pub const INT64: TypeId = TypeId(5);
    pub const UINT8: TypeId = TypeId(6);
    pub const UINT16: TypeId = TypeId(7);
    pub const UINT32: TypeId = TypeId(8);
    pub const UINT64: TypeId = TypeId(9);
    pub const FLOAT: TypeId = TypeId(10);
    pub const DOUBLE: TypeId = TypeId(11);
    /// Untyped heap buffer (initializer-list memory before it is adopted).
    pub const RAW_BUFFER: TypeId = TypeId(12);
    /// The varying `?` parameter type: a reference plus a type id slot.
    pub const VAR_TYPE: TypeId = TypeId(13);

    /// First id handed out to registered object types.
    pub const FIRST_OBJECT: u32 = 0x100;

    /// True for ids that refer to the object registry rather than a primitive.
    #[must_use]
    pub fn is_object(self) -> bool {
        self.0 >= Self::FIRST_OBJECT
    }

    pub(crate) fn object_index(self) -> usize {
        debug_assert!(self.is_object());
        (self.0 - Self::FIRST_OBJECT) as usize
    }

    pub(crate) fn from_object_index(index: usize) -> TypeId {
        TypeId(Self::FIRST_OBJECT + index as u32)
    }
}

/// Behavioural flags of a registered type.
///
/// A hand-rolled bitset; the combinations mirror what the disposal and
/// ref-copy paths need to distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeFlags(pub u32);

impl TypeFlags {
    /// Class defined in script; fields live in an engine heap byte buffer.
    pub const SCRIPT_OBJECT: TypeFlags = TypeFlags(1);
    /// Reference type: disposed through addref/release.
    pub const REFERENCE: TypeFlags = TypeFlags(2);
    /// Value type: disposed through destruct + free.
    pub const VALUE: TypeFlags = TypeFlags(4);
    /// Reference type without a counter; never addref'd or released.
    pub const NO_COUNT: TypeFlags = TypeFlags(8);
    /// Compiler-produced initializer-list buffer.
    pub const LIST_PATTERN: TypeFlags = TypeFlags(16);
    /// Function definition; handles are counted function references.
    pub const FUNCDEF: TypeFlags = TypeFlags(32);
    /// Interface type; calls resolve through the receiver's interface table.
    pub const INTERFACE: TypeFlags = TypeFlags(64);
    /// Participates in the engine's cycle collector.
    pub const GC: TypeFlags = TypeFlags(128);

    #[must_use]
    pub const fn union(self, other: TypeFlags) -> TypeFlags {
        TypeFlags(self.0 | other.0)
    }

    #[must_use]
    pub const fn contains(self, other: TypeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: TypeFlags) -> bool {
        self.0 & other.0 != 0
    }
}

/// How a parameter is passed with respect to references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefModifier {
    #[default]
    None,
    In,
    Out,
    InOut,
}

/// A type with usage modifiers, as it appears in signatures and variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataType {
    pub type_id: TypeId,
    pub is_handle: bool,
    pub is_reference: bool,
    pub is_read_only: bool,
}

impl DataType {
    #[must_use]
    pub fn value(type_id: TypeId) -> DataType {
        DataType { type_id, is_handle: false, is_reference: false, is_read_only: false }
    }

    #[must_use]
    pub fn handle(type_id: TypeId) -> DataType {
        DataType { type_id, is_handle: true, is_reference: false, is_read_only: false }
    }

    #[must_use]
    pub fn reference(type_id: TypeId) -> DataType {
        DataType { type_id, is_handle: false, is_reference: true, is_read_only: false }
    }

    #[must_use]
    pub fn handle_reference(type_id: TypeId) -> DataType {
        DataType { type_id, is_handle: true, is_reference: true, is_read_only: false }
    }

    #[must_use]
    pub fn read_only(mut self) -> DataType {
        self.is_read_only = true;
        self
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        self.type_id == TypeId::VOID && !self.is_reference && !self.is_handle
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        self.type_id.is_object()
    }

    /// Slots this type occupies in an argument area.
    ///
    /// Objects, handles and references always travel as pointers; 64-bit
    /// scalars take two slots; everything else one.
    #[must_use]
    pub fn size_on_stack(&self) -> u32 {
        if self.type_id == TypeId::VAR_TYPE {
            // The reference plus the type id of the passed value.
            return PTR_SLOTS + 1;
        }
        if self.is_reference || self.is_handle || self.is_object() {
            return PTR_SLOTS;
        }
        match self.type_id {
            TypeId::VOID => 0,
            TypeId::INT64 | TypeId::UINT64 | TypeId::DOUBLE => 2,
            _ => 1,
        }
    }

    /// Size of the naked value in memory, in bytes.
    ///
    /// Only meaningful for primitives; object sizes come from [`TypeInfo`].
    #[must_use]
    pub fn size_in_memory_bytes(&self) -> u32 {
        match self.type_id {
            TypeId::VOID => 0,
            TypeId::BOOL | TypeId::INT8 | TypeId::UINT8 => 1,
            TypeId::INT16 | TypeId::UINT16 => 2,
            TypeId::INT64 | TypeId::UINT64 | TypeId::DOUBLE => 8,
            _ => 4,
        }
    }

    /// Size in 32-bit slots when the value is stored inline (return sinks).
    #[must_use]
    pub fn size_in_memory_slots(&self) -> u32 {
        self.size_in_memory_bytes().div_ceil(4)
    }
}

/// Disposal and construction hooks of a registered type.
///
/// Each entry names a host function invoked through the engine bridge with
/// the object as receiver; together they form the capability set the
/// interpreter drives object lifetimes through.
#[derive(Debug, Clone, Default)]
pub struct TypeBehaviours {
    pub construct: Option<FunctionId>,
    pub copy_construct: Option<FunctionId>,
    pub destruct: Option<FunctionId>,
    pub addref: Option<FunctionId>,
    pub release: Option<FunctionId>,
}

/// A field of a script object type.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    pub name: String,
    pub byte_offset: u32,
    pub data_type: DataType,
}

/// An interface implemented by a class, with the offset of the interface's
/// chunk inside the class virtual function table.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceEntry {
    pub interface: TypeId,
    pub vft_offset: u32,
}

/// A registered type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: TypeId,
    pub name: String,
    pub flags: TypeFlags,
    /// Object payload size in bytes (script objects and value types).
    pub size: u32,
    pub beh: TypeBehaviours,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<FunctionId>,
    pub virtual_function_table: Vec<FunctionId>,
    pub interfaces: Vec<InterfaceEntry>,
    pub base: Option<TypeId>,
    /// The signature function of a funcdef type.
    pub funcdef: Option<FunctionId>,
}

impl TypeInfo {
    /// Looks up the virtual-table offset for an implemented interface.
    #[must_use]
    pub fn interface_offset(&self, interface: TypeId) -> Option<u32> {
        self.interfaces.iter().find(|e| e.interface == interface).map(|e| e.vft_offset)
    }

    #[must_use]
    pub fn implements(&self, interface: TypeId) -> bool {
        self.id == interface || self.interfaces.iter().any(|e| e.interface == interface)
    }
}

/// A registered type pending an engine-assigned id.
#[derive(Debug, Clone, Default)]
pub struct TypeDef {
    pub name: String,
    pub flags: TypeFlags,
    pub size: u32,
    pub beh: TypeBehaviours,
    pub properties: Vec<PropertyDef>,
    pub methods: Vec<FunctionId>,
    pub virtual_function_table: Vec<FunctionId>,
    pub interfaces: Vec<InterfaceEntry>,
    pub base: Option<TypeId>,
    pub funcdef: Option<FunctionId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_widths() {
        assert_eq!(DataType::value(TypeId::INT32).size_on_stack(), 1);
        assert_eq!(DataType::value(TypeId::DOUBLE).size_on_stack(), 2);
        assert_eq!(DataType::reference(TypeId::INT32).size_on_stack(), PTR_SLOTS);
        assert_eq!(DataType::value(TypeId::INT16).size_in_memory_bytes(), 2);
    }

    #[test]
    fn flags_compose() {
        let f = TypeFlags::REFERENCE.union(TypeFlags::GC);
        assert!(f.contains(TypeFlags::REFERENCE));
        assert!(f.intersects(TypeFlags::GC));
        assert!(!f.contains(TypeFlags::VALUE));
    }
}
