//! Function descriptors: what the interpreter knows about a callable.

use std::fmt;
use std::rc::Rc;

use crate::engine::HostCall;
use crate::heap::ObjectId;
use crate::types::{DataType, PTR_SLOTS, RefModifier, TypeId};

/// Identifies a function in the engine registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FunctionId(pub u32);

/// The dispatch kind of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncKind {
    /// Bytecode compiled from script.
    Script,
    /// Host function invoked through the engine bridge.
    Host,
    /// Interface method; resolves via the receiver's interface table.
    Interface,
    /// Virtual method; resolves via the receiver's virtual function table.
    Virtual,
    /// Bound (receiver, method) pair; dispatch substitutes the receiver.
    Delegate,
    /// Imported function resolved through the engine binding table.
    Imported,
    /// Function definition used as a handle type.
    Funcdef,
}

/// Host function callback invoked through the engine bridge.
pub type HostFn = Rc<dyn Fn(&mut HostCall<'_>)>;

/// JIT entry hook; receives the context with registers synchronized and the
/// argument encoded at the entry instruction.
pub type JitFn = Rc<dyn Fn(&mut crate::context::Context, u64)>;

/// Target of a delegate function.
#[derive(Debug, Clone, Copy)]
pub struct DelegateTarget {
    pub object: ObjectId,
    pub func: FunctionId,
}

/// A local variable of a script function.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Empty for unnamed temporaries, which are in scope for the whole call.
    pub name: String,
    /// Positive offsets are locals below the frame pointer; offsets <= 0
    /// address the argument area above it.
    pub stack_offset: i32,
    pub data_type: DataType,
    /// True when the slot holds a pointer to a heap allocation the function
    /// owns; false for value objects constructed in place on the stack.
    pub on_heap: bool,
    /// Program position of the declaration.
    pub declared_at: u32,
}

/// Kind of an object-variable-life event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLifeEvent {
    /// The variable now holds a live object.
    Init,
    /// The variable's object was destroyed.
    Uninit,
    /// A statement block opens.
    BlockBegin,
    /// A statement block closes.
    BlockEnd,
    /// A named variable comes into existence.
    VarDecl,
}

/// One object-variable-life event, keyed by program position.
///
/// Events are recorded on the instruction after the one that produced the
/// effect, so a replay up to a fault position must treat the position itself
/// as executed.
#[derive(Debug, Clone, Copy)]
pub struct ObjectVarInfo {
    pub program_pos: u32,
    pub variable_offset: i32,
    pub event: VarLifeEvent,
}

/// A try/catch range of a script function, sorted by `try_pos`.
#[derive(Debug, Clone, Copy)]
pub struct TryCatchInfo {
    pub try_pos: u32,
    pub catch_pos: u32,
    /// Evaluation-stack slots in use when the try block was entered.
    pub stack_size: u32,
}

/// Line table entry: column packed in the high 12 bits, line in the low 20.
#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub program_pos: u32,
    pub packed: u32,
}

/// Compiled body and frame metadata of a script function.
pub struct ScriptData {
    pub bytecode: Vec<u32>,
    pub variables: Vec<Variable>,
    pub object_var_info: Vec<ObjectVarInfo>,
    pub try_catch: Vec<TryCatchInfo>,
    pub line_info: Vec<LineEntry>,
    /// Total stack slots the frame needs beyond the argument area.
    pub stack_needed: u32,
    /// Slots reserved below the frame pointer for local variables.
    pub variable_space: u32,
    pub section_idx: u32,
    pub jit: Option<JitFn>,
}

impl fmt::Debug for ScriptData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptData")
            .field("bytecode_len", &self.bytecode.len())
            .field("variables", &self.variables.len())
            .field("stack_needed", &self.stack_needed)
            .field("variable_space", &self.variable_space)
            .finish()
    }
}

/// A function known to the engine.
///
/// Only script kinds carry a [`ScriptData`]; host kinds carry the bridge
/// closure; the remaining kinds are dispatch descriptors resolved at call
/// time.
pub struct ScriptFunction {
    pub id: FunctionId,
    pub name: String,
    pub kind: FuncKind,
    pub object_type: Option<TypeId>,
    pub return_type: DataType,
    pub params: Vec<DataType>,
    pub inout_flags: Vec<RefModifier>,
    /// Identical for functions with matching signatures; virtual dispatch
    /// verifies resolution against it.
    pub signature_id: u32,
    /// Index into the class virtual function table (virtual/interface kinds).
    pub vf_table_idx: u32,
    /// Index into the engine import binding table (imported kind).
    pub import_slot: u32,
    pub delegate: Option<DelegateTarget>,
    pub script: Option<ScriptData>,
    pub host: Option<HostFn>,
    /// When set the unwinder does not dispose the receiver or parameters.
    pub dont_cleanup_on_exception: bool,
}

impl fmt::Debug for ScriptFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptFunction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("params", &self.params.len())
            .finish()
    }
}

impl ScriptFunction {
    /// Slots needed for the declared parameters (excluding hidden slots).
    #[must_use]
    pub fn space_for_params(&self) -> u32 {
        self.params.iter().map(DataType::size_on_stack).sum()
    }

    /// Slots for parameters plus the hidden receiver and return-sink slots.
    #[must_use]
    pub fn args_total_on_stack(&self) -> u32 {
        self.space_for_params()
            + if self.object_type.is_some() { PTR_SLOTS } else { 0 }
            + if self.returns_on_stack() { PTR_SLOTS } else { 0 }
    }

    /// True when the return value is an aggregate constructed in a
    /// caller-provided sink on the stack.
    #[must_use]
    pub fn returns_on_stack(&self) -> bool {
        self.return_type.is_object() && !self.return_type.is_handle && !self.return_type.is_reference
    }

    /// Script body; panics when called on a non-script kind.
    ///
    /// # Panics
    /// Panics if the function has no bytecode.
    #[must_use]
    pub fn script_data(&self) -> &ScriptData {
        self.script.as_ref().expect("ScriptFunction::script_data: not a script function")
    }

    /// Offset of parameter `arg` from the frame pointer, including hidden
    /// receiver and return-sink slots.
    #[must_use]
    pub fn arg_offset(&self, arg: usize) -> u32 {
        let mut offset = 0;
        if self.object_type.is_some() {
            offset += PTR_SLOTS;
        }
        if self.returns_on_stack() {
            offset += PTR_SLOTS;
        }
        for p in &self.params[..arg] {
            offset += p.size_on_stack();
        }
        offset
    }

    /// Line and column at a program position, from the packed line table.
    ///
    /// Returns `(line, column, section_idx)`; `(0, 0, section)` when the
    /// function carries no line information.
    #[must_use]
    pub fn line_number(&self, program_pos: u32) -> (u32, u32, u32) {
        let Some(data) = self.script.as_ref() else {
            return (0, 0, 0);
        };
        let mut packed = 0;
        for entry in &data.line_info {
            if entry.program_pos > program_pos {
                break;
            }
            packed = entry.packed;
        }
        (packed & 0xF_FFFF, packed >> 20, data.section_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_function(params: Vec<DataType>, ret: DataType) -> ScriptFunction {
        ScriptFunction {
            id: FunctionId(0),
            name: "f".to_owned(),
            kind: FuncKind::Script,
            object_type: None,
            return_type: ret,
            params,
            inout_flags: Vec::new(),
            signature_id: 0,
            vf_table_idx: 0,
            import_slot: 0,
            delegate: None,
            script: None,
            host: None,
            dont_cleanup_on_exception: false,
        }
    }

    #[test]
    fn param_space_counts_slot_widths() {
        let f = plain_function(
            vec![
                DataType::value(TypeId::INT32),
                DataType::value(TypeId::DOUBLE),
                DataType::reference(TypeId::INT32),
            ],
            DataType::value(TypeId::VOID),
        );
        assert_eq!(f.space_for_params(), 1 + 2 + PTR_SLOTS);
        assert_eq!(f.arg_offset(2), 3);
    }

    #[test]
    fn line_lookup_takes_last_entry_at_or_before() {
        let mut f = plain_function(vec![], DataType::value(TypeId::VOID));
        f.script = Some(ScriptData {
            bytecode: vec![],
            variables: vec![],
            object_var_info: vec![],
            try_catch: vec![],
            line_info: vec![
                LineEntry { program_pos: 0, packed: 5 | (1 << 20) },
                LineEntry { program_pos: 4, packed: 6 | (9 << 20) },
            ],
            stack_needed: 0,
            variable_space: 0,
            section_idx: 2,
            jit: None,
        });
        assert_eq!(f.line_number(0), (5, 1, 2));
        assert_eq!(f.line_number(3), (5, 1, 2));
        assert_eq!(f.line_number(10), (6, 9, 2));
    }
}
