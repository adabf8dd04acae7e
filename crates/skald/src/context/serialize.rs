//! Register-level serialization of suspended executions.
//!
//! The register APIs expose each stack level's saved state in the wire
//! format (stack pointers packed as block index in the high 6 bits, slot
//! offset in the low 26; program pointers as offsets from the function's
//! bytecode start). `ContextSnapshot` composes them with the raw stack
//! contents into a postcard-encodable value that can be restored into a
//! fresh context over the same engine.

use serde::{Deserialize, Serialize};

use crate::context::{CallStackEntry, Context};
use crate::error::{ExecutionState, VmError};
use crate::function::{FuncKind, FunctionId};
use crate::memory::VmPtr;
use crate::types::TypeId;

/// Wire value marking an unset program pointer.
pub const NO_PROGRAM_POINTER: u32 = u32::MAX;

/// Saved interpreter registers of one call-stack level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStateRegisters {
    pub stack_frame_pointer: u32,
    pub function: FunctionId,
    pub program_pointer: u32,
    pub stack_pointer: u32,
    pub stack_index: u32,
}

/// Host-facing state of an execution (level 0) or a nested marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRegisters {
    pub calling_system_function: Option<FunctionId>,
    pub initial_function: Option<FunctionId>,
    pub original_stack_pointer: u32,
    pub arguments_size: u32,
    pub value_register: u64,
    pub object_register: u64,
    pub object_type: Option<TypeId>,
}

impl Context {
    /// Puts the context into the deserialization state, releasing whatever
    /// it held before.
    pub fn start_deserialization(&mut self) -> Result<(), VmError> {
        if self.state() == ExecutionState::Active || self.state() == ExecutionState::Suspended {
            self.engine.report_api_error("StartDeserialization", VmError::ContextActive);
            return Err(VmError::ContextActive);
        }
        self.unprepare()?;
        self.set_status(ExecutionState::Deserialization);
        Ok(())
    }

    /// Recreates one call frame during deserialization, outermost first.
    ///
    /// The first call prepares the context for the bottom function; later
    /// calls push frames as if the outer function had called inward. The
    /// registers are overwritten afterwards by `set_call_state_registers`.
    pub fn push_function(&mut self, func_id: FunctionId, object: VmPtr) -> Result<(), VmError> {
        let engine = self.engine.clone();
        let Some(func) = engine.try_function(func_id) else {
            engine.report_api_error("PushFunction", VmError::InvalidArg);
            return Err(VmError::InvalidArg);
        };
        if self.state() != ExecutionState::Deserialization {
            engine.report_api_error("PushFunction", VmError::ContextNotPrepared);
            return Err(VmError::ContextNotPrepared);
        }

        let (mut func, mut object) = (func, object);
        if func.kind == FuncKind::Delegate {
            let target = func.delegate.expect("delegate without target");
            debug_assert!(object.is_null());
            object = VmPtr::from(target.object);
            func = engine.function(target.func);
        }

        if matches!(func.kind, FuncKind::Virtual | FuncKind::Interface) {
            let Some(obj) = object.as_object() else {
                return Err(VmError::InvalidArg);
            };
            let obj_type = engine.heap.borrow().type_of(obj);
            let info = engine.type_info(obj_type);
            let resolved = info.methods.iter().copied().find_map(|m| {
                let candidate = engine.function(m);
                (candidate.signature_id == func.signature_id).then(|| {
                    if candidate.kind == FuncKind::Virtual {
                        info.virtual_function_table[candidate.vf_table_idx as usize]
                    } else {
                        m
                    }
                })
            });
            let Some(real) = resolved else {
                return Err(VmError::InvalidArg);
            };
            func = engine.function(real);
        }

        if self.callstack_size() == 0 {
            self.set_status(ExecutionState::Uninitialized);
            self.prepare(func.id)?;
            if !object.is_null() {
                let fp = self.regs.frame_pointer;
                self.st_ptr(fp, 0, object);
            }
            self.set_status(ExecutionState::Deserialization);
        } else {
            self.call_script_function(func);
            if !object.is_null() {
                let fp = self.regs.frame_pointer;
                self.st_ptr(fp, 0, object);
            }
        }

        debug_assert!(self.current_function.as_ref().is_some_and(|f| f.kind != FuncKind::Delegate));
        Ok(())
    }

    /// Reads the saved interpreter registers of a stack level.
    ///
    /// Nested markers report `NoFunction`; use [`Context::state_registers`]
    /// for those levels.
    pub fn call_state_registers(&self, stack_level: u32) -> Result<CallStateRegisters, VmError> {
        if stack_level >= self.callstack_size() {
            return Err(VmError::InvalidArg);
        }

        let (fp, function, pp, sp, stack_index) = if stack_level == 0 {
            let func = self.current_function.as_ref().ok_or(VmError::NoFunction)?;
            (
                self.regs.frame_pointer,
                func.clone(),
                self.regs.program_pointer,
                self.regs.stack_pointer,
                self.stack_index,
            )
        } else {
            let index = self.call_stack.len() - stack_level as usize;
            match &self.call_stack[index] {
                CallStackEntry::Frame(f) => (
                    f.frame_pointer,
                    f.function.clone(),
                    f.program_pointer,
                    f.stack_pointer,
                    f.stack_index,
                ),
                CallStackEntry::Marker(_) => return Err(VmError::NoFunction),
            }
        };

        let stack_frame_pointer = self.stack.serialize_ptr(fp).ok_or(VmError::Error)?;
        let stack_pointer = self.stack.serialize_ptr(sp).ok_or(VmError::Error)?;
        Ok(CallStateRegisters {
            stack_frame_pointer,
            function: function.id,
            program_pointer: pp.unwrap_or(NO_PROGRAM_POINTER),
            stack_pointer,
            stack_index,
        })
    }

    /// Writes the saved interpreter registers of a stack level; only legal
    /// during deserialization.
    pub fn set_call_state_registers(&mut self, stack_level: u32, state: CallStateRegisters) -> Result<(), VmError> {
        if self.state() != ExecutionState::Deserialization {
            self.engine.report_api_error("SetCallStateRegisters", VmError::ContextActive);
            return Err(VmError::ContextActive);
        }
        if stack_level >= self.callstack_size() {
            return Err(VmError::InvalidArg);
        }

        let fp = self.stack.deserialize_ptr(state.stack_frame_pointer).ok_or(VmError::InvalidArg)?;
        let sp = self.stack.deserialize_ptr(state.stack_pointer).ok_or(VmError::InvalidArg)?;
        let pp = (state.program_pointer != NO_PROGRAM_POINTER).then_some(state.program_pointer);

        if stack_level == 0 {
            let current = self.current_function.as_ref().ok_or(VmError::NoFunction)?;
            debug_assert_eq!(
                self.engine.function(state.function).signature_id,
                current.signature_id,
                "deserialized function does not match the prepared frame"
            );
            if let Some(pp) = pp {
                let len = current.script.as_ref().map_or(0, |d| d.bytecode.len() as u32);
                if pp > len {
                    return Err(VmError::InvalidArg);
                }
            }
            self.regs.frame_pointer = fp;
            self.regs.program_pointer = pp;
            self.regs.stack_pointer = sp;
            self.stack_index = state.stack_index;
        } else {
            let index = self.call_stack.len() - stack_level as usize;
            match &mut self.call_stack[index] {
                CallStackEntry::Frame(frame) => {
                    debug_assert_eq!(
                        self.engine.function(state.function).signature_id,
                        frame.function.signature_id,
                        "deserialized function does not match the saved frame"
                    );
                    frame.frame_pointer = fp;
                    frame.program_pointer = pp;
                    frame.stack_pointer = sp;
                    frame.stack_index = state.stack_index;
                }
                CallStackEntry::Marker(_) => return Err(VmError::Error),
            }
        }
        Ok(())
    }

    /// Reads the host-facing state of the execution (level 0) or of a
    /// nested marker at a deeper level.
    pub fn state_registers(&self, stack_level: u32) -> Result<StateRegisters, VmError> {
        if stack_level >= self.callstack_size() {
            return Err(VmError::InvalidArg);
        }

        if stack_level == 0 {
            let original_stack_pointer =
                self.stack.serialize_ptr(self.original_stack_pointer).ok_or(VmError::Error)?;
            return Ok(StateRegisters {
                calling_system_function: self.calling_system_function,
                initial_function: self.initial_function.as_ref().map(|f| f.id),
                original_stack_pointer,
                arguments_size: self.arguments_size,
                value_register: self.regs.value_register,
                object_register: self.regs.object_register.encode(),
                object_type: self.regs.object_type,
            });
        }

        let index = self.call_stack.len() - stack_level as usize;
        match &self.call_stack[index] {
            CallStackEntry::Marker(m) => {
                let original_stack_pointer =
                    self.stack.serialize_ptr(m.original_stack_pointer).ok_or(VmError::Error)?;
                Ok(StateRegisters {
                    calling_system_function: m.calling_system_function,
                    initial_function: m.initial_function.as_ref().map(|f| f.id),
                    original_stack_pointer,
                    arguments_size: m.arguments_size,
                    value_register: m.value_register,
                    object_register: m.object_register.encode(),
                    object_type: m.object_type,
                })
            }
            CallStackEntry::Frame(_) => Err(VmError::NoFunction),
        }
    }

    /// Writes the host-facing state; only legal during deserialization.
    pub fn set_state_registers(&mut self, stack_level: u32, state: StateRegisters) -> Result<(), VmError> {
        if self.state() != ExecutionState::Deserialization {
            self.engine.report_api_error("SetStateRegisters", VmError::ContextActive);
            return Err(VmError::ContextActive);
        }
        if stack_level >= self.callstack_size() {
            return Err(VmError::InvalidArg);
        }

        if stack_level == 0 {
            let original = self.stack.deserialize_ptr(state.original_stack_pointer).ok_or(VmError::InvalidArg)?;
            self.calling_system_function = state.calling_system_function;
            self.initial_function = match state.initial_function {
                Some(id) => Some(self.engine.try_function(id).ok_or(VmError::InvalidArg)?),
                None => None,
            };
            self.original_stack_pointer = original;
            self.original_stack_index = original.block;
            self.arguments_size = state.arguments_size;
            self.regs.value_register = state.value_register;
            self.regs.object_register = VmPtr::decode(state.object_register);
            self.regs.object_type = state.object_type;
            return Ok(());
        }

        let original = self.stack.deserialize_ptr(state.original_stack_pointer).ok_or(VmError::InvalidArg)?;
        let initial = match state.initial_function {
            Some(id) => Some(self.engine.try_function(id).ok_or(VmError::InvalidArg)?),
            None => None,
        };
        let index = self.call_stack.len() - stack_level as usize;
        match &mut self.call_stack[index] {
            CallStackEntry::Marker(m) => {
                m.calling_system_function = state.calling_system_function;
                m.initial_function = initial;
                m.original_stack_pointer = original;
                m.original_stack_index = original.block;
                m.arguments_size = state.arguments_size;
                m.value_register = state.value_register;
                m.object_register = VmPtr::decode(state.object_register);
                m.object_type = state.object_type;
                Ok(())
            }
            CallStackEntry::Frame(_) => Err(VmError::Error),
        }
    }

    /// Leaves the deserialization state; the context is then suspended and
    /// can be resumed with `execute`.
    pub fn finish_deserialization(&mut self) -> Result<(), VmError> {
        if self.state() != ExecutionState::Deserialization {
            self.engine.report_api_error("FinishDeserialization", VmError::ContextNotPrepared);
            return Err(VmError::ContextNotPrepared);
        }
        if self.current_function.is_none() {
            self.engine.report_api_error("FinishDeserialization", VmError::ContextNotPrepared);
            // Leave the context in a valid state.
            let _ = self.unprepare();
            return Err(VmError::ContextNotPrepared);
        }
        self.set_status(ExecutionState::Suspended);
        Ok(())
    }
}

/// A full snapshot of a suspended, non-nested execution.
///
/// Valid against the same engine (object ids in the stack refer to its
/// heap). Encode with [`ContextSnapshot::to_bytes`] for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    blocks: Vec<Vec<u8>>,
    state: StateRegisters,
    /// Frames bottom (outermost) first: function, receiver, registers.
    frames: Vec<FrameSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameSnapshot {
    function: FunctionId,
    receiver: u64,
    regs: CallStateRegisters,
}

impl ContextSnapshot {
    /// Captures a suspended execution.
    pub fn capture(ctx: &Context) -> Result<ContextSnapshot, VmError> {
        if ctx.state() != ExecutionState::Suspended {
            return Err(VmError::ContextActive);
        }
        if ctx.is_nested() {
            return Err(VmError::NotSupported);
        }

        let size = ctx.callstack_size();
        let mut frames = Vec::with_capacity(size as usize);
        for level in (0..size).rev() {
            let regs = ctx.call_state_registers(level)?;
            frames.push(FrameSnapshot {
                function: regs.function,
                receiver: ctx.this_pointer(level).encode(),
                regs,
            });
        }

        Ok(ContextSnapshot {
            blocks: ctx.stack.snapshot_blocks(),
            state: ctx.state_registers(0)?,
            frames,
        })
    }

    /// Restores the execution into a context created against the same
    /// engine. The context ends up suspended, ready to resume.
    pub fn restore(&self, ctx: &mut Context) -> Result<(), VmError> {
        ctx.start_deserialization()?;

        // Frames first: preparation allocates the first block and lays out
        // each frame; the saved registers then overwrite the layout.
        for frame in &self.frames {
            // The receiver slot is rewritten with the block contents below;
            // push_function only needs it for virtual resolution.
            ctx.push_function(frame.function, VmPtr::decode(frame.receiver))?;
        }

        if !ctx.stack.restore_blocks(&self.blocks) {
            let _ = ctx.unprepare();
            return Err(VmError::InvalidArg);
        }

        let size = ctx.callstack_size();
        if size as usize != self.frames.len() {
            let _ = ctx.unprepare();
            return Err(VmError::InvalidArg);
        }
        for (i, frame) in self.frames.iter().enumerate() {
            let level = size - 1 - i as u32;
            ctx.set_call_state_registers(level, frame.regs)?;
        }
        ctx.set_state_registers(0, self.state)?;

        ctx.finish_deserialization()
    }

    /// Encodes the snapshot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decodes a snapshot produced by [`ContextSnapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<ContextSnapshot, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
