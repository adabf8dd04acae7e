//! Argument marshalling at the VM boundary.
//!
//! The argument area sits at the frame pointer: a hidden receiver slot for
//! methods, a hidden return-sink slot for functions returning an aggregate
//! on the stack, then the declared parameters in order. All setters
//! validate status, index and type, and return a typed error without
//! touching any state.

use crate::context::Context;
use crate::error::{ExecutionState, VmError};
use crate::memory::VmPtr;
use crate::types::{PTR_SLOTS, TypeFlags, TypeId};

/// What a scalar setter requires of the declared parameter type.
enum ScalarCheck {
    MemBytes(u32),
    StackSlots(u32),
}

impl Context {
    /// Sets the receiver for a prepared method call.
    ///
    /// Script-object receivers are addref'd; the context owns that
    /// reference until unprepare.
    pub fn set_object(&mut self, obj: VmPtr) -> Result<(), VmError> {
        if self.state() != ExecutionState::Prepared {
            return Err(VmError::ContextNotPrepared);
        }
        let initial = self.initial_function.clone().expect("prepared without function");
        let Some(obj_type) = initial.object_type else {
            return Err(VmError::Error);
        };

        debug_assert!(self.ld_ptr(self.regs.frame_pointer, 0).is_null());
        let fp = self.regs.frame_pointer;
        self.st_ptr(fp, 0, obj);

        if let Some(id) = obj.as_object()
            && self.engine.type_info(obj_type).flags.contains(TypeFlags::SCRIPT_OBJECT)
        {
            self.engine.heap.borrow().inc_ref(id);
        }
        Ok(())
    }

    fn validate_scalar_arg(&self, arg: u32, check: &ScalarCheck) -> Result<u32, VmError> {
        if self.state() != ExecutionState::Prepared {
            return Err(VmError::ContextNotPrepared);
        }
        let initial = self.initial_function.as_ref().expect("prepared without function");
        let Some(dt) = initial.params.get(arg as usize) else {
            return Err(VmError::InvalidArg);
        };
        if dt.is_object() || dt.is_reference {
            return Err(VmError::InvalidType);
        }
        let ok = match *check {
            ScalarCheck::MemBytes(n) => dt.size_in_memory_bytes() == n,
            ScalarCheck::StackSlots(n) => dt.size_on_stack() == n,
        };
        if !ok {
            return Err(VmError::InvalidType);
        }
        Ok(initial.arg_offset(arg as usize))
    }

    /// Slot address of an argument in the prepared frame.
    fn arg_slot(&self, offset: u32) -> VmPtr {
        self.regs.frame_pointer.offset(offset as i32).to_ptr()
    }

    pub fn set_arg_byte(&mut self, arg: u32, value: u8) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::MemBytes(1))?;
        let at = self.arg_slot(offset);
        self.mem_write_u8(at, value);
        Ok(())
    }

    pub fn set_arg_word(&mut self, arg: u32, value: u16) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::MemBytes(2))?;
        let at = self.arg_slot(offset);
        self.mem_write_u16(at, value);
        Ok(())
    }

    pub fn set_arg_dword(&mut self, arg: u32, value: u32) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::MemBytes(4))?;
        let at = self.arg_slot(offset);
        self.mem_write_u32(at, value);
        Ok(())
    }

    pub fn set_arg_qword(&mut self, arg: u32, value: u64) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::StackSlots(2))?;
        let at = self.arg_slot(offset);
        self.mem_write_u64(at, value);
        Ok(())
    }

    pub fn set_arg_float(&mut self, arg: u32, value: f32) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::StackSlots(1))?;
        let at = self.arg_slot(offset);
        self.mem_write_u32(at, value.to_bits());
        Ok(())
    }

    pub fn set_arg_double(&mut self, arg: u32, value: f64) -> Result<(), VmError> {
        let offset = self.validate_scalar_arg(arg, &ScalarCheck::StackSlots(2))?;
        let at = self.arg_slot(offset);
        self.mem_write_u64(at, value.to_bits());
        Ok(())
    }

    /// Sets a reference or handle argument without adjusting any counts.
    pub fn set_arg_address(&mut self, arg: u32, value: VmPtr) -> Result<(), VmError> {
        if self.state() != ExecutionState::Prepared {
            return Err(VmError::ContextNotPrepared);
        }
        let initial = self.initial_function.as_ref().expect("prepared without function");
        let Some(dt) = initial.params.get(arg as usize) else {
            return Err(VmError::InvalidArg);
        };
        if !dt.is_reference && !dt.is_handle {
            return Err(VmError::InvalidType);
        }
        let offset = initial.arg_offset(arg as usize);
        let at = self.arg_slot(offset);
        self.mem_write_u64(at, value.encode());
        Ok(())
    }

    /// Sets an object argument. By-value parameters receive a copy made
    /// through the engine; handle parameters addref the referent.
    pub fn set_arg_object(&mut self, arg: u32, obj: VmPtr) -> Result<(), VmError> {
        if self.state() != ExecutionState::Prepared {
            return Err(VmError::ContextNotPrepared);
        }
        let engine = self.engine.clone();
        let initial = self.initial_function.clone().expect("prepared without function");
        let Some(dt) = initial.params.get(arg as usize).copied() else {
            return Err(VmError::InvalidArg);
        };
        if !dt.is_object() {
            return Err(VmError::InvalidType);
        }

        let mut value = obj;
        if !dt.is_reference {
            if dt.is_handle {
                if let Some(id) = obj.as_object() {
                    engine.addref_object(dt.type_id, id);
                }
            } else if let Some(id) = obj.as_object() {
                value = VmPtr::from(engine.create_object_copy(self, id, dt.type_id)?);
            } else {
                value = VmPtr::Null;
            }
        }

        let offset = initial.arg_offset(arg as usize);
        let at = self.arg_slot(offset);
        self.mem_write_u64(at, value.encode());
        Ok(())
    }

    /// Sets a varying-type (`?`) argument: the reference plus the type id
    /// of the value it refers to.
    pub fn set_arg_var_type(&mut self, arg: u32, value: VmPtr, type_id: TypeId) -> Result<(), VmError> {
        if self.state() != ExecutionState::Prepared {
            return Err(VmError::ContextNotPrepared);
        }
        let initial = self.initial_function.as_ref().expect("prepared without function");
        let Some(dt) = initial.params.get(arg as usize) else {
            return Err(VmError::InvalidArg);
        };
        if dt.type_id != TypeId::VAR_TYPE {
            return Err(VmError::InvalidType);
        }
        let offset = initial.arg_offset(arg as usize);
        let at = self.arg_slot(offset);
        self.mem_write_u64(at, value.encode());
        let at = self.arg_slot(offset + PTR_SLOTS);
        self.mem_write_u32(at, type_id.0);
        Ok(())
    }

    /// Address of an argument slot, for writing values in place.
    #[must_use]
    pub fn address_of_arg(&self, arg: u32) -> Option<VmPtr> {
        if self.state() != ExecutionState::Prepared {
            return None;
        }
        let initial = self.initial_function.as_ref()?;
        if arg as usize >= initial.params.len() {
            return None;
        }
        Some(self.arg_slot(initial.arg_offset(arg as usize)))
    }

    // ---- return values -----------------------------------------------------

    fn scalar_return_ok(&self) -> bool {
        if self.state() != ExecutionState::Finished {
            return false;
        }
        let rt = &self.initial_function.as_ref().expect("finished without function").return_type;
        !rt.is_object() && !rt.is_reference
    }

    #[must_use]
    pub fn return_byte(&self) -> u8 {
        if self.scalar_return_ok() { self.regs.value_register as u8 } else { 0 }
    }

    #[must_use]
    pub fn return_word(&self) -> u16 {
        if self.scalar_return_ok() { self.regs.value_register as u16 } else { 0 }
    }

    #[must_use]
    pub fn return_dword(&self) -> u32 {
        if self.scalar_return_ok() { self.regs.value_register as u32 } else { 0 }
    }

    #[must_use]
    pub fn return_qword(&self) -> u64 {
        if self.scalar_return_ok() { self.regs.value_register } else { 0 }
    }

    #[must_use]
    pub fn return_float(&self) -> f32 {
        if self.scalar_return_ok() { f32::from_bits(self.regs.value_register as u32) } else { 0.0 }
    }

    #[must_use]
    pub fn return_double(&self) -> f64 {
        if self.scalar_return_ok() { f64::from_bits(self.regs.value_register) } else { 0.0 }
    }

    /// The returned reference or object address.
    #[must_use]
    pub fn return_address(&self) -> VmPtr {
        if self.state() != ExecutionState::Finished {
            return VmPtr::Null;
        }
        let initial = self.initial_function.as_ref().expect("finished without function");
        let rt = &initial.return_type;
        if rt.is_reference {
            return VmPtr::decode(self.regs.value_register);
        }
        if rt.is_object() {
            return self.return_object();
        }
        VmPtr::Null
    }

    /// The returned object: from the on-stack sink for aggregate returns,
    /// otherwise from the object register.
    #[must_use]
    pub fn return_object(&self) -> VmPtr {
        if self.state() != ExecutionState::Finished {
            return VmPtr::Null;
        }
        let initial = self.initial_function.as_ref().expect("finished without function");
        if !initial.return_type.is_object() {
            return VmPtr::Null;
        }
        if initial.return_type.is_reference {
            return VmPtr::decode(self.regs.value_register);
        }
        if initial.returns_on_stack() {
            let offset = if initial.object_type.is_some() { PTR_SLOTS as i32 } else { 0 };
            return self.ld_ptr(self.regs.frame_pointer, -offset);
        }
        self.regs.object_register
    }

    /// Address of the return value: the sink for aggregate returns, the
    /// object itself for handle and reference-type returns, `None` for
    /// scalars (read those through the typed getters).
    #[must_use]
    pub fn address_of_return_value(&self) -> Option<VmPtr> {
        if self.state() != ExecutionState::Finished {
            return None;
        }
        let initial = self.initial_function.as_ref()?;
        let rt = &initial.return_type;
        if !rt.is_reference && rt.is_object() {
            if initial.returns_on_stack() {
                let offset = if initial.object_type.is_some() { PTR_SLOTS as i32 } else { 0 };
                return Some(self.ld_ptr(self.regs.frame_pointer, -offset));
            }
            return Some(self.regs.object_register);
        }
        None
    }
}
