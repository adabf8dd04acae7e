//! The call protocol: entering script functions, resolving virtual and
//! interface methods, delegates, imports and the host bridge hand-off.

use std::rc::Rc;

use crate::context::Context;
use crate::error::{ExecutionState, exceptions};
use crate::function::{FuncKind, ScriptFunction};
use crate::memory::VmPtr;
use crate::types::PTR_SLOTS;

use super::stack::RESERVE_STACK;

impl Context {
    /// Sets up the interpreter for the prepared function on first entry.
    ///
    /// Delegates substitute their bound receiver, virtual and interface
    /// kinds resolve against the receiver written by `set_object`, and host
    /// kinds run to completion through the bridge.
    pub(crate) fn enter_prepared_function(&mut self) {
        debug_assert!(self.regs.program_pointer.is_none());
        let engine = self.engine.clone();
        let mut func = self.current_function.clone().expect("enter_prepared_function: no function");

        if func.kind == FuncKind::Delegate {
            let target = func.delegate.expect("delegate without target");
            // Make room for the bound receiver below the argument area.
            self.regs.stack_pointer = self.regs.stack_pointer.offset(-(PTR_SLOTS as i32));
            self.regs.frame_pointer = self.regs.frame_pointer.offset(-(PTR_SLOTS as i32));
            let sp = self.regs.stack_pointer;
            self.stack.write_slot64(sp, VmPtr::from(target.object).encode());

            func = engine.function(target.func);
            self.current_function = Some(func.clone());
        }

        let Some(func) = self.real_func(&func) else {
            return;
        };
        self.current_function = Some(func.clone());

        match func.kind {
            FuncKind::Script => {
                self.regs.program_pointer = Some(0);
                self.prepare_script_function();
            }
            FuncKind::Host => {
                debug_assert!(self.state() != ExecutionState::Deserialization);
                engine.call_host_function(self, func.id);
                if self.state() == ExecutionState::Active {
                    self.set_status(ExecutionState::Finished);
                }
            }
            _ => {
                // E.g. an unresolvable template stub.
                if self.state() != ExecutionState::Exception {
                    self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, false);
                }
            }
        }
    }

    /// Resolves the concrete callee for virtual, interface and imported
    /// kinds, using the receiver stored at the frame pointer. Raises and
    /// returns `None` when resolution fails.
    pub(crate) fn real_func(&mut self, func: &Rc<ScriptFunction>) -> Option<Rc<ScriptFunction>> {
        let engine = self.engine.clone();
        match func.kind {
            FuncKind::Virtual | FuncKind::Interface => {
                let receiver = self.ld_ptr(self.regs.frame_pointer, 0);
                let Some(obj) = receiver.as_object() else {
                    self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
                    return None;
                };
                let obj_type = engine.heap.borrow().type_of(obj);
                let info = engine.type_info(obj_type);

                let resolved = if func.kind == FuncKind::Virtual {
                    info.virtual_function_table.get(func.vf_table_idx as usize).copied()
                } else {
                    // Find the class method with the interface method's
                    // signature, following a virtual entry to the table.
                    info.methods.iter().copied().find_map(|m| {
                        let candidate = engine.function(m);
                        (candidate.signature_id == func.signature_id).then(|| {
                            if candidate.kind == FuncKind::Virtual {
                                info.virtual_function_table[candidate.vf_table_idx as usize]
                            } else {
                                m
                            }
                        })
                    })
                };

                match resolved.map(|id| engine.function(id)) {
                    Some(real) if real.signature_id == func.signature_id => Some(real),
                    _ => {
                        self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
                        None
                    }
                }
            }
            FuncKind::Imported => match engine.bound_import(func.import_slot) {
                Some(target) => Some(engine.function(target)),
                None => {
                    self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                    None
                }
            },
            _ => Some(func.clone()),
        }
    }

    /// Saves the caller's frame and enters a script callee.
    ///
    /// The registers must be synchronized before the call; on return they
    /// describe the callee's first instruction (or a raised fault).
    pub(crate) fn call_script_function(&mut self, func: Rc<ScriptFunction>) {
        debug_assert!(func.script.is_some());

        if self.push_call_state().is_err() {
            return;
        }

        // Current function and position switch before the stack grows so a
        // reservation fault unwinds against the callee.
        self.current_function = Some(func);
        self.regs.program_pointer = Some(0);

        self.prepare_script_function();
    }

    /// Lays out the callee frame: reserves stack (copying the argument area
    /// when a new block is entered), zeroes heap object variables, and
    /// allocates the local-variable space.
    pub(crate) fn prepare_script_function(&mut self) {
        let func = self.current_function.clone().expect("prepare_script_function: no function");
        let data = func.script_data();

        let old_sp = self.regs.stack_pointer;
        let need = data.stack_needed;
        if self.stack.block_count() == 0 || old_sp.slot < need + RESERVE_STACK {
            if !self.reserve_stack_space(need) {
                return;
            }
            if self.regs.stack_pointer != old_sp {
                self.stack.copy_slots(old_sp, self.regs.stack_pointer, func.args_total_on_stack());
            }
        }

        self.regs.frame_pointer = self.regs.stack_pointer;

        // Heap object variables must read as null before their allocation
        // runs; value objects are initialized by their constructors.
        let fp = self.regs.frame_pointer;
        for i in (0..data.variables.len()).rev() {
            let var = &func.script_data().variables[i];
            if var.stack_offset <= 0 {
                continue;
            }
            if var.on_heap && var.data_type.is_object() {
                let offset = var.stack_offset;
                self.st64(fp, offset, 0);
            }
        }

        self.regs.stack_pointer = self.regs.stack_pointer.offset(-(data.variable_space as i32));

        // Every script entry is a suspension point, so endless recursion
        // stays interruptible even without suspend instructions.
        if self.flags.process_suspend.load(std::sync::atomic::Ordering::Acquire) {
            if let Some(cb) = self.line_callback.clone() {
                cb(self);
            }
            if self.flags.do_suspend.load(std::sync::atomic::Ordering::Acquire) {
                self.set_status(ExecutionState::Suspended);
            }
        }
    }

    /// Dispatches an interface or virtual call against the receiver on the
    /// top of the stack, then enters the resolved script function.
    pub(crate) fn call_interface_method(&mut self, func: Rc<ScriptFunction>) {
        let engine = self.engine.clone();
        let receiver = VmPtr::decode(self.stack.read_slot64(self.regs.stack_pointer));
        let Some(obj) = receiver.as_object() else {
            // The pushed arguments are in flight; the unwinder disposes them.
            self.mark_args_for_cleanup();
            self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
            return;
        };

        let obj_type = engine.heap.borrow().type_of(obj);
        let info = engine.type_info(obj_type);

        let resolved = if func.kind == FuncKind::Interface {
            let Some(offset) = func.object_type.and_then(|intf| info.interface_offset(intf)) else {
                self.mark_args_for_cleanup();
                self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
                return;
            };
            info.virtual_function_table.get((func.vf_table_idx + offset) as usize).copied()
        } else {
            info.virtual_function_table.get(func.vf_table_idx as usize).copied()
        };

        let Some(real_id) = resolved else {
            self.mark_args_for_cleanup();
            self.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
            return;
        };
        let real = engine.function(real_id);
        debug_assert_eq!(real.signature_id, func.signature_id);

        self.call_script_function(real);
    }
}
