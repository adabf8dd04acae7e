//! The exception engine: catch search, frame unwinding and disposal.
//!
//! Unwinding replays each frame's object-variable-life events to rebuild
//! which variables were live at the fault position, then disposes exactly
//! those, the in-flight call arguments when the fault interrupted an
//! argument push, and the parameters the function owns. A caught exception
//! stops the unwind at the catching frame and restores the program and
//! stack pointers to the catch block.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::bytecode::op::{self, Opcode};
use crate::context::{CallStackEntry, Context};
use crate::error::{ExecutionState, MessageKind};
use crate::function::{FuncKind, FunctionId, ScriptFunction, TryCatchInfo, VarLifeEvent};
use crate::memory::VmPtr;
use crate::types::PTR_SLOTS;

impl Context {
    /// True when a try/catch range on any script frame covers the current
    /// position; decides `will_exception_be_caught` at raise time.
    pub(crate) fn find_try_catch(&self) -> bool {
        if let Some(func) = &self.current_function
            && let Some(data) = &func.script
            && let Some(pp) = self.regs.program_pointer
            && data.try_catch.iter().any(|t| pp >= t.try_pos && pp < t.catch_pos)
        {
            return true;
        }

        self.call_stack.iter().rev().any(|entry| {
            let CallStackEntry::Frame(frame) = entry else {
                return false;
            };
            let Some(data) = frame.function.script.as_ref() else {
                return false;
            };
            let Some(pp) = frame.program_pointer else {
                return false;
            };
            data.try_catch.iter().any(|t| pp >= t.try_pos && pp < t.catch_pos)
        })
    }

    /// Unwinds the stack after an exception (or before reuse of a dirty
    /// context). With `catch_exception` set, unwinding stops at the nearest
    /// frame whose try range covers the fault and resumes there; otherwise
    /// it runs to the nearest nested marker or the bottom.
    pub(crate) fn clean_stack(&mut self, catch_exception: bool) {
        self.in_exception_handler = true;

        let mut caught = self.clean_stack_frame(catch_exception);
        if !caught {
            // The unwind must observe exception status; the first frame was
            // already cleaned against the true fault position.
            self.set_status(ExecutionState::Exception);

            while !caught && !self.call_stack.is_empty() {
                if matches!(self.call_stack.last(), Some(CallStackEntry::Marker(_))) {
                    break;
                }
                self.pop_call_state();
                caught = self.clean_stack_frame(catch_exception);
            }
        }

        if caught {
            self.set_status(ExecutionState::Active);
        }
        self.in_exception_handler = false;
    }

    /// Cleans the current frame. Returns true when a try/catch range caught
    /// the exception here.
    pub(crate) fn clean_stack_frame(&mut self, catch_exception: bool) -> bool {
        let engine = self.engine.clone();
        let Some(func) = self.current_function.clone() else {
            return false;
        };
        if func.kind == FuncKind::Script && func.script.is_none() {
            let text = format!("Function {} was released before the cleanup", func.name);
            engine.write_message("", 0, 0, MessageKind::Error, &text);
            return false;
        }

        let mut caught = false;
        let mut catch_range: Option<TryCatchInfo> = None;

        if !self.stack_not_allocated && self.regs.program_pointer.is_some() {
            // Arguments being pushed for an interrupted call are disposed
            // against the callee's signature first.
            self.clean_args_on_stack();

            let pp = self.regs.program_pointer.expect("clean_stack_frame: program pointer lost");

            if catch_exception && func.script.is_some() {
                // Ranges are sorted by try position; the innermost covering
                // range wins.
                for t in &func.script_data().try_catch {
                    if pp >= t.try_pos && pp < t.catch_pos {
                        catch_range = Some(*t);
                        caught = true;
                    }
                    if pp < t.try_pos {
                        break;
                    }
                }
            }

            if let Some(data) = func.script.as_ref() {
                if !caught {
                    self.regs.stack_pointer =
                        self.regs.stack_pointer.offset(data.variable_space as i32);
                }

                let live = self.determine_live_objects(0);
                let fp = self.regs.frame_pointer;

                for n in 0..data.variables.len() {
                    let var = &func.script_data().variables[n];
                    let pos = var.stack_offset;

                    if caught && self.declared_before_try(&func, pos, &catch_range.expect("caught without range")) {
                        // A catch preserves variables that existed before
                        // the try block.
                        continue;
                    }

                    if var.on_heap {
                        let v = self.ld_ptr(fp, pos);
                        if !v.is_null() {
                            if var.data_type.is_object() && !var.data_type.is_reference {
                                engine.dispose_ptr(self, v, var.data_type.type_id);
                            }
                            self.st64(fp, pos, 0);
                        }
                    } else if live.get(n).copied().unwrap_or(0) > 0 {
                        // A value object constructed in place on the stack.
                        let info = engine.type_info(var.data_type.type_id);
                        if let Some(destruct) = info.beh.destruct {
                            engine.call_behaviour(self, destruct, fp.offset(-pos).to_ptr());
                        }
                    }
                }
            }
        } else {
            self.stack_not_allocated = false;
        }

        if let Some(range) = catch_range {
            let data = func.script_data();
            self.regs.stack_pointer = self
                .regs
                .frame_pointer
                .offset(-((range.stack_size + data.variable_space) as i32));
            self.regs.program_pointer = Some(range.catch_pos);
            return true;
        }

        // Functions declared as not owning their receiver and parameters
        // skip this disposal.
        if func.dont_cleanup_on_exception {
            return false;
        }

        let fp = self.regs.frame_pointer;
        let mut offset: i32 = 0;
        if func.object_type.is_some() {
            offset += PTR_SLOTS as i32;
        }
        if func.returns_on_stack() {
            offset += PTR_SLOTS as i32;
        }
        for p in &func.params {
            if p.is_object() && !p.is_reference {
                let v = self.ld_ptr(fp, -offset);
                if !v.is_null() {
                    engine.dispose_ptr(self, v, p.type_id);
                    self.st64(fp, -offset, 0);
                }
            }
            offset += p.size_on_stack() as i32;
        }

        false
    }

    /// Whether the variable occupying `pos` was declared before the try
    /// range; only such variables survive a catch.
    fn declared_before_try(&self, func: &Rc<ScriptFunction>, pos: i32, range: &TryCatchInfo) -> bool {
        for info in &func.script_data().object_var_info {
            if info.variable_offset == pos && info.event == VarLifeEvent::VarDecl {
                if info.program_pos < range.try_pos {
                    return true;
                }
                if info.program_pos < range.catch_pos {
                    return false;
                }
            }
        }
        // Unidentified declarations (temporaries) are always cleaned.
        false
    }

    /// Replays the object-variable-life events of a stack level up to its
    /// program position, producing a per-variable live count.
    pub(crate) fn determine_live_objects(&self, stack_level: u32) -> SmallVec<[i32; 16]> {
        let Some((func, pp, _, _)) = self.frame_at(stack_level) else {
            return SmallVec::new();
        };
        let Some(data) = func.script.as_ref() else {
            return SmallVec::new();
        };
        let mut live: SmallVec<[i32; 16]> = SmallVec::new();
        live.resize(data.variables.len(), 0);

        let Some(mut pos) = pp else {
            return live;
        };
        if stack_level == 0 {
            if self.state() == ExecutionState::Exception {
                // The faulting instruction never completed.
                pos = pos.saturating_sub(1);
            }
        } else {
            // The call at this position is still executing; its result is
            // not alive here yet.
            pos = pos.saturating_sub(1);
        }

        // Find how far execution ran, then walk the events backwards.
        let Some(first_after) = data.object_var_info.iter().position(|i| i.program_pos > pos) else {
            return live;
        };

        let mut n = first_after as i64 - 1;
        while n >= 0 {
            let info = data.object_var_info[n as usize];
            match info.event {
                VarLifeEvent::Uninit => {
                    if let Some(v) = self.var_for_offset(&func, stack_level, info.variable_offset) {
                        live[v] -= 1;
                    }
                }
                VarLifeEvent::Init => {
                    if let Some(v) = self.var_for_offset(&func, stack_level, info.variable_offset) {
                        live[v] += 1;
                    }
                }
                VarLifeEvent::BlockBegin | VarLifeEvent::VarDecl => {}
                VarLifeEvent::BlockEnd => {
                    // Everything inside the skipped block is out of scope.
                    let mut nested = 1;
                    while nested > 0 && n > 0 {
                        n -= 1;
                        match data.object_var_info[n as usize].event {
                            VarLifeEvent::BlockEnd => nested += 1,
                            VarLifeEvent::BlockBegin => nested -= 1,
                            _ => {}
                        }
                    }
                }
            }
            n -= 1;
        }

        live
    }

    /// Maps a stack offset back to the variable currently occupying it;
    /// scopes disambiguate offsets shared by several variables.
    fn var_for_offset(&self, func: &Rc<ScriptFunction>, stack_level: u32, offset: i32) -> Option<usize> {
        let data = func.script.as_ref()?;
        (0..data.variables.len())
            .find(|&v| data.variables[v].stack_offset == offset && self.is_var_in_scope(v as u32, stack_level))
    }

    /// Disposes the arguments already pushed for the call the fault
    /// interrupted, identified by re-reading the call instruction just
    /// before the program pointer.
    pub(crate) fn clean_args_on_stack(&mut self) {
        if !self.needs_cleanup_args {
            return;
        }
        let engine = self.engine.clone();
        let func = self.current_function.clone().expect("clean_args_on_stack: no function");
        let data = func.script_data();
        let pp = self.regs.program_pointer.expect("clean_args_on_stack: program pointer lost") as usize;

        let mut at = 0usize;
        let mut prev = None;
        while at < pp {
            prev = Some(at);
            let opcode = op::decode(&data.bytecode, at).expect("clean_args_on_stack: bad bytecode");
            at += opcode.size();
        }
        let prev = prev.expect("clean_args_on_stack: fault before first instruction");
        let opcode = op::decode(&data.bytecode, prev).expect("clean_args_on_stack: bad bytecode");

        let callee: Option<Rc<ScriptFunction>> = match opcode {
            Opcode::Call
            | Opcode::CallHost
            | Opcode::CallHostSingle
            | Opcode::CallInterface
            | Opcode::CallImported => {
                Some(engine.function(FunctionId(op::int_arg(&data.bytecode, prev) as u32)))
            }
            Opcode::CallFuncPtr => {
                let var = i32::from(op::sword0(&data.bytecode, prev));
                self.funcdef_for_slot(&func, var)
            }
            _ => {
                debug_assert!(false, "cleanup flagged on a non-call instruction");
                None
            }
        };

        let Some(callee) = callee else {
            self.needs_cleanup_args = false;
            return;
        };

        let sp = self.regs.stack_pointer;
        let mut offset: i32 = 0;
        if callee.object_type.is_some() {
            offset += PTR_SLOTS as i32;
        }
        if callee.returns_on_stack() {
            offset += PTR_SLOTS as i32;
        }
        for p in &callee.params {
            if p.is_object() && !p.is_reference {
                let slot = sp.offset(offset);
                let v = VmPtr::decode(self.stack.read_slot64(slot));
                if !v.is_null() {
                    engine.dispose_ptr(self, v, p.type_id);
                    self.stack.write_slot64(slot, 0);
                }
            }
            offset += p.size_on_stack() as i32;
        }

        self.regs.stack_pointer = self.regs.stack_pointer.offset(offset);
        self.needs_cleanup_args = false;
    }

    /// Finds the funcdef signature of the function handle stored in a local
    /// or parameter slot, for cleaning a faulted pointer call.
    fn funcdef_for_slot(&self, func: &Rc<ScriptFunction>, var: i32) -> Option<Rc<ScriptFunction>> {
        let engine = self.engine.clone();
        let data = func.script.as_ref()?;

        for v in &data.variables {
            if v.stack_offset == var {
                return engine.type_info(v.data_type.type_id).funcdef.map(|id| engine.function(id));
            }
        }

        let mut param_pos: i32 = 0;
        if func.object_type.is_some() {
            param_pos -= PTR_SLOTS as i32;
        }
        if func.returns_on_stack() {
            param_pos -= PTR_SLOTS as i32;
        }
        for p in &func.params {
            if var == param_pos {
                if p.is_object() {
                    return engine.type_info(p.type_id).funcdef.map(|id| engine.function(id));
                }
                break;
            }
            param_pos -= p.size_on_stack() as i32;
        }
        None
    }

    /// Disposes whatever the finished or abandoned execution left in the
    /// return registers or the on-stack return sink.
    pub(crate) fn clean_return_object(&mut self) {
        let engine = self.engine.clone();

        if let Some(initial) = self.initial_function.clone()
            && initial.returns_on_stack()
            && self.state() == ExecutionState::Finished
        {
            // The value was constructed in the caller-provided sink.
            let info = engine.type_info(initial.return_type.type_id);
            if let Some(destruct) = info.beh.destruct {
                let offset = if initial.object_type.is_some() { PTR_SLOTS as i32 } else { 0 };
                let sink = self.ld_ptr(self.regs.frame_pointer, -offset);
                if !sink.is_null() {
                    engine.call_behaviour(self, destruct, sink);
                }
            }
            return;
        }

        if self.regs.object_register.is_null() {
            return;
        }
        let Some(object_type) = self.regs.object_type else {
            self.regs.object_register = VmPtr::Null;
            return;
        };

        match self.regs.object_register {
            VmPtr::Func(_) => {
                // Function handles are engine-owned; dropping the register
                // reference is the release.
            }
            ptr => {
                if let Some(id) = ptr.as_object() {
                    let flags = engine.type_info(object_type).flags;
                    if flags.contains(crate::types::TypeFlags::REFERENCE)
                        || flags.contains(crate::types::TypeFlags::SCRIPT_OBJECT)
                    {
                        engine.release_ref_object(self, id);
                    } else {
                        engine.destroy_value_object(self, id, object_type);
                    }
                }
            }
        }
        self.regs.object_register = VmPtr::Null;
        self.regs.object_type = None;
    }
}
