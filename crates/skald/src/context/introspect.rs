//! Introspection: call stack, line numbers, variables in scope, the
//! receiver, and arguments pending on the stack for an interrupted call.

use std::rc::Rc;

use crate::bytecode::op::{self, Opcode};
use crate::context::{CallStackEntry, Context, StackAddr};
use crate::error::VmError;
use crate::function::{FuncKind, FunctionId, ScriptFunction, VarLifeEvent};
use crate::memory::VmPtr;
use crate::types::{DataType, PTR_SLOTS, RefModifier, TypeFlags, TypeId};

/// Description of one variable of a stack level.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub data_type: DataType,
    pub stack_offset: i32,
    pub on_heap: bool,
}

/// Cached result of a pending-arguments scan, keyed by function and
/// program position so repeated queries avoid rescanning.
pub(crate) struct ArgsOnStackCache {
    pub func: FunctionId,
    pub program_pos: u32,
    pub sp: StackAddr,
    pub entries: Vec<(DataType, RefModifier)>,
}

impl Context {
    /// Frames on the call stack, including the current one.
    #[must_use]
    pub fn callstack_size(&self) -> u32 {
        if self.current_function.is_none() {
            return 0;
        }
        1 + self.call_stack.len() as u32
    }

    /// The function executing at a stack level; `None` for nested markers.
    #[must_use]
    pub fn function(&self, stack_level: u32) -> Option<FunctionId> {
        self.frame_at(stack_level).map(|(f, ..)| f.id)
    }

    /// Function, program position, frame pointer and stack pointer of a
    /// stack level; `None` for markers and out-of-range levels.
    pub(crate) fn frame_at(
        &self,
        stack_level: u32,
    ) -> Option<(Rc<ScriptFunction>, Option<u32>, StackAddr, StackAddr)> {
        if stack_level >= self.callstack_size() {
            return None;
        }
        if stack_level == 0 {
            let func = self.current_function.clone()?;
            return Some((func, self.regs.program_pointer, self.regs.frame_pointer, self.regs.stack_pointer));
        }
        let index = self.call_stack.len() - stack_level as usize;
        match &self.call_stack[index] {
            CallStackEntry::Frame(frame) => Some((
                frame.function.clone(),
                frame.program_pointer,
                frame.frame_pointer,
                frame.stack_pointer,
            )),
            CallStackEntry::Marker(_) => None,
        }
    }

    /// Line, column and section index at a stack level. Saved frames report
    /// the call site rather than the instruction after it.
    #[must_use]
    pub fn line_number(&self, stack_level: u32) -> Option<(u32, u32, u32)> {
        let (func, pp, _, _) = self.frame_at(stack_level)?;
        func.script.as_ref()?;
        let pos = match pp {
            // Before execution starts the position is the function entry.
            None => 0,
            Some(p) if stack_level > 0 => p.saturating_sub(1),
            Some(p) => p,
        };
        Some(func.line_number(pos))
    }

    /// Number of declared variables at a stack level.
    #[must_use]
    pub fn var_count(&self, stack_level: u32) -> Option<u32> {
        let (func, ..) = self.frame_at(stack_level)?;
        Some(func.script.as_ref()?.variables.len() as u32)
    }

    /// Descriptor of one variable at a stack level.
    #[must_use]
    pub fn var(&self, var_index: u32, stack_level: u32) -> Option<VarInfo> {
        let (func, ..) = self.frame_at(stack_level)?;
        let var = func.script.as_ref()?.variables.get(var_index as usize)?;
        Some(VarInfo {
            name: var.name.clone(),
            data_type: var.data_type,
            stack_offset: var.stack_offset,
            on_heap: var.on_heap,
        })
    }

    /// Address of a variable's value.
    ///
    /// Heap object variables and reference parameters are dereferenced
    /// unless `dont_dereference` is set. For value objects living on the
    /// stack, `None` is returned while the object is not alive unless
    /// `return_uninitialized` asks for the raw slot.
    #[must_use]
    pub fn address_of_var(
        &self,
        var_index: u32,
        stack_level: u32,
        dont_dereference: bool,
        return_uninitialized: bool,
    ) -> Option<VmPtr> {
        self.regs.program_pointer?;
        let (func, _, fp, _) = self.frame_at(stack_level)?;
        let data = func.script.as_ref()?;
        let var = data.variables.get(var_index as usize)?;

        let pos = var.stack_offset;
        let slot_addr = fp.offset(-pos).to_ptr();

        if (var.data_type.is_object() && !var.data_type.is_handle) || pos <= 0 {
            let mut on_heap = var.on_heap;

            if var.data_type.is_object()
                && !var.data_type.is_handle
                && !var.data_type.is_reference
                && self.engine.type_info(var.data_type.type_id).flags.contains(TypeFlags::VALUE)
                && !on_heap
                && !return_uninitialized
            {
                let live = self.determine_live_objects(stack_level);
                if live.get(var_index as usize).copied().unwrap_or(0) <= 0 {
                    return None;
                }
            }

            if !on_heap && pos <= 0 && var.data_type.is_reference {
                on_heap = true;
            }

            if on_heap && !dont_dereference {
                return Some(VmPtr::decode(self.mem_read_u64(slot_addr)));
            }
        }

        Some(slot_addr)
    }

    /// Whether a variable is visible at the program position of a stack
    /// level, determined by its declaration point and a replay of the
    /// block-begin/block-end events.
    #[must_use]
    pub fn is_var_in_scope(&self, var_index: u32, stack_level: u32) -> bool {
        if self.regs.program_pointer.is_none() {
            return false;
        }
        let Some((func, pp, _, _)) = self.frame_at(stack_level) else {
            return false;
        };
        let Some(data) = func.script.as_ref() else {
            return false;
        };
        let Some(var) = data.variables.get(var_index as usize) else {
            return false;
        };
        let pos = pp.unwrap_or(0);
        if var.declared_at > pos {
            return false;
        }
        let declared_at = var.declared_at;

        // Temporaries have no declaration event and live for the whole call.
        let mut found_decl = var.name.is_empty();

        for n in 0..data.object_var_info.len() {
            let info = data.object_var_info[n];
            if info.program_pos >= declared_at {
                // Skip events at the declaration position that precede the
                // declaration itself.
                if info.program_pos == declared_at && !found_decl && info.event != VarLifeEvent::VarDecl {
                    continue;
                }
                found_decl = true;

                // The variable left scope if its block closed before `pos`.
                let mut depth = 0i32;
                for later in &data.object_var_info[n..] {
                    if later.program_pos > pos {
                        break;
                    }
                    match later.event {
                        VarLifeEvent::BlockBegin => depth += 1,
                        VarLifeEvent::BlockEnd => {
                            depth -= 1;
                            if depth < 0 {
                                return false;
                            }
                        }
                        _ => {}
                    }
                }
                break;
            }
        }

        true
    }

    /// The receiver of the method executing at a stack level.
    #[must_use]
    pub fn this_pointer(&self, stack_level: u32) -> VmPtr {
        let Some((func, _, fp, _)) = self.frame_at(stack_level) else {
            return VmPtr::Null;
        };
        if func.object_type.is_none() {
            return VmPtr::Null;
        }
        self.ld_ptr(fp, 0)
    }

    /// Type of the receiver at a stack level; `None` outside methods.
    #[must_use]
    pub fn this_type_id(&self, stack_level: u32) -> Option<TypeId> {
        let (func, ..) = self.frame_at(stack_level)?;
        func.object_type
    }

    // ---- arguments pending on the stack ------------------------------------

    /// Counts the argument values already pushed for calls in progress at a
    /// stack level, rebuilding the scan cache.
    pub fn args_on_stack_count(&mut self, stack_level: u32) -> Result<u32, VmError> {
        self.args_cache = None;

        if self.regs.program_pointer.is_none() {
            return Err(VmError::Error);
        }
        let Some((func, pp, fp, sp)) = self.frame_at(stack_level) else {
            return Err(VmError::InvalidArg);
        };
        let Some(data) = func.script.as_ref() else {
            return Err(VmError::Error);
        };
        let Some(pp) = pp else {
            return Err(VmError::Error);
        };

        // Anything between the local-variable region and the stack pointer
        // is pending argument data.
        let mut stack_pos = (fp.slot - sp.slot) as i32 - data.variable_space as i32;

        // Arguments consumed by the frame above belong to that call.
        let called = if stack_level == 0 {
            None
        } else if stack_level == 1 {
            self.current_function.clone()
        } else {
            self.frame_at(stack_level - 1).map(|(f, ..)| f)
        };
        if let Some(called) = called {
            stack_pos -= called.args_total_on_stack() as i32;
        }

        let mut entries: Vec<(DataType, RefModifier)> = Vec::new();
        let mut progpos = pp;

        while stack_pos > 0 {
            let Some((callee, mut to_push, next)) = self.find_next_function_called(&func, progpos) else {
                break;
            };
            progpos = next;

            // Hidden slots are pushed right before the call, so they count
            // toward what is still missing.
            if to_push > 0 && callee.returns_on_stack() {
                to_push -= PTR_SLOTS as i32;
            }
            if to_push > 0 && callee.object_type.is_some() {
                to_push -= PTR_SLOTS as i32;
            }

            // Parameters are pushed last-to-first; what is still to come is
            // the front of the list.
            let mut param: i64 = -1;
            while to_push > 0 && (param + 1) < callee.params.len() as i64 {
                param += 1;
                to_push -= callee.params[param as usize].size_on_stack() as i32;
            }

            while stack_pos > 0 {
                param += 1;
                if (param as usize) >= callee.params.len() {
                    // The rest belongs to an enclosing call.
                    break;
                }
                let p = callee.params[param as usize];
                stack_pos -= p.size_on_stack() as i32;
                entries.push((p, callee.inout_flags[param as usize]));
            }
        }

        let count = entries.len() as u32;
        self.args_cache = Some(ArgsOnStackCache { func: func.id, program_pos: pp, sp, entries });
        Ok(count)
    }

    /// Type, reference modifier and address of one pending argument.
    pub fn arg_on_stack(
        &mut self,
        stack_level: u32,
        arg: u32,
    ) -> Result<(DataType, RefModifier, VmPtr), VmError> {
        let stale = match (&self.args_cache, self.frame_at(stack_level)) {
            (Some(cache), Some((func, Some(pp), _, _))) => cache.func != func.id || cache.program_pos != pp,
            _ => true,
        };
        if stale {
            self.args_on_stack_count(stack_level)?;
        }

        let cache = self.args_cache.as_ref().ok_or(VmError::Error)?;
        let entry = cache.entries.get(arg as usize).copied().ok_or(VmError::InvalidArg)?;
        let offset: u32 = cache.entries[..arg as usize].iter().map(|(p, _)| p.size_on_stack()).sum();
        Ok((entry.0, entry.1, cache.sp.offset(offset as i32).to_ptr()))
    }

    /// Scans forward from a program position to the next call, summing the
    /// stack effect of the instructions in between.
    fn find_next_function_called(
        &self,
        func: &Rc<ScriptFunction>,
        from: u32,
    ) -> Option<(Rc<ScriptFunction>, i32, u32)> {
        let engine = self.engine.clone();
        let data = func.script.as_ref()?;
        let code = &data.bytecode;
        let mut at = from as usize;
        let mut delta = 0i32;

        while at < code.len() {
            let opcode = op::decode(code, at)?;
            match opcode.push_delta() {
                Some(d) => {
                    delta += d;
                    at += opcode.size();
                }
                None => {
                    let callee = match opcode {
                        Opcode::Call
                        | Opcode::CallHost
                        | Opcode::CallHostSingle
                        | Opcode::CallInterface
                        | Opcode::CallImported => {
                            Some(engine.function(FunctionId(op::int_arg(code, at) as u32)))
                        }
                        Opcode::CallFuncPtr => {
                            let var = i32::from(op::sword0(code, at));
                            self.funcdef_for_call_scan(func, var)
                        }
                        Opcode::Alloc => {
                            let ctor = op::dword_at(code, at, 3);
                            (ctor != 0).then(|| engine.function(FunctionId(ctor)))
                        }
                        _ => None,
                    };
                    let next = (at + opcode.size()) as u32;
                    return callee.map(|c| (c, delta, next));
                }
            }
        }
        None
    }

    fn funcdef_for_call_scan(&self, func: &Rc<ScriptFunction>, var: i32) -> Option<Rc<ScriptFunction>> {
        let engine = self.engine.clone();
        let data = func.script.as_ref()?;
        for v in &data.variables {
            if v.stack_offset == var && v.data_type.is_object() {
                return engine.type_info(v.data_type.type_id).funcdef.map(|id| engine.function(id));
            }
        }
        None
    }

    /// Serial of this context for correlation with the thread-local
    /// active-contexts stack.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The current function's kind, useful to hosts deciding how to resume.
    #[must_use]
    pub fn current_function_kind(&self) -> Option<FuncKind> {
        self.current_function.as_ref().map(|f| f.kind)
    }
}
