//! The execution context: per-call owner of the interpreter state.

pub mod args;
pub mod call;
pub mod exec;
pub mod introspect;
pub mod regs;
pub mod serialize;
pub mod stack;
pub mod unwind;

use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::error::{ExecutionState, VmError, exceptions};
use crate::function::{FunctionId, ScriptFunction};
use crate::memory::VmPtr;
use crate::tls;
use crate::types::{TypeFlags, TypeId};

pub use regs::{Registers, SuspendHandle};
pub use stack::{DataStack, StackAddr};

use introspect::ArgsOnStackCache;
use regs::SuspendFlags;
use stack::RESERVE_STACK;

/// A saved interpreter frame on the call stack.
#[derive(Debug, Clone)]
pub(crate) struct SavedFrame {
    pub frame_pointer: StackAddr,
    pub function: Rc<ScriptFunction>,
    pub program_pointer: Option<u32>,
    pub stack_pointer: StackAddr,
    pub stack_index: u32,
}

/// Host-facing state parked when the context is reused for a nested call.
#[derive(Debug, Clone)]
pub(crate) struct NestedState {
    pub calling_system_function: Option<FunctionId>,
    pub initial_function: Option<Rc<ScriptFunction>>,
    pub original_stack_pointer: StackAddr,
    pub original_stack_index: u32,
    pub arguments_size: u32,
    pub value_register: u64,
    pub object_register: VmPtr,
    pub object_type: Option<TypeId>,
}

/// One call-stack entry. The nested marker is the distinguished frame whose
/// first slot would be zero in a flat layout; here it is its own variant,
/// which keeps the "script functions are never null" invariant by type.
#[derive(Debug, Clone)]
pub(crate) enum CallStackEntry {
    Frame(SavedFrame),
    Marker(NestedState),
}

/// Details of the current (or most recent) script exception.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExceptionInfo {
    pub string: String,
    pub function: Option<FunctionId>,
    pub line: u32,
    pub column: u32,
    pub section_idx: u32,
    pub will_be_caught: bool,
}

/// The execution context.
///
/// Owns a register bundle, a segmented data stack, a call stack and the
/// exception state; drives the interpreter through [`Context::execute`]. A
/// context is bound to the thread that calls `execute`; other threads
/// interact with it only through its [`SuspendHandle`].
pub struct Context {
    engine: Rc<Engine>,
    serial: u64,
    status: ExecutionState,
    pub(crate) regs: Registers,
    pub(crate) stack: DataStack,
    pub(crate) stack_index: u32,
    pub(crate) call_stack: Vec<CallStackEntry>,
    pub(crate) current_function: Option<Rc<ScriptFunction>>,
    pub(crate) initial_function: Option<Rc<ScriptFunction>>,
    pub(crate) calling_system_function: Option<FunctionId>,
    pub(crate) original_stack_pointer: StackAddr,
    pub(crate) original_stack_index: u32,
    pub(crate) arguments_size: u32,
    pub(crate) return_value_size: u32,
    pub(crate) flags: Arc<SuspendFlags>,
    pub(crate) line_callback: Option<Rc<dyn Fn(&Context)>>,
    pub(crate) exception_callback: Option<Rc<dyn Fn(&Context)>>,
    pub(crate) exception: ExceptionInfo,
    pub(crate) in_exception_handler: bool,
    pub(crate) stack_not_allocated: bool,
    pub(crate) needs_cleanup_args: bool,
    user_data: Vec<(u64, Rc<dyn Any>)>,
    pub(crate) args_cache: Option<ArgsOnStackCache>,
}

impl Context {
    /// Creates a context against an engine.
    #[must_use]
    pub fn new(engine: &Rc<Engine>) -> Context {
        Context {
            engine: engine.clone(),
            serial: engine.next_serial(),
            status: ExecutionState::Uninitialized,
            regs: Registers::default(),
            stack: DataStack::new(engine.config().init_context_stack_size),
            stack_index: 0,
            call_stack: Vec::new(),
            current_function: None,
            initial_function: None,
            calling_system_function: None,
            original_stack_pointer: StackAddr::default(),
            original_stack_index: 0,
            arguments_size: 0,
            return_value_size: 0,
            flags: Arc::new(SuspendFlags::default()),
            line_callback: None,
            exception_callback: None,
            exception: ExceptionInfo::default(),
            in_exception_handler: false,
            stack_not_allocated: false,
            needs_cleanup_args: false,
            user_data: Vec::new(),
            args_cache: None,
        }
    }

    #[must_use]
    pub fn engine(&self) -> Rc<Engine> {
        self.engine.clone()
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.status
    }

    #[must_use]
    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    /// Handle for requesting suspension or abort from another thread.
    #[must_use]
    pub fn suspend_handle(&self) -> SuspendHandle {
        SuspendHandle { flags: self.flags.clone() }
    }

    pub(crate) fn set_status(&mut self, status: ExecutionState) {
        self.status = status;
    }

    pub(crate) fn set_calling_system_function(&mut self, f: Option<FunctionId>) {
        self.calling_system_function = f;
    }

    /// The host function currently being bridged, if any.
    #[must_use]
    pub fn system_function(&self) -> Option<FunctionId> {
        self.calling_system_function
    }

    pub(crate) fn set_return_registers(&mut self, value: u64, object: VmPtr, object_type: Option<TypeId>) {
        self.regs.value_register = value;
        self.regs.object_register = object;
        self.regs.object_type = object_type;
    }

    pub(crate) fn mark_args_for_cleanup(&mut self) {
        self.needs_cleanup_args = true;
    }

    // ---- memory access through VM addresses --------------------------------

    fn mem_read(&self, ptr: VmPtr, buf: &mut [u8]) {
        match ptr {
            VmPtr::Stack { block, byte } => {
                assert!(self.stack.read_bytes(block, byte, buf), "read outside stack block {block} at byte {byte}");
            }
            VmPtr::Global { byte } => {
                let globals = self.engine.globals.borrow();
                let at = byte as usize;
                buf.copy_from_slice(&globals[at..at + buf.len()]);
            }
            VmPtr::Object { id, byte } => {
                let heap = self.engine.heap.borrow();
                let bytes = heap.bytes(id);
                let at = byte as usize;
                buf.copy_from_slice(&bytes[at..at + buf.len()]);
            }
            other => panic!("read through non-data address {other:?}"),
        }
    }

    fn mem_write(&mut self, ptr: VmPtr, src: &[u8]) {
        match ptr {
            VmPtr::Stack { block, byte } => {
                assert!(self.stack.write_bytes(block, byte, src), "write outside stack block {block} at byte {byte}");
            }
            VmPtr::Global { byte } => {
                let mut globals = self.engine.globals.borrow_mut();
                let at = byte as usize;
                globals[at..at + src.len()].copy_from_slice(src);
            }
            VmPtr::Object { id, byte } => {
                let mut heap = self.engine.heap.borrow_mut();
                let bytes = heap.bytes_mut(id);
                let at = byte as usize;
                bytes[at..at + src.len()].copy_from_slice(src);
            }
            other => panic!("write through non-data address {other:?}"),
        }
    }

    #[must_use]
    pub fn mem_read_u8(&self, ptr: VmPtr) -> u8 {
        let mut buf = [0u8; 1];
        self.mem_read(ptr, &mut buf);
        buf[0]
    }

    #[must_use]
    pub fn mem_read_u16(&self, ptr: VmPtr) -> u16 {
        let mut buf = [0u8; 2];
        self.mem_read(ptr, &mut buf);
        u16::from_le_bytes(buf)
    }

    #[must_use]
    pub fn mem_read_u32(&self, ptr: VmPtr) -> u32 {
        let mut buf = [0u8; 4];
        self.mem_read(ptr, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[must_use]
    pub fn mem_read_u64(&self, ptr: VmPtr) -> u64 {
        let mut buf = [0u8; 8];
        self.mem_read(ptr, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn mem_write_u8(&mut self, ptr: VmPtr, v: u8) {
        self.mem_write(ptr, &[v]);
    }

    pub fn mem_write_u16(&mut self, ptr: VmPtr, v: u16) {
        self.mem_write(ptr, &v.to_le_bytes());
    }

    pub fn mem_write_u32(&mut self, ptr: VmPtr, v: u32) {
        self.mem_write(ptr, &v.to_le_bytes());
    }

    pub fn mem_write_u64(&mut self, ptr: VmPtr, v: u64) {
        self.mem_write(ptr, &v.to_le_bytes());
    }

    /// Copies dwords between two data addresses.
    pub(crate) fn mem_copy_dwords(&mut self, dst: VmPtr, src: VmPtr, dwords: u32) {
        let mut buf = vec![0u8; dwords as usize * 4];
        self.mem_read(src, &mut buf);
        self.mem_write(dst, &buf);
    }

    // ---- frame-relative variable access ------------------------------------

    pub(crate) fn ld32(&self, fp: StackAddr, off: i32) -> u32 {
        self.stack.read_slot(fp.offset(-off))
    }

    pub(crate) fn st32(&mut self, fp: StackAddr, off: i32, v: u32) {
        self.stack.write_slot(fp.offset(-off), v);
    }

    pub(crate) fn ld64(&self, fp: StackAddr, off: i32) -> u64 {
        self.stack.read_slot64(fp.offset(-off))
    }

    pub(crate) fn st64(&mut self, fp: StackAddr, off: i32, v: u64) {
        self.stack.write_slot64(fp.offset(-off), v);
    }

    pub(crate) fn ld_ptr(&self, fp: StackAddr, off: i32) -> VmPtr {
        VmPtr::decode(self.ld64(fp, off))
    }

    pub(crate) fn st_ptr(&mut self, fp: StackAddr, off: i32, p: VmPtr) {
        self.st64(fp, off, p.encode());
    }

    // ---- stack reservation -------------------------------------------------

    /// Ensures `size` slots plus headroom below the stack pointer, advancing
    /// to (and allocating) larger blocks as needed. On advance the stack
    /// pointer is placed to leave room for the current function's argument
    /// area at the top of the new block.
    ///
    /// On exceeding the configured cap this raises *stack-overflow*, flags
    /// the frame as not allocated so unwind skips it, and returns false.
    pub(crate) fn reserve_stack_space(&mut self, size: u32) -> bool {
        if self.stack.block_count() == 0 {
            let top = self.stack.ensure_block(0);
            self.stack_index = 0;
            self.regs.stack_pointer = top;
        }

        while self.regs.stack_pointer.slot < size + RESERVE_STACK {
            let max = self.engine.config().max_context_stack_size;
            if max != 0 && self.stack.total_slots_through(self.stack_index) >= max {
                self.stack_not_allocated = true;
                // The frame pointer still has to be valid for the unwinder.
                self.regs.frame_pointer = self.regs.stack_pointer;
                self.set_internal_exception(exceptions::STACK_OVERFLOW, true);
                return false;
            }

            self.stack_index += 1;
            let top = self.stack.ensure_block(self.stack_index);

            // Leave room to copy the callee's argument area over.
            let args = self.current_function.as_ref().map_or(0, |f| f.args_total_on_stack());
            self.regs.stack_pointer = StackAddr { block: self.stack_index, slot: top.slot - args };
        }

        true
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Prepares the context to execute `func_id`.
    ///
    /// Reserves the frame (arguments, return sink and the function's stack
    /// need), zeroes the argument area, and wires the return-sink pointer
    /// for functions returning an aggregate on the stack.
    pub fn prepare(&mut self, func_id: FunctionId) -> Result<(), VmError> {
        let engine = self.engine.clone();
        let Some(func) = engine.try_function(func_id) else {
            engine.report_api_error("Prepare", VmError::NoFunction);
            return Err(VmError::NoFunction);
        };

        if self.status == ExecutionState::Active || self.status == ExecutionState::Suspended {
            engine.report_api_error("Prepare", VmError::ContextActive);
            return Err(VmError::ContextActive);
        }

        // Clean the stack if a previous execution did not run to the end.
        if self.status != ExecutionState::Finished && self.status != ExecutionState::Uninitialized {
            self.clean_stack(false);
        }

        self.clean_return_object();

        if let Some(initial) = self.initial_function.clone() {
            self.release_prepared_object(&initial);
            self.regs.stack_pointer = self.original_stack_pointer;
            self.stack_index = self.original_stack_index;
        }

        if self.initial_function.as_ref().is_some_and(|f| f.id == func_id) {
            // Re-executing the same function skips the frame setup.
            self.current_function = self.initial_function.clone();
        } else {
            self.initial_function = Some(func.clone());
            self.current_function = Some(func.clone());

            self.arguments_size = func.space_for_params()
                + if func.object_type.is_some() { crate::types::PTR_SLOTS } else { 0 };
            if func.returns_on_stack() {
                self.return_value_size = func.return_type.size_in_memory_slots();
                self.arguments_size += crate::types::PTR_SLOTS;
            } else {
                self.return_value_size = 0;
            }

            let mut stack_size = self.arguments_size + self.return_value_size;
            if let Some(data) = func.script.as_ref() {
                stack_size += data.stack_needed;
            }
            if !self.reserve_stack_space(stack_size) {
                return Err(VmError::OutOfMemory);
            }

            self.call_stack.reserve(engine.config().init_call_stack_size as usize);
        }

        if self.status != ExecutionState::Finished {
            self.exception = ExceptionInfo::default();
            self.flags.do_abort.store(false, Ordering::Release);
            self.flags.do_suspend.store(false, Ordering::Release);
            self.flags.external_suspend.store(false, Ordering::Release);
            self.flags.process_suspend.store(self.line_callback.is_some(), Ordering::Release);
        }
        self.status = ExecutionState::Prepared;
        self.regs.program_pointer = None;

        // Lay the frame out below the previous stack pointer.
        self.regs.frame_pointer =
            self.regs.stack_pointer.offset(-((self.arguments_size + self.return_value_size) as i32));
        self.original_stack_pointer = self.regs.stack_pointer;
        self.original_stack_index = self.stack_index;
        self.regs.stack_pointer = self.regs.frame_pointer;

        for slot in 0..self.arguments_size {
            let at = self.regs.frame_pointer.offset(slot as i32);
            self.stack.write_slot(at, 0);
        }

        if self.return_value_size != 0 {
            let sink = self.regs.frame_pointer.offset(self.arguments_size as i32);
            let at = if func.object_type.is_some() {
                self.regs.frame_pointer.offset(crate::types::PTR_SLOTS as i32)
            } else {
                self.regs.frame_pointer
            };
            self.stack.write_slot64(at, sink.to_ptr().encode());
        }

        Ok(())
    }

    fn release_prepared_object(&mut self, initial: &Rc<ScriptFunction>) {
        let Some(obj_type) = initial.object_type else {
            return;
        };
        if !self.engine.type_info(obj_type).flags.contains(TypeFlags::SCRIPT_OBJECT) {
            return;
        }
        let fp = self.regs.frame_pointer;
        if let Some(id) = self.ld_ptr(fp, 0).as_object() {
            let engine = self.engine.clone();
            engine.release_ref_object(self, id);
            self.st64(fp, 0, 0);
        }
    }

    /// Releases everything the preparation acquired.
    ///
    /// Idempotent: unpreparing an uninitialized context succeeds without
    /// effect. Illegal while active or suspended.
    pub fn unprepare(&mut self) -> Result<(), VmError> {
        if self.status == ExecutionState::Active || self.status == ExecutionState::Suspended {
            return Err(VmError::ContextActive);
        }

        // Keep the context discoverable while cleanup behaviours run.
        let guard = tls::enter(self.serial);

        if self.status != ExecutionState::Uninitialized && self.status != ExecutionState::Finished {
            self.clean_stack(false);
        }
        debug_assert!(!self.needs_cleanup_args);

        self.clean_return_object();

        if let Some(initial) = self.initial_function.clone() {
            self.release_prepared_object(&initial);
            self.regs.stack_pointer = self.original_stack_pointer;
            self.stack_index = self.original_stack_index;
        }
        drop(guard);

        self.initial_function = None;
        self.current_function = None;
        self.regs.program_pointer = None;
        self.regs.frame_pointer = StackAddr::default();
        self.status = ExecutionState::Uninitialized;

        Ok(())
    }

    /// Runs the prepared (or suspended) execution until it finishes,
    /// suspends, aborts or raises an uncaught exception.
    pub fn execute(&mut self) -> Result<ExecutionState, VmError> {
        if self.status != ExecutionState::Suspended && self.status != ExecutionState::Prepared {
            self.engine.report_api_error("Execute", VmError::ContextNotPrepared);
            return Err(VmError::ContextNotPrepared);
        }

        self.status = ExecutionState::Active;
        let guard = tls::enter(self.serial);

        if tls::depth() as u32 > self.engine.config().max_nested_calls {
            self.set_internal_exception(exceptions::TOO_MANY_NESTED_CALLS, true);
        } else if self.regs.program_pointer.is_none() {
            self.enter_prepared_function();
        }

        let auto_gc = self.engine.config().auto_garbage_collect;
        let gc_pre = if auto_gc { self.engine.objects_created() } else { 0 };

        while self.status == ExecutionState::Active {
            self.execute_next();

            // A caught exception unwinds here, outside the dispatch loop, so
            // the unwinder sees registers already written back.
            if self.status == ExecutionState::Exception && self.exception.will_be_caught {
                self.clean_stack(true);
            }
        }

        if let Some(cb) = self.line_callback.clone() {
            // One last notification so listeners observe the state change.
            cb(self);
            self.flags.process_suspend.store(true, Ordering::Release);
        } else {
            self.flags.process_suspend.store(false, Ordering::Release);
        }
        self.flags.do_suspend.store(false, Ordering::Release);

        if auto_gc {
            let created = self.engine.objects_created().saturating_sub(gc_pre);
            if created > 0 {
                self.engine.garbage_collect(created);
            } else if self.engine.heap_stats().live_objects > 0 {
                self.engine.garbage_collect(1);
            }
        }

        drop(guard);

        if self.status == ExecutionState::Finished {
            self.regs.object_type = self
                .initial_function
                .as_ref()
                .filter(|f| f.return_type.is_object())
                .map(|f| f.return_type.type_id);
            return Ok(ExecutionState::Finished);
        }

        if self.flags.do_abort.swap(false, Ordering::AcqRel) {
            self.status = ExecutionState::Aborted;
            return Ok(ExecutionState::Aborted);
        }

        match self.status {
            ExecutionState::Suspended => Ok(ExecutionState::Suspended),
            ExecutionState::Exception => Ok(ExecutionState::Exception),
            _ => Err(VmError::Error),
        }
    }

    /// Requests cooperative suspension; takes effect at the next suspension
    /// point of a running execution.
    pub fn suspend(&self) {
        self.flags.request_suspend();
    }

    /// Requests cooperative abort. A context sitting in the suspended state
    /// transitions immediately.
    pub fn abort(&mut self) {
        if self.status == ExecutionState::Suspended {
            self.status = ExecutionState::Aborted;
        }
        self.flags.request_abort();
    }

    // ---- nested execution --------------------------------------------------

    /// Parks the active execution under a nested marker so the context can
    /// be prepared again for a host→script re-entry.
    pub fn push_state(&mut self) -> Result<(), VmError> {
        if self.status != ExecutionState::Active && self.status != ExecutionState::Deserialization {
            return Err(VmError::Error);
        }

        let max = self.engine.config().max_call_stack_size;
        if max != 0 && self.call_stack.len() + 2 > max as usize {
            // No state may change when the push cannot complete.
            return Err(VmError::OutOfMemory);
        }

        if self.push_call_state().is_err() {
            return Err(VmError::OutOfMemory);
        }

        self.call_stack.push(CallStackEntry::Marker(NestedState {
            calling_system_function: self.calling_system_function,
            initial_function: self.initial_function.clone(),
            original_stack_pointer: self.original_stack_pointer,
            original_stack_index: self.original_stack_index,
            arguments_size: self.arguments_size,
            value_register: self.regs.value_register,
            object_register: self.regs.object_register,
            object_type: self.regs.object_type,
        }));

        // Keep the nested preparation from overwriting the parked top value.
        self.regs.stack_pointer = self.regs.stack_pointer.offset(-(crate::types::PTR_SLOTS as i32));

        self.initial_function = None;
        self.calling_system_function = None;
        self.regs.object_register = VmPtr::Null;
        self.regs.object_type = None;

        if self.status != ExecutionState::Deserialization {
            self.status = ExecutionState::Uninitialized;
        }
        Ok(())
    }

    /// Restores the execution parked by the matching [`Context::push_state`].
    pub fn pop_state(&mut self) -> Result<(), VmError> {
        if !self.is_nested() {
            return Err(VmError::Error);
        }

        self.unprepare()?;

        let Some(CallStackEntry::Marker(state)) = self.call_stack.pop() else {
            return Err(VmError::Error);
        };

        self.calling_system_function = state.calling_system_function;
        self.initial_function = state.initial_function;
        self.original_stack_pointer = state.original_stack_pointer;
        self.original_stack_index = state.original_stack_index;
        self.arguments_size = state.arguments_size;
        self.regs.value_register = state.value_register;
        self.regs.object_register = state.object_register;
        self.regs.object_type = state.object_type;

        self.return_value_size = self
            .initial_function
            .as_ref()
            .filter(|f| f.returns_on_stack())
            .map_or(0, |f| f.return_type.size_in_memory_slots());

        self.pop_call_state();
        self.status = ExecutionState::Active;
        Ok(())
    }

    /// True when a nested marker sits on the call stack.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.nested_count() > 0
    }

    /// Number of nested markers on the call stack.
    #[must_use]
    pub fn nested_count(&self) -> u32 {
        self.call_stack.iter().filter(|e| matches!(e, CallStackEntry::Marker(_))).count() as u32
    }

    pub(crate) fn push_call_state(&mut self) -> Result<(), ()> {
        let max = self.engine.config().max_call_stack_size;
        if max != 0 && self.call_stack.len() >= max as usize {
            self.set_internal_exception(exceptions::STACK_OVERFLOW, true);
            return Err(());
        }
        self.call_stack.push(CallStackEntry::Frame(SavedFrame {
            frame_pointer: self.regs.frame_pointer,
            function: self.current_function.clone().expect("push_call_state: no current function"),
            program_pointer: self.regs.program_pointer,
            stack_pointer: self.regs.stack_pointer,
            stack_index: self.stack_index,
        }));
        Ok(())
    }

    pub(crate) fn pop_call_state(&mut self) {
        match self.call_stack.pop().expect("pop_call_state: empty call stack") {
            CallStackEntry::Frame(frame) => {
                self.regs.frame_pointer = frame.frame_pointer;
                self.current_function = Some(frame.function);
                self.regs.program_pointer = frame.program_pointer;
                self.regs.stack_pointer = frame.stack_pointer;
                self.stack_index = frame.stack_index;
            }
            CallStackEntry::Marker(_) => panic!("pop_call_state: unexpected nested marker"),
        }
    }

    // ---- exceptions --------------------------------------------------------

    /// Raises a script exception from a host function.
    ///
    /// Only legal while the context is bridging a host call.
    pub fn set_exception(&mut self, descr: &str, allow_catch: bool) -> Result<(), VmError> {
        if self.calling_system_function.is_none() {
            return Err(VmError::Error);
        }
        self.set_internal_exception(descr, allow_catch);
        Ok(())
    }

    pub(crate) fn set_internal_exception(&mut self, descr: &str, allow_catch: bool) {
        if self.in_exception_handler {
            debug_assert!(false, "exception raised while unwinding");
            return;
        }

        self.status = ExecutionState::Exception;
        self.flags.process_suspend.store(true, Ordering::Release);

        self.exception.string = descr.to_owned();
        self.exception.function = self.current_function.as_ref().map(|f| f.id);

        let position = self
            .current_function
            .as_ref()
            .filter(|f| f.script.is_some())
            .and_then(|f| self.regs.program_pointer.map(|pp| (f.clone(), pp)));
        if let Some((func, pp)) = position {
            let (line, column, section_idx) = func.line_number(pp);
            self.exception.line = line;
            self.exception.column = column;
            self.exception.section_idx = section_idx;
        } else {
            self.exception.line = 0;
            self.exception.column = 0;
            self.exception.section_idx = 0;
        }

        self.exception.will_be_caught = allow_catch && self.find_try_catch();

        if let Some(cb) = self.exception_callback.clone() {
            cb(self);
        }
    }

    /// Line, column and section index of the last exception.
    #[must_use]
    pub fn exception_line_number(&self) -> (u32, u32, u32) {
        (self.exception.line, self.exception.column, self.exception.section_idx)
    }

    #[must_use]
    pub fn exception_function(&self) -> Option<FunctionId> {
        self.exception.function
    }

    #[must_use]
    pub fn exception_string(&self) -> &str {
        &self.exception.string
    }

    /// True when the raised exception will be caught by script code.
    #[must_use]
    pub fn will_exception_be_caught(&self) -> bool {
        self.exception.will_be_caught
    }

    /// Installs a callback invoked when an exception is raised.
    pub fn set_exception_callback(&mut self, cb: impl Fn(&Context) + 'static) {
        self.exception_callback = Some(Rc::new(cb));
    }

    pub fn clear_exception_callback(&mut self) {
        self.exception_callback = None;
    }

    /// Installs a callback invoked at every suspend check, giving debuggers
    /// a per-line hook.
    pub fn set_line_callback(&mut self, cb: impl Fn(&Context) + 'static) {
        self.line_callback = Some(Rc::new(cb));
        self.flags.process_suspend.store(true, Ordering::Release);
    }

    pub fn clear_line_callback(&mut self) {
        self.line_callback = None;
        self.flags
            .process_suspend
            .store(self.flags.do_suspend.load(Ordering::Acquire), Ordering::Release);
    }

    // ---- user data ---------------------------------------------------------

    /// Stores a typed user-data slot, returning the previous value.
    ///
    /// Reads and writes are serialized through the engine's reader/writer
    /// lock, as concurrent threads may inspect contexts they do not execute.
    pub fn set_user_data(&mut self, kind: u64, data: Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        let _guard = self.engine.user_data_lock.write().expect("user data lock poisoned");
        for entry in &mut self.user_data {
            if entry.0 == kind {
                return Some(std::mem::replace(&mut entry.1, data));
            }
        }
        self.user_data.push((kind, data));
        None
    }

    #[must_use]
    pub fn user_data(&self, kind: u64) -> Option<Rc<dyn Any>> {
        let _guard = self.engine.user_data_lock.read().expect("user data lock poisoned");
        self.user_data.iter().find(|e| e.0 == kind).map(|e| e.1.clone())
    }

    /// Frees the stack blocks; the context reverts to a detached shell.
    pub fn release_stack_memory(&mut self) {
        debug_assert!(self.status != ExecutionState::Active);
        self.stack.release_blocks();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Mirror detach: abort and unwind every nesting level.
        loop {
            self.abort();
            let _ = self.unprepare();
            if !self.is_nested() {
                break;
            }
            if self.pop_state().is_err() {
                break;
            }
            // A popped state is active again; mark it aborted so the next
            // round of cleanup treats it as interrupted.
            self.status = ExecutionState::Aborted;
        }
        self.stack.release_blocks();
    }
}
