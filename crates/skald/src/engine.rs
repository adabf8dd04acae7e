//! The engine contract: registries, global data, the object heap, and the
//! host calling bridge.
//!
//! The engine here is intentionally thin — just enough surface for the
//! execution context to compile against and for hosts to register types,
//! functions and globals. Contexts hold it by `Rc` and reach its interior
//! through scoped borrows; nothing is borrowed across a host callback.

use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::RwLock;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::context::Context;
use crate::error::{ExecutionState, Message, MessageKind, VmError, exceptions};
use crate::function::{
    DelegateTarget, FuncKind, FunctionId, HostFn, ScriptData, ScriptFunction,
};
use crate::heap::{Heap, HeapPayload, ObjectId};
use crate::memory::VmPtr;
use crate::types::{
    DataType, PTR_SLOTS, RefModifier, TypeDef, TypeFlags, TypeId, TypeInfo,
};

/// Tunables of the engine and its contexts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Slots in the first stack block; block *i* holds `init << i` slots.
    pub init_context_stack_size: u32,
    /// Cap on total stack slots across blocks; 0 means unbounded.
    pub max_context_stack_size: u32,
    /// Call-stack frames reserved at prepare time.
    pub init_call_stack_size: u32,
    /// Cap on call-stack frames; 0 means unbounded.
    pub max_call_stack_size: u32,
    /// Bound on host→script re-entry depth per thread.
    pub max_nested_calls: u32,
    /// Run collector steps automatically after each execution.
    pub auto_garbage_collect: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            init_context_stack_size: 1024,
            max_context_stack_size: 0,
            init_call_stack_size: 10,
            max_call_stack_size: 0,
            max_nested_calls: 100,
            auto_garbage_collect: false,
        }
    }
}

/// A registered global variable.
#[derive(Debug, Clone)]
pub struct GlobalVar {
    pub byte_offset: u32,
    pub data_type: DataType,
}

struct ImportEntry {
    /// The Imported-kind descriptor function.
    declaration: FunctionId,
    bound: Option<FunctionId>,
}

/// A function pending engine registration.
pub struct FunctionDef {
    pub name: String,
    pub kind: FuncKind,
    pub object_type: Option<TypeId>,
    pub return_type: DataType,
    pub params: Vec<DataType>,
    pub inout_flags: Vec<RefModifier>,
    pub script: Option<ScriptData>,
    pub host: Option<HostFn>,
    pub vf_table_idx: u32,
    pub dont_cleanup_on_exception: bool,
}

impl FunctionDef {
    /// A free script function.
    #[must_use]
    pub fn script(name: &str, return_type: DataType, params: Vec<DataType>, data: ScriptData) -> FunctionDef {
        FunctionDef {
            name: name.to_owned(),
            kind: FuncKind::Script,
            object_type: None,
            return_type,
            params,
            inout_flags: Vec::new(),
            script: Some(data),
            host: None,
            vf_table_idx: 0,
            dont_cleanup_on_exception: false,
        }
    }

    /// A free host function.
    #[must_use]
    pub fn host(
        name: &str,
        return_type: DataType,
        params: Vec<DataType>,
        f: impl Fn(&mut HostCall<'_>) + 'static,
    ) -> FunctionDef {
        FunctionDef {
            name: name.to_owned(),
            kind: FuncKind::Host,
            object_type: None,
            return_type,
            params,
            inout_flags: Vec::new(),
            script: None,
            host: Some(Rc::new(f)),
            vf_table_idx: 0,
            dont_cleanup_on_exception: false,
        }
    }

    /// Turns the definition into a method of `obj`.
    #[must_use]
    pub fn method_of(mut self, obj: TypeId) -> FunctionDef {
        self.object_type = Some(obj);
        self
    }

    /// Sets per-parameter reference modifiers.
    #[must_use]
    pub fn with_inout(mut self, flags: Vec<RefModifier>) -> FunctionDef {
        self.inout_flags = flags;
        self
    }
}

/// The scripting engine: registries and shared services for contexts.
pub struct Engine {
    config: EngineConfig,
    types: RefCell<Vec<Rc<TypeInfo>>>,
    functions: RefCell<Vec<Rc<ScriptFunction>>>,
    signatures: RefCell<AHashMap<String, u32>>,
    imports: RefCell<Vec<ImportEntry>>,
    global_registry: RefCell<IndexMap<String, GlobalVar>>,
    pub(crate) globals: RefCell<Vec<u8>>,
    pub(crate) heap: RefCell<Heap>,
    section_names: RefCell<Vec<String>>,
    message_sink: RefCell<Option<Rc<dyn Fn(&Message)>>>,
    app_exception_translator: RefCell<Option<Rc<dyn Fn(&mut Context)>>>,
    /// Serializes access to per-context user data (spec: engine-owned rwlock).
    pub(crate) user_data_lock: RwLock<()>,
    gc_steps_run: Cell<u64>,
    next_context_serial: Cell<u64>,
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Rc<Engine> {
        Rc::new(Engine {
            config,
            types: RefCell::new(Vec::new()),
            functions: RefCell::new(Vec::new()),
            signatures: RefCell::new(AHashMap::new()),
            imports: RefCell::new(Vec::new()),
            global_registry: RefCell::new(IndexMap::new()),
            globals: RefCell::new(Vec::new()),
            heap: RefCell::new(Heap::new()),
            section_names: RefCell::new(vec![String::new()]),
            message_sink: RefCell::new(None),
            app_exception_translator: RefCell::new(None),
            user_data_lock: RwLock::new(()),
            gc_steps_run: Cell::new(0),
            next_context_serial: Cell::new(1),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn next_serial(&self) -> u64 {
        let serial = self.next_context_serial.get();
        self.next_context_serial.set(serial + 1);
        serial
    }

    // ---- diagnostics -----------------------------------------------------

    /// Installs the message sink receiving validation diagnostics.
    pub fn set_message_callback(&self, sink: impl Fn(&Message) + 'static) {
        *self.message_sink.borrow_mut() = Some(Rc::new(sink));
    }

    pub fn clear_message_callback(&self) {
        *self.message_sink.borrow_mut() = None;
    }

    pub(crate) fn write_message(&self, section: &str, row: u32, col: u32, kind: MessageKind, text: &str) {
        let sink = self.message_sink.borrow().clone();
        if let Some(sink) = sink {
            sink(&Message { section: section.to_owned(), row, col, kind, text: text.to_owned() });
        }
    }

    /// Reports a failed API call through the message sink, the way every
    /// validating context operation does.
    pub(crate) fn report_api_error(&self, operation: &str, err: VmError) {
        let text = format!("Failed in call to {} with error {} ({})", operation, err, err.code());
        self.write_message("", 0, 0, MessageKind::Error, &text);
    }

    /// Registers a script section name for diagnostics, returning its index.
    pub fn add_section_name(&self, name: &str) -> u32 {
        let mut names = self.section_names.borrow_mut();
        if let Some(idx) = names.iter().position(|n| n == name) {
            return idx as u32;
        }
        names.push(name.to_owned());
        names.len() as u32 - 1
    }

    #[must_use]
    pub fn section_name(&self, idx: u32) -> Option<String> {
        self.section_names.borrow().get(idx as usize).cloned()
    }

    /// Installs the translator invoked when a host function panics, before
    /// the generic *application-exception* is recorded.
    pub fn set_app_exception_translator(&self, f: impl Fn(&mut Context) + 'static) {
        *self.app_exception_translator.borrow_mut() = Some(Rc::new(f));
    }

    // ---- type registry ---------------------------------------------------

    /// Declares a type so functions can reference it before it is defined.
    pub fn declare_type(&self, name: &str, flags: TypeFlags) -> TypeId {
        let mut types = self.types.borrow_mut();
        let id = TypeId::from_object_index(types.len());
        types.push(Rc::new(TypeInfo {
            id,
            name: name.to_owned(),
            flags,
            size: 0,
            beh: Default::default(),
            properties: Vec::new(),
            methods: Vec::new(),
            virtual_function_table: Vec::new(),
            interfaces: Vec::new(),
            base: None,
            funcdef: None,
        }));
        id
    }

    /// Completes a declared type.
    pub fn define_type(&self, id: TypeId, def: TypeDef) {
        let mut types = self.types.borrow_mut();
        let slot = &mut types[id.object_index()];
        *slot = Rc::new(TypeInfo {
            id,
            name: def.name,
            flags: def.flags,
            size: def.size,
            beh: def.beh,
            properties: def.properties,
            methods: def.methods,
            virtual_function_table: def.virtual_function_table,
            interfaces: def.interfaces,
            base: def.base,
            funcdef: def.funcdef,
        });
    }

    /// Declares and defines a type in one step.
    pub fn register_type(&self, def: TypeDef) -> TypeId {
        let name = def.name.clone();
        let id = self.declare_type(&name, def.flags);
        self.define_type(id, def);
        id
    }

    /// Type descriptor lookup.
    ///
    /// # Panics
    /// Panics on an unknown id.
    #[must_use]
    pub fn type_info(&self, id: TypeId) -> Rc<TypeInfo> {
        self.types.borrow()[id.object_index()].clone()
    }

    /// True when `ty` equals, derives from, or implements `target`.
    #[must_use]
    pub fn type_compatible(&self, ty: TypeId, target: TypeId) -> bool {
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.type_info(id);
            if id == target || info.implements(target) {
                return true;
            }
            current = info.base;
        }
        false
    }

    // ---- function registry -----------------------------------------------

    fn intern_signature(&self, name: &str, ret: &DataType, params: &[DataType], is_method: bool) -> u32 {
        let mut key = format!("{name}/{ret:?}/{is_method}");
        for p in params {
            key.push('|');
            key.push_str(&format!("{p:?}"));
        }
        let mut sigs = self.signatures.borrow_mut();
        let next = sigs.len() as u32;
        *sigs.entry(key).or_insert(next)
    }

    /// Registers a function and returns its id.
    pub fn register_function(&self, def: FunctionDef) -> FunctionId {
        let signature_id =
            self.intern_signature(&def.name, &def.return_type, &def.params, def.object_type.is_some());
        let mut functions = self.functions.borrow_mut();
        let id = FunctionId(functions.len() as u32);
        let mut inout = def.inout_flags;
        inout.resize(def.params.len(), RefModifier::None);
        functions.push(Rc::new(ScriptFunction {
            id,
            name: def.name,
            kind: def.kind,
            object_type: def.object_type,
            return_type: def.return_type,
            params: def.params,
            inout_flags: inout,
            signature_id,
            vf_table_idx: def.vf_table_idx,
            import_slot: 0,
            delegate: None,
            script: def.script,
            host: def.host,
            dont_cleanup_on_exception: def.dont_cleanup_on_exception,
        }));
        id
    }

    /// Registers an imported function declaration; calls fault with
    /// *unbound-function* until a target is bound.
    pub fn register_imported_function(&self, name: &str, return_type: DataType, params: Vec<DataType>) -> FunctionId {
        let signature_id = self.intern_signature(name, &return_type, &params, false);
        let mut functions = self.functions.borrow_mut();
        let id = FunctionId(functions.len() as u32);
        let import_slot = {
            let mut imports = self.imports.borrow_mut();
            imports.push(ImportEntry { declaration: id, bound: None });
            imports.len() as u32 - 1
        };
        functions.push(Rc::new(ScriptFunction {
            id,
            name: name.to_owned(),
            kind: FuncKind::Imported,
            object_type: None,
            return_type,
            params: params.clone(),
            inout_flags: vec![RefModifier::None; params.len()],
            signature_id,
            vf_table_idx: 0,
            import_slot,
            delegate: None,
            script: None,
            host: None,
            dont_cleanup_on_exception: false,
        }));
        id
    }

    /// Binds an imported function to a concrete target.
    pub fn bind_imported_function(&self, import: FunctionId, target: FunctionId) -> Result<(), VmError> {
        let slot = self.try_function(import).ok_or(VmError::NoFunction)?.import_slot;
        let mut imports = self.imports.borrow_mut();
        let entry = imports.get_mut(slot as usize).ok_or(VmError::NoFunction)?;
        if entry.declaration != import {
            return Err(VmError::InvalidArg);
        }
        entry.bound = Some(target);
        Ok(())
    }

    /// Removes the binding of an imported function.
    pub fn unbind_imported_function(&self, import: FunctionId) -> Result<(), VmError> {
        let slot = self.try_function(import).ok_or(VmError::NoFunction)?.import_slot;
        self.imports.borrow_mut().get_mut(slot as usize).ok_or(VmError::NoFunction)?.bound = None;
        Ok(())
    }

    pub(crate) fn bound_import(&self, slot: u32) -> Option<FunctionId> {
        self.imports.borrow().get(slot as usize).and_then(|e| e.bound)
    }

    /// Creates a delegate binding a receiver to a method; the receiver's
    /// count is incremented for the delegate's lifetime.
    pub fn create_delegate(&self, object: ObjectId, func: FunctionId) -> FunctionId {
        self.heap.borrow().inc_ref(object);
        let target = self.function(func);
        let mut functions = self.functions.borrow_mut();
        let id = FunctionId(functions.len() as u32);
        functions.push(Rc::new(ScriptFunction {
            id,
            name: format!("{}$delegate", target.name),
            kind: FuncKind::Delegate,
            // Called like a free function; the receiver comes from the
            // binding at dispatch time.
            object_type: None,
            return_type: target.return_type,
            params: target.params.clone(),
            inout_flags: target.inout_flags.clone(),
            signature_id: target.signature_id,
            vf_table_idx: 0,
            import_slot: 0,
            delegate: Some(DelegateTarget { object, func }),
            script: None,
            host: None,
            dont_cleanup_on_exception: false,
        }));
        id
    }

    /// Function descriptor lookup.
    ///
    /// # Panics
    /// Panics on an unknown id.
    #[must_use]
    pub fn function(&self, id: FunctionId) -> Rc<ScriptFunction> {
        self.functions.borrow()[id.0 as usize].clone()
    }

    #[must_use]
    pub fn try_function(&self, id: FunctionId) -> Option<Rc<ScriptFunction>> {
        self.functions.borrow().get(id.0 as usize).cloned()
    }

    // ---- global data -----------------------------------------------------

    /// Allocates zeroed storage for a global variable, returning its byte
    /// offset in the global data area.
    pub fn register_global(&self, name: &str, data_type: DataType) -> u32 {
        let size = if data_type.is_object() || data_type.is_handle || data_type.is_reference {
            u32::from(PTR_SLOTS) * 4
        } else {
            data_type.size_in_memory_bytes().max(4)
        };
        let mut globals = self.globals.borrow_mut();
        let byte_offset = globals.len() as u32;
        let new_len = globals.len() + size as usize;
        globals.resize(new_len, 0);
        self.global_registry.borrow_mut().insert(name.to_owned(), GlobalVar { byte_offset, data_type });
        byte_offset
    }

    /// Address of a registered global.
    #[must_use]
    pub fn global_addr(&self, name: &str) -> Option<VmPtr> {
        self.global_registry.borrow().get(name).map(|g| VmPtr::Global { byte: g.byte_offset })
    }

    /// Reads a dword from the global data area.
    #[must_use]
    pub fn global_u32(&self, byte_offset: u32) -> u32 {
        let globals = self.globals.borrow();
        let at = byte_offset as usize;
        u32::from_le_bytes(globals[at..at + 4].try_into().expect("Engine::global_u32: short read"))
    }

    /// Writes a dword into the global data area.
    pub fn set_global_u32(&self, byte_offset: u32, value: u32) {
        let mut globals = self.globals.borrow_mut();
        let at = byte_offset as usize;
        globals[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    // ---- objects ---------------------------------------------------------

    /// Allocates a zeroed script object of the given type.
    pub fn alloc_script_object(&self, type_id: TypeId) -> ObjectId {
        let size = self.type_info(type_id).size as usize;
        self.heap.borrow_mut().allocate(type_id, HeapPayload::zeroed(size))
    }

    /// Allocates a zeroed value object or buffer of an explicit byte size.
    pub fn alloc_raw(&self, type_id: TypeId, size: usize) -> ObjectId {
        self.heap.borrow_mut().allocate(type_id, HeapPayload::zeroed(size))
    }

    /// Allocates a host-backed object.
    pub fn alloc_host_object(&self, type_id: TypeId, value: Box<dyn std::any::Any>) -> ObjectId {
        self.heap.borrow_mut().allocate(type_id, HeapPayload::Host(value))
    }

    /// Runs a closure over the host payload of an object, downcast to `T`.
    pub fn with_host_object<T: 'static, R>(&self, id: ObjectId, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut heap = self.heap.borrow_mut();
        heap.host_mut::<T>(id).map(f)
    }

    /// Current reference count of an object.
    #[must_use]
    pub fn object_refcount(&self, id: ObjectId) -> u32 {
        self.heap.borrow().refcount(id)
    }

    /// Increments an object's count unless its type is uncounted.
    pub fn addref_object(&self, ctx_type: TypeId, id: ObjectId) {
        if !self.type_info(ctx_type).flags.contains(TypeFlags::NO_COUNT) {
            self.heap.borrow().inc_ref(id);
        }
    }

    /// Releases one reference to a counted object, destroying it at zero.
    ///
    /// The destructor behaviour runs while the object is still live; freed
    /// script objects then release their handle-typed properties.
    pub fn release_ref_object(&self, ctx: &mut Context, id: ObjectId) {
        let type_id = {
            let heap = self.heap.borrow();
            if !heap.is_live(id) {
                return;
            }
            heap.type_of(id)
        };
        let info = self.type_info(type_id);
        if info.flags.contains(TypeFlags::NO_COUNT) {
            return;
        }
        let dying = self.heap.borrow().refcount(id) == 1;
        if !dying {
            self.heap.borrow_mut().dec_ref(id);
            return;
        }
        if let Some(destruct) = info.beh.destruct {
            self.call_behaviour(ctx, destruct, VmPtr::from(id));
        }
        // The destructor may already have detached the record.
        if !self.heap.borrow().is_live(id) {
            return;
        }
        let (_, payload) = self.heap.borrow_mut().take(id);
        if info.flags.contains(TypeFlags::SCRIPT_OBJECT) {
            self.release_object_properties(ctx, &info, &payload);
        }
    }

    /// Destroys a value object: destructor behaviour, then the memory.
    pub fn destroy_value_object(&self, ctx: &mut Context, id: ObjectId, type_id: TypeId) {
        let info = self.type_info(type_id);
        if let Some(destruct) = info.beh.destruct {
            self.call_behaviour(ctx, destruct, VmPtr::from(id));
        }
        if self.heap.borrow().is_live(id) {
            let _ = self.heap.borrow_mut().take(id);
        }
    }

    /// Destroys a list-pattern buffer.
    ///
    /// The element layout is owned by the compiler-side pattern; the core
    /// only releases the memory.
    pub fn destroy_list_buffer(&self, id: ObjectId) {
        if self.heap.borrow().is_live(id) {
            let _ = self.heap.borrow_mut().take(id);
        }
    }

    fn release_object_properties(&self, ctx: &mut Context, info: &TypeInfo, payload: &HeapPayload) {
        let HeapPayload::Bytes(bytes) = payload else {
            return;
        };
        for prop in &info.properties {
            if !prop.data_type.is_handle {
                continue;
            }
            let at = prop.byte_offset as usize;
            let raw = u64::from_le_bytes(bytes[at..at + 8].try_into().expect("property outside object payload"));
            if let Some(child) = VmPtr::decode(raw).as_object() {
                self.release_ref_object(ctx, child);
            }
        }
    }

    /// Disposes whatever an owned pointer slot refers to, according to the
    /// declared type: release for counted references, destructor + free for
    /// value types, the list destroyer for list buffers, nothing for
    /// function handles.
    pub(crate) fn dispose_ptr(&self, ctx: &mut Context, ptr: VmPtr, type_id: TypeId) {
        let Some(id) = ptr.as_object() else {
            return;
        };
        if !type_id.is_object() {
            self.destroy_list_buffer(id);
            return;
        }
        let flags = self.type_info(type_id).flags;
        if flags.contains(TypeFlags::FUNCDEF) {
            return;
        }
        if flags.contains(TypeFlags::REFERENCE) || flags.contains(TypeFlags::SCRIPT_OBJECT) {
            self.release_ref_object(ctx, id);
        } else if flags.contains(TypeFlags::LIST_PATTERN) {
            self.destroy_list_buffer(id);
        } else {
            self.destroy_value_object(ctx, id, type_id);
        }
    }

    /// Copy-constructs an object for a by-value argument.
    ///
    /// Byte-backed payloads are copied bitwise and handle-typed properties
    /// re-counted; host payloads require a copy-construct behaviour.
    pub fn create_object_copy(&self, ctx: &mut Context, src: ObjectId, type_id: TypeId) -> Result<ObjectId, VmError> {
        let info = self.type_info(type_id);
        let bytes = {
            let heap = self.heap.borrow();
            if !heap.is_live(src) {
                return Err(VmError::InvalidArg);
            }
            if !heap.is_bytes(src) {
                // Host payloads need a host-side copy behaviour.
                return Err(VmError::NotSupported);
            }
            heap.bytes(src).to_vec().into_boxed_slice()
        };
        // Re-count handles the copy now shares.
        for prop in &info.properties {
            if prop.data_type.is_handle {
                let at = prop.byte_offset as usize;
                let raw = u64::from_le_bytes(bytes[at..at + 8].try_into().expect("property outside object payload"));
                if let Some(child) = VmPtr::decode(raw).as_object() {
                    self.heap.borrow().inc_ref(child);
                }
            }
        }
        let id = self.heap.borrow_mut().allocate(type_id, HeapPayload::Bytes(bytes));
        if let Some(copy) = info.beh.copy_construct {
            self.call_behaviour(ctx, copy, VmPtr::from(id));
        }
        Ok(id)
    }

    // ---- host calling bridge ----------------------------------------------

    /// Invokes a type behaviour with the object as receiver.
    ///
    /// Behaviours must not raise; a panic still falls back to the
    /// application-exception path so the VM stays consistent.
    pub(crate) fn call_behaviour(&self, ctx: &mut Context, behaviour: FunctionId, object: VmPtr) {
        let func = self.function(behaviour);
        let Some(host) = func.host.clone() else {
            return;
        };
        let mut call = HostCall {
            ctx: &mut *ctx,
            func: func.clone(),
            args: VmPtr::Null,
            object,
            ret_sink: VmPtr::Null,
            ret_value: 0,
            ret_object: VmPtr::Null,
        };
        let panicked = catch_unwind(AssertUnwindSafe(|| host(&mut call))).is_err();
        drop(call);
        if panicked {
            self.handle_app_exception(ctx);
        }
    }

    /// Transfers control to a host function and returns the number of
    /// argument slots the interpreter must pop.
    ///
    /// A null receiver faults with *null-pointer-access* and marks the
    /// in-flight arguments for cleanup during unwind. A panicking host
    /// function is converted to a script exception, optionally rewritten by
    /// the registered translator.
    pub(crate) fn call_host_function(&self, ctx: &mut Context, func_id: FunctionId) -> u32 {
        let func = self.function(func_id);
        debug_assert!(func.host.is_some(), "call_host_function: {} has no host body", func.name);

        let mut pop = func.space_for_params();
        let sp = ctx.regs().stack_pointer;
        let mut args = VmPtr::Stack { block: sp.block, byte: sp.slot * 4 };
        let mut object = VmPtr::Null;
        if func.object_type.is_some() {
            pop += PTR_SLOTS;
            object = VmPtr::decode(ctx.mem_read_u64(args));
            if object.is_null() {
                ctx.set_internal_exception(exceptions::NULL_POINTER_ACCESS, true);
                return 0;
            }
            args = args.offset_bytes(PTR_SLOTS as i32 * 4);
        }
        let mut ret_sink = VmPtr::Null;
        if func.returns_on_stack() {
            pop += PTR_SLOTS;
            ret_sink = VmPtr::decode(ctx.mem_read_u64(args));
            args = args.offset_bytes(PTR_SLOTS as i32 * 4);
        }

        let host = func.host.clone().expect("call_host_function: missing body");
        ctx.set_calling_system_function(Some(func_id));
        let mut call = HostCall {
            ctx: &mut *ctx,
            func: func.clone(),
            args,
            object,
            ret_sink,
            ret_value: 0,
            ret_object: VmPtr::Null,
        };
        let panicked = catch_unwind(AssertUnwindSafe(|| host(&mut call))).is_err();
        let (ret_value, ret_object) = (call.ret_value, call.ret_object);
        drop(call);
        if panicked {
            self.handle_app_exception(ctx);
        }
        ctx.set_calling_system_function(None);

        ctx.set_return_registers(
            ret_value,
            ret_object,
            if func.return_type.is_object() && !func.returns_on_stack() {
                Some(func.return_type.type_id)
            } else {
                None
            },
        );

        // By-value object arguments are owned by the call; destroy them.
        let mut offset = 0i32;
        for p in &func.params {
            if p.is_object() && !p.is_reference && !p.is_handle {
                let slot = args.offset_bytes(offset * 4);
                let ptr = VmPtr::decode(ctx.mem_read_u64(slot));
                if let Some(id) = ptr.as_object() {
                    self.destroy_value_object(ctx, id, p.type_id);
                    ctx.mem_write_u64(slot, 0);
                }
            }
            offset += p.size_on_stack() as i32;
        }

        pop
    }

    fn handle_app_exception(&self, ctx: &mut Context) {
        let translator = self.app_exception_translator.borrow().clone();
        if let Some(translator) = translator {
            translator(ctx);
        }
        if ctx.state() != ExecutionState::Exception {
            ctx.set_internal_exception(exceptions::APP_EXCEPTION, true);
        }
    }

    // ---- collector contract ------------------------------------------------

    /// Objects created since the engine started; sampled around executions.
    #[must_use]
    pub fn objects_created(&self) -> u64 {
        self.heap.borrow().created()
    }

    /// Runs collector steps.
    ///
    /// Cycle detection belongs to the external collector; the core's step is
    /// bookkeeping only, but the call count is observable for the auto-GC
    /// contract.
    pub fn garbage_collect(&self, steps: u64) {
        self.gc_steps_run.set(self.gc_steps_run.get() + steps);
    }

    #[must_use]
    pub fn gc_steps_run(&self) -> u64 {
        self.gc_steps_run.get()
    }

    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.borrow().stats()
    }
}

/// View of one host-function invocation: typed argument readers over the
/// caller's argument area and return-value writers into the registers.
pub struct HostCall<'a> {
    ctx: &'a mut Context,
    func: Rc<ScriptFunction>,
    args: VmPtr,
    object: VmPtr,
    ret_sink: VmPtr,
    ret_value: u64,
    ret_object: VmPtr,
}

impl HostCall<'_> {
    /// The receiver of a method call.
    #[must_use]
    pub fn object(&self) -> VmPtr {
        self.object
    }

    /// The function being called.
    #[must_use]
    pub fn function(&self) -> &ScriptFunction {
        &self.func
    }

    /// The context driving this call.
    pub fn context(&mut self) -> &mut Context {
        self.ctx
    }

    #[must_use]
    pub fn engine(&self) -> Rc<Engine> {
        self.ctx.engine()
    }

    fn arg_addr(&self, arg: usize) -> VmPtr {
        let mut offset = 0i32;
        for p in &self.func.params[..arg] {
            offset += p.size_on_stack() as i32;
        }
        self.args.offset_bytes(offset * 4)
    }

    #[must_use]
    pub fn arg_dword(&self, arg: usize) -> u32 {
        self.ctx.mem_read_u32(self.arg_addr(arg))
    }

    #[must_use]
    pub fn arg_qword(&self, arg: usize) -> u64 {
        self.ctx.mem_read_u64(self.arg_addr(arg))
    }

    #[must_use]
    pub fn arg_float(&self, arg: usize) -> f32 {
        f32::from_bits(self.arg_dword(arg))
    }

    #[must_use]
    pub fn arg_double(&self, arg: usize) -> f64 {
        f64::from_bits(self.arg_qword(arg))
    }

    /// Address or handle argument, decoded.
    #[must_use]
    pub fn arg_address(&self, arg: usize) -> VmPtr {
        VmPtr::decode(self.arg_qword(arg))
    }

    /// Where an on-stack return value must be constructed.
    #[must_use]
    pub fn return_sink(&self) -> VmPtr {
        self.ret_sink
    }

    pub fn set_return_dword(&mut self, value: u32) {
        self.ret_value = u64::from(value);
    }

    pub fn set_return_qword(&mut self, value: u64) {
        self.ret_value = value;
    }

    pub fn set_return_float(&mut self, value: f32) {
        self.ret_value = u64::from(value.to_bits());
    }

    pub fn set_return_double(&mut self, value: f64) {
        self.ret_value = value.to_bits();
    }

    pub fn set_return_address(&mut self, ptr: VmPtr) {
        self.ret_value = ptr.encode();
    }

    /// Returns an object through the object register.
    pub fn set_return_object(&mut self, ptr: VmPtr) {
        self.ret_object = ptr;
    }

    /// Raises a script exception from host code.
    pub fn set_exception(&mut self, descr: &str) {
        let _ = self.ctx.set_exception(descr, true);
    }
}
