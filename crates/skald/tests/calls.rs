//! The call protocol: host functions, virtual and interface dispatch,
//! delegates, function pointers and the fast host-method form.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::{engine, int32, int_fn, void};
use skald::error::exceptions;
use skald::function::ScriptData;
use skald::types::{DataType, InterfaceEntry, TypeDef};
use skald::{
    Context, ExecutionState, FunctionBuilder, FunctionDef, FuncKind, FunctionId, Opcode, TypeFlags,
    TypeId, VmPtr,
};

/// Registers the Box class: a script object with a trivial constructor and
/// a virtual `area` method returning 7, implementing the IShape interface.
struct Shapes {
    iface: TypeId,
    class: TypeId,
    iface_area: FunctionId,
    virt_area: FunctionId,
    impl_area: FunctionId,
    ctor: FunctionId,
}

fn shape_types(engine: &Rc<skald::Engine>) -> Shapes {
    let iface = engine.declare_type("IShape", TypeFlags::INTERFACE);
    let class = engine.declare_type("Box", TypeFlags::SCRIPT_OBJECT.union(TypeFlags::REFERENCE));

    let method_body = |ret: u32| -> ScriptData {
        let mut b = FunctionBuilder::new();
        b.variable_space(1);
        b.emit_v_dw(Opcode::SetVar32, 1, ret);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
        b.build()
    };

    let impl_area = engine.register_function(FunctionDef {
        name: "area".to_owned(),
        kind: FuncKind::Script,
        object_type: Some(class),
        return_type: int32(),
        params: vec![],
        inout_flags: vec![],
        script: Some(method_body(7)),
        host: None,
        vf_table_idx: 0,
        dont_cleanup_on_exception: false,
    });
    let virt_area = engine.register_function(FunctionDef {
        name: "area".to_owned(),
        kind: FuncKind::Virtual,
        object_type: Some(class),
        return_type: int32(),
        params: vec![],
        inout_flags: vec![],
        script: None,
        host: None,
        vf_table_idx: 0,
        dont_cleanup_on_exception: false,
    });
    let iface_area = engine.register_function(FunctionDef {
        name: "area".to_owned(),
        kind: FuncKind::Interface,
        object_type: Some(iface),
        return_type: int32(),
        params: vec![],
        inout_flags: vec![],
        script: None,
        host: None,
        vf_table_idx: 0,
        dont_cleanup_on_exception: false,
    });
    let ctor = engine.register_function(FunctionDef {
        name: "Box".to_owned(),
        kind: FuncKind::Script,
        object_type: Some(class),
        return_type: void(),
        params: vec![],
        inout_flags: vec![],
        script: Some({
            let mut b = FunctionBuilder::new();
            b.emit_w(Opcode::Ret, 2);
            b.build()
        }),
        host: None,
        vf_table_idx: 0,
        dont_cleanup_on_exception: false,
    });

    engine.define_type(class, TypeDef {
        name: "Box".to_owned(),
        flags: TypeFlags::SCRIPT_OBJECT.union(TypeFlags::REFERENCE),
        size: 8,
        methods: vec![virt_area],
        virtual_function_table: vec![impl_area],
        interfaces: vec![InterfaceEntry { interface: iface, vft_offset: 0 }],
        ..TypeDef::default()
    });

    Shapes { iface, class, iface_area, virt_area, impl_area, ctor }
}

/// A host function is bridged, pops its arguments, and returns through the
/// value register.
#[test]
fn host_function_call() {
    let engine = engine();
    let sum = engine.register_function(FunctionDef::host(
        "sum3",
        int32(),
        vec![int32(), int32(), int32()],
        |call| {
            let total = call.arg_dword(0) + call.arg_dword(1) + call.arg_dword(2);
            call.set_return_dword(total);
        },
    ));
    let f = int_fn(&engine, "use_sum", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(8);
        b.emit_dw(Opcode::PushConst32, 3);
        b.emit_dw(Opcode::PushConst32, 2);
        b.emit_dw(Opcode::PushConst32, 1);
        b.emit_dw(Opcode::CallHost, sum.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.return_dword(), 6);
}

/// The thread-local active stack points at the executing context while a
/// host function runs.
#[test]
fn host_sees_active_context() {
    let engine = engine();
    let observed = Rc::new(Cell::new(None));
    let seen = observed.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        seen.set(skald::tls::active_context_serial().map(|s| s == call.context().serial()));
    }));
    let f = int_fn(&engine, "probe_caller", vec![], |b| {
        b.stack_needed(4);
        b.emit_dw(Opcode::CallHost, probe.0);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(observed.get(), Some(true));
}

/// A virtual method prepared directly resolves through the receiver's
/// virtual table.
#[test]
fn prepared_virtual_dispatch() {
    let engine = engine();
    let shapes = shape_types(&engine);
    let obj = engine.alloc_script_object(shapes.class);

    let mut ctx = Context::new(&engine);
    ctx.prepare(shapes.virt_area).unwrap();
    ctx.set_object(VmPtr::from(obj)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 7);
    assert_eq!(ctx.function(0), Some(shapes.impl_area), "frame shows the resolved method");
    assert_eq!(ctx.this_type_id(0), Some(shapes.class));
    ctx.unprepare().unwrap();
}

/// Scenario: a method call on a null receiver faults with
/// *null-pointer-access*.
#[test]
fn null_receiver_faults() {
    let engine = engine();
    let shapes = shape_types(&engine);

    let mut ctx = Context::new(&engine);
    ctx.prepare(shapes.virt_area).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_string(), exceptions::NULL_POINTER_ACCESS);
}

/// An interface call inside script resolves through the receiver's
/// interface table; a null receiver faults and the pushed arguments are
/// cleaned during unwind.
#[test]
fn interface_dispatch_from_script() {
    let engine = engine();
    let shapes = shape_types(&engine);
    let f = int_fn(&engine, "measure", vec![DataType::handle(shapes.iface)], |b| {
        b.variable_space(1);
        b.stack_needed(6);
        b.emit_v(Opcode::PushVarPtr, 0);
        b.emit_dw(Opcode::CallInterface, shapes.iface_area.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
    });

    let obj = engine.alloc_script_object(shapes.class);
    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_object(0, VmPtr::from(obj)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 7);
    ctx.unprepare().unwrap();

    // Null receiver: the call faults and unwinds cleanly.
    ctx.prepare(f).unwrap();
    ctx.set_arg_address(0, VmPtr::Null).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_string(), exceptions::NULL_POINTER_ACCESS);
}

/// A delegate substitutes its bound receiver before dispatch.
#[test]
fn delegate_call() {
    let engine = engine();
    let shapes = shape_types(&engine);
    let obj = engine.alloc_script_object(shapes.class);
    let delegate = engine.create_delegate(obj, shapes.impl_area);

    let mut ctx = Context::new(&engine);
    ctx.prepare(delegate).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 7);
}

/// A function handle in a local dispatches on its kind at call time; a
/// null handle faults with *unbound-function*.
#[test]
fn function_pointer_call() {
    let engine = engine();
    let target = int_fn(&engine, "forty_two", vec![], |b| {
        b.variable_space(1);
        b.emit_v_dw(Opcode::SetVar32, 1, 42);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let make = |handle: VmPtr| {
        let mut b = FunctionBuilder::new();
        b.variable_space(3);
        b.stack_needed(8);
        b.emit_v_qw(Opcode::SetVar64, 2, handle.encode());
        b.emit_v(Opcode::CallFuncPtr, 2);
        b.emit_v(Opcode::CopyRegToVar32, 3);
        b.emit_v(Opcode::CopyVarToReg32, 3);
        b.emit_w(Opcode::Ret, 0);
        engine.register_function(FunctionDef::script("call_ptr", int32(), vec![], b.build()))
    };

    let good = make(VmPtr::Func(target));
    let mut ctx = Context::new(&engine);
    ctx.prepare(good).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 42);

    let bad = make(VmPtr::Null);
    ctx.prepare(bad).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_string(), exceptions::UNBOUND_FUNCTION);
}

/// The fast single-int host-method form pops the receiver and the argument
/// and returns through the value register.
#[test]
fn fast_host_method_call() {
    let engine = engine();
    let gadget = engine.register_type(TypeDef {
        name: "Gadget".to_owned(),
        flags: TypeFlags::REFERENCE.union(TypeFlags::NO_COUNT),
        size: 0,
        ..TypeDef::default()
    });
    let bump = engine.register_function(
        FunctionDef::host("bump", int32(), vec![int32()], |call| {
            let amount = call.arg_dword(0);
            let engine = call.engine();
            let id = call.object().as_object().expect("receiver present");
            let value = engine
                .with_host_object(id, |cell: &mut Cell<u32>| {
                    cell.set(cell.get() + amount);
                    cell.get()
                })
                .expect("gadget payload");
            call.set_return_dword(value);
        })
        .method_of(gadget),
    );

    let obj = engine.alloc_host_object(gadget, Box::new(Cell::new(10u32)));
    let f = int_fn(&engine, "poke", vec![DataType::handle(gadget)], |b| {
        b.variable_space(1);
        b.stack_needed(8);
        b.emit_dw(Opcode::PushConst32, 5);
        b.emit_v(Opcode::PushVarPtr, 0);
        b.emit_dw(Opcode::CallHostSingle, bump.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_address(0, VmPtr::from(obj)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 15);
}

/// Allocation with a script constructor re-enters the interpreter; the
/// handle is released by `Free` and nothing leaks.
#[test]
fn alloc_with_script_constructor() {
    let engine = engine();
    let shapes = shape_types(&engine);

    let f = int_fn(&engine, "make_and_measure", vec![], |b| {
        b.variable_space(3);
        b.stack_needed(10);
        b.declare_var("h", 2, DataType::handle(shapes.class), true);
        b.emit_v(Opcode::PushFrameAddr, 2);
        b.emit_ptr_dw(Opcode::Alloc, VmPtr::Type(shapes.class).encode(), shapes.ctor.0);
        b.emit(Opcode::PopPtr);
        b.emit_v(Opcode::PushVarPtr, 2);
        b.emit_dw(Opcode::CallInterface, shapes.virt_area.0);
        b.emit_v(Opcode::CopyRegToVar32, 3);
        b.emit_v_ptr(Opcode::Free, 2, VmPtr::Type(shapes.class).encode());
        b.emit_v(Opcode::CopyVarToReg32, 3);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 7);
    assert_eq!(engine.heap_stats().live_objects, 0, "the allocated object was released");
}

/// A successful cast addrefs into the object register; a failed cast
/// leaves it null.
#[test]
fn cast_follows_type_relations() {
    let engine = engine();
    let base = engine.register_type(TypeDef {
        name: "Base".to_owned(),
        flags: TypeFlags::SCRIPT_OBJECT.union(TypeFlags::REFERENCE),
        size: 4,
        ..TypeDef::default()
    });
    let derived = engine.register_type(TypeDef {
        name: "Derived".to_owned(),
        flags: TypeFlags::SCRIPT_OBJECT.union(TypeFlags::REFERENCE),
        size: 4,
        base: Some(base),
        ..TypeDef::default()
    });
    let other = engine.register_type(TypeDef {
        name: "Other".to_owned(),
        flags: TypeFlags::SCRIPT_OBJECT.union(TypeFlags::REFERENCE),
        size: 4,
        ..TypeDef::default()
    });

    let cast_fn = |target: TypeId| {
        let mut b = FunctionBuilder::new();
        b.variable_space(5);
        b.stack_needed(8);
        b.declare_var("casted", 4, DataType::handle(target), true);
        // The parameter slot's address feeds the cast directly.
        b.emit_v(Opcode::PushFrameAddr, 0);
        b.emit_dw(Opcode::Cast, target.0);
        b.emit_v(Opcode::StoreObj, 4);
        // Faults when the cast produced no object.
        b.emit_v(Opcode::CheckVarNull, 4);
        b.emit_v_ptr(Opcode::Free, 4, VmPtr::Type(target).encode());
        b.emit_v_dw(Opcode::SetVar32, 5, 1);
        b.emit_v(Opcode::CopyVarToReg32, 5);
        b.emit_w(Opcode::Ret, 2);
        engine.register_function(FunctionDef::script(
            "try_cast",
            int32(),
            vec![DataType::handle(derived)],
            b.build(),
        ))
    };

    // Casting Derived to Base succeeds: the register addref is matched by
    // the Free of the stored handle.
    let up = cast_fn(base);
    let obj = engine.alloc_script_object(derived);
    let mut ctx = Context::new(&engine);
    ctx.prepare(up).unwrap();
    ctx.set_arg_address(0, VmPtr::from(obj)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 1);
    assert_eq!(engine.heap_stats().live_objects, 1, "only the original object remains");

    // Casting to an unrelated type leaves the register null; the null
    // check then faults and the unwind releases the owned parameter.
    let sideways = cast_fn(other);
    let second = engine.alloc_script_object(derived);
    ctx.prepare(sideways).unwrap();
    ctx.set_arg_address(0, VmPtr::from(second)).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_string(), exceptions::NULL_POINTER_ACCESS);
    ctx.unprepare().unwrap();
    assert_eq!(engine.heap_stats().live_objects, 1, "the faulted call's parameter was released");
}
