//! Introspection from host code: stack walking, variables in scope and
//! arguments pending on the stack.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{engine, int32, int_fn, void};
use skald::{Context, ExecutionState, FunctionDef, Opcode, VmPtr};

/// A host probe sees the script frames above it: sizes, functions, lines
/// and the receiver-free this pointer.
#[test]
fn host_probe_walks_the_callstack() {
    let engine = engine();
    let report: Rc<RefCell<Vec<(u32, Option<skald::FunctionId>, u32)>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = report.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        let ctx = call.context();
        let size = ctx.callstack_size();
        let mut rows = sink.borrow_mut();
        for level in 0..size {
            let line = ctx.line_number(level).map_or(0, |(l, _, _)| l);
            rows.push((level, ctx.function(level), line));
        }
    }));

    let inner = int_fn(&engine, "inner", vec![], |b| {
        b.stack_needed(4);
        b.line(21, 1);
        b.emit_dw(Opcode::CallHost, probe.0);
        b.emit_w(Opcode::Ret, 0);
    });
    let outer = int_fn(&engine, "outer", vec![], |b| {
        b.stack_needed(4);
        b.line(11, 1);
        b.emit_dw(Opcode::Call, inner.0);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(outer).unwrap();
    ctx.execute().unwrap();

    let rows = report.borrow();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], (0, Some(inner), 21));
    assert_eq!(rows[1], (1, Some(outer), 11));
}

/// Variable metadata and scope tracking follow the declaration point and
/// the block events.
#[test]
fn variable_scope_replay() {
    let engine = engine();
    let observed = Rc::new(RefCell::new(Vec::new()));

    let sink = observed.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        let ctx = call.context();
        let count = ctx.var_count(0).unwrap();
        let mut rows = sink.borrow_mut();
        for v in 0..count {
            let info = ctx.var(v, 0).unwrap();
            rows.push((info.name.clone(), ctx.is_var_in_scope(v, 0)));
        }
    }));

    let f = int_fn(&engine, "scoped", vec![], |b| {
        b.variable_space(2);
        b.stack_needed(4);
        b.declare_var("alive", 1, int32(), false);
        b.emit_v_dw(Opcode::SetVar32, 1, 1);
        b.var_event(skald::function::VarLifeEvent::BlockBegin, 0);
        b.declare_var("gone", 2, int32(), false);
        b.emit_v_dw(Opcode::SetVar32, 2, 2);
        b.var_event(skald::function::VarLifeEvent::BlockEnd, 0);
        // Probe after the block closed: `gone` is out of scope.
        b.emit_dw(Opcode::CallHost, probe.0);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();

    let rows = observed.borrow();
    assert_eq!(rows.as_slice(), &[("alive".to_owned(), true), ("gone".to_owned(), false)]);
}

/// Values of scalar variables are readable through their address.
#[test]
fn variable_values_through_addresses() {
    let engine = engine();
    let captured = Rc::new(RefCell::new(None));

    let sink = captured.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        let ctx = call.context();
        let addr = ctx.address_of_var(0, 0, false, false).unwrap();
        *sink.borrow_mut() = Some(ctx.mem_read_u32(addr));
    }));

    let f = int_fn(&engine, "holder", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(4);
        b.declare_var("x", 1, int32(), false);
        b.emit_v_dw(Opcode::SetVar32, 1, 777);
        b.emit_dw(Opcode::CallHost, probe.0);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(*captured.borrow(), Some(777));
}

/// Arguments already pushed for a pending call are reconstructed by the
/// forward scan, innermost call first.
#[test]
fn args_on_stack_reconstruction() {
    let engine = engine();
    let observed = Rc::new(RefCell::new(Vec::new()));

    let sink = observed.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        let ctx = call.context();
        let count = ctx.args_on_stack_count(0).unwrap();
        let mut rows = sink.borrow_mut();
        for i in 0..count {
            let (dt, _, addr) = ctx.arg_on_stack(0, i).unwrap();
            rows.push((dt.type_id, ctx.mem_read_u32(addr)));
        }
    }));

    let add = int_fn(&engine, "add", vec![int32(), int32()], |b| {
        b.variable_space(1);
        b.emit_vvv(Opcode::AddI32, 1, 0, -1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
    });

    let f = int_fn(&engine, "pending", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(10);
        // Push add's arguments, probe mid-push, then complete the call.
        b.emit_dw(Opcode::PushConst32, 22);
        b.emit_dw(Opcode::PushConst32, 20);
        b.emit_dw(Opcode::CallHost, probe.0);
        b.emit_dw(Opcode::Call, add.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 42);

    let rows = observed.borrow();
    assert_eq!(rows.as_slice(), &[
        (skald::TypeId::INT32, 20),
        (skald::TypeId::INT32, 22),
    ]);
}

/// The receiver is visible through `this_pointer` at the method's level.
#[test]
fn this_pointer_at_level() {
    let engine = engine();
    let class = engine.register_type(skald::TypeDef {
        name: "Holder".to_owned(),
        flags: skald::TypeFlags::SCRIPT_OBJECT.union(skald::TypeFlags::REFERENCE),
        size: 4,
        ..skald::TypeDef::default()
    });

    let observed = Rc::new(RefCell::new(VmPtr::Null));
    let sink = observed.clone();
    let probe = engine.register_function(FunctionDef::host("probe", void(), vec![], move |call| {
        *sink.borrow_mut() = call.context().this_pointer(0);
    }));

    let method = engine.register_function(FunctionDef {
        name: "inspect".to_owned(),
        kind: skald::FuncKind::Script,
        object_type: Some(class),
        return_type: int32(),
        params: vec![],
        inout_flags: vec![],
        script: Some({
            let mut b = skald::FunctionBuilder::new();
            b.stack_needed(4);
            b.emit_dw(Opcode::CallHost, probe.0);
            b.emit_w(Opcode::Ret, 2);
            b.build()
        }),
        host: None,
        vf_table_idx: 0,
        dont_cleanup_on_exception: false,
    });

    let obj = engine.alloc_script_object(class);
    let mut ctx = Context::new(&engine);
    ctx.prepare(method).unwrap();
    ctx.set_object(VmPtr::from(obj)).unwrap();
    ctx.execute().unwrap();
    assert_eq!(*observed.borrow(), VmPtr::from(obj));

    // Unpreparing releases the receiver reference the preparation took.
    ctx.unprepare().unwrap();
}
