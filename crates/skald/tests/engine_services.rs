//! Engine-side services the context relies on: the message sink, the
//! collector hand-off and per-context user data.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{engine, int_fn};
use skald::{Context, Engine, EngineConfig, ExecutionState, Opcode, VmError, VmPtr};

/// Validation failures write a diagnostic through the message sink.
#[test]
fn api_errors_reach_the_message_sink() {
    let engine = engine();
    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = messages.clone();
    engine.set_message_callback(move |m| sink.borrow_mut().push(m.text.clone()));

    let mut ctx = Context::new(&engine);
    assert_eq!(ctx.execute(), Err(VmError::ContextNotPrepared));

    let logged = messages.borrow();
    assert_eq!(logged.len(), 1);
    assert!(logged[0].contains("Execute"), "names the failing operation: {}", logged[0]);
    assert!(logged[0].contains("ContextNotPrepared"));
}

/// With auto-collection enabled, Execute asks the collector for one step
/// per object created during the call.
#[test]
fn auto_gc_steps_follow_allocations() {
    let engine = Engine::new(EngineConfig { auto_garbage_collect: true, ..EngineConfig::default() });
    let buffer_maker = int_fn(&engine, "alloc_buffers", vec![], |b| {
        b.variable_space(3);
        for _ in 0..3 {
            b.emit_v_dw(Opcode::AllocListBuffer, 2, 16);
            b.emit_v_ptr(Opcode::Free, 2, VmPtr::Type(skald::TypeId::RAW_BUFFER).encode());
        }
        b.emit_v_dw(Opcode::SetVar32, 3, 0);
        b.emit_v(Opcode::CopyVarToReg32, 3);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(buffer_maker).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(engine.gc_steps_run(), 3, "one step per created object");
}

/// User-data slots are typed, replace on rewrite and read back by key.
#[test]
fn user_data_slots() {
    let engine = engine();
    let mut ctx = Context::new(&engine);

    assert!(ctx.user_data(1).is_none());
    assert!(ctx.set_user_data(1, Rc::new("first".to_owned())).is_none());
    let old = ctx.set_user_data(1, Rc::new("second".to_owned())).unwrap();
    assert_eq!(old.downcast_ref::<String>().unwrap(), "first");
    assert_eq!(ctx.user_data(1).unwrap().downcast_ref::<String>().unwrap(), "second");
    assert!(ctx.user_data(2).is_none());
}

/// Section names registered for diagnostics resolve from the indices the
/// line table carries.
#[test]
fn section_names_resolve() {
    let engine = engine();
    let idx = engine.add_section_name("scripts/main.sk");
    assert_eq!(engine.section_name(idx).as_deref(), Some("scripts/main.sk"));
    assert_eq!(engine.add_section_name("scripts/main.sk"), idx, "names are interned");
}

/// List buffers assemble through the dedicated instructions and are
/// readable through the element addresses they push.
#[test]
fn list_buffer_assembly() {
    let engine = engine();
    let f = int_fn(&engine, "build_list", vec![], |b| {
        b.variable_space(4);
        b.stack_needed(8);
        // buffer = alloc(12); buffer.count = 2; write elements 5 and 6.
        b.emit_v_dw(Opcode::AllocListBuffer, 2, 12);
        b.emit_v_dw_dw(Opcode::SetListSize, 2, 0, 2);
        b.emit_v_dw(Opcode::PushListElement, 2, 4);
        b.emit(Opcode::PopPtrToReg);
        b.emit_v_dw(Opcode::SetVar32, 3, 5);
        b.emit_v(Opcode::WriteRef32, 3);
        b.emit_v_dw(Opcode::PushListElement, 2, 8);
        b.emit(Opcode::PopPtrToReg);
        b.emit_v_dw(Opcode::SetVar32, 3, 6);
        b.emit_v(Opcode::WriteRef32, 3);
        // Read both elements back through fresh element addresses.
        b.emit_v_dw(Opcode::PushListElement, 2, 4);
        b.emit(Opcode::PopPtrToReg);
        b.emit_v(Opcode::ReadRef32, 3);
        b.emit_v_dw(Opcode::PushListElement, 2, 8);
        b.emit(Opcode::PopPtrToReg);
        b.emit_v(Opcode::ReadRef32, 4);
        b.emit_vvv(Opcode::AddI32, 3, 3, 4);
        b.emit_v_ptr(Opcode::Free, 2, VmPtr::Type(skald::TypeId::RAW_BUFFER).encode());
        b.emit_v(Opcode::CopyVarToReg32, 3);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 11);
    assert_eq!(engine.heap_stats().live_objects, 0);
}
