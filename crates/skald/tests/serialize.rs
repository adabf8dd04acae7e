//! Serialization of suspended executions: register APIs, the snapshot
//! round trip and the packed stack-pointer format.

mod common;

use std::rc::Rc;

use common::{engine, int32, int_fn, void};
use skald::{Context, ContextSnapshot, Engine, ExecutionState, FunctionDef, FunctionId, Opcode, VmError};

/// Registers a host function that requests suspension of its own context.
fn pause_fn(engine: &Rc<Engine>) -> FunctionId {
    engine.register_function(FunctionDef::host("pause", void(), vec![], |call| {
        call.context().suspend();
    }))
}

/// A function that counts up to its argument, pausing each iteration:
/// `r = 0; while (arg != 0) { r += 1; arg -= 1; pause(); }`
fn counting_fn(engine: &Rc<Engine>, pause: FunctionId) -> FunctionId {
    int_fn(engine, "counter", vec![int32()], |b| {
        b.variable_space(2);
        b.stack_needed(6);
        b.emit_v_dw(Opcode::SetVar32, 1, 0);
        let top = b.pos();
        b.emit_v_dw(Opcode::CmpI32Const, 0, 0);
        let done = b.emit_jump(Opcode::JumpIfZero);
        b.emit_v(Opcode::IncVarI32, 1);
        b.emit_v(Opcode::DecVarI32, 0);
        b.emit_dw(Opcode::CallHost, pause.0);
        b.emit_jump_to(Opcode::Jump, top);
        b.patch_jump(done);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
    })
}

fn run_to_completion(ctx: &mut Context) -> u32 {
    loop {
        match ctx.execute().unwrap() {
            ExecutionState::Suspended => {}
            ExecutionState::Finished => return ctx.return_dword(),
            other => panic!("unexpected execution result {other}"),
        }
    }
}

/// The saved registers of a suspended frame serialize with the 6/26 stack
/// pointer packing and restore bit-exactly.
#[test]
fn call_state_registers_round_trip() {
    let engine = engine();
    let pause = pause_fn(&engine);
    let f = counting_fn(&engine, pause);

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 3).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);

    let regs = ctx.call_state_registers(0).unwrap();
    assert_eq!(regs.function, f);
    assert_ne!(regs.program_pointer, 0, "suspended mid-function");
    // Block index rides in the top 6 bits; the first block is 0.
    assert_eq!(regs.stack_pointer >> 26, 0);
    assert_eq!(regs.stack_index, 0);

    let state = ctx.state_registers(0).unwrap();
    assert_eq!(state.initial_function, Some(f));

    // Writing the registers back outside deserialization is rejected.
    assert_eq!(ctx.set_call_state_registers(0, regs), Err(VmError::ContextActive));
}

/// Snapshot round trip: a context suspended mid-loop restores into a fresh
/// context and both runs produce identical results.
#[test]
fn snapshot_restores_and_resumes() {
    let engine = engine();
    let pause = pause_fn(&engine);
    let f = counting_fn(&engine, pause);

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 5).unwrap();

    // Burn two iterations before capturing.
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);

    let snapshot = ContextSnapshot::capture(&ctx).unwrap();
    let bytes = snapshot.to_bytes().unwrap();
    let decoded = ContextSnapshot::from_bytes(&bytes).unwrap();

    // The original finishes...
    assert_eq!(run_to_completion(&mut ctx), 5);

    // ...and so does the restored twin, from the same point.
    let mut twin = Context::new(&engine);
    decoded.restore(&mut twin).unwrap();
    assert_eq!(twin.state(), ExecutionState::Suspended);
    assert_eq!(run_to_completion(&mut twin), 5);
}

/// A snapshot taken while suspended inside a nested script call restores
/// the whole call stack.
#[test]
fn snapshot_covers_nested_frames() {
    let engine = engine();
    let pause = pause_fn(&engine);

    let inner = int_fn(&engine, "inner", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(6);
        b.emit_v_dw(Opcode::SetVar32, 1, 9);
        b.emit_dw(Opcode::CallHost, pause.0);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });
    let outer = int_fn(&engine, "outer", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(6);
        b.emit_dw(Opcode::Call, inner.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_vv_dw(Opcode::AddI32Const, 1, 1, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(outer).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);
    assert_eq!(ctx.callstack_size(), 2, "suspended inside the inner call");

    let snapshot = ContextSnapshot::capture(&ctx).unwrap();
    let mut twin = Context::new(&engine);
    snapshot.restore(&mut twin).unwrap();
    assert_eq!(twin.callstack_size(), 2);
    assert_eq!(twin.function(0), Some(inner));
    assert_eq!(twin.function(1), Some(outer));

    assert_eq!(run_to_completion(&mut twin), 10);

    // The original keeps working independently.
    assert_eq!(run_to_completion(&mut ctx), 10);
}

/// Deserialization rejects out-of-range and malformed register values.
#[test]
fn deserialization_validates_input() {
    let engine = engine();
    let pause = pause_fn(&engine);
    let f = counting_fn(&engine, pause);

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 1).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Suspended);
    let mut regs = ctx.call_state_registers(0).unwrap();

    let mut fresh = Context::new(&engine);
    fresh.start_deserialization().unwrap();
    fresh.push_function(f, skald::VmPtr::Null).unwrap();

    // A stack pointer naming an unallocated block is refused.
    regs.stack_pointer |= 5 << 26;
    assert_eq!(fresh.set_call_state_registers(0, regs), Err(VmError::InvalidArg));

    // The prepared frame is intact, so deserialization can still complete.
    fresh.finish_deserialization().unwrap();
    assert_eq!(fresh.state(), ExecutionState::Suspended);
}

/// `finish_deserialization` without any pushed function resets the context.
#[test]
fn finish_without_function_fails_cleanly() {
    let engine = engine();
    let mut ctx = Context::new(&engine);
    ctx.start_deserialization().unwrap();
    assert_eq!(ctx.finish_deserialization(), Err(VmError::ContextNotPrepared));
    assert_eq!(ctx.state(), ExecutionState::Uninitialized);
}
