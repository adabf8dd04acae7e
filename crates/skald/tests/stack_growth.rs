//! Segmented stack growth and the configured cap.

mod common;

use common::{int32, int_fn};
use skald::error::exceptions;
use skald::{Context, Engine, EngineConfig, ExecutionState, Opcode};

/// Scenario: recursion deep enough to exhaust the first block allocates a
/// new one, copies the pending arguments across, and completes.
#[test]
fn recursion_grows_across_blocks() {
    let engine = Engine::new(EngineConfig {
        init_context_stack_size: 16,
        ..EngineConfig::default()
    });
    // Register with a known id so the self-call can be emitted directly.
    let expected_id = skald::FunctionId(0);
    let f = int_fn(&engine, "rec", vec![int32()], |b| {
        b.variable_space(2);
        b.stack_needed(6);
        b.emit_v_dw(Opcode::CmpI32Const, 0, 0);
        let not_zero = b.emit_jump(Opcode::JumpIfNotZero);
        b.emit_v_dw(Opcode::SetVar32, 1, 0);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
        b.patch_jump(not_zero);
        b.emit_vv_dw(Opcode::SubI32Const, 2, 0, 1);
        b.emit_v(Opcode::PushVar32, 2);
        b.emit_dw(Opcode::Call, expected_id.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_vv_dw(Opcode::AddI32Const, 1, 1, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
    });
    assert_eq!(f, expected_id, "first registered function takes id 0");

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 40).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 40);
}

/// Scenario: a cap below the needed depth raises *stack-overflow*, and the
/// context can be reused afterwards.
#[test]
fn stack_cap_raises_overflow() {
    let engine = Engine::new(EngineConfig {
        init_context_stack_size: 16,
        max_context_stack_size: 40,
        ..EngineConfig::default()
    });
    let expected_id = skald::FunctionId(0);
    let f = int_fn(&engine, "rec", vec![int32()], |b| {
        b.variable_space(2);
        b.stack_needed(6);
        b.emit_v_dw(Opcode::CmpI32Const, 0, 0);
        let not_zero = b.emit_jump(Opcode::JumpIfNotZero);
        b.emit_v_dw(Opcode::SetVar32, 1, 0);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
        b.patch_jump(not_zero);
        b.emit_vv_dw(Opcode::SubI32Const, 2, 0, 1);
        b.emit_v(Opcode::PushVar32, 2);
        b.emit_dw(Opcode::Call, expected_id.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_vv_dw(Opcode::AddI32Const, 1, 1, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
    });
    assert_eq!(f, expected_id);

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 100).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Exception);
    assert_eq!(ctx.exception_string(), exceptions::STACK_OVERFLOW);

    // Shallow recursion still fits under the same cap.
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 1).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 1);
}
