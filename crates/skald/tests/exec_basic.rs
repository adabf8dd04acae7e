//! Interpreter basics: arithmetic, moves, jumps, globals and conversions.

mod common;

use common::{engine, int32, int_fn};
use skald::types::DataType;
use skald::{Context, ExecutionState, FunctionDef, FunctionBuilder, Opcode, TypeId, VmError};

/// Adds two dword arguments through a local and the value register.
#[test]
fn add_two_ints() {
    let engine = engine();
    let f = int_fn(&engine, "add", vec![int32(), int32()], |b| {
        b.variable_space(1);
        b.declare_var("a", 0, int32(), false);
        b.declare_var("b", -1, int32(), false);
        b.declare_var("r", 1, int32(), false);
        b.emit_vvv(Opcode::AddI32, 1, 0, -1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_dword(0, 20).unwrap();
    ctx.set_arg_dword(1, 22).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 42);
}

/// A script-to-script call passes arguments and returns through the value
/// register; the callee's Ret pops the argument area.
#[test]
fn script_calls_script() {
    let engine = engine();
    let callee = int_fn(&engine, "add", vec![int32(), int32()], |b| {
        b.variable_space(1);
        b.emit_vvv(Opcode::AddI32, 1, 0, -1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 2);
    });
    let caller = int_fn(&engine, "caller", vec![], |b| {
        b.variable_space(1);
        b.stack_needed(8);
        b.emit_dw(Opcode::PushConst32, 22);
        b.emit_dw(Opcode::PushConst32, 20);
        b.emit_dw(Opcode::Call, callee.0);
        b.emit_v(Opcode::CopyRegToVar32, 1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(caller).unwrap();
    assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
    assert_eq!(ctx.return_dword(), 42);
    // Property: the initial function is current again and no frames remain.
    assert_eq!(ctx.function(0), Some(caller));
    assert_eq!(ctx.callstack_size(), 1);
}

/// A counting loop built from the compare/branch family.
#[test]
fn loop_with_conditional_jumps() {
    let engine = engine();
    let f = int_fn(&engine, "sum_to_five", vec![], |b| {
        b.variable_space(2);
        // r = 0; i = 5; do { r += i; i -= 1 } while (i != 0)
        b.emit_v_dw(Opcode::SetVar32, 1, 0);
        b.emit_v_dw(Opcode::SetVar32, 2, 5);
        let top = b.pos();
        b.emit_vvv(Opcode::AddI32, 1, 1, 2);
        b.emit_v(Opcode::DecVarI32, 2);
        b.emit_v_dw(Opcode::CmpI32Const, 2, 0);
        b.emit_jump_to(Opcode::JumpIfNotZero, top);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.return_dword(), 15);
}

/// 64-bit arithmetic and the widening conversions.
#[test]
fn qword_arithmetic_and_conversions() {
    let engine = engine();
    let f = engine.register_function(FunctionDef::script(
        "wide",
        DataType::value(TypeId::INT64),
        vec![DataType::value(TypeId::INT64)],
        {
            let mut b = FunctionBuilder::new();
            b.variable_space(4);
            // r = arg * 3 - 1
            b.emit_v_qw(Opcode::SetVar64, 2, 3);
            b.emit_vvv(Opcode::MulI64, 4, 0, 2);
            b.emit_v_qw(Opcode::SetVar64, 2, 1);
            b.emit_vvv(Opcode::SubI64, 4, 4, 2);
            b.emit_v(Opcode::CopyVarToReg64, 4);
            b.emit_w(Opcode::Ret, 2);
            b.build()
        },
    ));

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.set_arg_qword(0, 1_000_000_000_007).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.return_qword(), 3_000_000_000_020);
}

/// Float compare produces the three-way result in the value register and
/// NaN orders as "not less".
#[test]
fn float_compare_semantics() {
    let engine = engine();
    let f = engine.register_function(FunctionDef::script(
        "fcmp",
        int32(),
        vec![DataType::value(TypeId::FLOAT), DataType::value(TypeId::FLOAT)],
        {
            let mut b = FunctionBuilder::new();
            b.emit_vv(Opcode::CmpF32, 0, -1);
            b.emit_w(Opcode::Ret, 2);
            b.build()
        },
    ));

    let run = |a: f32, b: f32| {
        let mut ctx = Context::new(&engine);
        ctx.prepare(f).unwrap();
        ctx.set_arg_float(0, a).unwrap();
        ctx.set_arg_float(1, b).unwrap();
        ctx.execute().unwrap();
        ctx.return_dword() as i32
    };

    assert_eq!(run(1.0, 2.0), -1);
    assert_eq!(run(2.0, 2.0), 0);
    assert_eq!(run(3.0, 2.0), 1);
    // NaN is neither equal nor less.
    assert_eq!(run(f32::NAN, 2.0), 1);
}

/// Globals round-trip through the dedicated global move instructions.
#[test]
fn global_variable_moves() {
    let engine = engine();
    let g = engine.register_global("counter", int32());
    engine.set_global_u32(g, 7);
    let addr = engine.global_addr("counter").unwrap().encode();

    let f = int_fn(&engine, "bump", vec![], |b| {
        b.variable_space(1);
        b.emit_v_ptr(Opcode::CopyGlobalToVar32, 1, addr);
        b.emit_vv_dw(Opcode::AddI32Const, 1, 1, 10);
        b.emit_v_ptr(Opcode::CopyVarToGlobal32, 1, addr);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 0);
    });

    let mut ctx = Context::new(&engine);
    ctx.prepare(f).unwrap();
    ctx.execute().unwrap();
    assert_eq!(ctx.return_dword(), 17);
    assert_eq!(engine.global_u32(g), 17);
}

/// The tabular jump advances by twice the selector.
#[test]
fn jump_table_selects_case() {
    let engine = engine();
    let f = int_fn(&engine, "select", vec![int32()], |b| {
        b.variable_space(1);
        // Each case is a Jump (2 words) to its handler.
        b.emit_v(Opcode::JumpTable, 0);
        let c0 = b.emit_jump(Opcode::Jump);
        let c1 = b.emit_jump(Opcode::Jump);
        let c2 = b.emit_jump(Opcode::Jump);
        b.patch_jump(c0);
        b.emit_v_dw(Opcode::SetVar32, 1, 100);
        let e0 = b.emit_jump(Opcode::Jump);
        b.patch_jump(c1);
        b.emit_v_dw(Opcode::SetVar32, 1, 200);
        let e1 = b.emit_jump(Opcode::Jump);
        b.patch_jump(c2);
        b.emit_v_dw(Opcode::SetVar32, 1, 300);
        b.patch_jump(e0);
        b.patch_jump(e1);
        b.emit_v(Opcode::CopyVarToReg32, 1);
        b.emit_w(Opcode::Ret, 1);
    });

    for (selector, expected) in [(0u32, 100u32), (1, 200), (2, 300)] {
        let mut ctx = Context::new(&engine);
        ctx.prepare(f).unwrap();
        ctx.set_arg_dword(0, selector).unwrap();
        ctx.execute().unwrap();
        assert_eq!(ctx.return_dword(), expected, "selector {selector}");
    }
}

/// Re-preparing the same function reuses the frame; a different function
/// re-runs the full setup.
#[test]
fn context_reuse_between_preparations() {
    let engine = engine();
    let f = int_fn(&engine, "echo", vec![int32()], |b| {
        b.emit_v(Opcode::CopyVarToReg32, 0);
        b.emit_w(Opcode::Ret, 1);
    });

    let mut ctx = Context::new(&engine);
    for i in 0..10u32 {
        ctx.prepare(f).unwrap();
        ctx.set_arg_dword(0, i).unwrap();
        assert_eq!(ctx.execute().unwrap(), ExecutionState::Finished);
        assert_eq!(ctx.return_dword(), i);
    }
}

/// Execute demands a prepared or suspended context.
#[test]
fn execute_requires_preparation() {
    let engine = engine();
    let mut ctx = Context::new(&engine);
    assert_eq!(ctx.execute(), Err(VmError::ContextNotPrepared));
    // Unprepare on an untouched context is a successful no-op.
    assert!(ctx.unprepare().is_ok());
    assert_eq!(ctx.state(), ExecutionState::Uninitialized);
}
