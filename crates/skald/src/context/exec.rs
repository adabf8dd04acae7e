//! The interpreter: a single dispatch loop over the instruction set.
//!
//! The program counter, stack pointer and frame pointer live in locals and
//! are written back to the register bundle before anything that can
//! re-enter the interpreter, inspect the registers, suspend, or fault. The
//! loop exits only when the status leaves `Active`.

use std::sync::atomic::Ordering;

use crate::bytecode::op::{self, Opcode};
use crate::context::Context;
use crate::error::{ExecutionState, exceptions};
use crate::function::{FuncKind, FunctionId};
use crate::memory::VmPtr;
use crate::pow::{as_powi, as_powi64, as_powu, as_powu64};
use crate::types::{PTR_SLOTS, TypeId};

impl Context {
    #[inline]
    pub(crate) fn vr_i32(&self) -> i32 {
        self.regs.value_register as u32 as i32
    }

    #[inline]
    pub(crate) fn vr_set_i32(&mut self, v: i32) {
        self.regs.value_register =
            (self.regs.value_register & 0xFFFF_FFFF_0000_0000) | u64::from(v as u32);
    }

    /// Runs instructions until the status leaves `Active`.
    #[expect(clippy::too_many_lines, reason = "the dispatch loop is one match by design")]
    pub(crate) fn execute_next(&mut self) {
        let engine = self.engine.clone();
        let mut func = self.current_function.clone().expect("execute_next: no current function");
        let mut pc = self.regs.program_pointer.expect("execute_next: program pointer not set") as usize;
        let mut sp = self.regs.stack_pointer;
        let mut fp = self.regs.frame_pointer;

        // Write the cached registers back to the bundle.
        macro_rules! sync {
            () => {{
                self.regs.program_pointer = Some(pc as u32);
                self.regs.stack_pointer = sp;
                self.regs.frame_pointer = fp;
            }};
        }
        // Re-read the cached registers after a call switched frames.
        macro_rules! reload {
            () => {{
                func = self.current_function.clone().expect("execute_next: no current function");
                pc = self.regs.program_pointer.expect("execute_next: program pointer lost") as usize;
                sp = self.regs.stack_pointer;
                fp = self.regs.frame_pointer;
            }};
        }
        macro_rules! code {
            () => {
                &func.script_data().bytecode
            };
        }
        // Raise a VM exception at the current instruction and leave.
        macro_rules! raise {
            ($descr:expr) => {{
                sync!();
                self.set_internal_exception($descr, true);
                return;
            }};
        }

        loop {
            let Some(opcode) = op::decode(code!(), pc) else {
                raise!(exceptions::UNRECOGNIZED_BYTECODE);
            };

            match opcode {
                // ---- stack and pointer traffic ---------------------------
                Opcode::PopPtr => {
                    sp = sp.offset(PTR_SLOTS as i32);
                    pc += 1;
                }
                Opcode::PushGlobalPtr => {
                    let src = VmPtr::decode(op::ptr_arg(code!(), pc));
                    let v = self.mem_read_u64(src);
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, v);
                    pc += 3;
                }
                Opcode::PushConst32 => {
                    sp = sp.offset(-1);
                    self.stack.write_slot(sp, op::dword_arg(code!(), pc));
                    pc += 2;
                }
                Opcode::PushVar32 => {
                    let v = self.ld32(fp, op::sword0(code!(), pc).into());
                    sp = sp.offset(-1);
                    self.stack.write_slot(sp, v);
                    pc += 1;
                }
                Opcode::PushFrameAddr => {
                    let at = fp.offset(-i32::from(op::sword0(code!(), pc)));
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, at.to_ptr().encode());
                    pc += 1;
                }
                Opcode::SwapPtr => {
                    let a = self.stack.read_slot64(sp);
                    let b = self.stack.read_slot64(sp.offset(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, b);
                    self.stack.write_slot64(sp.offset(PTR_SLOTS as i32), a);
                    pc += 1;
                }
                Opcode::BoolNot => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off);
                    self.st32(fp, off, u32::from(v == 0));
                    pc += 1;
                }
                Opcode::PushGlobal32 => {
                    let src = VmPtr::decode(op::ptr_arg(code!(), pc));
                    let v = self.mem_read_u32(src);
                    sp = sp.offset(-1);
                    self.stack.write_slot(sp, v);
                    pc += 3;
                }
                Opcode::LoadGlobalCopy32 => {
                    let addr = op::ptr_arg(code!(), pc);
                    self.regs.value_register = addr;
                    let v = self.mem_read_u32(VmPtr::decode(addr));
                    self.st32(fp, op::sword0(code!(), pc).into(), v);
                    pc += 3;
                }

                // ---- control flow ----------------------------------------
                Opcode::Call => {
                    let id = FunctionId(op::int_arg(code!(), pc) as u32);
                    pc += 2;
                    sync!();
                    self.call_script_function(engine.function(id));
                    reload!();
                    if self.state() != ExecutionState::Active {
                        return;
                    }
                }
                Opcode::Ret => {
                    let returning_to_host = matches!(
                        self.call_stack.last(),
                        None | Some(crate::context::CallStackEntry::Marker(_))
                    );
                    if returning_to_host {
                        sync!();
                        self.set_status(ExecutionState::Finished);
                        return;
                    }
                    let args = op::word0(code!(), pc);
                    self.pop_call_state();
                    reload!();
                    sp = sp.offset(i32::from(args));
                }
                Opcode::Jump => {
                    pc = (pc as i64 + 2 + i64::from(op::int_arg(code!(), pc))) as usize;
                }
                Opcode::JumpIfZero => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() == 0);
                }
                Opcode::JumpIfNotZero => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() != 0);
                }
                Opcode::JumpIfNeg => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() < 0);
                }
                Opcode::JumpIfNotNeg => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() >= 0);
                }
                Opcode::JumpIfPos => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() > 0);
                }
                Opcode::JumpIfNotPos => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.vr_i32() <= 0);
                }
                Opcode::JumpIfLowByteZero => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.regs.value_register as u8 == 0);
                }
                Opcode::JumpIfLowByteNotZero => {
                    pc = branch(pc, op::int_arg(code!(), pc), self.regs.value_register as u8 != 0);
                }
                Opcode::JumpTable => {
                    let index = self.ld32(fp, op::sword0(code!(), pc).into()) as i32;
                    pc = (pc as i64 + 1 + i64::from(index) * 2) as usize;
                }

                // ---- register tests --------------------------------------
                Opcode::TestZero => {
                    self.regs.value_register = u64::from(self.vr_i32() == 0);
                    pc += 1;
                }
                Opcode::TestNotZero => {
                    self.regs.value_register = u64::from(self.vr_i32() != 0);
                    pc += 1;
                }
                Opcode::TestNeg => {
                    self.regs.value_register = u64::from(self.vr_i32() < 0);
                    pc += 1;
                }
                Opcode::TestNotNeg => {
                    self.regs.value_register = u64::from(self.vr_i32() >= 0);
                    pc += 1;
                }
                Opcode::TestPos => {
                    self.regs.value_register = u64::from(self.vr_i32() > 0);
                    pc += 1;
                }
                Opcode::TestNotPos => {
                    self.regs.value_register = u64::from(self.vr_i32() <= 0);
                    pc += 1;
                }

                // ---- negation and increments -----------------------------
                Opcode::NegI32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) as i32;
                    self.st32(fp, off, v.wrapping_neg() as u32);
                    pc += 1;
                }
                Opcode::NegF32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f32::from_bits(self.ld32(fp, off));
                    self.st32(fp, off, (-v).to_bits());
                    pc += 1;
                }
                Opcode::NegF64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f64::from_bits(self.ld64(fp, off));
                    self.st64(fp, off, (-v).to_bits());
                    pc += 1;
                }
                Opcode::NegI64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld64(fp, off) as i64;
                    self.st64(fp, off, v.wrapping_neg() as u64);
                    pc += 1;
                }
                Opcode::IncI8 | Opcode::DecI8 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncI8 { 1u8 } else { u8::MAX };
                    let v = self.mem_read_u8(at).wrapping_add(delta);
                    self.mem_write_u8(at, v);
                    pc += 1;
                }
                Opcode::IncI16 | Opcode::DecI16 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncI16 { 1u16 } else { u16::MAX };
                    let v = self.mem_read_u16(at).wrapping_add(delta);
                    self.mem_write_u16(at, v);
                    pc += 1;
                }
                Opcode::IncI32 | Opcode::DecI32 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncI32 { 1u32 } else { u32::MAX };
                    let v = self.mem_read_u32(at).wrapping_add(delta);
                    self.mem_write_u32(at, v);
                    pc += 1;
                }
                Opcode::IncI64 | Opcode::DecI64 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncI64 { 1u64 } else { u64::MAX };
                    let v = self.mem_read_u64(at).wrapping_add(delta);
                    self.mem_write_u64(at, v);
                    pc += 1;
                }
                Opcode::IncF32 | Opcode::DecF32 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncF32 { 1.0f32 } else { -1.0 };
                    let v = f32::from_bits(self.mem_read_u32(at)) + delta;
                    self.mem_write_u32(at, v.to_bits());
                    pc += 1;
                }
                Opcode::IncF64 | Opcode::DecF64 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let delta = if opcode == Opcode::IncF64 { 1.0f64 } else { -1.0 };
                    let v = f64::from_bits(self.mem_read_u64(at)) + delta;
                    self.mem_write_u64(at, v.to_bits());
                    pc += 1;
                }
                Opcode::IncVarI32 | Opcode::DecVarI32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let delta = if opcode == Opcode::IncVarI32 { 1u32 } else { u32::MAX };
                    let v = self.ld32(fp, off).wrapping_add(delta);
                    self.st32(fp, off, v);
                    pc += 1;
                }

                // ---- bitwise ---------------------------------------------
                Opcode::BitNot32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = !self.ld32(fp, off);
                    self.st32(fp, off, v);
                    pc += 1;
                }
                Opcode::BitNot64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = !self.ld64(fp, off);
                    self.st64(fp, off, v);
                    pc += 1;
                }
                Opcode::BitAnd32 | Opcode::BitOr32 | Opcode::BitXor32 | Opcode::Shl32
                | Opcode::Shr32 | Opcode::Sar32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = self.ld32(fp, a);
                    let y = self.ld32(fp, b);
                    let r = match opcode {
                        Opcode::BitAnd32 => x & y,
                        Opcode::BitOr32 => x | y,
                        Opcode::BitXor32 => x ^ y,
                        Opcode::Shl32 => x.wrapping_shl(y),
                        Opcode::Shr32 => x.wrapping_shr(y),
                        _ => ((x as i32).wrapping_shr(y)) as u32,
                    };
                    self.st32(fp, d, r);
                    pc += 2;
                }
                Opcode::BitAnd64 | Opcode::BitOr64 | Opcode::BitXor64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = self.ld64(fp, a);
                    let y = self.ld64(fp, b);
                    let r = match opcode {
                        Opcode::BitAnd64 => x & y,
                        Opcode::BitOr64 => x | y,
                        _ => x ^ y,
                    };
                    self.st64(fp, d, r);
                    pc += 2;
                }
                Opcode::Shl64 | Opcode::Shr64 | Opcode::Sar64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = self.ld64(fp, a);
                    let shift = self.ld32(fp, b);
                    let r = match opcode {
                        Opcode::Shl64 => x.wrapping_shl(shift),
                        Opcode::Shr64 => x.wrapping_shr(shift),
                        _ => ((x as i64).wrapping_shr(shift)) as u64,
                    };
                    self.st64(fp, d, r);
                    pc += 2;
                }
                Opcode::ClearHighBytes => {
                    self.regs.value_register &= 0xFFFF_FFFF_0000_00FF;
                    pc += 1;
                }

                // ---- copies and raw memory -------------------------------
                Opcode::CopyMem => {
                    let dst = VmPtr::decode(self.stack.read_slot64(sp));
                    sp = sp.offset(PTR_SLOTS as i32);
                    let src = VmPtr::decode(self.stack.read_slot64(sp));
                    if src.is_null() || dst.is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    self.mem_copy_dwords(dst, src, u32::from(op::word0(code!(), pc)));
                    // The destination stays on the stack as the lvalue.
                    self.stack.write_slot64(sp, dst.encode());
                    pc += 2;
                }
                Opcode::PushConst64 => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, op::qword_arg(code!(), pc));
                    pc += 3;
                }
                Opcode::PushVarPtr => {
                    let v = self.ld64(fp, op::sword0(code!(), pc).into());
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, v);
                    pc += 1;
                }
                Opcode::DerefPtr => {
                    let at = VmPtr::decode(self.stack.read_slot64(sp));
                    if at.is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    let v = self.mem_read_u64(at);
                    self.stack.write_slot64(sp, v);
                    pc += 1;
                }

                // ---- comparisons -----------------------------------------
                Opcode::CmpI32 => {
                    let a = self.ld32(fp, op::sword0(code!(), pc).into()) as i32;
                    let b = self.ld32(fp, op::sword1(code!(), pc).into()) as i32;
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpU32 => {
                    let a = self.ld32(fp, op::sword0(code!(), pc).into());
                    let b = self.ld32(fp, op::sword1(code!(), pc).into());
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpI64 => {
                    let a = self.ld64(fp, op::sword0(code!(), pc).into()) as i64;
                    let b = self.ld64(fp, op::sword1(code!(), pc).into()) as i64;
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpU64 => {
                    let a = self.ld64(fp, op::sword0(code!(), pc).into());
                    let b = self.ld64(fp, op::sword1(code!(), pc).into());
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpF32 => {
                    let a = f32::from_bits(self.ld32(fp, op::sword0(code!(), pc).into()));
                    let b = f32::from_bits(self.ld32(fp, op::sword1(code!(), pc).into()));
                    self.vr_set_i32(fcmp(a == b, a < b));
                    pc += 2;
                }
                Opcode::CmpF64 => {
                    let a = f64::from_bits(self.ld64(fp, op::sword0(code!(), pc).into()));
                    let b = f64::from_bits(self.ld64(fp, op::sword1(code!(), pc).into()));
                    self.vr_set_i32(fcmp(a == b, a < b));
                    pc += 2;
                }
                Opcode::CmpI32Const => {
                    let a = self.ld32(fp, op::sword0(code!(), pc).into()) as i32;
                    let b = op::int_arg(code!(), pc);
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpU32Const => {
                    let a = self.ld32(fp, op::sword0(code!(), pc).into());
                    let b = op::dword_arg(code!(), pc);
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }
                Opcode::CmpF32Const => {
                    let a = f32::from_bits(self.ld32(fp, op::sword0(code!(), pc).into()));
                    let b = op::float_arg(code!(), pc);
                    self.vr_set_i32(fcmp(a == b, a < b));
                    pc += 2;
                }
                Opcode::CmpPtr => {
                    let a = self.ld64(fp, op::sword0(code!(), pc).into());
                    let b = self.ld64(fp, op::sword1(code!(), pc).into());
                    self.vr_set_i32(order(a.cmp(&b)));
                    pc += 2;
                }

                // ---- register/pointer moves ------------------------------
                Opcode::PopPtrToReg => {
                    self.regs.value_register = self.stack.read_slot64(sp);
                    sp = sp.offset(PTR_SLOTS as i32);
                    pc += 1;
                }
                Opcode::PushPtrFromReg => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, self.regs.value_register);
                    pc += 1;
                }

                // ---- calls into the engine -------------------------------
                Opcode::CallHost | Opcode::CallHostSingle => {
                    let id = FunctionId(op::int_arg(code!(), pc) as u32);
                    sync!();
                    let popped = engine.call_host_function(self, id);
                    sp = sp.offset(popped as i32);
                    pc += 2;
                    if self.flags.process_suspend.load(Ordering::Acquire) {
                        if self.flags.do_suspend.load(Ordering::Acquire) {
                            sync!();
                            self.set_status(ExecutionState::Suspended);
                            return;
                        }
                        if self.state() != ExecutionState::Active {
                            sync!();
                            return;
                        }
                    }
                }
                Opcode::CallImported => {
                    let id = FunctionId(op::int_arg(code!(), pc) as u32);
                    sync!();
                    let decl = engine.function(id);
                    debug_assert_eq!(decl.kind, FuncKind::Imported);
                    match engine.bound_import(decl.import_slot) {
                        None => {
                            // The handler must see the position after the
                            // call to identify the in-flight arguments.
                            self.regs.program_pointer = Some(pc as u32 + 2);
                            self.mark_args_for_cleanup();
                            self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                            return;
                        }
                        Some(target_id) => {
                            let target = engine.function(target_id);
                            match target.kind {
                                FuncKind::Script => {
                                    self.regs.program_pointer = Some(pc as u32 + 2);
                                    self.call_script_function(target);
                                }
                                FuncKind::Host => {
                                    let popped = engine.call_host_function(self, target_id);
                                    self.regs.stack_pointer =
                                        self.regs.stack_pointer.offset(popped as i32);
                                    self.regs.program_pointer = Some(pc as u32 + 2);
                                }
                                _ => {
                                    self.regs.program_pointer = Some(pc as u32 + 2);
                                    self.mark_args_for_cleanup();
                                    self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                                    return;
                                }
                            }
                        }
                    }
                    reload!();
                    if self.state() != ExecutionState::Active {
                        return;
                    }
                }
                Opcode::CallInterface => {
                    let id = FunctionId(op::int_arg(code!(), pc) as u32);
                    pc += 2;
                    sync!();
                    self.call_interface_method(engine.function(id));
                    reload!();
                    if self.state() != ExecutionState::Active {
                        return;
                    }
                }
                Opcode::CallFuncPtr => {
                    let handle = self.ld_ptr(fp, op::sword0(code!(), pc).into());
                    sync!();
                    let Some(id) = handle.as_func() else {
                        self.regs.program_pointer = Some(pc as u32 + 1);
                        self.mark_args_for_cleanup();
                        self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                        return;
                    };
                    let callee = engine.function(id);
                    match callee.kind {
                        FuncKind::Script => {
                            self.regs.program_pointer = Some(pc as u32 + 1);
                            self.call_script_function(callee);
                        }
                        FuncKind::Delegate => {
                            let target = callee.delegate.expect("delegate without target");
                            // Substitute the bound receiver before dispatch.
                            self.regs.stack_pointer =
                                self.regs.stack_pointer.offset(-(PTR_SLOTS as i32));
                            let at = self.regs.stack_pointer;
                            self.stack.write_slot64(at, VmPtr::from(target.object).encode());
                            let method = engine.function(target.func);
                            match method.kind {
                                FuncKind::Host => {
                                    let popped = engine.call_host_function(self, target.func);
                                    self.regs.stack_pointer =
                                        self.regs.stack_pointer.offset(popped as i32);
                                    self.regs.program_pointer = Some(pc as u32 + 1);
                                }
                                FuncKind::Virtual | FuncKind::Interface => {
                                    self.regs.program_pointer = Some(pc as u32 + 1);
                                    self.call_interface_method(method);
                                }
                                _ => {
                                    self.regs.program_pointer = Some(pc as u32 + 1);
                                    self.call_script_function(method);
                                }
                            }
                        }
                        FuncKind::Host => {
                            let popped = engine.call_host_function(self, id);
                            self.regs.stack_pointer = self.regs.stack_pointer.offset(popped as i32);
                            self.regs.program_pointer = Some(pc as u32 + 1);
                        }
                        FuncKind::Imported => {
                            self.regs.program_pointer = Some(pc as u32 + 1);
                            match engine.bound_import(callee.import_slot) {
                                Some(target) => self.call_script_function(engine.function(target)),
                                None => {
                                    self.mark_args_for_cleanup();
                                    self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                                    return;
                                }
                            }
                        }
                        _ => {
                            self.mark_args_for_cleanup();
                            self.set_internal_exception(exceptions::UNBOUND_FUNCTION, true);
                            return;
                        }
                    }
                    reload!();
                    if self.state() != ExecutionState::Active {
                        return;
                    }
                }
                Opcode::Suspend => {
                    if self.flags.process_suspend.load(Ordering::Acquire) {
                        if let Some(cb) = self.line_callback.clone() {
                            sync!();
                            cb(self);
                        }
                        if self.flags.do_suspend.load(Ordering::Acquire) {
                            pc += 1;
                            sync!();
                            self.set_status(ExecutionState::Suspended);
                            return;
                        }
                    }
                    pc += 1;
                }

                // ---- allocation family -----------------------------------
                Opcode::Alloc => {
                    let VmPtr::Type(type_id) = VmPtr::decode(op::ptr_arg(code!(), pc)) else {
                        raise!(exceptions::UNRECOGNIZED_BYTECODE);
                    };
                    let ctor = op::dword_at(code!(), pc, 3);
                    let info = engine.type_info(type_id);

                    if info.flags.contains(crate::types::TypeFlags::SCRIPT_OBJECT) {
                        // The constructor is a script function and may
                        // re-enter the interpreter for nested construction.
                        sync!();
                        let obj = engine.alloc_script_object(type_id);
                        let f = engine.function(FunctionId(ctor));

                        let target_at =
                            self.regs.stack_pointer.offset(f.space_for_params() as i32);
                        let target = VmPtr::decode(self.stack.read_slot64(target_at));
                        if !target.is_null() {
                            self.mem_write_u64(target, VmPtr::from(obj).encode());
                        }

                        self.regs.stack_pointer =
                            self.regs.stack_pointer.offset(-(PTR_SLOTS as i32));
                        let at = self.regs.stack_pointer;
                        self.stack.write_slot64(at, VmPtr::from(obj).encode());

                        self.regs.program_pointer = Some(pc as u32 + 4);
                        self.call_script_function(f);
                        reload!();
                        if self.state() != ExecutionState::Active {
                            return;
                        }
                    } else {
                        let obj = engine.alloc_raw(type_id, info.size as usize);
                        if ctor != 0 {
                            sp = sp.offset(-(PTR_SLOTS as i32));
                            self.stack.write_slot64(sp, VmPtr::from(obj).encode());
                            sync!();
                            let popped = engine.call_host_function(self, FunctionId(ctor));
                            sp = sp.offset(popped as i32);
                        }
                        let target = VmPtr::decode(self.stack.read_slot64(sp));
                        sp = sp.offset(PTR_SLOTS as i32);
                        if !target.is_null() {
                            self.mem_write_u64(target, VmPtr::from(obj).encode());
                        }
                        pc += 4;
                        if self.flags.process_suspend.load(Ordering::Acquire) {
                            if self.flags.do_suspend.load(Ordering::Acquire) {
                                sync!();
                                self.set_status(ExecutionState::Suspended);
                                return;
                            }
                            if self.state() != ExecutionState::Active {
                                sync!();
                                // Roll the allocation back; the frame never
                                // owned it.
                                engine.destroy_list_buffer(obj);
                                if !target.is_null() {
                                    self.mem_write_u64(target, 0);
                                }
                                return;
                            }
                        }
                    }
                }
                Opcode::Free => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let VmPtr::Type(type_id) = VmPtr::decode(op::ptr_arg(code!(), pc)) else {
                        raise!(exceptions::UNRECOGNIZED_BYTECODE);
                    };
                    let v = self.ld_ptr(fp, off);
                    if !v.is_null() {
                        sync!();
                        engine.dispose_ptr(self, v, type_id);
                        self.st64(fp, off, 0);
                    }
                    pc += 3;
                }
                Opcode::LoadObj => {
                    let off = i32::from(op::sword0(code!(), pc));
                    self.regs.object_type = None;
                    self.regs.object_register = self.ld_ptr(fp, off);
                    self.st64(fp, off, 0);
                    pc += 1;
                }
                Opcode::StoreObj => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let obj = self.regs.object_register;
                    self.st_ptr(fp, off, obj);
                    self.regs.object_register = VmPtr::Null;
                    pc += 1;
                }
                Opcode::GetObj => {
                    let at = sp.offset(i32::from(op::word0(code!(), pc)));
                    let off = self.stack.read_slot64(at) as i64 as i32;
                    let v = self.ld64(fp, off);
                    self.stack.write_slot64(at, v);
                    self.st64(fp, off, 0);
                    pc += 1;
                }
                Opcode::GetObjRef => {
                    let at = sp.offset(i32::from(op::word0(code!(), pc)));
                    let off = self.stack.read_slot64(at) as i64 as i32;
                    let v = self.ld64(fp, off);
                    self.stack.write_slot64(at, v);
                    pc += 1;
                }
                Opcode::GetRef => {
                    let at = sp.offset(i32::from(op::word0(code!(), pc)));
                    let off = self.stack.read_slot64(at) as i64 as i32;
                    self.stack.write_slot64(at, fp.offset(-off).to_ptr().encode());
                    pc += 1;
                }
                Opcode::RefCopy | Opcode::RefCopyVar => {
                    let VmPtr::Type(type_id) = VmPtr::decode(op::ptr_arg(code!(), pc)) else {
                        raise!(exceptions::UNRECOGNIZED_BYTECODE);
                    };
                    let dst = if opcode == Opcode::RefCopy {
                        let d = VmPtr::decode(self.stack.read_slot64(sp));
                        sp = sp.offset(PTR_SLOTS as i32);
                        d
                    } else {
                        fp.offset(-i32::from(op::sword0(code!(), pc))).to_ptr()
                    };
                    let src = VmPtr::decode(self.stack.read_slot64(sp));
                    sync!();
                    let flags = engine.type_info(type_id).flags;
                    if !flags.intersects(
                        crate::types::TypeFlags::NO_COUNT.union(crate::types::TypeFlags::VALUE),
                    ) {
                        if let Some(old) = VmPtr::decode(self.mem_read_u64(dst)).as_object() {
                            engine.release_ref_object(self, old);
                        }
                        if let Some(new) = src.as_object() {
                            engine.addref_object(type_id, new);
                        }
                    }
                    self.mem_write_u64(dst, src.encode());
                    pc += 3;
                }
                Opcode::CheckRef => {
                    if VmPtr::decode(self.stack.read_slot64(sp)).is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    pc += 1;
                }
                Opcode::CheckRefS => {
                    let at = VmPtr::decode(self.stack.read_slot64(sp));
                    if at.is_null() || VmPtr::decode(self.mem_read_u64(at)).is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    pc += 1;
                }
                Opcode::CheckVarNull => {
                    if self.ld_ptr(fp, op::sword0(code!(), pc).into()).is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    pc += 1;
                }
                Opcode::CheckArgNull => {
                    let at = sp.offset(i32::from(op::word0(code!(), pc)));
                    if VmPtr::decode(self.stack.read_slot64(at)).is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    pc += 1;
                }
                Opcode::PushNull => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, 0);
                    pc += 1;
                }
                Opcode::ClearVarPtr => {
                    self.st64(fp, op::sword0(code!(), pc).into(), 0);
                    pc += 1;
                }
                Opcode::PushTypePtr => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, op::ptr_arg(code!(), pc));
                    pc += 3;
                }
                Opcode::PushTypeId => {
                    sp = sp.offset(-1);
                    self.stack.write_slot(sp, op::dword_arg(code!(), pc));
                    pc += 2;
                }
                Opcode::Cast => {
                    let target = TypeId(op::dword_arg(code!(), pc));
                    let at = VmPtr::decode(self.stack.read_slot64(sp));
                    if !at.is_null() {
                        let handle = VmPtr::decode(self.mem_read_u64(at));
                        if let Some(obj) = handle.as_object() {
                            let obj_type = engine.heap.borrow().type_of(obj);
                            if engine.type_compatible(obj_type, target) {
                                self.regs.object_type = None;
                                self.regs.object_register = handle;
                                engine.heap.borrow().inc_ref(obj);
                            }
                            // On failure the object register is already null.
                        }
                    }
                    sp = sp.offset(PTR_SLOTS as i32);
                    pc += 2;
                }

                // ---- variable initialization and moves -------------------
                Opcode::SetVar8 | Opcode::SetVar16 | Opcode::SetVar32 => {
                    self.st32(fp, op::sword0(code!(), pc).into(), op::dword_arg(code!(), pc));
                    pc += 2;
                }
                Opcode::SetVar64 => {
                    self.st64(fp, op::sword0(code!(), pc).into(), op::qword_arg(code!(), pc));
                    pc += 3;
                }
                Opcode::OffsetPtr => {
                    let base = VmPtr::decode(self.stack.read_slot64(sp));
                    if base.is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    let moved = base.offset_bytes(i32::from(op::sword0(code!(), pc)));
                    self.stack.write_slot64(sp, moved.encode());
                    pc += 2;
                }
                Opcode::CopyVarToVar32 => {
                    let v = self.ld32(fp, op::sword1(code!(), pc).into());
                    self.st32(fp, op::sword0(code!(), pc).into(), v);
                    pc += 2;
                }
                Opcode::CopyVarToVar64 => {
                    let v = self.ld64(fp, op::sword1(code!(), pc).into());
                    self.st64(fp, op::sword0(code!(), pc).into(), v);
                    pc += 2;
                }
                Opcode::CopyVarToReg32 => {
                    let v = self.ld32(fp, op::sword0(code!(), pc).into());
                    self.regs.value_register =
                        (self.regs.value_register & 0xFFFF_FFFF_0000_0000) | u64::from(v);
                    pc += 1;
                }
                Opcode::CopyVarToReg64 => {
                    self.regs.value_register = self.ld64(fp, op::sword0(code!(), pc).into());
                    pc += 1;
                }
                Opcode::CopyRegToVar32 => {
                    let v = self.regs.value_register as u32;
                    self.st32(fp, op::sword0(code!(), pc).into(), v);
                    pc += 1;
                }
                Opcode::CopyRegToVar64 => {
                    let v = self.regs.value_register;
                    self.st64(fp, op::sword0(code!(), pc).into(), v);
                    pc += 1;
                }
                Opcode::CopyVarToGlobal32 => {
                    let dst = VmPtr::decode(op::ptr_arg(code!(), pc));
                    let v = self.ld32(fp, op::sword0(code!(), pc).into());
                    self.mem_write_u32(dst, v);
                    pc += 3;
                }
                Opcode::CopyGlobalToVar32 => {
                    let src = VmPtr::decode(op::ptr_arg(code!(), pc));
                    let v = self.mem_read_u32(src);
                    self.st32(fp, op::sword0(code!(), pc).into(), v);
                    pc += 3;
                }
                Opcode::SetGlobal32 => {
                    let dst = VmPtr::decode(op::ptr_arg(code!(), pc));
                    self.mem_write_u32(dst, op::dword_at(code!(), pc, 3));
                    pc += 4;
                }

                // ---- indirect access through the value register ----------
                Opcode::WriteRef8 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.ld32(fp, op::sword0(code!(), pc).into()) as u8;
                    self.mem_write_u8(at, v);
                    pc += 1;
                }
                Opcode::WriteRef16 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.ld32(fp, op::sword0(code!(), pc).into()) as u16;
                    self.mem_write_u16(at, v);
                    pc += 1;
                }
                Opcode::WriteRef32 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.ld32(fp, op::sword0(code!(), pc).into());
                    self.mem_write_u32(at, v);
                    pc += 1;
                }
                Opcode::WriteRef64 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.ld64(fp, op::sword0(code!(), pc).into());
                    self.mem_write_u64(at, v);
                    pc += 1;
                }
                Opcode::ReadRef8 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.mem_read_u8(at);
                    // Narrow reads zero-extend the containing slot.
                    self.st32(fp, op::sword0(code!(), pc).into(), u32::from(v));
                    pc += 1;
                }
                Opcode::ReadRef16 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.mem_read_u16(at);
                    self.st32(fp, op::sword0(code!(), pc).into(), u32::from(v));
                    pc += 1;
                }
                Opcode::ReadRef32 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.mem_read_u32(at);
                    self.st32(fp, op::sword0(code!(), pc).into(), v);
                    pc += 1;
                }
                Opcode::ReadRef64 => {
                    let at = VmPtr::decode(self.regs.value_register);
                    let v = self.mem_read_u64(at);
                    self.st64(fp, op::sword0(code!(), pc).into(), v);
                    pc += 1;
                }
                Opcode::LoadGlobalAddr => {
                    self.regs.value_register = op::ptr_arg(code!(), pc);
                    pc += 3;
                }
                Opcode::LoadVarAddr => {
                    self.regs.value_register =
                        fp.offset(-i32::from(op::sword0(code!(), pc))).to_ptr().encode();
                    pc += 1;
                }
                Opcode::PushGlobalAddr => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, op::ptr_arg(code!(), pc));
                    pc += 3;
                }
                Opcode::PushVarIndex => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, i64::from(op::sword0(code!(), pc)) as u64);
                    pc += 1;
                }
                Opcode::LoadThisField => {
                    let this = self.ld_ptr(fp, 0);
                    if this.is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    self.regs.value_register =
                        this.offset_bytes(i32::from(op::sword0(code!(), pc))).encode();
                    pc += 2;
                }
                Opcode::LoadFieldAddr => {
                    let base = self.ld_ptr(fp, op::sword0(code!(), pc).into());
                    if base.is_null() {
                        raise!(exceptions::NULL_POINTER_ACCESS);
                    }
                    self.regs.value_register =
                        base.offset_bytes(i32::from(op::sword1(code!(), pc))).encode();
                    pc += 3;
                }
                Opcode::LoadVarFieldAddr => {
                    let base = fp.offset(-i32::from(op::sword0(code!(), pc))).to_ptr();
                    self.regs.value_register =
                        base.offset_bytes(i32::from(op::sword1(code!(), pc))).encode();
                    pc += 3;
                }
                Opcode::PushVar64 => {
                    let v = self.ld64(fp, op::sword0(code!(), pc).into());
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, v);
                    pc += 1;
                }
                Opcode::PushFuncPtr => {
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, op::ptr_arg(code!(), pc));
                    pc += 3;
                }

                // ---- conversions -----------------------------------------
                Opcode::I32ToF32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) as i32;
                    self.st32(fp, off, (v as f32).to_bits());
                    pc += 1;
                }
                Opcode::F32ToI32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f32::from_bits(self.ld32(fp, off));
                    self.st32(fp, off, (v as i32) as u32);
                    pc += 1;
                }
                Opcode::U32ToF32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off);
                    self.st32(fp, off, (v as f32).to_bits());
                    pc += 1;
                }
                Opcode::F32ToU32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f32::from_bits(self.ld32(fp, off));
                    // Via int, matching the widespread compiler behaviour for
                    // negative inputs.
                    self.st32(fp, off, (v as i32) as u32);
                    pc += 1;
                }
                Opcode::I8ToI32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = (self.ld32(fp, off) as u8) as i8;
                    self.st32(fp, off, (i32::from(v)) as u32);
                    pc += 1;
                }
                Opcode::I16ToI32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = (self.ld32(fp, off) as u16) as i16;
                    self.st32(fp, off, (i32::from(v)) as u32);
                    pc += 1;
                }
                Opcode::U8ToU32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) as u8;
                    self.st32(fp, off, u32::from(v));
                    pc += 1;
                }
                Opcode::U16ToU32 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) as u16;
                    self.st32(fp, off, u32::from(v));
                    pc += 1;
                }
                Opcode::I32ToI8 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) & 0xFF;
                    self.st32(fp, off, v);
                    pc += 1;
                }
                Opcode::I32ToI16 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld32(fp, off) & 0xFFFF;
                    self.st32(fp, off, v);
                    pc += 1;
                }
                Opcode::F64ToI32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f64::from_bits(self.ld64(fp, s));
                    self.st32(fp, d, (v as i32) as u32);
                    pc += 2;
                }
                Opcode::F64ToU32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f64::from_bits(self.ld64(fp, s));
                    self.st32(fp, d, (v as i32) as u32);
                    pc += 2;
                }
                Opcode::F64ToF32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f64::from_bits(self.ld64(fp, s));
                    self.st32(fp, d, (v as f32).to_bits());
                    pc += 2;
                }
                Opcode::I32ToF64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld32(fp, s) as i32;
                    self.st64(fp, d, (f64::from(v)).to_bits());
                    pc += 2;
                }
                Opcode::U32ToF64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld32(fp, s);
                    self.st64(fp, d, (f64::from(v)).to_bits());
                    pc += 2;
                }
                Opcode::F32ToF64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f32::from_bits(self.ld32(fp, s));
                    self.st64(fp, d, (f64::from(v)).to_bits());
                    pc += 2;
                }
                Opcode::I64ToI32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld64(fp, s);
                    self.st32(fp, d, v as u32);
                    pc += 2;
                }
                Opcode::U32ToI64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld32(fp, s);
                    self.st64(fp, d, u64::from(v));
                    pc += 2;
                }
                Opcode::I32ToI64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld32(fp, s) as i32;
                    self.st64(fp, d, (i64::from(v)) as u64);
                    pc += 2;
                }
                Opcode::F32ToI64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f32::from_bits(self.ld32(fp, s));
                    self.st64(fp, d, (v as i64) as u64);
                    pc += 2;
                }
                Opcode::F64ToI64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f64::from_bits(self.ld64(fp, off));
                    // Truncation toward zero.
                    self.st64(fp, off, (v as i64) as u64);
                    pc += 1;
                }
                Opcode::F32ToU64 => {
                    let (d, s) = var2(code!(), pc);
                    let v = f32::from_bits(self.ld32(fp, s));
                    self.st64(fp, d, (v as i64) as u64);
                    pc += 2;
                }
                Opcode::F64ToU64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = f64::from_bits(self.ld64(fp, off));
                    self.st64(fp, off, (v as i64) as u64);
                    pc += 1;
                }
                Opcode::I64ToF32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld64(fp, s) as i64;
                    self.st32(fp, d, (v as f32).to_bits());
                    pc += 2;
                }
                Opcode::U64ToF32 => {
                    let (d, s) = var2(code!(), pc);
                    let v = self.ld64(fp, s);
                    self.st32(fp, d, (v as f32).to_bits());
                    pc += 2;
                }
                Opcode::I64ToF64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld64(fp, off) as i64;
                    self.st64(fp, off, (v as f64).to_bits());
                    pc += 1;
                }
                Opcode::U64ToF64 => {
                    let off = i32::from(op::sword0(code!(), pc));
                    let v = self.ld64(fp, off);
                    self.st64(fp, off, (v as f64).to_bits());
                    pc += 1;
                }

                // ---- arithmetic ------------------------------------------
                Opcode::AddI32 | Opcode::SubI32 | Opcode::MulI32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = self.ld32(fp, a) as i32;
                    let y = self.ld32(fp, b) as i32;
                    let r = match opcode {
                        Opcode::AddI32 => x.wrapping_add(y),
                        Opcode::SubI32 => x.wrapping_sub(y),
                        _ => x.wrapping_mul(y),
                    };
                    self.st32(fp, d, r as u32);
                    pc += 2;
                }
                Opcode::DivI32 | Opcode::ModI32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = self.ld32(fp, b) as i32;
                    if divider == 0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = self.ld32(fp, a) as i32;
                    if divider == -1 && dividend == i32::MIN {
                        raise!(exceptions::DIVIDE_OVERFLOW);
                    }
                    let r = if opcode == Opcode::DivI32 { dividend / divider } else { dividend % divider };
                    self.st32(fp, d, r as u32);
                    pc += 2;
                }
                Opcode::DivU32 | Opcode::ModU32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = self.ld32(fp, b);
                    if divider == 0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = self.ld32(fp, a);
                    let r = if opcode == Opcode::DivU32 { dividend / divider } else { dividend % divider };
                    self.st32(fp, d, r);
                    pc += 2;
                }
                Opcode::AddI64 | Opcode::SubI64 | Opcode::MulI64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = self.ld64(fp, a) as i64;
                    let y = self.ld64(fp, b) as i64;
                    let r = match opcode {
                        Opcode::AddI64 => x.wrapping_add(y),
                        Opcode::SubI64 => x.wrapping_sub(y),
                        _ => x.wrapping_mul(y),
                    };
                    self.st64(fp, d, r as u64);
                    pc += 2;
                }
                Opcode::DivI64 | Opcode::ModI64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = self.ld64(fp, b) as i64;
                    if divider == 0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = self.ld64(fp, a) as i64;
                    if divider == -1 && dividend == i64::MIN {
                        raise!(exceptions::DIVIDE_OVERFLOW);
                    }
                    let r = if opcode == Opcode::DivI64 { dividend / divider } else { dividend % divider };
                    self.st64(fp, d, r as u64);
                    pc += 2;
                }
                Opcode::DivU64 | Opcode::ModU64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = self.ld64(fp, b);
                    if divider == 0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = self.ld64(fp, a);
                    let r = if opcode == Opcode::DivU64 { dividend / divider } else { dividend % divider };
                    self.st64(fp, d, r);
                    pc += 2;
                }
                Opcode::AddF32 | Opcode::SubF32 | Opcode::MulF32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = f32::from_bits(self.ld32(fp, a));
                    let y = f32::from_bits(self.ld32(fp, b));
                    let r = match opcode {
                        Opcode::AddF32 => x + y,
                        Opcode::SubF32 => x - y,
                        _ => x * y,
                    };
                    self.st32(fp, d, r.to_bits());
                    pc += 2;
                }
                Opcode::DivF32 | Opcode::ModF32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = f32::from_bits(self.ld32(fp, b));
                    if divider == 0.0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = f32::from_bits(self.ld32(fp, a));
                    let r = if opcode == Opcode::DivF32 { dividend / divider } else { dividend % divider };
                    self.st32(fp, d, r.to_bits());
                    pc += 2;
                }
                Opcode::AddF64 | Opcode::SubF64 | Opcode::MulF64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let x = f64::from_bits(self.ld64(fp, a));
                    let y = f64::from_bits(self.ld64(fp, b));
                    let r = match opcode {
                        Opcode::AddF64 => x + y,
                        Opcode::SubF64 => x - y,
                        _ => x * y,
                    };
                    self.st64(fp, d, r.to_bits());
                    pc += 2;
                }
                Opcode::DivF64 | Opcode::ModF64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let divider = f64::from_bits(self.ld64(fp, b));
                    if divider == 0.0 {
                        raise!(exceptions::DIVIDE_BY_ZERO);
                    }
                    let dividend = f64::from_bits(self.ld64(fp, a));
                    let r = if opcode == Opcode::DivF64 { dividend / divider } else { dividend % divider };
                    self.st64(fp, d, r.to_bits());
                    pc += 2;
                }
                Opcode::AddI32Const | Opcode::SubI32Const | Opcode::MulI32Const => {
                    let d = i32::from(op::sword0(code!(), pc));
                    let s = i32::from(op::sword1(code!(), pc));
                    let x = self.ld32(fp, s) as i32;
                    let y = op::dword_at(code!(), pc, 2) as i32;
                    let r = match opcode {
                        Opcode::AddI32Const => x.wrapping_add(y),
                        Opcode::SubI32Const => x.wrapping_sub(y),
                        _ => x.wrapping_mul(y),
                    };
                    self.st32(fp, d, r as u32);
                    pc += 3;
                }
                Opcode::AddF32Const | Opcode::SubF32Const | Opcode::MulF32Const => {
                    let d = i32::from(op::sword0(code!(), pc));
                    let s = i32::from(op::sword1(code!(), pc));
                    let x = f32::from_bits(self.ld32(fp, s));
                    let y = f32::from_bits(op::dword_at(code!(), pc, 2));
                    let r = match opcode {
                        Opcode::AddF32Const => x + y,
                        Opcode::SubF32Const => x - y,
                        _ => x * y,
                    };
                    self.st32(fp, d, r.to_bits());
                    pc += 3;
                }

                // ---- exponentiation --------------------------------------
                Opcode::PowI32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let mut overflow = false;
                    let r = as_powi(self.ld32(fp, a) as i32, self.ld32(fp, b) as i32, &mut overflow);
                    self.st32(fp, d, r as u32);
                    if overflow {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowU32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let mut overflow = false;
                    let r = as_powu(self.ld32(fp, a), self.ld32(fp, b), &mut overflow);
                    self.st32(fp, d, r);
                    if overflow {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowI64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let mut overflow = false;
                    let r = as_powi64(self.ld64(fp, a) as i64, self.ld64(fp, b) as i64, &mut overflow);
                    self.st64(fp, d, r as u64);
                    if overflow {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowU64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let mut overflow = false;
                    let r = as_powu64(self.ld64(fp, a), self.ld64(fp, b), &mut overflow);
                    self.st64(fp, d, r);
                    if overflow {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowF32 => {
                    let (d, a, b) = var3(code!(), pc);
                    let r = f32::from_bits(self.ld32(fp, a)).powf(f32::from_bits(self.ld32(fp, b)));
                    self.st32(fp, d, r.to_bits());
                    if r.is_infinite() {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowF64 => {
                    let (d, a, b) = var3(code!(), pc);
                    let r = f64::from_bits(self.ld64(fp, a)).powf(f64::from_bits(self.ld64(fp, b)));
                    self.st64(fp, d, r.to_bits());
                    if r.is_infinite() {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }
                Opcode::PowF64Int => {
                    let (d, a, b) = var3(code!(), pc);
                    let r = f64::from_bits(self.ld64(fp, a)).powi(self.ld32(fp, b) as i32);
                    self.st64(fp, d, r.to_bits());
                    if r.is_infinite() {
                        raise!(exceptions::POW_OVERFLOW);
                    }
                    pc += 2;
                }

                // ---- list buffers ----------------------------------------
                Opcode::AllocListBuffer => {
                    let size = op::dword_arg(code!(), pc);
                    let obj = engine.alloc_raw(TypeId::RAW_BUFFER, size as usize);
                    self.st_ptr(fp, op::sword0(code!(), pc).into(), VmPtr::from(obj));
                    pc += 2;
                }
                Opcode::SetListSize | Opcode::SetListType => {
                    let base = self.ld_ptr(fp, op::sword0(code!(), pc).into());
                    debug_assert!(!base.is_null(), "list buffer not allocated");
                    let at = base.offset_bytes(op::dword_at(code!(), pc, 1) as i32);
                    self.mem_write_u32(at, op::dword_at(code!(), pc, 2));
                    pc += 3;
                }
                Opcode::PushListElement => {
                    let base = self.ld_ptr(fp, op::sword0(code!(), pc).into());
                    debug_assert!(!base.is_null(), "list buffer not allocated");
                    let at = base.offset_bytes(op::dword_arg(code!(), pc) as i32);
                    sp = sp.offset(-(PTR_SLOTS as i32));
                    self.stack.write_slot64(sp, at.encode());
                    pc += 2;
                }

                // ---- JIT hand-off ----------------------------------------
                Opcode::JitEntry => {
                    let jit = func.script_data().jit.clone();
                    let jit_arg = op::ptr_arg(code!(), pc);
                    if let Some(jit) = jit
                        && jit_arg != 0
                    {
                        sync!();
                        jit(self, jit_arg);
                        reload!();
                        if self.state() != ExecutionState::Active {
                            return;
                        }
                    } else {
                        // Not a JIT resume point; no-op advance.
                        pc += 3;
                    }
                }
            }
        }
    }
}

#[inline]
fn branch(pc: usize, disp: i32, taken: bool) -> usize {
    if taken { (pc as i64 + 2 + i64::from(disp)) as usize } else { pc + 2 }
}

#[inline]
fn order(o: std::cmp::Ordering) -> i32 {
    match o {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Three-way result for floats with native NaN behaviour: equal only on
/// actual equality, otherwise greater unless strictly less.
#[inline]
fn fcmp(eq: bool, lt: bool) -> i32 {
    if eq {
        0
    } else if lt {
        -1
    } else {
        1
    }
}

#[inline]
fn var2(code: &[u32], pc: usize) -> (i32, i32) {
    (i32::from(op::sword0(code, pc)), i32::from(op::sword1(code, pc)))
}

#[inline]
fn var3(code: &[u32], pc: usize) -> (i32, i32, i32) {
    (
        i32::from(op::sword0(code, pc)),
        i32::from(op::sword1(code, pc)),
        i32::from(op::sword2(code, pc)),
    )
}
