//! Execution context of the skald embedded scripting VM.
//!
//! The crate centers on [`Context`]: the per-call object owning a register
//! bundle, a segmented evaluation stack and a call stack, driving a
//! register-based bytecode interpreter against a minimal [`Engine`]
//! (type/function registries, global data, a refcounted object heap and the
//! host calling bridge). Contexts support cooperative suspend/resume/abort,
//! try/catch unwinding with exact object disposal, nested host→script
//! re-entry via [`Context::push_state`]/[`Context::pop_state`], and
//! register-level serialization of suspended executions.
//!
//! ```
//! use skald::{Context, Engine, EngineConfig, FunctionBuilder, FunctionDef, Opcode};
//! use skald::types::{DataType, TypeId};
//!
//! let engine = Engine::new(EngineConfig::default());
//!
//! // int double_it(int x) { return x + x; }
//! let mut b = FunctionBuilder::new();
//! b.declare_var("x", 0, DataType::value(TypeId::INT32), false);
//! b.emit_vvv(Opcode::AddI32, 0, 0, 0);
//! b.emit_v(Opcode::CopyVarToReg32, 0);
//! b.emit(Opcode::Ret);
//! let f = engine.register_function(FunctionDef::script(
//!     "double_it",
//!     DataType::value(TypeId::INT32),
//!     vec![DataType::value(TypeId::INT32)],
//!     b.build(),
//! ));
//!
//! let mut ctx = Context::new(&engine);
//! ctx.prepare(f).unwrap();
//! ctx.set_arg_dword(0, 21).unwrap();
//! ctx.execute().unwrap();
//! assert_eq!(ctx.return_dword(), 42);
//! ```

#![expect(clippy::cast_possible_truncation, reason = "slot-width narrowing is the VM's data model")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts mirror the instruction semantics")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior is the specified arithmetic")]
#![expect(clippy::cast_precision_loss, reason = "int-to-float conversions follow the instruction set")]
#![expect(clippy::missing_errors_doc, reason = "error codes are uniform across the context API")]

pub mod bytecode;
pub mod context;
pub mod engine;
pub mod error;
pub mod function;
pub mod heap;
pub mod memory;
pub mod pow;
pub mod tls;
pub mod types;

pub use bytecode::{FunctionBuilder, Opcode};
pub use context::serialize::{CallStateRegisters, ContextSnapshot, StateRegisters};
pub use context::{Context, Registers, StackAddr, SuspendHandle};
pub use engine::{Engine, EngineConfig, FunctionDef, HostCall};
pub use error::{ExecutionState, Message, MessageKind, VmError};
pub use function::{FuncKind, FunctionId};
pub use heap::ObjectId;
pub use memory::VmPtr;
pub use types::{DataType, TypeDef, TypeFlags, TypeId};
