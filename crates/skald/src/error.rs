//! Error codes, execution states and diagnostic messages.

use std::fmt;

use strum::{Display, IntoStaticStr};

/// API-level validation errors.
///
/// These are returned when a context operation is invoked in an illegal
/// state or with bad arguments. They never mutate the context; runtime
/// faults inside script code are reported through the exception machinery
/// instead (see [`crate::Context::exception_string`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum VmError {
    /// Generic failure.
    Error,
    /// The context is active or suspended and cannot be changed.
    ContextActive,
    /// The operation requires a prepared context.
    ContextNotPrepared,
    /// No function, or an unknown function id, was given.
    NoFunction,
    /// An argument index or value was out of range.
    InvalidArg,
    /// A value of the wrong type was supplied.
    InvalidType,
    /// A configured memory limit would be exceeded.
    OutOfMemory,
    /// The requested combination is not supported.
    NotSupported,
}

impl VmError {
    /// Numeric code for hosts that prefer the C-style error surface.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Error => -1,
            Self::ContextActive => -2,
            Self::ContextNotPrepared => -3,
            Self::NoFunction => -4,
            Self::InvalidArg => -5,
            Self::InvalidType => -6,
            Self::OutOfMemory => -7,
            Self::NotSupported => -8,
        }
    }
}

impl std::error::Error for VmError {}

/// Status of an execution context.
///
/// Exactly one state holds at any time. `execute` returns the final state of
/// the run: `Finished`, `Suspended`, `Aborted` or `Exception`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum ExecutionState {
    /// No function prepared.
    Uninitialized,
    /// A function is prepared and arguments may be set.
    Prepared,
    /// The interpreter loop is running on the owning thread.
    Active,
    /// Execution was cooperatively paused and can be resumed.
    Suspended,
    /// The prepared function ran to completion; the return value is readable.
    Finished,
    /// Execution was aborted at a suspension point.
    Aborted,
    /// An uncaught script exception terminated execution.
    Exception,
    /// The context is being rebuilt from serialized registers.
    Deserialization,
}

/// Script exception descriptions raised by the interpreter itself.
pub mod exceptions {
    pub const NULL_POINTER_ACCESS: &str = "Null pointer access";
    pub const DIVIDE_BY_ZERO: &str = "Divide by zero";
    pub const DIVIDE_OVERFLOW: &str = "Divide overflow";
    pub const POW_OVERFLOW: &str = "Pow overflow";
    pub const STACK_OVERFLOW: &str = "Stack overflow";
    pub const UNBOUND_FUNCTION: &str = "Unbound function called";
    pub const UNRECOGNIZED_BYTECODE: &str = "Unrecognized byte code";
    pub const TOO_MANY_NESTED_CALLS: &str = "Too many nested calls";
    pub const APP_EXCEPTION: &str = "Caught an exception from the application";
}

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MessageKind {
    Error,
    Warning,
    Information,
}

/// A diagnostic written through the engine's message sink.
#[derive(Debug, Clone)]
pub struct Message {
    pub section: String,
    pub row: u32,
    pub col: u32,
    pub kind: MessageKind,
    pub text: String,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}) : {} : {}", self.section, self.row, self.col, self.kind, self.text)
    }
}
