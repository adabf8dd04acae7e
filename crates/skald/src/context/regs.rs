//! The register bundle and the cross-thread suspend latches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::context::stack::StackAddr;
use crate::memory::VmPtr;
use crate::types::TypeId;

/// Registers of a context.
///
/// The interpreter caches the program, stack and frame pointers in locals
/// and synchronizes them back here before any call, suspension or fault, so
/// the bundle always reflects true state at those points.
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    /// Offset into the current function's bytecode; `None` before the first
    /// instruction of an execution is entered.
    pub program_pointer: Option<u32>,
    pub stack_pointer: StackAddr,
    pub frame_pointer: StackAddr,
    /// 64-bit scalar scratch and return register; also carries encoded
    /// addresses for the indirect access instructions.
    pub value_register: u64,
    /// Object scratch and return register.
    pub object_register: VmPtr,
    /// Type of the object register's content, when owned.
    pub object_type: Option<TypeId>,
}

/// Latches polled by the interpreter at suspension points.
///
/// All flags are atomics so a second thread may request suspension or abort
/// through a [`SuspendHandle`] without locks; the hot path reads only
/// `process_suspend`.
#[derive(Debug, Default)]
pub struct SuspendFlags {
    /// Master latch: when false the suspend checks are skipped entirely.
    pub process_suspend: AtomicBool,
    pub do_suspend: AtomicBool,
    pub do_abort: AtomicBool,
    /// Set when the request came from outside the executing thread.
    pub external_suspend: AtomicBool,
}

impl SuspendFlags {
    pub(crate) fn request_suspend(&self) {
        self.do_suspend.store(true, Ordering::Release);
        self.external_suspend.store(true, Ordering::Release);
        self.process_suspend.store(true, Ordering::Release);
    }

    pub(crate) fn request_abort(&self) {
        self.do_suspend.store(true, Ordering::Release);
        self.external_suspend.store(true, Ordering::Release);
        self.do_abort.store(true, Ordering::Release);
        self.process_suspend.store(true, Ordering::Release);
    }
}

/// Cross-thread control for a context.
///
/// Cloneable and `Send`; a watchdog thread holds one to implement timeouts
/// by calling [`SuspendHandle::abort`].
#[derive(Clone)]
pub struct SuspendHandle {
    pub(crate) flags: Arc<SuspendFlags>,
}

impl SuspendHandle {
    /// Requests cooperative suspension at the next suspension point.
    pub fn suspend(&self) {
        self.flags.request_suspend();
    }

    /// Requests cooperative abort at the next suspension point.
    pub fn abort(&self) {
        self.flags.request_abort();
    }
}
