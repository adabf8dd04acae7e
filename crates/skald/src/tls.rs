//! Thread-local stack of executing contexts.
//!
//! Each `execute` pushes the context's serial for its duration. The depth
//! bounds host→script re-entry and `active_context_serial` lets host code
//! ask which context is currently driving the thread.

use std::cell::RefCell;

thread_local! {
    static ACTIVE: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Scope guard returned by [`enter`]; pops on drop.
pub struct ActiveGuard {
    serial: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.serial), "active-context stack out of order");
        });
    }
}

/// Pushes a context serial for the duration of an execution.
pub fn enter(serial: u64) -> ActiveGuard {
    ACTIVE.with(|stack| stack.borrow_mut().push(serial));
    ActiveGuard { serial }
}

/// Number of nested executions on this thread, including the current one.
#[must_use]
pub fn depth() -> usize {
    ACTIVE.with(|stack| stack.borrow().len())
}

/// Serial of the context currently executing on this thread, if any.
#[must_use]
pub fn active_context_serial() -> Option<u64> {
    ACTIVE.with(|stack| stack.borrow().last().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_tracks_depth() {
        assert_eq!(depth(), 0);
        let a = enter(1);
        assert_eq!(depth(), 1);
        assert_eq!(active_context_serial(), Some(1));
        {
            let _b = enter(2);
            assert_eq!(depth(), 2);
            assert_eq!(active_context_serial(), Some(2));
        }
        assert_eq!(depth(), 1);
        drop(a);
        assert_eq!(active_context_serial(), None);
    }
}
