//! Per-thread tracking of which queues the current thread is nested inside.
//!
//! A thread only ever pushes and pops its own entries, so no cross-thread
//! synchronization is needed here; the stack is destroyed along with the
//! thread that owns it, the same lifetime discipline the rest of this crate
//! uses for thread-local state.

use std::cell::RefCell;
use std::sync::Arc;

use crate::engine::EngineInner;

thread_local! {
    static STACK: RefCell<Vec<Arc<EngineInner>>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard returned by [`push`]; pops its entry when dropped.
///
/// Guards must be dropped in the reverse order they were created (ordinary
/// stack discipline via nested scopes); this is enforced with a debug
/// assertion rather than a runtime check; the queue engine never forms
/// guards out of order.
pub(crate) struct StackGuard {
    _private: (),
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        STACK.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert!(popped.is_some(), "queue stack guard dropped with an empty stack");
        });
    }
}

/// Pushes `engine` onto this thread's nesting stack for the lifetime of the
/// returned guard.
pub(crate) fn push(engine: Arc<EngineInner>) -> StackGuard {
    STACK.with(|stack| stack.borrow_mut().push(engine));
    StackGuard { _private: () }
}

/// Returns whether `engine` is anywhere in this thread's current nesting
/// stack (i.e. this thread is, directly or transitively, already running a
/// work item that belongs to `engine`).
pub(crate) fn contains(engine: &Arc<EngineInner>) -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|entry| Arc::ptr_eq(entry, engine))
    })
}

/// Returns the innermost queue this thread is currently executing a work
/// item for, if any.
pub(crate) fn current() -> Option<Arc<EngineInner>> {
    STACK.with(|stack| stack.borrow().last().cloned())
}
