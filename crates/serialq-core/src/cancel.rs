//! One-shot, idempotent cancellation handles.

use parking_lot::Mutex;
use std::sync::Arc;

type Cleanup = Box<dyn FnOnce() + Send>;

enum Slot {
    Active(Cleanup),
    Disposed,
}

struct Inner {
    slot: Mutex<Slot>,
}

/// A handle that runs a cleanup closure exactly once.
///
/// Cloning a `CancelToken` shares the same underlying slot: disposing any
/// clone disposes all of them, and a second `dispose()` call (from any clone,
/// on any thread) observes the slot already taken and is a silent no-op. This
/// mirrors the swap-based idempotency used for pool task cancellation, but
/// generalized to run an arbitrary cleanup rather than just flip a flag.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token that runs `cleanup` the first time it is disposed.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Active(Box::new(cleanup))),
            }),
        }
    }

    /// A token that is already disposed; `dispose()` is a no-op.
    pub fn noop() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot::Disposed),
            }),
        }
    }

    /// Runs the cleanup closure if it has not already run.
    pub fn dispose(&self) {
        let prev = std::mem::replace(&mut *self.inner.slot.lock(), Slot::Disposed);
        if let Slot::Active(cleanup) = prev {
            cleanup();
        }
    }

    /// Returns whether this token has already been disposed.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Disposed)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispose_runs_cleanup_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = CancelToken::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.dispose();
        token.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_disposal() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = CancelToken::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let clone = token.clone();
        clone.dispose();
        assert!(token.is_disposed());
        token.dispose();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn noop_token_is_already_disposed() {
        let token = CancelToken::noop();
        assert!(token.is_disposed());
        token.dispose();
    }
}
