//! Cooperative-continuation bridge (`spec.md` §4.6).
//!
//! Rust has no ambient "where does an awaited continuation resume" hook
//! the way a GCD-backed host runtime does, so the bridge is built instead
//! as a custom [`std::task::Wake`] adapter: [`Queue::spawn`] polls a
//! future the first time inline inside a `submit_async` work item, and
//! every subsequent wake-up re-submits the next poll through
//! [`Queue::submit_async`] when [`Features::COOPERATIVE_CONTINUATIONS`] is
//! set on the queue — which means every poll, including the ones resuming
//! after a suspension, happens while this queue is pushed on the polling
//! thread's [`crate::queue_stack`], so `current_queue()` is stable across
//! `.await` points. When the feature is off, a woken future is simply
//! polled inline on whatever thread invoked the waker, mirroring "the
//! host's default policy" from the spec.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll, Wake, Waker};

use crate::cancel::CancelToken;
use crate::engine::{EngineInner, Features};

type BoxedFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct TaskWaker {
    engine: Arc<EngineInner>,
    slot: Arc<StdMutex<Option<BoxedFuture>>>,
    cancelled: Arc<AtomicBool>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::clone(self);
        if this.engine.features().contains(Features::COOPERATIVE_CONTINUATIONS) {
            // Resubmit the next poll through this queue so it runs with
            // the queue pushed on the drain worker's stack, same as the
            // first poll.
            let _ = this
                .engine
                .clone()
                .submit_async_boxed(Box::new(move || poll_once(this)));
        } else {
            // No bridge installed: poll inline, wherever this wake came
            // from. `current_queue()` will not reflect this queue here.
            poll_once(this);
        }
    }
}

fn poll_once(waker_data: Arc<TaskWaker>) {
    if waker_data.cancelled.load(Ordering::Acquire) {
        return;
    }
    let mut guard = waker_data.slot.lock().expect("continuation future mutex poisoned");
    let Some(mut future) = guard.take() else {
        // Already completed, cancelled, or a stale re-poll raced in.
        return;
    };
    drop(guard);

    let waker = Waker::from(Arc::clone(&waker_data));
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(()) => {
            tracing::trace!(target: "serialq_core::continuation", "spawned future completed");
        }
        Poll::Pending => {
            *waker_data.slot.lock().expect("continuation future mutex poisoned") = Some(future);
        }
    }
}

/// Spawns `future` onto `engine`: the first poll runs inside a
/// `submit_async` work item on this queue, and later polls are bridged
/// back to the queue the same way when cooperative continuations are
/// enabled. Disposing the returned token drops the future without polling
/// it again, regardless of which stage it is suspended at.
pub(crate) fn spawn<F>(engine: Arc<EngineInner>, future: F) -> CancelToken
where
    F: Future<Output = ()> + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let slot: Arc<StdMutex<Option<BoxedFuture>>> =
        Arc::new(StdMutex::new(Some(Box::pin(future))));
    let waker_data = Arc::new(TaskWaker {
        engine: engine.clone(),
        slot: slot.clone(),
        cancelled: cancelled.clone(),
    });

    // The very first poll is always dispatched through submit_async, so
    // code before the first `.await` observes `current_queue() == self`
    // too, regardless of the feature flag.
    let _ = engine.submit_async_boxed(Box::new(move || poll_once(waker_data)));

    CancelToken::new(move || {
        cancelled.store(true, Ordering::Release);
        slot.lock().expect("continuation future mutex poisoned").take();
    })
}

#[cfg(feature = "tokio")]
mod tokio_bridge {
    use std::sync::OnceLock;

    use tokio::runtime::{Handle, Runtime};

    static BACKGROUND_RUNTIME: OnceLock<Runtime> = OnceLock::new();

    /// Lazily starts one background multi-threaded Tokio runtime shared by
    /// every queue built with the `tokio` cargo feature, and returns a
    /// guard that enters its context for the lifetime of the guard. This
    /// lets Tokio-native leaf futures (timers, channels, I/O) be awaited
    /// from inside a drain worker thread, which is otherwise not a Tokio
    /// runtime thread.
    pub(crate) fn enter() -> tokio::runtime::EnterGuard<'static> {
        let runtime = BACKGROUND_RUNTIME.get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .thread_name("serialq-continuation")
                .enable_all()
                .build()
                .expect("failed to start the serialq continuation-bridge runtime")
        });
        Handle::enter(runtime.handle())
    }
}

/// Installed by the drain loop for the duration of a single drain pass
/// when [`Features::COOPERATIVE_CONTINUATIONS`] is set, so that any
/// Tokio-native future polled via [`spawn`] during this drain can reach a
/// reactor. Dropped (restoring the ambient Tokio context, if any) when the
/// drain returns.
#[cfg(feature = "tokio")]
pub(crate) fn install_if_enabled(inner: &Arc<EngineInner>) -> Option<tokio::runtime::EnterGuard<'static>> {
    if inner.features().contains(Features::COOPERATIVE_CONTINUATIONS) {
        Some(tokio_bridge::enter())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::task::Poll;

    use crate::engine::Queue;
    use crate::pool::ManualPool;

    /// A future that is pending exactly once, waking itself from a
    /// detached thread to simulate an external reactor notification
    /// arriving off-queue.
    struct YieldOnce {
        yielded: bool,
    }

    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.yielded {
                return Poll::Ready(());
            }
            self.yielded = true;
            let waker = cx.waker().clone();
            std::thread::spawn(move || waker.wake());
            Poll::Pending
        }
    }

    #[test]
    fn spawn_preserves_current_queue_across_suspension_when_bridged() {
        let pool = Arc::new(ManualPool::new());
        let queue = Queue::with_pool(pool, Features::COOPERATIVE_CONTINUATIONS);

        let checks = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let done = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));

        let q = queue.clone();
        let c = checks.clone();
        let f = failures.clone();
        let d = done.clone();
        queue.spawn(async move {
            if q.verify_on_queue().is_ok() {
                c.fetch_add(1, Ordering::SeqCst);
            } else {
                f.fetch_add(1, Ordering::SeqCst);
            }
            YieldOnce { yielded: false }.await;
            if q.verify_on_queue().is_ok() {
                c.fetch_add(1, Ordering::SeqCst);
            } else {
                f.fetch_add(1, Ordering::SeqCst);
            }
            let (lock, cvar) = &*d;
            *lock.lock() = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*done;
        let mut finished = lock.lock();
        while !*finished {
            cvar.wait(&mut finished);
        }
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn spawn_does_not_preserve_current_queue_when_not_bridged() {
        let pool = Arc::new(ManualPool::new());
        let queue = Queue::with_pool(pool, Features::empty());

        let first_ok = Arc::new(AtomicUsize::new(0));
        let second_wrong_queue = Arc::new(AtomicUsize::new(0));
        let done = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));

        let q = queue.clone();
        let a = first_ok.clone();
        let b = second_wrong_queue.clone();
        let d = done.clone();
        queue.spawn(async move {
            if q.verify_on_queue().is_ok() {
                a.fetch_add(1, Ordering::SeqCst);
            }
            YieldOnce { yielded: false }.await;
            if q.verify_on_queue().is_err() {
                b.fetch_add(1, Ordering::SeqCst);
            }
            let (lock, cvar) = &*d;
            *lock.lock() = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*done;
        let mut finished = lock.lock();
        while !*finished {
            cvar.wait(&mut finished);
        }
        assert_eq!(first_ok.load(Ordering::SeqCst), 1);
        assert_eq!(second_wrong_queue.load(Ordering::SeqCst), 1);
    }

    #[cfg(feature = "tokio")]
    #[test]
    fn spawn_can_await_a_tokio_native_leaf_future_when_bridged() {
        let pool = Arc::new(ManualPool::new());
        let queue = Queue::with_pool(pool, Features::COOPERATIVE_CONTINUATIONS);

        let done = Arc::new((parking_lot::Mutex::new(false), parking_lot::Condvar::new()));
        let d = done.clone();
        queue.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let (lock, cvar) = &*d;
            *lock.lock() = true;
            cvar.notify_one();
        });

        let (lock, cvar) = &*done;
        let mut finished = lock.lock();
        while !*finished {
            cvar.wait(&mut finished);
        }
    }
}
