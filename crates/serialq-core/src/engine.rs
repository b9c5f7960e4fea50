//! The dispatch engine: the serial queue's scheduling state machine.
//!
//! This is the hard part of the crate. Everything else (the pool, the
//! cancel token, the per-thread queue stack) exists to serve the three
//! operations here: [`Queue::submit_async`], [`Queue::submit_sync`], and
//! [`Queue::submit_after`], plus the internal drain loop that actually runs
//! submitted work.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, ReentrantMutex};
use slotmap::{SlotMap, new_key_type};

use crate::cancel::CancelToken;
use crate::error::{PanicPayload, QueueError, Result};
use crate::logging::span_names;
use crate::next_id;
use crate::pool::{BoxedWork, WorkPool, default_pool};
use crate::queue_stack;

new_key_type! {
    struct ItemKey;
}

bitflags! {
    /// Feature flags a [`Queue`] can be constructed with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u8 {
        /// Route cooperative (`async`) suspensions submitted via
        /// [`Queue::spawn`] back through this queue on resume, so that
        /// `current_queue()` stays stable across `.await` points. See
        /// [`crate::continuation`].
        const COOPERATIVE_CONTINUATIONS = 0b0000_0001;
    }
}

impl Default for Features {
    fn default() -> Self {
        Features::COOPERATIVE_CONTINUATIONS
    }
}

/// The scheduler's three-state machine (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    /// No drain is owed to the pool and the async queue is empty.
    Idle,
    /// A drain has been handed to the pool but has not started popping yet.
    Scheduled,
    /// A drain is actively dequeuing and running work items.
    Processing,
}

/// Scheduling state guarded by `scheduler_lock`. No user code ever runs
/// while this lock is held.
struct SchedulerGuts {
    state: RunState,
    items: SlotMap<ItemKey, BoxedWork>,
    order: VecDeque<ItemKey>,
    timers: HashMap<u64, CancelToken>,
    disposed: bool,
}

impl SchedulerGuts {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
            items: SlotMap::with_key(),
            order: VecDeque::new(),
            timers: HashMap::new(),
            disposed: false,
        }
    }

    /// Pops the next live item off the head of the queue, skipping keys
    /// whose item was already removed by a cancel token.
    fn pop_front(&mut self) -> Option<BoxedWork> {
        while let Some(key) = self.order.pop_front() {
            if let Some(work) = self.items.remove(key) {
                return Some(work);
            }
        }
        None
    }
}

/// The gate used by [`Queue::submit_sync`]'s rendezvous path: a bounded
/// producer/consumer handshake via two one-shot signals (`spec.md` §4.3,
/// design note in §9).
struct Gate {
    async_ready: (Mutex<bool>, Condvar),
    sync_done: (Mutex<bool>, Condvar),
}

impl Gate {
    fn new() -> Self {
        Self {
            async_ready: (Mutex::new(false), Condvar::new()),
            sync_done: (Mutex::new(false), Condvar::new()),
        }
    }

    fn signal_async_ready(&self) {
        let (lock, cvar) = &self.async_ready;
        *lock.lock() = true;
        cvar.notify_one();
    }

    fn wait_async_ready(&self) {
        let (lock, cvar) = &self.async_ready;
        let mut ready = lock.lock();
        while !*ready {
            cvar.wait(&mut ready);
        }
    }

    fn signal_sync_done(&self) {
        let (lock, cvar) = &self.sync_done;
        *lock.lock() = true;
        cvar.notify_one();
    }

    fn wait_sync_done(&self) {
        let (lock, cvar) = &self.sync_done;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }
}

/// Drop guard that signals `sync_done` on every exit path of the
/// rendezvous path in [`Queue::submit_sync`], including unwinding from a
/// panic thrown by the caller's work item.
struct SignalSyncDoneOnDrop<'a> {
    gate: &'a Gate,
}

impl Drop for SignalSyncDoneOnDrop<'_> {
    fn drop(&mut self) {
        self.gate.signal_sync_done();
    }
}

/// The internal engine state behind a [`Queue`] handle. `Arc<EngineInner>`
/// is the unit of identity pushed onto the per-thread [`queue_stack`]; two
/// `Queue` handles constructed independently are distinct queues even if
/// they happen to share a pool.
pub(crate) struct EngineInner {
    pub(crate) id: u64,
    pub(crate) name: Arc<str>,
    pool: Arc<dyn WorkPool>,
    features: Features,
    scheduler: Mutex<SchedulerGuts>,
    execution_lock: ReentrantMutex<()>,
    unhandled_error_sink: Mutex<Option<Box<dyn Fn(PanicPayload) + Send + Sync>>>,
}

impl EngineInner {
    /// Inserts `work` at the tail of the async queue and, if the engine was
    /// idle, transitions it to `Scheduled`. Returns the new item's cancel
    /// token and whether the caller must hand a drain to the pool.
    fn enqueue_locked(self: &Arc<Self>, sched: &mut SchedulerGuts, work: BoxedWork) -> (CancelToken, bool) {
        let key = sched.items.insert(work);
        sched.order.push_back(key);
        let should_schedule = sched.state == RunState::Idle;
        if should_schedule {
            sched.state = RunState::Scheduled;
        }
        let this = self.clone();
        let token = CancelToken::new(move || {
            this.scheduler.lock().items.remove(key);
        });
        (token, should_schedule)
    }

    fn maybe_spawn_drain(self: &Arc<Self>, should_schedule: bool) {
        if should_schedule {
            let this = self.clone();
            tracing::trace!(target: span_names::SCHEDULER, id = this.id, "handing drain to pool");
            self.pool.submit(Box::new(move || drain(this)));
        }
    }

    fn deliver_unhandled_error(&self, payload: PanicPayload) {
        let sink = self.unhandled_error_sink.lock();
        if let Some(sink) = sink.as_ref() {
            sink(payload);
        } else {
            tracing::warn!(
                target: span_names::SCHEDULER,
                id = self.id,
                name = %self.name,
                "unhandled error escaped an async work item with no sink installed"
            );
        }
    }

    pub(crate) fn submit_async_boxed(self: &Arc<Self>, work: BoxedWork) -> Result<CancelToken> {
        let mut sched = self.scheduler.lock();
        if sched.disposed {
            return Err(QueueError::Disposed);
        }
        let (token, should_schedule) = self.enqueue_locked(&mut sched, work);
        drop(sched);
        self.maybe_spawn_drain(should_schedule);
        Ok(token)
    }

    pub(crate) fn features(&self) -> Features {
        self.features
    }
}

/// Two-stage inner target for a delayed submission's cancel token
/// (`spec.md` §3, §4.4): while the timer is pending, disposal cancels the
/// timer; once it has fired and the work has been enqueued, disposal
/// cancels that async submission instead.
enum Stage {
    Pending,
    Fired(CancelToken),
    Done,
}

/// A serial dispatch queue: submitted work items run one at a time, in
/// submission order, never overlapping with each other, on top of a
/// shared worker [`pool`](crate::pool).
///
/// Cloning a `Queue` is cheap and shares the same underlying engine; all
/// clones serialize against each other exactly as a single handle would.
#[derive(Clone)]
pub struct Queue {
    pub(crate) inner: Arc<EngineInner>,
}

impl Queue {
    /// Creates a queue backed by the process-wide default pool.
    pub fn new(features: Features) -> Self {
        Self::with_pool(default_pool(), features)
    }

    /// Creates a queue backed by the process-wide default pool, with a
    /// name used in tracing spans and unhandled-error logs.
    pub fn named(name: impl Into<String>, features: Features) -> Self {
        Self::with_pool_named(default_pool(), name, features)
    }

    /// Creates a queue backed by an explicit pool (useful for tests, or
    /// for isolating a subsystem onto its own worker pool).
    pub fn with_pool(pool: Arc<dyn WorkPool>, features: Features) -> Self {
        let id = next_id();
        Self::with_pool_named(pool, format!("serialq-{id}"), features)
    }

    /// Creates a queue backed by an explicit pool, with an explicit name.
    pub fn with_pool_named(pool: Arc<dyn WorkPool>, name: impl Into<String>, features: Features) -> Self {
        let id = next_id();
        Self {
            inner: Arc::new(EngineInner {
                id,
                name: Arc::from(name.into()),
                pool,
                features,
                scheduler: Mutex::new(SchedulerGuts::new()),
                execution_lock: ReentrantMutex::new(()),
                unhandled_error_sink: Mutex::new(None),
            }),
        }
    }

    /// This queue's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Appends `work` to the tail of the queue. Does not block and does
    /// not run `work` inline; fails with [`QueueError::Disposed`] if the
    /// queue has already been disposed.
    ///
    /// Returns a [`CancelToken`] that best-effort removes `work` from the
    /// pending queue; it is a no-op if `work` has already been dequeued or
    /// has already run.
    #[tracing::instrument(skip_all, target = "serialq_core::submit", level = "trace", fields(id = self.inner.id))]
    pub fn submit_async<F>(&self, work: F) -> Result<CancelToken>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.submit_async_boxed(Box::new(work))
    }

    /// Runs `work` on the caller's thread, blocking until it completes,
    /// while still serializing with every other work item on this queue.
    ///
    /// Safe to call reentrantly from within a work item already running on
    /// this queue (it runs `work` inline rather than deadlocking). Panics
    /// raised by `work` propagate verbatim to the caller.
    #[tracing::instrument(skip_all, target = "serialq_core::submit", level = "trace", fields(id = self.inner.id))]
    pub fn submit_sync<F, R>(&self, work: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        let nested = queue_stack::contains(&self.inner);
        let _stack_guard = queue_stack::push(self.inner.clone());

        let mut sched = self.inner.scheduler.lock();
        if sched.disposed {
            return Err(QueueError::Disposed);
        }

        if nested {
            // We are already running inside a work item of this queue (on
            // this very thread, or via a gate parked on our behalf), so
            // whoever holds `execution_lock` right now is us, directly or
            // transitively. Run inline without touching the lock: if the
            // outer call is on the fast path, this thread already holds it
            // via `ReentrantMutex`, but if the outer call took the
            // rendezvous path, `execution_lock` is held by the *drain*
            // thread parked in the gate, not by us, and `lock()` here would
            // block forever waiting for a release that can't happen until
            // we return.
            drop(sched);
            return Ok(work());
        }

        if sched.state == RunState::Idle {
            drop(sched);
            let _exec = self.inner.execution_lock.lock();
            return Ok(work());
        }

        // Rendezvous path: park the drain inside a gate item so the
        // caller's thread can run `work` while the drain holds
        // `execution_lock` on our behalf.
        let gate = Arc::new(Gate::new());
        let gate_for_item = gate.clone();
        let (_token, should_schedule) = self.inner.enqueue_locked(
            &mut sched,
            Box::new(move || {
                gate_for_item.signal_async_ready();
                gate_for_item.wait_sync_done();
            }),
        );
        drop(sched);
        self.inner.maybe_spawn_drain(should_schedule);

        gate.wait_async_ready();
        let _signal_on_drop = SignalSyncDoneOnDrop { gate: &gate };
        Ok(work())
    }

    /// Schedules `work` to run after at least `delay` has elapsed,
    /// returning a token that cancels the timer (before it fires) or the
    /// resulting async submission (after it fires); disposing it at any
    /// point, any number of times, is safe.
    #[tracing::instrument(
        skip_all,
        target = "serialq_core::timer",
        level = "trace",
        fields(id = self.inner.id, delay_ms = delay.as_millis() as u64)
    )]
    pub fn submit_after<F>(&self, delay: Duration, work: F) -> Result<CancelToken>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut sched = self.inner.scheduler.lock();
        if sched.disposed {
            return Err(QueueError::Disposed);
        }

        let timer_id = next_id();
        let cancelled = Arc::new(AtomicBool::new(false));
        let stage = Arc::new(Mutex::new(Stage::Pending));

        let inner = self.inner.clone();
        let cancelled_for_fire = cancelled.clone();
        let stage_for_fire = stage.clone();
        let mut work_slot = Some(work);

        let timer_token = self.inner.pool.schedule_after(
            delay,
            Box::new(move || {
                if cancelled_for_fire.load(Ordering::Acquire) {
                    return;
                }
                let mut sched = inner.scheduler.lock();
                sched.timers.remove(&timer_id);
                if sched.disposed {
                    return;
                }
                let work = work_slot.take().expect("a fired timer never fires twice");
                let (async_token, should_schedule) = inner.enqueue_locked(&mut sched, Box::new(work));
                drop(sched);
                // Schedule the drain unconditionally: the item is already
                // enqueued and `state` already transitioned, so a drain is
                // owed to the pool regardless of whether we end up
                // cancelling the item below.
                inner.maybe_spawn_drain(should_schedule);

                let mut stage_guard = stage_for_fire.lock();
                if matches!(*stage_guard, Stage::Done) {
                    // `dispose()` raced in between our enqueue and this
                    // store and already marked the token Done (it found
                    // `Pending` and had nothing of ours left to cancel).
                    // Don't leave the item behind: cancel what we just
                    // enqueued ourselves instead of publishing it.
                    drop(stage_guard);
                    async_token.dispose();
                    return;
                }
                *stage_guard = Stage::Fired(async_token);
            }),
        );

        sched.timers.insert(timer_id, timer_token.clone());
        drop(sched);

        let inner_for_cancel = self.inner.clone();
        Ok(CancelToken::new(move || {
            cancelled.store(true, Ordering::Release);
            let was_pending = {
                let mut sched = inner_for_cancel.scheduler.lock();
                sched.timers.remove(&timer_id).is_some()
            };
            if was_pending {
                timer_token.dispose();
            }
            let previous = std::mem::replace(&mut *stage.lock(), Stage::Done);
            if let Stage::Fired(async_token) = previous {
                async_token.dispose();
            }
        }))
    }

    /// Returns `Err(QueueError::WrongQueue)` unless this thread is
    /// currently executing a work item belonging to this queue (directly
    /// or nested inside one that is).
    pub fn verify_on_queue(&self) -> Result<()> {
        if queue_stack::contains(&self.inner) {
            Ok(())
        } else {
            Err(QueueError::WrongQueue)
        }
    }

    /// The innermost queue the current thread is executing a work item
    /// for, if any.
    pub fn current_queue() -> Option<Queue> {
        queue_stack::current().map(|inner| Queue { inner })
    }

    /// Registers a handler invoked with the panic payload of every
    /// exception that escapes an async (`submit_async`/`submit_after`)
    /// work item. Replaces any previously registered handler. Panics from
    /// `submit_sync` are never routed here; they propagate to the caller.
    pub fn on_unhandled_error<F>(&self, sink: F)
    where
        F: Fn(PanicPayload) + Send + Sync + 'static,
    {
        *self.inner.unhandled_error_sink.lock() = Some(Box::new(sink));
    }

    /// Disposes the queue: clears pending work and timers, and makes every
    /// subsequent submission fail with [`QueueError::Disposed`]. Idempotent
    /// and safe to call any number of times, from any thread.
    #[tracing::instrument(skip_all, target = "serialq_core::submit", level = "debug", fields(id = self.inner.id, name = %self.inner.name))]
    pub fn dispose(&self) {
        let mut sched = self.inner.scheduler.lock();
        if sched.disposed {
            return;
        }
        sched.disposed = true;
        sched.items.clear();
        sched.order.clear();
        let timers: Vec<CancelToken> = sched.timers.drain().map(|(_, token)| token).collect();
        drop(sched);
        for timer in timers {
            timer.dispose();
        }
    }

    /// Whether [`Queue::dispose`] has been called on this queue.
    pub fn is_disposed(&self) -> bool {
        self.inner.scheduler.lock().disposed
    }

    /// The feature flags this queue was constructed with.
    pub fn features(&self) -> Features {
        self.inner.features
    }

    /// Runs `future` on this queue (the continuation bridge described in
    /// `crate::continuation`): the first poll happens inside a `submit_async`
    /// work item, and later polls are re-dispatched through
    /// `submit_async` as long as [`Features::COOPERATIVE_CONTINUATIONS`]
    /// is set on this queue, keeping `current_queue() == self` stable
    /// across `.await` points. Disposing the returned token drops the
    /// future without polling it further.
    pub fn spawn<F>(&self, future: F) -> CancelToken
    where
        F: Future<Output = ()> + Send + 'static,
    {
        crate::continuation::spawn(self.inner.clone(), future)
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// The drain loop (`spec.md` §4.5): runs on a pool worker thread, pops
/// work items off the head of the queue one at a time under
/// `execution_lock`, and returns the engine to `Idle` once the queue is
/// exhausted.
pub(crate) fn drain(inner: Arc<EngineInner>) {
    let _perf = crate::logging::PerfSpan::new("drain_pass");
    let _stack_guard = queue_stack::push(inner.clone());
    #[cfg(feature = "tokio")]
    let _continuation_guard = crate::continuation::install_if_enabled(&inner);

    {
        let mut sched = inner.scheduler.lock();
        sched.state = RunState::Processing;
        if sched.disposed {
            sched.state = RunState::Idle;
            return;
        }
    }

    loop {
        let item = {
            let mut sched = inner.scheduler.lock();
            match sched.pop_front() {
                Some(item) => item,
                None => {
                    sched.state = RunState::Idle;
                    break;
                }
            }
        };

        let _exec = inner.execution_lock.lock();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(item));
        drop(_exec);
        if let Err(payload) = result {
            inner.deliver_unhandled_error(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::pool::ManualPool;

    fn queue_with_manual_pool() -> (Queue, Arc<ManualPool>) {
        let pool = Arc::new(ManualPool::new());
        let queue = Queue::with_pool(pool.clone(), Features::default());
        (queue, pool)
    }

    #[test]
    fn async_items_run_in_order_without_overlap() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));
        let barrier_done = Arc::new((Mutex::new(false), Condvar::new()));

        for i in 1..=5 {
            let hit = hit.clone();
            queue.submit_async(move || hit.lock().unwrap().push(i)).unwrap();
        }
        let bd = barrier_done.clone();
        let hit_last = hit.clone();
        queue
            .submit_async(move || {
                hit_last.lock().unwrap().push(6);
                let (lock, cvar) = &*bd;
                *lock.lock() = true;
                cvar.notify_one();
            })
            .unwrap();

        let (lock, cvar) = &*barrier_done;
        let mut done = lock.lock();
        while !*done {
            cvar.wait(&mut done);
        }
        assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn submit_sync_runs_immediately_on_idle_queue() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));
        let h = hit.clone();
        queue.submit_sync(move || h.lock().unwrap().push(1)).unwrap();
        assert_eq!(*hit.lock().unwrap(), vec![1]);
    }

    #[test]
    fn nested_submit_sync_does_not_deadlock() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));

        let q = queue.clone();
        let h1 = hit.clone();
        queue
            .submit_sync(move || {
                h1.lock().unwrap().push(1);
                let h2 = h1.clone();
                q.submit_sync(move || h2.lock().unwrap().push(2)).unwrap();
                h1.lock().unwrap().push(3);
            })
            .unwrap();

        assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn nested_submit_sync_does_not_deadlock_when_outer_took_rendezvous_path() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));

        // Keep the drain busy on a pool worker so the outer `submit_sync`
        // below is forced onto the rendezvous path (queue is `Processing`,
        // not idle) rather than the fast path.
        let busy_gate = Arc::new((Mutex::new(false), Condvar::new()));
        let bg = busy_gate.clone();
        queue
            .submit_async(move || {
                let (lock, cvar) = &*bg;
                let mut go = lock.lock();
                while !*go {
                    cvar.wait(&mut go);
                }
            })
            .unwrap();

        // Release the busy item only after the outer `submit_sync` below has
        // had time to enqueue its gate and start waiting on it, so the
        // drain ends up parked inside that gate (holding `execution_lock`)
        // while this thread runs both `submit_sync` calls.
        let bg2 = busy_gate.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            let (lock, cvar) = &*bg2;
            *lock.lock() = true;
            cvar.notify_one();
        });

        let q = queue.clone();
        let h1 = hit.clone();
        queue
            .submit_sync(move || {
                h1.lock().unwrap().push(1);
                let h2 = h1.clone();
                // This nested call must run inline on *this* thread without
                // touching `execution_lock`: the drain thread (not this
                // one) holds it, parked in the outer call's gate.
                q.submit_sync(move || h2.lock().unwrap().push(2)).unwrap();
                h1.lock().unwrap().push(3);
            })
            .unwrap();

        assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn submit_sync_inside_async_runs_inline_on_drain_worker() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));
        let done = Arc::new((Mutex::new(false), Condvar::new()));

        let q = queue.clone();
        let h = hit.clone();
        let d = done.clone();
        queue
            .submit_async(move || {
                h.lock().unwrap().push(1);
                let h2 = h.clone();
                q.submit_sync(move || h2.lock().unwrap().push(2)).unwrap();
                h.lock().unwrap().push(3);
                let (lock, cvar) = &*d;
                *lock.lock() = true;
                cvar.notify_one();
            })
            .unwrap();

        let (lock, cvar) = &*done;
        let mut finished = lock.lock();
        while !*finished {
            cvar.wait(&mut finished);
        }
        assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn submit_sync_waits_for_in_flight_async_work() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(StdMutex::new(Vec::new()));

        let h = hit.clone();
        queue
            .submit_async(move || {
                h.lock().unwrap().push(1);
                std::thread::sleep(Duration::from_millis(100));
                h.lock().unwrap().push(2);
            })
            .unwrap();

        let h = hit.clone();
        queue.submit_sync(move || h.lock().unwrap().push(3)).unwrap();

        assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn submit_after_fires_only_once_advanced_past_delay() {
        let (queue, pool) = queue_with_manual_pool();
        let hit = Arc::new(AtomicUsize::new(0));

        let h = hit.clone();
        queue
            .submit_after(Duration::from_millis(100), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        pool.advance(Duration::from_millis(99));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hit.load(Ordering::SeqCst), 0);

        pool.advance(Duration::from_millis(2));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_a_delayed_submission_before_fire_prevents_it() {
        let (queue, pool) = queue_with_manual_pool();
        let hit = Arc::new(AtomicUsize::new(0));

        let h = hit.clone();
        let token = queue
            .submit_after(Duration::from_millis(100), move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        pool.advance(Duration::from_millis(99));
        token.dispose();
        pool.advance(Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(hit.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_an_async_submission_before_drain_prevents_it() {
        let (queue, _pool) = queue_with_manual_pool();
        let hit = Arc::new(AtomicUsize::new(0));

        // Keep the queue busy so the cancelled item never gets a chance to
        // dequeue before we cancel it.
        let (gate_lock, gate_cvar) = (Mutex::new(false), Condvar::new());
        let gate_lock = Arc::new(gate_lock);
        let gate_cvar = Arc::new(gate_cvar);
        let gl = gate_lock.clone();
        let gc = gate_cvar.clone();
        queue
            .submit_async(move || {
                let mut go = gl.lock();
                while !*go {
                    gc.wait(&mut go);
                }
            })
            .unwrap();

        let h = hit.clone();
        let token = queue.submit_async(move || { h.fetch_add(1, Ordering::SeqCst); }).unwrap();
        token.dispose();

        *gate_lock.lock() = true;
        gate_cvar.notify_one();

        queue.submit_sync(|| {}).unwrap();
        assert_eq!(hit.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispose_is_idempotent_and_rejects_future_submissions() {
        let (queue, _pool) = queue_with_manual_pool();
        queue.dispose();
        queue.dispose();
        assert!(queue.is_disposed());
        assert_eq!(queue.submit_async(|| {}).unwrap_err(), QueueError::Disposed);
        assert_eq!(queue.submit_sync(|| {}).unwrap_err(), QueueError::Disposed);
        assert_eq!(
            queue.submit_after(Duration::from_millis(1), || {}).unwrap_err(),
            QueueError::Disposed
        );
    }

    #[test]
    fn unhandled_error_from_async_work_reaches_sink_and_drain_continues() {
        let (queue, _pool) = queue_with_manual_pool();
        let caught = Arc::new(AtomicUsize::new(0));
        let c = caught.clone();
        queue.on_unhandled_error(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        queue.submit_async(|| panic!("boom")).unwrap();

        let hit = Arc::new(AtomicUsize::new(0));
        let h = hit.clone();
        queue.submit_sync(move || h.fetch_add(1, Ordering::SeqCst)).unwrap();

        assert_eq!(caught.load(Ordering::SeqCst), 1);
        assert_eq!(hit.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn verify_on_queue_only_succeeds_from_inside() {
        let (queue, _pool) = queue_with_manual_pool();
        assert_eq!(queue.verify_on_queue().unwrap_err(), QueueError::WrongQueue);

        let q = queue.clone();
        queue.submit_sync(move || q.verify_on_queue().unwrap()).unwrap();
    }

    #[test]
    fn current_queue_reflects_the_innermost_queue() {
        let (queue, _pool) = queue_with_manual_pool();
        assert!(Queue::current_queue().is_none());

        let q = queue.clone();
        queue
            .submit_sync(move || {
                let current = Queue::current_queue().expect("inside a work item");
                assert_eq!(current.name(), q.name());
            })
            .unwrap();
    }

    #[test]
    fn two_queues_never_share_an_execution_lock() {
        let a = Queue::with_pool(Arc::new(ManualPool::new()), Features::default());
        let b = Queue::with_pool(Arc::new(ManualPool::new()), Features::default());
        let overlap = Arc::new(AtomicUsize::new(0));
        let max_overlap = Arc::new(AtomicUsize::new(0));

        let done = Arc::new((Mutex::new(0usize), Condvar::new()));

        for q in [a, b] {
            let overlap = overlap.clone();
            let max_overlap = max_overlap.clone();
            let done = done.clone();
            q.submit_async(move || {
                let now = overlap.fetch_add(1, Ordering::SeqCst) + 1;
                max_overlap.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(50));
                overlap.fetch_sub(1, Ordering::SeqCst);
                let (lock, cvar) = &*done;
                *lock.lock() += 1;
                cvar.notify_all();
            })
            .unwrap();
        }

        let (lock, cvar) = &*done;
        let mut count = lock.lock();
        while *count < 2 {
            cvar.wait(&mut count);
        }
        // Two distinct queues are allowed to overlap; this just exercises
        // that both actually ran to completion concurrently.
        assert!(max_overlap.load(Ordering::SeqCst) >= 1);
    }
}
