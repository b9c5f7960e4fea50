//! The shared worker pool that actually runs queue drains and timers.
//!
//! A queue never owns threads itself; it borrows them from a [`WorkPool`].
//! This mirrors the split between the dispatch engine and the thread pool
//! in the original design: the pool knows nothing about queues, state
//! machines, or reentrancy, it only runs closures and fires delayed ones.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::next_id;

/// A unit of work handed to a pool. Pools never inspect it; they only run it
/// once, on some worker thread.
pub type BoxedWork = Box<dyn FnOnce() + Send + 'static>;

/// The interface a queue needs from its backing pool: run work now, or run
/// it once after a delay.
///
/// Implementations must be safe to share across threads and must actually
/// execute submitted work concurrently with respect to other queues sharing
/// the same pool; the serialization a [`crate::engine::Queue`] provides comes
/// entirely from its own locks, not from anything the pool does.
pub trait WorkPool: Send + Sync + 'static {
    /// Runs `work` on some worker thread, as soon as one is free.
    fn submit(&self, work: BoxedWork);

    /// Runs `work` once, no sooner than `delay` from now. Returns a token
    /// that cancels the firing if disposed before it happens; disposing
    /// after it has already fired is a no-op.
    fn schedule_after(&self, delay: Duration, work: BoxedWork) -> CancelToken;
}

struct TimerState<K> {
    heap: BinaryHeap<Reverse<(K, u64)>>,
    pending: HashMap<u64, BoxedWork>,
}

impl<K: Ord> TimerState<K> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }
}

/// The default pool: a [`rayon`] thread pool for work, plus one dedicated
/// background thread driving a min-heap of pending timers.
pub struct RayonPool {
    pool: Arc<rayon::ThreadPool>,
    timer: Arc<Timer>,
}

struct Timer {
    state: Mutex<TimerState<std::time::Instant>>,
    condvar: Condvar,
}

impl RayonPool {
    /// Builds a fresh pool with its own worker threads and timer thread.
    ///
    /// Most applications should use [`default_pool`] instead so that all
    /// queues share one pool, the same way a process shares one GCD root
    /// queue set.
    pub fn new() -> Self {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .thread_name(|i| format!("serialq-worker-{i}"))
                .build()
                .expect("failed to build the serialq worker pool"),
        );
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState::new()),
            condvar: Condvar::new(),
        });
        spawn_timer_thread(timer.clone(), pool.clone());
        Self { pool, timer }
    }
}

impl Default for RayonPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkPool for RayonPool {
    #[tracing::instrument(skip_all, target = "serialq_core::submit", level = "trace")]
    fn submit(&self, work: BoxedWork) {
        self.pool.spawn(work);
    }

    #[tracing::instrument(skip_all, target = "serialq_core::timer", level = "trace", fields(delay_ms = delay.as_millis() as u64))]
    fn schedule_after(&self, delay: Duration, work: BoxedWork) -> CancelToken {
        let id = next_id();
        let at = std::time::Instant::now() + delay;
        {
            let mut state = self.timer.state.lock();
            state.pending.insert(id, work);
            state.heap.push(Reverse((at, id)));
        }
        self.timer.condvar.notify_one();

        let timer = self.timer.clone();
        CancelToken::new(move || {
            timer.state.lock().pending.remove(&id);
        })
    }
}

fn spawn_timer_thread(timer: Arc<Timer>, pool: Arc<rayon::ThreadPool>) {
    std::thread::Builder::new()
        .name("serialq-timer".into())
        .spawn(move || loop {
            let mut state = timer.state.lock();
            match state.heap.peek() {
                None => {
                    timer.condvar.wait(&mut state);
                }
                Some(&Reverse((at, _))) => {
                    let now = std::time::Instant::now();
                    if at <= now {
                        let Reverse((_, id)) = state.heap.pop().expect("peeked entry must pop");
                        let fired = state.pending.remove(&id);
                        drop(state);
                        if let Some(work) = fired {
                            pool.spawn(work);
                        }
                    } else {
                        timer.condvar.wait_for(&mut state, at - now);
                    }
                }
            }
        })
        .expect("failed to spawn the serialq timer thread");
}

static GLOBAL_POOL: OnceLock<Arc<dyn WorkPool>> = OnceLock::new();

/// Returns the process-wide default pool, creating it on first use.
///
/// Queues constructed without an explicit pool all share this one, the same
/// way GCD's global concurrent queues are shared across an entire process.
pub fn default_pool() -> Arc<dyn WorkPool> {
    GLOBAL_POOL
        .get_or_init(|| Arc::new(RayonPool::new()) as Arc<dyn WorkPool>)
        .clone()
}

/// A pool for deterministic tests: `submit` still runs work on real worker
/// threads (so locking and rendezvous behavior is exercised genuinely), but
/// `schedule_after` fires against a virtual clock that only moves when
/// [`ManualPool::advance`] is called, never against wall-clock time.
pub struct ManualPool {
    pool: Arc<rayon::ThreadPool>,
    state: Arc<Mutex<TimerState<Duration>>>,
    now: Arc<Mutex<Duration>>,
}

impl ManualPool {
    pub fn new() -> Self {
        let pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(2)
                .thread_name(|i| format!("serialq-test-worker-{i}"))
                .build()
                .expect("failed to build the serialq test worker pool"),
        );
        Self {
            pool,
            state: Arc::new(Mutex::new(TimerState::new())),
            now: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves the virtual clock forward by `by`, firing (on real worker
    /// threads) every timer whose deadline is now at or before the new time.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut now = self.now.lock();
            *now += by;
            let mut state = self.state.lock();
            let mut due = Vec::new();
            while let Some(&Reverse((at, _))) = state.heap.peek() {
                if at > *now {
                    break;
                }
                let Reverse((_, id)) = state.heap.pop().expect("peeked entry must pop");
                if let Some(work) = state.pending.remove(&id) {
                    due.push(work);
                }
            }
            due
        };
        for work in due {
            self.pool.spawn(work);
        }
    }
}

impl Default for ManualPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkPool for ManualPool {
    fn submit(&self, work: BoxedWork) {
        self.pool.spawn(work);
    }

    fn schedule_after(&self, delay: Duration, work: BoxedWork) -> CancelToken {
        let id = next_id();
        {
            let now = *self.now.lock();
            let mut state = self.state.lock();
            state.pending.insert(id, work);
            state.heap.push(Reverse((now + delay, id)));
        }
        let state = self.state.clone();
        CancelToken::new(move || {
            state.lock().pending.remove(&id);
        })
    }
}
