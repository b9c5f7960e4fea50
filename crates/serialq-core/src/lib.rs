//! Core engine for `serialq`: a serial dispatch queue that serializes
//! submitted work items on top of a shared worker pool.
//!
//! A [`Queue`] guarantees that its own work items run one at a time, in
//! submission order, and never overlap with each other or with a
//! synchronous caller — without dedicating an OS thread to the resource
//! the queue protects. Many queues share a small pool of worker threads;
//! fairness and thread placement across queues are the pool's concern, not
//! the queue's (see [`pool`]).
//!
//! # Example
//!
//! ```
//! use serialq_core::{Features, Queue};
//!
//! let queue = Queue::new(Features::default());
//!
//! let count = std::sync::Arc::new(std::sync::Mutex::new(0));
//! for _ in 0..8 {
//!     let count = count.clone();
//!     queue.submit_async(move || *count.lock().unwrap() += 1).unwrap();
//! }
//!
//! // submit_sync waits for everything submitted before it to finish.
//! let total = queue.submit_sync(move || *count.lock().unwrap()).unwrap();
//! assert_eq!(total, 8);
//! ```
//!
//! # Reentrancy
//!
//! `submit_sync` may be called from within a work item already running on
//! the same queue without deadlocking: it detects that the caller is
//! nested (via the per-thread [`queue_stack`]) and simply runs the work
//! inline.
//!
//! ```
//! use serialq_core::{Features, Queue};
//!
//! let queue = Queue::new(Features::default());
//! let hit = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
//!
//! let q = queue.clone();
//! let h = hit.clone();
//! queue.submit_sync(move || {
//!     h.lock().unwrap().push(1);
//!     let h2 = h.clone();
//!     q.submit_sync(move || h2.lock().unwrap().push(2)).unwrap();
//!     h.lock().unwrap().push(3);
//! }).unwrap();
//!
//! assert_eq!(*hit.lock().unwrap(), vec![1, 2, 3]);
//! ```

#![warn(missing_docs)]

pub mod cancel;
mod continuation;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pool;
pub(crate) mod queue_stack;

pub use cancel::CancelToken;
pub use engine::{Features, Queue};
pub use error::{PanicPayload, QueueError, Result};
pub use pool::{BoxedWork, ManualPool, RayonPool, WorkPool, default_pool};

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonically increasing id generator, used for queue ids,
/// timer ids, and default queue names. Never wraps in practice.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
