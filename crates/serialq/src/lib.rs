//! `serialq` — a Rust-native serial dispatch queue.
//!
//! A [`Queue`] serializes submitted work on top of a shared worker pool: work
//! items never overlap with each other or with a synchronous caller, without
//! dedicating an OS thread to whatever resource the queue protects. This
//! crate is a thin front door over [`serialq_core`]; see that crate's docs
//! for the full design (the scheduling state machine, the two-lock
//! discipline, the continuation bridge).
//!
//! # Example
//!
//! ```
//! use serialq::{Features, Queue};
//!
//! let queue = Queue::new(Features::default());
//! queue.submit_async(|| println!("runs on the queue")).unwrap();
//! let total: u32 = queue.submit_sync(|| 1 + 1).unwrap();
//! assert_eq!(total, 2);
//! ```

#![warn(missing_docs)]

pub use serialq_core::{
    BoxedWork, CancelToken, Features, ManualPool, PanicPayload, Queue, QueueError, RayonPool,
    Result, WorkPool, default_pool,
};

/// Commonly used types, for glob-importing at call sites that use a queue
/// heavily.
///
/// ```ignore
/// use serialq::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{CancelToken, Features, Queue, QueueError, Result};
}

/// Installs a default `tracing_subscriber` formatter on the global
/// subscriber, for binaries that embed a queue and want its spans and events
/// on stderr without wiring up their own subscriber.
///
/// Libraries should not call this; it is a convenience for `main` functions
/// and examples, matching the pattern used throughout this workspace's own
/// example binaries.
///
/// ```no_run
/// serialq::install_default_logging();
/// ```
pub fn install_default_logging() {
    tracing_subscriber::fmt::init();
    tracing::debug!("serialq: default tracing subscriber installed");
}

static_assertions::assert_impl_all!(Queue: Send, Sync, Clone);
static_assertions::assert_impl_all!(CancelToken: Send, Sync, Clone);
