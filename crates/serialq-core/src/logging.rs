//! `tracing` targets and a small perf-span helper used throughout the crate.
//!
//! Nothing here is load-bearing for correctness; it exists so that a queue
//! embedded in a larger service shows up sensibly in whatever subscriber the
//! host process installs. Consumers who don't install a subscriber pay
//! essentially nothing — `tracing` events with no active subscriber are a
//! couple of branches.

/// `tracing` target strings used by the engine, grouped by subsystem.
///
/// Keeping these as named constants (rather than inline string literals at
/// each call site) means a subscriber's filter directives
/// (`serialq_core::drain=debug`) stay stable even if a call site moves.
pub mod targets {
    /// Drain loop: state transitions, item execution, panic capture.
    pub const DRAIN: &str = "serialq_core::drain";
    /// Submission: `submit_async`, `submit_sync`, `submit_after`.
    pub const SUBMIT: &str = "serialq_core::submit";
    /// Delayed-submission timer firing and cancellation.
    pub const TIMER: &str = "serialq_core::timer";
    /// The cooperative-continuation bridge.
    pub const CONTINUATION: &str = "serialq_core::continuation";
}

/// `tracing` span/event names, paired with [`targets`] at call sites.
pub mod span_names {
    /// The scheduler's own span: scheduling a drain pass onto the pool and
    /// running it. Shared by `maybe_spawn_drain` and the drain loop itself.
    pub const SCHEDULER: &str = super::targets::DRAIN;
}

/// A guard that emits a `tracing` span for as long as it is held.
///
/// Used to time individual drain passes; the span closes (and `tracing`
/// records its duration, if a subscriber cares) when the guard drops.
#[derive(Debug)]
pub struct PerfSpan {
    #[allow(dead_code)]
    span: tracing::span::EnteredSpan,
}

impl PerfSpan {
    /// Creates a new performance span, active until the guard is dropped.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!(target: "serialq_core::perf", "perf", operation = name);
        Self {
            span: span.entered(),
        }
    }
}
