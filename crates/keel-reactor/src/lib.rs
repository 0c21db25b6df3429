//! Single-threaded reactor abstraction shared by every worker process.
//!
//! Two interchangeable drivers implement [`Reactor`]:
//!
//! - [`PollReactor`] — the default, backed by `mio::Poll` (epoll on Linux,
//!   kqueue on the BSDs).
//! - [`SelectReactor`] — a portable `select(2)` fallback with the same
//!   observable semantics.
//!
//! Both share one timer heap, so deadline ordering and cancellation rules
//! are identical regardless of driver.

mod poll;
mod select;
mod signal;
mod suspension;
mod timer;

use std::{io, os::fd::RawFd, rc::Rc, time::Duration};

pub use poll::PollReactor;
pub use select::SelectReactor;
pub use suspension::{sleep, Resumer, Suspension};
use thiserror::Error;
pub use timer::TimerId;

/// Invoked with the ready file descriptor.
pub type IoCallback = Rc<dyn Fn(RawFd)>;
/// Invoked when a timer fires.
pub type TimerCallback = Rc<dyn Fn()>;
/// Invoked on the loop thread with the signal number. Delivery is
/// coalesced: one invocation may cover several arrivals.
pub type SignalCallback = Rc<dyn Fn(i32)>;
/// Receives the panic message of a faulting callback.
pub type ErrorHandler = Rc<dyn Fn(&str)>;

#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("signal {0} cannot be handled from user space")]
    ForbiddenSignal(i32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The event loop contract.
///
/// All methods are callable from inside any callback running on the loop,
/// including cancellation of the very handle whose callback is executing.
/// Callbacks run to completion; a panicking callback is routed to the
/// installed error handler (or logged, when none is installed) and never
/// unwinds through the dispatch loop.
pub trait Reactor {
    /// Schedule `cb` once after `after`. The returned id is non-zero.
    fn delay(&self, after: Duration, cb: TimerCallback) -> TimerId;

    /// Schedule `cb` every `interval`, first firing at `now + interval`.
    /// An overrunning callback delays the next firing but never skips it.
    fn repeat(&self, interval: Duration, cb: TimerCallback) -> TimerId;

    /// Cancel a one-shot timer. Idempotent.
    fn off_delay(&self, id: TimerId) -> bool;

    /// Cancel a repeating timer. Idempotent.
    fn off_repeat(&self, id: TimerId) -> bool;

    /// Register `cb` for readability of `fd`, replacing any previous
    /// readability handler for that fd. Fires when at least one byte is
    /// readable or the stream reached EOF.
    fn on_readable(&self, fd: RawFd, cb: IoCallback);

    /// Register `cb` for writability of `fd`, replacing any previous
    /// writability handler for that fd.
    fn on_writable(&self, fd: RawFd, cb: IoCallback);

    fn off_readable(&self, fd: RawFd) -> bool;

    fn off_writable(&self, fd: RawFd) -> bool;

    /// Deliver `signo` to the loop thread. Coalesced.
    fn on_signal(&self, signo: i32, cb: SignalCallback) -> Result<(), ReactorError>;

    fn off_signal(&self, signo: i32) -> bool;

    /// Block until [`Reactor::stop`] is called or no timers, fds, or
    /// signal handlers remain registered.
    fn run(&self);

    /// Unblock `run`. Safe from any thread and from signal context via the
    /// driver's waker. Subsequent calls are no-ops.
    fn stop(&self);

    /// Process at most one batch of ready events, waiting at most
    /// `timeout` (`None` = until the next timer deadline, or forever).
    /// This is the re-entry point used by [`Suspension`].
    fn turn(&self, timeout: Option<Duration>);

    fn delete_all_timer(&self);

    fn timer_count(&self) -> usize;

    /// Install the handler that receives panics escaping any callback.
    fn set_error_handler(&self, handler: ErrorHandler);

    /// Driver name as shown in the status dump.
    fn name(&self) -> &'static str;

    /// Whether [`sleep`] can suspend on this driver instead of blocking.
    fn has_suspension(&self) -> bool {
        false
    }
}

/// Shared handle to the worker's reactor.
pub type ReactorHandle = Rc<dyn Reactor>;

/// Extract a printable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
