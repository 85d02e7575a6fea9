//! Scheduler port: the only integration point with the host event loop.
//!
//! The session never blocks and never spawns threads. Everything it needs
//! from the host (socket readiness, deferred callbacks, timers) goes through
//! [`SchedulerPort`], so the engine runs inside whatever loop the application
//! already has.
//!
//! # Architecture
//!
//! ```text
//! Host loop                             Session
//! ┌──────────────────────┐            ┌──────────────────────┐
//! │ SchedulerPort impl   │ on_readable│ LineDecoder          │
//! │  sockets ────────────┼───────────►│ in-flight queue      │
//! │                      │ on_writable│ OutputBuffer         │
//! │  timers  ────────────┼───────────►│ resumption flush     │
//! └──────────────────────┘  callbacks └──────────────────────┘
//! ```
//!
//! Two implementations ship with the crate:
//! - [`TokioScheduler`] - tokio `LocalSet` tasks for sockets and timers
//! - [`ManualScheduler`] - virtual clock and scripted sockets, driven turn by
//!   turn (custom loops, tests)

mod manual;
mod tokio_loop;

pub use manual::ManualScheduler;
pub use tokio_loop::TokioScheduler;

use std::io;
use std::time::Duration;

/// Identifier of a registered socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u64);

/// Identifier of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Remote address of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Callbacks the scheduler invokes for a registered socket.
pub struct SocketEvents {
    /// Bytes arrived.
    pub on_readable: Box<dyn FnMut(&[u8])>,
    /// The socket can accept writes (first fired once connected).
    pub on_writable: Box<dyn FnMut()>,
    /// The socket failed or the peer closed it. Fired at most once.
    pub on_error: Box<dyn FnMut(io::Error)>,
}

impl std::fmt::Debug for SocketEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEvents").finish_non_exhaustive()
    }
}

/// Host event loop abstraction.
///
/// # Contract
///
/// - No method blocks the calling thread.
/// - No method invokes a callback synchronously; callbacks always run from a
///   later turn of the host loop. The session relies on this to call the
///   port while holding its own state.
pub trait SchedulerPort {
    /// Open a connection to `endpoint` and deliver its events.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be set up at all (e.g. resource
    /// exhaustion). Connection failures after registration arrive through
    /// `on_error`.
    fn register_socket(&self, endpoint: &Endpoint, events: SocketEvents) -> io::Result<SocketId>;

    /// Write as much of `bytes` as the socket accepts right now.
    ///
    /// `Ok(0)` or an [`io::ErrorKind::WouldBlock`] error mean "nothing
    /// written, wait for `on_writable`".
    ///
    /// # Errors
    ///
    /// Returns any other I/O error from the socket.
    fn write(&self, socket: SocketId, bytes: &[u8]) -> io::Result<usize>;

    /// Close a socket and drop its callbacks. Unknown ids are ignored.
    fn cancel(&self, socket: SocketId);

    /// Run `callback` after `delay` (zero means "next loop turn").
    fn schedule_after(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId;

    /// Cancel a pending callback. Unknown or fired ids are ignored.
    fn cancel_timer(&self, timer: TimerId);
}
