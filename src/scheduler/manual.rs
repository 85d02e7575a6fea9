//! Deterministic [`SchedulerPort`] driven one turn at a time.
//!
//! Time is virtual: it only moves when the host calls [`ManualScheduler::advance`].
//! Sockets are scripted: the host decides when a connection is accepted,
//! which bytes arrive, and how many bytes each write may take.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use std::time::Duration;
//! use idlewire::scheduler::{ManualScheduler, SchedulerPort};
//!
//! let scheduler = Rc::new(ManualScheduler::new());
//! scheduler.schedule_after(Duration::from_millis(10), Box::new(|| println!("tick")));
//! assert_eq!(scheduler.run_until_idle(), 0);
//! scheduler.advance(Duration::from_millis(10));
//! assert_eq!(scheduler.pending_timers(), 0);
//! ```

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use super::{Endpoint, SchedulerPort, SocketEvents, SocketId, TimerId};

/// Upper bound on turns per [`ManualScheduler::run_until_idle`] call, so a
/// task that keeps re-arming zero-delay work cannot hang the host.
const MAX_TURNS: usize = 10_000;

/// Timer queue key: deadline, then scheduling order.
type TimerKey = (Duration, u64);

struct MockSocket {
    endpoint: Endpoint,
    events: Rc<RefCell<SocketEvents>>,
    accepted: bool,
    written: Vec<u8>,
    /// Bytes the next writes may take; `None` means unlimited.
    write_budget: Option<usize>,
}

#[derive(Default)]
struct ManualInner {
    now: Duration,
    next_id: u64,
    timers: BTreeMap<TimerKey, (TimerId, Box<dyn FnOnce()>)>,
    timer_keys: HashMap<TimerId, TimerKey>,
    sockets: HashMap<SocketId, MockSocket>,
    last_socket: Option<SocketId>,
    refuse_registrations: bool,
}

impl ManualInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Remove and return the earliest timer due at or before `limit`.
    fn pop_due(&mut self, limit: Duration) -> Option<(TimerKey, Box<dyn FnOnce()>)> {
        let key = *self.timers.keys().next()?;
        if key.0 > limit {
            return None;
        }
        let (id, callback) = self.timers.remove(&key)?;
        self.timer_keys.remove(&id);
        Some((key, callback))
    }
}

/// Scheduler port with a virtual clock and scripted sockets.
#[derive(Default)]
pub struct ManualScheduler {
    inner: RefCell<ManualInner>,
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ManualScheduler")
            .field("now", &inner.now)
            .field("timers", &inner.timers.len())
            .field("sockets", &inner.sockets.len())
            .finish()
    }
}

impl ManualScheduler {
    /// Create a scheduler at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.borrow().now
    }

    /// Number of callbacks not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().timers.len()
    }

    /// Run one loop turn: every callback due now that was scheduled before
    /// the turn started. Returns how many ran.
    pub fn turn(&self) -> usize {
        let (now, horizon) = {
            let inner = self.inner.borrow();
            (inner.now, inner.next_id)
        };

        let mut ran = 0;
        loop {
            let due = {
                let mut inner = self.inner.borrow_mut();
                match inner.timers.keys().next() {
                    Some(key) if key.0 <= now && key.1 <= horizon => inner.pop_due(now),
                    _ => None,
                }
            };
            let Some((_, callback)) = due else {
                break;
            };
            callback();
            ran += 1;
        }
        ran
    }

    /// Run turns until nothing is due at the current time.
    /// Returns the number of callbacks that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_TURNS {
            let ran = self.turn();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
        log::warn!("[Scheduler] run_until_idle gave up after {MAX_TURNS} turns");
        total
    }

    /// Move the clock forward by `by`, firing timers in deadline order and
    /// settling zero-delay work at each deadline.
    pub fn advance(&self, by: Duration) {
        let target = self.now() + by;
        self.run_until_idle();
        loop {
            let next = self.inner.borrow().timers.keys().next().map(|k| k.0);
            match next {
                Some(deadline) if deadline <= target => {
                    self.inner.borrow_mut().now = deadline;
                    self.run_until_idle();
                }
                _ => break,
            }
        }
        self.inner.borrow_mut().now = target;
        self.run_until_idle();
    }

    /// Make the next registrations fail (simulates resource exhaustion).
    pub fn refuse_registrations(&self, refuse: bool) {
        self.inner.borrow_mut().refuse_registrations = refuse;
    }

    /// The most recently registered socket.
    pub fn last_socket(&self) -> Option<SocketId> {
        self.inner.borrow().last_socket
    }

    /// Endpoint a socket was opened for.
    pub fn endpoint(&self, socket: SocketId) -> Option<Endpoint> {
        self.inner
            .borrow()
            .sockets
            .get(&socket)
            .map(|s| s.endpoint.clone())
    }

    /// Whether the socket is still registered (not cancelled).
    pub fn is_open(&self, socket: SocketId) -> bool {
        self.inner.borrow().sockets.contains_key(&socket)
    }

    /// Complete the connection and fire `on_writable`.
    pub fn accept(&self, socket: SocketId) {
        let events = {
            let mut inner = self.inner.borrow_mut();
            let Some(mock) = inner.sockets.get_mut(&socket) else {
                return;
            };
            mock.accepted = true;
            Rc::clone(&mock.events)
        };
        (events.borrow_mut().on_writable)();
    }

    /// Deliver bytes from the peer.
    pub fn feed(&self, socket: SocketId, bytes: &[u8]) {
        if let Some(events) = self.events(socket) {
            (events.borrow_mut().on_readable)(bytes);
        }
    }

    /// Close the connection from the peer side.
    pub fn hang_up(&self, socket: SocketId) {
        self.fail(
            socket,
            io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer"),
        );
    }

    /// Report an arbitrary socket error.
    pub fn fail(&self, socket: SocketId, error: io::Error) {
        if let Some(events) = self.events(socket) {
            (events.borrow_mut().on_error)(error);
        }
    }

    /// Drain everything written to the socket so far, as text.
    pub fn take_written(&self, socket: SocketId) -> String {
        let mut inner = self.inner.borrow_mut();
        let Some(mock) = inner.sockets.get_mut(&socket) else {
            return String::new();
        };
        String::from_utf8_lossy(&std::mem::take(&mut mock.written)).into_owned()
    }

    /// Limit how many bytes the socket accepts; `None` removes the limit.
    pub fn set_write_budget(&self, socket: SocketId, budget: Option<usize>) {
        if let Some(mock) = self.inner.borrow_mut().sockets.get_mut(&socket) {
            mock.write_budget = budget;
        }
    }

    /// Raise the write budget and fire `on_writable`.
    pub fn release_writes(&self, socket: SocketId, bytes: usize) {
        let events = {
            let mut inner = self.inner.borrow_mut();
            let Some(mock) = inner.sockets.get_mut(&socket) else {
                return;
            };
            if let Some(budget) = mock.write_budget.as_mut() {
                *budget += bytes;
            }
            Rc::clone(&mock.events)
        };
        (events.borrow_mut().on_writable)();
    }

    fn events(&self, socket: SocketId) -> Option<Rc<RefCell<SocketEvents>>> {
        self.inner
            .borrow()
            .sockets
            .get(&socket)
            .map(|s| Rc::clone(&s.events))
    }
}

impl SchedulerPort for ManualScheduler {
    fn register_socket(&self, endpoint: &Endpoint, events: SocketEvents) -> io::Result<SocketId> {
        let mut inner = self.inner.borrow_mut();
        if inner.refuse_registrations {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "socket registration refused",
            ));
        }

        let socket = SocketId(inner.next_id());
        inner.sockets.insert(
            socket,
            MockSocket {
                endpoint: endpoint.clone(),
                events: Rc::new(RefCell::new(events)),
                accepted: false,
                written: Vec::new(),
                write_budget: None,
            },
        );
        inner.last_socket = Some(socket);
        Ok(socket)
    }

    fn write(&self, socket: SocketId, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let mock = inner
            .sockets
            .get_mut(&socket)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown socket"))?;
        if !mock.accepted {
            return Ok(0);
        }

        let n = match mock.write_budget.as_mut() {
            Some(0) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
            Some(budget) => {
                let n = bytes.len().min(*budget);
                *budget -= n;
                n
            }
            None => bytes.len(),
        };
        mock.written.extend_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn cancel(&self, socket: SocketId) {
        self.inner.borrow_mut().sockets.remove(&socket);
    }

    fn schedule_after(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let seq = inner.next_id();
        let timer = TimerId(seq);
        let key = (inner.now + delay, seq);
        inner.timers.insert(key, (timer, callback));
        inner.timer_keys.insert(timer, key);
        timer
    }

    fn cancel_timer(&self, timer: TimerId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(key) = inner.timer_keys.remove(&timer) {
            inner.timers.remove(&key);
        }
    }
}
