//! [`SchedulerPort`] backed by a tokio `LocalSet`.
//!
//! Each socket gets a local read task that connects, then forwards every read
//! to `on_readable`. Writes go straight to `try_write` on the write half; on
//! `WouldBlock` a short-lived task waits for writability and fires
//! `on_writable`. Timers are local tasks that sleep and then run the callback,
//! aborted on cancel.
//!
//! All callbacks are `!Send`, so every method must be called from inside a
//! [`tokio::task::LocalSet`] (e.g. `local.run_until(...)`).

use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use super::{Endpoint, SchedulerPort, SocketEvents, SocketId, TimerId};

/// Read buffer size per socket read.
const READ_BUFFER_SIZE: usize = 16 * 1024;

struct SocketSlot {
    writer: Rc<OnceCell<OwnedWriteHalf>>,
    events: Rc<RefCell<SocketEvents>>,
    read_task: JoinHandle<()>,
    /// Pending writability waiter, if a write hit `WouldBlock`.
    write_waiter: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct TokioInner {
    next_id: u64,
    timers: HashMap<TimerId, JoinHandle<()>>,
    sockets: HashMap<SocketId, SocketSlot>,
}

impl TokioInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Scheduler port running on the current tokio `LocalSet`.
#[derive(Clone, Default)]
pub struct TokioScheduler {
    inner: Rc<RefCell<TokioInner>>,
}

impl std::fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TokioScheduler")
            .field("timers", &inner.timers.len())
            .field("sockets", &inner.sockets.len())
            .finish()
    }
}

impl TokioScheduler {
    /// Create a scheduler. Must be used from inside a `LocalSet`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read loop: connect, publish the write half, then forward reads.
    async fn read_loop(
        socket: SocketId,
        endpoint: Endpoint,
        writer: Rc<OnceCell<OwnedWriteHalf>>,
        events: Rc<RefCell<SocketEvents>>,
    ) {
        let stream = match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("[Scheduler] Connect to {} failed: {e}", endpoint);
                (events.borrow_mut().on_error)(e);
                return;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[Scheduler] set_nodelay failed for {:?}: {e}", socket);
        }

        let (mut reader, write_half) = stream.into_split();
        if writer.set(write_half).is_err() {
            log::warn!("[Scheduler] Write half for {:?} was already set", socket);
            return;
        }
        (events.borrow_mut().on_writable)();

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    log::info!("[Scheduler] Peer closed {:?}", socket);
                    (events.borrow_mut().on_error)(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    ));
                    break;
                }
                Ok(n) => (events.borrow_mut().on_readable)(&buf[..n]),
                Err(e) => {
                    log::warn!("[Scheduler] Read error on {:?}: {e}", socket);
                    (events.borrow_mut().on_error)(e);
                    break;
                }
            }
        }
    }

    fn spawn_write_waiter(&self, socket: SocketId) {
        let mut inner = self.inner.borrow_mut();
        let Some(slot) = inner.sockets.get_mut(&socket) else {
            return;
        };
        if slot.write_waiter.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let writer = Rc::clone(&slot.writer);
        let events = Rc::clone(&slot.events);
        slot.write_waiter = Some(tokio::task::spawn_local(async move {
            let Some(half) = writer.get() else {
                return;
            };
            match half.writable().await {
                Ok(()) => (events.borrow_mut().on_writable)(),
                Err(e) => (events.borrow_mut().on_error)(e),
            }
        }));
    }
}

impl SchedulerPort for TokioScheduler {
    fn register_socket(&self, endpoint: &Endpoint, events: SocketEvents) -> io::Result<SocketId> {
        let mut inner = self.inner.borrow_mut();
        let socket = SocketId(inner.next_id());
        let writer = Rc::new(OnceCell::new());
        let events = Rc::new(RefCell::new(events));

        let read_task = tokio::task::spawn_local(Self::read_loop(
            socket,
            endpoint.clone(),
            Rc::clone(&writer),
            Rc::clone(&events),
        ));

        inner.sockets.insert(
            socket,
            SocketSlot {
                writer,
                events,
                read_task,
                write_waiter: None,
            },
        );
        log::debug!("[Scheduler] Registered {:?} for {}", socket, endpoint);
        Ok(socket)
    }

    fn write(&self, socket: SocketId, bytes: &[u8]) -> io::Result<usize> {
        let writer = {
            let inner = self.inner.borrow();
            let slot = inner
                .sockets
                .get(&socket)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "unknown socket"))?;
            Rc::clone(&slot.writer)
        };

        // Not connected yet: on_writable fires once the connect completes.
        let Some(half) = writer.get() else {
            return Ok(0);
        };

        match half.try_write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.spawn_write_waiter(socket);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn cancel(&self, socket: SocketId) {
        if let Some(slot) = self.inner.borrow_mut().sockets.remove(&socket) {
            slot.read_task.abort();
            if let Some(waiter) = slot.write_waiter {
                waiter.abort();
            }
            log::debug!("[Scheduler] Cancelled {:?}", socket);
        }
    }

    fn schedule_after(&self, delay: Duration, callback: Box<dyn FnOnce()>) -> TimerId {
        let mut inner = self.inner.borrow_mut();
        let timer = TimerId(inner.next_id());
        let registry: Weak<RefCell<TokioInner>> = Rc::downgrade(&self.inner);

        let handle = tokio::task::spawn_local(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Some(registry) = registry.upgrade() {
                registry.borrow_mut().timers.remove(&timer);
            }
            callback();
        });
        inner.timers.insert(timer, handle);
        timer
    }

    fn cancel_timer(&self, timer: TimerId) {
        if let Some(handle) = self.inner.borrow_mut().timers.remove(&timer) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(flavor = "current_thread")]
    async fn test_timers_fire_in_order_and_cancel() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let scheduler = TokioScheduler::new();
                let fired = Rc::new(RefCell::new(Vec::new()));

                let f = Rc::clone(&fired);
                scheduler.schedule_after(Duration::from_millis(20), Box::new(move || f.borrow_mut().push("late")));
                let f = Rc::clone(&fired);
                scheduler.schedule_after(Duration::ZERO, Box::new(move || f.borrow_mut().push("now")));
                let f = Rc::clone(&fired);
                let cancelled = scheduler.schedule_after(
                    Duration::from_millis(5),
                    Box::new(move || f.borrow_mut().push("cancelled")),
                );
                scheduler.cancel_timer(cancelled);

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(*fired.borrow(), vec!["now", "late"]);
                assert!(scheduler.inner.borrow().timers.is_empty());
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_connect_failure_reports_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                // Bind then drop to get a port nobody listens on.
                let port = {
                    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                    listener.local_addr().unwrap().port()
                };

                let scheduler = TokioScheduler::new();
                let failed = Rc::new(Cell::new(false));
                let flag = Rc::clone(&failed);
                let events = SocketEvents {
                    on_readable: Box::new(|_| {}),
                    on_writable: Box::new(|| {}),
                    on_error: Box::new(move |_| flag.set(true)),
                };
                let socket = scheduler
                    .register_socket(&Endpoint::new("127.0.0.1", port), events)
                    .unwrap();
                assert_eq!(scheduler.write(socket, b"status\n").unwrap(), 0);

                tokio::time::sleep(Duration::from_millis(100)).await;
                assert!(failed.get());
            })
            .await;
    }
}
