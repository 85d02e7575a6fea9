//! Session: one connection, its command queue and the tasks that use it.
//!
//! # Architecture
//!
//! ```text
//!             ┌──────────────────────── Session ─────────────────────────┐
//!  task body  │                                                          │
//!  ─request──►│ submit ──► in-flight queue ──► OutputBuffer ──► socket   │
//!             │        └─► pending waits ◄── changed: / timers / state   │
//!             │                                                          │
//!  ◄─resume───│ flush ◄── resumption queue ◄── replies (FIFO), waits     │
//!             └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──greeting──► Connected ⇄ Idle
//!       ▲                        │                      │        │
//!       └────── socket error / protocol error / disconnect ──────┘
//! ```
//!
//! Results never reach a task inside the call that produced them. They queue
//! as resumptions and a zero-delay scheduler callback flushes them, so task
//! code always runs from a fresh host loop turn with no session borrow held.

mod state;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::config::SessionConfig;
use crate::error::{is_quiet_failure, EngineError};
use crate::group::{GroupId, HasTaskGroup, TaskGroup};
use crate::request::{Request, Response};
use crate::scheduler::{Endpoint, SchedulerPort};
use crate::task::{BodyFactory, Step, TaskContext, TaskCore, TaskHandle, TaskId};

use state::{SessionState, Target};

/// Callback receiving errors that task bodies did not handle.
pub type ErrorHook = Rc<dyn Fn(&TaskHandle, &anyhow::Error)>;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// Socket registered, greeting not yet received.
    Connecting,
    /// Greeting received; commands flow.
    Connected,
    /// Connected and parked in `idle`, waiting for server events.
    Idle,
}

/// Snapshot of queue sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Connection state at the time of the snapshot.
    pub state: ConnectionState,
    /// Commands (including `idle` and `password`) awaiting a reply.
    pub in_flight: usize,
    /// Condition waits not yet resolved.
    pub pending_waits: usize,
    /// Batches with unresolved parts.
    pub batches: usize,
    /// Results queued for delivery to tasks.
    pub resumptions: usize,
    /// Tasks that have not closed.
    pub tasks: usize,
}

/// Why a task is being closed.
pub(crate) enum Closure {
    Finished(anyhow::Result<()>),
    Cancelled,
    Stalled,
}

pub(crate) struct SessionShared {
    state: RefCell<SessionState>,
    error_hook: RefCell<Option<ErrorHook>>,
}

impl SessionShared {
    // ---- scheduler callbacks ----

    pub(crate) fn on_readable(&self, epoch: u64, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        if state.is_current(epoch) {
            state.receive(bytes);
        }
    }

    pub(crate) fn on_writable(&self, epoch: u64) {
        let mut state = self.state.borrow_mut();
        if state.is_current(epoch) {
            state.pump();
        }
    }

    pub(crate) fn on_socket_error(&self, epoch: u64, err: &std::io::Error) {
        let mut state = self.state.borrow_mut();
        if state.is_current(epoch) {
            log::warn!("[Session] Socket error: {err}");
            state.lose_connection("socket error");
        }
    }

    pub(crate) fn on_wait_timer(&self, wait: u64, elapsed: std::time::Duration) {
        self.state
            .borrow_mut()
            .evaluate_waits(&[], Some((wait, elapsed)));
    }

    /// Deliver the resumptions queued before this flush started, then enter
    /// idle if the connection went quiet.
    pub(crate) fn flush(self: &Rc<Self>) {
        let due = {
            let mut state = self.state.borrow_mut();
            state.flush_timer = None;
            std::mem::take(&mut state.resumptions)
        };

        for resumption in due {
            // Tasks closed earlier in this flush are gone from the map.
            let core = self.state.borrow().tasks.get(&resumption.task).map(Rc::clone);
            if let Some(core) = core {
                self.drive(&core, resumption.input);
            }
        }

        self.state.borrow_mut().maybe_idle();
    }

    /// Poll a task until it parks a request the session must wait on.
    fn drive(self: &Rc<Self>, core: &Rc<TaskCore>, input: Option<Result<Response, EngineError>>) {
        let mut input = input;
        loop {
            match core.step(input.take()) {
                Step::Suspended(Request::CurrentTask) => {
                    let handle = TaskHandle::new(Rc::clone(core), Rc::downgrade(self));
                    input = Some(Ok(Response::Task(handle)));
                }
                Step::Suspended(request) => {
                    log::trace!("[Session] Task '{}' awaits {}", core.name(), request.describe());
                    self.state
                        .borrow_mut()
                        .submit(Target::Task(core.id()), core.id(), request);
                    return;
                }
                Step::Finished(result) => {
                    self.close_task(core.id(), Closure::Finished(result));
                    return;
                }
                Step::Stalled => {
                    self.close_task(core.id(), Closure::Stalled);
                    return;
                }
                Step::Closed => return,
            }
        }
    }

    // ---- tasks and groups ----

    pub(crate) fn start_task(
        self: &Rc<Self>,
        group: GroupId,
        name: String,
        factory: BodyFactory,
    ) -> Result<TaskHandle, EngineError> {
        let id = {
            let mut state = self.state.borrow_mut();
            if !state.groups.contains_key(&group) {
                return Err(EngineError::Invalid(format!(
                    "cannot start '{name}': task group is closed"
                )));
            }
            TaskId(state.next_id())
        };

        // Building the body runs caller code, so no borrow is held here.
        let core = Rc::new(TaskCore::new(id, name, group, Rc::downgrade(self), factory));

        let mut state = self.state.borrow_mut();
        let Some(members) = state.groups.get_mut(&group) else {
            return Err(EngineError::Invalid(format!(
                "cannot start '{}': task group is closed",
                core.name()
            )));
        };
        members.push(id);
        state.tasks.insert(id, Rc::clone(&core));
        state.enqueue_start(id);
        log::debug!("[Session] Started task '{}' ({id})", core.name());

        Ok(TaskHandle::new(core, Rc::downgrade(self)))
    }

    /// Close a task: leave every queue, drop the body, run cleanups, report.
    pub(crate) fn close_task(self: &Rc<Self>, task: TaskId, closure: Closure) {
        let core = {
            let mut state = self.state.borrow_mut();
            let Some(core) = state.tasks.remove(&task) else {
                return;
            };
            state.purge_task(task);
            if let Some(members) = state.groups.get_mut(&core.group()) {
                members.retain(|id| *id != task);
            }
            core
        };

        // A suspended body sees the cancellation at its suspension point.
        let closure = match closure {
            Closure::Cancelled => core.interrupt().map_or(Closure::Cancelled, Closure::Finished),
            other => other,
        };

        if core.mark_closed() {
            core.run_cleanups();
        }

        match closure {
            Closure::Finished(Ok(())) => {
                log::debug!("[Session] Task '{}' finished", core.name());
            }
            Closure::Finished(Err(e)) if is_quiet_failure(&e) => {
                log::debug!("[Session] Task '{}' closed: {e}", core.name());
            }
            Closure::Finished(Err(e)) => self.report(&core, &e),
            Closure::Cancelled => log::debug!("[Session] Task '{}' cancelled", core.name()),
            Closure::Stalled => {
                let err = anyhow::anyhow!(
                    "task '{}' awaited something other than a session request",
                    core.name()
                );
                self.report(&core, &err);
            }
        }

        // WAIT_FOR waiters may be satisfied now.
        self.state.borrow_mut().evaluate_waits(&[], None);
    }

    fn report(self: &Rc<Self>, core: &Rc<TaskCore>, err: &anyhow::Error) {
        let hook = self.error_hook.borrow().clone();
        match hook {
            Some(hook) => {
                let handle = TaskHandle::new(Rc::clone(core), Rc::downgrade(self));
                hook(&handle, err);
            }
            None => log::error!("[Session] Task '{}' failed: {err:#}", core.name()),
        }
    }

    pub(crate) fn has_group(&self, group: GroupId) -> bool {
        self.state.borrow().groups.contains_key(&group)
    }

    pub(crate) fn group_tasks(&self, group: GroupId) -> Vec<TaskHandle> {
        let state = self.state.borrow();
        state
            .groups
            .get(&group)
            .into_iter()
            .flatten()
            .filter_map(|id| state.handle(*id))
            .collect()
    }

    pub(crate) fn close_group(self: &Rc<Self>, group: GroupId) {
        let members = self.state.borrow_mut().groups.remove(&group);
        let Some(members) = members else {
            return;
        };
        log::debug!("[Session] Closing group {:?} ({} tasks)", group, members.len());
        for task in members {
            self.close_task(task, Closure::Cancelled);
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.shutdown();
        let tasks = std::mem::take(&mut state.tasks);
        for core in tasks.values() {
            core.close_detached();
        }
    }
}

/// Client session for one server.
///
/// Cheap to clone; clones share the same connection. The session is
/// single-threaded and must be used on the thread running its scheduler.
#[derive(Clone)]
pub struct Session {
    shared: Rc<SessionShared>,
}

impl Session {
    /// Create a disconnected session driven by `scheduler`.
    pub fn new(scheduler: Rc<dyn SchedulerPort>, config: SessionConfig) -> Self {
        let shared = Rc::new_cyclic(|this| SessionShared {
            state: RefCell::new(SessionState::new(scheduler, config, Weak::clone(this))),
            error_hook: RefCell::new(None),
        });
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Rc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Connect to `host:port`, sending `secret` with `password` first if
    /// given.
    ///
    /// Any existing connection is dropped first. Commands may be submitted
    /// right away; they are written once the socket connects.
    ///
    /// # Errors
    ///
    /// [`EngineError::ConnectionLost`] if the scheduler cannot register the
    /// socket, [`EngineError::Invalid`] if the secret contains a line break.
    pub fn connect(&self, host: &str, port: u16, secret: Option<&str>) -> Result<(), EngineError> {
        self.shared
            .state
            .borrow_mut()
            .connect(Endpoint::new(host, port), secret)
    }

    /// Connect using host, port and password from `config`.
    ///
    /// # Errors
    ///
    /// See [`Session::connect`].
    pub fn connect_with(&self, config: &SessionConfig) -> Result<(), EngineError> {
        self.connect(&config.host, config.port, config.password.as_deref())
    }

    /// Drop the connection.
    ///
    /// Every in-flight command and every pending wait resolves with
    /// [`EngineError::ConnectionLost`].
    pub fn disconnect(&self) {
        self.shared
            .state
            .borrow_mut()
            .lose_connection("disconnect requested");
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().connection_state()
    }

    /// Protocol version from the server greeting.
    pub fn protocol_version(&self) -> Option<String> {
        self.shared.state.borrow().version().map(str::to_string)
    }

    /// Endpoint of the current or last connection attempt.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.shared.state.borrow().endpoint().cloned()
    }

    /// The session's default task group.
    pub fn group(&self) -> TaskGroup {
        let id = self.shared.state.borrow().default_group;
        TaskGroup::new(id, Rc::downgrade(&self.shared))
    }

    /// Create a new, empty task group.
    pub fn new_group(&self) -> TaskGroup {
        let id = {
            let mut state = self.shared.state.borrow_mut();
            let id = GroupId(state.next_id());
            state.groups.insert(id, Vec::new());
            id
        };
        TaskGroup::new(id, Rc::downgrade(&self.shared))
    }

    /// Start a task in the default group.
    ///
    /// # Errors
    ///
    /// See [`TaskGroup::start`].
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, body: F) -> Result<TaskHandle, EngineError>
    where
        F: FnOnce(TaskContext) -> Fut + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + 'static,
    {
        self.group().start(name, body)
    }

    /// Replace the handler for errors task bodies did not handle.
    ///
    /// Without a hook they are logged at error level.
    pub fn set_error_hook(&self, hook: impl Fn(&TaskHandle, &anyhow::Error) + 'static) {
        *self.shared.error_hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Queue sizes and state.
    pub fn stats(&self) -> SessionStats {
        let state = self.shared.state.borrow();
        SessionStats {
            state: state.connection_state(),
            in_flight: state.in_flight_len(),
            pending_waits: state.waits_len(),
            batches: state.batches_len(),
            resumptions: state.resumptions.len(),
            tasks: state.tasks.len(),
        }
    }
}

impl HasTaskGroup for Session {
    fn task_group(&self) -> TaskGroup {
        self.group()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.borrow();
        f.debug_struct("Session")
            .field("state", &state.connection_state())
            .field("endpoint", &state.endpoint())
            .field("tasks", &state.tasks.len())
            .finish_non_exhaustive()
    }
}
