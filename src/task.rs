//! Tasks: resumable units of caller logic.
//!
//! A task body is an ordinary `async` block. The session polls it with a
//! no-op waker; the only thing a body may await is a request made through its
//! [`TaskContext`]. The request future parks its [`Request`] in the task's
//! slot and returns `Pending`; the session picks it up, and once a result is
//! available it stores it in the slot and polls the body again.
//!
//! ```text
//! body.poll ──► Submit::poll ──► slot.outgoing = request ──► Pending
//!                                                              │
//! session.submit(request) ◄────────────────────────────────────┘
//!      ...reply / event / timer...
//! resumption queue ──► slot.incoming = result ──► body.poll ──► Submit::poll ──► Ready
//! ```

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures_util::task::noop_waker_ref;

use crate::error::EngineError;
use crate::group::{GroupId, HasTaskGroup, TaskGroup};
use crate::request::{Command, Condition, Reply, Request, Response};
use crate::session::{Session, SessionShared};

/// Boxed task body.
pub(crate) type BodyFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>>>>;

/// Builds a task body from its context.
pub(crate) type BodyFactory = Box<dyn FnOnce(TaskContext) -> BodyFuture>;

/// Unique task identifier within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task_{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Executing its body (between suspension points).
    Running,
    /// Waiting for the result of a request.
    Suspended,
    /// Finished or cancelled; cleanups have run.
    Closed,
}

/// Handoff point between a suspended body and the session.
#[derive(Default)]
pub(crate) struct TaskSlot {
    /// Request parked by the body, picked up after the poll.
    outgoing: Option<Request>,
    /// Result waiting for the body's next poll.
    incoming: Option<Result<Response, EngineError>>,
}

/// Outcome of polling a task body once.
pub(crate) enum Step {
    /// The body parked a request.
    Suspended(Request),
    /// The body returned.
    Finished(anyhow::Result<()>),
    /// The body returned `Pending` without parking a request.
    Stalled,
    /// The task was closed (possibly by its own body during the poll).
    Closed,
}

/// Session-side bookkeeping for one task.
pub(crate) struct TaskCore {
    id: TaskId,
    name: String,
    group: GroupId,
    state: Cell<TaskState>,
    slot: Rc<RefCell<TaskSlot>>,
    body: RefCell<Option<BodyFuture>>,
    cleanups: RefCell<Vec<Box<dyn FnOnce()>>>,
    last_request: RefCell<Option<String>>,
}

impl TaskCore {
    /// Create a task; the body is built but not polled.
    pub(crate) fn new(
        id: TaskId,
        name: String,
        group: GroupId,
        session: Weak<SessionShared>,
        factory: BodyFactory,
    ) -> Self {
        let slot = Rc::new(RefCell::new(TaskSlot::default()));
        let ctx = TaskContext {
            id,
            name: name.clone(),
            group,
            slot: Rc::clone(&slot),
            session,
        };
        Self {
            id,
            name,
            group,
            state: Cell::new(TaskState::Running),
            slot,
            body: RefCell::new(Some(factory(ctx))),
            cleanups: RefCell::new(Vec::new()),
            last_request: RefCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn group(&self) -> GroupId {
        self.group
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.get() == TaskState::Closed
    }

    /// Poll the body once with `input` available to the awaiting request.
    ///
    /// The body is taken out of its cell for the duration of the poll, so the
    /// body may close its own task without a borrow conflict.
    pub(crate) fn step(&self, input: Option<Result<Response, EngineError>>) -> Step {
        if self.is_closed() {
            return Step::Closed;
        }
        let Some(mut body) = self.body.borrow_mut().take() else {
            return Step::Closed;
        };

        {
            let mut slot = self.slot.borrow_mut();
            slot.incoming = input;
            slot.outgoing = None;
        }
        self.state.set(TaskState::Running);

        let mut cx = Context::from_waker(noop_waker_ref());
        let poll = body.as_mut().poll(&mut cx);

        if self.is_closed() {
            return Step::Closed;
        }

        match poll {
            Poll::Ready(result) => Step::Finished(result),
            Poll::Pending => {
                let outgoing = self.slot.borrow_mut().outgoing.take();
                match outgoing {
                    Some(request) => {
                        *self.last_request.borrow_mut() = Some(request.describe());
                        self.state.set(TaskState::Suspended);
                        *self.body.borrow_mut() = Some(body);
                        Step::Suspended(request)
                    }
                    None => Step::Stalled,
                }
            }
        }
    }

    /// Resume a suspended body once with [`EngineError::Cancelled`].
    ///
    /// Returns the body's result if it ran to completion. A body that parks
    /// another request instead is dropped by the following `mark_closed`.
    pub(crate) fn interrupt(&self) -> Option<anyhow::Result<()>> {
        if self.state.get() != TaskState::Suspended {
            return None;
        }
        match self.step(Some(Err(EngineError::Cancelled))) {
            Step::Finished(result) => Some(result),
            _ => None,
        }
    }

    /// Mark closed and drop the body. Returns false if already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state.set(TaskState::Closed);
        let body = self.body.borrow_mut().take();
        drop(body);
        true
    }

    /// Run cleanup callbacks in registration order.
    pub(crate) fn run_cleanups(&self) {
        let cleanups = std::mem::take(&mut *self.cleanups.borrow_mut());
        for cleanup in cleanups {
            cleanup();
        }
    }

    /// Close without a session (the session is gone or being dropped).
    pub(crate) fn close_detached(&self) {
        if self.mark_closed() {
            self.run_cleanups();
        }
    }
}

/// Public handle to a task.
///
/// Cheap to clone. Equality is task identity.
#[derive(Clone)]
pub struct TaskHandle {
    core: Rc<TaskCore>,
    session: Weak<SessionShared>,
}

impl TaskHandle {
    pub(crate) fn new(core: Rc<TaskCore>, session: Weak<SessionShared>) -> Self {
        Self { core, session }
    }

    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Display name given at start.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state.get()
    }

    /// Whether the task has closed.
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Description of the last request the task submitted.
    pub fn last_request(&self) -> Option<String> {
        self.core.last_request.borrow().clone()
    }

    /// Force-close the task.
    ///
    /// The task leaves every session queue first. A suspended body then
    /// resumes once with [`EngineError::Cancelled`]; whatever it does next,
    /// it is dropped at its following suspension point and its cleanups run.
    /// If the session is gone the body is dropped without resuming. No-op if
    /// already closed.
    pub fn cancel(&self) {
        match self.session.upgrade() {
            Some(session) => session.close_task(self.core.id, crate::session::Closure::Cancelled),
            None => self.core.close_detached(),
        }
    }

    /// Register a callback to run once when the task closes.
    ///
    /// Runs immediately if the task is already closed.
    pub fn add_cleanup(&self, cleanup: impl FnOnce() + 'static) {
        if self.is_closed() {
            cleanup();
        } else {
            self.core.cleanups.borrow_mut().push(Box::new(cleanup));
        }
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for TaskHandle {}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl HasTaskGroup for TaskHandle {
    fn task_group(&self) -> TaskGroup {
        TaskGroup::new(self.core.group, Weak::clone(&self.session))
    }
}

/// What a task body uses to talk to its session.
///
/// Every method that returns a future is a suspension point. Await one
/// request at a time; a body awaiting anything else is closed as stalled.
pub struct TaskContext {
    id: TaskId,
    name: String,
    group: GroupId,
    slot: Rc<RefCell<TaskSlot>>,
    session: Weak<SessionShared>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl TaskContext {
    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The task's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning session, if it still exists.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(Session::from_shared)
    }

    /// Submit any request and suspend until it resolves.
    pub fn submit(&self, request: impl Into<Request>) -> Submit {
        Submit {
            slot: Rc::clone(&self.slot),
            request: Some(request.into()),
        }
    }

    /// Send a command and return its reply.
    pub async fn command(&self, command: Command) -> Result<Reply, EngineError> {
        self.submit(command).await?.into_reply()
    }

    /// Wait until any condition holds; returns the ones that held.
    pub async fn wait(
        &self,
        conditions: impl IntoIterator<Item = Condition>,
    ) -> Result<Vec<Condition>, EngineError> {
        let conditions = conditions.into_iter().collect();
        self.submit(Request::Wait(conditions)).await?.into_fired()
    }

    /// Run several requests; returns their results in order.
    pub async fn batch(
        &self,
        requests: impl IntoIterator<Item = Request>,
    ) -> Result<Vec<Response>, EngineError> {
        let requests = requests.into_iter().collect();
        self.submit(Request::Batch(requests)).await?.into_batch()
    }

    /// A handle to this task, resolved within the current turn.
    pub async fn current_task(&self) -> Result<TaskHandle, EngineError> {
        self.submit(Request::CurrentTask).await?.into_task()
    }
}

impl HasTaskGroup for TaskContext {
    fn task_group(&self) -> TaskGroup {
        TaskGroup::new(self.group, Weak::clone(&self.session))
    }
}

/// Future returned by [`TaskContext::submit`].
#[must_use = "requests do nothing unless awaited"]
pub struct Submit {
    slot: Rc<RefCell<TaskSlot>>,
    request: Option<Request>,
}

impl std::fmt::Debug for Submit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submit")
            .field("submitted", &self.request.is_none())
            .finish_non_exhaustive()
    }
}

impl Future for Submit {
    type Output = Result<Response, EngineError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut slot = this.slot.borrow_mut();

        if let Some(request) = this.request.take() {
            if slot.outgoing.is_some() {
                return Poll::Ready(Err(EngineError::Invalid(
                    "a task may only await one request at a time".to_string(),
                )));
            }
            slot.outgoing = Some(request);
            slot.incoming = None;
            return Poll::Pending;
        }

        match slot.incoming.take() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}
