//! Task groups: shared lifecycle for a set of tasks.
//!
//! Every session owns a default group; [`Session::new_group`] creates more.
//! Closing a group cancels all of its tasks and detaches it, after which
//! [`TaskGroup::start`] fails.
//!
//! [`Session::new_group`]: crate::session::Session::new_group

use std::future::Future;
use std::rc::Weak;

use crate::error::EngineError;
use crate::request::Condition;
use crate::session::{Session, SessionShared};
use crate::task::{BodyFuture, TaskContext, TaskHandle};

/// Unique group identifier within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) u64);

/// Anything that can hand out a task group to start tasks in.
///
/// Implemented by [`Session`] (its default group), [`TaskGroup`],
/// [`TaskHandle`] and [`TaskContext`] (the task's own group), so helpers that
/// launch tasks can take `&impl HasTaskGroup` instead of a concrete type.
pub trait HasTaskGroup {
    /// The group new tasks should join.
    fn task_group(&self) -> TaskGroup;
}

/// Handle to a group of tasks registered with one session.
#[derive(Clone)]
pub struct TaskGroup {
    id: GroupId,
    session: Weak<SessionShared>,
}

impl TaskGroup {
    pub(crate) fn new(id: GroupId, session: Weak<SessionShared>) -> Self {
        Self { id, session }
    }

    /// Group identifier.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// The owning session, if it still exists.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(Session::from_shared)
    }

    /// Whether the group can still start tasks.
    pub fn is_open(&self) -> bool {
        self.session
            .upgrade()
            .is_some_and(|session| session.has_group(self.id))
    }

    /// Handles to the group's live tasks, in start order.
    pub fn tasks(&self) -> Vec<TaskHandle> {
        self.session
            .upgrade()
            .map(|session| session.group_tasks(self.id))
            .unwrap_or_default()
    }

    /// Start a task running `body`.
    ///
    /// The body first runs on the next scheduling turn, never inside this
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invalid`] if the group was closed or its
    /// session was dropped.
    pub fn start<F, Fut>(&self, name: impl Into<String>, body: F) -> Result<TaskHandle, EngineError>
    where
        F: FnOnce(TaskContext) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| EngineError::Invalid("task group has no session".to_string()))?;
        session.start_task(
            self.id,
            name.into(),
            Box::new(move |ctx| -> BodyFuture { Box::pin(body(ctx)) }),
        )
    }

    /// Cancel every task in the group and detach it from the session.
    ///
    /// Each task's cleanups run exactly once, whether it was running or
    /// suspended. Closing twice is a no-op.
    pub fn close(&self) {
        if let Some(session) = self.session.upgrade() {
            session.close_group(self.id);
        }
    }

    /// Start a task that calls `on_connect` each time the session connects
    /// and `on_disconnect` each time it loses the connection afterwards.
    ///
    /// The loop runs until the task or group is closed.
    ///
    /// # Errors
    ///
    /// See [`TaskGroup::start`].
    pub fn watch_connection(
        &self,
        name: impl Into<String>,
        mut on_connect: impl FnMut() + 'static,
        mut on_disconnect: impl FnMut() + 'static,
    ) -> Result<TaskHandle, EngineError> {
        self.start(name, move |ctx| async move {
            loop {
                match ctx.wait([Condition::Connected]).await {
                    Ok(_) => {}
                    Err(EngineError::ConnectionLost) => continue,
                    Err(e) => return Err(e.into()),
                }
                on_connect();

                // An empty wait only ends when the connection goes away.
                match ctx.wait([]).await {
                    Err(EngineError::ConnectionLost) => on_disconnect(),
                    Err(e) => return Err(e.into()),
                    Ok(_) => {}
                }
            }
        })
    }
}

impl PartialEq for TaskGroup {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.session, &other.session)
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl HasTaskGroup for TaskGroup {
    fn task_group(&self) -> TaskGroup {
        self.clone()
    }
}

/// Start a task in whatever group `owner` provides.
///
/// # Errors
///
/// See [`TaskGroup::start`].
pub fn spawn<O, F, Fut>(owner: &O, name: impl Into<String>, body: F) -> Result<TaskHandle, EngineError>
where
    O: HasTaskGroup + ?Sized,
    F: FnOnce(TaskContext) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<()>> + 'static,
{
    owner.task_group().start(name, body)
}
