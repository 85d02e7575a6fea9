//! Session state and every transition that does not run caller code.
//!
//! Nothing in here polls a task body or invokes a cleanup, so all of it runs
//! under one `RefCell` borrow. Results for tasks only ever land in the
//! resumption queue; [`super::SessionShared::flush`] hands them out later.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::{AckError, EngineError};
use crate::group::GroupId;
use crate::request::{Command, Condition, Reply, Request, Response};
use crate::scheduler::{Endpoint, SchedulerPort, SocketEvents, SocketId, TimerId};
use crate::task::{TaskCore, TaskHandle, TaskId};
use crate::wire::{self, Line, LineDecoder, OutputBuffer};

use super::{ConnectionState, SessionShared};

/// Where a result goes once it is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// Resume a task.
    Task(TaskId),
    /// Fill one slot of a batch.
    Batch { batch: u64, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdlePhase {
    /// No `idle` outstanding.
    Off,
    /// `idle` sent, server may push changes.
    Waiting,
    /// `noidle` sent, waiting for the idle reply to finish.
    Cancelling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    Command,
    Idle,
    Password,
}

/// A command written to the socket whose reply has not completed.
#[derive(Debug)]
struct InFlight {
    exchange: Exchange,
    /// `None` once the owning task closed: the reply is read and dropped.
    target: Option<Target>,
    owner: Option<TaskId>,
}

#[derive(Debug)]
struct PendingWait {
    id: u64,
    target: Target,
    owner: TaskId,
    conditions: Vec<Condition>,
    timer: Option<TimerId>,
}

#[derive(Debug)]
struct BatchState {
    target: Target,
    owner: TaskId,
    results: Vec<Option<Response>>,
    remaining: usize,
    first_error: Option<EngineError>,
}

/// A result waiting to be handed to its task.
#[derive(Debug)]
pub(crate) struct Resumption {
    pub(crate) task: TaskId,
    /// `None` starts the body.
    pub(crate) input: Option<Result<Response, EngineError>>,
}

pub(crate) struct SessionState {
    pub(crate) scheduler: Rc<dyn SchedulerPort>,
    pub(crate) config: SessionConfig,
    this: Weak<SessionShared>,
    next_id: u64,

    link: Link,
    idle: IdlePhase,
    endpoint: Option<Endpoint>,
    version: Option<String>,
    socket: Option<SocketId>,
    /// Bumped on every connect; callbacks from older sockets are ignored.
    epoch: u64,

    decoder: LineDecoder,
    output: OutputBuffer,
    reply_lines: Vec<String>,
    changed: Vec<String>,

    in_flight: VecDeque<InFlight>,
    waits: Vec<PendingWait>,
    batches: HashMap<u64, BatchState>,
    pub(crate) resumptions: VecDeque<Resumption>,
    pub(crate) flush_timer: Option<TimerId>,

    pub(crate) tasks: BTreeMap<TaskId, Rc<TaskCore>>,
    pub(crate) groups: BTreeMap<GroupId, Vec<TaskId>>,
    pub(crate) default_group: GroupId,
}

impl SessionState {
    pub(crate) fn new(
        scheduler: Rc<dyn SchedulerPort>,
        config: SessionConfig,
        this: Weak<SessionShared>,
    ) -> Self {
        let decoder = LineDecoder::with_max_line_length(config.max_line_length);
        let default_group = GroupId(1);
        let mut groups = BTreeMap::new();
        groups.insert(default_group, Vec::new());
        Self {
            scheduler,
            config,
            this,
            next_id: 1,
            link: Link::Disconnected,
            idle: IdlePhase::Off,
            endpoint: None,
            version: None,
            socket: None,
            epoch: 0,
            decoder,
            output: OutputBuffer::new(),
            reply_lines: Vec::new(),
            changed: Vec::new(),
            in_flight: VecDeque::new(),
            waits: Vec::new(),
            batches: HashMap::new(),
            resumptions: VecDeque::new(),
            flush_timer: None,
            tasks: BTreeMap::new(),
            groups,
            default_group,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ---- inspection ----

    pub(crate) fn connection_state(&self) -> ConnectionState {
        match (self.link, self.idle) {
            (Link::Disconnected, _) => ConnectionState::Disconnected,
            (Link::Connecting, _) => ConnectionState::Connecting,
            (Link::Connected, IdlePhase::Waiting) => ConnectionState::Idle,
            (Link::Connected, _) => ConnectionState::Connected,
        }
    }

    pub(crate) fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub(crate) fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub(crate) fn waits_len(&self) -> usize {
        self.waits.len()
    }

    pub(crate) fn batches_len(&self) -> usize {
        self.batches.len()
    }

    pub(crate) fn handle(&self, task: TaskId) -> Option<TaskHandle> {
        self.tasks
            .get(&task)
            .map(|core| TaskHandle::new(Rc::clone(core), Weak::clone(&self.this)))
    }

    // ---- connection ----

    /// Open a new connection, dropping any current one.
    pub(crate) fn connect(
        &mut self,
        endpoint: Endpoint,
        secret: Option<&str>,
    ) -> Result<(), EngineError> {
        let password = secret
            .map(|secret| {
                let command = Command::new(wire::PASSWORD).arg(secret);
                command.validate().map(|()| command)
            })
            .transpose()?;

        if self.link != Link::Disconnected {
            self.lose_connection("reconnecting");
        }

        self.epoch += 1;
        self.decoder = LineDecoder::with_max_line_length(self.config.max_line_length);
        self.output.clear();
        self.reply_lines.clear();
        self.changed.clear();
        self.version = None;
        self.idle = IdlePhase::Off;
        self.link = Link::Connecting;
        self.endpoint = Some(endpoint.clone());

        log::info!("[Session] Connecting to {endpoint}");
        let events = self.socket_events(self.epoch);
        match self.scheduler.register_socket(&endpoint, events) {
            Ok(socket) => {
                self.socket = Some(socket);
                if let Some(password) = password {
                    self.in_flight.push_back(InFlight {
                        exchange: Exchange::Password,
                        target: None,
                        owner: None,
                    });
                    self.send(&wire::encode(&password));
                }
                Ok(())
            }
            Err(e) => {
                log::error!("[Session] Failed to register socket for {endpoint}: {e}");
                self.lose_connection("socket registration failed");
                Err(EngineError::ConnectionLost)
            }
        }
    }

    fn socket_events(&self, epoch: u64) -> SocketEvents {
        let readable = Weak::clone(&self.this);
        let writable = Weak::clone(&self.this);
        let failed = Weak::clone(&self.this);
        SocketEvents {
            on_readable: Box::new(move |bytes| {
                if let Some(session) = readable.upgrade() {
                    session.on_readable(epoch, bytes);
                }
            }),
            on_writable: Box::new(move || {
                if let Some(session) = writable.upgrade() {
                    session.on_writable(epoch);
                }
            }),
            on_error: Box::new(move |err| {
                if let Some(session) = failed.upgrade() {
                    session.on_socket_error(epoch, &err);
                }
            }),
        }
    }

    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.socket.is_some()
    }

    /// Drop the connection and fail everything waiting on it.
    ///
    /// Every in-flight command and every pending wait resolves with
    /// [`EngineError::ConnectionLost`]; the buffers are emptied.
    pub(crate) fn lose_connection(&mut self, reason: &str) {
        if let Some(socket) = self.socket.take() {
            self.scheduler.cancel(socket);
        }
        if self.link != Link::Disconnected {
            log::info!("[Session] Disconnected: {reason}");
        }
        self.link = Link::Disconnected;
        self.idle = IdlePhase::Off;
        self.version = None;
        self.decoder.clear();
        self.output.clear();
        self.reply_lines.clear();
        self.changed.clear();

        let in_flight = std::mem::take(&mut self.in_flight);
        for entry in in_flight {
            if let (Exchange::Command, Some(target)) = (entry.exchange, entry.target) {
                self.deliver(target, Err(EngineError::ConnectionLost));
            }
        }

        let waits = std::mem::take(&mut self.waits);
        for wait in waits {
            if let Some(timer) = wait.timer {
                self.scheduler.cancel_timer(timer);
            }
            self.deliver(wait.target, Err(EngineError::ConnectionLost));
        }
    }

    // ---- output ----

    fn send(&mut self, bytes: &[u8]) {
        self.output.push(bytes);
        self.pump();
    }

    /// Write as much buffered output as the socket takes.
    pub(crate) fn pump(&mut self) {
        let Some(socket) = self.socket else {
            return;
        };
        while !self.output.is_empty() {
            match self.scheduler.write(socket, self.output.pending()) {
                Ok(0) => break,
                Ok(n) => self.output.consume(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("[Session] Write failed: {e}");
                    self.lose_connection("write failed");
                    return;
                }
            }
        }
    }

    fn cancel_idle(&mut self) {
        if self.idle == IdlePhase::Waiting {
            log::debug!("[Session] >> {}", wire::NOIDLE);
            self.idle = IdlePhase::Cancelling;
            self.send(format!("{}\n", wire::NOIDLE).as_bytes());
        }
    }

    /// Enter `idle` if the connection is quiet and someone wants events.
    pub(crate) fn maybe_idle(&mut self) {
        let wanted = !self.waits.is_empty() || self.config.idle_when_unobserved;
        if self.link != Link::Connected
            || self.idle != IdlePhase::Off
            || !self.in_flight.is_empty()
            || self.socket.is_none()
            || !wanted
        {
            return;
        }

        log::debug!("[Session] >> {}", wire::IDLE);
        self.idle = IdlePhase::Waiting;
        self.in_flight.push_back(InFlight {
            exchange: Exchange::Idle,
            target: None,
            owner: None,
        });
        self.send(format!("{}\n", wire::IDLE).as_bytes());
        self.evaluate_waits(&[], None);
    }

    // ---- input ----

    /// Decode and dispatch everything readable. Protocol violations drop
    /// the connection.
    pub(crate) fn receive(&mut self, bytes: &[u8]) {
        self.decoder.push(bytes);
        while self.socket.is_some() {
            let line = match self.decoder.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::error!("[Session] {e}");
                    self.lose_connection("protocol error");
                    break;
                }
            };
            if let Err(e) = self.handle_line(&line) {
                log::error!("[Session] {e}");
                self.lose_connection("protocol error");
                break;
            }
        }
    }

    fn handle_line(&mut self, text: &str) -> Result<(), EngineError> {
        log::trace!("[Session] << {text}");
        let line = Line::parse(text)?;

        if self.link == Link::Connecting {
            let Line::Greeting(version) = line else {
                return Err(EngineError::Protocol(format!(
                    "expected greeting, got {text:?}"
                )));
            };
            self.on_greeting(version);
            return Ok(());
        }

        let Some(head) = self.in_flight.front() else {
            return Err(EngineError::Protocol(format!(
                "unexpected line with no command outstanding: {text:?}"
            )));
        };

        match (line, head.exchange) {
            (Line::Ok, _) => self.complete(Ok(())),
            (Line::Ack(ack), _) => self.complete(Err(ack)),
            (Line::Greeting(_), _) => Err(EngineError::Protocol(format!(
                "unexpected greeting: {text:?}"
            ))),
            (Line::Changed(category), Exchange::Idle) => {
                self.changed.push(category.to_string());
                Ok(())
            }
            (Line::Changed(_) | Line::Data(_), Exchange::Command) => {
                self.reply_lines.push(text.to_string());
                Ok(())
            }
            (Line::Data(_), Exchange::Idle) | (_, Exchange::Password) => Err(
                EngineError::Protocol(format!("unexpected reply data: {text:?}")),
            ),
        }
    }

    fn on_greeting(&mut self, version: &str) {
        log::info!("[Session] Connected, protocol version {version}");
        self.link = Link::Connected;
        self.version = Some(version.to_string());
        self.evaluate_waits(&[], None);
        self.schedule_flush();
    }

    /// Finish the reply at the head of the in-flight queue.
    fn complete(&mut self, outcome: Result<(), AckError>) -> Result<(), EngineError> {
        let Some(entry) = self.in_flight.pop_front() else {
            return Err(EngineError::Protocol(
                "reply terminator with no command outstanding".to_string(),
            ));
        };
        let lines = std::mem::take(&mut self.reply_lines);

        match entry.exchange {
            Exchange::Command => match entry.target {
                Some(target) => {
                    let result = outcome
                        .map(|()| Response::Reply(Reply::new(lines)))
                        .map_err(EngineError::Command);
                    self.deliver(target, result);
                }
                None => log::debug!("[Session] Discarding reply for a closed task"),
            },
            Exchange::Idle => {
                self.idle = IdlePhase::Off;
                let events = std::mem::take(&mut self.changed);
                if let Err(ack) = outcome {
                    return Err(EngineError::Protocol(format!("idle rejected: {ack}")));
                }
                if !events.is_empty() {
                    log::debug!("[Session] Changed: {}", events.join(", "));
                    self.evaluate_waits(&events, None);
                }
            }
            Exchange::Password => {
                if let Err(ack) = outcome {
                    log::error!("[Session] Authentication failed: {ack}");
                    return Err(EngineError::Command(ack));
                }
                log::debug!("[Session] Authenticated");
            }
        }

        if self.in_flight.is_empty() {
            self.schedule_flush();
        }
        Ok(())
    }

    // ---- requests ----

    /// Accept a request on behalf of `owner`; its result goes to `target`.
    pub(crate) fn submit(&mut self, target: Target, owner: TaskId, request: Request) {
        match request {
            Request::Command(command) => self.submit_command(target, owner, &command),
            Request::Wait(conditions) => self.add_wait(target, owner, conditions),
            Request::Batch(parts) => self.submit_batch(target, owner, parts),
            Request::CurrentTask => {
                let result = self
                    .handle(owner)
                    .map(Response::Task)
                    .ok_or(EngineError::Cancelled);
                self.deliver(target, result);
            }
        }
    }

    fn submit_command(&mut self, target: Target, owner: TaskId, command: &Command) {
        if let Err(e) = command.validate() {
            self.deliver(target, Err(e));
            return;
        }
        if self.link == Link::Disconnected {
            self.deliver(target, Err(EngineError::ConnectionLost));
            return;
        }

        self.cancel_idle();
        if self.socket.is_none() {
            self.deliver(target, Err(EngineError::ConnectionLost));
            return;
        }

        log::debug!("[Session] >> {}", command.name());
        self.in_flight.push_back(InFlight {
            exchange: Exchange::Command,
            target: Some(target),
            owner: Some(owner),
        });
        self.send(&wire::encode(command));
    }

    fn submit_batch(&mut self, target: Target, owner: TaskId, parts: Vec<Request>) {
        if parts.is_empty() {
            self.deliver(target, Ok(Response::Batch(Vec::new())));
            return;
        }

        let batch = self.next_id();
        self.batches.insert(
            batch,
            BatchState {
                target,
                owner,
                results: parts.iter().map(|_| None).collect(),
                remaining: parts.len(),
                first_error: None,
            },
        );
        for (index, part) in parts.into_iter().enumerate() {
            self.submit(Target::Batch { batch, index }, owner, part);
        }
    }

    fn add_wait(&mut self, target: Target, owner: TaskId, conditions: Vec<Condition>) {
        if let Some(fired) = self.fired(&conditions, &[], Duration::ZERO) {
            self.deliver(target, Ok(Response::Fired(fired)));
            return;
        }

        let id = self.next_id();
        let timer = conditions
            .iter()
            .filter_map(|c| match c {
                Condition::Timeout(d) if !d.is_zero() => Some(*d),
                _ => None,
            })
            .min()
            .map(|delay| self.arm_wait_timer(id, delay));

        self.waits.push(PendingWait {
            id,
            target,
            owner,
            conditions,
            timer,
        });
        // Entering idle for the new waiter happens at the end of the flush.
        self.schedule_flush();
    }

    fn arm_wait_timer(&self, wait: u64, delay: Duration) -> TimerId {
        let this = Weak::clone(&self.this);
        self.scheduler.schedule_after(
            delay,
            Box::new(move || {
                if let Some(session) = this.upgrade() {
                    session.on_wait_timer(wait, delay);
                }
            }),
        )
    }

    /// Conditions of a wait that hold right now, if any.
    fn fired(
        &self,
        conditions: &[Condition],
        events: &[String],
        elapsed: Duration,
    ) -> Option<Vec<Condition>> {
        let held: Vec<Condition> = conditions
            .iter()
            .filter(|c| self.holds(c, events, elapsed))
            .cloned()
            .collect();
        (!held.is_empty()).then_some(held)
    }

    fn holds(&self, condition: &Condition, events: &[String], elapsed: Duration) -> bool {
        match condition {
            Condition::Event(category) => events.iter().any(|e| e.eq_ignore_ascii_case(category)),
            Condition::Any => !events.is_empty(),
            Condition::Timeout(d) => *d <= elapsed,
            Condition::Connected => self.link == Link::Connected,
            Condition::Idle => self.idle == IdlePhase::Waiting,
            Condition::WaitFor(tasks) => tasks.iter().any(TaskHandle::is_closed),
        }
    }

    /// Re-check pending waits against the current state plus `events`.
    ///
    /// `timer` names the wait whose timer just fired and how long it ran.
    pub(crate) fn evaluate_waits(&mut self, events: &[String], timer: Option<(u64, Duration)>) {
        let waits = std::mem::take(&mut self.waits);
        let mut resolved = Vec::new();
        for mut wait in waits {
            let elapsed = match timer {
                Some((id, elapsed)) if id == wait.id => {
                    wait.timer = None;
                    elapsed
                }
                _ => Duration::ZERO,
            };
            match self.fired(&wait.conditions, events, elapsed) {
                Some(fired) => {
                    if let Some(timer) = wait.timer {
                        self.scheduler.cancel_timer(timer);
                    }
                    resolved.push((wait.target, fired));
                }
                None => self.waits.push(wait),
            }
        }
        for (target, fired) in resolved {
            self.deliver(target, Ok(Response::Fired(fired)));
        }
    }

    // ---- results ----

    /// Route a result to a task's resumption or into its batch.
    pub(crate) fn deliver(&mut self, target: Target, result: Result<Response, EngineError>) {
        match target {
            Target::Task(task) => {
                self.resumptions.push_back(Resumption {
                    task,
                    input: Some(result),
                });
                self.schedule_flush();
            }
            Target::Batch { batch, index } => {
                let Some(state) = self.batches.get_mut(&batch) else {
                    return;
                };
                match result {
                    Ok(response) => state.results[index] = Some(response),
                    Err(e) => {
                        state.first_error.get_or_insert(e);
                    }
                }
                state.remaining -= 1;
                if state.remaining > 0 {
                    return;
                }

                let Some(state) = self.batches.remove(&batch) else {
                    return;
                };
                let aggregate = match state.first_error {
                    Some(e) => Err(e),
                    None => Ok(Response::Batch(state.results.into_iter().flatten().collect())),
                };
                self.deliver(state.target, aggregate);
            }
        }
    }

    /// Start a task's body on the next flush.
    pub(crate) fn enqueue_start(&mut self, task: TaskId) {
        self.resumptions.push_back(Resumption { task, input: None });
        self.schedule_flush();
    }

    /// Ask the scheduler for a flush on the next turn (once).
    pub(crate) fn schedule_flush(&mut self) {
        if self.flush_timer.is_some() {
            return;
        }
        let this = Weak::clone(&self.this);
        self.flush_timer = Some(self.scheduler.schedule_after(
            Duration::ZERO,
            Box::new(move || {
                if let Some(session) = this.upgrade() {
                    session.flush();
                }
            }),
        ));
    }

    /// Remove every trace of a task from the queues.
    ///
    /// In-flight commands stay queued so reply correlation holds; their
    /// replies are read and dropped.
    pub(crate) fn purge_task(&mut self, task: TaskId) {
        for entry in &mut self.in_flight {
            if entry.owner == Some(task) {
                entry.target = None;
                entry.owner = None;
            }
        }

        let scheduler = Rc::clone(&self.scheduler);
        self.waits.retain(|wait| {
            if wait.owner != task {
                return true;
            }
            if let Some(timer) = wait.timer {
                scheduler.cancel_timer(timer);
            }
            false
        });
        self.resumptions.retain(|r| r.task != task);
        self.batches.retain(|_, b| b.owner != task);
    }

    /// Cancel the socket and every timer (session teardown).
    pub(crate) fn shutdown(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.scheduler.cancel(socket);
        }
        if let Some(timer) = self.flush_timer.take() {
            self.scheduler.cancel_timer(timer);
        }
        for wait in self.waits.drain(..) {
            if let Some(timer) = wait.timer {
                self.scheduler.cancel_timer(timer);
            }
        }
        self.in_flight.clear();
        self.resumptions.clear();
        self.batches.clear();
    }
}
