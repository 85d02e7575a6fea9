//! Requests a task can suspend on, and what they resolve to.
//!
//! | Request | Resolves with |
//! |---|---|
//! | [`Request::Command`] | [`Response::Reply`], in send order |
//! | [`Request::Wait`] | [`Response::Fired`], the conditions that held |
//! | [`Request::Batch`] | [`Response::Batch`], once every part resolved |
//! | [`Request::CurrentTask`] | [`Response::Task`], in the same turn |

use std::time::Duration;

use crate::error::EngineError;
use crate::task::TaskHandle;

/// A protocol command: a verb plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<String>,
}

impl Command {
    /// Create a command with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// The command verb.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The argument list.
    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    /// Check that the command can be framed on a single line.
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            return Err(EngineError::Invalid(format!(
                "command name {:?} must be a single word",
                self.name
            )));
        }
        if self.args.iter().any(|a| a.contains(['\n', '\r'])) {
            return Err(EngineError::Invalid(format!(
                "arguments of {:?} contain a line break",
                self.name
            )));
        }
        Ok(())
    }
}

/// Something a [`Request::Wait`] can wait for.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// A server event category (`changed: <category>`), matched
    /// case-insensitively.
    Event(String),
    /// Any server event.
    Any,
    /// The given time has elapsed since the wait was submitted.
    Timeout(Duration),
    /// The session is connected (greeting received).
    Connected,
    /// The session is parked in `idle`.
    Idle,
    /// One of the listed tasks has closed. An empty list never holds.
    WaitFor(Vec<TaskHandle>),
}

impl Condition {
    /// Shorthand for [`Condition::Event`].
    pub fn event(category: impl Into<String>) -> Self {
        Self::Event(category.into())
    }

    /// Shorthand for [`Condition::Timeout`] in milliseconds.
    pub fn timeout_ms(ms: u64) -> Self {
        Self::Timeout(Duration::from_millis(ms))
    }

    /// Display name: the category for events, an upper-case tag otherwise.
    pub fn name(&self) -> &str {
        match self {
            Self::Event(category) => category,
            Self::Any => "ANY",
            Self::Timeout(_) => "TIMEOUT",
            Self::Connected => "CONNECTED",
            Self::Idle => "IDLE",
            Self::WaitFor(_) => "WAIT_FOR",
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "TIMEOUT({}ms)", d.as_millis()),
            other => f.write_str(other.name()),
        }
    }
}

/// A suspension-worthy operation submitted by a task.
#[derive(Debug, Clone)]
pub enum Request {
    /// Send a command and wait for its reply.
    Command(Command),
    /// Wait until any of the conditions holds.
    Wait(Vec<Condition>),
    /// Run several requests and collect their results in order.
    Batch(Vec<Request>),
    /// Obtain a handle to the calling task.
    CurrentTask,
}

impl Request {
    /// Short description used in logs and task bookkeeping.
    pub fn describe(&self) -> String {
        match self {
            Self::Command(cmd) => format!("command {}", cmd.name()),
            Self::Wait(conditions) => {
                let names: Vec<String> = conditions.iter().map(ToString::to_string).collect();
                format!("wait [{}]", names.join(", "))
            }
            Self::Batch(parts) => format!("batch of {}", parts.len()),
            Self::CurrentTask => "current task".to_string(),
        }
    }
}

impl From<Command> for Request {
    fn from(cmd: Command) -> Self {
        Self::Command(cmd)
    }
}

/// A successful command reply: the lines before the closing `OK`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

impl Reply {
    /// Build a reply from raw lines.
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    /// Raw reply lines.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether the reply carried no data.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// `key: value` pairs, skipping lines without a separator.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| line.split_once(": "))
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// The value a request resolves to.
#[derive(Debug, Clone)]
pub enum Response {
    /// Reply to a [`Request::Command`].
    Reply(Reply),
    /// Conditions that held when a [`Request::Wait`] resolved.
    Fired(Vec<Condition>),
    /// Ordered results of a [`Request::Batch`].
    Batch(Vec<Response>),
    /// The calling task, for [`Request::CurrentTask`].
    Task(TaskHandle),
}

impl Response {
    /// Unwrap a command reply.
    pub fn into_reply(self) -> Result<Reply, EngineError> {
        match self {
            Self::Reply(reply) => Ok(reply),
            other => Err(mismatch("reply", &other)),
        }
    }

    /// Unwrap fired conditions.
    pub fn into_fired(self) -> Result<Vec<Condition>, EngineError> {
        match self {
            Self::Fired(conditions) => Ok(conditions),
            other => Err(mismatch("fired conditions", &other)),
        }
    }

    /// Unwrap batch results.
    pub fn into_batch(self) -> Result<Vec<Response>, EngineError> {
        match self {
            Self::Batch(parts) => Ok(parts),
            other => Err(mismatch("batch results", &other)),
        }
    }

    /// Unwrap a task handle.
    pub fn into_task(self) -> Result<TaskHandle, EngineError> {
        match self {
            Self::Task(task) => Ok(task),
            other => Err(mismatch("task handle", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Response) -> EngineError {
    let kind = match got {
        Response::Reply(_) => "reply",
        Response::Fired(_) => "fired conditions",
        Response::Batch(_) => "batch results",
        Response::Task(_) => "task handle",
    };
    EngineError::Invalid(format!("expected {expected}, got {kind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_pairs() {
        let reply = Reply::new(vec![
            "volume: 40".to_string(),
            "state: play".to_string(),
            "garbage".to_string(),
        ]);
        assert_eq!(reply.get("state"), Some("play"));
        assert_eq!(reply.get("missing"), None);
        assert_eq!(reply.pairs().count(), 2);
    }

    #[test]
    fn test_command_validation() {
        assert!(Command::new("status").validate().is_ok());
        assert!(Command::new("").validate().is_err());
        assert!(Command::new("two words").validate().is_err());
        assert!(Command::new("add").arg("a\nb").validate().is_err());
        assert!(Command::new("find").args(["artist", "a b"]).validate().is_ok());
    }

    #[test]
    fn test_condition_names() {
        assert_eq!(Condition::event("LIBRARY").name(), "LIBRARY");
        assert_eq!(Condition::timeout_ms(50).to_string(), "TIMEOUT(50ms)");
        assert_eq!(Condition::Connected.to_string(), "CONNECTED");
    }

    #[test]
    fn test_response_mismatch() {
        let res = Response::Fired(vec![Condition::Any]);
        assert!(matches!(res.into_reply(), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn test_describe() {
        let req = Request::Wait(vec![Condition::event("player"), Condition::timeout_ms(10)]);
        assert_eq!(req.describe(), "wait [player, TIMEOUT(10ms)]");
        assert_eq!(Request::from(Command::new("status")).describe(), "command status");
    }
}
