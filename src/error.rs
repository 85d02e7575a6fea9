//! Error taxonomy for the session engine.
//!
//! Every request a task submits resolves to `Result<Response, EngineError>`.
//! Task bodies usually propagate these with `?` into `anyhow::Result`, and the
//! session inspects the final error with [`EngineError::is_quiet`] to decide
//! whether a closed task should be reported to the error hook.

/// An `ACK` reply from the server.
///
/// Wire form: `ACK [<code>@<index>] {<command>} <message>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckError {
    /// Protocol error code (e.g. `50` for "no such file").
    pub code: u32,
    /// Position of the failing command inside a command list.
    pub index: u32,
    /// Name of the command the server rejected.
    pub command: String,
    /// Human readable message.
    pub message: String,
}

impl AckError {
    /// Parse the body of an `ACK` line.
    ///
    /// Accepts the full line including the `ACK ` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Protocol`] if the line does not follow the
    /// `ACK [code@index] {command} message` layout.
    pub fn parse(line: &str) -> Result<Self, EngineError> {
        let malformed = || EngineError::Protocol(format!("Malformed ACK line: {line:?}"));

        let rest = line.strip_prefix("ACK [").ok_or_else(malformed)?;
        let (numbers, rest) = rest.split_once(']').ok_or_else(malformed)?;
        let (code, index) = numbers.split_once('@').ok_or_else(malformed)?;
        let code = code.parse().map_err(|_| malformed())?;
        let index = index.parse().map_err(|_| malformed())?;

        let rest = rest.trim_start().strip_prefix('{').ok_or_else(malformed)?;
        let (command, message) = rest.split_once('}').ok_or_else(malformed)?;

        Ok(Self {
            code,
            index,
            command: command.to_string(),
            message: message.trim_start().to_string(),
        })
    }
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.command.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {}: {}", self.code, self.command, self.message)
        }
    }
}

/// Errors delivered to a task at its suspension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The socket closed or errored, or the session was disconnected.
    ConnectionLost,
    /// The byte stream violated the protocol; the connection was dropped.
    Protocol(String),
    /// The server rejected a command with an `ACK` reply.
    Command(AckError),
    /// The task or its group was closed. Delivered once to a suspended
    /// body; the task is closed whether or not the body handles it.
    Cancelled,
    /// The engine API was used incorrectly (closed group, concurrent
    /// requests from one task, unencodable command).
    Invalid(String),
}

impl EngineError {
    /// Whether a task ending with this error closes without reporting.
    ///
    /// Connection loss and cancellation are the expected outcome of a dropped
    /// connection or a closed group.
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Cancelled)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost => write!(f, "Connection lost"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::Command(ack) => write!(f, "Command failed: {ack}"),
            Self::Cancelled => write!(f, "Task cancelled"),
            Self::Invalid(msg) => write!(f, "Invalid use: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<AckError> for EngineError {
    fn from(ack: AckError) -> Self {
        Self::Command(ack)
    }
}

/// Whether an error returned by a task body should close the task silently.
pub(crate) fn is_quiet_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EngineError>()
        .is_some_and(EngineError::is_quiet)
}
