//! idlewire - cooperative client engine for idle-capable line protocols.
//!
//! One [`Session`] owns one connection to an MPD-style server. Caller logic
//! runs as [`task`]s: plain `async` bodies that issue one request at a time
//! (a command, a condition wait, a batch, or a lookup of their own handle) and
//! are resumed with the result. While tasks wait for server events and no
//! command is outstanding, the session parks the connection in `idle` and
//! cancels it with `noidle` as soon as a command needs the wire.
//!
//! # Architecture
//!
//! - **Scheduler port** - the only contact with the host event loop
//! - **Wire codec** - line framing and command encoding
//! - **Requests** - what a task can ask for
//! - **Tasks / groups** - resumable bodies with shared lifecycle
//! - **Session** - connection state machine, queues, idle management
//!
//! # Modules
//!
//! - [`scheduler`] - [`SchedulerPort`], tokio and manual implementations
//! - [`wire`] - line decoder, output buffer, command encoder
//! - [`request`] - commands, conditions, replies
//! - [`task`] / [`group`] - task handles, contexts and groups
//! - [`session`] - the engine
//! - [`config`] - configuration loading/saving
//!
//! # Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use idlewire::{Command, Condition, Session, SessionConfig, TokioScheduler};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let session = Session::new(Rc::new(TokioScheduler::new()), SessionConfig::default());
//! session.connect("localhost", 6600, None)?;
//! session.spawn("now-playing", |ctx| async move {
//!     loop {
//!         let song = ctx.command(Command::new("currentsong")).await?;
//!         println!("{:?}", song.get("Title"));
//!         ctx.wait([Condition::event("player")]).await?;
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod wire;

// Re-export commonly used types
pub use config::SessionConfig;
pub use error::{AckError, EngineError};
pub use group::{spawn, HasTaskGroup, TaskGroup};
pub use request::{Command, Condition, Reply, Request, Response};
pub use scheduler::{ManualScheduler, SchedulerPort, TokioScheduler};
pub use session::{ConnectionState, Session, SessionStats};
pub use task::{TaskContext, TaskHandle, TaskId, TaskState};
