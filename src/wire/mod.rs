//! Wire codec for the newline-delimited control protocol.
//!
//! Pure framing: bytes in, lines out; commands in, bytes out. No protocol
//! state lives here beyond buffers.
//!
//! ```text
//! client → server:  <command> [<arg> ...]\n
//! server → client:  OK MPD <version>\n            (greeting)
//!                   <key>: <value>\n ...          (reply data)
//!                   OK\n | ACK [e@i] {cmd} msg\n  (reply terminator)
//!                   changed: <category>\n         (idle reply data)
//! ```

mod codec;
mod line;

pub use codec::{encode, LineDecoder, OutputBuffer, DEFAULT_MAX_LINE_LENGTH};
pub use line::Line;

/// Verb that asks the server to report subsystem changes.
pub const IDLE: &str = "idle";

/// Verb that cancels an outstanding `idle`.
pub const NOIDLE: &str = "noidle";

/// Verb for the shared-secret exchange.
pub const PASSWORD: &str = "password";
