//! Classification of decoded protocol lines.

use crate::error::{AckError, EngineError};

/// A single decoded server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line<'a> {
    /// `OK MPD <version>` sent once after connecting.
    Greeting(&'a str),
    /// `OK`: the current reply completed successfully.
    Ok,
    /// `ACK ...`: the current reply failed.
    Ack(AckError),
    /// `changed: <category>` inside an idle reply.
    Changed(&'a str),
    /// Any other reply line.
    Data(&'a str),
}

impl<'a> Line<'a> {
    /// Classify a line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Protocol`] for a malformed `ACK` line.
    pub fn parse(line: &'a str) -> Result<Self, EngineError> {
        if line == "OK" {
            return Ok(Self::Ok);
        }
        if let Some(version) = line.strip_prefix("OK MPD ") {
            return Ok(Self::Greeting(version.trim()));
        }
        if line.starts_with("ACK ") {
            return AckError::parse(line).map(Self::Ack);
        }
        if let Some(category) = line.strip_prefix("changed: ") {
            return Ok(Self::Changed(category.trim()));
        }
        Ok(Self::Data(line))
    }
}
