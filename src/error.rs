//! Error types for the FastCGI engine.
//!
//! Protocol refusals (`Overloaded`, `CantMultiplexConnections`, `UnknownRole`)
//! are answered on the wire and never surface here.

use thiserror::Error;

/// Errors produced while decoding or encoding name/value pair streams.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameValueError {
    /// A length prefix or the bytes it announces run past the end of the buffer.
    #[error("name/value pair at offset {offset} runs past the end of the buffer")]
    OutOfBounds { offset: usize },

    /// A name or value is too long to be described by a 31-bit length.
    #[error("name/value string of {0} bytes exceeds the 31-bit length limit")]
    TooLong(usize),
}

/// Main error type for the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the stream in the middle of a record.
    #[error("connection closed mid-record")]
    Truncated,

    /// The peer broke a connection-level protocol rule.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No record arrived within the configured idle timeout.
    #[error("connection idle for longer than {0:?}")]
    IdleTimeout(std::time::Duration),

    /// The connection was refused because the server is at capacity.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// An admission setting was given an out-of-range value.
    #[error("invalid setting: {0}")]
    InvalidSetting(&'static str),

    /// The server was started twice or stopped before starting.
    #[error("server state: {0}")]
    State(&'static str),
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
