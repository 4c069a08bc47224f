use std::io;

/// Result type for fallible host and connection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported synchronously to the caller.
///
/// Nothing on the receive path produces an `Error`; malformed traffic is dropped and reflected only
/// in [`Stats`](crate::Stats).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket setup or I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Header plus payload would exceed the configured MTU.
    #[error("payload of {size} bytes exceeds the maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// The connection has been torn down.
    #[error("connection is disconnected")]
    Disconnected,

    /// The host has not been started, or has been stopped.
    #[error("host is not running")]
    NotRunning,

    /// The host is already running.
    #[error("host is already running")]
    AlreadyRunning,
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
