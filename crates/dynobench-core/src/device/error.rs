//! Device errors

use thiserror::Error;

/// Errors that can occur while driving a bench
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Transport could not be opened
    #[error("failed to open {dsn}: {reason}")]
    Open {
        /// Connection string
        dsn: String,
        /// Underlying failure
        reason: String,
    },

    /// No session is running
    #[error("transport is not open")]
    NotOpen,

    /// Writing a command line failed
    #[error("transport write failed: {0}")]
    Write(#[from] std::io::Error),

    /// The bench closed the link
    #[error("transport closed by the bench")]
    TransportClosed,

    /// No response before the deadline
    #[error("control timeout: no response to '{command}' within {timeout_ms}ms")]
    ControlTimeout {
        /// Command name
        command: &'static str,
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// A fire-and-forget line could not be written in time
    #[error("write timeout: '{command}' not sent within {timeout_ms}ms")]
    WriteTimeout {
        /// Command name
        command: &'static str,
        /// Limit that elapsed
        timeout_ms: u64,
    },

    /// Name not in the capability set
    #[error("no such control command: {0}")]
    UnknownCommand(String),

    /// Wrong number of arguments
    #[error("'{command}' takes {expected} argument(s), got {got}")]
    Arity {
        /// Command name
        command: &'static str,
        /// Arguments the command takes
        expected: usize,
        /// Arguments supplied
        got: usize,
    },

    /// Argument is not an integer
    #[error("'{command}' expects an integer argument, got '{value}'")]
    InvalidArgument {
        /// Command name
        command: &'static str,
        /// Offending argument
        value: String,
    },

    /// The session ended while the command was pending
    #[error("session cancelled")]
    Cancelled,

    /// The connect callback failed
    #[error("connect callback failed: {0:#}")]
    Callback(anyhow::Error),
}
