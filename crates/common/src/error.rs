//! Common error types for VIP manager components.

use std::fmt;

/// A specialized Result type for VIP manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for VIP manager operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command `{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new command failure.
    pub fn command_failed(command: impl fmt::Display, stderr: impl fmt::Display) -> Self {
        Error::CommandFailed {
            command: command.to_string(),
            stderr: stderr.to_string().trim().to_string(),
        }
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }

    /// True when a failed command reported that its target already exists.
    ///
    /// `ip` and `tc` both print "File exists" when asked to add an
    /// address, route or qdisc that is already installed.
    pub fn is_already_present(&self) -> bool {
        matches!(self, Error::CommandFailed { stderr, .. } if stderr.contains("File exists"))
    }

    /// True when a failed command reported that its target is already gone.
    pub fn is_already_absent(&self) -> bool {
        const ABSENT: [&str; 4] = [
            "Cannot assign requested address",
            "No such process",
            "No such file or directory",
            "Cannot find specified qdisc",
        ];
        matches!(self, Error::CommandFailed { stderr, .. } if ABSENT.iter().any(|m| stderr.contains(m)))
    }
}
