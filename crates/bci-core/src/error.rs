//! Error handling for the acquisition stream
//!
//! One error type shared by every crate in the workspace. Transient conditions
//! (read timeouts, frame desync, sequence gaps, slow subscribers) are recovered
//! where they happen and never surface here.

use std::fmt;

/// Result type alias for acquisition operations
pub type BciResult<T> = Result<T, BciError>;

/// Error type for all acquisition operations
#[derive(Debug)]
#[non_exhaustive]
pub enum BciError {
    /// Non-timeout failure reading from or writing to the transport.
    /// Terminates the acquisition session.
    Transport {
        /// Operation that failed ("read", "write", "flush", "open")
        operation: &'static str,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Invalid configuration value, rejected before it reaches a task
    InvalidConfig {
        /// Description of the configuration error
        reason: String,
    },

    /// The device never answered the reset handshake with its ready banner
    ResetTimeout {
        /// How long the coordinator waited, in milliseconds
        waited_ms: u64,
    },

    /// A reset was requested while another one was still running
    ResetInProgress,

    /// A collaborating task has stopped and dropped its end of a channel
    ChannelClosed {
        /// Name of the channel or task that went away
        channel: &'static str,
    },

    /// The persistence collaborator refused a sample
    Sink {
        /// Sink error description
        reason: String,
    },

    /// Serialization of an outbound message failed
    Serialization {
        /// Serialization error description
        reason: String,
    },
}

impl fmt::Display for BciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BciError::Transport { operation, source } => {
                write!(f, "Transport {} failed: {}", operation, source)
            }
            BciError::InvalidConfig { reason } => {
                write!(f, "Invalid configuration: {}", reason)
            }
            BciError::ResetTimeout { waited_ms } => {
                write!(f, "Device did not send its ready banner within {}ms", waited_ms)
            }
            BciError::ResetInProgress => write!(f, "A device reset is already in progress"),
            BciError::ChannelClosed { channel } => {
                write!(f, "Channel closed: {}", channel)
            }
            BciError::Sink { reason } => write!(f, "Sample sink error: {}", reason),
            BciError::Serialization { reason } => {
                write!(f, "Serialization error: {}", reason)
            }
        }
    }
}

impl std::error::Error for BciError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BciError::Transport { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BciError {
    fn from(e: serde_json::Error) -> Self {
        BciError::Serialization { reason: e.to_string() }
    }
}

impl From<std::io::Error> for BciError {
    fn from(source: std::io::Error) -> Self {
        BciError::Transport { operation: "io", source }
    }
}

impl BciError {
    /// Wrap an I/O error raised by the given transport operation
    pub fn transport(operation: &'static str, source: std::io::Error) -> Self {
        BciError::Transport { operation, source }
    }

    /// True for errors that end the acquisition session
    pub fn is_fatal(&self) -> bool {
        matches!(self, BciError::Transport { .. } | BciError::ChannelClosed { .. })
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::BciError::InvalidConfig {
            reason: format!($($arg)*)
        }
    };
}
