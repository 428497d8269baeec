//! Error types for wmlink.
//!
//! All errors are strongly typed using thiserror. Send failures carry an
//! explicit [`FailureKind`] so the dispatcher can decide whether to retry
//! by matching on the tag instead of inspecting a message.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration errors. These are fatal at startup and never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error opening configuration file \"{path}\": {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("There are no types in the config file")]
    NoTypes,

    #[error("Invalid argument '{name}': {reason}")]
    InvalidArgument {
        name: String,
        reason: String,
    },

    #[error("Usage: {usage}")]
    Usage {
        usage: String,
    },
}

/// Errors raised while building URI or attribute filters.
#[derive(Debug, Error)]
pub enum PatternError {
    #[error("Cannot build a class filter from an empty class set")]
    EmptyClassSet,

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String,
    },
}

/// Failure to deliver the result of a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("Connection to the world model was lost before ticket {ticket} completed")]
    ConnectionLost {
        ticket: u32,
    },

    #[error("World model rejected ticket {ticket}: {reason}")]
    Rejected {
        ticket: u32,
        reason: String,
    },

    #[error("Could not send ticket {ticket}: {reason}")]
    SendFailed {
        ticket: u32,
        reason: String,
    },

    #[error("Connection is closed")]
    Closed,
}

/// Classification of a send failure, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Resource temporarily unavailable (local send buffer pressure).
    Transient,
    /// The frame could not be sent, but the connection is still usable.
    Permanent,
    /// The connection is gone.
    Fatal,
}

/// A classified send failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Error sending data over socket ({kind:?}): {message}")]
pub struct SendFailure {
    /// Classification used by retry logic.
    pub kind: FailureKind,
    /// Human readable detail.
    pub message: String,
}

impl SendFailure {
    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Creates a fatal failure.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
        }
    }

    /// Returns true if resending the same frame may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, FailureKind::Transient)
    }
}

/// Errors returned by the update dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Permanent send failure: {0}")]
    Permanent(SendFailure),

    #[error("Connection failure while sending: {0}")]
    Fatal(SendFailure),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        attempts: u64,
        last: SendFailure,
    },

    #[error("Connection lost while retrying after {attempts} attempts")]
    Disconnected {
        attempts: u64,
    },
}

/// Top-level error type for wmlink.
#[derive(Debug, Error)]
pub enum WmError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Send error: {0}")]
    Send(#[from] SendFailure),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Could not connect to the world model at {addr}: {message}")]
    ConnectFailed {
        addr: String,
        message: String,
    },
}

impl WmError {
    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a delivery error.
    #[must_use]
    pub const fn is_delivery(&self) -> bool {
        matches!(self, Self::Delivery(_))
    }

    /// Returns true if this came from the send path.
    #[must_use]
    pub const fn is_send(&self) -> bool {
        matches!(self, Self::Send(_) | Self::Dispatch(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Send(f) => f.is_transient(),
            Self::ConnectFailed { .. } => true,
            Self::Delivery(DeliveryError::ConnectionLost { .. }) => true,
            _ => false,
        }
    }
}

/// Result type alias for wmlink operations.
pub type WmResult<T> = Result<T, WmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_no_types() {
        let err = ConfigError::NoTypes;
        let msg = format!("{err}");
        assert!(msg.contains("no types"));
    }

    #[test]
    fn test_config_error_unreadable() {
        let err = ConfigError::Unreadable {
            path: PathBuf::from("/nope/types.conf"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("/nope/types.conf"));
    }

    #[test]
    fn test_send_failure_constructors() {
        assert!(SendFailure::transient("EAGAIN").is_transient());
        assert!(!SendFailure::permanent("bad frame").is_transient());
        assert_eq!(SendFailure::fatal("reset").kind, FailureKind::Fatal);
    }

    #[test]
    fn test_send_failure_display() {
        let err = SendFailure::transient("Resource temporarily unavailable");
        let msg = format!("{err}");
        assert!(msg.contains("Transient"));
        assert!(msg.contains("Resource temporarily unavailable"));
    }

    #[test]
    fn test_delivery_error_display() {
        let err = DeliveryError::ConnectionLost { ticket: 7 };
        assert!(format!("{err}").contains("ticket 7"));
    }

    #[test]
    fn test_wm_error_from_config() {
        let err: WmError = ConfigError::NoTypes.into();
        assert!(err.is_config());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_wm_error_retryable() {
        let err1: WmError = SendFailure::transient("busy").into();
        assert!(err1.is_send());
        assert!(err1.is_retryable());

        let err2: WmError = SendFailure::permanent("nope").into();
        assert!(!err2.is_retryable());

        let err3: WmError = DeliveryError::ConnectionLost { ticket: 1 }.into();
        assert!(err3.is_delivery());
        assert!(err3.is_retryable());

        let err4: WmError = DeliveryError::Closed.into();
        assert!(!err4.is_retryable());
    }

    #[test]
    fn test_wm_error_connect_failed() {
        let err = WmError::ConnectFailed {
            addr: "localhost:7010".to_string(),
            message: "Connection refused".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("localhost:7010"));
        assert!(msg.contains("Connection refused"));
        assert!(err.is_retryable());
        assert!(!err.is_delivery());
    }
}
