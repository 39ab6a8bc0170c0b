//! Shared error types.

use thiserror::Error;

/// Top-level error type for ddbus operations that are surfaced to callers.
#[derive(Error, Debug)]
pub enum DdError {
    /// The bus connection or one of its components could not be initialized.
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// The observer is already registered for this interface.
    #[error("Observer {observer} already registered for interface '{interface}'")]
    AlreadyRegistered {
        /// Interface the observer was registered for.
        interface: String,
        /// Stable id of the observer.
        observer: u64,
    },

    /// The object is not published by this provider.
    #[error("Object not published: {0}")]
    NotPublished(String),

    /// A transport primitive failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input from the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Alias for Result with DdError.
pub type DdResult<T> = Result<T, DdError>;

/// Terminal failure of a remote call, delivered through an invocation future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The call did not complete before its deadline.
    #[error("Call timed out")]
    Timeout,

    /// The remote side answered with an error reply.
    #[error("Remote error {name}: {description}")]
    Remote {
        /// Error name, e.g. `org.example.Error.Busy`.
        name: String,
        /// Human-readable description.
        description: String,
    },

    /// The call could not be dispatched locally.
    #[error("Local failure: {0}")]
    Local(String),

    /// The target object is no longer alive.
    #[error("Cannot call method on dead object")]
    DeadObject,

    /// The reply could not be decoded.
    #[error("Failed to unmarshal reply: {0}")]
    Unmarshal(String),

    /// The caller cancelled the call.
    #[error("Call cancelled")]
    Cancelled,
}

impl CallError {
    /// Well-known error name transports use to report a timed-out call.
    pub const TIMEOUT_ERROR_NAME: &'static str = "ddbus.Error.Timeout";

    /// Map an error reply to a `CallError`, recognising the timeout name.
    pub fn from_error_reply(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        if name == Self::TIMEOUT_ERROR_NAME {
            CallError::Timeout
        } else {
            CallError::Remote {
                name,
                description: description.into(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_reply_maps_to_timeout() {
        let err = CallError::from_error_reply(CallError::TIMEOUT_ERROR_NAME, "late");
        assert_eq!(err, CallError::Timeout);
    }

    #[test]
    fn test_remote_reply_keeps_name_and_description() {
        let err = CallError::from_error_reply("org.example.Busy", "try later");
        assert_eq!(err.to_string(), "Remote error org.example.Busy: try later");
    }

    #[test]
    fn test_already_registered_message() {
        let err = DdError::AlreadyRegistered {
            interface: "org.example.Door".to_string(),
            observer: 3,
        };
        assert!(err.to_string().contains("org.example.Door"));
    }
}
