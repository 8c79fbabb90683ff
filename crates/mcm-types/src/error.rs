use thiserror::Error;

/// Errors produced by the connection subsystem.
///
/// Every internal failure is translated to one of these before it crosses a
/// component boundary; no panics or foreign error types escape. An embedding
/// CLI maps `Ok` to exit code 0 and any variant to exit code 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    /// The operation is not legal in the connection's current state.
    #[error("wrong state")]
    WrongState,

    /// A caller-supplied parameter failed validation.
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// The connection was already configured or established.
    #[error("already initialized")]
    AlreadyInitialized,

    /// Device or endpoint bring-up failed.
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Registering the buffer block with the fabric failed.
    #[error("memory registration failed: {0}")]
    MemoryRegistrationFailed(String),

    /// Posting a send work request failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Posting a receive work request or reaping a receive completion failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The operation was abandoned because the context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The operation did not complete within its deadline.
    #[error("timeout")]
    Timeout,

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A failure that fits no other category.
    #[error("general failure: {0}")]
    GeneralFailure(String),
}

/// The result type used throughout the connection subsystem.
pub type Result<T> = std::result::Result<T, ConnError>;

impl ConnError {
    /// Short lowercase name of the variant, stable across message changes.
    /// Used as a structured log field.
    pub fn name(&self) -> &'static str {
        match self {
            ConnError::WrongState => "wrong_state",
            ConnError::BadArgument(_) => "bad_argument",
            ConnError::AlreadyInitialized => "already_initialized",
            ConnError::InitializationFailed(_) => "initialization_failed",
            ConnError::MemoryRegistrationFailed(_) => "memory_registration_failed",
            ConnError::SendFailed(_) => "send_failed",
            ConnError::ReceiveFailed(_) => "receive_failed",
            ConnError::Cancelled => "cancelled",
            ConnError::Timeout => "timeout",
            ConnError::OutOfMemory => "out_of_memory",
            ConnError::GeneralFailure(_) => "general_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_wrong_state() {
        assert_eq!(ConnError::WrongState.to_string(), "wrong state");
    }

    #[test]
    fn test_display_bad_argument() {
        let err = ConnError::BadArgument("transfer_size is 0".into());
        assert_eq!(err.to_string(), "bad argument: transfer_size is 0");
    }

    #[test]
    fn test_display_send_failed() {
        let err = ConnError::SendFailed("post rejected".into());
        assert!(err.to_string().contains("post rejected"));
    }

    #[test]
    fn test_name_is_stable() {
        assert_eq!(ConnError::Cancelled.name(), "cancelled");
        assert_eq!(
            ConnError::MemoryRegistrationFailed("x".into()).name(),
            "memory_registration_failed"
        );
        assert_eq!(ConnError::Timeout.name(), "timeout");
    }

    #[test]
    fn test_equality_ignores_nothing() {
        // Message text participates in equality; identical variants compare equal.
        assert_eq!(ConnError::WrongState, ConnError::WrongState);
        assert_ne!(
            ConnError::SendFailed("a".into()),
            ConnError::SendFailed("b".into())
        );
    }
}
