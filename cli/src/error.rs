use thiserror::Error;

use crate::variant::Variant;

/// Classified failure of an engine operation.
///
/// Every async operation resolves to a value or one of these; the poller
/// stores them on the log slot instead of propagating.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Detected locally; nothing was sent over the network.
    #[error("No active product is configured for {variant}")]
    NoProductConfigured { variant: Variant },

    /// The server rejected the request; `detail` is its text, verbatim.
    #[error("{detail}")]
    Validation { status: u16, detail: String },

    /// The capacity pre-check found no worker able to take the launch.
    #[error("{reason}. Try again later.")]
    NoCapacity { reason: String },

    #[error("Your session has expired or been revoked. Run `vpsdeck login` again.")]
    Unauthorized,

    #[error("Request failed ({0}). Check your connection and try again.")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Capacity,
    Unauthorized,
    Transport,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NoProductConfigured { .. } => ErrorKind::Configuration,
            EngineError::Validation { .. } => ErrorKind::Validation,
            EngineError::NoCapacity { .. } => ErrorKind::Capacity,
            EngineError::Unauthorized => ErrorKind::Unauthorized,
            EngineError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Transport("request timed out".to_string())
        } else if err.is_connect() {
            EngineError::Transport("could not connect to backend".to_string())
        } else if err.is_decode() {
            EngineError::Transport("unexpected response from backend".to_string())
        } else {
            EngineError::Transport(err.to_string())
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_is_verbatim() {
        let err = EngineError::Validation {
            status: 400,
            detail: "Insufficient coin balance".into(),
        };
        assert_eq!(err.to_string(), "Insufficient coin balance");
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_configuration_error_names_variant() {
        let err = EngineError::NoProductConfigured {
            variant: Variant::Windows,
        };
        assert_eq!(err.to_string(), "No active product is configured for windows");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_capacity_error_carries_reason() {
        let err = EngineError::NoCapacity {
            reason: "No tokens available".into(),
        };
        assert_eq!(err.to_string(), "No tokens available. Try again later.");
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_is_retryable() {
        assert!(EngineError::Transport("request timed out".into()).is_retryable());
    }
}
