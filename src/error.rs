//! Error types for the SSE client.

use crate::types::ConnectionState;
use thiserror::Error;

/// Error for invalid HTTP header configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Closed set of failure classes.
///
/// Every [`StreamError`] maps to exactly one kind; retry policies select the
/// kinds they retry by membership in a set of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// I/O or connection-level failure, including retryable HTTP statuses.
    Transport,
    /// The server closed the stream without an error.
    StreamEnded,
    /// The server sent something the client cannot interpret.
    Protocol,
    /// Illegal connection state transition.
    State,
    /// Every attempt allowed by the retry policy failed.
    RetryExhausted,
    /// A stale writer tried to mutate the delivery queue.
    QueueOwnership,
    /// Rejected configuration.
    Config,
    /// A spawned task panicked, was aborted, or could not be spawned.
    Task,
    /// The operation was stopped by `close()`.
    Cancelled,
}

/// Main error type for stream operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("stream ended by server")]
    StreamEnded,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("cannot {op} while {state}")]
    State {
        state: ConnectionState,
        op: &'static str,
    },

    #[error("gave up after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<StreamError>,
    },

    #[error("delivery queue can only be modified by its current writer")]
    QueueOwnership,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    InvalidHeader(#[from] InvalidHeaderError),

    #[error("task failure: {0}")]
    Task(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl StreamError {
    /// Create a transport error from anything displayable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        StreamError::Transport {
            message: message.to_string(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            StreamError::Transport { .. } => FailureKind::Transport,
            StreamError::Status { status, .. } => {
                if *status == 408 || *status == 429 || *status >= 500 {
                    FailureKind::Transport
                } else {
                    FailureKind::Protocol
                }
            }
            StreamError::StreamEnded => FailureKind::StreamEnded,
            StreamError::Protocol(_) => FailureKind::Protocol,
            StreamError::State { .. } => FailureKind::State,
            StreamError::RetryExhausted { .. } => FailureKind::RetryExhausted,
            StreamError::QueueOwnership => FailureKind::QueueOwnership,
            StreamError::InvalidConfig(_) | StreamError::InvalidHeader(_) => FailureKind::Config,
            StreamError::Task(_) => FailureKind::Task,
            StreamError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// HTTP status code if applicable
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::Status { status, .. } => Some(*status),
            StreamError::RetryExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }

    /// The last failure behind a [`StreamError::RetryExhausted`], or `self`.
    pub fn root(&self) -> &StreamError {
        match self {
            StreamError::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return StreamError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        StreamError::transport(err)
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::transport(err)
    }
}

impl From<tokio::task::JoinError> for StreamError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            StreamError::Task("task aborted".to_string())
        } else {
            StreamError::Task("task panicked".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = |status| StreamError::Status {
            status,
            url: "http://localhost/events".into(),
        };
        assert_eq!(err(503).kind(), FailureKind::Transport);
        assert_eq!(err(429).kind(), FailureKind::Transport);
        assert_eq!(err(408).kind(), FailureKind::Transport);
        assert_eq!(err(404).kind(), FailureKind::Protocol);
        assert_eq!(err(401).kind(), FailureKind::Protocol);
    }

    #[test]
    fn test_exhausted_root_and_status() {
        let err = StreamError::RetryExhausted {
            attempts: 3,
            last: Box::new(StreamError::Status {
                status: 502,
                url: String::new(),
            }),
        };
        assert_eq!(err.kind(), FailureKind::RetryExhausted);
        assert_eq!(err.status_code(), Some(502));
        assert_eq!(err.root().kind(), FailureKind::Transport);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_state_error_message() {
        let err = StreamError::State {
            state: ConnectionState::Closed,
            op: "connect",
        };
        assert_eq!(err.to_string(), "cannot connect while closed");
    }
}
