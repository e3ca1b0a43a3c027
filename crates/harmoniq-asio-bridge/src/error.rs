use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of [`BridgeError`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A shared object was missing or could not be mapped.
    ResourceUnavailable,
    /// The caller passed an out-of-range or missing argument.
    InvalidParameter,
    /// The call was valid but the driver is in the wrong state for it.
    PreconditionViolation,
    /// The session cannot continue.
    Fatal,
}

/// Errors produced by the shared-memory bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("control segment {} unavailable: {source}", path.display())]
    ControlSegmentUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("sample segment {} unavailable: {source}", path.display())]
    SampleSegmentUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("semaphore `{name}` unavailable: {source}")]
    SemaphoreUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("shared layout mismatch: expected {expected} bytes, found {actual}")]
    LayoutMismatch { expected: usize, actual: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("{0} not present")]
    NotPresent(&'static str),
    #[error("sample rate {0} Hz is not offered by this session")]
    NoClock(f64),
    #[error("peer did not answer the handshake within {0:?}")]
    PeerUnresponsive(Duration),
    #[error("handshake semaphore failed: {0}")]
    Semaphore(#[source] io::Error),
    #[error("failed to spawn callback thread: {0}")]
    ThreadSpawn(#[source] io::Error),
    #[error("invalid bridge configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn invalid(message: impl Into<String>) -> Self {
        BridgeError::InvalidParameter(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ControlSegmentUnavailable { .. }
            | BridgeError::SampleSegmentUnavailable { .. }
            | BridgeError::SemaphoreUnavailable { .. }
            | BridgeError::LayoutMismatch { .. } => ErrorKind::ResourceUnavailable,
            BridgeError::InvalidParameter(_) | BridgeError::Config(_) => {
                ErrorKind::InvalidParameter
            }
            BridgeError::NotPresent(_) | BridgeError::NoClock(_) => {
                ErrorKind::PreconditionViolation
            }
            BridgeError::PeerUnresponsive(_)
            | BridgeError::Semaphore(_)
            | BridgeError::ThreadSpawn(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_segments_are_resource_errors() {
        let err = BridgeError::ControlSegmentUnavailable {
            path: PathBuf::from("/dev/shm/harmoniq-bridge-info"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
        assert!(err.to_string().contains("harmoniq-bridge-info"));
    }

    #[test]
    fn state_errors_are_precondition_violations() {
        assert_eq!(
            BridgeError::NotPresent("host callbacks").kind(),
            ErrorKind::PreconditionViolation
        );
        assert_eq!(
            BridgeError::invalid("channel 9").kind(),
            ErrorKind::InvalidParameter
        );
    }
}
