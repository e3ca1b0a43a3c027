use std::fmt;
use std::process::ExitCode;

use harmoniq_asio_bridge::BridgeError;

/// Why the server process stopped, each with its own exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Configuration, CLI or other setup failure.
    Setup,
    ControlSegment,
    SampleSegment,
    Semaphore,
    /// The audio device could not be opened or started.
    Activation,
    /// The audio backend stopped the stream underneath us.
    UpstreamShutdown,
}

impl ExitReason {
    pub fn code(self) -> u8 {
        match self {
            ExitReason::Setup => 1,
            ExitReason::ControlSegment => 2,
            ExitReason::SampleSegment => 3,
            ExitReason::Semaphore => 4,
            ExitReason::Activation => 5,
            ExitReason::UpstreamShutdown => 6,
        }
    }

    /// Classifies a failure to create the bridge session.
    pub fn from_session_error(err: &BridgeError) -> Self {
        match err {
            BridgeError::ControlSegmentUnavailable { .. } => ExitReason::ControlSegment,
            BridgeError::SampleSegmentUnavailable { .. } | BridgeError::LayoutMismatch { .. } => {
                ExitReason::SampleSegment
            }
            BridgeError::SemaphoreUnavailable { .. } => ExitReason::Semaphore,
            _ => ExitReason::Setup,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitReason::Setup => "setup failed",
            ExitReason::ControlSegment => "control segment unavailable",
            ExitReason::SampleSegment => "sample segment unavailable",
            ExitReason::Semaphore => "handshake semaphores unavailable",
            ExitReason::Activation => "audio device activation failed",
            ExitReason::UpstreamShutdown => "audio backend shut down",
        };
        f.write_str(label)
    }
}

impl From<ExitReason> for ExitCode {
    fn from(reason: ExitReason) -> Self {
        ExitCode::from(reason.code())
    }
}

/// An error tagged with the exit status it maps to.
#[derive(Debug)]
pub struct Failure {
    pub reason: ExitReason,
    pub error: anyhow::Error,
}

impl Failure {
    pub fn new(reason: ExitReason, error: impl Into<anyhow::Error>) -> Self {
        Self {
            reason,
            error: error.into(),
        }
    }
}

pub trait FailureExt<T> {
    fn exit_with(self, reason: ExitReason) -> Result<T, Failure>;
}

impl<T, E: Into<anyhow::Error>> FailureExt<T> for Result<T, E> {
    fn exit_with(self, reason: ExitReason) -> Result<T, Failure> {
        self.map_err(|err| Failure::new(reason, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;
    use std::path::PathBuf;

    #[test]
    fn exit_codes_are_distinct() {
        let reasons = [
            ExitReason::Setup,
            ExitReason::ControlSegment,
            ExitReason::SampleSegment,
            ExitReason::Semaphore,
            ExitReason::Activation,
            ExitReason::UpstreamShutdown,
        ];
        let codes: HashSet<u8> = reasons.iter().map(|r| r.code()).collect();
        assert_eq!(codes.len(), reasons.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn session_errors_map_to_named_reasons() {
        let missing = || io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(
            ExitReason::from_session_error(&BridgeError::ControlSegmentUnavailable {
                path: PathBuf::from("/dev/shm/x-info"),
                source: missing(),
            }),
            ExitReason::ControlSegment
        );
        assert_eq!(
            ExitReason::from_session_error(&BridgeError::SampleSegmentUnavailable {
                path: PathBuf::from("/dev/shm/x-buffers"),
                source: missing(),
            }),
            ExitReason::SampleSegment
        );
        assert_eq!(
            ExitReason::from_session_error(&BridgeError::SemaphoreUnavailable {
                name: "/x-ready".into(),
                source: missing(),
            }),
            ExitReason::Semaphore
        );
        assert_eq!(
            ExitReason::from_session_error(&BridgeError::Config("bad".into())),
            ExitReason::Setup
        );
    }
}
