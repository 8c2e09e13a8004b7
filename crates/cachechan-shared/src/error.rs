//! Error taxonomy shared by sender and receiver

use crate::MESSAGE_MAX_LEN;
use thiserror::Error;

/// Why a session ended before the message was complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Termination {
    /// `done` was raised while `msg_len` was still 0
    #[error("sender finished before publishing a length")]
    BeforeLength,
    /// `done` was raised after `received` of `expected` bits
    #[error("sender finished after {received} of {expected} bits")]
    MidTransmission {
        /// Bits collected before the abort (discarded)
        received: usize,
        /// Bits the session announced
        expected: usize,
    },
    /// The receiver was asked to stop before the message was complete
    #[error("receiver stopped before the message was complete")]
    Stopped,
}

/// Error type for channel sessions
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Sender exhausted its retry budget waiting for `ready`
    #[error("receiver not ready after {attempts} attempts")]
    ReceiverUnavailable {
        /// Number of polls performed
        attempts: u32,
    },

    /// A message length outside `1..=MESSAGE_MAX_LEN` was supplied or observed
    #[error("invalid message length {0} (expected 1..={max})", max = MESSAGE_MAX_LEN)]
    InvalidMessageLength(i64),

    /// The session ended early; no message is reconstructed
    #[error("session terminated early: {0}")]
    PrematureTermination(Termination),

    /// Shared memory or buffer allocation failed
    #[error("{context}: {source}")]
    ResourceFailure {
        /// What was being attempted
        context: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    /// Wrap an OS error with context
    pub fn resource(context: impl Into<String>, source: impl Into<std::io::Error>) -> Self {
        ChannelError::ResourceFailure {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Whether this error ends only the current session (the receiver keeps serving)
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidMessageLength(_) | ChannelError::PrematureTermination(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_length_message() {
        let err = ChannelError::InvalidMessageLength(129);
        assert_eq!(
            err.to_string(),
            "invalid message length 129 (expected 1..=128)"
        );
    }

    #[test]
    fn test_termination_display() {
        let err = ChannelError::PrematureTermination(Termination::MidTransmission {
            received: 3,
            expected: 16,
        });
        assert_eq!(
            err.to_string(),
            "session terminated early: sender finished after 3 of 16 bits"
        );
    }

    #[test]
    fn test_stopped_display() {
        let err = ChannelError::PrematureTermination(Termination::Stopped);
        assert_eq!(
            err.to_string(),
            "session terminated early: receiver stopped before the message was complete"
        );
    }

    #[test]
    fn test_session_error_classification() {
        assert!(ChannelError::InvalidMessageLength(0).is_session_error());
        assert!(ChannelError::PrematureTermination(Termination::BeforeLength).is_session_error());
        assert!(ChannelError::PrematureTermination(Termination::Stopped).is_session_error());
        assert!(!ChannelError::ReceiverUnavailable { attempts: 5 }.is_session_error());
        let io = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(!ChannelError::resource("shm_open /x", io).is_session_error());
    }
}
