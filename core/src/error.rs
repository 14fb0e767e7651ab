//! Link error types

use crate::bringup::Step;

/// ESP8266 link operation errors
///
/// `Mismatch` and `Timeout` belong to a single exchange and are absorbed
/// by the retry loop of the step that issued it. `RetryExhausted` ends a
/// step; on a mandatory step the pipeline reports `PipelineFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkError {
    /// A frame arrived but did not contain the expected marker
    Mismatch,
    /// No frame arrived before the deadline
    Timeout,
    /// A step failed on every attempt its budget allowed
    RetryExhausted(Step),
    /// Bring-up aborted on a mandatory step
    PipelineFailed(Step),
    /// The serial transmitter reported an error
    Serial,
    /// The modem reset line could not be driven
    ResetLine,
    /// A command built from configuration does not fit the command buffer
    CommandTooLong,
}

impl LinkError {
    /// Whether another attempt of the same step may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Mismatch | Self::Timeout | Self::Serial | Self::ResetLine
        )
    }
}

impl core::fmt::Display for LinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Mismatch => write!(f, "Response marker mismatch"),
            Self::Timeout => write!(f, "Response timeout"),
            Self::RetryExhausted(step) => write!(f, "Retries exhausted at {}", step),
            Self::PipelineFailed(step) => write!(f, "Bring-up failed at {}", step),
            Self::Serial => write!(f, "Serial transmit error"),
            Self::ResetLine => write!(f, "Reset line error"),
            Self::CommandTooLong => write!(f, "Command too long"),
        }
    }
}

// Implement core::error::Error for no_std compatibility
impl core::error::Error for LinkError {}

impl embedded_io_async::Error for LinkError {
    fn kind(&self) -> embedded_io_async::ErrorKind {
        match self {
            Self::Serial => embedded_io_async::ErrorKind::BrokenPipe,
            Self::Timeout => embedded_io_async::ErrorKind::TimedOut,
            Self::Mismatch => embedded_io_async::ErrorKind::InvalidData,
            Self::RetryExhausted(_) | Self::PipelineFailed(_) => {
                embedded_io_async::ErrorKind::NotConnected
            }
            _ => embedded_io_async::ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io_async::{Error, ErrorKind};

    #[test]
    fn test_transient_errors() {
        assert!(LinkError::Mismatch.is_transient());
        assert!(LinkError::Timeout.is_transient());
        assert!(LinkError::Serial.is_transient());
        assert!(!LinkError::CommandTooLong.is_transient());
        assert!(!LinkError::RetryExhausted(Step::DisableEcho).is_transient());
    }

    #[test]
    fn test_io_error_kind() {
        assert_eq!(LinkError::Timeout.kind(), ErrorKind::TimedOut);
        assert_eq!(LinkError::Serial.kind(), ErrorKind::BrokenPipe);
        assert_eq!(
            LinkError::PipelineFailed(Step::OpenTcp).kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(LinkError::CommandTooLong.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_display_names_step() {
        let text = format!("{}", LinkError::PipelineFailed(Step::JoinAccessPoint));
        assert_eq!(text, "Bring-up failed at join access point");
    }
}
