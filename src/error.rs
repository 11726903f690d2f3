//! Define the general purpose ATDomeError enumeration.

use std::{io, result, time::Duration};

use thiserror::Error;

pub type ATDomeResult<T> = result::Result<T, ATDomeError>;

/// Error code reported when the connection to the controller cannot be
/// opened.
pub const ERROR_CODE_CONNECT: i64 = 1;
/// Error code reported when a read times out or the controller closes the
/// stream while a reply is pending.
pub const ERROR_CODE_READ: i64 = 2;

#[derive(Debug, Error)]
pub enum ATDomeError {
    #[error("Could not open connection to host={host}, port={port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("Timed out after {0:?} waiting for the controller.")]
    ReadTimeout(Duration),
    #[error("Controller closed the stream while a reply was pending.")]
    UnexpectedStreamEnd,
    #[error("Command {command:?} got {got} lines; expected {expected}.")]
    LineCount {
        command: String,
        got: usize,
        expected: usize,
    },
    #[error("Malformed status: {0}")]
    MalformedStatus(String),
    #[error("Could not resolve door state: {0}.")]
    InvalidMoveCode(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Not connected to the dome controller.")]
    NotConnected,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Regex(#[from] regex::Error),
    #[error(transparent)]
    Avro(#[from] apache_avro::Error),
}

impl ATDomeError {
    pub fn rejected(reason: impl Into<String>) -> ATDomeError {
        ATDomeError::Rejected(reason.into())
    }

    pub fn malformed(reason: impl Into<String>) -> ATDomeError {
        ATDomeError::MalformedStatus(reason.into())
    }

    /// Does this error mean the connection no longer exists?
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ATDomeError::ReadTimeout(_) | ATDomeError::UnexpectedStreamEnd | ATDomeError::Io(_)
        )
    }

    /// Fault code to publish for this error, if it is a transport fault.
    pub fn error_code(&self) -> Option<i64> {
        match self {
            ATDomeError::Connect { .. } => Some(ERROR_CODE_CONNECT),
            err if err.is_connection_fatal() => Some(ERROR_CODE_READ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let connect = ATDomeError::Connect {
            host: "localhost".to_owned(),
            port: 1,
            reason: "refused".to_owned(),
        };
        assert_eq!(connect.error_code(), Some(ERROR_CODE_CONNECT));
        assert!(!connect.is_connection_fatal());

        let timeout = ATDomeError::ReadTimeout(Duration::from_secs(1));
        assert_eq!(timeout.error_code(), Some(ERROR_CODE_READ));
        assert!(timeout.is_connection_fatal());

        assert_eq!(ATDomeError::UnexpectedStreamEnd.error_code(), Some(2));

        let line_count = ATDomeError::LineCount {
            command: "?".to_owned(),
            got: 4,
            expected: 5,
        };
        assert!(!line_count.is_connection_fatal());
        assert_eq!(line_count.error_code(), None);
        assert_eq!(ATDomeError::rejected("homing").error_code(), None);
    }

    #[test]
    fn test_error_message() {
        let err = ATDomeError::LineCount {
            command: "?".to_owned(),
            got: 4,
            expected: 5,
        };
        assert_eq!(err.to_string(), "Command \"?\" got 4 lines; expected 5.");
    }
}
