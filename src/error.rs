use std::error::Error;
use std::fmt;
use std::io;

use crate::core::connection::ReadyState;

#[derive(Debug)]
pub enum SockletError {
    // Framing/sequencing violations - fatal, force CLOSED with close code 1002
    Protocol(String),

    // Upgrade exchange failures - fatal at connect time, never retried
    Handshake(String),

    // Caller misuse, e.g. send while not OPEN - connection unaffected
    InvalidState(ReadyState),

    // wait_for_state target can no longer be reached because the
    // connection closed first
    Unreachable(ReadyState),

    // I/O failures - fatal, force CLOSED with close code 1006
    Transport(io::Error),

    // A listener panicked during dispatch - isolated, non-fatal
    Listener(String),

    // Configuration errors
    Config(String),
}

impl fmt::Display for SockletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            Self::Handshake(msg) => write!(f, "Handshake error: {}", msg),
            Self::InvalidState(state) => write!(f, "Invalid state: connection is {}", state),
            Self::Unreachable(target) => {
                write!(f, "State {} is unreachable: connection closed", target)
            }
            Self::Transport(err) => write!(f, "Transport error: {}", err),
            Self::Listener(msg) => write!(f, "Listener error: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for SockletError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SockletError {
    fn from(err: io::Error) -> Self {
        SockletError::Transport(err)
    }
}

// Generic result type for socklet
pub type Result<T> = std::result::Result<T, SockletError>;
