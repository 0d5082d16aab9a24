use std::fmt;
use std::io;

/// Errors returned by runtime constructors.
///
/// Runtime invariant violations (wrong-thread access, epoll ADD/MOD
/// failures) are not represented here; they panic.
#[derive(Debug)]
pub enum Error {
    /// An underlying syscall failed.
    Io(io::Error),
    /// A component could not be brought up (bad address, thread handshake).
    Setup(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Setup(msg) => write!(f, "setup: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
