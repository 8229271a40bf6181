// Definition of modules --------------------------------------------------------------------------

pub mod board;
pub mod class;
pub mod device;
pub mod firmware;
pub mod message;
pub mod model;
pub mod monitor;
pub mod task;

use std::time::{Duration, Instant};

use thiserror::Error;

// Error ------------------------------------------------------------------------------------------

///
/// Teensyboot error enumeration.
///
/// This enumeration specifies the different errors which can occur in the board toolkit api.
/// Most variants carry a message describing the failure; the kind is stable and can be mapped
/// to a negative integer code for non-Rust consumers (see [`Error::code`]).
///
#[derive(Error, Debug, PartialEq, Clone)]
pub enum Error {
    /// Out of memory
    #[error("Memory error")]
    Memory,

    /// Invalid parameter
    #[error("{0}")]
    Param(String),

    /// Option or operation not supported
    #[error("{0}")]
    Unsupported(String),

    /// Device, board or file not found
    #[error("{0}")]
    NotFound(String),

    /// Something already exists
    #[error("{0}")]
    Exists(String),

    /// Permission problem
    #[error("{0}")]
    Access(String),

    /// Resource is busy, e.g. a board already running a task
    #[error("{0}")]
    Busy(String),

    /// Input/output failure
    #[error("{0}")]
    Io(String),

    /// Capability unavailable in the current board mode
    #[error("{0}")]
    Mode(String),

    /// Operation timed out
    #[error("{0}")]
    Timeout(String),

    /// Value or size out of range
    #[error("{0}")]
    Range(String),

    /// Operating system error
    #[error("{0}")]
    System(String),

    /// File format parse error
    #[error("{0}")]
    Parse(String),

    /// Any other error
    #[error("{0}")]
    Other(String),
}

///
/// Payload-free error discriminant.
///
/// Used by the error-mask stack and by callers which only care about the
/// category of a failure.
///
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ErrorKind {
    Memory,
    Param,
    Unsupported,
    NotFound,
    Exists,
    Access,
    Busy,
    Io,
    Mode,
    Timeout,
    Range,
    System,
    Parse,
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Memory => ErrorKind::Memory,
            Error::Param(_) => ErrorKind::Param,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Exists(_) => ErrorKind::Exists,
            Error::Access(_) => ErrorKind::Access,
            Error::Busy(_) => ErrorKind::Busy,
            Error::Io(_) => ErrorKind::Io,
            Error::Mode(_) => ErrorKind::Mode,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Range(_) => ErrorKind::Range,
            Error::System(_) => ErrorKind::System,
            Error::Parse(_) => ErrorKind::Parse,
            Error::Other(_) => ErrorKind::Other,
        }
    }

    /// Stable negative integer code, identical for every message of the same kind.
    pub fn code(&self) -> i32 {
        self.kind().code()
    }
}

impl ErrorKind {
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Memory => -1,
            ErrorKind::Param => -2,
            ErrorKind::Unsupported => -3,
            ErrorKind::NotFound => -4,
            ErrorKind::Exists => -5,
            ErrorKind::Access => -6,
            ErrorKind::Busy => -7,
            ErrorKind::Io => -8,
            ErrorKind::Mode => -9,
            ErrorKind::Timeout => -10,
            ErrorKind::Range => -11,
            ErrorKind::System => -12,
            ErrorKind::Parse => -13,
            ErrorKind::Other => -14,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// Timeout helpers --------------------------------------------------------------------------------

/// Remaining time of a deadline started at `start`, `None` meaning no deadline at all.
/// An expired deadline returns `Some(0)` so blocking calls turn into polls.
pub(crate) fn adjust_timeout(timeout: Option<Duration>, start: Instant) -> Option<Duration> {
    timeout.map(|timeout| timeout.saturating_sub(start.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::Memory.code(), -1);
        assert_eq!(Error::Busy("busy".to_string()).code(), -7);
        assert_eq!(Error::Parse("bad".to_string()).code(), -13);
        assert_eq!(Error::Other("?".to_string()).code(), -14);
    }

    #[test]
    fn error_kind_matches_variant() {
        assert_eq!(Error::Timeout("t".to_string()).kind(), ErrorKind::Timeout);
        assert_eq!(Error::Range("r".to_string()).kind(), ErrorKind::Range);
    }

    #[test]
    fn adjust_timeout_saturates() {
        let start = Instant::now() - Duration::from_millis(100);
        let left = adjust_timeout(Some(Duration::from_millis(40)), start);
        assert_eq!(left, Some(Duration::ZERO));
        assert_eq!(adjust_timeout(None, start), None);
    }
}
