use std::fmt;
use std::io;
use std::result;

pub type Result<T> = result::Result<T, Error>;

/// Identifies one connected peer for the lifetime of a server run.
pub type SessionId = u32;

/// Error values returned by engine operations. `Wait` is the only non-fatal
/// kind: the operation could not make progress and should be retried on the
/// next readiness or pulse.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    Wait,
    OutOfMemory,
    BadArgument,
    BadData,
    DataNotFound,
    BadObject,
    AccessDenied,
    Timeout,
    Unimplemented,
    Io(io::ErrorKind),
}

impl Error {
    /// Short stable name, used in error replies sent back to clients.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Wait => "Wait",
            Error::OutOfMemory => "OutOfMemory",
            Error::BadArgument => "BadArgument",
            Error::BadData => "BadData",
            Error::DataNotFound => "DataNotFound",
            Error::BadObject => "BadObject",
            Error::AccessDenied => "AccessDenied",
            Error::Timeout => "Timeout",
            Error::Unimplemented => "Unimplemented",
            Error::Io(_) => "IOError",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(kind) => write!(f, "IOError({:?})", kind),
            other => f.write_str(other.name()),
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => Error::Wait,
            kind => Error::Io(kind),
        }
    }
}

pub trait ErrorUtils {
    /// True when the result is a hard failure. `Ok` and `Wait` both count as
    /// progress.
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for Result<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(Error::Wait) => false,
            _ => true,
        }
    }
}
