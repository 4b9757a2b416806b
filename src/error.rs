//! The crate-wide error type.
//!
//! Every fallible operation in this crate reports one of the variants below.
//! The variants map onto a stable integer code space (see [`Error::code`])
//! so embedders that route errors across an FFI or IPC boundary can rely on
//! the numeric values never changing.

use std::io;

/// Errors reported by pipeline stages, codecs, the network sink and the
/// session worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Catch-all for failures with no more precise description.
    #[error("operation failed")]
    Generic,
    /// The requested function is not supported by this build or platform.
    #[error("function not implemented")]
    NoSys,
    /// A required reference or buffer was missing or unusable.
    #[error("bad address")]
    Fault,
    /// An argument value was out of range or otherwise invalid.
    #[error("invalid argument")]
    Inval,
    /// An allocation failed or a bounded buffer can not grow any further.
    #[error("out of memory")]
    Nomem,
    /// The resource is temporarily unavailable.
    #[error("resource busy")]
    Busy,
    /// The remote server rejected our credentials.
    #[error("permission denied")]
    Perm,
    /// The remote server refused the connection.
    #[error("connection refused")]
    ConnRefused,
    /// The operation requires an unconnected client but it is connected.
    #[error("already connected")]
    Connected,
    /// The operation requires a connected client but it is not connected.
    #[error("not connected")]
    Unconnected,
    /// TLS was requested but is not available.
    #[error("TLS not available")]
    NoTls,
    /// The server presented a TLS certificate that could not be verified.
    #[error("bad TLS certificate")]
    TlsBadCert,
    /// Unknown request code.
    #[error("unknown request")]
    BadRqc,
    /// Nothing could be done right now; try again later.
    #[error("try again later")]
    Retry,
}

impl Error {
    /// Returns the stable integer code for this error.
    ///
    /// Success is `0` by convention; all error codes are negative.
    pub fn code(self) -> i32 {
        match self {
            Error::Generic => -1,
            Error::NoSys => -8,
            Error::Fault => -9,
            Error::Inval => -10,
            Error::Nomem => -11,
            Error::Busy => -12,
            Error::Perm => -13,
            Error::ConnRefused => -14,
            Error::Connected => -15,
            Error::Unconnected => -16,
            Error::NoTls => -17,
            Error::TlsBadCert => -18,
            Error::BadRqc => -19,
            Error::Retry => -20,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Error::Retry
            }
            io::ErrorKind::ConnectionRefused => Error::ConnRefused,
            io::ErrorKind::NotConnected => Error::Unconnected,
            io::ErrorKind::PermissionDenied => Error::Perm,
            io::ErrorKind::InvalidInput => Error::Inval,
            io::ErrorKind::OutOfMemory => Error::Nomem,
            io::ErrorKind::Unsupported => Error::NoSys,
            _ => Error::Generic,
        }
    }
}
