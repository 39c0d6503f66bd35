//! Errors surfaced across the socket facade and the transport-layer glue.

use thiserror::Error;

/// POSIX-flavored error codes returned by the socket facade.
///
/// Variant names mirror the errno symbols named in the external
/// interface so that callers familiar with BSD sockets feel at home;
/// the value itself is carried as a typed `Result`, not a hidden
/// thread-local.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StcpError {
    #[error("bad file descriptor")]
    Ebadf,

    #[error("invalid argument")]
    Einval,

    #[error("too many open files")]
    Emfile,

    #[error("address family not supported")]
    Eaddrnotavail,

    #[error("socket is already connected")]
    Eisconn,

    #[error("socket is not connected")]
    Enotconn,

    #[error("bad address")]
    Efault,

    #[error("connection refused")]
    Econnrefused,

    #[error("software caused connection abort")]
    Econnaborted,

    #[error("I/O error: {0}")]
    Eio(String),
}

impl From<std::io::Error> for StcpError {
    fn from(err: std::io::Error) -> Self {
        StcpError::Eio(err.to_string())
    }
}

pub type StcpResult<T> = Result<T, StcpError>;
