//! Error types for molt.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the accept/drain lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error outside the accept path (binding, socket conversion).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Accepting on the listener failed for a reason other than a timeout
    /// or closure. Listener-level failures are fatal.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// A client went away between arriving in the backlog and being
    /// accepted. The listener itself is fine, so accepting continues.
    #[error("connection aborted before accept: {0}")]
    ConnectionAborted(#[source] std::io::Error),

    /// The listener was closed, typically by a handoff in progress.
    #[error("listener closed")]
    ListenerClosed,

    /// A single-use listener has already handed out its connection.
    #[error("single-use listener exhausted")]
    Exhausted,

    /// A serve routine failed with something other than [`Error::Exhausted`].
    #[error("serve failed: {0}")]
    Serve(String),

    /// Inherited listener state from a predecessor process is invalid.
    #[error("invalid inherited listener: {0}")]
    Inherit(String),

    /// Re-executing the current binary failed.
    #[error("re-exec failed: {0}")]
    Exec(#[source] std::io::Error),

    /// Registering or waiting on process signals failed.
    #[error("signal handling failed: {0}")]
    Signal(#[source] std::io::Error),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// The listener was still shared when it had to be handed off.
    #[error("listener still in use by {0} other owner(s)")]
    ListenerInUse(usize),
}

impl Error {
    /// Create a new serve error.
    pub fn serve(msg: impl Into<String>) -> Self {
        Self::Serve(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classify an error returned by `accept(2)`.
    ///
    /// Errors that mean the socket is gone become [`Error::ListenerClosed`],
    /// a peer that aborted before being accepted is
    /// [`Error::ConnectionAborted`], and everything else is [`Error::Accept`].
    pub fn from_accept(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK) => Self::ListenerClosed,
            Some(libc::ECONNABORTED) | Some(libc::EPROTO) => Self::ConnectionAborted(err),
            _ => Self::Accept(err),
        }
    }

    /// Whether a failed accept can simply be retried.
    pub fn is_retryable_accept(&self) -> bool {
        matches!(self, Self::ConnectionAborted(_))
    }

    /// Whether this is the single-use listener's exhaustion sentinel.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_closed_socket_errors_map_to_listener_closed() {
        for code in [libc::EBADF, libc::EINVAL, libc::ENOTSOCK] {
            let err = Error::from_accept(io::Error::from_raw_os_error(code));
            assert!(matches!(err, Error::ListenerClosed), "errno {code}");
        }
    }

    #[test]
    fn test_other_accept_errors_are_fatal() {
        let err = Error::from_accept(io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(err, Error::Accept(_)));

        let err = Error::from_accept(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, Error::Accept(_)));
        assert!(!err.is_retryable_accept());
    }

    #[test]
    fn test_aborted_peer_is_retryable() {
        for code in [libc::ECONNABORTED, libc::EPROTO] {
            let err = Error::from_accept(io::Error::from_raw_os_error(code));
            assert!(matches!(err, Error::ConnectionAborted(_)), "errno {code}");
            assert!(err.is_retryable_accept());
        }
    }

    #[test]
    fn test_exhausted_sentinel() {
        assert!(Error::Exhausted.is_exhausted());
        assert!(!Error::serve("nope").is_exhausted());
        assert_eq!(Error::Exhausted.to_string(), "single-use listener exhausted");
    }
}
