use std::{io, path::PathBuf};

use crate::handle::AddressFamily;

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by handle operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport-level failure reported by the operating system
    #[error("socket operation failed: {0}")]
    Io(#[from] io::Error),

    /// Failure reported by the TLS library
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The TLS handshake did not complete
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] Box<Error>),

    /// A certificate or key file could not be read or parsed
    #[error("failed to load {}: {source}", .path.display())]
    Certificate {
        /// File that failed to load
        path:   PathBuf,
        /// Underlying cause
        #[source]
        source: io::Error,
    },

    /// The external certificate generator did not produce a certificate
    #[error("self-signed certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// The host is not an IP literal of the handle's family
    #[error("'{host}' is not a valid {family} address")]
    InvalidAddress {
        /// Textual host as given by the caller
        host:   String,
        /// Family the handle was created with
        family: AddressFamily,
    },

    /// The operation is not valid for the handle's transport or state
    #[error("invalid operation: {0}")]
    Misuse(&'static str),

    /// The handle has already been closed
    #[error("handle is closed")]
    Closed,

    /// `send_all` stopped before every byte was accepted by the transport
    #[error("send stopped after {sent} of {total} bytes ({queued} queued): {source}")]
    Incomplete {
        /// Bytes confirmed accepted by the transport
        sent:   usize,
        /// Bytes following `sent` still held by the TLS session; they are
        /// delivered ahead of the next write, or dropped on close
        queued: usize,
        /// Bytes the caller asked to send
        total:  usize,
        /// Why the failing call stopped
        #[source]
        source: Box<Error>,
    },

    /// Hostname lookup produced no address of the requested family
    #[error("could not resolve '{host}' to an {family} address")]
    Resolve {
        /// Hostname that was looked up
        host:   String,
        /// Requested family
        family: AddressFamily,
    },
}

/// The most recent failure recorded on a handle.
///
/// OS errors keep their errno, TLS errors keep the library's own error value
/// and protocol misuse carries no code at all.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCode {
    /// Raw OS error number
    Os(i32),
    /// I/O failure without an OS error number (e.g. unexpected EOF)
    Io(io::ErrorKind),
    /// Error raised by the TLS library
    Tls(rustls::Error),
    /// Misuse of the API; no specific code
    Misuse,
}

impl Error {
    /// Collapses the error into the code recorded on the handle
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(e) | Error::Certificate { source: e, .. } => io_code(e),
            Error::Tls(e) => ErrorCode::Tls(e.clone()),
            Error::Handshake(inner) | Error::Incomplete { source: inner, .. } => inner.code(),
            Error::CertificateGeneration(_) => ErrorCode::Io(io::ErrorKind::NotFound),
            Error::Resolve { .. } => ErrorCode::Io(io::ErrorKind::NotFound),
            Error::InvalidAddress { .. } => ErrorCode::Io(io::ErrorKind::InvalidInput),
            Error::Misuse(_) | Error::Closed => ErrorCode::Misuse,
        }
    }

    /// Returns the underlying I/O error kind, looking through wrappers
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Io(e) | Error::Certificate { source: e, .. } => Some(e.kind()),
            Error::Handshake(inner) | Error::Incomplete { source: inner, .. } => inner.io_kind(),
            _ => None,
        }
    }

    /// True for the would-block and timeout conditions of non-blocking or
    /// timed-out sockets
    pub fn is_would_block(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::WouldBlock) | Some(io::ErrorKind::TimedOut)
        )
    }
}

fn io_code(e: &io::Error) -> ErrorCode {
    match e.raw_os_error() {
        Some(errno) => ErrorCode::Os(errno),
        None => ErrorCode::Io(e.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_keep_their_errno() {
        let err = Error::Io(io::Error::from_raw_os_error(98));
        assert_eq!(err.code(), ErrorCode::Os(98));
    }

    #[test]
    fn incomplete_reports_the_inner_code() {
        let err = Error::Incomplete {
            sent:   3,
            queued: 0,
            total:  10,
            source: Box::new(Error::Io(io::ErrorKind::WriteZero.into())),
        };
        assert_eq!(err.code(), ErrorCode::Io(io::ErrorKind::WriteZero));
        assert!(err.to_string().contains("3 of 10"));
    }

    #[test]
    fn misuse_has_no_code() {
        assert_eq!(Error::Misuse("listen on datagram").code(), ErrorCode::Misuse);
        assert_eq!(Error::Closed.code(), ErrorCode::Misuse);
    }

    #[test]
    fn timeouts_count_as_would_block() {
        let err = Error::Handshake(Box::new(Error::Io(io::ErrorKind::TimedOut.into())));
        assert!(err.is_would_block());
        assert!(!Error::Closed.is_would_block());
    }
}
