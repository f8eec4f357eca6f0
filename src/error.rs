//! The socket error catalog.
//!
//! Errors are reported by kind, not by a parsed message: `SocketError` is a
//! closed enum callers match on, with `Display` supplying stable text for
//! logging. There is no retry path for any of these -- every kind is fatal
//! to the socket that produced it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketError {
    /// Kernel-level read/write failure.
    Io,
    /// EOF observed mid-read.
    ClosedByPeer,
    /// connect() failed before any bytes were exchanged.
    ConnFail,
    /// Allocation failed while decoding TLS input.
    OutOfMemory,
    /// Peer has no certificate to offer (client-side check).
    SslNoCert,
    /// Certificate chain failed validation for a reason other than hostname.
    SslCertInvalid,
    /// Certificate validated but does not cover the requested hostname.
    SslCertNameMismatch,
    /// A TLS record failed to decrypt or parse.
    SslDecode,
    /// The TLS handshake failed for a reason other than a certificate problem.
    SslHandshakeFailure,
    /// Peer attempted renegotiation after the initial handshake.
    SslRenegotiationUnsupported,
}

impl SocketError {
    pub const fn as_str(self) -> &'static str {
        match self {
            SocketError::Io => "io",
            SocketError::ClosedByPeer => "closed_by_peer",
            SocketError::ConnFail => "conn_fail",
            SocketError::OutOfMemory => "out_of_memory",
            SocketError::SslNoCert => "ssl_no_cert",
            SocketError::SslCertInvalid => "ssl_cert_invalid",
            SocketError::SslCertNameMismatch => "ssl_cert_name_mismatch",
            SocketError::SslDecode => "ssl_decode",
            SocketError::SslHandshakeFailure => "ssl_handshake_failure",
            SocketError::SslRenegotiationUnsupported => "ssl_renegotiation_unsupported",
        }
    }

    /// Fatal to the socket in every case; kept as a predicate so call sites
    /// read like a lookup against the error catalog rather than hardcoding
    /// `true`.
    pub const fn is_fatal(self) -> bool {
        true
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SocketError {}

impl From<SocketError> for std::io::Error {
    fn from(e: SocketError) -> Self {
        let kind = match e {
            SocketError::ClosedByPeer => std::io::ErrorKind::UnexpectedEof,
            SocketError::Io | SocketError::ConnFail => std::io::ErrorKind::Other,
            _ => std::io::ErrorKind::InvalidData,
        };
        std::io::Error::new(kind, e)
    }
}

pub type Result<T> = std::result::Result<T, SocketError>;
