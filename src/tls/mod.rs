//! C4: the TLS adapter and its handshake state machine.
//!
//! Unlike a `TlsStream<T>` that owns a transport and drives its own polling
//! loop, the adapter here is a pure byte-IO engine: it never touches a file
//! descriptor. `socket.rs` feeds it ciphertext read from the fd
//! ([`TlsAdapter::feed_ciphertext`]), drives the rustls state machine
//! ([`TlsAdapter::proceed`]), and pulls decrypted application data and
//! pending outbound records back out ([`TlsAdapter::decode_ssl_input`],
//! [`TlsAdapter::drain_outbound`]). This is a BIO-pair style split between
//! the socket core and the TLS session object, which never sees a raw
//! socket either.

mod config;

pub use config::{TlsClientConfig, TlsServerConfig};

use std::io::{self, Read, Write};

use crate::buffer::ByteBuffer;
use crate::error::{Result, SocketError};
use crate::latency::CipherOverhead;
use crate::pool::RecordPool;
use crate::resumption::{ResumptionGuard, ResumptionState, SharedResumptionStore};

const DRAIN_RECORD_BUF: usize = 16 * 1024;

/// Where one call to [`TlsAdapter::proceed`] left the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// `conn.is_handshaking()` is now false; TLS records may carry
    /// application data.
    Complete,
    /// More ciphertext must be read from the peer before the handshake can
    /// advance.
    NeedsRead,
    /// Outbound handshake records are pending; the socket core must flush
    /// `drain_outbound` before reading again.
    NeedsWrite,
    /// An async resumption lookup is in flight; the handshake is parked
    /// until the socket core calls
    /// [`crate::resumption::SharedResumptionStore::complete_with_data`] and
    /// retries with a freshly rebuilt adapter replaying the snapshotted
    /// ClientHello.
    AwaitingResumption,
}

pub struct TlsAdapter {
    conn: rustls::Connection,
    socket_id: u64,
}

impl TlsAdapter {
    pub fn new_server(config: &TlsServerConfig, socket_id: u64) -> Result<Self> {
        let conn = rustls::ServerConnection::new(config.inner().clone())
            .map_err(|_| SocketError::SslHandshakeFailure)?;
        Ok(Self { conn: rustls::Connection::Server(conn), socket_id })
    }

    pub fn new_client(config: &TlsClientConfig, server_name: &str, socket_id: u64) -> Result<Self> {
        let name: rustls::pki_types::ServerName<'static> = server_name
            .to_string()
            .try_into()
            .map_err(|_| SocketError::ConnFail)?;
        let conn = rustls::ClientConnection::new(config.inner().clone(), name)
            .map_err(|_| SocketError::SslHandshakeFailure)?;
        Ok(Self { conn: rustls::Connection::Client(conn), socket_id })
    }

    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Copies raw ciphertext read from the fd into rustls's input buffer.
    /// Does not itself advance the state machine; the caller always follows
    /// with [`Self::proceed`].
    pub fn feed_ciphertext(&mut self, data: &[u8]) -> Result<()> {
        let mut cursor = io::Cursor::new(data);
        self.conn.read_tls(&mut cursor).map_err(|_| SocketError::Io)?;
        Ok(())
    }

    /// The handshake-driving `proceed` step: processes whatever ciphertext
    /// has been fed so far. The resumption guard is held for the whole call
    /// because rustls's session-store callbacks (driven synchronously from
    /// inside `process_new_packets`) are the only place that needs to know
    /// which socket is asking. `resumption` is `None` for client
    /// connections, which never consult a session-get callback of their
    /// own.
    pub fn proceed(&mut self, resumption: Option<&SharedResumptionStore>) -> Result<HandshakeProgress> {
        let _guard = ResumptionGuard::enter(self.socket_id);
        match self.conn.process_new_packets() {
            Ok(_) => Ok(self.progress_after_packets(resumption)),
            Err(e) => Err(map_rustls_error(e)),
        }
    }

    fn progress_after_packets(&self, resumption: Option<&SharedResumptionStore>) -> HandshakeProgress {
        if let Some(store) = resumption {
            if store.state_for(self.socket_id) == ResumptionState::RequestSent {
                return HandshakeProgress::AwaitingResumption;
            }
        }
        if !self.conn.is_handshaking() {
            return HandshakeProgress::Complete;
        }
        if self.conn.wants_write() {
            HandshakeProgress::NeedsWrite
        } else {
            HandshakeProgress::NeedsRead
        }
    }

    /// Decode loop: drains decrypted application data into `out`.
    /// Returns the number of bytes appended. A `WouldBlock` from
    /// `reader().read()` just means no complete record is buffered yet --
    /// not an error.
    pub fn decode_ssl_input(&mut self, out: &mut ByteBuffer) -> Result<usize> {
        let mut total = 0;
        let mut scratch = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => {
                    out.append(&scratch[..n]).map_err(|_| SocketError::OutOfMemory)?;
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return Err(SocketError::SslDecode),
            }
        }
        Ok(total)
    }

    /// Write path: encrypts `plaintext` in chunks no larger than
    /// `record_size_hint` (as produced by
    /// [`crate::latency::LatencyState::ssl_record_size`]), staging the
    /// resulting TLS records into `pool`. Returns the number of plaintext
    /// bytes accepted.
    pub fn encrypt_write(&mut self, plaintext: &[u8], record_size_hint: usize, pool: &mut RecordPool) -> Result<usize> {
        if plaintext.is_empty() {
            return Ok(0);
        }
        let chunk = record_size_hint.max(1);
        let mut written = 0;
        while written < plaintext.len() {
            let take = chunk.min(plaintext.len() - written);
            match self.conn.writer().write(&plaintext[written..written + take]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(_) => return Err(SocketError::Io),
            }
        }
        self.drain_outbound(pool)?;
        Ok(written)
    }

    /// Pulls every fully-formed TLS record rustls has queued into `pool`.
    /// Called after both handshake progress and application writes, since
    /// both can produce outbound records: the outbound staging must be
    /// empty before any new application `write` is begun, so callers are
    /// expected to drain and flush before issuing the next write.
    pub fn drain_outbound(&mut self, pool: &mut RecordPool) -> Result<()> {
        let mut scratch = [0u8; DRAIN_RECORD_BUF];
        while self.conn.wants_write() {
            let mut cursor = io::Cursor::new(&mut scratch[..]);
            match self.conn.write_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => pool.push_record(&scratch[..n]),
                Err(_) => return Err(SocketError::Io),
            }
        }
        Ok(())
    }

    /// Sends `close_notify` and stages it for the socket core to
    /// flush. Idempotent -- rustls no-ops a second `send_close_notify`.
    pub fn shutdown_ssl(&mut self, pool: &mut RecordPool) -> Result<()> {
        self.conn.send_close_notify();
        self.drain_outbound(pool)
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }

    /// Resolves the negotiated cipher suite to its record overhead,
    /// with no fallthrough between AES-GCM and ChaCha20-Poly1305.
    pub fn cipher_overhead(&self) -> CipherOverhead {
        match self.conn.negotiated_cipher_suite() {
            Some(suite) => cipher_suite_overhead(suite.suite()),
            None => CipherOverhead::Unknown,
        }
    }
}

/// Explicit per-suite mapping: each enumerated cipher maps explicitly to
/// its overhead; an unrecognized cipher disables the optimization rather
/// than guessing. Limited to the suites rustls's default
/// `aws_lc_rs`/`ring` providers actually negotiate; anything else falls to
/// `Unknown` rather than being silently grouped with a similar-looking
/// cipher.
fn cipher_suite_overhead(suite: rustls::CipherSuite) -> CipherOverhead {
    use rustls::CipherSuite::*;
    match suite {
        TLS13_AES_128_GCM_SHA256 | TLS13_AES_256_GCM_SHA384 => CipherOverhead::Known(25),
        TLS13_CHACHA20_POLY1305_SHA256 => CipherOverhead::Known(21),
        TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
        | TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        | TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        | TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => CipherOverhead::Known(25),
        TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 | TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            CipherOverhead::Known(21)
        }
        _ => CipherOverhead::Unknown,
    }
}

/// Translates rustls's handshake/decode failures to the socket error
/// catalog. rustls validates the peer hostname as part of
/// `process_new_packets`, so the `NotValidForName` case is pulled out ahead
/// of the general `InvalidCertificate` arm to preserve that distinction.
fn map_rustls_error(err: rustls::Error) -> SocketError {
    use rustls::CertificateError;
    use rustls::Error::*;
    match err {
        InvalidCertificate(CertificateError::NotValidForName) => SocketError::SslCertNameMismatch,
        InvalidCertificate(_) => SocketError::SslCertInvalid,
        NoCertificatesPresented => SocketError::SslNoCert,
        DecryptError | PeerIncompatibleError(_) => SocketError::SslDecode,
        other => {
            // rustls 0.23 doesn't expose a dedicated renegotiation variant;
            // it reports a post-handshake ClientHello as a generic alert.
            // Match on the message rather than guess at an enum shape.
            if other.to_string().to_lowercase().contains("renegotiation") {
                SocketError::SslRenegotiationUnsupported
            } else {
                SocketError::SslHandshakeFailure
            }
        }
    }
}
