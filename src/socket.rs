//! C3: the socket core. Ties together a stream fd, the visible input
//! buffer, an optional TLS adapter, cached peer address, and
//! latency-optimization state behind one read/write/close surface -- a
//! caller driving a `Socket` never needs to know whether encryption is
//! active.
//!
//! Every suspendable step (waiting for bytes, waiting for a write to drain,
//! waiting on an async resumption answer) is an `await` point rather than a
//! registered callback; cancellation falls out of dropping the future.

use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::addr::PeerAddr;
use crate::backend::tcp::TcpStream;
use crate::backend::AsyncTcpStream;
use crate::buffer::ByteBuffer;
use crate::error::{Result, SocketError};
use crate::latency::LatencyState;
use crate::pool::RecordPool;
use crate::resumption::{ResumptionState, SharedResumptionStore};
use crate::tls::{HandshakeProgress, TlsAdapter, TlsClientConfig, TlsServerConfig};

const ENCRYPTED_READ_CHUNK: usize = 4096;
const SNAPSHOT_THRESHOLD: usize = 1024;
const DEFAULT_MINIMUM_RTT: Duration = Duration::from_millis(0);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which side of the handshake a TLS-active socket is playing. Only the
/// server side ever consults async resumption.
pub(crate) enum Role {
    Server,
    Client { #[allow(dead_code)] server_name: String },
}

/// The rustls config a rewound handshake rebuilds its engine from. Cloning
/// either variant is cheap: both wrap an `Arc` internally.
pub(crate) enum TlsConfig {
    Server(TlsServerConfig),
    Client(TlsClientConfig, String),
}

/// What one call to [`Socket::handshake_server`], [`Socket::handshake_client`],
/// or [`Socket::resume_server_handshake`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Application read/write may now proceed.
    Complete,
    /// An async resumption lookup was dispatched; call
    /// [`Socket::pending_resumption_key`] to find out what for, then later
    /// [`Socket::resume_server_handshake`] once an answer is available.
    AwaitingResumption,
}

pub(crate) struct Tls {
    pub(crate) adapter: TlsAdapter,
    pub(crate) role: Role,
    pub(crate) encrypted_input: ByteBuffer,
    pub(crate) outbound: RecordPool,
    /// Copy of `encrypted_input` taken while the async-resumption state is
    /// still `Record`, so a rewound handshake can replay the ClientHello
    /// into a freshly built engine.
    pub(crate) snapshot: Option<Vec<u8>>,
    pub(crate) resumption: Option<Arc<SharedResumptionStore>>,
    pub(crate) config: TlsConfig,
}

/// A stream socket: plaintext until [`Socket::handshake_server`] or
/// [`Socket::handshake_client`] is called, at which point reads and writes
/// are transparently routed through a TLS adapter.
pub struct Socket {
    pub(crate) socket_id: u64,
    pub(crate) stream: TcpStream,
    /// Plaintext-visible bytes: raw fd output when no TLS is active,
    /// decrypted application data otherwise.
    pub(crate) input: ByteBuffer,
    pub(crate) tls: Option<Tls>,
    pub(crate) peer_addr: Option<PeerAddr>,
    pub(crate) latency: LatencyState,
    pub(crate) write_in_flight: bool,
    pub(crate) closed: bool,
}

impl Socket {
    /// Wraps a freshly accepted connection. `peer_addr` is cached
    /// immediately since the backend already had it from `accept()`.
    pub fn from_accepted(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            socket_id: next_socket_id(),
            stream,
            input: ByteBuffer::new(),
            tls: None,
            peer_addr: Some(PeerAddr::from_socket_addr(peer_addr)),
            latency: LatencyState::new(),
            write_in_flight: false,
            closed: false,
        }
    }

    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(&addr).await.map_err(|_| SocketError::ConnFail)?;
        Ok(Self {
            socket_id: next_socket_id(),
            stream,
            input: ByteBuffer::new(),
            tls: None,
            peer_addr: None,
            latency: LatencyState::new(),
            write_in_flight: false,
            closed: false,
        })
    }

    pub fn socket_id(&self) -> u64 {
        self.socket_id
    }

    /// Cached peer address; queries and caches on first call.
    pub fn get_peername(&mut self) -> Result<PeerAddr> {
        if let Some(addr) = &self.peer_addr {
            return Ok(addr.clone());
        }
        let sa = self.stream.peer_addr().map_err(|_| SocketError::Io)?;
        let addr = PeerAddr::from_socket_addr(sa);
        self.peer_addr = Some(addr.clone());
        Ok(addr)
    }

    /// Overrides the cached peer address (proxy-protocol scenarios).
    pub fn set_peername(&mut self, addr: PeerAddr) {
        self.peer_addr = Some(addr);
    }

    pub fn get_ssl_session_reused(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.resumption.as_ref())
            .map(|store| store.session_reused(self.socket_id))
            .unwrap_or(false)
    }

    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.tls.as_ref().and_then(|t| t.adapter.alpn_protocol().map(|p| p.to_vec()))
    }

    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.tls.as_ref().and_then(|t| t.adapter.protocol_version())
    }

    /// The key a paused async resumption lookup was dispatched for, if any.
    pub fn pending_resumption_key(&self) -> Option<Vec<u8>> {
        self.tls.as_ref()?.resumption.as_ref()?.pending_key(self.socket_id)
    }

    fn move_pending_bytes_to_encrypted_input(&mut self, tls: &mut Tls) -> Result<()> {
        if self.input.is_empty() {
            return Ok(());
        }
        let pending = self.input.to_vec();
        self.input.clear();
        tls.encrypted_input.append(&pending).map_err(|_| SocketError::OutOfMemory)
    }

    /// Begins a server-side handshake. Any bytes already sitting in the
    /// visible input buffer are treated as pre-handshake ClientHello bytes
    /// and moved into the encrypted-input buffer before the engine is
    /// created.
    pub async fn handshake_server(
        &mut self,
        config: &TlsServerConfig,
        resumption: Arc<SharedResumptionStore>,
    ) -> Result<HandshakeOutcome> {
        let adapter = TlsAdapter::new_server(config, self.socket_id)?;
        let mut tls = Tls {
            adapter,
            role: Role::Server,
            encrypted_input: ByteBuffer::new(),
            outbound: RecordPool::new(),
            snapshot: None,
            resumption: Some(resumption),
            config: TlsConfig::Server(config.clone()),
        };
        self.move_pending_bytes_to_encrypted_input(&mut tls)?;
        self.tls = Some(tls);
        self.drive_handshake().await
    }

    pub async fn handshake_client(&mut self, config: &TlsClientConfig, server_name: &str) -> Result<HandshakeOutcome> {
        let adapter = TlsAdapter::new_client(config, server_name, self.socket_id)?;
        let mut tls = Tls {
            adapter,
            role: Role::Client { server_name: server_name.to_string() },
            encrypted_input: ByteBuffer::new(),
            outbound: RecordPool::new(),
            snapshot: None,
            resumption: None,
            config: TlsConfig::Client(config.clone(), server_name.to_string()),
        };
        self.move_pending_bytes_to_encrypted_input(&mut tls)?;
        self.tls = Some(tls);
        self.drive_handshake().await
    }

    /// Answers a paused async resumption lookup and re-drives the
    /// handshake. `session_data` is `None` for a cache miss (the handshake
    /// then runs to completion as a full handshake).
    pub async fn resume_server_handshake(&mut self, session_data: Option<Vec<u8>>) -> Result<HandshakeOutcome> {
        let store = self
            .tls
            .as_ref()
            .and_then(|t| t.resumption.clone())
            .ok_or(SocketError::SslHandshakeFailure)?;
        store.complete_with_data(self.socket_id, session_data);
        self.drive_handshake().await
    }

    /// Drains `encrypted_input` into the TLS engine one chunk at a time.
    /// While `track_snapshot` is set and the async-resumption state is still
    /// `Record`, each chunk is appended to `tls.snapshot` *before* it's
    /// handed to the engine, since `feed_ciphertext` is what consumes it --
    /// snapshotting after this loop would always see an empty buffer. A
    /// ClientHello spanning more than one `fill_encrypted_input` call
    /// accumulates across those calls this way instead of losing everything
    /// but the last chunk.
    ///
    /// `track_snapshot` must be `false` once the handshake has completed:
    /// `finish_handshake` removes this socket's bookkeeping from the
    /// resumption store, so `state_for` would otherwise read back the
    /// default `Record` state for every later application-data read and
    /// start recording (and eventually `force_complete`-ing) a connection
    /// that already finished its handshake.
    fn feed_all_buffered(&mut self, track_snapshot: bool) -> Result<()> {
        let socket_id = self.socket_id;
        let tls = self.tls.as_mut().expect("feed_all_buffered without tls state");
        let mut scratch = [0u8; ENCRYPTED_READ_CHUNK];
        loop {
            let n = tls.encrypted_input.read(&mut scratch);
            if n == 0 {
                break;
            }
            if track_snapshot && matches!(tls.role, Role::Server) {
                if let Some(store) = tls.resumption.clone() {
                    if store.state_for(socket_id) == ResumptionState::Record {
                        let recorded_so_far = tls.snapshot.as_ref().map_or(0, Vec::len);
                        if recorded_so_far + n > SNAPSHOT_THRESHOLD {
                            store.force_complete(socket_id);
                        } else {
                            tls.snapshot.get_or_insert_with(Vec::new).extend_from_slice(&scratch[..n]);
                        }
                    }
                }
            }
            tls.adapter.feed_ciphertext(&scratch[..n])?;
        }
        Ok(())
    }

    /// Tears down the handshake engine and rebuilds a fresh one from the
    /// same config, replaying the snapshotted ClientHello into its
    /// encrypted-input. Run once `proceed` reports `AwaitingResumption`.
    fn rewind_for_resumption(&mut self) -> Result<()> {
        let tls = self.tls.as_mut().expect("rewind without tls state");
        let snapshot = tls.snapshot.take().unwrap_or_default();
        let fresh = match &tls.config {
            TlsConfig::Server(cfg) => TlsAdapter::new_server(cfg, self.socket_id)?,
            TlsConfig::Client(..) => unreachable!("resumption rewind only happens on the server side"),
        };
        tls.adapter = fresh;
        tls.outbound.reset();
        tls.encrypted_input.clear();
        tls.encrypted_input.append(&snapshot).map_err(|_| SocketError::OutOfMemory)?;
        Ok(())
    }

    async fn flush_tls_outbound(&mut self) -> Result<()> {
        let records: Vec<Vec<u8>> = {
            let tls = self.tls.as_mut().expect("flush without tls state");
            let out: Vec<Vec<u8>> = tls.outbound.records().map(|r| r.to_vec()).collect();
            tls.outbound.reset();
            out
        };
        for record in records {
            self.stream.write_all(&record).await.map_err(|_| SocketError::Io)?;
        }
        Ok(())
    }

    async fn fill_encrypted_input(&mut self) -> Result<()> {
        let mut scratch = [0u8; ENCRYPTED_READ_CHUNK];
        let n = self.stream.read(&mut scratch).await.map_err(|_| SocketError::Io)?;
        if n == 0 {
            return Err(SocketError::ClosedByPeer);
        }
        let tls = self.tls.as_mut().expect("fill without tls state");
        tls.encrypted_input.append(&scratch[..n]).map_err(|_| SocketError::OutOfMemory)
    }

    fn finish_handshake(&mut self) -> Result<()> {
        let tls = self.tls.as_mut().expect("finish without tls state");
        tls.adapter.decode_ssl_input(&mut self.input)?;
        if let Some(store) = &tls.resumption {
            store.clear(self.socket_id);
        }
        Ok(())
    }

    async fn drive_handshake(&mut self) -> Result<HandshakeOutcome> {
        loop {
            self.feed_all_buffered(true)?;

            let tls = self.tls.as_mut().expect("drive_handshake without tls state");
            let resumption_ref = tls.resumption.as_deref();
            let progress = tls.adapter.proceed(resumption_ref)?;
            tls.adapter.drain_outbound(&mut tls.outbound)?;

            match progress {
                HandshakeProgress::AwaitingResumption => {
                    self.rewind_for_resumption()?;
                    return Ok(HandshakeOutcome::AwaitingResumption);
                }
                HandshakeProgress::Complete => {
                    self.flush_tls_outbound().await?;
                    self.finish_handshake()?;
                    return Ok(HandshakeOutcome::Complete);
                }
                HandshakeProgress::NeedsWrite => {
                    self.flush_tls_outbound().await?;
                }
                HandshakeProgress::NeedsRead => {
                    self.flush_tls_outbound().await?;
                    if self.tls.as_ref().expect("tls state disappeared").encrypted_input.is_empty() {
                        self.fill_encrypted_input().await?;
                    }
                }
            }
        }
    }

    /// Reads whatever bytes are newly available into the visible input
    /// buffer (decrypting first if TLS is active) and returns how many were
    /// appended. `Err(SocketError::ClosedByPeer)` on a clean EOF.
    pub async fn read(&mut self) -> Result<usize> {
        if self.tls.is_some() {
            self.read_tls().await
        } else {
            self.read_plain().await
        }
    }

    async fn read_plain(&mut self) -> Result<usize> {
        let mut scratch = [0u8; ENCRYPTED_READ_CHUNK];
        let n = self.stream.read(&mut scratch).await.map_err(|_| SocketError::Io)?;
        if n == 0 {
            return Err(SocketError::ClosedByPeer);
        }
        self.input.append(&scratch[..n]).map_err(|_| SocketError::OutOfMemory)?;
        Ok(n)
    }

    async fn read_tls(&mut self) -> Result<usize> {
        let mut scratch = [0u8; ENCRYPTED_READ_CHUNK];
        let n = self.stream.read(&mut scratch).await.map_err(|_| SocketError::Io)?;
        if n == 0 {
            return Err(SocketError::ClosedByPeer);
        }

        let tls = self.tls.as_mut().expect("read_tls without tls state");
        tls.encrypted_input.append(&scratch[..n]).map_err(|_| SocketError::OutOfMemory)?;

        self.feed_all_buffered(false)?;
        let tls = self.tls.as_mut().expect("read_tls without tls state");
        // Rustls rejects a post-handshake ClientHello as a protocol error at
        // this same call, which is how renegotiation attempts surface --
        // there's no separate in-read write-detection flag to maintain.
        tls.adapter.proceed(None)?;
        tls.adapter.decode_ssl_input(&mut self.input)
    }

    /// Enqueues a vectored write. Fails immediately if another write is
    /// already in flight -- a caller contract violation, not a retryable
    /// condition. An all-empty `bufs` succeeds trivially without touching
    /// the wire.
    pub async fn write(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        if self.write_in_flight {
            return Err(SocketError::Io);
        }
        if bufs.iter().all(|b| b.is_empty()) {
            return Ok(0);
        }
        self.write_in_flight = true;
        let result = if self.tls.is_some() { self.write_tls(bufs).await } else { self.write_plain(bufs).await };
        self.write_in_flight = false;
        result
    }

    async fn write_plain(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for b in bufs {
            self.stream.write_all(b).await.map_err(|_| SocketError::Io)?;
            total += b.len();
        }
        Ok(total)
    }

    async fn write_tls(&mut self, bufs: &[&[u8]]) -> Result<usize> {
        let fd = self.stream.as_raw_fd();
        let cipher_overhead = self.tls.as_ref().expect("write_tls without tls state").adapter.cipher_overhead();
        // Refresh the latency optimizer's telemetry-driven mode, then pick
        // this write's TLS record size from that mode.
        let _ = self.latency.prepare_for_latency_optimized_write(fd, DEFAULT_MINIMUM_RTT, cipher_overhead);
        let record_size = self.latency.ssl_record_size();

        let mut total = 0;
        for b in bufs {
            let tls = self.tls.as_mut().expect("write_tls without tls state");
            let n = tls.adapter.encrypt_write(b, record_size, &mut tls.outbound)?;
            if n < b.len() {
                tls.outbound.reset();
                self.flush_tls_outbound().await?;
                return Err(SocketError::SslHandshakeFailure);
            }
            total += n;
        }
        self.flush_tls_outbound().await?;
        Ok(total)
    }

    /// Orderly shutdown. If TLS is active and no write is in flight, sends
    /// `close_notify` and flushes it best-effort before disposing;
    /// otherwise disposes immediately. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.write_in_flight && self.tls.is_some() {
            let _ = self.shutdown_tls().await;
        }

        if let Some(tls) = self.tls.take() {
            if let Some(store) = &tls.resumption {
                store.clear(self.socket_id);
            }
        }
        self.input.clear();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }

    async fn shutdown_tls(&mut self) -> Result<()> {
        {
            let tls = self.tls.as_mut().expect("shutdown without tls state");
            tls.adapter.shutdown_ssl(&mut tls.outbound)?;
        }
        self.flush_tls_outbound().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::runtime::Runtime;
    use crate::backend::tcp::TcpListener;
    use crate::backend::AsyncTcpListener;
    use crate::resumption::{AsyncResumptionBackend, InMemoryResumptionBackend, SharedResumptionStore};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    fn self_signed_server_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap();
        (cert_der, key_der)
    }

    /// End-to-end scenario 1: accept, read "PING", write "PONG", close --
    /// no TLS involved. Server and client each run on their own loop (their
    /// own OS thread), the normal multi-core deployment shape this crate
    /// assumes per §5 -- a single `Socket` is never touched from two
    /// threads, but nothing stops two independent loops from talking to
    /// each other over a real TCP connection.
    #[test]
    fn plaintext_echo_round_trip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().expect("server runtime");
            rt.block_on(async move {
                let (stream, peer) = listener.accept().await.expect("accept");
                let mut sock = Socket::from_accepted(stream, peer);
                sock.read().await.expect("read ping");
                assert_eq!(sock.input.to_vec(), b"PING");
                sock.input.clear();
                sock.write(&[b"PONG"]).await.expect("write pong");
                sock.close().await.expect("close");
            });
        });

        let mut rt = Runtime::new().expect("client runtime");
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            sock.write(&[b"PING"]).await.expect("write ping");
            sock.read().await.expect("read pong");
            assert_eq!(sock.input.to_vec(), b"PONG");
            sock.close().await.expect("close");
        });

        server.join().expect("server thread panicked");
    }

    /// `write` with an all-empty buffer list succeeds trivially and never
    /// touches the wire (§8 boundary behavior), even against a stream with
    /// nothing listening on the other end.
    #[test]
    fn empty_write_succeeds_without_touching_the_wire() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().unwrap();
            rt.block_on(async move {
                let _ = listener.accept().await;
            });
        });

        let mut rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            let n = sock.write(&[]).await.expect("empty write");
            assert_eq!(n, 0);
            assert!(!sock.write_in_flight);
            sock.close().await.expect("close");
        });
        server.join().unwrap();
    }

    /// `close` is idempotent: a second call after teardown is a no-op
    /// rather than a panic or error.
    #[test]
    fn close_is_idempotent() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().unwrap();
            rt.block_on(async move {
                let _ = listener.accept().await;
            });
        });

        let mut rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            sock.close().await.expect("first close");
            sock.close().await.expect("second close is a no-op");
        });
        server.join().unwrap();
    }

    /// End-to-end scenario 2: a full TLS handshake with no resumption
    /// attempt completes and leaves the socket able to carry application
    /// data in both directions.
    #[test]
    fn tls_handshake_and_application_data_round_trip() {
        let (cert, key) = self_signed_server_cert();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();

        let server_resumption = Arc::new(SharedResumptionStore::new(Arc::new(InMemoryResumptionBackend::new())));
        let server_config =
            TlsServerConfig::from_certs_and_key(vec![cert.clone()], key, server_resumption.clone(), vec![])
                .expect("server config");

        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().expect("server runtime");
            rt.block_on(async move {
                let (stream, peer) = listener.accept().await.expect("accept");
                let mut sock = Socket::from_accepted(stream, peer);
                let outcome =
                    sock.handshake_server(&server_config, server_resumption).await.expect("server handshake");
                assert_eq!(outcome, HandshakeOutcome::Complete);

                sock.read().await.expect("read request");
                assert_eq!(sock.input.to_vec(), b"hello over tls");
                sock.input.clear();
                sock.write(&[b"hello back"]).await.expect("write response");
                sock.close().await.expect("close");
            });
        });

        let client_config = TlsClientConfig::with_trust_anchor(cert, vec![]).expect("client config");
        let mut rt = Runtime::new().expect("client runtime");
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            let outcome = sock.handshake_client(&client_config, "localhost").await.expect("client handshake");
            assert_eq!(outcome, HandshakeOutcome::Complete);
            assert!(sock.protocol_version().is_some());

            sock.write(&[b"hello over tls"]).await.expect("write request");
            sock.read().await.expect("read response");
            assert_eq!(sock.input.to_vec(), b"hello back");
            sock.close().await.expect("close");
        });

        server.join().expect("server thread panicked");
    }

    /// End-to-end scenario 4: a client handshaking against a cert that
    /// doesn't cover the requested hostname fails with the dedicated
    /// mismatch error, not a generic certificate error.
    #[test]
    fn client_handshake_fails_on_hostname_mismatch() {
        let (cert, key) = self_signed_server_cert();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();

        let server_resumption = Arc::new(SharedResumptionStore::new(Arc::new(InMemoryResumptionBackend::new())));
        let server_config =
            TlsServerConfig::from_certs_and_key(vec![cert.clone()], key, server_resumption.clone(), vec![])
                .expect("server config");

        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().expect("server runtime");
            rt.block_on(async move {
                let (stream, peer) = listener.accept().await.expect("accept");
                let mut sock = Socket::from_accepted(stream, peer);
                // The client is expected to abort before finishing the
                // handshake; tolerate either outcome here and let the
                // client-side assertion carry the test.
                let _ = sock.handshake_server(&server_config, server_resumption).await;
            });
        });

        let client_config = TlsClientConfig::with_trust_anchor(cert, vec![]).expect("client config");
        let mut rt = Runtime::new().expect("client runtime");
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            let err = sock
                .handshake_client(&client_config, "not-the-cert-name.example")
                .await
                .expect_err("hostname mismatch must fail the handshake");
            assert_eq!(err, SocketError::SslCertNameMismatch);
        });

        server.join().expect("server thread panicked");
    }

    /// End-to-end scenario 3: a second connection presenting the ticket
    /// issued by a first one pauses the server handshake for an external
    /// lookup (`AwaitingResumption`), then completes as a resumed session
    /// once that lookup answers. This is the `Record -> RequestSent ->
    /// Complete` state machine `resumption.rs` documents, exercised end to
    /// end rather than only unit-tested against a hand-populated store --
    /// it's what would have caught the snapshot-ordering bug in
    /// `feed_all_buffered`/`maybe_snapshot_for_resumption`.
    #[test]
    fn async_resumption_completes_second_handshake_after_external_lookup() {
        let (cert, key) = self_signed_server_cert();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();

        let backend = Arc::new(InMemoryResumptionBackend::new());
        let server_resumption = Arc::new(SharedResumptionStore::new(backend.clone()));
        let server_config =
            TlsServerConfig::from_certs_and_key(vec![cert.clone()], key, server_resumption.clone(), vec![])
                .expect("server config");

        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().expect("server runtime");
            rt.block_on(async move {
                // First connection: no ticket to present yet, so this just
                // runs to completion as an ordinary full handshake.
                let (stream, peer) = listener.accept().await.expect("accept 1");
                let mut sock = Socket::from_accepted(stream, peer);
                let outcome = sock
                    .handshake_server(&server_config, server_resumption.clone())
                    .await
                    .expect("first handshake");
                assert_eq!(outcome, HandshakeOutcome::Complete);
                sock.read().await.expect("read conn1 request");
                assert_eq!(sock.input.to_vec(), b"conn1");
                sock.input.clear();
                sock.write(&[b"conn1-ack"]).await.expect("write conn1 response");
                sock.close().await.expect("close conn1");

                // Second connection: the client now offers the ticket it
                // received after the first handshake, so the server's
                // session-get callback fires and the handshake pauses.
                let (stream, peer) = listener.accept().await.expect("accept 2");
                let mut sock = Socket::from_accepted(stream, peer);
                let outcome = sock
                    .handshake_server(&server_config, server_resumption.clone())
                    .await
                    .expect("second handshake, first phase");
                assert_eq!(outcome, HandshakeOutcome::AwaitingResumption);

                let key = sock.pending_resumption_key().expect("pending lookup key");
                let session_data = backend.lookup(&key);
                assert!(session_data.is_some(), "conn1 should have stored a ticket under this key");

                let outcome = sock.resume_server_handshake(session_data).await.expect("resumed handshake");
                assert_eq!(outcome, HandshakeOutcome::Complete);
                assert!(sock.get_ssl_session_reused(), "second handshake should report a reused session");

                sock.read().await.expect("read conn2 request");
                assert_eq!(sock.input.to_vec(), b"conn2");
                sock.input.clear();
                sock.write(&[b"conn2-ack"]).await.expect("write conn2 response");
                sock.close().await.expect("close conn2");
            });
        });

        // Reused across both connections so the client's ticket cache
        // (carried inside the shared `Arc<ClientConfig>`) survives from the
        // first handshake into the second.
        let client_config = TlsClientConfig::with_trust_anchor(cert, vec![]).expect("client config");
        let mut rt = Runtime::new().expect("client runtime");
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect 1");
            let outcome = sock.handshake_client(&client_config, "localhost").await.expect("client handshake 1");
            assert_eq!(outcome, HandshakeOutcome::Complete);
            sock.write(&[b"conn1"]).await.expect("write conn1 request");
            sock.read().await.expect("read conn1 response");
            assert_eq!(sock.input.to_vec(), b"conn1-ack");
            sock.close().await.expect("close conn1 client side");

            let mut sock = Socket::connect(local).await.expect("connect 2");
            let outcome = sock.handshake_client(&client_config, "localhost").await.expect("client handshake 2");
            assert_eq!(outcome, HandshakeOutcome::Complete);
            sock.write(&[b"conn2"]).await.expect("write conn2 request");
            sock.read().await.expect("read conn2 response");
            assert_eq!(sock.input.to_vec(), b"conn2-ack");
            sock.close().await.expect("close conn2 client side");
        });

        server.join().expect("server thread panicked");
    }

    /// C7: exporting and importing a plaintext socket preserves its
    /// already-buffered bytes and lets the imported socket keep reading.
    #[test]
    fn export_import_round_trip_preserves_buffered_bytes() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = TcpListener::bind(&addr).unwrap();
        let local = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let mut rt = Runtime::new().unwrap();
            rt.block_on(async move {
                let (stream, peer) = listener.accept().await.expect("accept");
                let mut sock = Socket::from_accepted(stream, peer);
                sock.read().await.expect("read first chunk");
                assert_eq!(sock.input.to_vec(), b"first-chunk");

                let snapshot = crate::export::export(sock).expect("export");
                let mut sock = crate::export::import(snapshot).expect("import");
                assert_eq!(sock.input.to_vec(), b"first-chunk");

                sock.read().await.expect("read second chunk after import");
                assert!(sock.input.to_vec().ends_with(b"second-chunk"));
                sock.close().await.expect("close");
            });
        });

        let mut rt = Runtime::new().unwrap();
        rt.block_on(async move {
            let mut sock = Socket::connect(local).await.expect("connect");
            sock.write(&[b"first-chunk"]).await.expect("write first chunk");
            // Give the server time to read and export/import before the
            // second chunk arrives, so it's read from the imported socket.
            std::thread::sleep(std::time::Duration::from_millis(50));
            sock.write(&[b"second-chunk"]).await.expect("write second chunk");
            sock.close().await.expect("close");
        });

        server.join().expect("server thread panicked");
    }
}
