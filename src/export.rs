//! C7: moving a live socket -- fd, buffered bytes, and TLS state -- between
//! event loops without losing data.
//!
//! The TLS adapter never holds a reference back to the fd or the socket
//! object that owns it (it's a pure byte-IO engine, fed and drained by
//! whoever calls it), so there is no byte-IO back-end to "re-point" at
//! import time the way a callback-based engine would need: moving the
//! `Tls` struct into the new `Socket` is enough.

use std::os::unix::io::RawFd;

use crate::addr::PeerAddr;
use crate::backend::tcp::TcpStream;
use crate::backend::AsyncTcpStream;
use crate::buffer::ByteBuffer;
use crate::error::{Result, SocketError};
use crate::latency::LatencyState;
use crate::socket::{Socket, Tls};

/// A detached socket: owns its fd and buffers until [`import`] hands them to
/// a fresh `Socket`.
pub struct ExportSnapshot {
    fd: RawFd,
    input: ByteBuffer,
    tls: Option<Tls>,
    peer_addr: Option<PeerAddr>,
    socket_id: u64,
}

/// Detaches `socket` from its event loop. Fails if a write is in flight --
/// the same contract violation `write` itself rejects, since handing off a
/// socket mid-write would silently drop the in-flight bytes.
pub fn export(socket: Socket) -> Result<ExportSnapshot> {
    if socket.write_in_flight {
        return Err(SocketError::Io);
    }

    let Socket { stream, input, tls, peer_addr, socket_id, .. } = socket;
    let fd = stream.do_export().map_err(|_| SocketError::Io)?;

    Ok(ExportSnapshot { fd, input, tls, peer_addr, socket_id })
}

/// Adopts a detached socket into the calling loop.
pub fn import(snapshot: ExportSnapshot) -> Result<Socket> {
    let stream = TcpStream::from_raw_fd(snapshot.fd).map_err(|_| SocketError::Io)?;
    Ok(Socket {
        socket_id: snapshot.socket_id,
        stream,
        input: snapshot.input,
        tls: snapshot.tls,
        peer_addr: snapshot.peer_addr,
        latency: LatencyState::new(),
        write_in_flight: false,
        closed: false,
    })
}
