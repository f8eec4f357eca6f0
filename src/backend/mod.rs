//! Event-loop backend contract.
//!
//! Everything the socket core needs from an event loop is expressed as a
//! small trait surface: readiness-driven read/write, cached peer address
//! lookup, and fd export/import. Exactly one
//! implementation is compiled in; here it is an epoll/kqueue reactor driving
//! a single-threaded cooperative task executor. Swapping in io_uring or a
//! foreign runtime means implementing `AsyncRead`/`AsyncWrite`/`AsyncTcpStream`
//! for that backend and nothing else in this crate changes.

pub mod reactor;
pub mod task;
pub mod runtime;
pub mod tcp;

pub use reactor::{Reactor, ReactorHandle};
pub use task::{Executor, Task};
pub use runtime::Runtime;
pub use tcp::{AcceptFuture, ConnectFuture, TcpListener, TcpStream};

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

pub struct Token(pub usize);

/// Non-blocking byte source. Mirrors `do_read_start`/`do_read_stop`: a
/// pending read returns `Poll::Pending` and arranges a wakeup, it never
/// blocks the loop thread.
pub trait AsyncRead {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>>;
}

/// Non-blocking byte sink. `poll_write` returning `Ok(n)` with `n <
/// buf.len()` means the kernel accepted a short write and the caller is
/// expected to retry with the remainder (mirrors vectored write semantics of
/// `do_write`).
pub trait AsyncWrite {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>>;
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>>;
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>>;
}

/// A full duplex stream with a fd the backend can export/import and a peer
/// address it can report without entering the socket core's cache.
pub trait AsyncTcpStream: AsyncRead + AsyncWrite + Unpin {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()>;

    /// Detach the underlying fd from this backend's reactor so it can be
    /// handed to `do_import` on another loop. Returns the raw fd; the
    /// stream must not be used again afterward.
    fn do_export(self) -> io::Result<std::os::unix::io::RawFd>;
}

pub trait AsyncTcpListener: Unpin {
    type Stream: AsyncTcpStream + Unpin;
    fn accept(&self) -> AcceptFuture;
}
