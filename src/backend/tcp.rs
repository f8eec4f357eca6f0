use super::{reactor, AsyncRead, AsyncTcpListener, AsyncTcpStream, AsyncWrite, Interest};
use std::future::Future;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

pub struct TcpStream {
    stream: std::net::TcpStream,
    inner: reactor::Reactor,
}

impl TcpStream {
    pub fn connect(addr: &SocketAddr) -> ConnectFuture {
        ConnectFuture::new(addr)
    }

    /// Adopt an already-connected, non-blocking fd (used by socket import).
    pub fn from_raw_fd(fd: RawFd) -> io::Result<Self> {
        let stream = unsafe { std::net::TcpStream::from_raw_fd(fd) };
        stream.set_nonblocking(true)?;
        let inner = reactor::Reactor::new(fd, Interest::Readable);
        reactor::ReactorHandle::current().add(&inner)?;
        Ok(Self { stream, inner })
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    YieldForRetry::default().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            match self.stream.write(&buf[written..]) {
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    YieldForRetry::default().await;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Parks for exactly one poll, waking itself immediately, then resolves.
/// `Runtime::tick` repolls every pending task on any reactor readiness event
/// (it doesn't correlate a specific fd to a specific task), so a read/write
/// that hit `WouldBlock` only needs to yield back to the executor once and
/// get retried on the next tick -- unlike `std::future::pending()`, which
/// never resolves and would wedge the retry loop forever.
#[derive(Default)]
struct YieldForRetry(bool);

impl Future for YieldForRetry {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsyncTcpStream for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        self.stream.shutdown(how)
    }

    fn do_export(self) -> io::Result<RawFd> {
        // Reactor::drop would close the fd; disarm it first.
        std::mem::forget(self.inner);
        Ok(self.stream.into_raw_fd())
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context, buf: &mut [u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.read(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.write(buf) {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut().stream.flush() {
            Ok(()) => Poll::Ready(Ok(())),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<io::Result<()>> {
        match self.get_mut().stream.shutdown(std::net::Shutdown::Write) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl Unpin for TcpStream {}

pub struct ConnectFuture {
    stream: Option<std::net::TcpStream>,
    waker: Option<Waker>,
}

impl ConnectFuture {
    pub fn new(addr: &SocketAddr) -> Self {
        let stream = std::net::TcpStream::connect(addr).ok();
        Self { stream, waker: None }
    }
}

impl Future for ConnectFuture {
    type Output = io::Result<TcpStream>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.stream.take() {
            Some(stream) => {
                stream.set_nonblocking(true)?;
                let inner = reactor::Reactor::new(stream.as_raw_fd(), Interest::Writable);
                reactor::ReactorHandle::current().add(&inner)?;
                Poll::Ready(Ok(TcpStream { stream, inner }))
            }
            None => {
                self.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

pub struct TcpListener {
    listener: std::net::TcpListener,
}

impl TcpListener {
    pub fn bind(addr: &SocketAddr) -> io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl AsyncTcpListener for TcpListener {
    type Stream = TcpStream;

    fn accept(&self) -> AcceptFuture {
        AcceptFuture::new(self.listener.try_clone().expect("clone listener fd"))
    }
}

pub struct AcceptFuture {
    listener: std::net::TcpListener,
    waker: Option<Waker>,
}

impl AcceptFuture {
    pub fn new(listener: std::net::TcpListener) -> Self {
        Self { listener, waker: None }
    }
}

impl Future for AcceptFuture {
    type Output = io::Result<(TcpStream, SocketAddr)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                let inner = reactor::Reactor::new(stream.as_raw_fd(), Interest::Readable);
                reactor::ReactorHandle::current().add(&inner)?;
                Poll::Ready(Ok((TcpStream { stream, inner }, addr)))
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}
