use super::{Interest, Token};
#[cfg(target_os = "macos")]
use libc::{EVFILT_READ, EVFILT_WRITE};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Mutex;

/// Per-fd registration. Readiness is delivered to the executor as a flat
/// `(Token, Interest)` list and matched back to whichever task is polling
/// that fd; this struct mainly exists to own the fd's lifetime so dropping
/// it closes the socket exactly once.
pub struct Reactor {
    fd: RawFd,
    interest: Interest,
    state: Mutex<ReactorState>,
}

#[derive(Default)]
struct ReactorState {
    armed: bool,
}

impl Reactor {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Self {
            fd,
            interest,
            state: Mutex::new(ReactorState::default()),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use libc::{epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLL_CLOEXEC, EPOLL_CTL_ADD};

    pub fn create_epoll() -> io::Result<RawFd> {
        let fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub fn add_fd(epoll_fd: RawFd, fd: RawFd, interest: &Interest) -> io::Result<()> {
        let mut event = epoll_event {
            events: match interest {
                Interest::Readable => (EPOLLIN | EPOLLERR | EPOLLHUP) as u32,
                Interest::Writable => (EPOLLOUT | EPOLLERR | EPOLLHUP) as u32,
            },
            u64: fd as u64,
        };

        unsafe {
            if epoll_ctl(epoll_fd, EPOLL_CTL_ADD, fd, &mut event) < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    pub fn wait(epoll_fd: RawFd, events: &mut [epoll_event], timeout: i32) -> io::Result<usize> {
        let n = unsafe { epoll_wait(epoll_fd, events.as_mut_ptr(), events.len() as i32, timeout) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::*;
    use libc::{kevent, kqueue, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_ENABLE, EV_ONESHOT};

    pub fn create_kqueue() -> io::Result<RawFd> {
        let fd = unsafe { kqueue() };
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub fn add_fd(kq: RawFd, fd: RawFd, interest: &Interest) -> io::Result<()> {
        let filter = match interest {
            Interest::Readable => EVFILT_READ,
            Interest::Writable => EVFILT_WRITE,
        };

        let event = kevent {
            ident: fd as usize,
            filter,
            flags: EV_ADD | EV_ENABLE | EV_ONESHOT,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };

        unsafe {
            if kevent(kq, &event, 1, std::ptr::null_mut(), 0, std::ptr::null()) < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    }

    pub fn wait(kq: RawFd, events: &mut [kevent], timeout: i32) -> io::Result<usize> {
        let ts = if timeout < 0 {
            None
        } else {
            Some(libc::timespec {
                tv_sec: (timeout / 1000) as i64,
                tv_nsec: ((timeout % 1000) * 1_000_000) as i64,
            })
        };

        let n = unsafe {
            kevent(
                kq,
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                ts.as_ref().map_or(std::ptr::null(), |t| t as *const _),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Linux epoll / macOS kqueue reactor handle. Exactly one of these backs a
/// `Runtime`; there is no provision for mixing backends within one loop.
#[cfg(target_os = "linux")]
pub struct ReactorHandle {
    epoll_fd: RawFd,
}

#[cfg(target_os = "linux")]
impl ReactorHandle {
    pub fn new() -> io::Result<Self> {
        Ok(Self { epoll_fd: sys::create_epoll()? })
    }

    pub fn add(&self, reactor: &Reactor) -> io::Result<()> {
        sys::add_fd(self.epoll_fd, reactor.fd, &reactor.interest)
    }

    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(Token, Interest)>> {
        use libc::{epoll_event, EPOLLIN};

        const MAX_EVENTS: usize = 1024;
        let mut events: Vec<epoll_event> = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
        let n = sys::wait(self.epoll_fd, &mut events, timeout_ms)?;

        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let fd = event.u64 as RawFd;
            let interest = if event.events as i32 & EPOLLIN as i32 != 0 {
                Interest::Readable
            } else {
                Interest::Writable
            };
            ready.push((Token(fd as usize), interest));
        }
        Ok(ready)
    }
}

#[cfg(target_os = "linux")]
impl Drop for ReactorHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(target_os = "macos")]
pub struct ReactorHandle {
    kq_fd: RawFd,
}

#[cfg(target_os = "macos")]
impl ReactorHandle {
    pub fn new() -> io::Result<Self> {
        Ok(Self { kq_fd: sys::create_kqueue()? })
    }

    pub fn add(&self, reactor: &Reactor) -> io::Result<()> {
        sys::add_fd(self.kq_fd, reactor.fd, &reactor.interest)
    }

    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<(Token, Interest)>> {
        const MAX_EVENTS: usize = 1024;
        let mut events = vec![unsafe { std::mem::zeroed() }; MAX_EVENTS];
        let n = sys::wait(self.kq_fd, &mut events, timeout_ms)?;

        let mut ready = Vec::with_capacity(n);
        for event in &events[..n] {
            let fd = event.ident as RawFd;
            let interest = if event.filter == EVFILT_READ {
                Interest::Readable
            } else {
                Interest::Writable
            };
            ready.push((Token(fd as usize), interest));
        }
        Ok(ready)
    }
}

#[cfg(target_os = "macos")]
impl Drop for ReactorHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq_fd);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<ReactorHandle>>> = RefCell::new(None);
}

impl ReactorHandle {
    /// Installs `self` as the reactor this thread's `TcpStream`/`TcpListener`
    /// construction sites register new fds against. `Runtime::new` calls
    /// this once per runtime; without it, `current()` has nothing to return
    /// and a fd built by `backend::tcp` would never actually be armed on any
    /// epoll/kqueue instance.
    pub(crate) fn install(handle: Rc<ReactorHandle>) {
        CURRENT.with(|cell| *cell.borrow_mut() = Some(handle));
    }

    /// The reactor installed on this thread by the enclosing `Runtime`.
    /// Panics if none is installed -- `backend::tcp`'s constructors only
    /// ever run while a `Runtime` is driving them.
    pub(crate) fn current() -> Rc<ReactorHandle> {
        CURRENT
            .with(|cell| cell.borrow().clone())
            .expect("no Runtime reactor installed on this thread")
    }

    pub(crate) fn clear_current() {
        CURRENT.with(|cell| *cell.borrow_mut() = None);
    }
}
