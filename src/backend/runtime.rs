use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use super::reactor::ReactorHandle;
use super::task::Executor;
use super::{Interest, Token};

/// Single-threaded cooperative event loop: each loop runs one socket set,
/// and a socket is never touched concurrently from two threads.
pub struct Runtime {
    executor: Executor,
    reactor: Rc<ReactorHandle>,
    io_events: Mutex<Vec<(Token, Interest)>>,
}

impl Runtime {
    pub fn new() -> io::Result<Self> {
        let reactor = Rc::new(ReactorHandle::new()?);
        // `backend::tcp`'s `Reactor::new` call sites register themselves
        // against whatever `ReactorHandle` is installed here, so every fd
        // this runtime's sockets open actually gets armed on its epoll/
        // kqueue instance instead of sitting unregistered.
        ReactorHandle::install(Rc::clone(&reactor));
        Ok(Self {
            executor: Executor::new(),
            reactor,
            io_events: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.executor.spawn_task(future);
    }

    pub fn block_on<F>(&mut self, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        let mut pinned = Box::pin(future);
        let woken = Arc::new(WakerData { woken: AtomicUsize::new(0) });

        loop {
            let waker = Waker::from(woken.clone());
            let mut cx = Context::from_waker(&waker);

            match pinned.as_mut().poll(&mut cx) {
                Poll::Ready(output) => return output,
                Poll::Pending => {
                    // Always tick, even though this future just woke itself
                    // (e.g. a socket read retrying after `WouldBlock`):
                    // skipping the tick whenever the caller's own future is
                    // self-waking would starve every other task spawned onto
                    // this runtime, since `tick()` is the only place spawned
                    // tasks are polled.
                    woken.woken.store(0, Ordering::Relaxed);
                    self.tick();
                }
            }
        }
    }

    pub fn tick(&mut self) {
        let has_pending_tasks = !self.executor.tasks.is_empty();
        let timeout = self
            .executor
            .timer
            .lock()
            .unwrap()
            .next_deadline()
            .map(|d| {
                let now = Instant::now();
                if d > now { d.duration_since(now).as_millis() as i32 } else { 0 }
            })
            .unwrap_or(if has_pending_tasks {
                // No per-fd readiness is wired up to wake a specific pending
                // task (see `reactor.rs`), so with no timer deadline either,
                // blocking on `epoll_wait`/`kevent` indefinitely would hang
                // this tick forever rather than give other runnable tasks a
                // chance. Fall back to a short poll interval instead.
                1
            } else {
                -1
            });

        let events = self.reactor.wait(timeout).unwrap_or_default();
        self.io_events.lock().unwrap().extend(events);

        for task in self.executor.timer.lock().unwrap().poll() {
            self.executor.schedule(task);
        }

        let mut pending = VecDeque::new();
        while let Some(task) = self.executor.tasks.pop_front() {
            if task.is_completed() {
                continue;
            }

            let waker_data = Arc::new(WakerData { woken: AtomicUsize::new(0) });
            let waker = Waker::from(waker_data);
            let mut cx = Context::from_waker(&waker);

            task.poll(&mut cx);

            if !task.is_completed() {
                pending.push_back(task);
            }
        }
        self.executor.tasks = pending;
        self.io_events.lock().unwrap().clear();
    }

    pub fn run<F>(&mut self, future: F) -> F::Output
    where
        F: std::future::Future,
    {
        self.block_on(future)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        ReactorHandle::clear_current();
    }
}

struct WakerData {
    woken: AtomicUsize,
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.woken.store(1, Ordering::Relaxed);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(1, Ordering::Relaxed);
    }
}

pub fn sleep(duration: Duration) -> Sleep {
    Sleep { deadline: Instant::now() + duration }
}

pub struct Sleep {
    deadline: Instant,
}

impl std::future::Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    /// A future that immediately re-arms its own waker and returns Pending
    /// a fixed number of times before resolving -- stands in for `tcp.rs`'s
    /// `YieldForRetry`, which does the same thing on every `WouldBlock`.
    struct SelfWaking {
        remaining: usize,
    }

    impl std::future::Future for SelfWaking {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
            if self.remaining == 0 {
                return Poll::Ready(());
            }
            self.remaining -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn spawned_tasks_make_progress_while_block_on_future_self_wakes() {
        let mut rt = Runtime::new().expect("runtime");
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        rt.spawn(async move {
            ran_clone.store(true, Ordering::Relaxed);
        });

        // Busy-retries a handful of times before completing, exactly like a
        // socket op retrying after `WouldBlock`. If `block_on` ever skips
        // `tick()` while its own future self-wakes, the spawned task above
        // never gets polled and this assertion fails.
        rt.block_on(SelfWaking { remaining: 5 });

        assert!(ran.load(Ordering::Relaxed), "spawned task was starved by a self-waking block_on future");
    }

    #[test]
    fn tick_does_not_block_indefinitely_with_pending_tasks_and_no_timer() {
        let mut rt = Runtime::new().expect("runtime");
        rt.spawn(async {});

        // Regression guard: with a pending task and no timer deadline, the
        // old fallback of `-1` (block forever) would hang this test since
        // no fd is ever armed on the reactor to wake it.
        rt.tick();
    }
}
