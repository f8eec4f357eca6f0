use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

pub const TASK_IDLE: u8 = 0;
pub const TASK_SCHEDULED: u8 = 1;
pub const TASK_COMPLETED: u8 = 3;

pub struct Task {
    id: usize,
    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send>>>,
    state: AtomicU8,
}

impl Task {
    pub fn new<F>(id: usize, future: F) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Arc::new(Self {
            id,
            future: Mutex::new(Box::pin(future)),
            state: AtomicU8::new(TASK_IDLE),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == TASK_COMPLETED
    }

    pub fn set_scheduled(&self) {
        self.state.store(TASK_SCHEDULED, Ordering::Release);
    }

    pub fn poll(&self, cx: &mut Context) {
        let mut future = self.future.lock().unwrap();
        match future.as_mut().poll(cx) {
            Poll::Ready(()) => self.state.store(TASK_COMPLETED, Ordering::Release),
            Poll::Pending => self.state.store(TASK_IDLE, Ordering::Release),
        }
    }
}

struct SimpleWaker {
    task: Arc<Task>,
}

impl Wake for SimpleWaker {
    fn wake(self: Arc<Self>) {
        self.task.set_scheduled();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.task.set_scheduled();
    }
}

pub struct TimerEntry {
    at: Instant,
    task: Arc<Task>,
}

impl TimerEntry {
    fn at(&self) -> Instant {
        self.at
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse so the BinaryHeap (a max-heap) pops the earliest deadline.
        other.at.cmp(&self.at)
    }
}

pub struct Timer {
    heap: std::collections::BinaryHeap<TimerEntry>,
}

impl Timer {
    pub fn new() -> Self {
        Self { heap: std::collections::BinaryHeap::new() }
    }

    pub fn schedule(&mut self, at: Instant, task: Arc<Task>) {
        self.heap.push(TimerEntry { at, task });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.at())
    }

    pub fn poll(&mut self) -> Vec<Arc<Task>> {
        let mut expired = Vec::new();
        let now = Instant::now();
        while let Some(entry) = self.heap.peek() {
            if entry.at() <= now {
                let entry = self.heap.pop().unwrap();
                entry.task.set_scheduled();
                expired.push(entry.task);
            } else {
                break;
            }
        }
        expired
    }
}

/// Single-threaded, cooperative task queue. No locks are required beyond
/// what `Arc`/`Mutex` demand structurally: only one loop thread ever calls
/// `run`/`try_tick`, matching the crate-wide single-threaded invariant.
pub struct Executor {
    pub tasks: VecDeque<Arc<Task>>,
    pub timer: Mutex<Timer>,
    pub id_gen: AtomicUsize,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
            timer: Mutex::new(Timer::new()),
            id_gen: AtomicUsize::new(0),
        }
    }

    pub fn spawn_task<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.id_gen.fetch_add(1, Ordering::SeqCst);
        let task = Task::new(id, future);
        task.set_scheduled();
        self.tasks.push_back(task);
    }

    pub fn schedule(&mut self, task: Arc<Task>) {
        task.set_scheduled();
        self.tasks.push_back(task);
    }
}
