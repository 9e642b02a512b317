//! Wait channels.
//!
//! A wait channel is a named queue of sleeping kernel threads. It is the
//! blocking mechanism under every higher-level primitive in this module:
//! a thread that finds a semaphore empty or a lock held enqueues itself
//! and parks; whoever changes the state dequeues and unparks it.
//!
//! The enqueue happens while the caller still holds the spin guard that
//! protects the primitive's state, and the guard is released only
//! afterwards. A waker can therefore never observe the state change
//! without also seeing the queued waiter, which rules out lost wakeups;
//! the park token covers the remaining window between release and park.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

use spin::{Mutex, MutexGuard};

struct Waiter {
    thread: Thread,
    woken: Arc<AtomicBool>,
}

impl Waiter {
    fn wake(self) {
        self.woken.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// A queued sleep that has not yet blocked. Produced by
/// [`WaitChannel::prepare`]; the caller releases its state guard and then
/// calls [`SleepToken::block`].
#[must_use = "a prepared sleep must be blocked on, or the queue holds a ghost"]
pub struct SleepToken {
    woken: Arc<AtomicBool>,
}

impl SleepToken {
    /// Park until a waker hands this thread the channel. Spurious unparks
    /// re-check the wake flag and go back to sleep.
    pub fn block(self) {
        while !self.woken.load(Ordering::Acquire) {
            thread::park();
        }
    }
}

/// A named queue of sleeping threads.
pub struct WaitChannel {
    name: &'static str,
    queue: Mutex<VecDeque<Waiter>>,
}

impl WaitChannel {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue the calling thread without blocking yet. The caller must
    /// still hold the guard protecting the state it checked; it drops
    /// that guard and then blocks on the returned token.
    pub fn prepare(&self) -> SleepToken {
        let woken = Arc::new(AtomicBool::new(false));
        self.queue.lock().push_back(Waiter {
            thread: thread::current(),
            woken: Arc::clone(&woken),
        });
        SleepToken { woken }
    }

    /// Enqueue, release `guard`, and block until woken. The common case
    /// for primitives whose state lives in a single spin mutex.
    pub fn sleep<T>(&self, guard: MutexGuard<'_, T>) {
        let token = self.prepare();
        drop(guard);
        token.block();
    }

    /// Wake one queued thread, if any. Returns whether one was woken.
    /// Queue order is roughly FIFO but callers get no fairness promise.
    pub fn wake_one(&self) -> bool {
        let waiter = self.queue.lock().pop_front();
        match waiter {
            Some(w) => {
                w.wake();
                true
            }
            None => false,
        }
    }

    /// Wake every queued thread. Returns how many were woken.
    pub fn wake_all(&self) -> usize {
        let drained: Vec<Waiter> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        let count = drained.len();
        for waiter in drained {
            waiter.wake();
        }
        count
    }

    /// Number of threads currently queued. Snapshot, for assertions.
    pub fn waiters(&self) -> usize {
        self.queue.lock().len()
    }
}
