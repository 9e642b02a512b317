//! Counting semaphores.

use spin::Mutex;

use super::wchan::WaitChannel;

/// Counting semaphore with the classic P/V contract.
///
/// `wait` (P) blocks while the count is zero, then decrements it;
/// `signal` (V) increments the count and wakes one sleeper. When several
/// signals race with several waiters, each signal lets exactly one waiter
/// through; which one is unspecified.
///
/// Both operations may be called from any kernel thread. `wait` blocks,
/// so it must not be called from a context that cannot sleep.
pub struct Semaphore {
    name: &'static str,
    count: Mutex<usize>,
    wchan: WaitChannel,
}

impl Semaphore {
    pub const fn new(name: &'static str, count: usize) -> Self {
        Self {
            name,
            count: Mutex::new(count),
            wchan: WaitChannel::new(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// P: block until the count is positive, then take one unit.
    pub fn wait(&self) {
        loop {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                return;
            }
            // Queued before the guard drops, so a racing signal sees us.
            self.wchan.sleep(count);
        }
    }

    /// V: release one unit and wake one sleeper if any.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.wchan.wake_one();
    }

    /// Current count. Snapshot only; gone stale by the time you read it.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }
}
