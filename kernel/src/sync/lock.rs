//! Sleeping mutual-exclusion locks.

use std::thread::{self, ThreadId};

use spin::Mutex;

use super::wchan::WaitChannel;

/// Mutual-exclusion lock with an explicit owner.
///
/// Unlike a spin mutex this lock sleeps its waiters, and it knows which
/// thread holds it: [`Lock::holding`] answers "does the calling thread
/// own this lock", which condition variables and release assertions rely
/// on. Acquiring a lock the caller already holds, or releasing one it
/// does not, is a kernel bug and panics.
pub struct Lock {
    name: &'static str,
    owner: Mutex<Option<ThreadId>>,
    wchan: WaitChannel,
}

impl Lock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: Mutex::new(None),
            wchan: WaitChannel::new(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until the lock is free, then take ownership.
    pub fn acquire(&self) {
        let me = thread::current().id();
        loop {
            let mut owner = self.owner.lock();
            match *owner {
                None => {
                    *owner = Some(me);
                    return;
                }
                Some(holder) => {
                    assert!(
                        holder != me,
                        "lock '{}': acquire while already held by this thread",
                        self.name
                    );
                    self.wchan.sleep(owner);
                }
            }
        }
    }

    /// Give up ownership and wake one waiter.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        assert!(
            *owner == Some(me),
            "lock '{}': release by a thread that does not hold it",
            self.name
        );
        *owner = None;
        self.wchan.wake_one();
    }

    /// Does the calling thread hold this lock?
    pub fn holding(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_holding_tracks_owner() {
        let lock = Lock::new("owner");
        assert!(!lock.holding());
        lock.acquire();
        assert!(lock.holding());
        lock.release();
        assert!(!lock.holding());
    }

    #[test]
    fn test_mutual_exclusion_under_contention() {
        let lock = Arc::new(Lock::new("contention"));
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&lock);
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    l.acquire();
                    // Non-atomic read-modify-write; only exclusion keeps
                    // the final count exact.
                    let v = c.load(Ordering::Relaxed);
                    c.store(v + 1, Ordering::Relaxed);
                    l.release();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4000);
    }

    #[test]
    #[should_panic(expected = "already held by this thread")]
    fn test_reacquire_by_owner_panics() {
        let lock = Lock::new("reentrant");
        lock.acquire();
        lock.acquire();
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn test_release_without_acquire_panics() {
        let lock = Lock::new("stranger");
        lock.release();
    }
}
