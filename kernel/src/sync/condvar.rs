//! Condition variables.

use super::lock::Lock;
use super::wchan::WaitChannel;

/// Condition variable bound to a [`Lock`] at the call sites.
///
/// Each condition variable owns its own wait channel. Sharing the lock's
/// channel would let a signal on one condition wake sleepers of another
/// condition on the same lock; with distinct channels two variables over
/// one lock never cross-wake.
///
/// All three operations require the caller to hold the associated lock.
pub struct Condvar {
    name: &'static str,
    wchan: WaitChannel,
}

impl Condvar {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            wchan: WaitChannel::new(name),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release `lock`, sleep until signaled, re-acquire `lock`.
    ///
    /// The enqueue happens before the lock is released, so a signal sent
    /// by the next lock holder cannot slip past this sleeper. As with any
    /// condition variable, the awaited predicate must be re-checked on
    /// return.
    pub fn wait(&self, lock: &Lock) {
        assert!(
            lock.holding(),
            "condvar '{}': wait without holding lock '{}'",
            self.name,
            lock.name()
        );
        let token = self.wchan.prepare();
        lock.release();
        token.block();
        lock.acquire();
    }

    /// Wake one sleeper.
    pub fn signal(&self, lock: &Lock) {
        assert!(
            lock.holding(),
            "condvar '{}': signal without holding lock '{}'",
            self.name,
            lock.name()
        );
        self.wchan.wake_one();
    }

    /// Wake every sleeper.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(
            lock.holding(),
            "condvar '{}': broadcast without holding lock '{}'",
            self.name,
            lock.name()
        );
        self.wchan.wake_all();
    }
}
