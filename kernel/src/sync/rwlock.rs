//! Reader/writer locks.

use spin::Mutex;

use crate::config::RW_READER_QUOTA;

use super::condvar::Condvar;
use super::lock::Lock;

#[derive(Default)]
struct RwState {
    readers: usize,
    writer_active: bool,
    writers_waiting: usize,
    /// Reads admitted since a writer began waiting. Once it reaches
    /// [`RW_READER_QUOTA`], new readers queue until the writer has had
    /// its turn, which bounds writer wait under a steady reader stream.
    reads_since_writer_waited: usize,
}

/// Reader/writer lock: any number of concurrent readers or one writer.
///
/// Writers sleep on a condition variable until the lock drains; readers
/// yield to a waiting writer after [`RW_READER_QUOTA`] admissions, so a
/// continuous stream of readers cannot starve it. Readers are anonymous
/// (no per-thread owner tracking); releasing without holding is still
/// caught by the counters and panics.
pub struct RwLock {
    name: &'static str,
    mtx: Lock,
    readers_ok: Condvar,
    writers_ok: Condvar,
    state: Mutex<RwState>,
}

impl RwLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            mtx: Lock::new(name),
            readers_ok: Condvar::new(name),
            writers_ok: Condvar::new(name),
            state: Mutex::new(RwState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until shared access is admissible, then hold it.
    pub fn acquire_read(&self) {
        self.mtx.acquire();
        loop {
            let admit = {
                let state = self.state.lock();
                !state.writer_active
                    && (state.writers_waiting == 0
                        || state.reads_since_writer_waited < RW_READER_QUOTA)
            };
            if admit {
                break;
            }
            self.readers_ok.wait(&self.mtx);
        }
        {
            let mut state = self.state.lock();
            state.readers += 1;
            if state.writers_waiting > 0 {
                state.reads_since_writer_waited += 1;
            }
        }
        self.mtx.release();
    }

    /// Drop shared access; the last reader out hands off to a writer.
    pub fn release_read(&self) {
        self.mtx.acquire();
        let wake_writer = {
            let mut state = self.state.lock();
            assert!(
                state.readers > 0,
                "rwlock '{}': release_read with no readers",
                self.name
            );
            state.readers -= 1;
            state.readers == 0 && state.writers_waiting > 0
        };
        if wake_writer {
            self.writers_ok.signal(&self.mtx);
        }
        self.mtx.release();
    }

    /// Block until exclusive access is available, then hold it.
    pub fn acquire_write(&self) {
        self.mtx.acquire();
        self.state.lock().writers_waiting += 1;
        loop {
            let free = {
                let state = self.state.lock();
                !state.writer_active && state.readers == 0
            };
            if free {
                break;
            }
            self.writers_ok.wait(&self.mtx);
        }
        {
            let mut state = self.state.lock();
            state.writers_waiting -= 1;
            state.writer_active = true;
            state.reads_since_writer_waited = 0;
        }
        self.mtx.release();
    }

    /// Drop exclusive access and wake whoever queued behind it.
    pub fn release_write(&self) {
        self.mtx.acquire();
        let more_writers = {
            let mut state = self.state.lock();
            assert!(
                state.writer_active,
                "rwlock '{}': release_write with no active writer",
                self.name
            );
            state.writer_active = false;
            state.reads_since_writer_waited = 0;
            state.writers_waiting > 0
        };
        if more_writers {
            self.writers_ok.signal(&self.mtx);
        }
        self.readers_ok.broadcast(&self.mtx);
        self.mtx.release();
    }

    /// Current reader count. Snapshot, for assertions.
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_readers_share() {
        let rw = RwLock::new("share");
        rw.acquire_read();
        rw.acquire_read();
        assert_eq!(rw.readers(), 2);
        rw.release_read();
        rw.release_read();
        assert_eq!(rw.readers(), 0);
    }

    #[test]
    fn test_write_excludes_readers() {
        let rw = Arc::new(RwLock::new("exclusive"));
        rw.acquire_write();

        let r = Arc::clone(&rw);
        let reader = thread::spawn(move || {
            r.acquire_read();
            let n = r.readers();
            r.release_read();
            n
        });

        // The reader must not be admitted while the writer holds.
        thread::yield_now();
        assert_eq!(rw.readers(), 0);
        rw.release_write();
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "release_read with no readers")]
    fn test_release_read_without_hold_panics() {
        let rw = RwLock::new("bad-read");
        rw.release_read();
    }

    #[test]
    #[should_panic(expected = "release_write with no active writer")]
    fn test_release_write_without_hold_panics() {
        let rw = RwLock::new("bad-write");
        rw.release_write();
    }
}
