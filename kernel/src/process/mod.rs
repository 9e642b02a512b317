//! Processes and the process table.
//!
//! A [`Process`] owns what a schedulable unit needs: its address space,
//! its file table, and the two one-shot notifications the lifecycle
//! protocol runs on. The [`table::ProcessTable`] is the authoritative
//! registry; it owns the lifecycle metadata (parent, state, exit
//! status) and processes refer to relatives only by PID, resolved
//! through the table.

pub mod table;

use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::config::{PID_MAX, PID_MIN};
use crate::memory::addrspace::AddressSpace;
use crate::sync::Semaphore;
use crate::vfs::FileTable;

pub use table::{ProcState, ProcessTable, WaitOutcome};

/// Process identifier. Unique among live processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub i32);

impl Pid {
    /// Never a real process.
    pub const INVALID: Pid = Pid(0);
    /// The kernel process, created at boot.
    pub const KERNEL: Pid = Pid(1);

    /// Is this a value user processes can hold?
    pub fn in_user_range(self) -> bool {
        (PID_MIN..=PID_MAX).contains(&self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Encode a voluntary exit code into the status a waiter observes.
pub fn encode_exit(code: i32) -> i32 {
    code << 2
}

/// Encode a fatal-signal termination into a waiter-observable status,
/// distinguishable from any voluntary exit.
pub fn encode_signal(sig: i32) -> i32 {
    (sig << 2) | 1
}

/// Process lifecycle errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// The user-process ceiling is reached; fork must be refused.
    TooManyProcesses,
    /// PID assignment gave up after its bounded number of draws.
    PidSpaceExhausted,
    /// Wait target unknown, already reaped, or claimed by another
    /// waiter.
    NoSuchChild,
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcError::TooManyProcesses => write!(f, "too many processes"),
            ProcError::PidSpaceExhausted => write!(f, "no free pid"),
            ProcError::NoSuchChild => write!(f, "no such child"),
        }
    }
}

/// One schedulable unit and the resources it owns.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    /// Threads currently attributed to this process. Must be zero by
    /// the time the process is destroyed.
    threads: AtomicUsize,
    /// One-shot fork handoff: the child's thread blocks here until the
    /// parent has finished copying shared state into it.
    pub forksem: Semaphore,
    /// Exit notification: signaled once, after the exit status is
    /// recorded; a waiter blocks here.
    pub exitsem: Semaphore,
    /// Kernel-only processes have no address space.
    pub aspace: Mutex<Option<AddressSpace>>,
    pub files: Mutex<Option<FileTable>>,
}

impl Process {
    pub fn new(pid: Pid, name: &str) -> Arc<Self> {
        Arc::new(Self {
            pid,
            name: name.to_string(),
            threads: AtomicUsize::new(0),
            forksem: Semaphore::new("forksem", 0),
            exitsem: Semaphore::new("exitsem", 0),
            aspace: Mutex::new(None),
            files: Mutex::new(None),
        })
    }

    /// Attribute the calling (or about-to-start) thread to this
    /// process.
    pub fn attach_thread(&self) {
        self.threads.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove one thread attribution. An exiting thread detaches
    /// before the exit notification fires, so a woken waiter can
    /// destroy the process immediately.
    pub fn detach_thread(&self) {
        let prev = self.threads.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "process {}: detach with no attached threads", self.pid);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_encoding_distinguishes_exit_from_signal() {
        assert_eq!(encode_exit(0), 0);
        assert_eq!(encode_exit(7), 28);
        assert_eq!(encode_signal(11), 45);
        assert_ne!(encode_exit(11), encode_signal(11));
        // Low bits carry the kind, so the raw code is recoverable.
        assert_eq!(encode_exit(7) >> 2, 7);
        assert_eq!(encode_signal(11) >> 2, 11);
    }

    #[test]
    fn test_pid_ranges() {
        assert!(!Pid::INVALID.in_user_range());
        assert!(!Pid::KERNEL.in_user_range());
        assert!(Pid(PID_MIN).in_user_range());
        assert!(Pid(PID_MAX).in_user_range());
        assert!(!Pid(PID_MAX + 1).in_user_range());
    }

    #[test]
    fn test_thread_attribution_counts() {
        let proc = Process::new(Pid(2), "count");
        proc.attach_thread();
        proc.attach_thread();
        proc.detach_thread();
        assert_eq!(proc.thread_count(), 1);
    }

    #[test]
    #[should_panic(expected = "detach with no attached threads")]
    fn test_detach_unattached_panics() {
        let proc = Process::new(Pid(2), "empty");
        proc.detach_thread();
    }
}
