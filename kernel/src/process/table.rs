//! The process table.
//!
//! One PID-keyed map behind one lock, holding every live and
//! exited-but-unreaped process. Every check-then-act sequence in the
//! lifecycle protocol runs entirely inside that lock; what never
//! happens inside it is blocking on an exit notification, which is why
//! [`ProcessTable::begin_wait`] only claims the wait and hands the
//! actual blocking back to the caller.

use std::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;

use crate::config::{MAX_PROCESSES, PID_DRAW_ATTEMPTS, PID_MAX, PID_MIN};
use crate::rand::Rand;

use super::{Pid, ProcError, Process};

/// Lifecycle state of a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Running,
    /// Exited; the encoded status waits for a reaper.
    Zombie(i32),
}

struct ProcEntry {
    proc: Arc<Process>,
    parent: Option<Pid>,
    state: ProcState,
    /// A waiter has claimed this process's exit. Only one is honored.
    waited: bool,
}

/// Result of claiming a wait on a target process.
pub enum WaitOutcome {
    /// Target already exited; the encoded status is ready.
    Ready(i32),
    /// Target still running; block on its exit notification, then
    /// reap.
    Block(Arc<Process>),
}

/// What an exiting process leaves behind for its caller to dispose of.
pub struct ExitActions {
    /// The exiting process itself, when nobody will ever reap it
    /// (no parent). Its entry is already gone from the table.
    pub self_destroy: Option<Arc<Process>>,
    /// Zombie children the exiting parent reaps on its way out. Their
    /// entries are already gone from the table.
    pub orphan_zombies: Vec<Arc<Process>>,
}

/// Registry of all live and exited-but-unreaped processes.
pub struct ProcessTable {
    inner: Mutex<HashMap<Pid, ProcEntry>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Install the kernel process at boot, under [`Pid::KERNEL`].
    pub fn register_kernel(&self, proc: Arc<Process>) {
        let mut table = self.inner.lock();
        let prev = table.insert(
            Pid::KERNEL,
            ProcEntry {
                proc,
                parent: None,
                state: ProcState::Running,
                waited: false,
            },
        );
        assert!(prev.is_none(), "process table: kernel process registered twice");
    }

    /// Create and register a user process under a fresh random PID.
    ///
    /// Refused when the user-process ceiling is reached. PID draws are
    /// bounded; exhausting them fails the creation instead of looping.
    pub fn create(
        &self,
        rand: &Rand,
        name: &str,
        parent: Option<Pid>,
    ) -> Result<Arc<Process>, ProcError> {
        let mut table = self.inner.lock();
        let users = table.keys().filter(|pid| pid.in_user_range()).count();
        if users >= MAX_PROCESSES {
            return Err(ProcError::TooManyProcesses);
        }
        let span = (PID_MAX - PID_MIN + 1) as u64;
        let pid = (0..PID_DRAW_ATTEMPTS)
            .map(|_| Pid(PID_MIN + rand.below(span) as i32))
            .find(|pid| !table.contains_key(pid))
            .ok_or(ProcError::PidSpaceExhausted)?;
        let proc = Process::new(pid, name);
        table.insert(
            pid,
            ProcEntry {
                proc: Arc::clone(&proc),
                parent,
                state: ProcState::Running,
                waited: false,
            },
        );
        log::info!(
            "[PROC] {} '{}' created, parent {}",
            pid,
            name,
            parent.map(|p| p.0).unwrap_or(0)
        );
        Ok(proc)
    }

    pub fn lookup(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.lock().get(&pid).map(|e| Arc::clone(&e.proc))
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcState> {
        self.inner.lock().get(&pid).map(|e| e.state)
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.inner.lock().get(&pid).and_then(|e| e.parent)
    }

    /// Live user processes, for the fork ceiling and diagnostics.
    pub fn user_count(&self) -> usize {
        self.inner
            .lock()
            .keys()
            .filter(|pid| pid.in_user_range())
            .count()
    }

    /// Rollcall of every table entry.
    pub fn snapshot(&self) -> Vec<(Pid, String, ProcState)> {
        self.inner
            .lock()
            .values()
            .map(|e| (e.proc.pid, e.proc.name.clone(), e.state))
            .collect()
    }

    /// Claim the exclusive right to wait on `target` and adopt it.
    ///
    /// The whole check-then-act runs under the table lock; the caller
    /// blocks (if at all) only after the lock is gone.
    pub fn begin_wait(&self, waiter: Pid, target: Pid) -> Result<WaitOutcome, ProcError> {
        let mut table = self.inner.lock();
        let entry = table.get_mut(&target).ok_or(ProcError::NoSuchChild)?;
        if entry.waited {
            return Err(ProcError::NoSuchChild);
        }
        entry.waited = true;
        entry.parent = Some(waiter);
        match entry.state {
            ProcState::Zombie(status) => Ok(WaitOutcome::Ready(status)),
            ProcState::Running => Ok(WaitOutcome::Block(Arc::clone(&entry.proc))),
        }
    }

    /// Remove a claimed, exited target and surrender its status and
    /// process. Called by the waiter after [`Self::begin_wait`], once
    /// the exit notification has fired (or immediately on `Ready`).
    pub fn reap(&self, target: Pid) -> (i32, Arc<Process>) {
        let mut table = self.inner.lock();
        let entry = table
            .remove(&target)
            .unwrap_or_else(|| panic!("process table: reap of missing entry {}", target));
        assert!(entry.waited, "process table: reap of unclaimed {}", target);
        match entry.state {
            ProcState::Zombie(status) => (status, entry.proc),
            ProcState::Running => panic!("process table: reap of running {}", target),
        }
    }

    /// Remove a half-created process that never ran. Used to unwind a
    /// failed launch; a process that has run exits through
    /// [`Self::note_exit`] instead.
    pub fn unregister(&self, pid: Pid) -> Option<Arc<Process>> {
        self.inner.lock().remove(&pid).map(|e| e.proc)
    }

    /// Record an exit: write the encoded status, dispose of children
    /// per the orphan policy, and decide who destroys the exiting
    /// process.
    ///
    /// Zombie children nobody reaped are taken down with the parent;
    /// running children are detached and will destroy themselves when
    /// they exit. If `pid` itself has no parent its entry is removed
    /// here and the caller destroys it.
    ///
    /// The status is recorded before this returns, so the caller can
    /// signal the exit notification immediately afterwards and any
    /// waiter observes a valid status.
    pub fn note_exit(&self, pid: Pid, status: i32) -> ExitActions {
        let mut table = self.inner.lock();

        let orphan_pids: Vec<Pid> = table
            .iter()
            .filter(|(_, e)| e.parent == Some(pid))
            .map(|(&child, _)| child)
            .collect();
        let mut orphan_zombies = Vec::new();
        for child in orphan_pids {
            match table.get(&child).map(|e| e.state) {
                Some(ProcState::Zombie(_)) => {
                    orphan_zombies.push(table.remove(&child).unwrap().proc);
                }
                Some(ProcState::Running) => {
                    table.get_mut(&child).unwrap().parent = None;
                }
                None => unreachable!(),
            }
        }

        let parentless = {
            let entry = table
                .get_mut(&pid)
                .unwrap_or_else(|| panic!("process table: exit of unregistered {}", pid));
            entry.state = ProcState::Zombie(status);
            entry.parent.is_none()
        };
        let self_destroy = parentless.then(|| table.remove(&pid).unwrap().proc);
        log::info!("[PROC] {} exited, status {:#x}", pid, status);

        ExitActions {
            self_destroy,
            orphan_zombies,
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
