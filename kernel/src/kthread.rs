//! Kernel threads and the user-mode bridge.
//!
//! Every user process is hosted by one kernel thread. [`spawn`] starts
//! it: the thread is attributed to the process before it runs, blocks
//! on the fork handoff until its creator finishes setup, activates the
//! address space, and resumes user mode. A program that returns
//! without exiting gets the runtime's implicit `exit(0)`.
//!
//! [`UserCtx`] is what the resumed user code runs against: syscall
//! wrappers and TLB-mediated memory access. Unrecoverable faults
//! terminate the process through the same exit path a voluntary exit
//! takes, with an encoded signal status; after that the context is
//! dead and the program must stop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{PAGE_SIZE, SIGBUS, SIGSEGV, WORD_SIZE};
use crate::machine::TrapFrame;
use crate::memory::fault::{self, FaultKind};
use crate::memory::offset_in_page;
use crate::process::{encode_signal, Pid, Process};
use crate::syscall::{self, SyscallError};
use crate::Kernel;

/// Start the kernel thread hosting `proc`'s user code.
///
/// The thread does not enter user mode until `proc.forksem` is
/// signaled; fork and launch signal it once the child's state is fully
/// in place.
pub fn spawn(kernel: Arc<Kernel>, proc: Arc<Process>, tf: TrapFrame) -> JoinHandle<()> {
    // Attributed before the thread exists, so a destroy racing the
    // startup window still sees it.
    proc.attach_thread();
    let name = format!("{}:{}", proc.name, proc.pid);
    thread::Builder::new()
        .name(name)
        .spawn(move || {
            proc.forksem.wait();
            kernel.activate(&proc);
            let mut ctx = UserCtx::new(Arc::clone(&kernel), proc, tf);
            loop {
                kernel.user_mode.resume(&mut ctx);
                if ctx.is_dead() {
                    break;
                }
                if ctx.exec_pending {
                    // exec replaced the image; enter the new one.
                    ctx.exec_pending = false;
                    kernel.activate(&ctx.proc);
                    continue;
                }
                // Ran off the end of the program: implicit exit.
                ctx.exit(0);
                break;
            }
        })
        .expect("kernel thread spawn failed")
}

/// Failure of a user memory access. The process is already terminated
/// when this is returned; the program must unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated;

/// The bridge a resumed user program runs against.
pub struct UserCtx {
    kernel: Arc<Kernel>,
    proc: Arc<Process>,
    /// Register state; exec replaces it, fork seeds the child's copy.
    pub tf: TrapFrame,
    dead: bool,
    /// A successful exec happened during this resume; the thread loop
    /// enters the new image instead of applying the implicit exit.
    exec_pending: bool,
}

impl UserCtx {
    pub(crate) fn new(kernel: Arc<Kernel>, proc: Arc<Process>, tf: TrapFrame) -> Self {
        Self {
            kernel,
            proc,
            tf,
            dead: false,
            exec_pending: false,
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn proc(&self) -> &Arc<Process> {
        &self.proc
    }

    /// Has this process been terminated (voluntarily or by fault)?
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    // ------------------------------------------------------------------
    // System calls
    // ------------------------------------------------------------------

    pub fn getpid(&self) -> Pid {
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} getpid", self.proc.pid);
        syscall::process::sys_getpid(&self.proc)
    }

    /// Fork the calling process. The child's execution resumes at
    /// `child_pc` with the same register state except a zeroed return
    /// register; the parent gets the child's PID.
    pub fn fork_to(&mut self, child_pc: u64) -> Result<Pid, SyscallError> {
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} fork", self.proc.pid);
        syscall::process::sys_fork(&self.kernel, &self.proc, &self.tf, child_pc)
    }

    pub fn waitpid(&mut self, target: Pid, options: i32) -> Result<(i32, Pid), SyscallError> {
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} waitpid {}", self.proc.pid, target);
        syscall::process::sys_waitpid(&self.kernel, &self.proc, target, options)
    }

    /// Terminate the calling process with `code`. The context is dead
    /// afterwards; user code must return without touching it again.
    pub fn exit(&mut self, code: i32) {
        assert!(!self.dead, "exit on a dead context");
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} exit({})", self.proc.pid, code);
        self.proc.detach_thread();
        syscall::process::sys_exit(&self.kernel, &self.proc, code);
        self.dead = true;
    }

    /// Replace this process's image. On success the context's register
    /// state is the new program's entry state and the caller returns
    /// to the thread loop, which enters the new image.
    pub fn execv(&mut self, path: &str, args: &[&str]) -> Result<(), SyscallError> {
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} execv '{}'", self.proc.pid, path);
        self.tf = syscall::process::sys_execv(&self.kernel, &self.proc, path, args)?;
        self.exec_pending = true;
        Ok(())
    }

    pub fn sbrk(&mut self, delta: i64) -> Result<u64, SyscallError> {
        #[cfg(feature = "trace-syscalls")]
        log::trace!("[SYS] {} sbrk({})", self.proc.pid, delta);
        syscall::memory::sys_sbrk(&self.kernel, &self.proc, delta)
    }

    // ------------------------------------------------------------------
    // User memory access
    // ------------------------------------------------------------------

    /// Read user memory at `vaddr`. An illegal access terminates the
    /// process with an encoded SIGSEGV status.
    pub fn read_bytes(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), Terminated> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = vaddr + done as u64;
            let chunk =
                ((PAGE_SIZE - offset_in_page(addr)) as usize).min(buf.len() - done);
            let paddr = self.translate(addr, false)?;
            self.kernel
                .coremap
                .read_bytes(paddr, &mut buf[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Write user memory at `vaddr`; same termination contract as
    /// [`Self::read_bytes`].
    pub fn write_bytes(&mut self, vaddr: u64, bytes: &[u8]) -> Result<(), Terminated> {
        let mut done = 0usize;
        while done < bytes.len() {
            let addr = vaddr + done as u64;
            let chunk =
                ((PAGE_SIZE - offset_in_page(addr)) as usize).min(bytes.len() - done);
            let paddr = self.translate(addr, true)?;
            self.kernel
                .coremap
                .write_bytes(paddr, &bytes[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Read one naturally aligned user word. Misalignment is a SIGBUS
    /// termination.
    pub fn read_word(&mut self, vaddr: u64) -> Result<u32, Terminated> {
        if vaddr % WORD_SIZE != 0 {
            self.terminate(SIGBUS);
            return Err(Terminated);
        }
        let mut buf = [0u8; WORD_SIZE as usize];
        self.read_bytes(vaddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Write one naturally aligned user word.
    pub fn write_word(&mut self, vaddr: u64, value: u32) -> Result<(), Terminated> {
        if vaddr % WORD_SIZE != 0 {
            self.terminate(SIGBUS);
            return Err(Terminated);
        }
        self.write_bytes(vaddr, &value.to_le_bytes())
    }

    /// Physical address for a user access, faulting the page in if
    /// needed. Failure means the process has been terminated.
    fn translate(&mut self, vaddr: u64, write: bool) -> Result<u64, Terminated> {
        if self.dead {
            return Err(Terminated);
        }
        loop {
            if let Some(hit) = self.kernel.tlb.probe(self.proc.pid, vaddr) {
                if write && !hit.writable {
                    self.fault(FaultKind::ReadOnly, vaddr)?;
                    continue;
                }
                return Ok(hit.paddr + offset_in_page(vaddr));
            }
            let kind = if write { FaultKind::Write } else { FaultKind::Read };
            self.fault(kind, vaddr)?;
        }
    }

    fn fault(&mut self, kind: FaultKind, vaddr: u64) -> Result<(), Terminated> {
        let outcome = {
            let mut guard = self.proc.aspace.lock();
            match guard.as_mut() {
                Some(aspace) => fault::handle(
                    aspace,
                    &self.kernel.coremap,
                    &self.kernel.tlb,
                    &self.kernel.rand,
                    self.proc.pid,
                    kind,
                    vaddr,
                ),
                None => Err(fault::FaultError::Protection),
            }
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!(
                    "[VM] {} unrecoverable {:?} fault at {:#x}: {:?}",
                    self.proc.pid,
                    kind,
                    vaddr,
                    e
                );
                self.terminate(SIGSEGV);
                Err(Terminated)
            }
        }
    }

    fn terminate(&mut self, sig: i32) {
        assert!(!self.dead, "terminate on a dead context");
        log::warn!("[PROC] {} killed by signal {}", self.proc.pid, sig);
        self.proc.detach_thread();
        syscall::process::exit_with_status(&self.kernel, &self.proc, encode_signal(sig));
        self.dead = true;
    }
}
