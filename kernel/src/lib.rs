//! SlateOS kernel subsystem model.
//!
//! A hosted model of a teaching operating system's core: process
//! lifecycle (fork, exit, wait), virtual memory (address spaces,
//! on-demand paging, a physical frame allocator), and the blocking
//! synchronization primitives underneath them. Kernel threads are OS
//! threads, physical memory is a frame arena owned by the coremap, and
//! the machine-dependent edges (program loading, user-mode entry) are
//! traits with test implementations.
//!
//! All mutable state hangs off one [`Kernel`] constructed at boot;
//! there are no globals, so tests run isolated kernels side by side.

pub mod config;
pub mod kthread;
pub mod machine;
pub mod memory;
pub mod process;
pub mod rand;
pub mod sync;
pub mod syscall;
pub mod vfs;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use machine::{ProgramLoader, TrapFrame, UserMode};
use memory::addrspace::AddressSpace;
use memory::coremap::Coremap;
use memory::tlb::Tlb;
use process::{Pid, Process, ProcessTable};
use rand::Rand;
use syscall::SyscallError;
use vfs::FileTable;

/// The kernel context: every shared structure, constructed at boot.
pub struct Kernel {
    pub coremap: Coremap,
    pub tlb: Tlb,
    pub proc_table: ProcessTable,
    pub rand: Rand,
    pub loader: Box<dyn ProgramLoader>,
    pub user_mode: Box<dyn UserMode>,
}

impl Kernel {
    /// Boot with a wall-clock random seed.
    pub fn boot(
        frames: usize,
        loader: Box<dyn ProgramLoader>,
        user_mode: Box<dyn UserMode>,
    ) -> Arc<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x5eed);
        Self::boot_seeded(seed, frames, loader, user_mode)
    }

    /// Boot with an explicit PRNG seed, for deterministic tests.
    pub fn boot_seeded(
        seed: u64,
        frames: usize,
        loader: Box<dyn ProgramLoader>,
        user_mode: Box<dyn UserMode>,
    ) -> Arc<Self> {
        let kernel = Arc::new(Self {
            coremap: Coremap::with_frames(frames),
            tlb: Tlb::new(),
            proc_table: ProcessTable::new(),
            rand: Rand::new(seed),
            loader,
            user_mode,
        });
        kernel.proc_table.register_kernel(Process::new(Pid::KERNEL, "kernel"));
        log::info!(
            "[BOOT] kernel up: {} frames, {} bytes fixed",
            kernel.coremap.total_frames(),
            kernel.coremap.used_bytes()
        );
        kernel
    }

    /// The kernel process registered at boot.
    pub fn kernel_proc(&self) -> Arc<Process> {
        self.proc_table
            .lookup(Pid::KERNEL)
            .expect("kernel process missing from table")
    }

    /// Make `proc`'s address space the active one: invalidate every
    /// cached translation. A no-op for kernel-only processes, which
    /// have no address space.
    pub fn activate(&self, proc: &Process) {
        if proc.aspace.lock().is_some() {
            self.tlb.flush_all();
        }
    }

    /// Release everything a finished process owns: its frames, its
    /// file table, and its cached translations. The table entry is
    /// already gone by the time this runs (removed by reap or exit).
    pub fn release_resources(&self, proc: &Arc<Process>) {
        assert_eq!(
            proc.thread_count(),
            0,
            "process {}: destroy with attributed threads",
            proc.pid
        );
        if let Some(aspace) = proc.aspace.lock().take() {
            aspace.destroy(&self.coremap);
        }
        proc.files.lock().take();
        self.tlb.flush_pid(proc.pid);
        log::debug!("[PROC] {} resources released", proc.pid);
    }

    /// Start a user program from kernel context, shell-style.
    ///
    /// The new process is parented to the kernel process so kernel
    /// context can [`Kernel::wait_for`] it. Its file table is seeded
    /// with stdio on the console; the stack carries the same argv
    /// image exec builds. Failure unwinds the half-created process.
    pub fn launch(self: &Arc<Self>, path: &str, args: &[&str]) -> Result<Pid, SyscallError> {
        let proc = self
            .proc_table
            .create(&self.rand, path, Some(Pid::KERNEL))?;
        match self.build_user_image(&proc, path, args) {
            Ok(tf) => {
                kthread::spawn(Arc::clone(self), Arc::clone(&proc), tf);
                proc.forksem.signal();
                log::info!("[BOOT] launched '{}' as {}", path, proc.pid);
                Ok(proc.pid)
            }
            Err(e) => {
                self.proc_table.unregister(proc.pid);
                self.release_resources(&proc);
                Err(e)
            }
        }
    }

    /// Wait for a launched program from kernel context.
    pub fn wait_for(self: &Arc<Self>, pid: Pid) -> Result<(i32, Pid), SyscallError> {
        syscall::process::sys_waitpid(self, &self.kernel_proc(), pid, 0)
    }

    fn build_user_image(
        &self,
        proc: &Process,
        path: &str,
        args: &[&str],
    ) -> Result<TrapFrame, SyscallError> {
        *proc.files.lock() = Some(FileTable::new_stdio());
        let mut aspace = AddressSpace::new();
        let built = (|| {
            let entry = self.loader.load(path, &mut aspace, &self.coremap)?;
            let sp_top = aspace.define_stack();
            let (sp, argc, argv) =
                syscall::process::write_arg_image(&mut aspace, &self.coremap, sp_top, args)?;
            Ok::<_, SyscallError>(TrapFrame {
                pc: entry,
                sp,
                ret: 0,
                arg0: argc,
                arg1: argv,
            })
        })();
        match built {
            Ok(tf) => {
                *proc.aspace.lock() = Some(aspace);
                Ok(tf)
            }
            Err(e) => {
                aspace.destroy(&self.coremap);
                Err(e)
            }
        }
    }
}
