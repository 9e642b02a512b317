//! Machine-dependent seams.
//!
//! The subsystem treats the hardware-facing pieces as collaborators
//! behind narrow traits: loading an executable image into an address
//! space, and resuming a thread in user mode with saved register
//! state. Production implementations would be architecture glue; tests
//! install table-driven stand-ins.

use core::fmt;

use crate::memory::addrspace::AddressSpace;
use crate::memory::coremap::Coremap;
use crate::memory::MemError;

/// Saved user register state, the contract between the kernel and a
/// resumed user thread.
///
/// `ret` is the syscall return register: fork clears it in the child's
/// frame so the two sides of the fork are distinguishable. `arg0` and
/// `arg1` carry `argc`/`argv` into a fresh program image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub pc: u64,
    pub sp: u64,
    pub ret: u64,
    pub arg0: u64,
    pub arg1: u64,
}

/// Program loading errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// No executable at the given path.
    NotFound,
    /// The file exists but is not a loadable image.
    BadFormat,
    /// No frames left for the image.
    OutOfMemory,
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound => write!(f, "executable not found"),
            LoadError::BadFormat => write!(f, "not an executable"),
            LoadError::OutOfMemory => write!(f, "out of memory while loading"),
        }
    }
}

impl From<MemError> for LoadError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::OutOfMemory => LoadError::OutOfMemory,
            MemError::InvalidRegion | MemError::BadAddress => LoadError::BadFormat,
        }
    }
}

/// Loads an executable image: defines its regions on `aspace`, writes
/// the segment bytes, and returns the entry point. ELF parsing lives
/// behind this boundary.
pub trait ProgramLoader: Send + Sync {
    fn load(
        &self,
        path: &str,
        aspace: &mut AddressSpace,
        coremap: &Coremap,
    ) -> Result<u64, LoadError>;
}

/// Runs a process's user code given its register state.
///
/// `resume` returns when the user code can make no further progress:
/// it has exited, been terminated by a fault, or run to completion
/// (in which case the caller applies the implicit exit). An exec that
/// replaces the image is recorded on the context; the caller re-enters
/// user mode with the new register state.
pub trait UserMode: Send + Sync {
    fn resume(&self, ctx: &mut crate::kthread::UserCtx);
}
