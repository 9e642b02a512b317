//! System-call surface.
//!
//! The boundary between user programs and the kernel subsystems.
//! Everything user-triggerable is reported as a [`SyscallError`] that
//! maps to an errno exactly once, at this boundary; kernel bugs panic
//! instead of propagating.

pub mod memory;
pub mod process;

use core::fmt;

use crate::machine::LoadError;
use crate::memory::fault::FaultError;
use crate::memory::MemError;
use crate::process::ProcError;

pub const ENOENT: i32 = 2;
pub const ESRCH: i32 = 3;
pub const E2BIG: i32 = 7;
pub const ENOEXEC: i32 = 8;
pub const ECHILD: i32 = 10;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;

/// User-visible system-call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Exec path names no executable.
    NoSuchFile,
    /// PID outside the range any process can hold.
    NoSuchProcess,
    /// Exec arguments exceed `ARG_MAX`, or the path `PATH_MAX`.
    ArgListTooLong,
    /// The named file is not a loadable image.
    ExecFormat,
    /// Wait target unknown, reaped, or claimed by another waiter.
    NoChild,
    /// Process ceiling or PID space exhausted; fork may succeed later.
    TryAgain,
    /// No physical memory for the request.
    OutOfMemory,
    /// A pointer argument referenced unmapped memory.
    BadAddress,
    /// Malformed argument: misaligned sbrk delta, heap retreat below
    /// start, nonzero waitpid options, self-wait.
    InvalidArgument,
}

impl SyscallError {
    /// The errno a user program sees. Negated at the user boundary.
    pub fn errno(self) -> i32 {
        match self {
            SyscallError::NoSuchFile => ENOENT,
            SyscallError::NoSuchProcess => ESRCH,
            SyscallError::ArgListTooLong => E2BIG,
            SyscallError::ExecFormat => ENOEXEC,
            SyscallError::NoChild => ECHILD,
            SyscallError::TryAgain => EAGAIN,
            SyscallError::OutOfMemory => ENOMEM,
            SyscallError::BadAddress => EFAULT,
            SyscallError::InvalidArgument => EINVAL,
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.errno())
    }
}

impl From<MemError> for SyscallError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::OutOfMemory => SyscallError::OutOfMemory,
            MemError::InvalidRegion => SyscallError::InvalidArgument,
            MemError::BadAddress => SyscallError::BadAddress,
        }
    }
}

impl From<ProcError> for SyscallError {
    fn from(e: ProcError) -> Self {
        match e {
            ProcError::TooManyProcesses | ProcError::PidSpaceExhausted => {
                SyscallError::TryAgain
            }
            ProcError::NoSuchChild => SyscallError::NoChild,
        }
    }
}

impl From<LoadError> for SyscallError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::NotFound => SyscallError::NoSuchFile,
            LoadError::BadFormat => SyscallError::ExecFormat,
            LoadError::OutOfMemory => SyscallError::OutOfMemory,
        }
    }
}

impl From<FaultError> for SyscallError {
    fn from(e: FaultError) -> Self {
        match e {
            FaultError::OutOfMemory => SyscallError::OutOfMemory,
            FaultError::Protection | FaultError::MissingPage => SyscallError::BadAddress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(SyscallError::NoChild.errno(), ECHILD);
        assert_eq!(SyscallError::NoSuchProcess.errno(), ESRCH);
        assert_eq!(SyscallError::from(MemError::OutOfMemory).errno(), ENOMEM);
        assert_eq!(
            SyscallError::from(ProcError::TooManyProcesses).errno(),
            EAGAIN
        );
        assert_eq!(SyscallError::from(LoadError::NotFound).errno(), ENOENT);
    }
}
