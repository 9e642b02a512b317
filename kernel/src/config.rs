//! Kernel configuration constants.
//!
//! This module contains compile-time configuration for the kernel.
//! Values here affect the user address-space layout, process limits, and
//! the sizes of fixed kernel structures. User space follows the classic
//! 32-bit split: the low 2 GiB belong to the process and the stack grows
//! down from its top.

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// First address above user space. The user stack ends here.
pub const USERSPACE_TOP: u64 = 0x8000_0000;

/// Number of pages in the fixed-size user stack region.
pub const USER_STACK_PAGES: u64 = 16;

/// Lowest address of the user stack region.
pub const USER_STACK_BASE: u64 = USERSPACE_TOP - USER_STACK_PAGES * PAGE_SIZE;

/// User ABI word size in bytes. Stack strings are padded to word
/// boundaries and argv pointers occupy one word each.
pub const WORD_SIZE: u64 = 4;

/// Smallest PID handed to a user process. 0 is invalid, 1 is the kernel
/// process.
pub const PID_MIN: i32 = 2;

/// Largest PID handed to a user process.
pub const PID_MAX: i32 = 32767;

/// Ceiling on concurrently live user processes. Fork is refused once the
/// table holds this many.
pub const MAX_PROCESSES: usize = 64;

/// How many random draws PID assignment makes before reporting the PID
/// space exhausted.
pub const PID_DRAW_ATTEMPTS: usize = 128;

/// Number of slots in the translation cache.
pub const TLB_SLOTS: usize = 64;

/// Reads admitted after a writer starts waiting on a reader/writer lock
/// before further readers queue behind it.
pub const RW_READER_QUOTA: usize = 8;

/// Upper bound on the total size of an exec argument block in bytes,
/// counting each string's NUL terminator and word padding.
pub const ARG_MAX: usize = 65536;

/// Upper bound on the length of an executable path.
pub const PATH_MAX: usize = 1024;

/// Upper bound on open file handles per process.
pub const MAX_FILES: usize = 128;

/// Signal number recorded when a process dies on a misaligned access.
pub const SIGBUS: i32 = 10;

/// Signal number recorded when a process dies on a protection violation
/// or an access outside every region.
pub const SIGSEGV: i32 = 11;
