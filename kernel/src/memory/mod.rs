//! Memory management subsystem.
//!
//! This module provides physical and virtual memory management.
//!
//! # Components
//!
//! - **Coremap**: physical frame allocator over an owned frame arena
//! - **AddressSpace**: per-process segments, page table, heap bounds
//! - **Tlb**: fixed-size translation cache with random eviction
//! - **fault**: the page-fault handler tying the three together

pub mod addrspace;
pub mod coremap;
pub mod fault;
pub mod tlb;

use core::fmt;

use crate::config::PAGE_SIZE;

/// Memory subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No run of free frames large enough, or no free frame at all.
    OutOfMemory,
    /// A defined region had a null base or zero length.
    InvalidRegion,
    /// A kernel-side access touched an address no page entry covers.
    BadAddress,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::OutOfMemory => write!(f, "out of physical memory"),
            MemError::InvalidRegion => write!(f, "invalid memory region"),
            MemError::BadAddress => write!(f, "address outside any mapped page"),
        }
    }
}

/// Round an address down to its page boundary.
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round an address up to the next page boundary.
pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Virtual page number of the page containing `addr`.
pub const fn vpn_of(addr: u64) -> u64 {
    addr / PAGE_SIZE
}

/// Byte offset of `addr` within its page.
pub const fn offset_in_page(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_math() {
        assert_eq!(page_align_down(0x1234), 0x1000);
        assert_eq!(page_align_down(0x1000), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x1000), 0x1000);
        assert_eq!(vpn_of(0x2fff), 2);
        assert_eq!(offset_in_page(0x2fff), 0xfff);
    }
}
