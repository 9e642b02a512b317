//! Memory system calls: sbrk.

use std::sync::Arc;

use crate::config::{PAGE_SIZE, USER_STACK_BASE, WORD_SIZE};
use crate::memory::addrspace::{PageEntry, RegionPerms};
use crate::memory::page_align_up;
use crate::process::Process;
use crate::Kernel;

use super::SyscallError;

/// Adjust the heap end by `delta` bytes and return the previous end.
///
/// The delta must be word-aligned; a misaligned value is rejected, not
/// rounded. Growth stops short of the stack region and backs every new
/// page with an eagerly allocated zero-filled frame; shrink frees the
/// trailing pages and shoots their translations down. A zero delta is
/// a pure query.
pub fn sys_sbrk(
    kernel: &Arc<Kernel>,
    caller: &Arc<Process>,
    delta: i64,
) -> Result<u64, SyscallError> {
    if delta % WORD_SIZE as i64 != 0 {
        return Err(SyscallError::InvalidArgument);
    }

    let mut guard = caller.aspace.lock();
    let aspace = guard.as_mut().ok_or(SyscallError::InvalidArgument)?;
    let old_end = aspace.heap_end();
    if delta == 0 {
        return Ok(old_end);
    }

    if delta > 0 {
        let new_end = old_end
            .checked_add(delta as u64)
            .ok_or(SyscallError::OutOfMemory)?;
        if new_end > USER_STACK_BASE {
            return Err(SyscallError::OutOfMemory);
        }
        let first_new = page_align_up(old_end) / PAGE_SIZE;
        let end_vpn = page_align_up(new_end) / PAGE_SIZE;
        let mut added = Vec::new();
        for vpn in first_new..end_vpn {
            match kernel.coremap.alloc_pages(1) {
                Ok(paddr) => {
                    aspace.insert_page(
                        vpn,
                        PageEntry {
                            paddr,
                            perms: RegionPerms::RW,
                        },
                    );
                    added.push(vpn);
                }
                Err(_) => {
                    // Unwind this call's pages; the heap is unchanged.
                    for vpn in added {
                        let entry = aspace.remove_page(vpn).unwrap();
                        kernel.coremap.free_pages(entry.paddr);
                    }
                    return Err(SyscallError::OutOfMemory);
                }
            }
        }
        aspace.set_heap_end(new_end);
        Ok(old_end)
    } else {
        let shrink = delta.unsigned_abs();
        if shrink > old_end - aspace.heap_start() {
            return Err(SyscallError::InvalidArgument);
        }
        let new_end = old_end - shrink;
        let keep_vpn = page_align_up(new_end) / PAGE_SIZE;
        let cur_vpn = page_align_up(old_end) / PAGE_SIZE;
        for vpn in keep_vpn..cur_vpn {
            if let Some(entry) = aspace.remove_page(vpn) {
                if entry.resident() {
                    kernel.coremap.free_pages(entry.paddr);
                }
                kernel.tlb.invalidate(caller.pid, vpn);
            }
        }
        aspace.set_heap_end(new_end);
        Ok(old_end)
    }
}
