//! Translation cache model.
//!
//! A fixed array of virtual-to-physical translations with random
//! eviction, standing in for the hardware TLB. Entries carry the owning
//! PID so concurrently running processes never consume each other's
//! translations; address-space switches still invalidate wholesale, the
//! way the hardware model does.

use spin::Mutex;

use crate::config::{PAGE_SIZE, TLB_SLOTS};
use crate::process::Pid;
use crate::rand::Rand;

use super::vpn_of;

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    pid: Pid,
    vpn: u64,
    paddr: u64,
    writable: bool,
}

/// A successful translation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the page's first byte.
    pub paddr: u64,
    pub writable: bool,
}

/// Fixed-size translation cache.
pub struct Tlb {
    slots: Mutex<[Option<TlbEntry>; TLB_SLOTS]>,
}

impl Tlb {
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new([None; TLB_SLOTS]),
        }
    }

    /// Look up the translation covering `vaddr` for `pid`.
    pub fn probe(&self, pid: Pid, vaddr: u64) -> Option<Translation> {
        let vpn = vpn_of(vaddr);
        let slots = self.slots.lock();
        slots.iter().flatten().find_map(|e| {
            (e.pid == pid && e.vpn == vpn).then_some(Translation {
                paddr: e.paddr,
                writable: e.writable,
            })
        })
    }

    /// Install a translation. Fills an empty slot if one exists,
    /// otherwise evicts a random victim.
    pub fn insert(&self, rand: &Rand, pid: Pid, vpn: u64, paddr: u64, writable: bool) {
        assert_eq!(paddr % PAGE_SIZE, 0, "tlb: unaligned frame {:#x}", paddr);
        let entry = TlbEntry {
            pid,
            vpn,
            paddr,
            writable,
        };
        let mut slots = self.slots.lock();
        // Re-installing over a stale entry for the same page keeps the
        // cache free of duplicates.
        if let Some(slot) = slots
            .iter_mut()
            .find(|s| matches!(s, Some(e) if e.pid == pid && e.vpn == vpn))
        {
            *slot = Some(entry);
            return;
        }
        if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(entry);
            return;
        }
        let victim = rand.below(TLB_SLOTS as u64) as usize;
        log::trace!("[TLB] evicting slot {} for pid {} vpn {:#x}", victim, pid, vpn);
        slots[victim] = Some(entry);
    }

    /// Drop the translation for one page, if cached. Used by sbrk
    /// shrink so a freed heap page cannot be reached through a stale
    /// mapping.
    pub fn invalidate(&self, pid: Pid, vpn: u64) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if e.pid == pid && e.vpn == vpn) {
                *slot = None;
            }
        }
    }

    /// Drop every translation owned by `pid`. Used at process
    /// destruction and exec.
    pub fn flush_pid(&self, pid: Pid) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if matches!(slot, Some(e) if e.pid == pid) {
                *slot = None;
            }
        }
    }

    /// Invalidate the entire cache. Address-space activation and
    /// deactivation both land here.
    pub fn flush_all(&self) {
        *self.slots.lock() = [None; TLB_SLOTS];
    }

    /// Number of valid entries. Snapshot, for tests.
    pub fn valid_entries(&self) -> usize {
        self.slots.lock().iter().flatten().count()
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}
