//! Page-fault handling.
//!
//! The handler ties the address space, the coremap, and the TLB
//! together: it decides whether a faulting access is legal, assigns a
//! frame on first touch, and installs the translation. Everything it
//! rejects is reported as an error; turning that into process
//! termination is the user-mode bridge's job, and the kernel itself
//! never dies on a user fault.

use crate::config::PAGE_SIZE;
use crate::process::Pid;
use crate::rand::Rand;

use super::addrspace::{AddressSpace, RegionPerms};
use super::coremap::Coremap;
use super::tlb::Tlb;
use super::{vpn_of, MemError};

/// What kind of access faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Write against a translation already known read-only.
    ReadOnly,
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// Access the process had no right to make: a read-only violation,
    /// a near-null dereference, or an address outside every region.
    Protection,
    /// The region is valid but no page entry covers the address. A
    /// defect state; surfaced, never ignored.
    MissingPage,
    /// First-touch allocation failed.
    OutOfMemory,
}

impl From<MemError> for FaultError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::OutOfMemory => FaultError::OutOfMemory,
            MemError::InvalidRegion | MemError::BadAddress => FaultError::Protection,
        }
    }
}

/// Resolve one fault for `pid` at `vaddr`. On success the TLB holds a
/// translation for the containing page.
pub fn handle(
    aspace: &mut AddressSpace,
    coremap: &Coremap,
    tlb: &Tlb,
    rand: &Rand,
    pid: Pid,
    kind: FaultKind,
    vaddr: u64,
) -> Result<(), FaultError> {
    // A write through a read-only translation is hopeless no matter
    // where the address lives.
    if kind == FaultKind::ReadOnly {
        log::debug!("[VM] pid {} read-only violation at {:#x}", pid, vaddr);
        return Err(FaultError::Protection);
    }

    // The first page stays unmapped so null dereferences fault.
    if vaddr < PAGE_SIZE {
        log::debug!("[VM] pid {} near-null access at {:#x}", pid, vaddr);
        return Err(FaultError::Protection);
    }

    let (_, perms) = aspace.resolve(vaddr).ok_or_else(|| {
        log::debug!("[VM] pid {} access outside regions at {:#x}", pid, vaddr);
        FaultError::Protection
    })?;
    if kind == FaultKind::Write && !perms.contains(RegionPerms::WRITE) {
        log::debug!("[VM] pid {} write to read-only region at {:#x}", pid, vaddr);
        return Err(FaultError::Protection);
    }

    let vpn = vpn_of(vaddr);
    if aspace.page(vpn).is_none() {
        // resolve() said the region exists, so the entry should too.
        log::warn!(
            "[VM] pid {} no page entry inside valid region at {:#x}",
            pid,
            vaddr
        );
        return Err(FaultError::MissingPage);
    }
    let paddr = aspace.populate(coremap, vpn).map_err(FaultError::from)?;

    let writable = aspace
        .page(vpn)
        .map(|e| e.perms.contains(RegionPerms::WRITE))
        .unwrap_or(false);
    tlb.insert(rand, pid, vpn, paddr, writable);
    Ok(())
}
