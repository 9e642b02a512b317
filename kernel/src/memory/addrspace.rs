//! Per-process address spaces.
//!
//! An address space is the virtual memory map of one process: a list of
//! static segments (code, data), a single growable heap above them, and
//! a fixed-size stack under the top of user space. Pages live in one
//! VPN-keyed table shared by all three region kinds; a page entry with
//! physical address 0 is defined but not yet resident, and gets its
//! frame on first touch.
//!
//! Nothing here touches the TLB. Activation and the fault path own the
//! translation cache; this module owns the layout and the frames.

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::config::{PAGE_SIZE, USERSPACE_TOP, USER_STACK_BASE, USER_STACK_PAGES};

use super::coremap::Coremap;
use super::{offset_in_page, page_align_down, page_align_up, vpn_of, MemError};

bitflags! {
    /// Access permissions of a region and its pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl RegionPerms {
    pub const RW: RegionPerms = RegionPerms::READ.union(RegionPerms::WRITE);
}

/// A contiguous virtual region with uniform permissions.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Page-aligned start address.
    pub base: u64,
    /// Length in whole pages.
    pub pages: u64,
    pub perms: RegionPerms,
}

impl Segment {
    fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.base && vaddr < self.base + self.pages * PAGE_SIZE
    }
}

/// One page of the address space.
#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    /// Backing frame; 0 until first touch.
    pub paddr: u64,
    pub perms: RegionPerms,
}

impl PageEntry {
    pub fn resident(&self) -> bool {
        self.paddr != 0
    }
}

/// Which kind of region an address resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Stack,
    Heap,
    Segment,
}

/// The virtual memory map of one process.
pub struct AddressSpace {
    segments: Vec<Segment>,
    pages: HashMap<u64, PageEntry>,
    heap_start: u64,
    heap_end: u64,
    stack_defined: bool,
}

impl AddressSpace {
    /// An empty space: no segments, zero heap bounds, no stack.
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            pages: HashMap::new(),
            heap_start: 0,
            heap_end: 0,
            stack_defined: false,
        }
    }

    /// Record a segment descriptor. The base is rounded down and the
    /// length up to page boundaries; no physical memory is allocated.
    /// A null base or zero length is rejected.
    pub fn define_region(
        &mut self,
        vaddr: u64,
        size: u64,
        perms: RegionPerms,
    ) -> Result<(), MemError> {
        if vaddr == 0 || size == 0 {
            return Err(MemError::InvalidRegion);
        }
        let base = page_align_down(vaddr);
        let end = page_align_up(vaddr + size);
        self.segments.push(Segment {
            base,
            pages: (end - base) / PAGE_SIZE,
            perms,
        });
        log::debug!(
            "[VM] region {:#x}..{:#x} perms {:?}",
            base,
            end,
            perms
        );
        Ok(())
    }

    /// Create the page entries for every defined segment, frames
    /// unassigned, and park the heap immediately above the highest
    /// segment. Called once all regions are defined and before any
    /// of them is touched.
    pub fn prepare_load(&mut self) {
        let mut highest = 0;
        for seg in &self.segments {
            for i in 0..seg.pages {
                let vpn = vpn_of(seg.base) + i;
                self.pages.entry(vpn).or_insert(PageEntry {
                    paddr: 0,
                    perms: seg.perms,
                });
            }
            highest = highest.max(seg.base + seg.pages * PAGE_SIZE);
        }
        self.heap_start = page_align_up(highest);
        self.heap_end = self.heap_start;
    }

    /// Create the page entries for the fixed stack region and return
    /// the initial stack pointer. Frames are populated on fault, but
    /// the entries exist up front so a stack access always resolves to
    /// a known page.
    pub fn define_stack(&mut self) -> u64 {
        for i in 0..USER_STACK_PAGES {
            let vpn = vpn_of(USER_STACK_BASE) + i;
            self.pages.insert(
                vpn,
                PageEntry {
                    paddr: 0,
                    perms: RegionPerms::RW,
                },
            );
        }
        self.stack_defined = true;
        USERSPACE_TOP
    }

    /// Deep-duplicate for fork. Resident pages get a fresh frame and a
    /// byte-exact copy; unassigned entries stay unassigned, deferring
    /// their cost to first touch in the child. On allocation failure
    /// every frame the copy has taken so far is returned before the
    /// error propagates.
    pub fn copy(&self, coremap: &Coremap) -> Result<AddressSpace, MemError> {
        let mut new = AddressSpace {
            segments: self.segments.clone(),
            pages: HashMap::with_capacity(self.pages.len()),
            heap_start: self.heap_start,
            heap_end: self.heap_end,
            stack_defined: self.stack_defined,
        };
        for (&vpn, entry) in &self.pages {
            let mut copied = *entry;
            if entry.resident() {
                match coremap.alloc_pages(1) {
                    Ok(paddr) => {
                        coremap.copy_frame(entry.paddr, paddr);
                        copied.paddr = paddr;
                    }
                    Err(e) => {
                        new.release_frames(coremap);
                        return Err(e);
                    }
                }
            }
            new.pages.insert(vpn, copied);
        }
        Ok(new)
    }

    /// Return every resident frame to the allocator. The space is
    /// unusable afterwards; callers drop it.
    pub fn destroy(mut self, coremap: &Coremap) {
        self.release_frames(coremap);
    }

    fn release_frames(&mut self, coremap: &Coremap) {
        for entry in self.pages.values_mut() {
            if entry.resident() {
                coremap.free_pages(entry.paddr);
                entry.paddr = 0;
            }
        }
    }

    /// Resolve the region containing `vaddr`. Stack wins over heap
    /// wins over segments; the first matching segment wins among
    /// overlaps.
    pub fn resolve(&self, vaddr: u64) -> Option<(RegionKind, RegionPerms)> {
        if self.stack_defined && (USER_STACK_BASE..USERSPACE_TOP).contains(&vaddr) {
            return Some((RegionKind::Stack, RegionPerms::RW));
        }
        if self.heap_start < self.heap_end
            && (self.heap_start..self.heap_end).contains(&vaddr)
        {
            return Some((RegionKind::Heap, RegionPerms::RW));
        }
        self.segments
            .iter()
            .find(|s| s.contains(vaddr))
            .map(|s| (RegionKind::Segment, s.perms))
    }

    pub fn page(&self, vpn: u64) -> Option<&PageEntry> {
        self.pages.get(&vpn)
    }

    pub fn page_mut(&mut self, vpn: u64) -> Option<&mut PageEntry> {
        self.pages.get_mut(&vpn)
    }

    /// Add a page entry (heap growth). Replacing an existing entry
    /// would leak its frame, so that is a bug.
    pub fn insert_page(&mut self, vpn: u64, entry: PageEntry) {
        let prev = self.pages.insert(vpn, entry);
        assert!(prev.is_none(), "address space: page {:#x} defined twice", vpn);
    }

    /// Drop a page entry (heap shrink), returning it so the caller can
    /// free the frame and shoot down the translation.
    pub fn remove_page(&mut self, vpn: u64) -> Option<PageEntry> {
        self.pages.remove(&vpn)
    }

    pub fn heap_start(&self) -> u64 {
        self.heap_start
    }

    pub fn heap_end(&self) -> u64 {
        self.heap_end
    }

    pub fn set_heap_end(&mut self, end: u64) {
        self.heap_end = end;
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Count of pages with an assigned frame. Diagnostic.
    pub fn resident_pages(&self) -> usize {
        self.pages.values().filter(|e| e.resident()).count()
    }

    /// Kernel-side write into user memory, walking the page table
    /// directly (no TLB) and populating frames on first touch. Used by
    /// the loader and the exec argv builder, which run before the
    /// space is active.
    pub fn write_bytes(
        &mut self,
        coremap: &Coremap,
        vaddr: u64,
        bytes: &[u8],
    ) -> Result<(), MemError> {
        self.walk(coremap, vaddr, bytes.len(), |coremap, paddr, range| {
            coremap.write_bytes(paddr, &bytes[range]);
        })
    }

    /// Kernel-side read from user memory; same walk as `write_bytes`.
    pub fn read_bytes(
        &mut self,
        coremap: &Coremap,
        vaddr: u64,
        buf: &mut [u8],
    ) -> Result<(), MemError> {
        self.walk(coremap, vaddr, buf.len(), |coremap, paddr, range| {
            coremap.read_bytes(paddr, &mut buf[range]);
        })
    }

    /// Page-by-page walk over `[vaddr, vaddr + len)`, demand-populating
    /// each page and handing `op` the frame address plus the byte range
    /// of the transfer it covers.
    fn walk(
        &mut self,
        coremap: &Coremap,
        vaddr: u64,
        len: usize,
        mut op: impl FnMut(&Coremap, u64, core::ops::Range<usize>),
    ) -> Result<(), MemError> {
        let mut done = 0usize;
        while done < len {
            let addr = vaddr + done as u64;
            let offset = offset_in_page(addr);
            let chunk = ((PAGE_SIZE - offset) as usize).min(len - done);
            let paddr = self.populate(coremap, vpn_of(addr))?;
            op(coremap, paddr + offset, done..done + chunk);
            done += chunk;
        }
        Ok(())
    }

    /// Frame address of `vpn`, allocating on first touch.
    pub fn populate(&mut self, coremap: &Coremap, vpn: u64) -> Result<u64, MemError> {
        let entry = self.pages.get_mut(&vpn).ok_or(MemError::BadAddress)?;
        if !entry.resident() {
            entry.paddr = coremap.alloc_pages(1)?;
        }
        Ok(entry.paddr)
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with_code() -> AddressSpace {
        let mut aspace = AddressSpace::new();
        aspace
            .define_region(0x40_0000, 2 * PAGE_SIZE, RegionPerms::READ | RegionPerms::EXEC)
            .unwrap();
        aspace
            .define_region(0x40_0000 + 2 * PAGE_SIZE, 100, RegionPerms::RW)
            .unwrap();
        aspace.prepare_load();
        aspace
    }

    #[test]
    fn test_define_region_rejects_null_and_empty() {
        let mut aspace = AddressSpace::new();
        assert_eq!(
            aspace.define_region(0, PAGE_SIZE, RegionPerms::READ),
            Err(MemError::InvalidRegion)
        );
        assert_eq!(
            aspace.define_region(0x1000, 0, RegionPerms::READ),
            Err(MemError::InvalidRegion)
        );
    }

    #[test]
    fn test_define_region_page_aligns() {
        let mut aspace = AddressSpace::new();
        aspace
            .define_region(0x40_0123, 100, RegionPerms::READ)
            .unwrap();
        let seg = &aspace.segments()[0];
        assert_eq!(seg.base, 0x40_0000);
        assert_eq!(seg.pages, 1);
    }

    #[test]
    fn test_prepare_load_places_heap_after_last_segment() {
        let aspace = space_with_code();
        assert_eq!(aspace.heap_start(), 0x40_0000 + 3 * PAGE_SIZE);
        assert_eq!(aspace.heap_end(), aspace.heap_start());
        // Entries exist but nothing is resident yet.
        assert!(aspace.page(vpn_of(0x40_0000)).is_some());
        assert_eq!(aspace.resident_pages(), 0);
    }

    #[test]
    fn test_define_stack_returns_top_and_creates_entries() {
        let mut aspace = space_with_code();
        assert_eq!(aspace.define_stack(), USERSPACE_TOP);
        assert!(aspace.page(vpn_of(USER_STACK_BASE)).is_some());
        assert!(aspace.page(vpn_of(USERSPACE_TOP - 1)).is_some());
        assert_eq!(
            aspace.resolve(USERSPACE_TOP - 8),
            Some((RegionKind::Stack, RegionPerms::RW))
        );
    }

    #[test]
    fn test_resolve_order_and_misses() {
        let mut aspace = space_with_code();
        aspace.define_stack();
        assert_eq!(
            aspace.resolve(0x40_0000).unwrap().0,
            RegionKind::Segment
        );
        // Heap is empty, so an address at heap_start is unmapped.
        assert!(aspace.resolve(aspace.heap_start()).is_none());
        assert!(aspace.resolve(0x7000_0000).is_none());
    }

    #[test]
    fn test_copy_duplicates_resident_frames_without_aliasing() {
        let cm = Coremap::with_frames(64);
        let mut src = space_with_code();
        src.write_bytes(&cm, 0x40_0000, b"original bytes").unwrap();

        let mut dst = src.copy(&cm).unwrap();
        assert_eq!(dst.resident_pages(), src.resident_pages());

        let src_frame = src.page(vpn_of(0x40_0000)).unwrap().paddr;
        let dst_frame = dst.page(vpn_of(0x40_0000)).unwrap().paddr;
        assert_ne!(src_frame, dst_frame);

        let mut buf = [0u8; 14];
        dst.read_bytes(&cm, 0x40_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"original bytes");

        // Mutating the source afterwards must not show through.
        src.write_bytes(&cm, 0x40_0000, b"mutated!").unwrap();
        dst.read_bytes(&cm, 0x40_0000, &mut buf).unwrap();
        assert_eq!(&buf, b"original bytes");

        src.destroy(&cm);
        dst.destroy(&cm);
    }

    #[test]
    fn test_copy_leaves_lazy_pages_lazy() {
        let cm = Coremap::with_frames(64);
        let mut src = space_with_code();
        src.write_bytes(&cm, 0x40_0000, &[1]).unwrap();
        let dst = src.copy(&cm).unwrap();
        // Only the touched page was duplicated.
        assert_eq!(dst.resident_pages(), 1);
        assert!(!dst.page(vpn_of(0x40_0000) + 1).unwrap().resident());
        src.destroy(&cm);
        dst.destroy(&cm);
    }

    #[test]
    fn test_copy_unwinds_on_allocation_failure() {
        let cm = Coremap::with_frames(16);
        let mut src = AddressSpace::new();
        src.define_region(0x40_0000, 8 * PAGE_SIZE, RegionPerms::RW)
            .unwrap();
        src.prepare_load();
        // Make every page resident, then eat the remaining frames so
        // the copy must fail partway through.
        for i in 0..8 {
            src.write_bytes(&cm, 0x40_0000 + i * PAGE_SIZE, &[i as u8])
                .unwrap();
        }
        let mut hoard = Vec::new();
        while cm.free_frames() > 4 {
            hoard.push(cm.alloc_pages(1).unwrap());
        }
        let free_before = cm.free_frames();
        assert!(matches!(src.copy(&cm), Err(MemError::OutOfMemory)));
        assert_eq!(cm.free_frames(), free_before);
        for paddr in hoard {
            cm.free_pages(paddr);
        }
        src.destroy(&cm);
    }

    #[test]
    fn test_destroy_returns_every_frame() {
        let cm = Coremap::with_frames(64);
        let free_before = cm.free_frames();
        let mut aspace = space_with_code();
        aspace.define_stack();
        aspace.write_bytes(&cm, 0x40_0000, &[1; 32]).unwrap();
        aspace
            .write_bytes(&cm, USERSPACE_TOP - 64, &[2; 64])
            .unwrap();
        assert!(cm.free_frames() < free_before);
        aspace.destroy(&cm);
        assert_eq!(cm.free_frames(), free_before);
    }

    #[test]
    fn test_kernel_write_crossing_page_boundary() {
        let cm = Coremap::with_frames(64);
        let mut aspace = space_with_code();
        let at = 0x40_0000 + PAGE_SIZE - 3;
        aspace.write_bytes(&cm, at, b"straddle").unwrap();
        let mut buf = [0u8; 8];
        aspace.read_bytes(&cm, at, &mut buf).unwrap();
        assert_eq!(&buf, b"straddle");
        aspace.destroy(&cm);
    }

    #[test]
    fn test_kernel_access_outside_pages_is_bad_address() {
        let cm = Coremap::with_frames(64);
        let mut aspace = space_with_code();
        assert_eq!(
            aspace.write_bytes(&cm, 0x7000_0000, &[0]),
            Err(MemError::BadAddress)
        );
        aspace.destroy(&cm);
    }
}
