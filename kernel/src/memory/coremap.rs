//! Coremap: the physical frame allocator.
//!
//! One entry per physical frame, indexed by frame number. The coremap
//! also owns the backing frame arena, so "physical memory" holds real
//! bytes: address-space copy, program loading, and user memory access
//! all read and write through it.
//!
//! Allocation is first-fit from the lowest frame, with no compaction
//! and no coalescing beyond natural adjacency. A multi-frame block is
//! delimited by a tail mark on its last frame; freeing walks from the
//! start frame through the tail.

use spin::Mutex;

use crate::config::PAGE_SIZE;

use super::MemError;

/// Bytes of coremap bookkeeping per frame, used to size the fixed
/// region the map itself would occupy in physical memory.
const ENTRY_BYTES: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Reserved for kernel bookkeeping; never allocatable.
    Fixed,
    Free,
    Allocated,
}

#[derive(Clone, Copy)]
struct Frame {
    state: FrameState,
    /// Last frame of a multi-frame allocation.
    block_tail: bool,
}

/// Physical frame table plus the frame arena it accounts for.
///
/// Two independent guards: `frames` protects allocation state (the
/// coremap's own lock in the concurrency model), `arena` protects frame
/// contents. Content access is never nested inside the state lock.
pub struct Coremap {
    frames: Mutex<Vec<Frame>>,
    arena: Mutex<Vec<u8>>,
    total_frames: usize,
}

impl Coremap {
    /// Build a coremap over `total_frames` frames of physical memory.
    ///
    /// Frame 0 and the frames the map's own bookkeeping would occupy
    /// are marked fixed. Keeping frame 0 unallocatable lets physical
    /// address 0 serve as the "no frame assigned" page-table sentinel.
    pub fn with_frames(total_frames: usize) -> Self {
        let bookkeeping =
            (total_frames as u64 * ENTRY_BYTES).div_ceil(PAGE_SIZE) as usize;
        let fixed = 1 + bookkeeping;
        assert!(
            fixed < total_frames,
            "coremap: {} frames cannot hold their own bookkeeping",
            total_frames
        );
        let mut frames = vec![
            Frame {
                state: FrameState::Free,
                block_tail: false,
            };
            total_frames
        ];
        for frame in frames.iter_mut().take(fixed) {
            frame.state = FrameState::Fixed;
        }
        log::debug!(
            "[VM] coremap: {} frames, {} fixed, {} bytes managed",
            total_frames,
            fixed,
            total_frames as u64 * PAGE_SIZE
        );
        Self {
            frames: Mutex::new(frames),
            arena: Mutex::new(vec![0; total_frames * PAGE_SIZE as usize]),
            total_frames,
        }
    }

    /// Allocate `npages` contiguous frames. Returns the physical
    /// address of the first, zero-filled. First-fit from the lowest
    /// frame index; failure is out-of-memory, never partial.
    pub fn alloc_pages(&self, npages: usize) -> Result<u64, MemError> {
        assert!(npages > 0, "coremap: zero-page allocation");
        let start = {
            let mut frames = self.frames.lock();
            let start = Self::find_run(&frames, npages).ok_or(MemError::OutOfMemory)?;
            for frame in &mut frames[start..start + npages] {
                frame.state = FrameState::Allocated;
                frame.block_tail = false;
            }
            frames[start + npages - 1].block_tail = true;
            start
        };
        // Zero outside the state lock; these frames are ours now.
        let base = start * PAGE_SIZE as usize;
        self.arena.lock()[base..base + npages * PAGE_SIZE as usize].fill(0);
        log::trace!("[VM] alloc {} pages at frame {}", npages, start);
        Ok(start as u64 * PAGE_SIZE)
    }

    fn find_run(frames: &[Frame], npages: usize) -> Option<usize> {
        let mut run = 0;
        for (idx, frame) in frames.iter().enumerate() {
            if frame.state == FrameState::Free {
                run += 1;
                if run == npages {
                    return Some(idx + 1 - npages);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Free the allocation starting at `paddr`, through its tail frame.
    ///
    /// `paddr` must be the address `alloc_pages` returned; freeing a
    /// fixed or free frame is a kernel bug and panics.
    pub fn free_pages(&self, paddr: u64) {
        assert_eq!(paddr % PAGE_SIZE, 0, "coremap: misaligned free {:#x}", paddr);
        let start = (paddr / PAGE_SIZE) as usize;
        let mut frames = self.frames.lock();
        assert!(start < frames.len(), "coremap: free past end {:#x}", paddr);
        let mut idx = start;
        loop {
            let frame = &mut frames[idx];
            assert!(
                frame.state == FrameState::Allocated,
                "coremap: free of non-allocated frame {} (from {:#x})",
                idx,
                paddr
            );
            frame.state = FrameState::Free;
            let tail = frame.block_tail;
            frame.block_tail = false;
            if tail {
                break;
            }
            idx += 1;
        }
        log::trace!("[VM] free frames {}..={}", start, idx);
    }

    /// Bytes in frames that are not free (fixed plus allocated).
    pub fn used_bytes(&self) -> u64 {
        let frames = self.frames.lock();
        let used = frames
            .iter()
            .filter(|f| f.state != FrameState::Free)
            .count();
        used as u64 * PAGE_SIZE
    }

    /// Frames currently free.
    pub fn free_frames(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.state == FrameState::Free)
            .count()
    }

    /// Total frames managed.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Read `buf.len()` bytes of frame contents starting at `paddr`.
    pub fn read_bytes(&self, paddr: u64, buf: &mut [u8]) {
        let base = paddr as usize;
        let arena = self.arena.lock();
        assert!(
            base + buf.len() <= arena.len(),
            "coremap: read past end of physical memory at {:#x}",
            paddr
        );
        buf.copy_from_slice(&arena[base..base + buf.len()]);
    }

    /// Write `bytes` into frame contents starting at `paddr`.
    pub fn write_bytes(&self, paddr: u64, bytes: &[u8]) {
        let base = paddr as usize;
        let mut arena = self.arena.lock();
        assert!(
            base + bytes.len() <= arena.len(),
            "coremap: write past end of physical memory at {:#x}",
            paddr
        );
        arena[base..base + bytes.len()].copy_from_slice(bytes);
    }

    /// Byte-exact copy of one whole frame to another.
    pub fn copy_frame(&self, src_paddr: u64, dst_paddr: u64) {
        let src = src_paddr as usize;
        let dst = dst_paddr as usize;
        let len = PAGE_SIZE as usize;
        let mut arena = self.arena.lock();
        assert!(src + len <= arena.len() && dst + len <= arena.len());
        arena.copy_within(src..src + len, dst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_round_trip_restores_free_count() {
        let cm = Coremap::with_frames(32);
        let before = cm.free_frames();
        let used_before = cm.used_bytes();
        let paddr = cm.alloc_pages(5).unwrap();
        assert_eq!(cm.used_bytes() - used_before, 5 * PAGE_SIZE);
        cm.free_pages(paddr);
        assert_eq!(cm.free_frames(), before);
        assert_eq!(cm.used_bytes(), used_before);
    }

    #[test]
    fn test_alloc_is_zero_filled() {
        let cm = Coremap::with_frames(32);
        let paddr = cm.alloc_pages(1).unwrap();
        cm.write_bytes(paddr, &[0xAA; 16]);
        cm.free_pages(paddr);
        // First-fit hands the same frame back; it must come back clean.
        let again = cm.alloc_pages(1).unwrap();
        assert_eq!(again, paddr);
        let mut buf = [0u8; 16];
        cm.read_bytes(again, &mut buf);
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_contiguous_alloc_skips_short_runs() {
        let cm = Coremap::with_frames(32);
        let a = cm.alloc_pages(1).unwrap();
        let b = cm.alloc_pages(1).unwrap();
        cm.free_pages(a);
        // The single free frame at `a` cannot satisfy a run of 2.
        let c = cm.alloc_pages(2).unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_exhaustion_fails_without_partial_state() {
        let cm = Coremap::with_frames(16);
        let free = cm.free_frames();
        assert_eq!(cm.alloc_pages(free + 1), Err(MemError::OutOfMemory));
        assert_eq!(cm.free_frames(), free);
        // Every remaining frame is still individually allocatable.
        let paddr = cm.alloc_pages(free).unwrap();
        assert_eq!(cm.free_frames(), 0);
        cm.free_pages(paddr);
        assert_eq!(cm.free_frames(), free);
    }

    #[test]
    #[should_panic(expected = "free of non-allocated frame")]
    fn test_double_free_panics() {
        let cm = Coremap::with_frames(16);
        let paddr = cm.alloc_pages(1).unwrap();
        cm.free_pages(paddr);
        cm.free_pages(paddr);
    }

    #[test]
    #[should_panic(expected = "free of non-allocated frame")]
    fn test_free_fixed_frame_panics() {
        let cm = Coremap::with_frames(16);
        cm.free_pages(0);
    }

    #[test]
    fn test_copy_frame_duplicates_contents() {
        let cm = Coremap::with_frames(32);
        let src = cm.alloc_pages(1).unwrap();
        let dst = cm.alloc_pages(1).unwrap();
        cm.write_bytes(src, b"coremap copy check");
        cm.copy_frame(src, dst);
        let mut buf = [0u8; 18];
        cm.read_bytes(dst, &mut buf);
        assert_eq!(&buf, b"coremap copy check");
    }
}
