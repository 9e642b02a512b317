//! Memory scenarios: sbrk contract, demand paging, TLB behavior.

use crate::config::{PAGE_SIZE, SIGSEGV, TLB_SLOTS};
use crate::process::{encode_exit, encode_signal};
use crate::syscall::SyscallError;

use super::harness::{test_kernel, TestImage};

const PC_MAIN: u64 = 0x1000;

// ------------------------------------------------------------------
// Coremap, end to end
// ------------------------------------------------------------------

#[test]
fn test_coremap_five_frame_scenario() {
    let (kernel, _loader, _user_mode) = test_kernel(201, 256);
    let before = kernel.coremap.used_bytes();
    let paddr = kernel.coremap.alloc_pages(5).unwrap();
    assert_eq!(kernel.coremap.used_bytes() - before, 5 * PAGE_SIZE);
    kernel.coremap.free_pages(paddr);
    assert_eq!(kernel.coremap.used_bytes(), before);
}

// ------------------------------------------------------------------
// sbrk
// ------------------------------------------------------------------

#[test]
fn test_sbrk_contract() {
    let (kernel, loader, user_mode) = test_kernel(202, 256);
    loader.install("brk", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let start = ctx.sbrk(0).unwrap();
        // Zero delta is a pure query.
        assert_eq!(ctx.sbrk(0).unwrap(), start);
        // Growth returns the old break.
        assert_eq!(ctx.sbrk(4096).unwrap(), start);
        assert_eq!(ctx.sbrk(0).unwrap(), start + 4096);
        // The new page is writable and zeroed.
        assert_eq!(ctx.read_word(start).unwrap(), 0);
        ctx.write_word(start, 0xfeed_f00d).unwrap();
        // Misaligned deltas are rejected, not rounded.
        assert_eq!(ctx.sbrk(3).unwrap_err(), SyscallError::InvalidArgument);
        assert_eq!(ctx.sbrk(-2).unwrap_err(), SyscallError::InvalidArgument);
        // Retreat below the heap start is rejected.
        assert_eq!(ctx.sbrk(-8192).unwrap_err(), SyscallError::InvalidArgument);
        // Failed calls left the break alone.
        assert_eq!(ctx.sbrk(0).unwrap(), start + 4096);
        // Shrink back to empty.
        assert_eq!(ctx.sbrk(-4096).unwrap(), start + 4096);
        assert_eq!(ctx.sbrk(0).unwrap(), start);
        ctx.exit(0);
    });
    let pid = kernel.launch("brk", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_exit(0));
}

#[test]
fn test_sbrk_refuses_stack_collision() {
    let (kernel, loader, user_mode) = test_kernel(203, 256);
    loader.install("greedy", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let start = ctx.sbrk(0).unwrap();
        // Far more than the space between heap and stack.
        let err = ctx.sbrk(0x7000_0000).unwrap_err();
        let unchanged = ctx.sbrk(0).unwrap() == start;
        ctx.exit(if err == SyscallError::OutOfMemory && unchanged { 0 } else { 1 });
    });
    let pid = kernel.launch("greedy", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_exit(0));
}

#[test]
fn test_sbrk_shrink_frees_frames_and_translations() {
    let (kernel, loader, user_mode) = test_kernel(204, 256);
    loader.install("shrinker", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let free_before = ctx.kernel().coremap.free_frames();
        let start = ctx.sbrk(4 * 4096).unwrap();
        for page in 0..4 {
            ctx.write_word(start + page * 4096, page as u32 + 1).unwrap();
        }
        ctx.sbrk(-(4 * 4096)).unwrap();
        let ok = ctx.kernel().coremap.free_frames() == free_before;
        ctx.exit(if ok { 0 } else { 1 });
    });
    let pid = kernel.launch("shrinker", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_exit(0));
}

#[test]
fn test_freed_heap_page_is_dead_even_if_translation_was_cached() {
    let (kernel, loader, user_mode) = test_kernel(205, 256);
    loader.install("stale", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let start = ctx.sbrk(4096).unwrap();
        // Touch it so the TLB holds a translation.
        ctx.write_word(start, 1).unwrap();
        ctx.sbrk(-4096).unwrap();
        // The shootdown makes the next touch a hard fault.
        assert!(ctx.read_word(start).is_err());
        assert!(ctx.is_dead());
    });
    let pid = kernel.launch("stale", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_signal(SIGSEGV));
}

// ------------------------------------------------------------------
// Demand paging and the TLB
// ------------------------------------------------------------------

#[test]
fn test_stack_pages_populate_on_first_touch() {
    let (kernel, loader, user_mode) = test_kernel(206, 256);
    loader.install("stacker", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let sp = ctx.tf.sp;
        let resident_before = {
            let guard = ctx.proc().aspace.lock();
            guard.as_ref().unwrap().resident_pages()
        };
        // Touch a stack page nobody has written yet.
        ctx.write_word(sp - 8 * 4096, 42).unwrap();
        let resident_after = {
            let guard = ctx.proc().aspace.lock();
            guard.as_ref().unwrap().resident_pages()
        };
        let ok = resident_after == resident_before + 1
            && ctx.read_word(sp - 8 * 4096).unwrap() == 42;
        ctx.exit(if ok { 0 } else { 1 });
    });
    let pid = kernel.launch("stacker", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_exit(0));
}

#[test]
fn test_tlb_refill_after_eviction_pressure() {
    let (kernel, loader, user_mode) = test_kernel(207, 512);
    loader.install("thrash", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let pages = TLB_SLOTS as u64 + 8;
        let start = ctx.sbrk((pages * 4096) as i64).unwrap();
        for page in 0..pages {
            ctx.write_word(start + page * 4096, page as u32).unwrap();
        }
        // Every translation for the early pages has been evicted by
        // now; the refill path must still resolve them.
        let mut ok = true;
        for page in 0..pages {
            ok &= ctx.read_word(start + page * 4096).unwrap() == page as u32;
        }
        ctx.exit(if ok { 0 } else { 1 });
    });
    let pid = kernel.launch("thrash", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_exit(0));
}

#[test]
fn test_write_to_read_only_segment_is_fatal() {
    let (kernel, loader, user_mode) = test_kernel(208, 256);
    loader.install("scribbler", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        // Reading code is fine; writing it is not.
        assert!(ctx.read_word(0x40_0000).is_ok());
        assert!(ctx.write_word(0x40_0000, 0).is_err());
        assert!(ctx.is_dead());
    });
    let pid = kernel.launch("scribbler", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_signal(SIGSEGV));
}

#[test]
fn test_near_null_access_is_fatal() {
    let (kernel, loader, user_mode) = test_kernel(209, 256);
    loader.install("nullref", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        assert!(ctx.read_word(0x10).is_err());
    });
    let pid = kernel.launch("nullref", &[]).unwrap();
    assert_eq!(kernel.wait_for(pid).unwrap().0, encode_signal(SIGSEGV));
}

#[test]
fn test_process_destruction_returns_all_frames() {
    let (kernel, loader, user_mode) = test_kernel(210, 256);
    loader.install("tenant", TestImage::trivial(PC_MAIN));
    user_mode.install(PC_MAIN, |ctx| {
        let start = ctx.sbrk(8 * 4096).unwrap();
        for page in 0..8 {
            ctx.write_word(start + page * 4096, 1).unwrap();
        }
        ctx.exit(0);
    });
    let used_before = kernel.coremap.used_bytes();
    let pid = kernel.launch("tenant", &[]).unwrap();
    kernel.wait_for(pid).unwrap();
    assert_eq!(kernel.coremap.used_bytes(), used_before);
    assert_eq!(kernel.tlb.valid_entries(), 0);
}
